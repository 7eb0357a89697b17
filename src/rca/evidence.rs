//! The per-hypothesis evidence methods.
//!
//! Each method reads the incident's immutable baseline/current row sets and
//! yields an [`Evidence`]: a score in [0, 1] when it can speak, `None` with
//! a flag when it cannot. Insufficient data is never an error here.

use std::collections::BTreeMap;

use crate::metrics::{MetricKind, MetricSnapshot, OrderRecord};
use crate::rca::features::{mean_feature, outcome_label, FeatureId};
use crate::rca::{Evidence, EvidenceDetail, EvidenceFlag};
use crate::stats;

/// Relative change in the primary feature that saturates impact at 1.0.
const IMPACT_SATURATION: f64 = 0.5;

/// Sides with fewer rows than this contribute no distribution test.
const MIN_TEST_ROWS: usize = 2;

/// Difference-in-differences on the metric's outcome rate, treatment vs
/// control split by the hypothesis's treatment flag, before/after split at
/// the baseline/current boundary.
pub fn diff_in_diff_score(
    baseline: &[OrderRecord],
    current: &[OrderRecord],
    metric: MetricKind,
    treatment: Option<FeatureId>,
) -> Evidence {
    let Some(flag) = treatment else {
        return Evidence::inapplicable(EvidenceFlag::NoTreatmentFeature);
    };

    let split = |rows: &[OrderRecord]| -> (Vec<f64>, Vec<f64>) {
        let mut treated = Vec::new();
        let mut control = Vec::new();
        for o in rows {
            let outcome = outcome_label(metric, o);
            if flag.value(o).unwrap_or(0.0) >= 0.5 {
                treated.push(outcome);
            } else {
                control.push(outcome);
            }
        }
        (treated, control)
    };
    let (t_before, c_before) = split(baseline);
    let (t_after, c_after) = split(current);

    let cells = [&t_before, &t_after, &c_before, &c_after];
    if cells.iter().any(|c| c.is_empty()) {
        return Evidence::inapplicable(EvidenceFlag::MissingCell);
    }

    let did = (stats::mean(&t_after) - stats::mean(&t_before))
        - (stats::mean(&c_after) - stats::mean(&c_before));

    let pooled_se = (cells
        .iter()
        .map(|c| stats::sample_std(c).powi(2) / c.len() as f64)
        .sum::<f64>()
        / 4.0)
        .sqrt();

    let (t_stat, p_value) = if pooled_se > 0.0 {
        let t = did / pooled_se;
        (t, stats::two_sided_p(t))
    } else {
        (0.0, 1.0)
    };

    Evidence::scored(
        (1.0 - p_value).clamp(0.0, 1.0),
        EvidenceDetail::DiffInDiff {
            did_estimate: did,
            t_statistic: t_stat,
            p_value,
            cells: [t_before.len(), t_after.len(), c_before.len(), c_after.len()],
        },
    )
}

/// Pearson correlation between the bucketed metric and the bucketed mean of
/// the primary feature, across baseline and current together.
pub fn correlation_score(
    baseline: &[OrderRecord],
    current: &[OrderRecord],
    metric: MetricKind,
    feature: FeatureId,
    bucket_secs: i64,
    min_buckets: usize,
    strong_threshold: f64,
) -> Evidence {
    let mut buckets: BTreeMap<i64, Vec<&OrderRecord>> = BTreeMap::new();
    for o in baseline.iter().chain(current) {
        let key = o.placed_at.timestamp().div_euclid(bucket_secs);
        buckets.entry(key).or_default().push(o);
    }

    let mut metric_series = Vec::new();
    let mut feature_series = Vec::new();
    for rows in buckets.values() {
        let owned: Vec<OrderRecord> = rows.iter().map(|o| (*o).clone()).collect();
        let Some(feature_mean) = mean_feature(&owned, feature) else {
            continue;
        };
        metric_series.push(MetricSnapshot::compute(&owned).value(metric));
        feature_series.push(feature_mean);
    }

    if metric_series.len() < min_buckets {
        return Evidence::inapplicable(EvidenceFlag::TooFewBuckets);
    }
    let Some(r) = stats::pearson(&feature_series, &metric_series) else {
        return Evidence::inapplicable(EvidenceFlag::ZeroVariance);
    };

    Evidence::scored(
        r.abs(),
        EvidenceDetail::Correlation {
            r,
            buckets: metric_series.len(),
            strong: r.abs() > strong_threshold,
        },
    )
}

/// Welch's t on the primary feature's row-level distribution, baseline vs
/// current. Only a significant shift scores.
pub fn statistical_score(
    baseline: &[OrderRecord],
    current: &[OrderRecord],
    feature: FeatureId,
) -> Evidence {
    let base: Vec<f64> = baseline.iter().filter_map(|o| feature.value(o)).collect();
    let cur: Vec<f64> = current.iter().filter_map(|o| feature.value(o)).collect();
    if base.len() < MIN_TEST_ROWS || cur.len() < MIN_TEST_ROWS {
        return Evidence::inapplicable(EvidenceFlag::TooFewRows);
    }
    let Some(t) = stats::welch_t(&base, &cur) else {
        return Evidence::inapplicable(EvidenceFlag::ZeroVariance);
    };
    let p = stats::two_sided_p(t);
    let score = if p < 0.05 { 1.0 - p } else { 0.0 };

    Evidence::scored(
        score,
        EvidenceDetail::Statistical {
            t_statistic: t,
            p_value: p,
            baseline_mean: stats::mean(&base),
            current_mean: stats::mean(&cur),
        },
    )
}

/// Normalized magnitude of the primary feature's move. A relative change of
/// 50% or more saturates at 1.0.
pub fn impact_score(
    baseline: &[OrderRecord],
    current: &[OrderRecord],
    primary: FeatureId,
) -> f64 {
    let (Some(base), Some(cur)) = (
        mean_feature(baseline, primary),
        mean_feature(current, primary),
    ) else {
        return 0.0;
    };
    if base.abs() < f64::EPSILON {
        return if cur.abs() > f64::EPSILON { 1.0 } else { 0.0 };
    }
    let relative = (cur - base).abs() / base.abs();
    (relative / IMPACT_SATURATION).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::order;

    fn batch_cell(prefix: &str, start_min: i64, n: usize, batched: bool, late: usize) -> Vec<OrderRecord> {
        (0..n)
            .map(|i| {
                let o = order(&format!("{prefix}{i}"), start_min + i as i64);
                let o = if batched { o.batched() } else { o };
                if i < late {
                    o.late_by(20.0).build()
                } else {
                    o.on_time().build()
                }
            })
            .collect()
    }

    #[test]
    fn test_did_isolates_treatment_effect() {
        // Baseline: both groups clean. Current: only batched orders go late.
        let mut baseline = batch_cell("tb", 0, 20, true, 0);
        baseline.extend(batch_cell("cb", 30, 20, false, 0));
        let mut current = batch_cell("ta", 60, 20, true, 18);
        current.extend(batch_cell("ca", 90, 20, false, 0));

        let ev = diff_in_diff_score(
            &baseline,
            &current,
            MetricKind::OnTimeRate,
            Some(FeatureId::Batched),
        );
        assert!(ev.score.unwrap() > 0.95);
        match ev.detail {
            Some(EvidenceDetail::DiffInDiff { did_estimate, cells, .. }) => {
                assert!((did_estimate - 0.9).abs() < 1e-9);
                assert_eq!(cells, [20, 20, 20, 20]);
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn test_did_null_when_both_groups_degrade() {
        let mut baseline = batch_cell("tb", 0, 20, true, 2);
        baseline.extend(batch_cell("cb", 30, 20, false, 2));
        let mut current = batch_cell("ta", 60, 20, true, 8);
        current.extend(batch_cell("ca", 90, 20, false, 8));

        let ev = diff_in_diff_score(
            &baseline,
            &current,
            MetricKind::OnTimeRate,
            Some(FeatureId::Batched),
        );
        assert!(ev.score.unwrap() < 0.05);
    }

    #[test]
    fn test_did_inapplicable_cases() {
        let baseline = batch_cell("b", 0, 10, false, 0);
        let current = batch_cell("c", 30, 10, false, 5);

        let ev = diff_in_diff_score(&baseline, &current, MetricKind::OnTimeRate, None);
        assert!(!ev.is_applicable());
        assert_eq!(ev.flags, vec![EvidenceFlag::NoTreatmentFeature]);

        // No batched rows anywhere: the treatment cells are empty.
        let ev = diff_in_diff_score(
            &baseline,
            &current,
            MetricKind::OnTimeRate,
            Some(FeatureId::Batched),
        );
        assert!(!ev.is_applicable());
        assert_eq!(ev.flags, vec![EvidenceFlag::MissingCell]);
    }

    #[test]
    fn test_correlation_tracks_the_driving_feature() {
        // Twenty hourly buckets: courier wait climbs while on-time decays.
        let mut rows = Vec::new();
        for b in 0..20i64 {
            let late = (b / 2) as usize;
            for i in 0..10usize {
                let o = order(&format!("o{b}_{i}"), b * 60 + i as i64)
                    .courier_wait(300.0 + b as f64 * 60.0);
                rows.push(if i < late {
                    o.late_by(20.0).build()
                } else {
                    o.on_time().build()
                });
            }
        }
        let (baseline, current) = rows.split_at(150);

        let ev = correlation_score(
            baseline,
            current,
            MetricKind::OnTimeRate,
            FeatureId::CourierWait,
            3600,
            10,
            0.7,
        );
        let score = ev.score.unwrap();
        assert!(score > 0.9, "score {score}");
        match ev.detail {
            Some(EvidenceDetail::Correlation { r, buckets, strong }) => {
                assert!(r < 0.0, "wait rises as on-time falls, r {r}");
                assert_eq!(buckets, 20);
                assert!(strong);
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn test_correlation_needs_enough_buckets() {
        let rows: Vec<_> = (0..50)
            .map(|i| order(&format!("o{i}"), i / 10 * 60).on_time().build())
            .collect();
        let ev = correlation_score(
            &rows[..25],
            &rows[25..],
            MetricKind::OnTimeRate,
            FeatureId::CourierWait,
            3600,
            10,
            0.7,
        );
        assert!(!ev.is_applicable());
        assert_eq!(ev.flags, vec![EvidenceFlag::TooFewBuckets]);
    }

    #[test]
    fn test_statistical_detects_distribution_shift() {
        let baseline: Vec<_> = (0..30)
            .map(|i| {
                order(&format!("b{i}"), i)
                    .courier_wait(if i % 2 == 0 { 280.0 } else { 320.0 })
                    .build()
            })
            .collect();
        let current: Vec<_> = (0..30)
            .map(|i| {
                order(&format!("c{i}"), 60 + i)
                    .courier_wait(if i % 2 == 0 { 580.0 } else { 620.0 })
                    .build()
            })
            .collect();

        let shifted = statistical_score(&baseline, &current, FeatureId::CourierWait);
        assert!(shifted.score.unwrap() > 0.95);

        // Identical distributions never score.
        let null = statistical_score(&baseline, &baseline, FeatureId::CourierWait);
        assert_eq!(null.score, Some(0.0));
    }

    #[test]
    fn test_statistical_inapplicable_without_variance() {
        let rows: Vec<_> = (0..10)
            .map(|i| order(&format!("o{i}"), i).build())
            .collect();
        let ev = statistical_score(&rows, &rows, FeatureId::CourierWait);
        assert!(!ev.is_applicable());
        assert_eq!(ev.flags, vec![EvidenceFlag::ZeroVariance]);
    }

    #[test]
    fn test_impact_saturates_at_half_relative_change() {
        let baseline: Vec<_> = (0..10)
            .map(|i| order(&format!("b{i}"), i).courier_wait(300.0).build())
            .collect();
        let doubled: Vec<_> = (0..10)
            .map(|i| order(&format!("c{i}"), 60 + i).courier_wait(600.0).build())
            .collect();
        let nudged: Vec<_> = (0..10)
            .map(|i| order(&format!("n{i}"), 120 + i).courier_wait(330.0).build())
            .collect();

        assert_eq!(impact_score(&baseline, &doubled, FeatureId::CourierWait), 1.0);
        let small = impact_score(&baseline, &nudged, FeatureId::CourierWait);
        assert!((small - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_impact_from_zero_baseline() {
        let baseline: Vec<_> = (0..10)
            .map(|i| order(&format!("b{i}"), i).build())
            .collect();
        let refunds: Vec<_> = (0..10)
            .map(|i| order(&format!("c{i}"), 60 + i).refund(2.5).build())
            .collect();

        assert_eq!(impact_score(&baseline, &refunds, FeatureId::RefundAmount), 1.0);
        assert_eq!(impact_score(&baseline, &baseline, FeatureId::RefundAmount), 0.0);
    }
}
