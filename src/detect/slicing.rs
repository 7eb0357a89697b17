//! Cohort slicing: localize a regression to the sub-populations driving it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metrics::{Cohort, Dimension, MetricKind, MetricSnapshot, OrderRecord, Polarity};

/// p-value ladder rendered in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Significance {
    #[serde(rename = "***")]
    Strong,
    #[serde(rename = "**")]
    Moderate,
    #[serde(rename = "*")]
    Weak,
    #[serde(rename = "ns")]
    NotSignificant,
}

impl Significance {
    pub fn from_p(p: f64) -> Self {
        if p < 0.001 {
            Significance::Strong
        } else if p < 0.01 {
            Significance::Moderate
        } else if p < 0.05 {
            Significance::Weak
        } else {
            Significance::NotSignificant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Significance::Strong => "***",
            Significance::Moderate => "**",
            Significance::Weak => "*",
            Significance::NotSignificant => "ns",
        }
    }
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cohort's contribution to a regression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceFinding {
    pub cohort: Cohort,
    pub baseline_value: f64,
    pub current_value: f64,
    pub delta: f64,
    pub delta_percent: f64,
    /// Orders in the current window.
    pub order_count: usize,
    pub baseline_count: usize,
    pub significance: Significance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicingConfig {
    /// Current-window orders required before a slice is considered.
    pub min_orders: usize,
    pub top_n: usize,
}

impl Default for SlicingConfig {
    fn default() -> Self {
        Self {
            min_orders: 10,
            top_n: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlicingEngine {
    cfg: SlicingConfig,
}

impl SlicingEngine {
    pub fn new(cfg: SlicingConfig) -> Self {
        Self { cfg }
    }

    /// Rank the single- and paired-dimension refinements of `root` that move
    /// the metric in the harmful direction. Callers pass both windows' rows
    /// once; every candidate slice is evaluated in memory.
    pub fn top_slices(
        &self,
        metric: MetricKind,
        root: &Cohort,
        baseline: &[OrderRecord],
        current: &[OrderRecord],
    ) -> Vec<SliceFinding> {
        let mut findings = Vec::new();

        for cohort in candidate_cohorts(root, current) {
            let cur_rows: Vec<&OrderRecord> =
                current.iter().filter(|o| o.matches(&cohort)).collect();
            if cur_rows.len() < self.cfg.min_orders {
                continue;
            }
            let base_rows: Vec<&OrderRecord> =
                baseline.iter().filter(|o| o.matches(&cohort)).collect();
            if base_rows.is_empty() {
                continue; // no baseline to compare against
            }

            let baseline_value = snapshot_of(&base_rows).value(metric);
            let current_value = snapshot_of(&cur_rows).value(metric);
            let delta = current_value - baseline_value;
            let harmful = match metric.polarity() {
                Polarity::HigherIsBetter => delta < 0.0,
                Polarity::LowerIsBetter => delta > 0.0,
            };
            if !harmful {
                continue;
            }

            let delta_percent = if baseline_value != 0.0 {
                delta / baseline_value * 100.0
            } else {
                0.0
            };
            let p = approx_p_value(baseline_value, current_value, base_rows.len(), cur_rows.len());

            findings.push(SliceFinding {
                cohort,
                baseline_value,
                current_value,
                delta,
                delta_percent,
                order_count: cur_rows.len(),
                baseline_count: base_rows.len(),
                significance: Significance::from_p(p),
            });
        }

        // Largest harmful swing first; bigger samples win ties.
        findings.sort_by(|a, b| {
            b.delta
                .abs()
                .partial_cmp(&a.delta.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.order_count.cmp(&a.order_count))
        });
        findings.truncate(self.cfg.top_n);
        findings
    }
}

/// Single-dimension and paired-dimension refinements of the root cohort,
/// over values observed in the current window. Deterministic order.
fn candidate_cohorts(root: &Cohort, current: &[OrderRecord]) -> Vec<Cohort> {
    let free: Vec<Dimension> = Dimension::ALL
        .iter()
        .copied()
        .filter(|d| root.get(*d).is_none())
        .collect();

    let mut out = Vec::new();
    for &dim in &free {
        for value in observed_values(current, dim) {
            out.push(root.clone().with(dim, value));
        }
    }
    for i in 0..free.len() {
        for j in (i + 1)..free.len() {
            let (d1, d2) = (free[i], free[j]);
            let combos: BTreeSet<(String, String)> = current
                .iter()
                .map(|o| {
                    (
                        o.dimension_value(d1).to_string(),
                        o.dimension_value(d2).to_string(),
                    )
                })
                .collect();
            for (v1, v2) in combos {
                out.push(root.clone().with(d1, v1).with(d2, v2));
            }
        }
    }
    out
}

fn observed_values(rows: &[OrderRecord], dim: Dimension) -> BTreeSet<String> {
    rows.iter()
        .map(|o| o.dimension_value(dim).to_string())
        .collect()
}

fn snapshot_of(rows: &[&OrderRecord]) -> MetricSnapshot {
    let owned: Vec<OrderRecord> = rows.iter().map(|o| (*o).clone()).collect();
    MetricSnapshot::compute(&owned)
}

/// Effect-size significance heuristic scaled by sample size. Slices thinner
/// than ten orders on either side never reach significance.
fn approx_p_value(baseline: f64, current: f64, n_base: usize, n_cur: usize) -> f64 {
    if n_base < 10 || n_cur < 10 {
        return 1.0;
    }
    let effect = if baseline == 0.0 {
        (current - baseline).abs()
    } else {
        (current - baseline).abs() / baseline.abs()
    };
    let n_factor = n_base.min(n_cur) as f64 / 100.0;
    (1.0 - effect * n_factor).max(0.001)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::order;

    /// Baseline: everything on time. Current: SF grocery collapses, the
    /// rest stays healthy.
    fn scenario() -> (Vec<OrderRecord>, Vec<OrderRecord>) {
        let mut baseline = Vec::new();
        let mut current = Vec::new();
        let mut n = 0;
        for region in ["SF", "NYC"] {
            for cat in ["grocery", "retail"] {
                for i in 0..30 {
                    n += 1;
                    baseline.push(
                        order(&format!("b{n}_{i}"), i)
                            .region(region)
                            .category(cat)
                            .on_time()
                            .build(),
                    );
                    let placed = 300 + i;
                    let o = order(&format!("c{n}_{i}"), placed).region(region).category(cat);
                    let o = if region == "SF" && cat == "grocery" {
                        o.late_by(25.0)
                    } else {
                        o.on_time()
                    };
                    current.push(o.build());
                }
            }
        }
        (baseline, current)
    }

    #[test]
    fn test_regressing_slice_ranks_first() {
        let (baseline, current) = scenario();
        let engine = SlicingEngine::new(SlicingConfig::default());
        let slices = engine.top_slices(
            MetricKind::OnTimeRate,
            &Cohort::root(),
            &baseline,
            &current,
        );

        assert!(!slices.is_empty());
        assert!(slices.len() <= 5);
        let top = &slices[0];
        // The pair pins the regression tighter than either single dimension.
        assert_eq!(top.cohort.get(Dimension::Region), Some("SF"));
        assert_eq!(top.cohort.get(Dimension::Category), Some("grocery"));
        assert!(top.delta < 0.0);
        assert_eq!(top.order_count, 30);
    }

    #[test]
    fn test_tie_break_prefers_larger_sample() {
        let mut baseline = Vec::new();
        let mut current = Vec::new();
        for i in 0..40 {
            baseline.push(order(&format!("ba{i}"), i).region("A").on_time().build());
            current.push(order(&format!("ca{i}"), 300 + i).region("A").late_by(20.0).build());
        }
        // Same -1.0 swing from a thinner cohort
        for i in 0..20 {
            baseline.push(order(&format!("bb{i}"), i).region("B").on_time().build());
            current.push(order(&format!("cb{i}"), 300 + i).region("B").late_by(20.0).build());
        }
        let engine = SlicingEngine::new(SlicingConfig {
            min_orders: 10,
            top_n: 50,
        });
        let slices =
            engine.top_slices(MetricKind::OnTimeRate, &Cohort::root(), &baseline, &current);
        let a_pos = slices
            .iter()
            .position(|s| s.cohort.get(Dimension::Region) == Some("A") && s.cohort.len() == 1)
            .unwrap();
        let b_pos = slices
            .iter()
            .position(|s| s.cohort.get(Dimension::Region) == Some("B") && s.cohort.len() == 1)
            .unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn test_improvements_are_not_reported() {
        let (current, baseline) = scenario(); // swapped: everything improved
        let engine = SlicingEngine::new(SlicingConfig::default());
        let slices = engine.top_slices(
            MetricKind::OnTimeRate,
            &Cohort::root(),
            &baseline,
            &current,
        );
        assert!(slices.is_empty());
    }

    #[test]
    fn test_min_orders_floor() {
        let (mut baseline, mut current) = scenario();
        // A collapsing cohort thinner than the floor must not surface.
        for i in 0..20 {
            baseline.push(order(&format!("lb{i}"), i).region("LA").on_time().build());
        }
        for i in 0..5 {
            current.push(
                order(&format!("lc{i}"), 400 + i)
                    .region("LA")
                    .late_by(30.0)
                    .build(),
            );
        }
        let engine = SlicingEngine::new(SlicingConfig::default());
        let slices = engine.top_slices(
            MetricKind::OnTimeRate,
            &Cohort::root(),
            &baseline,
            &current,
        );
        assert!(!slices.is_empty());
        assert!(slices
            .iter()
            .all(|s| s.cohort.get(Dimension::Region) != Some("LA")));
    }

    #[test]
    fn test_fixed_root_dimensions_stay_fixed() {
        let (baseline, current) = scenario();
        let engine = SlicingEngine::new(SlicingConfig::default());
        let root = Cohort::root().with(Dimension::Region, "SF");
        let slices = engine.top_slices(MetricKind::OnTimeRate, &root, &baseline, &current);
        for s in &slices {
            assert_eq!(s.cohort.get(Dimension::Region), Some("SF"));
        }
    }

    #[test]
    fn test_significance_ladder() {
        assert_eq!(Significance::from_p(0.0005), Significance::Strong);
        assert_eq!(Significance::from_p(0.005), Significance::Moderate);
        assert_eq!(Significance::from_p(0.02), Significance::Weak);
        assert_eq!(Significance::from_p(0.2), Significance::NotSignificant);
    }

    #[test]
    fn test_thin_slices_never_significant() {
        assert_eq!(approx_p_value(0.9, 0.4, 8, 40), 1.0);
        assert_eq!(approx_p_value(0.9, 0.4, 40, 8), 1.0);
        // Healthy counts with a large effect do reach significance
        let p = approx_p_value(0.9, 0.1, 200, 200);
        assert!(p < 0.05, "p={p}");
    }
}
