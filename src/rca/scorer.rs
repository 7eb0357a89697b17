//! Evidence combination, ranking, and narrative rendering.

use crate::metrics::MetricKind;
use crate::rca::HypothesisResult;

/// Fixed method weights, renormalized over whichever methods applied.
const W_ATTRIBUTION: f64 = 0.4;
const W_DIFF_IN_DIFF: f64 = 0.3;
const W_CORRELATION: f64 = 0.2;
const W_STATISTICAL: f64 = 0.1;

/// Top combined score above this reads as a single dominant cause.
const DOMINANT_CUTOFF: f64 = 0.7;
/// Above this, a primary and secondary cause are named.
const PRIMARY_CUTOFF: f64 = 0.5;

/// Weighted mean over the applicable evidence scores. Inapplicable methods
/// drop out of both numerator and denominator; all inapplicable is zero
/// confidence, not an error.
pub fn confidence(
    attribution: Option<f64>,
    diff_in_diff: Option<f64>,
    correlation: Option<f64>,
    statistical: Option<f64>,
) -> f64 {
    let terms = [
        (attribution, W_ATTRIBUTION),
        (diff_in_diff, W_DIFF_IN_DIFF),
        (correlation, W_CORRELATION),
        (statistical, W_STATISTICAL),
    ];
    let mut weighted = 0.0;
    let mut weight = 0.0;
    for (score, w) in terms {
        if let Some(s) = score {
            weighted += w * s;
            weight += w;
        }
    }
    if weight > 0.0 {
        (weighted / weight).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Order by combined score descending, ties broken by hypothesis name so
/// the ranking is deterministic.
pub fn rank(results: &mut [HypothesisResult]) {
    results.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hypothesis.cmp(&b.hypothesis))
    });
}

fn label(name: &str) -> String {
    name.replace('_', " ")
}

fn percent(v: f64) -> String {
    format!("{:.0}%", v * 100.0)
}

/// Rule-based narrative over the ranked causes. The threshold ladder is
/// user-facing and fixed.
pub fn narrative(ranked: &[HypothesisResult]) -> String {
    let Some(top) = ranked.first() else {
        return "No hypotheses could be tested.".to_string();
    };
    let top_label = label(&top.hypothesis);

    if top.combined > DOMINANT_CUTOFF {
        return format!(
            "Most of the regression is attributable to {top_label} (confidence {}).",
            percent(top.confidence)
        );
    }
    if top.combined > PRIMARY_CUTOFF {
        if let Some(second) = ranked.get(1) {
            return format!(
                "Primary cause: {top_label} (confidence {}); secondary cause: {} (confidence {}).",
                percent(top.confidence),
                label(&second.hypothesis),
                percent(second.confidence)
            );
        }
        return format!(
            "Primary cause: {top_label} (confidence {}).",
            percent(top.confidence)
        );
    }
    format!(
        "Multiple contributing factors; {top_label} is the most likely cause (confidence {}).",
        percent(top.confidence)
    )
}

/// One-line summary for dashboards and incident listings.
pub fn summary(ranked: &[HypothesisResult], metric: MetricKind) -> String {
    let Some(top) = ranked.first() else {
        return "No root causes identified.".to_string();
    };
    let mut out = format!("Most of the {metric} drop comes from {}", label(&top.hypothesis));
    if let Some(second) = ranked.get(1) {
        if second.combined > PRIMARY_CUTOFF {
            out.push_str(&format!(" and {}", label(&second.hypothesis)));
        }
    }
    out.push('.');
    out
}
