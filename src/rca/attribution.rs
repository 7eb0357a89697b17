//! Feature attribution via a deterministic linear classifier.
//!
//! Fits a logistic model predicting the metric's binary outcome on the
//! current-window rows, then reads per-feature importance off the linear
//! SHAP decomposition `phi_ij = w_j * x_ij` (standardized inputs). Zero
//! initialization, fixed epochs, fixed learning rate: the fit has no
//! randomness at all, so reports regenerate bit-for-bit.

use std::collections::BTreeMap;

use crate::config::RcaConfig;
use crate::metrics::{MetricKind, OrderRecord};
use crate::rca::features::{outcome_label, FeatureId};
use crate::rca::{Evidence, EvidenceDetail, EvidenceFlag};

/// Share of total feature importance carried by the implicated features.
pub fn attribution_score(
    rows: &[OrderRecord],
    metric: MetricKind,
    implicated: &[FeatureId],
    cfg: &RcaConfig,
) -> Evidence {
    if rows.len() < cfg.min_attribution_rows {
        // Too small to fit reliably: applicable but zero, flagged.
        return Evidence {
            score: Some(0.0),
            flags: vec![EvidenceFlag::InsufficientRows],
            detail: None,
        };
    }

    let n = rows.len();
    let d = FeatureId::ALL.len();

    // Raw matrix; undefined values impute to zero before scaling.
    let mut x = vec![vec![0.0f64; d]; n];
    let mut y = vec![0.0f64; n];
    for (i, row) in rows.iter().enumerate() {
        for (j, feature) in FeatureId::ALL.iter().enumerate() {
            x[i][j] = feature.value(row).unwrap_or(0.0);
        }
        y[i] = outcome_label(metric, row);
    }

    let positives = y.iter().filter(|&&v| v > 0.5).count();
    if positives == 0 || positives == n {
        return Evidence::inapplicable(EvidenceFlag::DegenerateFit);
    }

    // Standardize in place. Constant columns become all zeros and carry no
    // importance.
    let mut any_varying = false;
    for j in 0..d {
        let mean = x.iter().map(|r| r[j]).sum::<f64>() / n as f64;
        let var = x.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n as f64;
        let std = var.sqrt();
        for row in x.iter_mut() {
            row[j] = if std > 0.0 { (row[j] - mean) / std } else { 0.0 };
        }
        if std > 0.0 {
            any_varying = true;
        }
    }
    if !any_varying {
        return Evidence::inapplicable(EvidenceFlag::DegenerateFit);
    }

    let weights = fit_logistic(&x, &y, cfg.attribution_epochs, cfg.attribution_learning_rate);

    // Mean |phi| per feature, normalized to sum to 1.
    let mut importance = vec![0.0f64; d];
    for (j, imp) in importance.iter_mut().enumerate() {
        let mean_abs = x.iter().map(|r| r[j].abs()).sum::<f64>() / n as f64;
        *imp = weights[j].abs() * mean_abs;
    }
    let total: f64 = importance.iter().sum();
    if total <= f64::EPSILON {
        return Evidence::inapplicable(EvidenceFlag::DegenerateFit);
    }

    let mut by_name = BTreeMap::new();
    for (j, feature) in FeatureId::ALL.iter().enumerate() {
        by_name.insert(feature.as_str().to_string(), importance[j] / total);
    }
    let mass: f64 = implicated
        .iter()
        .map(|f| by_name.get(f.as_str()).copied().unwrap_or(0.0))
        .sum::<f64>()
        .clamp(0.0, 1.0);

    Evidence::scored(
        mass,
        EvidenceDetail::Attribution {
            rows: n,
            importance: by_name,
            implicated_mass: mass,
        },
    )
}

/// Full-batch gradient descent on the logistic loss. Returns the weight
/// vector; the intercept absorbs the base rate and is not attributed.
fn fit_logistic(x: &[Vec<f64>], y: &[f64], epochs: usize, lr: f64) -> Vec<f64> {
    let n = x.len();
    let d = x[0].len();
    let mut w = vec![0.0f64; d];
    let mut b = 0.0f64;

    for _ in 0..epochs {
        let mut grad_w = vec![0.0f64; d];
        let mut grad_b = 0.0f64;
        for (row, &target) in x.iter().zip(y) {
            let z: f64 = row.iter().zip(&w).map(|(xi, wi)| xi * wi).sum::<f64>() + b;
            let err = sigmoid(z) - target;
            for (g, xi) in grad_w.iter_mut().zip(row) {
                *g += err * xi;
            }
            grad_b += err;
        }
        for (wi, g) in w.iter_mut().zip(&grad_w) {
            *wi -= lr * g / n as f64;
        }
        b -= lr * grad_b / n as f64;
    }
    w
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
