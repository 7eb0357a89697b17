//! Multi-method anomaly detection with consensus voting.
//!
//! Three detectors look at the latest point of a metric series: a rolling
//! z-score, an EWMA residual check, and a two-segment mean-shift split.
//! Each casts a tri-state vote; a quorum of anomaly votes opens an incident.
//! A detector that cannot speak for its input (too little history, zero
//! variance) abstains instead of guessing.

use serde::{Deserialize, Serialize};

use crate::detect::{DetectError, Severity, Vote, VoteSet};
use crate::metrics::Polarity;
use crate::stats;

/// Detector tunables. Defaults are the production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Rolling window for the z-score method, excluding the current point.
    pub z_window: usize,
    pub z_threshold: f64,
    pub ewma_alpha: f64,
    pub ewma_threshold: f64,
    /// Prior points required before the EWMA method votes.
    pub ewma_min_history: usize,
    /// Trailing residuals used for the EWMA sigma.
    pub ewma_residual_window: usize,
    /// Minimum points on each side of the mean-shift split.
    pub split_min_segment: usize,
    pub split_threshold: f64,
    /// Anomaly votes required for consensus.
    pub quorum: usize,
    /// Severity ladder cutoffs, in percentile points toward the harmful tail.
    pub high_percentile: f64,
    pub medium_percentile: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_window: 30,
            z_threshold: 2.5,
            ewma_alpha: 0.3,
            ewma_threshold: 2.0,
            ewma_min_history: 10,
            ewma_residual_window: 10,
            split_min_segment: 5,
            split_threshold: 2.0,
            quorum: 2,
            high_percentile: 5.0,
            medium_percentile: 10.0,
        }
    }
}

/// Outcome of evaluating a series at its latest point.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Detection {
    pub consensus: bool,
    pub votes: VoteSet,
    /// Percentile of the current value toward the harmful tail.
    pub percentile: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    cfg: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self { cfg }
    }

    /// Evaluate the latest point of `values` against its history.
    ///
    /// An empty series violates the input contract and is an error; a
    /// single-point series simply leaves every detector abstaining.
    pub fn detect(&self, values: &[f64], polarity: Polarity) -> Result<Detection, DetectError> {
        if values.is_empty() {
            return Err(DetectError::EmptySeries);
        }
        let current = values[values.len() - 1];
        let history = &values[..values.len() - 1];

        let votes = VoteSet {
            z_score: self.z_vote(history, current),
            ewma: self.ewma_vote(values),
            bayesian: self.split_vote(values),
        };

        let percentile = harmful_percentile(values, current, polarity);
        Ok(Detection {
            consensus: votes.consensus(self.cfg.quorum),
            votes,
            percentile,
            severity: self.severity_from_percentile(percentile),
        })
    }

    /// z-score of the current value against a trailing window of history.
    fn z_vote(&self, history: &[f64], current: f64) -> Vote {
        let start = history.len().saturating_sub(self.cfg.z_window);
        let window = &history[start..];
        if window.len() < 2 {
            return Vote::Abstain;
        }
        let std = stats::population_std(window);
        if std == 0.0 {
            return Vote::Abstain;
        }
        let z = (current - stats::mean(window)).abs() / std;
        if z > self.cfg.z_threshold {
            Vote::Anomaly
        } else {
            Vote::Normal
        }
    }

    /// Deviation of the current value from its exponentially weighted mean,
    /// scaled by the sigma of recent residuals.
    fn ewma_vote(&self, values: &[f64]) -> Vote {
        let n = values.len();
        if n < self.cfg.ewma_min_history + 1 {
            return Vote::Abstain;
        }
        let alpha = self.cfg.ewma_alpha;
        let mut ewma = values[0];
        let mut residuals = Vec::with_capacity(n);
        for &v in values {
            ewma = alpha * v + (1.0 - alpha) * ewma;
            residuals.push(v - ewma);
        }
        let tail = residuals.len().saturating_sub(self.cfg.ewma_residual_window);
        let sigma = stats::population_std(&residuals[tail..]);
        if sigma == 0.0 {
            return Vote::Abstain;
        }
        if residuals[n - 1].abs() / sigma > self.cfg.ewma_threshold {
            Vote::Anomaly
        } else {
            Vote::Normal
        }
    }

    /// Mean-shift test: the trailing min_segment points against everything
    /// before them. Segment spread uses sample std (ddof = 1).
    fn split_vote(&self, values: &[f64]) -> Vote {
        let n = values.len();
        let seg = self.cfg.split_min_segment;
        if n < 2 * seg {
            return Vote::Abstain;
        }
        let (before, after) = values.split_at(n - seg);
        let s1 = stats::sample_std(before);
        let s2 = stats::sample_std(after);
        if s1 == 0.0 || s2 == 0.0 {
            return Vote::Abstain;
        }
        let pooled = ((s1 * s1 + s2 * s2) / 2.0).sqrt();
        let t = (stats::mean(before) - stats::mean(after)).abs() / pooled;
        if t > self.cfg.split_threshold {
            Vote::Anomaly
        } else {
            Vote::Normal
        }
    }

    fn severity_from_percentile(&self, pct: f64) -> Severity {
        if pct < self.cfg.high_percentile {
            Severity::High
        } else if pct < self.cfg.medium_percentile {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Percentile rank of the current value in the full series, mirrored so a
/// low result always means "deep in the harmful tail".
fn harmful_percentile(values: &[f64], current: f64, polarity: Polarity) -> f64 {
    let pct = stats::percentile_rank(values, current);
    match polarity {
        Polarity::HigherIsBetter => pct,
        Polarity::LowerIsBetter => 100.0 - pct,
    }
}
