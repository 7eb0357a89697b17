//! Regression detection -- detectors, consensus voting, slicing, incidents.

pub mod anomaly;
pub mod engine;
pub mod incident;
pub mod slicing;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{Cohort, MetricKind, Polarity};
use slicing::SliceFinding;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("metric series is empty over the requested range")]
    EmptySeries,
    #[error("incident {0} not found")]
    NotFound(String),
    #[error("incident {id} cannot move from {from} back to {to}")]
    BackwardTransition {
        id: String,
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("unrecognized {field} '{value}' in incident row {id}")]
    CorruptRow {
        id: String,
        field: &'static str,
        value: String,
    },
}

/// Incident severity, ordered so HIGH ranks above MEDIUM above LOW.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            other => Err(other.to_string()),
        }
    }
}

/// Which way the metric moved, relative to its polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Regression,
    Improvement,
}

impl Direction {
    /// Label a swing from the metric's polarity and the delta sign.
    pub fn of(polarity: Polarity, delta: f64) -> Direction {
        let harmful = match polarity {
            Polarity::HigherIsBetter => delta < 0.0,
            Polarity::LowerIsBetter => delta > 0.0,
        };
        if harmful {
            Direction::Regression
        } else {
            Direction::Improvement
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Regression => "regression",
            Direction::Improvement => "improvement",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regression" => Ok(Direction::Regression),
            "improvement" => Ok(Direction::Improvement),
            other => Err(other.to_string()),
        }
    }
}

/// Incident lifecycle. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    New,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    /// Same-state moves are allowed (no-op); backward moves are not.
    pub fn can_advance_to(&self, next: IncidentStatus) -> bool {
        next >= *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::New => "new",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(IncidentStatus::New),
            "investigating" => Ok(IncidentStatus::Investigating),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(other.to_string()),
        }
    }
}

/// One detector's opinion at the evaluation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Anomaly,
    Normal,
    Abstain,
}

impl Vote {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Vote::Anomaly)
    }
}

/// Tri-state votes from the three detectors. Abstentions stay visible in
/// storage and logs; they collapse to "no" only when the consensus is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSet {
    pub z_score: Vote,
    pub ewma: Vote,
    pub bayesian: Vote,
}

impl VoteSet {
    pub fn all_abstained() -> Self {
        VoteSet {
            z_score: Vote::Abstain,
            ewma: Vote::Abstain,
            bayesian: Vote::Abstain,
        }
    }

    pub fn anomaly_count(&self) -> usize {
        [self.z_score, self.ewma, self.bayesian]
            .iter()
            .filter(|v| v.is_anomaly())
            .count()
    }

    pub fn consensus(&self, quorum: usize) -> bool {
        self.anomaly_count() >= quorum
    }
}

/// A detected, durable regression record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub metric: MetricKind,
    pub cohort: Cohort,
    pub detected_at: DateTime<Utc>,
    pub baseline_start: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub baseline_value: f64,
    pub current_value: f64,
    pub delta: f64,
    pub delta_percent: f64,
    pub severity: Severity,
    pub direction: Direction,
    pub status: IncidentStatus,
    pub votes: VoteSet,
    pub top_slices: Vec<SliceFinding>,
    pub description: String,
}

impl Incident {
    pub fn new_id() -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("inc_{}", &hex[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consensus_quorum() {
        let two_of_three = VoteSet {
            z_score: Vote::Anomaly,
            ewma: Vote::Anomaly,
            bayesian: Vote::Normal,
        };
        assert!(two_of_three.consensus(2));

        let one_of_three = VoteSet {
            z_score: Vote::Anomaly,
            ewma: Vote::Normal,
            bayesian: Vote::Normal,
        };
        assert!(!one_of_three.consensus(2));
    }

    #[test]
    fn test_abstain_counts_as_no() {
        let votes = VoteSet {
            z_score: Vote::Anomaly,
            ewma: Vote::Abstain,
            bayesian: Vote::Abstain,
        };
        assert_eq!(votes.anomaly_count(), 1);
        assert!(!votes.consensus(2));
        assert!(votes.consensus(1));
    }

    #[test]
    fn test_status_forward_only() {
        use IncidentStatus::*;
        assert!(New.can_advance_to(Investigating));
        assert!(New.can_advance_to(Resolved));
        assert!(Investigating.can_advance_to(Investigating));
        assert!(!Resolved.can_advance_to(Investigating));
        assert!(!Investigating.can_advance_to(New));
    }

    #[test]
    fn test_direction_from_polarity() {
        use crate::metrics::Polarity::*;
        assert_eq!(Direction::of(HigherIsBetter, -4.0), Direction::Regression);
        assert_eq!(Direction::of(HigherIsBetter, 4.0), Direction::Improvement);
        assert_eq!(Direction::of(LowerIsBetter, 0.08), Direction::Regression);
        assert_eq!(Direction::of(LowerIsBetter, -0.08), Direction::Improvement);
    }

    #[test]
    fn test_incident_id_shape() {
        let id = Incident::new_id();
        assert!(id.starts_with("inc_"));
        assert_eq!(id.len(), 16);
    }
}
