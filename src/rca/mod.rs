//! Root cause analysis.
//!
//! Given a detected incident, tests a static library of causal hypotheses
//! against the affected data slice. Each hypothesis is scored by up to four
//! independent evidence methods; the scorer combines them into confidence
//! and impact, ranks the candidates, and renders a narrative. Reports are
//! persisted per incident and regenerable bit-for-bit.

pub mod attribution;
pub mod engine;
pub mod evidence;
pub mod features;
pub mod hypothesis;
pub mod scorer;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricKind;
use crate::storage::Pool;

pub use engine::RcaEngine;
pub use hypothesis::{Category, EvidenceMethod, Hypothesis, HypothesisLibrary};

#[derive(Debug, Error)]
pub enum RcaError {
    /// The catalog maps no hypothesis categories to this metric. A setup
    /// defect, not a data condition.
    #[error("no hypotheses registered for metric '{0}'")]
    NoHypotheses(MetricKind),
    #[error("incident '{0}' not found")]
    IncidentNotFound(String),
}

/// Why an evidence method abstained or degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceFlag {
    /// Attribution floor: too few rows to fit, scored 0 instead.
    InsufficientRows,
    /// Single-class outcome or all-constant features.
    DegenerateFit,
    /// Diff-in-diff cell had no rows.
    MissingCell,
    /// Hypothesis defines no treatment flag, diff-in-diff cannot apply.
    NoTreatmentFeature,
    /// Correlation had fewer paired buckets than the floor.
    TooFewBuckets,
    /// Distribution test had fewer than two rows on a side.
    TooFewRows,
    /// No variance to test against.
    ZeroVariance,
    /// The whole hypothesis overran its wall-clock budget.
    TimedOut,
}

/// Per-method numeric context preserved for auditability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum EvidenceDetail {
    Attribution {
        rows: usize,
        /// Normalized mean |SHAP| per feature, summing to 1.
        importance: BTreeMap<String, f64>,
        implicated_mass: f64,
    },
    DiffInDiff {
        did_estimate: f64,
        t_statistic: f64,
        p_value: f64,
        /// Row counts: treatment before/after, control before/after.
        cells: [usize; 4],
    },
    Correlation {
        r: f64,
        buckets: usize,
        strong: bool,
    },
    Statistical {
        t_statistic: f64,
        p_value: f64,
        baseline_mean: f64,
        current_mean: f64,
    },
}

/// One evidence method's outcome. `score: None` marks the method
/// inapplicable and excludes it from the confidence average; `Some(0.0)` is
/// applicable-but-zero. The distinction is typed, never a convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<EvidenceFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<EvidenceDetail>,
}

impl Evidence {
    pub fn inapplicable(flag: EvidenceFlag) -> Self {
        Evidence {
            score: None,
            flags: vec![flag],
            detail: None,
        }
    }

    /// Method not listed for the hypothesis. No flag: nothing was attempted.
    pub fn skipped() -> Self {
        Evidence {
            score: None,
            flags: Vec::new(),
            detail: None,
        }
    }

    pub fn scored(score: f64, detail: EvidenceDetail) -> Self {
        Evidence {
            score: Some(score),
            flags: Vec::new(),
            detail: Some(detail),
        }
    }

    pub fn is_applicable(&self) -> bool {
        self.score.is_some()
    }
}

/// One tested hypothesis with its evidence and combined scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisResult {
    pub hypothesis: String,
    pub category: Category,
    pub attribution: Evidence,
    pub diff_in_diff: Evidence,
    pub correlation: Evidence,
    pub statistical: Evidence,
    pub confidence: f64,
    pub impact: f64,
    pub combined: f64,
}

impl HypothesisResult {
    /// Result for a hypothesis whose test never produced a signal. Scores
    /// zero across the board so it ranks last, but is never omitted.
    pub fn all_inapplicable(h: &Hypothesis, flag: EvidenceFlag) -> Self {
        HypothesisResult {
            hypothesis: h.name.to_string(),
            category: h.category,
            attribution: Evidence::inapplicable(flag),
            diff_in_diff: Evidence::inapplicable(flag),
            correlation: Evidence::inapplicable(flag),
            statistical: Evidence::inapplicable(flag),
            confidence: 0.0,
            impact: 0.0,
            combined: 0.0,
        }
    }
}

/// The RCA output boundary: ranked causes plus rendered text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaReport {
    pub incident_id: String,
    pub metric: MetricKind,
    pub generated_at: DateTime<Utc>,
    pub hypotheses_tested: usize,
    /// Descending combined score; ties broken by hypothesis name.
    pub ranked_causes: Vec<HypothesisResult>,
    pub narrative: String,
    pub summary: String,
}

impl RcaReport {
    pub fn top_cause(&self) -> Option<&HypothesisResult> {
        self.ranked_causes.first()
    }
}

/// SQLite persistence for reports, one row per incident.
#[derive(Clone)]
pub struct ReportStore {
    pool: Pool,
}

impl ReportStore {
    pub fn new(pool: Pool) -> Self {
        ReportStore { pool }
    }

    /// Store a report, replacing any previous one for the same incident.
    pub fn save(&self, report: &RcaReport) -> Result<()> {
        let conn = self.pool.get()?;
        let json = serde_json::to_string(report).context("serializing rca report")?;
        conn.execute(
            "INSERT INTO rca_reports (
                incident_id, metric, generated_at, hypotheses_tested,
                report_json, narrative, summary
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(incident_id) DO UPDATE SET
                metric = excluded.metric,
                generated_at = excluded.generated_at,
                hypotheses_tested = excluded.hypotheses_tested,
                report_json = excluded.report_json,
                narrative = excluded.narrative,
                summary = excluded.summary",
            rusqlite::params![
                report.incident_id,
                report.metric.as_str(),
                report.generated_at.to_rfc3339(),
                report.hypotheses_tested as i64,
                json,
                report.narrative,
                report.summary,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, incident_id: &str) -> Result<Option<RcaReport>> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT report_json FROM rca_reports WHERE incident_id = ?1",
                [incident_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => {
                let report = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt rca report for incident {incident_id}"))?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_distinguishes_zero_from_inapplicable() {
        let zero = Evidence {
            score: Some(0.0),
            flags: vec![EvidenceFlag::InsufficientRows],
            detail: None,
        };
        let skipped = Evidence::inapplicable(EvidenceFlag::MissingCell);

        assert!(zero.is_applicable());
        assert!(!skipped.is_applicable());

        let json = serde_json::to_string(&zero).unwrap();
        assert!(json.contains("0.0"));
        let json = serde_json::to_string(&skipped).unwrap();
        assert!(json.contains("null"));
    }

    #[test]
    fn test_evidence_json_round_trip() {
        let ev = Evidence::scored(
            0.42,
            EvidenceDetail::Correlation {
                r: -0.65,
                buckets: 24,
                strong: false,
            },
        );
        let json = serde_json::to_string(&ev).unwrap();
        let back: Evidence = serde_json::from_str(&json).unwrap();
        assert_eq!(back.score, Some(0.42));
        match back.detail {
            Some(EvidenceDetail::Correlation { r, buckets, strong }) => {
                assert!((r + 0.65).abs() < 1e-12);
                assert_eq!(buckets, 24);
                assert!(!strong);
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }
}
