//! Root cause analysis orchestration.
//!
//! One run loads the incident's baseline and regression rows once, then
//! fans the relevant hypotheses out over a bounded concurrent stream. Each
//! hypothesis evaluates on a blocking thread under a wall-clock budget;
//! aggregation is the single barrier, and a timed-out hypothesis scores
//! zero instead of failing the run.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::config::{EngineConfig, RcaConfig};
use crate::detect::incident::IncidentManager;
use crate::detect::IncidentStatus;
use crate::metrics::{MetricKind, MetricSource, OrderRecord, SqliteMetricSource, TimeRange};
use crate::rca::attribution::attribution_score;
use crate::rca::evidence::{
    correlation_score, diff_in_diff_score, impact_score, statistical_score,
};
use crate::rca::hypothesis::{EvidenceMethod, Hypothesis, HypothesisLibrary};
use crate::rca::scorer;
use crate::rca::{Evidence, EvidenceFlag, HypothesisResult, RcaError, RcaReport, ReportStore};
use crate::storage::Pool;

#[derive(Clone)]
pub struct RcaEngine {
    source: Arc<dyn MetricSource>,
    incidents: Arc<IncidentManager>,
    reports: ReportStore,
    cfg: RcaConfig,
    bucket_secs: i64,
}

/// Rows shared across all hypothesis tasks in one run.
struct AnalysisData {
    metric: MetricKind,
    baseline: Vec<OrderRecord>,
    current: Vec<OrderRecord>,
    bucket_secs: i64,
}

impl RcaEngine {
    pub fn new(pool: Pool, cfg: &EngineConfig) -> Self {
        let source = Arc::new(SqliteMetricSource::new(pool.clone()));
        Self::from_parts(source, IncidentManager::new(pool.clone()), ReportStore::new(pool), cfg)
    }

    pub fn from_parts(
        source: Arc<dyn MetricSource>,
        incidents: IncidentManager,
        reports: ReportStore,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            source,
            incidents: Arc::new(incidents),
            reports,
            cfg: cfg.rca.clone(),
            bucket_secs: cfg.detection.bucket_secs,
        }
    }

    pub fn incidents(&self) -> Arc<IncidentManager> {
        self.incidents.clone()
    }

    pub fn reports(&self) -> ReportStore {
        self.reports.clone()
    }

    /// Analyze one incident: test every hypothesis registered for its
    /// metric, rank the evidence, persist the report, and move a fresh
    /// incident into investigation. Reanalysis overwrites the stored
    /// report and leaves the status alone.
    pub async fn run_rca(&self, incident_id: &str) -> Result<RcaReport> {
        let incidents = self.incidents.clone();
        let lookup = incident_id.to_string();
        let incident = tokio::task::spawn_blocking(move || incidents.get(&lookup))
            .await??
            .ok_or_else(|| RcaError::IncidentNotFound(incident_id.to_string()))?;

        let hypotheses = HypothesisLibrary::relevant(incident.metric)?;

        let baseline_window = TimeRange::new(incident.baseline_start, incident.window_start);
        let current_window = TimeRange::new(incident.window_start, incident.window_end);
        let baseline = self
            .source
            .orders(&incident.cohort, baseline_window)
            .await
            .context("loading baseline rows for rca")?;
        let current = self
            .source
            .orders(&incident.cohort, current_window)
            .await
            .context("loading regression-window rows for rca")?;
        info!(
            incident = %incident.id,
            metric = %incident.metric,
            hypotheses = hypotheses.len(),
            baseline_rows = baseline.len(),
            current_rows = current.len(),
            "starting root cause analysis"
        );

        let data = Arc::new(AnalysisData {
            metric: incident.metric,
            baseline,
            current,
            bucket_secs: self.bucket_secs,
        });

        // Futures are created eagerly (they stay inert until polled) so the
        // stream holds no borrowing closure; buffer_unordered still bounds
        // how many run at once.
        let tasks: Vec<_> = hypotheses
            .into_iter()
            .map(|h| self.test_hypothesis(h, Arc::clone(&data)))
            .collect();
        let outcomes: Vec<Result<HypothesisResult>> = stream::iter(tasks)
            .buffer_unordered(self.cfg.parallelism.max(1))
            .collect()
            .await;
        let mut ranked = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        scorer::rank(&mut ranked);

        let narrative = scorer::narrative(&ranked);
        let summary = scorer::summary(&ranked, incident.metric);
        let report = RcaReport {
            incident_id: incident.id.clone(),
            metric: incident.metric,
            generated_at: Utc::now(),
            hypotheses_tested: ranked.len(),
            ranked_causes: ranked,
            narrative,
            summary,
        };

        let reports = self.reports.clone();
        let persisted = report.clone();
        tokio::task::spawn_blocking(move || reports.save(&persisted)).await??;

        // First analysis moves a fresh incident forward. Never touch the
        // status on reanalysis, someone may already have resolved it.
        if incident.status == IncidentStatus::New {
            let incidents = self.incidents.clone();
            let id = incident.id.clone();
            tokio::task::spawn_blocking(move || {
                incidents.set_status(&id, IncidentStatus::Investigating)
            })
            .await??;
        }

        if let Some(top) = report.top_cause() {
            info!(
                incident = %incident.id,
                top_cause = %top.hypothesis,
                combined = format!("{:.3}", top.combined),
                "root cause analysis complete"
            );
        }
        Ok(report)
    }

    /// One hypothesis on a blocking thread under the configured budget. A
    /// blocking task cannot be canceled, so on timeout its eventual result
    /// is dropped and the hypothesis is reported untested.
    async fn test_hypothesis(
        &self,
        h: &'static Hypothesis,
        data: Arc<AnalysisData>,
    ) -> Result<HypothesisResult> {
        let budget = std::time::Duration::from_secs(self.cfg.hypothesis_timeout_secs);
        let cfg = self.cfg.clone();
        let work = tokio::task::spawn_blocking(move || evaluate(h, &data, &cfg));
        match tokio::time::timeout(budget, work).await {
            Ok(joined) => Ok(joined?),
            Err(_) => {
                warn!(
                    hypothesis = h.name,
                    budget_secs = self.cfg.hypothesis_timeout_secs,
                    "hypothesis test ran out of budget"
                );
                Ok(HypothesisResult::all_inapplicable(h, EvidenceFlag::TimedOut))
            }
        }
    }
}

/// Run the evidence methods a hypothesis lists and fold them into one
/// scored result. Methods the hypothesis does not list stay unflagged,
/// unlike methods that ran and found the data unusable.
fn evaluate(h: &Hypothesis, data: &AnalysisData, cfg: &RcaConfig) -> HypothesisResult {
    let attribution = if h.applies(EvidenceMethod::Attribution) {
        attribution_score(&data.current, data.metric, h.implicated_features, cfg)
    } else {
        Evidence::skipped()
    };
    let diff_in_diff = if h.applies(EvidenceMethod::DiffInDiff) {
        diff_in_diff_score(&data.baseline, &data.current, data.metric, h.treatment_feature)
    } else {
        Evidence::skipped()
    };
    let correlation = if h.applies(EvidenceMethod::Correlation) {
        correlation_score(
            &data.baseline,
            &data.current,
            data.metric,
            h.primary_feature(),
            data.bucket_secs,
            cfg.correlation_min_buckets,
            cfg.strong_correlation,
        )
    } else {
        Evidence::skipped()
    };
    let statistical = if h.applies(EvidenceMethod::Statistical) {
        statistical_score(&data.baseline, &data.current, h.primary_feature())
    } else {
        Evidence::skipped()
    };

    let confidence = scorer::confidence(
        attribution.score,
        diff_in_diff.score,
        correlation.score,
        statistical.score,
    );
    let impact = impact_score(&data.baseline, &data.current, h.primary_feature());
    let combined = (confidence * impact).clamp(0.0, 1.0);

    HypothesisResult {
        hypothesis: h.name.to_string(),
        category: h.category,
        attribution,
        diff_in_diff,
        correlation,
        statistical,
        confidence,
        impact,
        combined,
    }
}
