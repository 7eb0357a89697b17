//! Detection pass orchestration.
//!
//! A pass walks (metric, cohort) keys independently: series in, consensus
//! vote, slice localization, idempotent upsert out. Keys share nothing but
//! the incident store, which serializes per identity key inside SQLite.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::detect::anomaly::AnomalyDetector;
use crate::detect::incident::IncidentManager;
use crate::detect::slicing::SlicingEngine;
use crate::detect::{Direction, Incident, IncidentStatus};
use crate::metrics::{
    Cohort, MetricKind, MetricSnapshot, MetricSource, SqliteMetricSource, TimeRange,
};
use crate::storage::Pool;

#[derive(Clone)]
pub struct DetectionEngine {
    source: Arc<dyn MetricSource>,
    incidents: Arc<IncidentManager>,
    detector: AnomalyDetector,
    slicer: SlicingEngine,
    bucket_secs: i64,
}

impl DetectionEngine {
    pub fn new(pool: Pool, cfg: &EngineConfig) -> Self {
        let source = Arc::new(SqliteMetricSource::new(pool.clone()));
        Self::from_parts(source, IncidentManager::new(pool), cfg)
    }

    /// Wire the engine over any metric source. Used by serve() and tests
    /// alike; the SQLite source is just the default.
    pub fn from_parts(
        source: Arc<dyn MetricSource>,
        incidents: IncidentManager,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            source,
            incidents: Arc::new(incidents),
            detector: AnomalyDetector::new(cfg.detector.clone()),
            slicer: SlicingEngine::new(cfg.slicing.clone()),
            bucket_secs: cfg.detection.bucket_secs,
        }
    }

    pub fn incidents(&self) -> Arc<IncidentManager> {
        self.incidents.clone()
    }

    /// Evaluate one (metric, cohort) key over `range`. The final bucket is
    /// the current window, everything before it the baseline. Returns the
    /// stored incident when the detectors reach consensus, None otherwise.
    pub async fn run_detection(
        &self,
        metric: MetricKind,
        cohort: &Cohort,
        range: TimeRange,
    ) -> Result<Option<Incident>> {
        let series = self
            .source
            .series(metric, cohort, range, self.bucket_secs)
            .await
            .with_context(|| format!("loading series for {metric} over {cohort}"))?;

        let detection = self
            .detector
            .detect(&series.values(), metric.polarity())
            .with_context(|| format!("evaluating {metric} over {cohort} {range}"))?;

        if !detection.consensus {
            debug!(%metric, %cohort, votes = ?detection.votes, "no detector consensus");
            return Ok(None);
        }

        // series is non-empty here, the detector already rejected empty input
        let last_bucket = series.points[series.points.len() - 1].bucket_start;
        let window_end = std::cmp::min(last_bucket + Duration::seconds(self.bucket_secs), range.end);
        let baseline_window = TimeRange::new(range.start, last_bucket);
        let current_window = TimeRange::new(last_bucket, window_end);

        let base_rows = self.source.orders(cohort, baseline_window).await?;
        let cur_rows = self.source.orders(cohort, current_window).await?;

        let baseline_value = MetricSnapshot::compute(&base_rows).value(metric);
        let current_value = MetricSnapshot::compute(&cur_rows).value(metric);
        let delta = current_value - baseline_value;
        let delta_percent = if baseline_value != 0.0 {
            delta / baseline_value * 100.0
        } else {
            0.0
        };
        let direction = Direction::of(metric.polarity(), delta);
        let top_slices = self.slicer.top_slices(metric, cohort, &base_rows, &cur_rows);

        let candidate = Incident {
            id: Incident::new_id(),
            metric,
            cohort: cohort.clone(),
            detected_at: Utc::now(),
            baseline_start: range.start,
            window_start: last_bucket,
            window_end,
            baseline_value,
            current_value,
            delta,
            delta_percent,
            severity: detection.severity,
            direction,
            status: IncidentStatus::New,
            votes: detection.votes,
            top_slices,
            description: describe(metric, cohort, baseline_value, current_value, direction),
        };

        let incidents = self.incidents.clone();
        let stored =
            tokio::task::spawn_blocking(move || incidents.upsert(&candidate)).await??;
        info!(
            incident = %stored.id,
            %metric,
            %cohort,
            severity = %stored.severity,
            delta_percent = format!("{:.1}", stored.delta_percent),
            "incident filed"
        );
        Ok(Some(stored))
    }

    /// Fan one pass out over every (metric, cohort) key. Keys with too
    /// little data are logged and skipped; they never abort the pass.
    pub async fn run_pass(
        &self,
        metrics: &[MetricKind],
        cohorts: &[Cohort],
        range: TimeRange,
    ) -> Result<Vec<Incident>> {
        info!(
            metrics = metrics.len(),
            cohorts = cohorts.len(),
            %range,
            "starting detection pass"
        );
        let mut set = JoinSet::new();
        for &metric in metrics {
            for cohort in cohorts {
                let engine = self.clone();
                let cohort = cohort.clone();
                set.spawn(async move {
                    let found = engine.run_detection(metric, &cohort, range).await;
                    (metric, cohort, found)
                });
            }
        }

        let mut incidents = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (metric, cohort, found) = joined?;
            match found {
                Ok(Some(incident)) => incidents.push(incident),
                Ok(None) => {}
                Err(e) => warn!(%metric, %cohort, error = %e, "detection key skipped"),
            }
        }

        // Join order is nondeterministic; pin the pass output.
        incidents.sort_by(|a, b| {
            a.metric
                .as_str()
                .cmp(b.metric.as_str())
                .then_with(|| a.cohort.key().cmp(&b.cohort.key()))
        });
        info!(found = incidents.len(), "detection pass complete");
        Ok(incidents)
    }
}

fn describe(
    metric: MetricKind,
    cohort: &Cohort,
    baseline: f64,
    current: f64,
    direction: Direction,
) -> String {
    let verb = match direction {
        Direction::Regression => "regressed",
        Direction::Improvement => "improved",
    };
    format!("{metric} {verb} from {baseline:.2} to {current:.2} for cohort {cohort}")
}
