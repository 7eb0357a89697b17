//! Durable incident records.
//!
//! Identity is (metric, cohort, detection window): re-detecting the same
//! window refreshes the stored row in place via a single SQLite upsert, so
//! concurrent passes never duplicate an incident. Status only moves forward.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::detect::slicing::SliceFinding;
use crate::detect::{DetectError, Direction, Incident, IncidentStatus, Severity, VoteSet};
use crate::metrics::{Cohort, MetricKind};
use crate::storage::Pool;

const INCIDENT_COLS: &str = "id, metric, cohort_json, detected_at, baseline_start, \
     window_start, window_end, baseline_value, current_value, delta, \
     delta_percent, severity, direction, status, votes_json, top_slices_json, \
     description";

#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_severity: BTreeMap<String, i64>,
}

pub struct IncidentManager {
    pool: Pool,
}

impl IncidentManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert or refresh the incident for its identity key. On refresh the
    /// original id and status survive; the measured fields update. Returns
    /// the stored record.
    pub fn upsert(&self, incident: &Incident) -> Result<Incident> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO incidents (
                id, metric, cohort_key, cohort_json, detected_at, baseline_start,
                window_start, window_end, baseline_value, current_value, delta,
                delta_percent, severity, direction, status, votes_json,
                top_slices_json, description, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, datetime('now'), datetime('now'))
            ON CONFLICT(metric, cohort_key, window_start, window_end) DO UPDATE SET
                detected_at = excluded.detected_at,
                baseline_value = excluded.baseline_value,
                current_value = excluded.current_value,
                delta = excluded.delta,
                delta_percent = excluded.delta_percent,
                severity = excluded.severity,
                direction = excluded.direction,
                votes_json = excluded.votes_json,
                top_slices_json = excluded.top_slices_json,
                description = excluded.description,
                updated_at = datetime('now')",
            params![
                incident.id,
                incident.metric.as_str(),
                incident.cohort.key(),
                serde_json::to_string(&incident.cohort)?,
                incident.detected_at.to_rfc3339(),
                incident.baseline_start.to_rfc3339(),
                incident.window_start.to_rfc3339(),
                incident.window_end.to_rfc3339(),
                incident.baseline_value,
                incident.current_value,
                incident.delta,
                incident.delta_percent,
                incident.severity.as_str(),
                incident.direction.as_str(),
                incident.status.as_str(),
                serde_json::to_string(&incident.votes)?,
                serde_json::to_string(&incident.top_slices)?,
                incident.description,
            ],
        )?;

        // Read back through the identity key: on refresh the stored id
        // differs from the candidate's.
        let sql = format!(
            "SELECT {INCIDENT_COLS} FROM incidents
             WHERE metric = ?1 AND cohort_key = ?2 AND window_start = ?3 AND window_end = ?4"
        );
        let raw = conn.query_row(
            &sql,
            params![
                incident.metric.as_str(),
                incident.cohort.key(),
                incident.window_start.to_rfc3339(),
                incident.window_end.to_rfc3339(),
            ],
            RawIncident::from_row,
        )?;
        raw.into_incident()
    }

    pub fn get(&self, id: &str) -> Result<Option<Incident>> {
        use rusqlite::OptionalExtension;
        let conn = self.pool.get()?;
        let sql = format!("SELECT {INCIDENT_COLS} FROM incidents WHERE id = ?1");
        let raw = conn
            .query_row(&sql, params![id], RawIncident::from_row)
            .optional()?;
        raw.map(|r| r.into_incident()).transpose()
    }

    /// Incidents matching the filters, most recently detected first.
    pub fn list(
        &self,
        status: Option<IncidentStatus>,
        severity: Option<Severity>,
        limit: usize,
    ) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let mut sql = format!("SELECT {INCIDENT_COLS} FROM incidents WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(s) = status {
            args.push(s.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(s) = severity {
            args.push(s.as_str().to_string());
            sql.push_str(&format!(" AND severity = ?{}", args.len()));
        }
        sql.push_str(&format!(" ORDER BY detected_at DESC LIMIT {limit}"));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter()),
            RawIncident::from_row,
        )?;
        let mut incidents = Vec::new();
        for r in rows {
            incidents.push(r?.into_incident()?);
        }
        Ok(incidents)
    }

    /// Unresolved incidents ranked for triage: severity first, then the
    /// size of the relative swing.
    pub fn ranked_open(&self, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {INCIDENT_COLS} FROM incidents WHERE status != 'resolved'"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], RawIncident::from_row)?;
        let mut incidents = Vec::new();
        for r in rows {
            incidents.push(r?.into_incident()?);
        }
        incidents.sort_by(|a, b| {
            b.severity.cmp(&a.severity).then(
                b.delta_percent
                    .abs()
                    .partial_cmp(&a.delta_percent.abs())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        incidents.truncate(limit);
        Ok(incidents)
    }

    /// Advance the lifecycle. Same-state is a no-op; moving backward is a
    /// typed error.
    pub fn set_status(&self, id: &str, next: IncidentStatus) -> Result<Incident> {
        let current = self
            .get(id)?
            .ok_or_else(|| DetectError::NotFound(id.to_string()))?;
        if !current.status.can_advance_to(next) {
            return Err(DetectError::BackwardTransition {
                id: id.to_string(),
                from: current.status,
                to: next,
            }
            .into());
        }
        if current.status == next {
            return Ok(current);
        }
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE incidents SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![next.as_str(), id],
        )?;
        self.get(id)?
            .ok_or_else(|| DetectError::NotFound(id.to_string()).into())
    }

    pub fn summary(&self) -> Result<IncidentSummary> {
        let conn = self.pool.get()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM incidents", [], |r| r.get(0))?;

        let mut by_status = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM incidents GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for r in rows {
            let (k, v) = r?;
            by_status.insert(k, v);
        }

        let mut by_severity = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT severity, COUNT(*) FROM incidents GROUP BY severity")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for r in rows {
            let (k, v) = r?;
            by_severity.insert(k, v);
        }

        Ok(IncidentSummary {
            total,
            by_status,
            by_severity,
        })
    }
}

/// Row image before JSON/enum/timestamp decoding.
struct RawIncident {
    id: String,
    metric: String,
    cohort_json: String,
    detected_at: String,
    baseline_start: String,
    window_start: String,
    window_end: String,
    baseline_value: f64,
    current_value: f64,
    delta: f64,
    delta_percent: f64,
    severity: String,
    direction: String,
    status: String,
    votes_json: String,
    top_slices_json: String,
    description: String,
}

impl RawIncident {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawIncident {
            id: row.get(0)?,
            metric: row.get(1)?,
            cohort_json: row.get(2)?,
            detected_at: row.get(3)?,
            baseline_start: row.get(4)?,
            window_start: row.get(5)?,
            window_end: row.get(6)?,
            baseline_value: row.get(7)?,
            current_value: row.get(8)?,
            delta: row.get(9)?,
            delta_percent: row.get(10)?,
            severity: row.get(11)?,
            direction: row.get(12)?,
            status: row.get(13)?,
            votes_json: row.get(14)?,
            top_slices_json: row.get(15)?,
            description: row.get(16)?,
        })
    }

    fn into_incident(self) -> Result<Incident> {
        let corrupt = |field: &'static str, value: &str| DetectError::CorruptRow {
            id: self.id.clone(),
            field,
            value: value.to_string(),
        };

        let metric = MetricKind::from_str(&self.metric)
            .map_err(|_| corrupt("metric", &self.metric))?;
        let severity = Severity::from_str(&self.severity)
            .map_err(|_| corrupt("severity", &self.severity))?;
        let direction = Direction::from_str(&self.direction)
            .map_err(|_| corrupt("direction", &self.direction))?;
        let status = IncidentStatus::from_str(&self.status)
            .map_err(|_| corrupt("status", &self.status))?;

        let cohort: Cohort = serde_json::from_str(&self.cohort_json)
            .with_context(|| format!("cohort_json of incident {}", self.id))?;
        let votes: VoteSet = serde_json::from_str(&self.votes_json)
            .with_context(|| format!("votes_json of incident {}", self.id))?;
        let top_slices: Vec<SliceFinding> = serde_json::from_str(&self.top_slices_json)
            .with_context(|| format!("top_slices_json of incident {}", self.id))?;

        Ok(Incident {
            metric,
            cohort,
            detected_at: parse_ts(&self.detected_at)?,
            baseline_start: parse_ts(&self.baseline_start)?,
            window_start: parse_ts(&self.window_start)?,
            window_end: parse_ts(&self.window_end)?,
            baseline_value: self.baseline_value,
            current_value: self.current_value,
            delta: self.delta,
            delta_percent: self.delta_percent,
            severity,
            direction,
            status,
            votes,
            top_slices,
            description: self.description,
            id: self.id,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp '{s}' in incidents table"))?
        .with_timezone(&Utc))
}
