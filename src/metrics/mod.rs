//! CX metric space -- metric kinds, cohorts, order observations, series.

pub mod provider;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use provider::{MetricSource, SqliteMetricSource};

/// Orders delivered within this many minutes of the promise count as on time.
pub const ON_TIME_TOLERANCE_MINUTES: f64 = 5.0;

/// CX score blend weights. Must sum to 1.0.
const W_ON_TIME: f64 = 0.30;
const W_ITEM_ACCURACY: f64 = 0.25;
const W_CANCELLATION: f64 = 0.15;
const W_REFUND: f64 = 0.15;
const W_SUPPORT: f64 = 0.10;
const W_RATING: f64 = 0.05;

#[derive(Debug, Error)]
#[error("unknown metric '{0}'")]
pub struct UnknownMetric(pub String);

#[derive(Debug, Error)]
#[error("unknown cohort dimension '{0}'")]
pub struct UnknownDimension(pub String);

/// Whether a larger value of the metric is good news or bad news.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    HigherIsBetter,
    LowerIsBetter,
}

/// The monitored metric space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CxScore,
    OnTimeRate,
    ItemAccuracy,
    CancellationRate,
    RefundRate,
    SupportRate,
    RatingScore,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::CxScore,
        MetricKind::OnTimeRate,
        MetricKind::ItemAccuracy,
        MetricKind::CancellationRate,
        MetricKind::RefundRate,
        MetricKind::SupportRate,
        MetricKind::RatingScore,
    ];

    /// Metrics scanned by a default detection pass.
    pub fn watchlist() -> Vec<MetricKind> {
        vec![
            MetricKind::CxScore,
            MetricKind::OnTimeRate,
            MetricKind::CancellationRate,
        ]
    }

    pub fn polarity(&self) -> Polarity {
        match self {
            MetricKind::CxScore
            | MetricKind::OnTimeRate
            | MetricKind::ItemAccuracy
            | MetricKind::RatingScore => Polarity::HigherIsBetter,
            MetricKind::CancellationRate | MetricKind::RefundRate | MetricKind::SupportRate => {
                Polarity::LowerIsBetter
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CxScore => "cx_score",
            MetricKind::OnTimeRate => "on_time_rate",
            MetricKind::ItemAccuracy => "item_accuracy",
            MetricKind::CancellationRate => "cancellation_rate",
            MetricKind::RefundRate => "refund_rate",
            MetricKind::SupportRate => "support_rate",
            MetricKind::RatingScore => "rating_score",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Cohort dimensions, in canonical key order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Store,
    Category,
    Region,
    TimeOfDay,
    BasketSize,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Store,
        Dimension::Category,
        Dimension::Region,
        Dimension::TimeOfDay,
        Dimension::BasketSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Store => "store",
            Dimension::Category => "category",
            Dimension::Region => "region",
            Dimension::TimeOfDay => "time_of_day",
            Dimension::BasketSize => "basket_size",
        }
    }

    /// Column backing this dimension in the orders table.
    pub fn column(&self) -> &'static str {
        match self {
            Dimension::Store => "store_id",
            Dimension::Category => "category",
            Dimension::Region => "region",
            Dimension::TimeOfDay => "time_of_day",
            Dimension::BasketSize => "basket_size",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = UnknownDimension;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dimension::ALL
            .iter()
            .find(|d| d.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownDimension(s.to_string()))
    }
}

/// A slice of the order population. Absent dimensions are wildcards; the
/// empty cohort is the whole population.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cohort(BTreeMap<Dimension, String>);

impl Cohort {
    pub fn root() -> Self {
        Cohort::default()
    }

    pub fn with(mut self, dim: Dimension, value: impl Into<String>) -> Self {
        self.0.insert(dim, value.into());
        self
    }

    pub fn get(&self, dim: Dimension) -> Option<&str> {
        self.0.get(&dim).map(|s| s.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &str)> {
        self.0.iter().map(|(d, v)| (*d, v.as_str()))
    }

    /// Canonical identity string, stable across runs. Root renders as "all".
    pub fn key(&self) -> String {
        if self.0.is_empty() {
            return "all".to_string();
        }
        self.0
            .iter()
            .map(|(d, v)| format!("{}={}", d, v))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Parse a single `dim=value` pair, as supplied on the CLI.
    pub fn parse_pair(s: &str) -> anyhow::Result<(Dimension, String)> {
        let (dim, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected dim=value, got '{s}'"))?;
        let dim = Dimension::from_str(dim.trim())?;
        Ok((dim, value.trim().to_string()))
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One flattened order observation, as ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub placed_at: DateTime<Utc>,
    pub store_id: String,
    pub category: String,
    pub region: String,
    pub time_of_day: String,
    pub basket_size: String,
    pub basket_value: f64,
    pub distance_miles: f64,
    pub merchant_prep_secs: f64,
    pub courier_wait_secs: f64,
    #[serde(default)]
    pub batched: bool,
    #[serde(default)]
    pub canceled: bool,
    pub promised_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub items: u32,
    #[serde(default)]
    pub substituted_items: u32,
    #[serde(default)]
    pub missing_items: u32,
    #[serde(default)]
    pub refund_amount: f64,
    #[serde(default)]
    pub support_tickets: u32,
    pub rating: Option<u8>,
}

impl OrderRecord {
    /// Delivery error in minutes, positive when late. None while undelivered.
    pub fn eta_error_minutes(&self) -> Option<f64> {
        self.delivered_at
            .map(|d| (d - self.promised_at).num_seconds() as f64 / 60.0)
    }

    pub fn is_late(&self) -> bool {
        self.eta_error_minutes()
            .map(|e| e > ON_TIME_TOLERANCE_MINUTES)
            .unwrap_or(false)
    }

    pub fn is_on_time(&self) -> bool {
        self.eta_error_minutes()
            .map(|e| e.abs() <= ON_TIME_TOLERANCE_MINUTES)
            .unwrap_or(false)
    }

    pub fn has_refund(&self) -> bool {
        self.refund_amount > 0.0
    }

    pub fn item_issue(&self) -> bool {
        self.substituted_items + self.missing_items > 0
    }

    pub fn dimension_value(&self, dim: Dimension) -> &str {
        match dim {
            Dimension::Store => &self.store_id,
            Dimension::Category => &self.category,
            Dimension::Region => &self.region,
            Dimension::TimeOfDay => &self.time_of_day,
            Dimension::BasketSize => &self.basket_size,
        }
    }

    pub fn matches(&self, cohort: &Cohort) -> bool {
        cohort
            .iter()
            .all(|(dim, value)| self.dimension_value(dim) == value)
    }
}

/// Half-open time window [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// All sub-metrics over one window of orders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub order_count: usize,
    pub on_time_rate: f64,
    pub item_accuracy: f64,
    pub cancellation_rate: f64,
    pub refund_rate: f64,
    pub support_rate: f64,
    pub rating_score: f64,
    pub cx_score: f64,
}

impl MetricSnapshot {
    pub fn compute(orders: &[OrderRecord]) -> Self {
        let n = orders.len();

        let delivered: Vec<&OrderRecord> = orders
            .iter()
            .filter(|o| !o.canceled && o.delivered_at.is_some())
            .collect();
        let on_time_rate = if delivered.is_empty() {
            0.0
        } else {
            delivered.iter().filter(|o| o.is_on_time()).count() as f64 / delivered.len() as f64
        };

        let accuracy_base: Vec<&OrderRecord> = orders
            .iter()
            .filter(|o| !o.canceled && o.items > 0)
            .collect();
        let item_accuracy = if accuracy_base.is_empty() {
            1.0
        } else {
            accuracy_base
                .iter()
                .map(|o| {
                    let issues = (o.substituted_items + o.missing_items) as f64;
                    (1.0 - issues / o.items as f64).clamp(0.0, 1.0)
                })
                .sum::<f64>()
                / accuracy_base.len() as f64
        };

        let frac = |count: usize| if n == 0 { 0.0 } else { count as f64 / n as f64 };
        let cancellation_rate = frac(orders.iter().filter(|o| o.canceled).count());
        let refund_rate = frac(orders.iter().filter(|o| o.has_refund()).count());
        let support_rate = frac(orders.iter().filter(|o| o.support_tickets > 0).count());

        let ratings: Vec<f64> = orders
            .iter()
            .filter_map(|o| o.rating)
            .map(|stars| (stars.saturating_sub(1)) as f64 / 4.0)
            .collect();
        let rating_score = if ratings.is_empty() {
            0.5
        } else {
            ratings.iter().sum::<f64>() / ratings.len() as f64
        };

        let cx_score = 100.0
            * (W_ON_TIME * on_time_rate
                + W_ITEM_ACCURACY * item_accuracy
                + W_CANCELLATION * (1.0 - cancellation_rate)
                + W_REFUND * (1.0 - refund_rate)
                + W_SUPPORT * (1.0 - support_rate)
                + W_RATING * rating_score);

        MetricSnapshot {
            order_count: n,
            on_time_rate,
            item_accuracy,
            cancellation_rate,
            refund_rate,
            support_rate,
            rating_score,
            cx_score,
        }
    }

    pub fn value(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::CxScore => self.cx_score,
            MetricKind::OnTimeRate => self.on_time_rate,
            MetricKind::ItemAccuracy => self.item_accuracy,
            MetricKind::CancellationRate => self.cancellation_rate,
            MetricKind::RefundRate => self.refund_rate,
            MetricKind::SupportRate => self.support_rate,
            MetricKind::RatingScore => self.rating_score,
        }
    }
}

/// One bucket of a metric series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricPoint {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
    pub order_count: usize,
}

/// Bucketed metric values for one (metric, cohort), oldest first.
/// Buckets with no orders are skipped rather than zero-filled.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    pub metric: MetricKind,
    pub cohort: Cohort,
    pub bucket_secs: i64,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&MetricPoint> {
        self.points.last()
    }
}
