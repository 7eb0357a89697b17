//! Metric series provider backed by the orders table.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::metrics::{
    Cohort, Dimension, MetricKind, MetricPoint, MetricSeries, MetricSnapshot, OrderRecord,
    TimeRange,
};
use crate::storage::Pool;

/// Read seam between the engine and whatever holds the raw orders.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Bucketed series for one (metric, cohort) over the range, oldest first.
    async fn series(
        &self,
        metric: MetricKind,
        cohort: &Cohort,
        range: TimeRange,
        bucket_secs: i64,
    ) -> Result<MetricSeries>;

    /// Aggregate snapshot over one window.
    async fn snapshot(&self, cohort: &Cohort, range: TimeRange) -> Result<MetricSnapshot>;

    /// Raw order rows for slicing and causal checks.
    async fn orders(&self, cohort: &Cohort, range: TimeRange) -> Result<Vec<OrderRecord>>;

    /// Distinct values a dimension takes under a cohort in the window.
    async fn dimension_values(
        &self,
        dim: Dimension,
        cohort: &Cohort,
        range: TimeRange,
    ) -> Result<Vec<String>>;
}

/// SQLite-backed source. All queries run under spawn_blocking.
#[derive(Clone)]
pub struct SqliteMetricSource {
    pool: Pool,
}

impl SqliteMetricSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricSource for SqliteMetricSource {
    async fn series(
        &self,
        metric: MetricKind,
        cohort: &Cohort,
        range: TimeRange,
        bucket_secs: i64,
    ) -> Result<MetricSeries> {
        if bucket_secs <= 0 {
            bail!("bucket width must be positive, got {bucket_secs}s");
        }
        let pool = self.pool.clone();
        let query_cohort = cohort.clone();
        let orders = tokio::task::spawn_blocking(move || {
            fetch_orders_blocking(&pool, &query_cohort, range)
        })
        .await??;
        Ok(bucket_series(metric, cohort.clone(), range, bucket_secs, orders))
    }

    async fn snapshot(&self, cohort: &Cohort, range: TimeRange) -> Result<MetricSnapshot> {
        let pool = self.pool.clone();
        let cohort = cohort.clone();
        let orders = tokio::task::spawn_blocking(move || {
            fetch_orders_blocking(&pool, &cohort, range)
        })
        .await??;
        Ok(MetricSnapshot::compute(&orders))
    }

    async fn orders(&self, cohort: &Cohort, range: TimeRange) -> Result<Vec<OrderRecord>> {
        let pool = self.pool.clone();
        let cohort = cohort.clone();
        tokio::task::spawn_blocking(move || fetch_orders_blocking(&pool, &cohort, range)).await?
    }

    async fn dimension_values(
        &self,
        dim: Dimension,
        cohort: &Cohort,
        range: TimeRange,
    ) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let cohort = cohort.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut sql = format!(
                "SELECT DISTINCT {col} FROM orders WHERE placed_at >= ?1 AND placed_at < ?2",
                col = dim.column()
            );
            let mut params: Vec<String> = vec![range.start.to_rfc3339(), range.end.to_rfc3339()];
            for (d, value) in cohort.iter() {
                params.push(value.to_string());
                sql.push_str(&format!(" AND {} = ?{}", d.column(), params.len()));
            }
            sql.push_str(&format!(" ORDER BY {}", dim.column()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await?
    }
}

fn bucket_series(
    metric: MetricKind,
    cohort: Cohort,
    range: TimeRange,
    bucket_secs: i64,
    orders: Vec<OrderRecord>,
) -> MetricSeries {
    let mut buckets: BTreeMap<i64, Vec<OrderRecord>> = BTreeMap::new();
    for o in orders {
        let idx = (o.placed_at - range.start).num_seconds() / bucket_secs;
        buckets.entry(idx).or_default().push(o);
    }
    let points = buckets
        .into_iter()
        .map(|(idx, group)| MetricPoint {
            bucket_start: range.start + Duration::seconds(idx * bucket_secs),
            value: MetricSnapshot::compute(&group).value(metric),
            order_count: group.len(),
        })
        .collect();
    MetricSeries {
        metric,
        cohort,
        bucket_secs,
        points,
    }
}

fn fetch_orders_blocking(pool: &Pool, cohort: &Cohort, range: TimeRange) -> Result<Vec<OrderRecord>> {
    let conn = pool.get()?;
    let mut sql = String::from(
        "SELECT order_id, placed_at, store_id, category, region, time_of_day,
                basket_size, basket_value, distance_miles, merchant_prep_secs,
                courier_wait_secs, batched, canceled, promised_at, delivered_at,
                items, substituted_items, missing_items, refund_amount,
                support_tickets, rating
         FROM orders WHERE placed_at >= ?1 AND placed_at < ?2",
    );
    let mut params: Vec<String> = vec![range.start.to_rfc3339(), range.end.to_rfc3339()];
    for (dim, value) in cohort.iter() {
        params.push(value.to_string());
        sql.push_str(&format!(" AND {} = ?{}", dim.column(), params.len()));
    }
    sql.push_str(" ORDER BY placed_at, order_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok(RawOrder {
            order_id: row.get(0)?,
            placed_at: row.get(1)?,
            store_id: row.get(2)?,
            category: row.get(3)?,
            region: row.get(4)?,
            time_of_day: row.get(5)?,
            basket_size: row.get(6)?,
            basket_value: row.get(7)?,
            distance_miles: row.get(8)?,
            merchant_prep_secs: row.get(9)?,
            courier_wait_secs: row.get(10)?,
            batched: row.get(11)?,
            canceled: row.get(12)?,
            promised_at: row.get(13)?,
            delivered_at: row.get(14)?,
            items: row.get(15)?,
            substituted_items: row.get(16)?,
            missing_items: row.get(17)?,
            refund_amount: row.get(18)?,
            support_tickets: row.get(19)?,
            rating: row.get(20)?,
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?.into_record()?);
    }
    Ok(out)
}

/// Row image before timestamp parsing.
struct RawOrder {
    order_id: String,
    placed_at: String,
    store_id: String,
    category: String,
    region: String,
    time_of_day: String,
    basket_size: String,
    basket_value: f64,
    distance_miles: f64,
    merchant_prep_secs: f64,
    courier_wait_secs: f64,
    batched: i64,
    canceled: i64,
    promised_at: String,
    delivered_at: Option<String>,
    items: i64,
    substituted_items: i64,
    missing_items: i64,
    refund_amount: f64,
    support_tickets: i64,
    rating: Option<i64>,
}

impl RawOrder {
    fn into_record(self) -> Result<OrderRecord> {
        Ok(OrderRecord {
            placed_at: parse_ts(&self.placed_at)?,
            promised_at: parse_ts(&self.promised_at)?,
            delivered_at: self.delivered_at.as_deref().map(parse_ts).transpose()?,
            order_id: self.order_id,
            store_id: self.store_id,
            category: self.category,
            region: self.region,
            time_of_day: self.time_of_day,
            basket_size: self.basket_size,
            basket_value: self.basket_value,
            distance_miles: self.distance_miles,
            merchant_prep_secs: self.merchant_prep_secs,
            courier_wait_secs: self.courier_wait_secs,
            batched: self.batched != 0,
            canceled: self.canceled != 0,
            items: self.items as u32,
            substituted_items: self.substituted_items as u32,
            missing_items: self.missing_items as u32,
            refund_amount: self.refund_amount,
            support_tickets: self.support_tickets as u32,
            rating: self.rating.map(|r| r as u8),
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp '{s}' in orders table"))?
        .with_timezone(&Utc))
}
