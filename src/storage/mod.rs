//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::metrics::OrderRecord;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA mmap_size = 268435456;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Insert one order observation. Re-ingesting the same order_id replaces it.
pub fn save_order(pool: &Pool, o: &OrderRecord) -> Result<()> {
    let conn = pool.get()?;
    insert_order(&conn, o)?;
    Ok(())
}

/// Bulk insert under a single transaction; returns the number stored.
pub fn save_orders(pool: &Pool, orders: &[OrderRecord]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    for o in orders {
        insert_order(&tx, o)?;
    }
    tx.commit()?;
    Ok(orders.len())
}

/// Load order observations from a JSON Lines file, one record per line.
/// Blank lines are skipped; a malformed line aborts the whole load with
/// its line number, nothing is committed.
pub fn ingest_jsonl(pool: &Pool, path: &Path) -> Result<usize> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut orders = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let order: OrderRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed order record", path.display(), idx + 1))?;
        orders.push(order);
    }
    save_orders(pool, &orders)
}

fn insert_order(conn: &rusqlite::Connection, o: &OrderRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO orders (
            order_id, placed_at, store_id, category, region, time_of_day,
            basket_size, basket_value, distance_miles, merchant_prep_secs,
            courier_wait_secs, batched, canceled, promised_at, delivered_at,
            items, substituted_items, missing_items, refund_amount,
            support_tickets, rating
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        rusqlite::params![
            o.order_id,
            o.placed_at.to_rfc3339(),
            o.store_id,
            o.category,
            o.region,
            o.time_of_day,
            o.basket_size,
            o.basket_value,
            o.distance_miles,
            o.merchant_prep_secs,
            o.courier_wait_secs,
            o.batched as i64,
            o.canceled as i64,
            o.promised_at.to_rfc3339(),
            o.delivered_at.map(|d| d.to_rfc3339()),
            o.items,
            o.substituted_items,
            o.missing_items,
            o.refund_amount,
            o.support_tickets,
            o.rating,
        ],
    )?;
    Ok(())
}
