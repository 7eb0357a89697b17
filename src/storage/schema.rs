//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY,
            order_id TEXT NOT NULL UNIQUE,
            placed_at TEXT NOT NULL,
            store_id TEXT NOT NULL,
            category TEXT NOT NULL,
            region TEXT NOT NULL,
            time_of_day TEXT NOT NULL,
            basket_size TEXT NOT NULL,
            basket_value REAL NOT NULL,
            distance_miles REAL NOT NULL,
            merchant_prep_secs REAL NOT NULL,
            courier_wait_secs REAL NOT NULL,
            batched INTEGER NOT NULL DEFAULT 0,
            canceled INTEGER NOT NULL DEFAULT 0,
            promised_at TEXT NOT NULL,
            delivered_at TEXT,
            items INTEGER NOT NULL,
            substituted_items INTEGER NOT NULL DEFAULT 0,
            missing_items INTEGER NOT NULL DEFAULT 0,
            refund_amount REAL NOT NULL DEFAULT 0,
            support_tickets INTEGER NOT NULL DEFAULT 0,
            rating INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            metric TEXT NOT NULL,
            cohort_key TEXT NOT NULL,
            cohort_json TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            baseline_start TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            baseline_value REAL NOT NULL,
            current_value REAL NOT NULL,
            delta REAL NOT NULL,
            delta_percent REAL NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            votes_json TEXT NOT NULL,
            top_slices_json TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(metric, cohort_key, window_start, window_end)
        );

        CREATE TABLE IF NOT EXISTS rca_reports (
            id INTEGER PRIMARY KEY,
            incident_id TEXT NOT NULL UNIQUE,
            metric TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            hypotheses_tested INTEGER NOT NULL,
            report_json TEXT NOT NULL,
            narrative TEXT NOT NULL,
            summary TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (incident_id) REFERENCES incidents(id)
        );

        CREATE INDEX IF NOT EXISTS idx_orders_placed ON orders(placed_at);
        CREATE INDEX IF NOT EXISTS idx_orders_store ON orders(store_id);
        CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);
        CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at);
        CREATE INDEX IF NOT EXISTS idx_rca_reports_incident ON rca_reports(incident_id);",
    )?;

    // Migration: Add 'direction' to incidents if missing
    let has_direction: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('incidents') WHERE name='direction'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_direction == 0 {
        conn.execute(
            "ALTER TABLE incidents ADD COLUMN direction TEXT NOT NULL DEFAULT 'regression'",
            [],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_direction_column_added() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let has: i32 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('incidents') WHERE name='direction'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has, 1);
    }
}
