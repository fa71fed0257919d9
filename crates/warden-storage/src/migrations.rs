//! Database schema migrations.
//!
//! Applies the proposal, action result, and idempotency key tables, tracked
//! through the schema_migrations table.

use rusqlite::Connection;
use tracing::info;

use warden_core::error::WardenError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), WardenError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| WardenError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| WardenError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: governance_schema");
    }

    Ok(())
}

/// Version 1: proposals, results, idempotency keys.
fn apply_v1(conn: &Connection) -> Result<(), WardenError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS proposals (
            id                      TEXT PRIMARY KEY NOT NULL,
            action_type             TEXT NOT NULL,
            target_entity           TEXT NOT NULL,
            target_id               TEXT NOT NULL,
            payload                 TEXT NOT NULL DEFAULT '{}',
            risk_level              TEXT NOT NULL
                                    CHECK (risk_level IN ('low', 'medium', 'high', 'critical')),
            source                  TEXT NOT NULL
                                    CHECK (source IN ('signal', 'proposal', 'manual', 'scheduled')),
            confidence_score        REAL NOT NULL,
            requires_approval       INTEGER NOT NULL DEFAULT 1,
            requires_two_approvals  INTEGER NOT NULL DEFAULT 0,
            status                  TEXT NOT NULL
                                    CHECK (status IN ('proposed', 'approved', 'executing',
                                                      'success', 'failed', 'rejected')),
            approvers               TEXT NOT NULL DEFAULT '[]',
            approved_by             TEXT,
            approved_at             INTEGER,
            rejected_by             TEXT,
            rejection_reason        TEXT,
            idempotency_key         TEXT,
            created_at              INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_proposals_status_created
            ON proposals (status, created_at ASC);

        CREATE INDEX IF NOT EXISTS idx_proposals_action_type
            ON proposals (action_type, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_proposals_target_id
            ON proposals (target_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS action_results (
            action_id           TEXT PRIMARY KEY NOT NULL,
            success             INTEGER NOT NULL,
            result_data         TEXT NOT NULL DEFAULT 'null',
            error               TEXT,
            execution_time_ms   INTEGER NOT NULL DEFAULT 0,
            side_effects        TEXT NOT NULL DEFAULT '[]',
            executed_at         INTEGER NOT NULL,
            FOREIGN KEY (action_id) REFERENCES proposals(id)
        );

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            idempotency_key TEXT PRIMARY KEY NOT NULL,
            action_id       TEXT NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'governance_schema');
        ",
    )
    .map_err(|e| WardenError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn insert_proposal(conn: &Connection, id: &str, status: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO proposals (id, action_type, target_entity, target_id, risk_level,
                                    source, confidence_score, status, created_at)
             VALUES (?1, 'task_create', 'task', 't-1', 'low', 'manual', 0.9, ?2, 1700000000000)",
            rusqlite::params![id, status],
        )
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_proposals_table_exists() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_proposal(&conn, "p-1", "proposed").unwrap();

        let approvers: String = conn
            .query_row("SELECT approvers FROM proposals WHERE id = 'p-1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(approvers, "[]");
    }

    #[test]
    fn test_proposals_status_check() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        assert!(insert_proposal(&conn, "bad", "done").is_err());
    }

    #[test]
    fn test_action_results_require_proposal() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let orphan = conn.execute(
            "INSERT INTO action_results (action_id, success, executed_at) VALUES ('nope', 1, 0)",
            [],
        );
        assert!(orphan.is_err());

        insert_proposal(&conn, "p-2", "success").unwrap();
        conn.execute(
            "INSERT INTO action_results (action_id, success, executed_at) VALUES ('p-2', 1, 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_idempotency_key_is_unique() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO idempotency_keys (idempotency_key, action_id) VALUES ('k', 'a')",
            [],
        )
        .unwrap();
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO idempotency_keys (idempotency_key, action_id) VALUES ('k', 'b')",
                [],
            )
            .unwrap();
        assert_eq!(changed, 0);
    }
}
