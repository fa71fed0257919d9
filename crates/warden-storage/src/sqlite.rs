//! SQLite-backed proposal store.
//!
//! Status changes are single `UPDATE ... WHERE id = ? AND status = ?`
//! statements, so the compare-and-swap holds even when several processes
//! share the database file. Writes spanning two tables (a proposal and its
//! idempotency key, a result and the terminal status) run in one
//! transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use warden_core::error::WardenError;
use warden_core::types::{ActionResult, Proposal, ProposalStatus};

use crate::db::Database;
use crate::store::{
    InsertOutcome, ProposalPatch, ProposalQuery, ProposalStore, SortOrder, VoteOutcome,
};

const PROPOSAL_COLUMNS: &str = "id, action_type, target_entity, target_id, payload, risk_level,
     source, confidence_score, requires_approval, requires_two_approvals, status, approvers,
     approved_by, approved_at, rejected_by, rejection_reason, idempotency_key, created_at";

pub struct SqliteProposalStore {
    db: Arc<Database>,
}

impl SqliteProposalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ProposalStore for SqliteProposalStore {
    fn insert_proposal(&self, proposal: &Proposal) -> Result<InsertOutcome, WardenError> {
        let payload = serde_json::to_string(&proposal.payload)?;
        let approvers = serde_json::to_string(&proposal.approvers)?;
        self.db.with_tx(|tx| {
            if let Some(key) = &proposal.idempotency_key {
                let claimed = tx
                    .execute(
                        "INSERT OR IGNORE INTO idempotency_keys (idempotency_key, action_id)
                         VALUES (?1, ?2)",
                        rusqlite::params![key, proposal.id.to_string()],
                    )
                    .map_err(|e| WardenError::Storage(format!("Failed to claim key: {}", e)))?;
                if claimed == 0 {
                    let existing: String = tx
                        .query_row(
                            "SELECT action_id FROM idempotency_keys WHERE idempotency_key = ?1",
                            rusqlite::params![key],
                            |row| row.get(0),
                        )
                        .map_err(|e| WardenError::Storage(e.to_string()))?;
                    return Ok(InsertOutcome::Existing(parse_uuid(&existing)?));
                }
            }

            tx.execute(
                &format!(
                    "INSERT INTO proposals ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    PROPOSAL_COLUMNS
                ),
                rusqlite::params![
                    proposal.id.to_string(),
                    proposal.action_type,
                    proposal.target_entity,
                    proposal.target_id,
                    payload,
                    proposal.risk_level.to_string(),
                    proposal.source.to_string(),
                    proposal.confidence_score,
                    proposal.requires_approval,
                    proposal.requires_two_approvals,
                    proposal.status.to_string(),
                    approvers,
                    proposal.approved_by,
                    proposal.approved_at.map(|t| t.timestamp_millis()),
                    proposal.rejected_by,
                    proposal.rejection_reason,
                    proposal.idempotency_key,
                    proposal.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| WardenError::Storage(format!("Failed to save proposal: {}", e)))?;
            Ok(InsertOutcome::Inserted)
        })
    }

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, WardenError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {} FROM proposals WHERE id = ?1", PROPOSAL_COLUMNS),
                    rusqlite::params![id.to_string()],
                    |row| Ok(row_to_proposal(row)),
                )
                .optional()
                .map_err(|e| WardenError::Storage(e.to_string()))?;

            match result {
                Some(proposal) => Ok(Some(proposal?)),
                None => Ok(None),
            }
        })
    }

    fn update_if(
        &self,
        id: Uuid,
        expected: ProposalStatus,
        patch: &ProposalPatch,
    ) -> Result<bool, WardenError> {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        let mut push = |column: &str, value: Box<dyn ToSql>| {
            params.push(value);
            sets.push(format!("{} = ?{}", column, params.len()));
        };
        if let Some(status) = patch.status {
            push("status", Box::new(status.to_string()));
        }
        if let Some(by) = &patch.approved_by {
            push("approved_by", Box::new(by.clone()));
        }
        if let Some(at) = patch.approved_at {
            push("approved_at", Box::new(at.timestamp_millis()));
        }
        if let Some(by) = &patch.rejected_by {
            push("rejected_by", Box::new(by.clone()));
        }
        if let Some(reason) = &patch.rejection_reason {
            push("rejection_reason", Box::new(reason.clone()));
        }
        if let Some(context) = &patch.approval_context {
            // Merged in place so concurrent approvers never overwrite each other.
            params.push(Box::new(serde_json::to_string(context)?));
            sets.push(format!(
                "payload = json_set(payload, '$.approval_context',
                     json_patch(COALESCE(payload -> '$.approval_context', '{{}}'), json(?{})))",
                params.len()
            ));
        }

        if sets.is_empty() {
            // Nothing to write; still report whether the guard holds.
            return Ok(self
                .get_proposal(id)?
                .map_or(false, |p| p.status == expected));
        }

        params.push(Box::new(id.to_string()));
        let id_idx = params.len();
        params.push(Box::new(expected.to_string()));
        let status_idx = params.len();

        let sql = format!(
            "UPDATE proposals SET {} WHERE id = ?{} AND status = ?{}",
            sets.join(", "),
            id_idx,
            status_idx
        );
        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        self.db.with_conn(|conn| {
            let changed = conn
                .execute(&sql, params_refs.as_slice())
                .map_err(|e| WardenError::Storage(format!("Failed to update proposal: {}", e)))?;
            Ok(changed == 1)
        })
    }

    fn add_approver(
        &self,
        id: Uuid,
        expected: ProposalStatus,
        approver: &str,
    ) -> Result<VoteOutcome, WardenError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE proposals
                     SET approvers = json_insert(approvers, '$[#]', ?1)
                     WHERE id = ?2 AND status = ?3
                       AND NOT EXISTS (
                           SELECT 1 FROM json_each(proposals.approvers) WHERE value = ?1
                       )",
                    rusqlite::params![approver, id.to_string(), expected.to_string()],
                )
                .map_err(|e| WardenError::Storage(format!("Failed to record approver: {}", e)))?;

            let current: Option<(String, String)> = conn
                .query_row(
                    "SELECT status, approvers FROM proposals WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| WardenError::Storage(e.to_string()))?;

            let Some((status, approvers)) = current else {
                return Ok(VoteOutcome::StatusMismatch);
            };
            let approvers: Vec<String> = serde_json::from_str(&approvers)?;
            if changed == 1 {
                Ok(VoteOutcome::Added(approvers))
            } else if status == expected.to_string() {
                Ok(VoteOutcome::AlreadyRecorded(approvers))
            } else {
                Ok(VoteOutcome::StatusMismatch)
            }
        })
    }

    fn query_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, WardenError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if !query.statuses.is_empty() {
            let mut slots = Vec::new();
            for status in &query.statuses {
                params.push(Box::new(status.to_string()));
                slots.push(format!("?{}", params.len()));
            }
            clauses.push(format!("status IN ({})", slots.join(", ")));
        }
        if let Some(action_type) = &query.action_type {
            params.push(Box::new(action_type.clone()));
            clauses.push(format!("action_type = ?{}", params.len()));
        }
        if let Some(target_id) = &query.target_id {
            params.push(Box::new(target_id.clone()));
            clauses.push(format!("target_id = ?{}", params.len()));
        }
        params.push(Box::new(query.limit as i64));
        let limit_idx = params.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order_sql = match query.order {
            SortOrder::Ascending => "ORDER BY created_at ASC, rowid ASC",
            SortOrder::Descending => "ORDER BY created_at DESC, rowid DESC",
        };
        let sql = format!(
            "SELECT {} FROM proposals {} {} LIMIT ?{}",
            PROPOSAL_COLUMNS, where_sql, order_sql, limit_idx
        );
        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| WardenError::Storage(format!("Proposal query prepare: {}", e)))?;
            let rows = stmt
                .query_map(params_refs.as_slice(), |row| Ok(row_to_proposal(row)))
                .map_err(|e| WardenError::Storage(format!("Proposal query: {}", e)))?;

            let mut proposals = Vec::new();
            for row in rows {
                let proposal = row.map_err(|e| WardenError::Storage(e.to_string()))??;
                proposals.push(proposal);
            }
            Ok(proposals)
        })
    }

    fn record_result(
        &self,
        result: &ActionResult,
        terminal: ProposalStatus,
    ) -> Result<bool, WardenError> {
        let result_data = serde_json::to_string(&result.result_data)?;
        let side_effects = serde_json::to_string(&result.side_effects)?;
        self.db.with_tx(|tx| {
            let moved = tx
                .execute(
                    "UPDATE proposals SET status = ?1 WHERE id = ?2 AND status = ?3",
                    rusqlite::params![
                        terminal.to_string(),
                        result.action_id.to_string(),
                        ProposalStatus::Executing.to_string(),
                    ],
                )
                .map_err(|e| WardenError::Storage(format!("Failed to finish proposal: {}", e)))?;
            if moved == 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO action_results
                     (action_id, success, result_data, error, execution_time_ms, side_effects, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    result.action_id.to_string(),
                    result.success,
                    result_data,
                    result.error,
                    result.execution_time_ms as i64,
                    side_effects,
                    result.executed_at.timestamp_millis(),
                ],
            )
            .map_err(|e| WardenError::Storage(format!("Failed to save action result: {}", e)))?;
            Ok(true)
        })
    }

    fn get_result(&self, action_id: Uuid) -> Result<Option<ActionResult>, WardenError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    "SELECT action_id, success, result_data, error, execution_time_ms,
                            side_effects, executed_at
                     FROM action_results WHERE action_id = ?1",
                    rusqlite::params![action_id.to_string()],
                    |row| Ok(row_to_result(row)),
                )
                .optional()
                .map_err(|e| WardenError::Storage(e.to_string()))?;

            match result {
                Some(r) => Ok(Some(r?)),
                None => Ok(None),
            }
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, WardenError> {
    Uuid::parse_str(s).map_err(|e| WardenError::Storage(format!("Invalid UUID: {}", e)))
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>, WardenError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| WardenError::Storage(format!("Invalid timestamp: {}", ms)))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, WardenError> {
    s.parse::<T>().map_err(WardenError::Storage)
}

fn row_to_proposal(row: &rusqlite::Row<'_>) -> Result<Proposal, WardenError> {
    let get_err = |e: rusqlite::Error| WardenError::Storage(e.to_string());

    let id: String = row.get(0).map_err(get_err)?;
    let payload: String = row.get(4).map_err(get_err)?;
    let risk_level: String = row.get(5).map_err(get_err)?;
    let source: String = row.get(6).map_err(get_err)?;
    let status: String = row.get(10).map_err(get_err)?;
    let approvers: String = row.get(11).map_err(get_err)?;
    let approved_at: Option<i64> = row.get(13).map_err(get_err)?;
    let created_at: i64 = row.get(17).map_err(get_err)?;

    Ok(Proposal {
        id: parse_uuid(&id)?,
        action_type: row.get(1).map_err(get_err)?,
        target_entity: row.get(2).map_err(get_err)?,
        target_id: row.get(3).map_err(get_err)?,
        payload: serde_json::from_str(&payload)?,
        risk_level: parse_enum(&risk_level)?,
        source: parse_enum(&source)?,
        confidence_score: row.get(7).map_err(get_err)?,
        requires_approval: row.get(8).map_err(get_err)?,
        requires_two_approvals: row.get(9).map_err(get_err)?,
        status: parse_enum(&status)?,
        approvers: serde_json::from_str(&approvers)?,
        approved_by: row.get(12).map_err(get_err)?,
        approved_at: approved_at.map(parse_millis).transpose()?,
        rejected_by: row.get(14).map_err(get_err)?,
        rejection_reason: row.get(15).map_err(get_err)?,
        idempotency_key: row.get(16).map_err(get_err)?,
        created_at: parse_millis(created_at)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> Result<ActionResult, WardenError> {
    let get_err = |e: rusqlite::Error| WardenError::Storage(e.to_string());

    let action_id: String = row.get(0).map_err(get_err)?;
    let result_data: String = row.get(2).map_err(get_err)?;
    let execution_time_ms: i64 = row.get(4).map_err(get_err)?;
    let side_effects: String = row.get(5).map_err(get_err)?;
    let executed_at: i64 = row.get(6).map_err(get_err)?;

    Ok(ActionResult {
        action_id: parse_uuid(&action_id)?,
        success: row.get(1).map_err(get_err)?,
        result_data: serde_json::from_str(&result_data)?,
        error: row.get(3).map_err(get_err)?,
        execution_time_ms: execution_time_ms.max(0) as u64,
        side_effects: serde_json::from_str(&side_effects)?,
        executed_at: parse_millis(executed_at)?,
    })
}
