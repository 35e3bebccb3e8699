//! SQLite-backed ledger tracking file-based outbox messages.
//!
//! One row per outbox file, keyed by source path, so a crash never
//! silently loses or double-processes a file. Rowid order is registration
//! order, which is how pending work is handed out.

use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Agent names that must never be used as a spawnable identity. The first
/// three are matched case-insensitively.
pub const RESERVED_AGENT_NAMES: [&str; 4] = ["Lead", "System", "Broadcast", "*"];

/// Whether the name is reserved for relay-internal addressing.
pub fn is_reserved_agent_name(name: &str) -> bool {
    name == "*"
        || RESERVED_AGENT_NAMES
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Ledger record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Archived,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            other => Err(Error::Ledger(format!("unknown record status: {}", other))),
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked outbox file.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub id: String,
    pub source_path: PathBuf,
    pub agent: String,
    pub message_type: String,
    pub file_size: u64,
    pub content_hash: Option<String>,
    pub status: LedgerStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub archive_path: Option<String>,
    pub registered_at: i64,
    pub processed_at: Option<i64>,
    pub archived_at: Option<i64>,
}

/// Why a claim was rejected. These are expected races, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    /// No record with that id
    NotFound,
    /// Another consumer already holds the claim
    InProgress,
    /// Retry budget spent
    RetriesExhausted,
    /// The record already reached a resolved state
    AlreadyResolved,
}

impl fmt::Display for ClaimRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NotFound => "record not found",
            Self::InProgress => "record is already being processed",
            Self::RetriesExhausted => "retry budget exhausted",
            Self::AlreadyResolved => "record already resolved",
        };
        f.write_str(reason)
    }
}

/// Result of a claim attempt. A rejection means "do not process".
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(LedgerRecord),
    Rejected(ClaimRejection),
}

/// Counts returned by filesystem reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// processing records whose file survived, returned to pending
    pub reset: usize,
    /// in-flight records whose file vanished, now terminal
    pub failed: usize,
}

/// Per-status record counts for dashboards.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerStats {
    pub pending: usize,
    pub processing: usize,
    pub delivered: usize,
    pub failed: usize,
    pub archived: usize,
}

/// Durable tracker for file-based outbox messages.
pub struct RelayLedger {
    conn: Mutex<Connection>,
    max_retries: u32,
    archive_retention_days: u32,
}

impl RelayLedger {
    /// Open (creating if needed) the ledger database at `path`.
    pub fn open(path: &Path, max_retries: u32, archive_retention_days: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Ledger(format!("sqlite open: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_files (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL UNIQUE,
                agent TEXT NOT NULL,
                message_type TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                content_hash TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                archive_path TEXT,
                registered_at INTEGER NOT NULL,
                processed_at INTEGER,
                archived_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox_files(status);
            "#,
        )
        .map_err(|e| Error::Ledger(format!("sqlite init: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_retries,
            archive_retention_days,
        })
    }

    /// Register an outbox file. Idempotent by path: returns the new record
    /// id on first registration, None when the path is already tracked.
    pub fn register_file(
        &self,
        source_path: &Path,
        agent: &str,
        message_type: &str,
        file_size: u64,
        content_hash: Option<&str>,
    ) -> Result<Option<String>> {
        if is_reserved_agent_name(agent) {
            return Err(Error::Ledger(format!(
                "'{}' is a reserved agent name",
                agent
            )));
        }

        let conn = self.conn.lock().unwrap();
        let path_str = source_path.to_string_lossy().to_string();
        let now = chrono::Utc::now().timestamp_millis();

        // Short random hex ids collide rarely at outbox volumes; retry on
        // the primary-key constraint just in case.
        for _ in 0..4 {
            let id = short_hex_id();
            let result = conn.execute(
                "INSERT INTO outbox_files
                     (id, source_path, agent, message_type, file_size, content_hash,
                      status, retry_count, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)
                 ON CONFLICT(source_path) DO NOTHING",
                params![
                    id,
                    path_str,
                    agent,
                    message_type,
                    file_size as i64,
                    content_hash,
                    now
                ],
            );
            match result {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    tracing::debug!("Registered outbox file {} as {}", path_str, id);
                    return Ok(Some(id));
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    continue;
                }
                Err(e) => return Err(Error::Ledger(format!("sqlite register: {}", e))),
            }
        }

        Err(Error::Ledger("could not allocate a record id".to_string()))
    }

    /// Atomically claim a pending record for processing, incrementing its
    /// retry count. The status check and write are a single UPDATE, so two
    /// interleaved claimers can never both win.
    pub fn claim_file(&self, id: &str) -> Result<ClaimOutcome> {
        let conn = self.conn.lock().unwrap();

        let changed = conn
            .execute(
                "UPDATE outbox_files
                 SET status = 'processing', retry_count = retry_count + 1
                 WHERE id = ?1 AND status = 'pending' AND retry_count < ?2",
                params![id, self.max_retries],
            )
            .map_err(|e| Error::Ledger(format!("sqlite claim: {}", e)))?;

        if changed == 1 {
            let record = fetch_record(&conn, id)?
                .ok_or_else(|| Error::Ledger(format!("claimed record {} vanished", id)))?;
            return Ok(ClaimOutcome::Claimed(record));
        }

        let rejection = match fetch_record(&conn, id)? {
            None => ClaimRejection::NotFound,
            Some(record) => match record.status {
                LedgerStatus::Processing => ClaimRejection::InProgress,
                LedgerStatus::Delivered | LedgerStatus::Archived | LedgerStatus::Failed => {
                    ClaimRejection::AlreadyResolved
                }
                LedgerStatus::Pending => ClaimRejection::RetriesExhausted,
            },
        };
        Ok(ClaimOutcome::Rejected(rejection))
    }

    /// processing -> delivered, stamping the processed timestamp.
    pub fn mark_delivered(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE outbox_files
                 SET status = 'delivered', processed_at = ?2
                 WHERE id = ?1 AND status = 'processing'",
                params![id, chrono::Utc::now().timestamp_millis()],
            )
            .map_err(|e| Error::Ledger(format!("sqlite deliver: {}", e)))?;
        Ok(changed == 1)
    }

    /// Record a processing failure. Below the retry cap the record goes
    /// back to pending for a later claim; at the cap it is terminal and
    /// keeps the error text. Returns the resulting status.
    pub fn mark_failed(&self, id: &str, error_text: &str) -> Result<LedgerStatus> {
        let conn = self.conn.lock().unwrap();

        let record = fetch_record(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("ledger record {}", id)))?;
        if record.status != LedgerStatus::Processing {
            return Err(Error::Ledger(format!(
                "record {} is {}, not processing",
                id, record.status
            )));
        }

        let next = if record.retry_count >= self.max_retries {
            LedgerStatus::Failed
        } else {
            LedgerStatus::Pending
        };

        conn.execute(
            "UPDATE outbox_files SET status = ?2, last_error = ?3 WHERE id = ?1",
            params![id, next.as_str(), error_text],
        )
        .map_err(|e| Error::Ledger(format!("sqlite fail: {}", e)))?;

        if next == LedgerStatus::Failed {
            tracing::warn!(
                "Outbox record {} failed permanently after {} attempts: {}",
                id,
                record.retry_count,
                error_text
            );
        }
        Ok(next)
    }

    /// delivered -> archived, stamping the archive path and time.
    pub fn mark_archived(&self, id: &str, archive_path: &Path) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE outbox_files
                 SET status = 'archived', archive_path = ?2, archived_at = ?3
                 WHERE id = ?1 AND status = 'delivered'",
                params![
                    id,
                    archive_path.to_string_lossy().to_string(),
                    chrono::Utc::now().timestamp_millis()
                ],
            )
            .map_err(|e| Error::Ledger(format!("sqlite archive: {}", e)))?;
        Ok(changed == 1)
    }

    /// Look one record up by id.
    pub fn get_record(&self, id: &str) -> Result<Option<LedgerRecord>> {
        let conn = self.conn.lock().unwrap();
        fetch_record(&conn, id)
    }

    /// Pending records in registration order, oldest first.
    pub fn get_pending_files(&self, limit: Option<usize>) -> Result<Vec<LedgerRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, source_path, agent, message_type, file_size, content_hash,
                        status, retry_count, last_error, archive_path,
                        registered_at, processed_at, archived_at
                 FROM outbox_files WHERE status = 'pending'
                 ORDER BY rowid ASC LIMIT ?1",
            )
            .map_err(|e| Error::Ledger(format!("sqlite prepare pending: {}", e)))?;

        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![limit], row_to_record)
            .map_err(|e| Error::Ledger(format!("sqlite query pending: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| Error::Ledger(format!("sqlite read pending: {}", e)))?);
        }
        Ok(records)
    }

    /// Bulk processing -> pending. Run once at daemon startup to recover
    /// claims left dangling by an unclean shutdown.
    pub fn reset_processing_files(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE outbox_files SET status = 'pending' WHERE status = 'processing'",
                [],
            )
            .map_err(|e| Error::Ledger(format!("sqlite reset: {}", e)))?;
        if changed > 0 {
            tracing::info!("Reset {} dangling processing records to pending", changed);
        }
        Ok(changed)
    }

    /// Repair in-flight records against the actual filesystem: a vanished
    /// source file can never be processed, so it goes terminal; a surviving
    /// file that was mid-claim is safe to retry.
    pub fn reconcile_with_filesystem(&self) -> Result<ReconcileReport> {
        let conn = self.conn.lock().unwrap();

        let in_flight: Vec<(String, String, String)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, source_path, status FROM outbox_files
                     WHERE status IN ('pending', 'processing')",
                )
                .map_err(|e| Error::Ledger(format!("sqlite prepare reconcile: {}", e)))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(|e| Error::Ledger(format!("sqlite query reconcile: {}", e)))?;
            let mut in_flight = Vec::new();
            for row in rows {
                in_flight
                    .push(row.map_err(|e| Error::Ledger(format!("sqlite read reconcile: {}", e)))?);
            }
            in_flight
        };

        let mut report = ReconcileReport::default();
        for (id, source_path, status) in in_flight {
            if !Path::new(&source_path).exists() {
                conn.execute(
                    "UPDATE outbox_files SET status = 'failed', last_error = ?2 WHERE id = ?1",
                    params![id, "source file missing after restart"],
                )
                .map_err(|e| Error::Ledger(format!("sqlite reconcile fail: {}", e)))?;
                tracing::warn!("Reconciliation failed record {} ({} is gone)", id, source_path);
                report.failed += 1;
            } else if status == "processing" {
                conn.execute(
                    "UPDATE outbox_files SET status = 'pending' WHERE id = ?1",
                    params![id],
                )
                .map_err(|e| Error::Ledger(format!("sqlite reconcile reset: {}", e)))?;
                report.reset += 1;
            }
        }

        Ok(report)
    }

    /// Purge rows for files archived before the retention cutoff.
    pub fn cleanup_archived_records(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis()
            - (self.archive_retention_days as i64) * 24 * 60 * 60 * 1000;
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM outbox_files WHERE status = 'archived' AND archived_at < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::Ledger(format!("sqlite cleanup: {}", e)))?;
        if deleted > 0 {
            tracing::debug!("Purged {} archived ledger records", deleted);
        }
        Ok(deleted)
    }

    /// Per-status counts.
    pub fn get_stats(&self) -> Result<LedgerStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM outbox_files GROUP BY status")
            .map_err(|e| Error::Ledger(format!("sqlite prepare stats: {}", e)))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| Error::Ledger(format!("sqlite query stats: {}", e)))?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let (status, count) =
                row.map_err(|e| Error::Ledger(format!("sqlite read stats: {}", e)))?;
            let count = count as usize;
            match LedgerStatus::parse(&status)? {
                LedgerStatus::Pending => stats.pending = count,
                LedgerStatus::Processing => stats.processing = count,
                LedgerStatus::Delivered => stats.delivered = count,
                LedgerStatus::Failed => stats.failed = count,
                LedgerStatus::Archived => stats.archived = count,
            }
        }
        Ok(stats)
    }
}

fn short_hex_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn fetch_record(conn: &Connection, id: &str) -> Result<Option<LedgerRecord>> {
    conn.query_row(
        "SELECT id, source_path, agent, message_type, file_size, content_hash,
                status, retry_count, last_error, archive_path,
                registered_at, processed_at, archived_at
         FROM outbox_files WHERE id = ?1",
        params![id],
        row_to_record,
    )
    .optional()
    .map_err(|e| Error::Ledger(format!("sqlite fetch: {}", e)))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerRecord> {
    let status_text: String = row.get(6)?;
    let status = LedgerStatus::parse(&status_text).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown status: {}", status_text).into(),
        )
    })?;
    Ok(LedgerRecord {
        id: row.get(0)?,
        source_path: PathBuf::from(row.get::<_, String>(1)?),
        agent: row.get(2)?,
        message_type: row.get(3)?,
        file_size: row.get::<_, i64>(4)? as u64,
        content_hash: row.get(5)?,
        status,
        retry_count: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        archive_path: row.get(9)?,
        registered_at: row.get(10)?,
        processed_at: row.get(11)?,
        archived_at: row.get(12)?,
    })
}
