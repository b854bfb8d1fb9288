// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: SQLite persistence for boot sessions, snapshots and traces.
// Author: Lukas Bower

//! Snapshot store.
//!
//! Trace rows are appended inside a long-running transaction that is
//! committed every `commit_interval` rows, before every snapshot and when a
//! session ends. Snapshots are written atomically with their regions.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::Local;
use log::{debug, info, warn};
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::pattern::PatternTable;
use crate::stub::RegisterFile;

pub mod query;
mod schema;

pub use query::{
    EvolutionPoint, FunctionStats, MetricRecord, RegionChange, RegionHistory, RegionRecord,
    RegionSample, SessionInfo, SnapshotInfo, StageSummary, StageVisit, TraceEntry,
};

/// Format used for every stored timestamp; sorts lexically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current local time in [`TIMESTAMP_FORMAT`].
#[must_use]
pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Errors raised by the snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A trace row arrived out of order.
    #[error("session {session}: expected trace sequence {expected}, got {found}")]
    SequenceGap {
        /// Session the row belongs to.
        session: SessionId,
        /// Next sequence number the store accepts.
        expected: u64,
        /// Sequence number that was offered.
        found: u64,
    },
    /// The store was already closed.
    #[error("snapshot store is closed")]
    Closed,
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Identifier of a `boot_sessions` row.
    SessionId
);
row_id!(
    /// Identifier of a `memory_snapshots` row.
    SnapshotId
);
row_id!(
    /// Identifier of a `boot_stages` timeline row.
    StageVisitId
);

/// Store tuning and session metadata.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Trace rows between commits.
    pub commit_interval: u64,
    /// Value of `boot_sessions.qemu_version`.
    pub qemu_version: String,
    /// Value of `boot_sessions.freertos_version`.
    pub freertos_version: String,
    /// Keyword table used to pick each region's expected pattern.
    pub patterns: PatternTable,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            commit_interval: 1000,
            qemu_version: "QEMU ARM virt".to_owned(),
            freertos_version: "FreeRTOS Debug with Memory Patterns".to_owned(),
            patterns: PatternTable::default(),
        }
    }
}

/// One instruction-trace row as produced by the recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    /// Owning session.
    pub session: SessionId,
    /// Per-session sequence number, starting at 0.
    pub sequence: u64,
    /// Program counter.
    pub pc: u32,
    /// Raw instruction bytes; empty when unreadable.
    pub instruction: Vec<u8>,
    /// Disassembly text.
    pub disassembly: String,
    /// Register file at this step.
    pub registers: RegisterFile,
    /// Stack pointer, 0 when unknown.
    pub stack_pointer: u32,
    /// Resolved function name.
    pub function: String,
    /// Boot stage current at this step.
    pub stage: String,
}

/// Start address encoded in a `<name>_0x<hex>` region label, else 0.
#[must_use]
pub fn label_start_address(label: &str) -> u32 {
    label
        .rsplit_once("_0x")
        .and_then(|(_, hex)| u32::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}

/// SQLite-backed snapshot store.
pub struct SnapshotStore {
    conn: Option<Connection>,
    options: StoreOptions,
    pending: u64,
    next_sequence: HashMap<SessionId, u64>,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("open", &self.conn.is_some())
            .field("pending", &self.pending)
            .finish()
    }
}

impl SnapshotStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("opened snapshot store {}", path.display());
        Self::with_connection(conn, options)
    }

    /// Open a private in-memory database.
    pub fn in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        schema::init(&conn)?;
        Ok(Self {
            conn: Some(conn),
            options: StoreOptions {
                commit_interval: options.commit_interval.max(1),
                ..options
            },
            pending: 0,
            next_sequence: HashMap::new(),
        })
    }

    pub(crate) fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    /// True until [`SnapshotStore::close`] has run.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Trace rows appended since the last commit.
    #[must_use]
    pub fn pending_traces(&self) -> u64 {
        self.pending
    }

    /// Create a new session row.
    pub fn start_session(&mut self, description: &str) -> Result<SessionId, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO boot_sessions (start_time, description, qemu_version, freertos_version)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                timestamp(),
                description,
                self.options.qemu_version,
                self.options.freertos_version
            ],
        )?;
        let session = SessionId(conn.last_insert_rowid());
        self.next_sequence.insert(session, 0);
        info!("started session {session}: {description}");
        Ok(session)
    }

    /// Persist a snapshot and its regions in one transaction.
    pub fn save_memory_snapshot(
        &mut self,
        session: SessionId,
        stage: &str,
        pc: u32,
        regions: &[(String, Vec<u8>)],
    ) -> Result<SnapshotId, StoreError> {
        self.flush()?;
        let total_size: u64 = regions.iter().map(|(_, data)| data.len() as u64).sum();
        let labels: Vec<&str> = regions.iter().map(|(label, _)| label.as_str()).collect();
        let labels = serde_json::to_string(&labels)?;
        let patterns = &self.options.patterns;

        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memory_snapshots
                 (session_id, timestamp, boot_stage, pc_address, memory_regions, total_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session.0, timestamp(), stage, pc, labels, total_size as i64],
        )?;
        let snapshot = SnapshotId(tx.last_insert_rowid());
        {
            let mut insert = tx.prepare(
                "INSERT INTO memory_regions
                     (snapshot_id, region_name, start_address, end_address, size, data,
                      expected_pattern, pattern_matches, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (label, data) in regions {
                let analysis = patterns.analyse(label, data);
                let start = u64::from(label_start_address(label));
                let size = data.len() as u64;
                insert.execute(params![
                    snapshot.0,
                    label,
                    start as i64,
                    (start + size) as i64,
                    size as i64,
                    data,
                    analysis.expected,
                    analysis.matches as i64,
                    analysis.checksum,
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            "snapshot {snapshot} for {stage} at 0x{pc:08x}: {} regions, {total_size} bytes",
            regions.len()
        );
        Ok(snapshot)
    }

    fn expected_sequence(&mut self, session: SessionId) -> Result<u64, StoreError> {
        if let Some(next) = self.next_sequence.get(&session) {
            return Ok(*next);
        }
        let last: Option<i64> = self.conn()?.query_row(
            "SELECT MAX(sequence_number) FROM instruction_traces WHERE session_id = ?1",
            params![session.0],
            |row| row.get(0),
        )?;
        let next = last.map_or(0, |seq| seq as u64 + 1);
        self.next_sequence.insert(session, next);
        Ok(next)
    }

    /// Append one trace row; commits every `commit_interval` rows.
    pub fn save_instruction_trace(&mut self, record: &TraceRecord) -> Result<(), StoreError> {
        let expected = self.expected_sequence(record.session)?;
        if record.sequence != expected {
            return Err(StoreError::SequenceGap {
                session: record.session,
                expected,
                found: record.sequence,
            });
        }
        let registers = serde_json::to_string(&record.registers)?;
        let conn = self.conn()?;
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN")?;
        }
        conn.execute(
            "INSERT INTO instruction_traces
                 (session_id, sequence_number, timestamp, pc_address, instruction_bytes,
                  disassembly, registers, stack_pointer, function_name, boot_stage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.session.0,
                record.sequence as i64,
                timestamp(),
                record.pc,
                record.instruction,
                record.disassembly,
                registers,
                record.stack_pointer,
                record.function,
                record.stage,
            ],
        )?;
        self.next_sequence.insert(record.session, expected + 1);
        self.pending += 1;
        if self.pending >= self.options.commit_interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Open a stage timeline row.
    pub fn open_stage(
        &mut self,
        session: SessionId,
        stage: &str,
        start_pc: u32,
        snapshot: Option<SnapshotId>,
    ) -> Result<StageVisitId, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO boot_stages
                 (session_id, stage_name, start_time, start_pc, memory_snapshot_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session.0, stage, timestamp(), start_pc, snapshot.map(|id| id.0)],
        )?;
        Ok(StageVisitId(conn.last_insert_rowid()))
    }

    /// Close a stage timeline row.
    pub fn close_stage(
        &mut self,
        visit: StageVisitId,
        end_pc: u32,
        instruction_count: u64,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE boot_stages SET end_time = ?1, end_pc = ?2, instruction_count = ?3
             WHERE stage_id = ?4",
            params![timestamp(), end_pc, instruction_count as i64, visit.0],
        )?;
        Ok(())
    }

    /// Record a named performance metric.
    pub fn record_metric(
        &mut self,
        session: SessionId,
        name: &str,
        value: f64,
        unit: &str,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO performance_metrics (session_id, timestamp, metric_name, metric_value, unit)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session.0, timestamp(), name, value, unit],
        )?;
        Ok(())
    }

    /// Flush pending traces and stamp the session's end time.
    pub fn end_session(&mut self, session: SessionId) -> Result<(), StoreError> {
        self.flush()?;
        self.conn()?.execute(
            "UPDATE boot_sessions SET end_time = ?1 WHERE session_id = ?2",
            params![timestamp(), session.0],
        )?;
        info!("ended session {session}");
        Ok(())
    }

    /// Commit pending trace rows.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
            debug!("committed {} trace rows", self.pending);
        }
        self.pending = 0;
        Ok(())
    }

    /// Flush and release the connection. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.conn.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        let Some(conn) = self.conn.take() else {
            return flushed;
        };
        flushed?;
        conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
        Ok(())
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(err) = self.flush() {
                warn!("failed to flush snapshot store on drop: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(session: SessionId, sequence: u64, pc: u32) -> TraceRecord {
        TraceRecord {
            session,
            sequence,
            pc,
            instruction: vec![0; 4],
            disassembly: "instr_0x00000000".to_owned(),
            registers: RegisterFile::default(),
            stack_pointer: 0,
            function: "_start".to_owned(),
            stage: "camkes_init".to_owned(),
        }
    }

    #[test]
    fn label_addresses_are_parsed_from_suffix() {
        assert_eq!(label_start_address("stack_region_0x41000000"), 0x4100_0000);
        assert_eq!(label_start_address("uart_region_0x09000000"), 0x0900_0000);
        assert_eq!(label_start_address("pattern_painting_step_2"), 0);
        assert_eq!(label_start_address("broken_0xzz"), 0);
    }

    #[test]
    fn sequence_gaps_are_rejected() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("gap").unwrap();
        store.save_instruction_trace(&trace(session, 0, 0x4000_0000)).unwrap();
        let err = store
            .save_instruction_trace(&trace(session, 2, 0x4000_0004))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceGap { expected: 1, found: 2, .. }
        ));
        store.save_instruction_trace(&trace(session, 1, 0x4000_0004)).unwrap();
    }

    #[test]
    fn traces_commit_in_batches() {
        let options = StoreOptions {
            commit_interval: 3,
            ..StoreOptions::default()
        };
        let mut store = SnapshotStore::in_memory(options).unwrap();
        let session = store.start_session("batch").unwrap();
        for seq in 0..4 {
            store
                .save_instruction_trace(&trace(session, seq, 0x4000_0000 + seq as u32 * 4))
                .unwrap();
        }
        assert_eq!(store.pending_traces(), 1);
        store.save_memory_snapshot(session, "camkes_init", 0, &[]).unwrap();
        assert_eq!(store.pending_traces(), 0);
    }

    #[test]
    fn snapshot_total_size_is_sum_of_regions() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("sizes").unwrap();
        let regions = vec![
            ("stack_region_0x41000000".to_owned(), vec![0u8; 64]),
            ("uart_region_0x09000000".to_owned(), vec![0u8; 16]),
        ];
        let snapshot = store
            .save_memory_snapshot(session, "camkes_init", 0x4000_0000, &regions)
            .unwrap();
        let total: i64 = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT total_size FROM memory_snapshots WHERE snapshot_id = ?1",
                params![snapshot.0],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 80);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.start_session("late"), Err(StoreError::Closed)));
    }

    #[test]
    fn failed_commit_still_releases_the_connection() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("orphan").unwrap();
        store.save_instruction_trace(&trace(session, 0, 0x4000_0000)).unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch("PRAGMA defer_foreign_keys = ON")
            .unwrap();
        store
            .save_instruction_trace(&trace(SessionId(999), 0, 0x4000_0004))
            .unwrap();
        assert!(matches!(store.close(), Err(StoreError::Sqlite(_))));
        assert!(!store.is_open());
        store.close().unwrap();
    }
}
