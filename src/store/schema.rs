// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: SQLite schema for recorded boot sessions.
// Author: Lukas Bower

use rusqlite::Connection;

/// Tables and indexes, created idempotently.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS boot_sessions (
    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    description TEXT,
    qemu_version TEXT,
    freertos_version TEXT
);

CREATE TABLE IF NOT EXISTS memory_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES boot_sessions(session_id),
    timestamp TEXT NOT NULL,
    boot_stage TEXT NOT NULL,
    pc_address INTEGER NOT NULL,
    memory_regions TEXT NOT NULL,
    total_size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_regions (
    region_id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES memory_snapshots(snapshot_id),
    region_name TEXT NOT NULL,
    start_address INTEGER NOT NULL,
    end_address INTEGER NOT NULL,
    size INTEGER NOT NULL,
    data BLOB NOT NULL,
    expected_pattern INTEGER,
    pattern_matches INTEGER NOT NULL DEFAULT 0,
    checksum TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instruction_traces (
    trace_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES boot_sessions(session_id),
    sequence_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    pc_address INTEGER NOT NULL,
    instruction_bytes BLOB,
    disassembly TEXT,
    registers TEXT NOT NULL,
    stack_pointer INTEGER NOT NULL,
    function_name TEXT,
    boot_stage TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS boot_stages (
    stage_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES boot_sessions(session_id),
    stage_name TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    start_pc INTEGER NOT NULL,
    end_pc INTEGER,
    instruction_count INTEGER NOT NULL DEFAULT 0,
    memory_snapshot_id INTEGER REFERENCES memory_snapshots(snapshot_id)
);

CREATE TABLE IF NOT EXISTS performance_metrics (
    metric_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES boot_sessions(session_id),
    timestamp TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    metric_value REAL NOT NULL,
    unit TEXT
);

CREATE INDEX IF NOT EXISTS idx_snapshots_session ON memory_snapshots(session_id);
CREATE INDEX IF NOT EXISTS idx_traces_session ON instruction_traces(session_id);
CREATE INDEX IF NOT EXISTS idx_traces_pc ON instruction_traces(pc_address);
CREATE INDEX IF NOT EXISTS idx_regions_snapshot ON memory_regions(snapshot_id);
"#;

/// Create every table and index that does not exist yet.
pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        names
    }

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();
        assert_eq!(
            table_names(&conn),
            [
                "boot_sessions",
                "boot_stages",
                "instruction_traces",
                "memory_regions",
                "memory_snapshots",
                "performance_metrics",
            ]
        );
    }

    #[test]
    fn indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }
}
