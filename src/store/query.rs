// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Read-only queries over recorded boot sessions.
// Author: Lukas Bower

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};

use super::{SessionId, SnapshotId, SnapshotStore, StageVisitId, StoreError};
use crate::pattern::match_percentage;
use crate::stub::RegisterFile;

/// Session row with aggregate counts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Start timestamp.
    pub start_time: String,
    /// End timestamp, unset while recording.
    pub end_time: Option<String>,
    /// Free-text description.
    pub description: String,
    /// Target version string.
    pub qemu_version: String,
    /// Guest version string.
    pub freertos_version: String,
    /// Snapshots owned by the session.
    pub snapshot_count: u64,
    /// Trace rows owned by the session.
    pub instruction_count: u64,
}

/// Snapshot header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Snapshot identifier.
    pub id: SnapshotId,
    /// Capture timestamp.
    pub timestamp: String,
    /// Stage at capture time.
    pub boot_stage: String,
    /// Program counter at capture time.
    pub pc: u32,
    /// Sum of region sizes.
    pub total_size: u64,
    /// Region labels in capture order.
    pub regions: Vec<String>,
}

/// One stored region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRecord {
    /// Owning snapshot.
    pub snapshot: SnapshotId,
    /// Region label.
    pub name: String,
    /// Start address.
    pub start: u64,
    /// End address, exclusive.
    pub end: u64,
    /// Captured bytes.
    pub size: u64,
    /// Raw content.
    pub data: Vec<u8>,
    /// Expected painted word.
    pub expected_pattern: Option<u32>,
    /// Aligned pattern matches.
    pub pattern_matches: u64,
    /// Content digest.
    pub checksum: String,
}

impl RegionRecord {
    /// Share of words holding the expected pattern, in percent.
    #[must_use]
    pub fn match_percentage(&self) -> f64 {
        match_percentage(self.pattern_matches, self.size)
    }
}

/// Per-stage aggregate over the instruction trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    /// Stage name.
    pub stage: String,
    /// Trace rows tagged with the stage.
    pub instruction_count: u64,
    /// Lowest program counter seen.
    pub min_pc: u32,
    /// Highest program counter seen.
    pub max_pc: u32,
    /// Distinct resolved functions.
    pub function_count: u64,
    /// Sequence number of the first row in the stage.
    pub first_sequence: u64,
}

/// Per-function aggregate over the instruction trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStats {
    /// Resolved function name.
    pub function: String,
    /// Trace rows attributed to the function.
    pub calls: u64,
    /// Stages the function executed in.
    pub stages: Vec<String>,
}

/// One capture of a region across snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSample {
    /// Owning snapshot.
    pub snapshot: SnapshotId,
    /// Capture timestamp.
    pub timestamp: String,
    /// Stage at capture time.
    pub boot_stage: String,
    /// Program counter at capture time.
    pub pc: u32,
    /// Captured bytes.
    pub size: u64,
    /// Expected painted word.
    pub expected_pattern: Option<u32>,
    /// Aligned pattern matches.
    pub pattern_matches: u64,
    /// Content digest.
    pub checksum: String,
}

/// Difference between two consecutive captures of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionChange {
    /// Earlier snapshot.
    pub from: SnapshotId,
    /// Later snapshot.
    pub to: SnapshotId,
    /// Stage of the earlier snapshot.
    pub from_stage: String,
    /// Stage of the later snapshot.
    pub to_stage: String,
    /// Content changed between the captures.
    pub checksum_changed: bool,
    /// Change in pattern matches.
    pub match_delta: i64,
}

/// Captures of one region plus consecutive differences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionHistory {
    /// Captures ordered by time.
    pub samples: Vec<RegionSample>,
    /// `samples.len() - 1` pairwise differences.
    pub changes: Vec<RegionChange>,
}

/// Pattern coverage of a region at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionPoint {
    /// Capture timestamp.
    pub timestamp: String,
    /// Stage at capture time.
    pub boot_stage: String,
    /// Captured bytes.
    pub size: u64,
    /// Aligned pattern matches.
    pub pattern_matches: u64,
    /// Share of matching words, in percent.
    pub match_percentage: f64,
}

/// Stored trace row.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    /// Sequence number.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: String,
    /// Program counter.
    pub pc: u32,
    /// Raw instruction bytes.
    pub instruction: Vec<u8>,
    /// Disassembly text.
    pub disassembly: String,
    /// Decoded registers.
    pub registers: RegisterFile,
    /// Stack pointer.
    pub stack_pointer: u32,
    /// Resolved function name.
    pub function: String,
    /// Boot stage.
    pub stage: String,
}

/// One stage visit on the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageVisit {
    /// Timeline row identifier.
    pub id: StageVisitId,
    /// Stage name.
    pub stage: String,
    /// Entry timestamp.
    pub start_time: String,
    /// Exit timestamp, unset while open.
    pub end_time: Option<String>,
    /// Program counter on entry.
    pub start_pc: u32,
    /// Last program counter in the stage.
    pub end_pc: Option<u32>,
    /// Instructions executed during the visit.
    pub instruction_count: u64,
    /// Snapshot captured on entry.
    pub snapshot: Option<SnapshotId>,
}

/// Stored performance metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    /// Recording timestamp.
    pub timestamp: String,
    /// Metric name.
    pub name: String,
    /// Metric value.
    pub value: f64,
    /// Unit label.
    pub unit: String,
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionInfo> {
    Ok(SessionInfo {
        id: SessionId(row.get(0)?),
        start_time: row.get(1)?,
        end_time: row.get(2)?,
        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        qemu_version: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        freertos_version: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        snapshot_count: row.get::<_, i64>(6)? as u64,
        instruction_count: row.get::<_, i64>(7)? as u64,
    })
}

const SESSION_SELECT: &str = "SELECT s.session_id, s.start_time, s.end_time, s.description,
        s.qemu_version, s.freertos_version,
        (SELECT COUNT(*) FROM memory_snapshots m WHERE m.session_id = s.session_id),
        (SELECT COUNT(*) FROM instruction_traces t WHERE t.session_id = s.session_id)
     FROM boot_sessions s";

impl SnapshotStore {
    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT} ORDER BY s.start_time DESC, s.session_id DESC"
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// One session, if it exists.
    pub fn session(&self, id: SessionId) -> Result<Option<SessionInfo>, StoreError> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                &format!("{SESSION_SELECT} WHERE s.session_id = ?1"),
                params![id.0],
                session_from_row,
            )
            .optional()?;
        Ok(info)
    }

    /// Snapshot headers of a session in capture order.
    pub fn session_snapshots(&self, id: SessionId) -> Result<Vec<SnapshotInfo>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, timestamp, boot_stage, pc_address, total_size, memory_regions
             FROM memory_snapshots WHERE session_id = ?1
             ORDER BY timestamp, snapshot_id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                SnapshotId(row.get(0)?),
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            let (id, timestamp, boot_stage, pc, total_size, regions) = row?;
            snapshots.push(SnapshotInfo {
                id,
                timestamp,
                boot_stage,
                pc,
                total_size: total_size as u64,
                regions: serde_json::from_str(&regions)?,
            });
        }
        Ok(snapshots)
    }

    /// Regions stored for one snapshot, in capture order.
    pub fn snapshot_regions(&self, snapshot: SnapshotId) -> Result<Vec<RegionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, region_name, start_address, end_address, size, data,
                    expected_pattern, pattern_matches, checksum
             FROM memory_regions WHERE snapshot_id = ?1 ORDER BY region_id",
        )?;
        let rows = stmt.query_map(params![snapshot.0], |row| {
            Ok(RegionRecord {
                snapshot: SnapshotId(row.get(0)?),
                name: row.get(1)?,
                start: row.get::<_, i64>(2)? as u64,
                end: row.get::<_, i64>(3)? as u64,
                size: row.get::<_, i64>(4)? as u64,
                data: row.get(5)?,
                expected_pattern: row.get(6)?,
                pattern_matches: row.get::<_, i64>(7)? as u64,
                checksum: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Trace aggregates per stage, in order of first appearance.
    pub fn stage_summaries(&self, id: SessionId) -> Result<Vec<StageSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT boot_stage, COUNT(*), MIN(pc_address), MAX(pc_address),
                    COUNT(DISTINCT function_name), MIN(sequence_number)
             FROM instruction_traces WHERE session_id = ?1
             GROUP BY boot_stage ORDER BY MIN(sequence_number)",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok(StageSummary {
                stage: row.get(0)?,
                instruction_count: row.get::<_, i64>(1)? as u64,
                min_pc: row.get(2)?,
                max_pc: row.get(3)?,
                function_count: row.get::<_, i64>(4)? as u64,
                first_sequence: row.get::<_, i64>(5)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Trace aggregates per function, most executed first.
    pub fn function_stats(&self, id: SessionId) -> Result<Vec<FunctionStats>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT function_name, COUNT(*), GROUP_CONCAT(DISTINCT boot_stage)
             FROM instruction_traces WHERE session_id = ?1
             GROUP BY function_name ORDER BY COUNT(*) DESC, function_name",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            let stages: Option<String> = row.get(2)?;
            let mut stages: Vec<String> = stages
                .unwrap_or_default()
                .split(',')
                .filter(|stage| !stage.is_empty())
                .map(str::to_owned)
                .collect();
            stages.sort();
            Ok(FunctionStats {
                function: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                calls: row.get::<_, i64>(1)? as u64,
                stages,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every capture of `region_name` within a session, with pairwise changes.
    pub fn region_history(
        &self,
        id: SessionId,
        region_name: &str,
    ) -> Result<RegionHistory, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.snapshot_id, s.timestamp, s.boot_stage, s.pc_address, r.size,
                    r.expected_pattern, r.pattern_matches, r.checksum
             FROM memory_regions r JOIN memory_snapshots s ON r.snapshot_id = s.snapshot_id
             WHERE s.session_id = ?1 AND r.region_name = ?2
             ORDER BY s.timestamp, s.snapshot_id",
        )?;
        let samples = stmt
            .query_map(params![id.0, region_name], |row| {
                Ok(RegionSample {
                    snapshot: SnapshotId(row.get(0)?),
                    timestamp: row.get(1)?,
                    boot_stage: row.get(2)?,
                    pc: row.get(3)?,
                    size: row.get::<_, i64>(4)? as u64,
                    expected_pattern: row.get(5)?,
                    pattern_matches: row.get::<_, i64>(6)? as u64,
                    checksum: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let changes = samples
            .windows(2)
            .map(|pair| RegionChange {
                from: pair[0].snapshot,
                to: pair[1].snapshot,
                from_stage: pair[0].boot_stage.clone(),
                to_stage: pair[1].boot_stage.clone(),
                checksum_changed: pair[0].checksum != pair[1].checksum,
                match_delta: pair[1].pattern_matches as i64 - pair[0].pattern_matches as i64,
            })
            .collect();
        Ok(RegionHistory { samples, changes })
    }

    /// Pattern coverage of every region over time, keyed by region label.
    pub fn memory_evolution(
        &self,
        id: SessionId,
    ) -> Result<BTreeMap<String, Vec<EvolutionPoint>>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.region_name, s.timestamp, s.boot_stage, r.size, r.pattern_matches
             FROM memory_regions r JOIN memory_snapshots s ON r.snapshot_id = s.snapshot_id
             WHERE s.session_id = ?1
             ORDER BY r.region_name, s.timestamp, s.snapshot_id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            let size = row.get::<_, i64>(3)? as u64;
            let matches = row.get::<_, i64>(4)? as u64;
            Ok((
                row.get::<_, String>(0)?,
                EvolutionPoint {
                    timestamp: row.get(1)?,
                    boot_stage: row.get(2)?,
                    size,
                    pattern_matches: matches,
                    match_percentage: match_percentage(matches, size),
                },
            ))
        })?;
        let mut evolution: BTreeMap<String, Vec<EvolutionPoint>> = BTreeMap::new();
        for row in rows {
            let (name, point) = row?;
            evolution.entry(name).or_default().push(point);
        }
        Ok(evolution)
    }

    /// Trace rows of a session in sequence order.
    pub fn trace_entries(&self, id: SessionId) -> Result<Vec<TraceEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence_number, timestamp, pc_address, instruction_bytes, disassembly,
                    registers, stack_pointer, function_name, boot_stage
             FROM instruction_traces WHERE session_id = ?1 ORDER BY sequence_number",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (sequence, timestamp, pc, instruction, disassembly, registers, sp, function, stage) =
                row?;
            entries.push(TraceEntry {
                sequence: sequence as u64,
                timestamp,
                pc,
                instruction: instruction.unwrap_or_default(),
                disassembly: disassembly.unwrap_or_default(),
                registers: serde_json::from_str(&registers)?,
                stack_pointer: sp,
                function: function.unwrap_or_default(),
                stage,
            });
        }
        Ok(entries)
    }

    /// Stage visits of a session in entry order.
    pub fn stage_timeline(&self, id: SessionId) -> Result<Vec<StageVisit>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT stage_id, stage_name, start_time, end_time, start_pc, end_pc,
                    instruction_count, memory_snapshot_id
             FROM boot_stages WHERE session_id = ?1 ORDER BY stage_id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok(StageVisit {
                id: StageVisitId(row.get(0)?),
                stage: row.get(1)?,
                start_time: row.get(2)?,
                end_time: row.get(3)?,
                start_pc: row.get(4)?,
                end_pc: row.get(5)?,
                instruction_count: row.get::<_, i64>(6)? as u64,
                snapshot: row.get::<_, Option<i64>>(7)?.map(SnapshotId),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Performance metrics of a session in recording order.
    pub fn metrics(&self, id: SessionId) -> Result<Vec<MetricRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, metric_name, metric_value, unit
             FROM performance_metrics WHERE session_id = ?1 ORDER BY metric_id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok(MetricRecord {
                timestamp: row.get(0)?,
                name: row.get(1)?,
                value: row.get(2)?,
                unit: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreOptions, TraceRecord};

    fn record(session: SessionId, sequence: u64, pc: u32, function: &str, stage: &str) -> TraceRecord {
        TraceRecord {
            session,
            sequence,
            pc,
            instruction: vec![0x00, 0x00, 0xa0, 0xe1],
            disassembly: "mov r0, r0".to_owned(),
            registers: [("r15".to_owned(), pc)].into_iter().collect(),
            stack_pointer: 0x4100_0ff0,
            function: function.to_owned(),
            stage: stage.to_owned(),
        }
    }

    #[test]
    fn stage_and_function_aggregates() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("aggregates").unwrap();
        let rows = [
            (0x6000_0000, "loader", "elfloader"),
            (0x6000_0004, "loader", "elfloader"),
            (0x4000_0000, "_start", "camkes_init"),
            (0x4000_0010, "_start", "camkes_init"),
            (0x4000_0e70, "main", "camkes_init"),
        ];
        for (seq, (pc, function, stage)) in rows.into_iter().enumerate() {
            store
                .save_instruction_trace(&record(session, seq as u64, pc, function, stage))
                .unwrap();
        }

        let stages = store.stage_summaries(session).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage, "elfloader");
        assert_eq!(stages[0].instruction_count, 2);
        assert_eq!(stages[1].min_pc, 0x4000_0000);
        assert_eq!(stages[1].max_pc, 0x4000_0e70);
        assert_eq!(stages[1].function_count, 2);
        assert_eq!(stages[1].first_sequence, 2);

        let functions = store.function_stats(session).unwrap();
        assert_eq!(functions[0].function, "_start");
        assert_eq!(functions[0].calls, 2);
        assert_eq!(functions[0].stages, ["camkes_init"]);

        let entries = store.trace_entries(session).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].registers.pc(), Some(0x4000_0e70));
    }

    #[test]
    fn region_history_reports_changes() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("history").unwrap();
        let label = "stack_region_0x41000000".to_owned();
        let blank = vec![0u8; 16];
        let painted = 0xDEAD_BEEFu32.to_le_bytes().repeat(4);
        store
            .save_memory_snapshot(session, "camkes_init", 0x4000_0000, &[(label.clone(), blank.clone())])
            .unwrap();
        store
            .save_memory_snapshot(session, "camkes_init", 0x4000_0100, &[(label.clone(), blank)])
            .unwrap();
        store
            .save_memory_snapshot(session, "pattern_painting", 0x4000_0900, &[(label.clone(), painted)])
            .unwrap();

        let history = store.region_history(session, &label).unwrap();
        assert_eq!(history.samples.len(), 3);
        assert_eq!(history.changes.len(), 2);
        assert!(!history.changes[0].checksum_changed);
        assert_eq!(history.changes[0].match_delta, 0);
        assert!(history.changes[1].checksum_changed);
        assert_eq!(history.changes[1].match_delta, 4);
        assert_eq!(history.changes[1].to_stage, "pattern_painting");

        let evolution = store.memory_evolution(session).unwrap();
        let points = &evolution[&label];
        assert_eq!(points.len(), 3);
        assert_eq!(points[2].match_percentage, 100.0);

        let regions = store.snapshot_regions(history.samples[2].snapshot).unwrap();
        assert_eq!(regions[0].start, 0x4100_0000);
        assert_eq!(regions[0].end, 0x4100_0010);
        assert_eq!(regions[0].expected_pattern, Some(0xDEAD_BEEF));
    }

    #[test]
    fn sessions_are_listed_newest_first() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let first = store.start_session("first").unwrap();
        let second = store.start_session("second").unwrap();
        store.end_session(first).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions[0].id, second);
        assert_eq!(sessions[1].id, first);
        assert!(sessions[1].end_time.is_some());
        assert!(sessions[0].end_time.is_none());
        assert_eq!(sessions[0].qemu_version, "QEMU ARM virt");
        assert!(store.session(SessionId(999)).unwrap().is_none());
    }

    #[test]
    fn timeline_and_metrics_round_trip() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("timeline").unwrap();
        let visit = store.open_stage(session, "elfloader", 0x6000_0000, None).unwrap();
        store.close_stage(visit, 0x6000_0040, 17).unwrap();
        store.open_stage(session, "unknown", 0x10, None).unwrap();
        store
            .record_metric(session, "instructions_recorded", 17.0, "count")
            .unwrap();

        let timeline = store.stage_timeline(session).unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].end_pc, Some(0x6000_0040));
        assert_eq!(timeline[0].instruction_count, 17);
        assert!(timeline[1].end_time.is_none());

        let metrics = store.metrics(session).unwrap();
        assert_eq!(metrics[0].name, "instructions_recorded");
        assert_eq!(metrics[0].value, 17.0);
        assert_eq!(metrics[0].unit, "count");
    }
}
