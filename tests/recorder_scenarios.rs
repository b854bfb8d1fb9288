// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Recording scenarios driven by the scripted debug stub.
// Author: Lukas Bower

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bootsnap::{
    BootRecorder, RecorderConfig, RecorderError, RecorderState, RegionSpec, ScriptedStub,
    SnapshotStore, StageRange, StageTable, StopReason,
};
use rusqlite::Connection;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_store(dir: &TempDir, config: &RecorderConfig) -> SnapshotStore {
    SnapshotStore::open(dir.path().join("boot.db"), config.store_options()).unwrap()
}

fn reopen(dir: &TempDir) -> SnapshotStore {
    let config = RecorderConfig::default();
    open_store(dir, &config)
}

fn config_with_budget(max_instructions: u64) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.recording.max_instructions = max_instructions;
    config
}

#[test]
fn zero_budget_yields_closed_empty_session() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config_with_budget(0);
    let store = open_store(&dir, &config);
    let mut recorder = BootRecorder::new(ScriptedStub::new([0x6000_0000]), store, config);
    let summary = recorder.run().unwrap();
    assert_eq!(summary.instructions, 0);
    assert_eq!(summary.stop, Some(StopReason::BudgetExhausted));
    let session = summary.session.unwrap();

    let store = reopen(&dir);
    let info = store.session(session).unwrap().unwrap();
    assert!(info.end_time.is_some());
    assert_eq!(info.instruction_count, 0);
    assert_eq!(info.snapshot_count, 0);
    let metrics = store.metrics(session).unwrap();
    assert_eq!(metrics[0].name, "instructions_recorded");
    assert_eq!(metrics[0].value, 0.0);
}

#[test]
fn entering_a_stage_once_takes_exactly_one_snapshot() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut config = config_with_budget(50);
    config.stages = StageTable::new([StageRange::new("freertos_main", 0x4000_0e70, 0x4000_1000)]);
    let mut pcs = vec![0x10, 0x14];
    pcs.extend((0..10).map(|n| 0x4000_0e70 + n * 4));
    let store = open_store(&dir, &config);
    let mut recorder = BootRecorder::new(ScriptedStub::new(pcs), store, config);
    let summary = recorder.run().unwrap();
    assert_eq!(summary.stop, Some(StopReason::StepFailed));
    assert_eq!(summary.instructions, 12);

    let store = reopen(&dir);
    let session = summary.session.unwrap();
    let snapshots = store.session_snapshots(session).unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].boot_stage, "freertos_main");
    assert_eq!(snapshots[0].pc, 0x4000_0e70);

    let entries = store.trace_entries(session).unwrap();
    assert_eq!(entries[0].stage, "unknown");
    assert_eq!(entries[2].stage, "freertos_main");
    assert_eq!(entries[2].function, "_start");
}

#[test]
fn step_failure_keeps_every_trace_row_written_so_far() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config_with_budget(1000);
    let pcs = (0..100).map(|n| 0x6000_0000 + n * 4);
    let store = open_store(&dir, &config);
    let stub = ScriptedStub::new(pcs).fail_step_at(37);
    let mut recorder = BootRecorder::new(stub, store, config);
    let summary = recorder.run().unwrap();
    assert_eq!(summary.stop, Some(StopReason::StepFailed));
    assert_eq!(recorder.state(), RecorderState::Finished(StopReason::StepFailed));

    let store = reopen(&dir);
    let session = summary.session.unwrap();
    let entries = store.trace_entries(session).unwrap();
    assert_eq!(entries.len(), 37);
    let sequences: Vec<u64> = entries.iter().map(|entry| entry.sequence).collect();
    assert_eq!(sequences, (0..37).collect::<Vec<u64>>());
    assert!(store.session(session).unwrap().unwrap().end_time.is_some());
}

#[test]
fn unreadable_memory_does_not_stop_recording() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config_with_budget(4);
    let pcs = (0..8).map(|n| 0x6000_0000 + n * 4);
    let store = open_store(&dir, &config);
    let mut recorder = BootRecorder::new(ScriptedStub::new(pcs), store, config);
    let summary = recorder.run().unwrap();
    assert_eq!(summary.instructions, 4);

    let store = reopen(&dir);
    let session = summary.session.unwrap();
    let entries = store.trace_entries(session).unwrap();
    assert!(entries.iter().all(|entry| entry.instruction.is_empty()));
    assert!(entries.iter().all(|entry| entry.disassembly == "invalid"));
    let snapshots = store.session_snapshots(session).unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].total_size, 0);
    assert!(snapshots[0].regions.is_empty());
}

#[test]
fn painted_stack_is_fully_matched() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut config = config_with_budget(2);
    config.regions = vec![RegionSpec::new("stack_region", 0x4100_0000, 0x2000)];
    let painted = 0xDEAD_BEEFu32.to_le_bytes().repeat(2048);
    let code = 0xe1a0_0000u32.to_le_bytes().repeat(4);
    let stub = ScriptedStub::new([0x6000_0000, 0x6000_0004, 0x6000_0008])
        .with_memory(0x4100_0000, painted)
        .with_memory(0x6000_0000, code);
    let store = open_store(&dir, &config);
    let mut recorder = BootRecorder::new(stub, store, config);
    let summary = recorder.run().unwrap();

    let store = reopen(&dir);
    let session = summary.session.unwrap();
    let snapshots = store.session_snapshots(session).unwrap();
    assert_eq!(snapshots[0].regions, ["stack_region_0x41000000"]);
    let regions = store.snapshot_regions(snapshots[0].id).unwrap();
    assert_eq!(regions[0].pattern_matches, 2048);
    assert_eq!(regions[0].match_percentage(), 100.0);
    assert_eq!(regions[0].start, 0x4100_0000);
    assert_eq!(regions[0].end, 0x4100_2000);

    let entries = store.trace_entries(session).unwrap();
    assert_eq!(entries[0].disassembly, "mov r0, r0");
    assert_eq!(entries[0].stack_pointer, 0x4100_0ff0);
}

#[test]
fn interruption_ends_the_session_cleanly() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config_with_budget(1000);
    let flag = Arc::new(AtomicBool::new(false));
    let pcs = (0..500).map(|n| 0x6000_0000 + n * 4);
    let stub = ScriptedStub::new(pcs).cancel_after(10, Arc::clone(&flag));
    let store = open_store(&dir, &config);
    let mut recorder = BootRecorder::new(stub, store, config).with_cancel_flag(flag);
    let summary = recorder.run().unwrap();
    assert_eq!(summary.stop, Some(StopReason::Interrupted));
    assert_eq!(recorder.state(), RecorderState::Finished(StopReason::Interrupted));

    let store = reopen(&dir);
    let session = summary.session.unwrap();
    assert_eq!(store.trace_entries(session).unwrap().len(), 10);
    let timeline = store.stage_timeline(session).unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].instruction_count, 10);
    assert!(timeline[0].end_time.is_some());
}

#[test]
fn refused_stub_connection_is_reported() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config_with_budget(10);
    let store = open_store(&dir, &config);
    let stub = ScriptedStub::new([0x6000_0000]).refuse_connection();
    let mut recorder = BootRecorder::new(stub, store, config);
    assert!(matches!(recorder.run(), Err(RecorderError::StubUnavailable)));

    let store = reopen(&dir);
    assert!(store.list_sessions().unwrap().is_empty());
}

#[test]
fn store_failure_mid_recording_still_closes_the_session() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config_with_budget(20);
    let store = open_store(&dir, &config);
    Connection::open(dir.path().join("boot.db"))
        .unwrap()
        .execute_batch("DROP TABLE instruction_traces")
        .unwrap();
    let pcs = (0..20).map(|n| 0x6000_0000 + n * 4);
    let mut recorder = BootRecorder::new(ScriptedStub::new(pcs), store, config);
    assert!(matches!(recorder.run(), Err(RecorderError::Store(_))));
    assert_eq!(recorder.state(), RecorderState::Failed);
    assert!(!recorder.store().is_open());
    let session = recorder.session().unwrap();
    let (stub, _) = recorder.into_parts();
    assert_eq!(stub.close_calls(), 1);
    assert_eq!(stub.steps(), 0);

    let end_time: Option<String> = Connection::open(dir.path().join("boot.db"))
        .unwrap()
        .query_row(
            "SELECT end_time FROM boot_sessions WHERE session_id = ?1",
            [session.0],
            |row| row.get(0),
        )
        .unwrap();
    assert!(end_time.is_some());
}
