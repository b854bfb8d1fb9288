// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Plain-text rendering of recorded boot sessions.
// Author: Lukas Bower

//! Plain-text analysis reports over the snapshot store.

use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{anyhow, Context, Result};

use crate::store::{
    EvolutionPoint, FunctionStats, MetricRecord, RegionHistory, SessionId, SessionInfo,
    SnapshotInfo, SnapshotStore, StageSummary, StageVisit,
};

/// What the `--analyze` command should print.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Session to analyse; all sessions are listed when unset.
    pub session: Option<SessionId>,
    /// Region label whose captures should be compared.
    pub compare_region: Option<String>,
    /// Print pattern coverage per region over time.
    pub memory_evolution: bool,
}

/// Render the report selected by `request` into `out`.
pub fn analyze<W: Write>(store: &SnapshotStore, request: &AnalysisRequest, out: &mut W) -> Result<()> {
    let Some(session) = request.session else {
        let sessions = store.list_sessions().context("failed to list sessions")?;
        render_sessions(out, &sessions)?;
        return Ok(());
    };
    let info = store
        .session(session)?
        .ok_or_else(|| anyhow!("session {session} not found"))?;

    if request.memory_evolution {
        render_memory_evolution(out, session, &store.memory_evolution(session)?)?;
    }
    if let Some(region) = &request.compare_region {
        render_region_comparison(out, region, &store.region_history(session, region)?)?;
    }
    if !request.memory_evolution && request.compare_region.is_none() {
        render_session_header(out, &info)?;
        render_snapshots(out, &store.session_snapshots(session)?)?;
        render_stage_summaries(out, &store.stage_summaries(session)?)?;
        render_stage_timeline(out, &store.stage_timeline(session)?)?;
        render_function_stats(out, &store.function_stats(session)?)?;
        render_metrics(out, &store.metrics(session)?)?;
    }
    Ok(())
}

/// List sessions with their counts.
pub fn render_sessions<W: Write>(out: &mut W, sessions: &[SessionInfo]) -> io::Result<()> {
    writeln!(out, "Found {} boot sessions:", sessions.len())?;
    for session in sessions {
        writeln!(out, "  Session {}: {}", session.id, session.start_time)?;
        writeln!(out, "    Description: {}", session.description)?;
        writeln!(
            out,
            "    Snapshots: {}, Instructions: {}",
            session.snapshot_count, session.instruction_count
        )?;
    }
    Ok(())
}

fn render_session_header<W: Write>(out: &mut W, session: &SessionInfo) -> io::Result<()> {
    writeln!(out, "Boot analysis for session {}:", session.id)?;
    writeln!(out, "  Started: {}", session.start_time)?;
    writeln!(
        out,
        "  Ended: {}",
        session.end_time.as_deref().unwrap_or("(still open)")
    )?;
    writeln!(out, "  Target: {} / {}", session.qemu_version, session.freertos_version)?;
    writeln!(out, "  Instructions: {}", session.instruction_count)
}

/// Snapshot headers.
pub fn render_snapshots<W: Write>(out: &mut W, snapshots: &[SnapshotInfo]) -> io::Result<()> {
    writeln!(out, "  Snapshots: {}", snapshots.len())?;
    for snapshot in snapshots {
        writeln!(
            out,
            "    #{} {} pc=0x{:08x} {} bytes in {} regions",
            snapshot.id,
            snapshot.boot_stage,
            snapshot.pc,
            snapshot.total_size,
            snapshot.regions.len()
        )?;
    }
    Ok(())
}

/// Per-stage trace aggregates.
pub fn render_stage_summaries<W: Write>(out: &mut W, stages: &[StageSummary]) -> io::Result<()> {
    writeln!(out, "  Stages: {}", stages.len())?;
    for stage in stages {
        writeln!(
            out,
            "    {:<20} {:>8} instr  pc 0x{:08x}..0x{:08x}  {} functions",
            stage.stage, stage.instruction_count, stage.min_pc, stage.max_pc, stage.function_count
        )?;
    }
    Ok(())
}

fn render_stage_timeline<W: Write>(out: &mut W, visits: &[StageVisit]) -> io::Result<()> {
    if visits.is_empty() {
        return Ok(());
    }
    writeln!(out, "  Timeline:")?;
    for visit in visits {
        let snapshot = visit
            .snapshot
            .map_or_else(|| "-".to_owned(), |id| format!("#{id}"));
        writeln!(
            out,
            "    {} {} at 0x{:08x} for {} instr (snapshot {snapshot})",
            visit.start_time, visit.stage, visit.start_pc, visit.instruction_count
        )?;
    }
    Ok(())
}

/// Function execution counts.
pub fn render_function_stats<W: Write>(out: &mut W, functions: &[FunctionStats]) -> io::Result<()> {
    if functions.is_empty() {
        return Ok(());
    }
    writeln!(out, "  Functions:")?;
    for function in functions {
        writeln!(
            out,
            "    {:<28} {:>8}  [{}]",
            function.function,
            function.calls,
            function.stages.join(", ")
        )?;
    }
    Ok(())
}

fn render_metrics<W: Write>(out: &mut W, metrics: &[MetricRecord]) -> io::Result<()> {
    for metric in metrics {
        writeln!(out, "  {}: {:.1} {}", metric.name, metric.value, metric.unit)?;
    }
    Ok(())
}

/// Capture count and latest pattern coverage per region.
pub fn render_memory_evolution<W: Write>(
    out: &mut W,
    session: SessionId,
    evolution: &BTreeMap<String, Vec<EvolutionPoint>>,
) -> io::Result<()> {
    writeln!(out, "Memory evolution analysis for session {session}:")?;
    for (region, points) in evolution {
        writeln!(out, "  {region}: {} snapshots", points.len())?;
        if let Some(latest) = points.last() {
            writeln!(out, "    Latest: {:.1}% pattern match", latest.match_percentage)?;
        }
    }
    Ok(())
}

/// Consecutive differences between captures of one region.
pub fn render_region_comparison<W: Write>(
    out: &mut W,
    region: &str,
    history: &RegionHistory,
) -> io::Result<()> {
    writeln!(
        out,
        "Memory region comparison: {region} ({} captures)",
        history.samples.len()
    )?;
    for change in &history.changes {
        let verdict = if change.checksum_changed {
            "Changed"
        } else {
            "No change"
        };
        writeln!(
            out,
            "  {} -> {}: {verdict} ({:+} pattern matches)",
            change.from_stage, change.to_stage, change.match_delta
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    fn render(store: &SnapshotStore, request: &AnalysisRequest) -> String {
        let mut out = Vec::new();
        analyze(store, request, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn lists_sessions_without_a_session_id() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        store.start_session("cold boot").unwrap();
        let text = render(&store, &AnalysisRequest::default());
        assert!(text.starts_with("Found 1 boot sessions:"));
        assert!(text.contains("Description: cold boot"));
    }

    #[test]
    fn default_report_covers_snapshots_and_stages() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("report").unwrap();
        store
            .save_memory_snapshot(
                session,
                "elfloader",
                0x6000_0000,
                &[("guest_base_0x40000000".to_owned(), vec![0; 8])],
            )
            .unwrap();
        let text = render(
            &store,
            &AnalysisRequest {
                session: Some(session),
                ..AnalysisRequest::default()
            },
        );
        assert!(text.contains("Boot analysis for session"));
        assert!(text.contains("elfloader pc=0x60000000 8 bytes in 1 regions"));
        assert!(text.contains("Stages: 0"));
    }

    #[test]
    fn region_comparison_reports_changes() {
        let mut store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let session = store.start_session("compare").unwrap();
        let label = "heap_region_0x41400000".to_owned();
        store
            .save_memory_snapshot(session, "camkes_init", 0, &[(label.clone(), vec![0; 8])])
            .unwrap();
        let painted = 0xCAFE_BABEu32.to_le_bytes().repeat(2);
        store
            .save_memory_snapshot(session, "pattern_painting", 0, &[(label.clone(), painted)])
            .unwrap();
        let text = render(
            &store,
            &AnalysisRequest {
                session: Some(session),
                compare_region: Some(label),
                memory_evolution: true,
            },
        );
        assert!(text.contains("camkes_init -> pattern_painting: Changed (+2 pattern matches)"));
        assert!(text.contains("Latest: 100.0% pattern match"));
        assert!(!text.contains("Boot analysis"));
    }

    #[test]
    fn unknown_session_is_an_error() {
        let store = SnapshotStore::in_memory(StoreOptions::default()).unwrap();
        let request = AnalysisRequest {
            session: Some(SessionId(42)),
            ..AnalysisRequest::default()
        };
        let err = analyze(&store, &request, &mut Vec::<u8>::new()).unwrap_err();
        assert!(err.to_string().contains("session 42 not found"));
    }
}
