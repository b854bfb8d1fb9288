// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Single-step boot recorder driving a debug stub into the snapshot store.
// Author: Lukas Bower

//! Boot recorder.
//!
//! The recorder moves through `Idle -> Recording -> Finished | Failed`. Each step reads the register file, fetches and disassembles the
//! instruction at the program counter, classifies the boot stage, snapshots
//! memory on stage entry, appends a trace row and single-steps the target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::RecorderConfig;
use crate::disasm::{ArmDisassembler, Disassembler};
use crate::store::{SessionId, SnapshotId, SnapshotStore, StageVisitId, StoreError, TraceRecord};
use crate::stub::DebugStub;

/// Bytes fetched at the program counter for each trace row.
const INSTRUCTION_BYTES: u32 = 4;

/// Errors surfaced by the recorder.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The debug stub refused the connection.
    #[error("debug stub unavailable")]
    StubUnavailable,
    /// `record` was called before a successful `start`.
    #[error("recording has not been started")]
    NotStarted,
    /// `start` was called twice.
    #[error("recording already started")]
    AlreadyStarted,
    /// Persisting recorded data failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why the capture loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The instruction budget was used up.
    BudgetExhausted,
    /// The stub did not report a trap stop after a single step.
    StepFailed,
    /// The cancellation flag was raised.
    Interrupted,
}

/// Recorder lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Not started yet.
    Idle,
    /// Session open, capture loop may run.
    Recording,
    /// Loop ended without a store error.
    Finished(StopReason),
    /// A store error ended the loop.
    Failed,
}

/// Outcome of a recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    /// Session written, if one was started.
    pub session: Option<SessionId>,
    /// Trace rows written.
    pub instructions: u64,
    /// Snapshots written.
    pub snapshots: u64,
    /// Why the loop stopped, if it ran.
    pub stop: Option<StopReason>,
    /// Wall-clock time spent recording.
    pub elapsed: Duration,
}

impl RecordingSummary {
    /// Recorded instructions per second of wall-clock time.
    #[must_use]
    pub fn instructions_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.instructions as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenVisit {
    id: StageVisitId,
    entered_at: u64,
}

/// Boot recorder over a debug stub `S` and disassembler `D`.
pub struct BootRecorder<S: DebugStub, D: Disassembler = ArmDisassembler> {
    stub: S,
    store: SnapshotStore,
    disassembler: D,
    config: RecorderConfig,
    cancel: Arc<AtomicBool>,
    state: RecorderState,
    session: Option<SessionId>,
    current_stage: Option<String>,
    stage_snapshots: HashMap<String, SnapshotId>,
    visit: Option<OpenVisit>,
    last_pc: u32,
    instructions: u64,
    snapshots: u64,
    stop: Option<StopReason>,
    started: Option<Instant>,
    elapsed: Duration,
    finished: bool,
}

impl<S: DebugStub> BootRecorder<S> {
    /// Create a recorder with the built-in ARM disassembler.
    pub fn new(stub: S, store: SnapshotStore, config: RecorderConfig) -> Self {
        Self {
            stub,
            store,
            disassembler: ArmDisassembler,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            state: RecorderState::Idle,
            session: None,
            current_stage: None,
            stage_snapshots: HashMap::new(),
            visit: None,
            last_pc: 0,
            instructions: 0,
            snapshots: 0,
            stop: None,
            started: None,
            elapsed: Duration::ZERO,
            finished: false,
        }
    }
}

impl<S: DebugStub, D: Disassembler> BootRecorder<S, D> {
    /// Swap the disassembler.
    pub fn with_disassembler<D2: Disassembler>(self, disassembler: D2) -> BootRecorder<S, D2> {
        BootRecorder {
            stub: self.stub,
            store: self.store,
            disassembler,
            config: self.config,
            cancel: self.cancel,
            state: self.state,
            session: self.session,
            current_stage: self.current_stage,
            stage_snapshots: self.stage_snapshots,
            visit: self.visit,
            last_pc: self.last_pc,
            instructions: self.instructions,
            snapshots: self.snapshots,
            stop: self.stop,
            started: self.started,
            elapsed: self.elapsed,
            finished: self.finished,
        }
    }

    /// Share an externally owned cancellation flag.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Handle that stops the loop at the next step when set.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Session being recorded.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Snapshot captured on entry to each visited stage.
    #[must_use]
    pub fn stage_snapshots(&self) -> &HashMap<String, SnapshotId> {
        &self.stage_snapshots
    }

    /// Borrow the store, e.g. to query after a run.
    #[must_use]
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Consume the recorder, returning the stub and store.
    pub fn into_parts(self) -> (S, SnapshotStore) {
        (self.stub, self.store)
    }

    /// Connect to the stub and open a session.
    pub fn start(&mut self) -> Result<SessionId, RecorderError> {
        if self.state != RecorderState::Idle {
            return Err(RecorderError::AlreadyStarted);
        }
        if !self.stub.connect() {
            warn!("debug stub refused connection");
            return Err(RecorderError::StubUnavailable);
        }
        let session = match self.store.start_session(&self.config.recording.description) {
            Ok(session) => session,
            Err(err) => {
                self.state = RecorderState::Failed;
                return Err(err.into());
            }
        };
        self.session = Some(session);
        self.started = Some(Instant::now());
        self.state = RecorderState::Recording;
        info!(
            "recording session {session}, budget {} instructions",
            self.config.recording.max_instructions
        );
        Ok(session)
    }

    /// Run the capture loop until the budget, a step failure or cancellation.
    pub fn record(&mut self) -> Result<StopReason, RecorderError> {
        let session = match (self.state, self.session) {
            (RecorderState::Recording, Some(session)) => session,
            _ => return Err(RecorderError::NotStarted),
        };
        match self.capture_loop(session) {
            Ok(stop) => {
                self.stop = Some(stop);
                self.state = RecorderState::Finished(stop);
                info!("recording stopped ({stop:?}) after {} instructions", self.instructions);
                Ok(stop)
            }
            Err(err) => {
                warn!("recording failed after {} instructions: {err}", self.instructions);
                self.state = RecorderState::Failed;
                Err(err.into())
            }
        }
    }

    fn capture_loop(&mut self, session: SessionId) -> Result<StopReason, StoreError> {
        let budget = self.config.recording.max_instructions;
        let progress_interval = self.config.recording.progress_interval.max(1);
        let high_value_interval = self.config.recording.high_value_interval.max(1);

        for step in 0..budget {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(StopReason::Interrupted);
            }

            let registers = self.stub.read_registers();
            let pc = registers.pc().unwrap_or(0);
            let instruction = self.stub.read_memory(pc, INSTRUCTION_BYTES);
            let disassembly = self.disassembler.disassemble(&instruction, pc);
            let stage = self.config.stages.classify(pc).to_owned();

            if self.current_stage.as_deref() != Some(stage.as_str()) {
                self.enter_stage(session, &stage, pc, step)?;
            }

            self.store.save_instruction_trace(&TraceRecord {
                session,
                sequence: step,
                pc,
                instruction,
                disassembly,
                stack_pointer: registers.sp().unwrap_or(0),
                registers,
                function: self.config.functions.resolve(pc),
                stage: stage.clone(),
            })?;
            self.instructions += 1;
            self.last_pc = pc;

            if !self.stub.single_step() {
                warn!("single step failed at 0x{pc:08x} after {} instructions", self.instructions);
                return Ok(StopReason::StepFailed);
            }

            if self.config.recording.high_value_stage.as_deref() == Some(stage.as_str())
                && step % high_value_interval == 0
            {
                let label = format!("{stage}_step_{}", step / high_value_interval);
                self.snapshot(session, &label, pc)?;
            }

            if step % progress_interval == 0 {
                info!("step {step}: pc=0x{pc:08x} stage={stage}");
            }
        }
        Ok(StopReason::BudgetExhausted)
    }

    fn enter_stage(
        &mut self,
        session: SessionId,
        stage: &str,
        pc: u32,
        step: u64,
    ) -> Result<(), StoreError> {
        info!(
            "stage transition {} -> {stage} at 0x{pc:08x}",
            self.current_stage.as_deref().unwrap_or("<none>")
        );
        let snapshot = if stage == crate::stage::UNKNOWN_STAGE {
            None
        } else {
            let id = self.snapshot(session, stage, pc)?;
            self.stage_snapshots.insert(stage.to_owned(), id);
            Some(id)
        };
        self.close_visit(step)?;
        let id = self.store.open_stage(session, stage, pc, snapshot)?;
        self.visit = Some(OpenVisit {
            id,
            entered_at: step,
        });
        self.current_stage = Some(stage.to_owned());
        Ok(())
    }

    fn close_visit(&mut self, step: u64) -> Result<(), StoreError> {
        if let Some(visit) = self.visit.take() {
            self.store
                .close_stage(visit.id, self.last_pc, step - visit.entered_at)?;
        }
        Ok(())
    }

    fn capture_regions(&mut self) -> Vec<(String, Vec<u8>)> {
        let mut captured = Vec::with_capacity(self.config.regions.len());
        for region in &self.config.regions {
            let data = self.stub.read_memory(region.start, region.size);
            if data.is_empty() {
                debug!("region {} unreadable; skipped", region.label());
                continue;
            }
            captured.push((region.label(), data));
        }
        captured
    }

    fn snapshot(&mut self, session: SessionId, stage: &str, pc: u32) -> Result<SnapshotId, StoreError> {
        let regions = self.capture_regions();
        let id = self.store.save_memory_snapshot(session, stage, pc, &regions)?;
        self.snapshots += 1;
        info!("snapshot {id} for {stage}: {} regions", regions.len());
        Ok(id)
    }

    /// Close the timeline, record metrics, end the session and release the
    /// stub and store. Best-effort; later calls return the same summary.
    pub fn finish(&mut self) -> RecordingSummary {
        if !self.finished {
            self.finished = true;
            if let Some(started) = self.started {
                self.elapsed = started.elapsed();
            }
            if let Some(session) = self.session {
                self.finalize_session(session);
            }
            self.stub.close();
            if let Err(err) = self.store.close() {
                warn!("failed to close snapshot store: {err}");
            }
        }
        self.summary()
    }

    fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            session: self.session,
            instructions: self.instructions,
            snapshots: self.snapshots,
            stop: self.stop,
            elapsed: self.elapsed,
        }
    }

    fn finalize_session(&mut self, session: SessionId) {
        if let Err(err) = self.close_visit(self.instructions) {
            warn!("failed to close stage timeline: {err}");
        }
        let rate = self.summary().instructions_per_second();
        let metrics = [
            ("instructions_recorded", self.instructions as f64, "count"),
            ("instructions_per_second", rate, "ips"),
        ];
        for (name, value, unit) in metrics {
            if let Err(err) = self.store.record_metric(session, name, value, unit) {
                warn!("failed to record metric {name}: {err}");
            }
        }
        if let Err(err) = self.store.end_session(session) {
            warn!("failed to end session {session}: {err}");
        }
    }

    /// Start, record and finish in one call.
    pub fn run(&mut self) -> Result<RecordingSummary, RecorderError> {
        if let Err(err) = self.start() {
            self.finish();
            return Err(err);
        }
        let outcome = self.record();
        let summary = self.finish();
        outcome.map(|_| summary)
    }
}
