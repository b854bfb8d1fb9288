// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Boot snapshot recorder for FreeRTOS guests under seL4.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Records the boot of a FreeRTOS guest running in a seL4 CAmkES VM.
//!
//! The recorder single-steps the guest through a QEMU GDB stub, classifies
//! each program counter into a boot stage, captures memory snapshots on stage
//! entry and stores a per-instruction trace in SQLite for later analysis.

pub mod config;
pub mod disasm;
pub mod pattern;
pub mod recorder;
pub mod report;
pub mod rsp;
pub mod stage;
pub mod store;
pub mod stub;
pub mod symbols;

pub use config::{load_config, ConfigOverrides, RecorderConfig, RegionSpec};
pub use disasm::{ArmDisassembler, Disassembler};
pub use recorder::{BootRecorder, RecorderError, RecorderState, RecordingSummary, StopReason};
pub use report::{analyze, AnalysisRequest};
pub use stage::{StageRange, StageTable, UNKNOWN_STAGE};
pub use store::{SessionId, SnapshotId, SnapshotStore, StoreError, StoreOptions, TraceRecord};
pub use stub::mock::ScriptedStub;
pub use stub::tcp::TcpStubClient;
pub use stub::{DebugStub, RegisterFile, StubError};

impl RecorderConfig {
    /// Store options derived from this configuration.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            commit_interval: self.store.commit_interval,
            qemu_version: self.store.qemu_version.clone(),
            freertos_version: self.store.freertos_version.clone(),
            patterns: self.patterns.clone(),
        }
    }

    /// TCP stub client configured from this configuration.
    #[must_use]
    pub fn stub_client(&self) -> TcpStubClient {
        TcpStubClient::new(self.stub.host.clone(), self.stub.port)
            .with_timeout(std::time::Duration::from_millis(self.stub.timeout_ms))
            .with_checksum_verification(self.stub.verify_checksums)
    }
}
