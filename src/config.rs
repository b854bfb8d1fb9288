// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load, override and validate recorder configuration.
// Author: Lukas Bower

//! Recorder configuration.
//!
//! Every section is optional in the TOML file; missing sections fall back to
//! the layout of the FreeRTOS guest under the seL4 CAmkES VMM. Command-line
//! and environment overrides are applied on top, then the result is
//! validated.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::pattern::PatternTable;
use crate::stage::StageTable;
use crate::stub::DEFAULT_GDB_PORT;
use crate::symbols::FunctionTable;

/// Default database file name.
pub const DEFAULT_DB_PATH: &str = "memory_snapshots.db";

/// Complete recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderConfig {
    /// Debug-stub connection settings.
    pub stub: StubSettings,
    /// Snapshot store settings.
    pub store: StoreSettings,
    /// Capture loop settings.
    pub recording: RecordingSettings,
    /// Ordered boot-stage ranges.
    pub stages: StageTable,
    /// Memory regions captured in every snapshot.
    pub regions: Vec<RegionSpec>,
    /// Ordered keyword to painted-pattern rules.
    pub patterns: PatternTable,
    /// Known guest function entry points.
    pub functions: FunctionTable,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            stub: StubSettings::default(),
            store: StoreSettings::default(),
            recording: RecordingSettings::default(),
            stages: StageTable::default(),
            regions: default_regions(),
            patterns: PatternTable::default(),
            functions: FunctionTable::default(),
        }
    }
}

/// Debug-stub connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StubSettings {
    /// Stub host name or address.
    pub host: String,
    /// Stub TCP port.
    pub port: u16,
    /// Per-request receive deadline in milliseconds.
    pub timeout_ms: u64,
    /// Reject replies whose checksum does not match.
    pub verify_checksums: bool,
}

impl Default for StubSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_GDB_PORT,
            timeout_ms: 2000,
            verify_checksums: false,
        }
    }
}

/// Snapshot store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// SQLite database path.
    pub path: PathBuf,
    /// Trace rows appended between commits.
    pub commit_interval: u64,
    /// Target version recorded on each session.
    pub qemu_version: String,
    /// Guest version recorded on each session.
    pub freertos_version: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_PATH),
            commit_interval: 1000,
            qemu_version: "QEMU ARM virt".to_owned(),
            freertos_version: "FreeRTOS Debug with Memory Patterns".to_owned(),
        }
    }
}

/// Capture loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingSettings {
    /// Session description.
    pub description: String,
    /// Instruction budget.
    pub max_instructions: u64,
    /// Steps between progress log lines.
    pub progress_interval: u64,
    /// Stage that receives periodic snapshots regardless of transitions.
    pub high_value_stage: Option<String>,
    /// Steps between periodic snapshots in the high-value stage.
    pub high_value_interval: u64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            description: "Complete boot recording with memory snapshots".to_owned(),
            max_instructions: 100_000,
            progress_interval: 1000,
            high_value_stage: Some("pattern_painting".to_owned()),
            high_value_interval: 5000,
        }
    }
}

/// A memory region captured on every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionSpec {
    /// Region name; pattern keywords are matched against it.
    pub name: String,
    /// Guest physical start address.
    pub start: u32,
    /// Bytes to read.
    pub size: u32,
}

impl RegionSpec {
    /// Construct a region.
    pub fn new(name: impl Into<String>, start: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            start,
            size,
        }
    }

    /// Label stored with the captured bytes, `<name>_0x<start>`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}_0x{:08x}", self.name, self.start)
    }
}

fn default_regions() -> Vec<RegionSpec> {
    vec![
        RegionSpec::new("guest_base", 0x4000_0000, 0x1000),
        RegionSpec::new("stack_region", 0x4100_0000, 0x1000),
        RegionSpec::new("data_region", 0x4120_0000, 0x1000),
        RegionSpec::new("heap_region", 0x4140_0000, 0x1000),
        RegionSpec::new("pattern_region", 0x4200_0000, 0x4000),
        RegionSpec::new("uart_region", 0x0900_0000, 0x100),
    ]
}

/// Optional overrides layered on top of the file configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Override the stub host.
    pub gdb_host: Option<String>,
    /// Override the stub port.
    pub gdb_port: Option<u16>,
    /// Override the receive deadline.
    pub timeout_ms: Option<u64>,
    /// Force reply checksum verification on.
    pub verify_checksums: Option<bool>,
    /// Override the database path.
    pub db_path: Option<PathBuf>,
    /// Override the instruction budget.
    pub max_instructions: Option<u64>,
    /// Override the session description.
    pub description: Option<String>,
}

impl RecorderConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid recorder config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides and return the validated result.
    pub fn with_overrides(self, overrides: &ConfigOverrides) -> Result<Self> {
        let mut updated = self;
        if let Some(host) = &overrides.gdb_host {
            updated.stub.host.clone_from(host);
        }
        if let Some(port) = overrides.gdb_port {
            updated.stub.port = port;
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            updated.stub.timeout_ms = timeout_ms;
        }
        if let Some(verify) = overrides.verify_checksums {
            updated.stub.verify_checksums = verify;
        }
        if let Some(path) = &overrides.db_path {
            updated.store.path.clone_from(path);
        }
        if let Some(max) = overrides.max_instructions {
            updated.recording.max_instructions = max;
        }
        if let Some(description) = &overrides.description {
            updated.recording.description.clone_from(description);
        }
        updated.validate()?;
        Ok(updated)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.stub.host.trim().is_empty() {
            return Err(anyhow!("stub host must not be empty"));
        }
        if self.stub.port == 0 {
            return Err(anyhow!("stub port must be >= 1"));
        }
        if self.stub.timeout_ms == 0 {
            return Err(anyhow!("stub timeout_ms must be >= 1"));
        }
        if self.store.commit_interval == 0 {
            return Err(anyhow!("store commit_interval must be >= 1"));
        }
        if self.recording.progress_interval == 0 {
            return Err(anyhow!("recording progress_interval must be >= 1"));
        }
        if self.recording.high_value_interval == 0 {
            return Err(anyhow!("recording high_value_interval must be >= 1"));
        }
        for stage in self.stages.stages() {
            if stage.name.trim().is_empty() {
                return Err(anyhow!("stage names must not be empty"));
            }
            if stage.start >= stage.end {
                return Err(anyhow!(
                    "stage {} range 0x{:08x}..0x{:08x} is empty",
                    stage.name,
                    stage.start,
                    stage.end
                ));
            }
        }
        for region in &self.regions {
            if region.size == 0 {
                return Err(anyhow!("region {} has zero size", region.name));
            }
            if region.start.checked_add(region.size - 1).is_none() {
                return Err(anyhow!("region {} wraps the address space", region.name));
            }
        }
        if self.functions.span == 0 {
            return Err(anyhow!("function span must be >= 1"));
        }
        Ok(())
    }
}

/// Load and validate a recorder configuration file.
pub fn load_config(path: &Path) -> Result<RecorderConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read recorder config {}", path.display()))?;
    RecorderConfig::from_toml_str(&text)
        .with_context(|| format!("invalid recorder config {}", path.display()))
}
