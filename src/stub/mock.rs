// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Scripted in-process debug stub for deterministic recorder runs.
// Author: Lukas Bower

//! Scripted debug stub that replays a fixed program-counter sequence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{DebugStub, RegisterFile};

const DEFAULT_STACK_POINTER: u32 = 0x4100_0ff0;

/// In-process stub replaying a scripted sequence of program counters.
///
/// Step `n` reports `pcs[n]`; single-stepping past the end of the script
/// fails, which ends a recording the same way a stalled target would.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStub {
    pcs: Vec<u32>,
    position: usize,
    memory: BTreeMap<u32, Vec<u8>>,
    fail_step_at: Option<usize>,
    refuse_connection: bool,
    connected: bool,
    close_calls: usize,
    steps: usize,
    memory_reads: usize,
    breakpoints: Vec<u32>,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
}

impl ScriptedStub {
    /// Create a stub replaying `pcs`.
    pub fn new(pcs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pcs: pcs.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Map `bytes` at `address`; reads fully inside a mapping succeed.
    #[must_use]
    pub fn with_memory(mut self, address: u32, bytes: Vec<u8>) -> Self {
        self.memory.insert(address, bytes);
        self
    }

    /// Make the `n`-th single-step call (1-based) report failure.
    #[must_use]
    pub fn fail_step_at(mut self, n: usize) -> Self {
        self.fail_step_at = Some(n);
        self
    }

    /// Refuse the connection attempt.
    #[must_use]
    pub fn refuse_connection(mut self) -> Self {
        self.refuse_connection = true;
        self
    }

    /// Raise `flag` once `n` single steps have completed.
    #[must_use]
    pub fn cancel_after(mut self, n: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((n, flag));
        self
    }

    /// Number of single-step calls seen.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Number of `close` calls seen.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    /// Whether the stub is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of memory reads issued.
    #[must_use]
    pub fn memory_reads(&self) -> usize {
        self.memory_reads
    }

    /// Breakpoints inserted so far.
    #[must_use]
    pub fn breakpoints(&self) -> &[u32] {
        &self.breakpoints
    }

    fn lookup(&self, address: u32, size: u32) -> Option<Vec<u8>> {
        let (base, bytes) = self.memory.range(..=address).next_back()?;
        let offset = usize::try_from(address - base).ok()?;
        let end = offset.checked_add(usize::try_from(size).ok()?)?;
        bytes.get(offset..end).map(<[u8]>::to_vec)
    }
}

impl DebugStub for ScriptedStub {
    fn connect(&mut self) -> bool {
        if self.refuse_connection {
            return false;
        }
        self.connected = true;
        true
    }

    fn read_memory(&mut self, address: u32, size: u32) -> Vec<u8> {
        if !self.connected {
            return Vec::new();
        }
        self.memory_reads += 1;
        self.lookup(address, size).unwrap_or_default()
    }

    fn read_registers(&mut self) -> RegisterFile {
        let Some(&pc) = self.pcs.get(self.position) else {
            return RegisterFile::default();
        };
        if !self.connected {
            return RegisterFile::default();
        }
        let mut regs: RegisterFile = (0..13).map(|i| (format!("r{i}"), 0)).collect();
        regs.insert("r13", DEFAULT_STACK_POINTER);
        regs.insert("r14", 0);
        regs.insert("r15", pc);
        regs
    }

    fn single_step(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.steps += 1;
        if let Some((n, flag)) = &self.cancel_after {
            if self.steps >= *n {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if self.fail_step_at == Some(self.steps) {
            return false;
        }
        if self.position + 1 >= self.pcs.len() {
            return false;
        }
        self.position += 1;
        true
    }

    fn set_breakpoint(&mut self, address: u32) -> bool {
        if !self.connected {
            return false;
        }
        self.breakpoints.push(address);
        true
    }

    fn continue_execution(&mut self) -> String {
        if !self.connected {
            return String::new();
        }
        let target = self.pcs[self.position..]
            .iter()
            .position(|pc| self.breakpoints.contains(pc));
        match target {
            Some(offset) => {
                self.position += offset;
                "S05".to_owned()
            }
            None => {
                self.position = self.pcs.len().saturating_sub(1);
                "W00".to_owned()
            }
        }
    }

    fn close(&mut self) {
        self.connected = false;
        self.close_calls += 1;
    }
}
