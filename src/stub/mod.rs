// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Debug-stub abstraction shared by the recorder and its backends.
// Author: Lukas Bower

//! Debug-stub backends for the boot recorder.
//!
//! Every operation degrades to an empty, zero or `false` result instead of
//! failing; callers treat an empty read as "unavailable", never as real data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;
pub mod tcp;

/// Default TCP port exposed by `qemu -gdb tcp::1234`.
pub const DEFAULT_GDB_PORT: u16 = 1234;

/// Register holding the stack pointer on 32-bit ARM.
pub const SP_REGISTER: &str = "r13";
/// Register holding the program counter on 32-bit ARM.
pub const PC_REGISTER: &str = "r15";

/// Named 32-bit register values decoded from a `g` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterFile(BTreeMap<String, u32>);

impl RegisterFile {
    /// Insert or replace a register value.
    pub fn insert(&mut self, name: impl Into<String>, value: u32) {
        self.0.insert(name.into(), value);
    }

    /// Look up a register by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u32> {
        self.0.get(name).copied()
    }

    /// Program counter, if present.
    #[must_use]
    pub fn pc(&self) -> Option<u32> {
        self.get(PC_REGISTER)
    }

    /// Stack pointer, if present.
    #[must_use]
    pub fn sp(&self) -> Option<u32> {
        self.get(SP_REGISTER)
    }

    /// Number of decoded registers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no register could be decoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate registers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl FromIterator<(String, u32)> for RegisterFile {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Failures observed inside a stub backend before they are downgraded.
#[derive(Debug, Error)]
pub enum StubError {
    /// Socket level failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// No complete reply arrived before the receive deadline.
    #[error("no reply within {0} ms")]
    Timeout(u128),
    /// The stub closed the connection.
    #[error("connection closed by stub")]
    Closed,
    /// An operation was attempted before `connect`.
    #[error("not connected to a debug stub")]
    NotConnected,
    /// The reply could not be decoded.
    #[error("malformed reply: {0}")]
    Malformed(String),
    /// Reply checksum verification failed.
    #[error("reply checksum mismatch for payload {payload:?}")]
    Checksum {
        /// Payload whose checksum did not match.
        payload: String,
    },
    /// The stub answered with a negative acknowledgement.
    #[error("stub rejected the packet")]
    Nack,
    /// The stub answered with an `Exx` error reply.
    #[error("stub error reply E{0:02x}")]
    ErrorReply(u8),
}

/// Single-stepping debug stub used by the boot recorder.
pub trait DebugStub {
    /// Connect and perform the capability handshake. Returns false on failure.
    fn connect(&mut self) -> bool;

    /// Read `size` bytes at `address`; empty when unavailable.
    fn read_memory(&mut self, address: u32, size: u32) -> Vec<u8>;

    /// Read the general purpose register file; empty on failure.
    fn read_registers(&mut self) -> RegisterFile;

    /// Execute exactly one instruction. True when the stub reports a trap stop.
    fn single_step(&mut self) -> bool;

    /// Insert a software breakpoint at `address`.
    fn set_breakpoint(&mut self, address: u32) -> bool;

    /// Resume execution and return the raw stop reply, empty on failure.
    fn continue_execution(&mut self) -> String;

    /// Release the transport. Safe to call repeatedly.
    fn close(&mut self);

    /// Current program counter, 0 when the register file is unavailable.
    fn current_pc(&mut self) -> u32 {
        self.read_registers().pc().unwrap_or(0)
    }
}

impl<S: DebugStub + ?Sized> DebugStub for Box<S> {
    fn connect(&mut self) -> bool {
        (**self).connect()
    }

    fn read_memory(&mut self, address: u32, size: u32) -> Vec<u8> {
        (**self).read_memory(address, size)
    }

    fn read_registers(&mut self) -> RegisterFile {
        (**self).read_registers()
    }

    fn single_step(&mut self) -> bool {
        (**self).single_step()
    }

    fn set_breakpoint(&mut self, address: u32) -> bool {
        (**self).set_breakpoint(address)
    }

    fn continue_execution(&mut self) -> String {
        (**self).continue_execution()
    }

    fn close(&mut self) {
        (**self).close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_file_serialises_as_flat_object() {
        let mut regs = RegisterFile::default();
        regs.insert("r13", 0x4100_0ff0);
        regs.insert("r15", 0x4000_0e70);
        let json = serde_json::to_string(&regs).unwrap();
        assert_eq!(json, r#"{"r13":1090523120,"r15":1073745520}"#);
        assert_eq!(regs.sp(), Some(0x4100_0ff0));
        assert_eq!(regs.pc(), Some(0x4000_0e70));
    }

    #[test]
    fn missing_pc_defaults_to_zero() {
        let mut stub = mock::ScriptedStub::default();
        assert_eq!(stub.current_pc(), 0);
    }
}
