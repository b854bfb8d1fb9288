// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: TCP client for the QEMU GDB remote stub.
// Author: Lukas Bower

//! TCP client for the QEMU GDB remote stub.
//!
//! The client frames commands, then polls the socket until a complete reply
//! is buffered or the per-call deadline passes. Replies are not acknowledged
//! and their checksums are only checked when verification is enabled.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{DebugStub, RegisterFile, StubError, DEFAULT_GDB_PORT};
use crate::rsp::{self, Reply};

/// Default receive deadline applied to every request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

const RECV_CHUNK: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const HANDSHAKE: &str = "qSupported";

/// Debug-stub client speaking the GDB remote protocol over TCP.
#[derive(Debug)]
pub struct TcpStubClient {
    host: String,
    port: u16,
    timeout: Duration,
    verify_checksums: bool,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
}

impl Default for TcpStubClient {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_GDB_PORT)
    }
}

impl TcpStubClient {
    /// Create a client targeting `host:port`. No connection is made yet.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            verify_checksums: false,
            stream: None,
            pending: Vec::new(),
        }
    }

    /// Override the per-request receive deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject replies whose checksum does not match their payload.
    #[must_use]
    pub fn with_checksum_verification(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Endpoint this client targets.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a stream is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn open_stream(&self) -> Result<TcpStream, StubError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StubError::Malformed(format!("no address for {}", self.endpoint())))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(POLL_INTERVAL.min(self.timeout)))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn send(&mut self, payload: &str) -> Result<(), StubError> {
        let stream = self.stream.as_mut().ok_or(StubError::NotConnected)?;
        let packet = rsp::frame_packet(payload);
        debug!("-> {packet}");
        stream.write_all(packet.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<String, StubError> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            if let Some((reply, used)) = rsp::extract_reply(&self.pending) {
                self.pending.drain(..used);
                return self.accept(reply);
            }
            if Instant::now() >= deadline {
                return Err(StubError::Timeout(self.timeout.as_millis()));
            }
            let stream = self.stream.as_mut().ok_or(StubError::NotConnected)?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(StubError::Closed),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn accept(&self, reply: Reply) -> Result<String, StubError> {
        if self.verify_checksums && !reply.checksum_ok() {
            return match reply {
                Reply::Packet { payload, .. } => Err(StubError::Checksum { payload }),
                Reply::Nack => Err(StubError::Nack),
            };
        }
        match reply {
            Reply::Packet { payload, .. } => {
                debug!("<- {payload}");
                Ok(payload)
            }
            Reply::Nack => Err(StubError::Nack),
        }
    }

    /// Send a command and wait for its reply payload.
    ///
    /// A reply that misses the deadline may still arrive later, so a timed
    /// out or broken stream is dropped and later requests fail with
    /// [`StubError::NotConnected`] instead of reading a stale reply.
    pub fn request(&mut self, payload: &str) -> Result<String, StubError> {
        self.pending.clear();
        let reply = self.send(payload).and_then(|()| self.receive());
        if let Err(err @ (StubError::Timeout(_) | StubError::Closed | StubError::Io(_))) = &reply {
            warn!("dropping debug stub connection {} after {payload:?}: {err}", self.endpoint());
            self.close();
        }
        reply
    }

    fn try_connect(&mut self) -> Result<String, StubError> {
        self.stream = Some(self.open_stream()?);
        self.pending.clear();
        self.request(HANDSHAKE)
    }

    fn try_read_memory(&mut self, address: u32, size: u32) -> Result<Vec<u8>, StubError> {
        let payload = self.request(&rsp::read_memory_command(address, size))?;
        if let Some(code) = rsp::error_code(&payload) {
            return Err(StubError::ErrorReply(code));
        }
        rsp::decode_memory(&payload)
            .ok_or_else(|| StubError::Malformed(format!("memory payload {payload:?}")))
    }

    fn try_read_registers(&mut self) -> Result<RegisterFile, StubError> {
        let payload = self.request("g")?;
        if let Some(code) = rsp::error_code(&payload) {
            return Err(StubError::ErrorReply(code));
        }
        Ok(rsp::decode_registers(&payload))
    }
}

impl DebugStub for TcpStubClient {
    fn connect(&mut self) -> bool {
        match self.try_connect() {
            Ok(features) => {
                let shown: String = features.chars().take(100).collect();
                info!("connected to debug stub {}: {shown}", self.endpoint());
                true
            }
            Err(err) => {
                warn!("failed to connect to debug stub {}: {err}", self.endpoint());
                self.close();
                false
            }
        }
    }

    fn read_memory(&mut self, address: u32, size: u32) -> Vec<u8> {
        self.try_read_memory(address, size).unwrap_or_else(|err| {
            warn!("memory read at 0x{address:08x} ({size} bytes) failed: {err}");
            Vec::new()
        })
    }

    fn read_registers(&mut self) -> RegisterFile {
        self.try_read_registers().unwrap_or_else(|err| {
            warn!("register read failed: {err}");
            RegisterFile::default()
        })
    }

    fn single_step(&mut self) -> bool {
        match self.request("s") {
            Ok(reply) => rsp::is_trap_stop(&reply),
            Err(err) => {
                warn!("single step failed: {err}");
                false
            }
        }
    }

    fn set_breakpoint(&mut self, address: u32) -> bool {
        match self.request(&rsp::breakpoint_command(address)) {
            Ok(reply) => reply == "OK",
            Err(err) => {
                warn!("breakpoint at 0x{address:08x} failed: {err}");
                false
            }
        }
    }

    fn continue_execution(&mut self) -> String {
        self.request("c").unwrap_or_else(|err| {
            warn!("continue failed: {err}");
            String::new()
        })
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("closed debug stub connection {}", self.endpoint());
        }
        self.pending.clear();
    }
}

impl Drop for TcpStubClient {
    fn drop(&mut self) {
        self.close();
    }
}
