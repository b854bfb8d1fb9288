// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: GDB remote serial protocol framing and payload decoding helpers.
// Author: Lukas Bower

//! GDB remote serial protocol framing and payload decoding helpers.
//!
//! Commands are framed as `$<payload>#<cc>` where `cc` is the modulo-256 sum
//! of the payload bytes rendered as two lowercase hex digits. Nothing in this
//! module touches a socket; the TCP client feeds received bytes through
//! [`extract_reply`] until a complete reply is available.

use crate::stub::RegisterFile;

/// Start-of-packet marker.
pub const PACKET_START: u8 = b'$';
/// End-of-payload marker, followed by two checksum digits.
pub const PACKET_END: u8 = b'#';
/// Positive acknowledgement.
pub const ACK: u8 = b'+';
/// Negative acknowledgement.
pub const NACK: u8 = b'-';

/// Number of general purpose registers decoded from a `g` reply.
pub const GPR_COUNT: usize = 16;
const HEX_DIGITS_PER_REG: usize = 8;

/// Compute the RSP checksum of a payload.
#[must_use]
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Frame a command payload as `$<payload>#<cc>`.
#[must_use]
pub fn frame_packet(payload: &str) -> String {
    format!("${payload}#{:02x}", checksum(payload.as_bytes()))
}

/// A complete reply extracted from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A `$...#cc` packet.
    Packet {
        /// Packet payload between `$` and `#`.
        payload: String,
        /// Checksum digits sent by the stub, if they parsed as hex.
        checksum: Option<u8>,
    },
    /// A lone negative acknowledgement.
    Nack,
}

impl Reply {
    /// Return true when the received checksum matches the payload.
    #[must_use]
    pub fn checksum_ok(&self) -> bool {
        match self {
            Reply::Packet { payload, checksum: Some(received) } => {
                checksum(payload.as_bytes()) == *received
            }
            Reply::Packet { checksum: None, .. } => false,
            Reply::Nack => false,
        }
    }
}

/// Try to extract a complete reply from `buf`.
///
/// Leading `+` acknowledgements are skipped. Returns the reply and the number
/// of bytes consumed, or `None` when more bytes are needed.
#[must_use]
pub fn extract_reply(buf: &[u8]) -> Option<(Reply, usize)> {
    let mut pos = 0usize;
    while pos < buf.len() && buf[pos] == ACK {
        pos += 1;
    }
    let rest = &buf[pos..];
    let first = *rest.first()?;
    if first == NACK {
        return Some((Reply::Nack, pos + 1));
    }
    let start = rest.iter().position(|&b| b == PACKET_START)?;
    let body = &rest[start + 1..];
    let end = body.iter().position(|&b| b == PACKET_END)?;
    let digits = body.get(end + 1..end + 3)?;
    let payload = String::from_utf8_lossy(&body[..end]).into_owned();
    let checksum = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| u8::from_str_radix(text, 16).ok());
    let consumed = pos + start + 1 + end + 3;
    Some((Reply::Packet { payload, checksum }, consumed))
}

/// Return the two-digit error code when the payload is an `Exx` error reply.
#[must_use]
pub fn error_code(payload: &str) -> Option<u8> {
    let digits = payload.strip_prefix('E')?;
    if digits.len() != 2 {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}

/// Build a memory read command `m<addr>,<len>`.
#[must_use]
pub fn read_memory_command(address: u32, size: u32) -> String {
    format!("m{address:x},{size:x}")
}

/// Build a software breakpoint command `Z0,<addr>,4`.
#[must_use]
pub fn breakpoint_command(address: u32) -> String {
    format!("Z0,{address:x},4")
}

/// Decode a hex memory payload. Returns `None` for odd-length or non-hex data.
#[must_use]
pub fn decode_memory(payload: &str) -> Option<Vec<u8>> {
    hex::decode(payload.trim()).ok()
}

/// Decode r0-r15 from a `g` reply of concatenated little-endian words.
///
/// Registers whose eight hex digits are not fully present are omitted. A
/// malformed word stops decoding at that register.
#[must_use]
pub fn decode_registers(payload: &str) -> RegisterFile {
    let mut registers = RegisterFile::default();
    for index in 0..GPR_COUNT {
        let start = index * HEX_DIGITS_PER_REG;
        let Some(word) = payload.get(start..start + HEX_DIGITS_PER_REG) else {
            break;
        };
        let Ok(bytes) = hex::decode(word) else {
            break;
        };
        let mut le = [0u8; 4];
        le.copy_from_slice(&bytes);
        registers.insert(format!("r{index}"), u32::from_le_bytes(le));
    }
    registers
}

/// Return true when a stop reply reports SIGTRAP (`S05` or `T05...`).
#[must_use]
pub fn is_trap_stop(payload: &str) -> bool {
    payload.starts_with("S05") || payload.starts_with("T05")
}
