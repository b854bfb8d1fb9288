// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Minimal ARM (A32) instruction rendering for trace rows.
// Author: Lukas Bower

//! Minimal ARM (A32) instruction rendering for trace rows.
//!
//! Only branches, register moves and single data transfers are recognised;
//! everything else is rendered as the raw instruction word.

/// Turns raw instruction bytes at `pc` into human-readable text.
pub trait Disassembler {
    /// Render the instruction in `bytes` located at `pc`.
    fn disassemble(&self, bytes: &[u8], pc: u32) -> String;
}

impl<F> Disassembler for F
where
    F: Fn(&[u8], u32) -> String,
{
    fn disassemble(&self, bytes: &[u8], pc: u32) -> String {
        self(bytes, pc)
    }
}

/// Basic little-endian A32 decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmDisassembler;

impl ArmDisassembler {
    fn branch_target(instr: u32, pc: u32) -> u32 {
        // imm24 is a signed word offset relative to pc + 8.
        let offset = (((instr & 0x00ff_ffff) << 8) as i32) >> 6;
        pc.wrapping_add(8).wrapping_add(offset as u32)
    }
}

impl Disassembler for ArmDisassembler {
    fn disassemble(&self, bytes: &[u8], pc: u32) -> String {
        let Some(word) = bytes.get(..4) else {
            return "invalid".to_owned();
        };
        let instr = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        match instr & 0x0f00_0000 {
            0x0a00_0000 => return format!("b 0x{:08x}", Self::branch_target(instr, pc)),
            0x0b00_0000 => return format!("bl 0x{:08x}", Self::branch_target(instr, pc)),
            _ => {}
        }
        if instr & 0x0fe0_0000 == 0x01a0_0000 {
            let rd = (instr >> 12) & 0xf;
            let rm = instr & 0xf;
            return format!("mov r{rd}, r{rm}");
        }
        if instr & 0x0c00_0000 == 0x0400_0000 {
            let mnemonic = if instr & (1 << 20) != 0 { "ldr" } else { "str" };
            let rd = (instr >> 12) & 0xf;
            let rn = (instr >> 16) & 0xf;
            return format!("{mnemonic} r{rd}, [r{rn}]");
        }
        format!("instr_0x{instr:08x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(instr: u32, pc: u32) -> String {
        ArmDisassembler.disassemble(&instr.to_le_bytes(), pc)
    }

    #[test]
    fn short_input_is_invalid() {
        assert_eq!(ArmDisassembler.disassemble(&[0x00, 0x00], 0), "invalid");
        assert_eq!(ArmDisassembler.disassemble(&[], 0), "invalid");
    }

    #[test]
    fn branches_resolve_signed_targets() {
        // b . (offset -2 words)
        assert_eq!(render(0xeaff_fffe, 0x4000_0000), "b 0x40000000");
        assert_eq!(render(0xeb00_0010, 0x4000_0000), "bl 0x40000048");
    }

    #[test]
    fn moves_and_transfers() {
        assert_eq!(render(0xe1a0_d001, 0), "mov r13, r1");
        assert_eq!(render(0xe591_0004, 0), "ldr r0, [r1]");
        assert_eq!(render(0xe582_3000, 0), "str r3, [r2]");
    }

    #[test]
    fn unknown_encodings_fall_back_to_raw_word() {
        assert_eq!(render(0xe3a0_0001, 0), "instr_0xe3a00001");
    }

    #[test]
    fn closures_are_disassemblers() {
        let fixed = |_: &[u8], pc: u32| format!("nop @ {pc:x}");
        assert_eq!(fixed.disassemble(&[0; 4], 0x40), "nop @ 40");
    }
}
