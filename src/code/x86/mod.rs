//! # x86
//!
//! Encodings for the handful of 32-bit x86 instructions breakpoints are made of

pub mod trampoline;

use std::mem;

use iced_x86::{Code, Decoder, DecoderOptions, Formatter, IntelFormatter};

use super::CodeError;

/// `call rel32`
pub const CALL_REL32: u8 = 0xe8;
/// `jmp rel32`
pub const JMP_REL32: u8 = 0xe9;
/// `nop`
pub const NOP: u8 = 0x90;
/// `int3`, used to fill unused cave space
pub const INT3: u8 = 0xcc;

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating a relative branch
struct RelBranch {
    /// One-byte opcode
    opcode: u8,
    /// Displacement from the end of the instruction
    disp: i32,
}

/// Length of a `call rel32` or `jmp rel32`
pub const BRANCH_LEN: usize = mem::size_of::<RelBranch>();

/// Encodes a relative branch with an already computed displacement
pub fn branch(opcode: u8, disp: i32) -> [u8; BRANCH_LEN] {
    unsafe { mem::transmute(RelBranch { opcode, disp }) }
}

/// Displacement of a branch at `site` that should land on `target`.
///
/// The processor adds the displacement to the address of the *next* instruction, so this is
/// `target - (site + BRANCH_LEN)`.
pub fn rel32(site: usize, target: usize) -> Result<i32, CodeError> {
    let next = site.wrapping_add(BRANCH_LEN);
    let disp = (target as isize).wrapping_sub(next as isize);
    i32::try_from(disp).map_err(|_| CodeError::OutOfRange { site, target })
}

/// Recognizes a `call rel32` or `jmp rel32` at the start of `code`, which is located at `ip`.
///
/// Returns the opcode and the absolute address the branch goes to.
pub fn leading_branch(code: &[u8], ip: usize) -> Option<(u8, usize)> {
    let mut decoder = Decoder::new(32, code, DecoderOptions::NONE);
    let instr = decoder.decode();
    // prefixed forms decode to the same code but don't have the displacement at offset 1
    if instr.len() != BRANCH_LEN {
        return None;
    }
    let opcode = match instr.code() {
        Code::Call_rel32_32 => CALL_REL32,
        Code::Jmp_rel32_32 => JMP_REL32,
        _ => return None,
    };
    let disp = i32::from_le_bytes(code[1..BRANCH_LEN].try_into().ok()?);
    let target = ip
        .wrapping_add(BRANCH_LEN)
        .wrapping_add(disp as isize as usize);
    Some((opcode, target))
}

/// Intel-syntax listing of `code` as it would run at `ip`, one instruction per line
pub fn disassemble(code: &[u8], ip: usize) -> String {
    let decoder = Decoder::with_ip(32, code, ip as u64, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    for instr in decoder {
        out.push_str(&format!("{:08X} ", instr.ip()));
        formatter.format(&instr, &mut out);
        out.push('\n');
    }
    out
}
