//! # Registers
//!
//! The register snapshot captured by the breakpoint trampoline, and the register name lookup used by expressions

use std::fmt::{self, Display};
use std::mem;
use std::str::FromStr;

use thiserror::Error;

/// Full general-purpose register state at the moment a breakpoint was hit.
///
/// The layout is exactly what `pushad` leaves on the stack, followed by the return address pushed by the
/// `call` that was patched into the target. The trampoline and [`crate::breakpoint::breakpoint_process`]
/// both depend on this order, so fields must never be reordered.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct X86Regs {
    /// `edi`
    pub edi: usize,
    /// `esi`
    pub esi: usize,
    /// `ebp`
    pub ebp: usize,
    /// `esp` at the time of the breakpoint's `call`, so it points at `retaddr`.
    ///
    /// `popad` skips this slot; changes are applied by relocating the whole snapshot instead.
    pub esp: usize,
    /// `ebx`
    pub ebx: usize,
    /// `edx`
    pub edx: usize,
    /// `ecx`
    pub ecx: usize,
    /// `eax`
    pub eax: usize,
    /// Where the trampoline's final `ret` goes
    pub retaddr: usize,
}

#[cfg(target_arch = "x86")]
const _: () = assert!(mem::size_of::<X86Regs>() == 36);

impl X86Regs {
    /// Size of the snapshot in bytes, as moved around by the dispatch routine
    pub const SIZE: usize = mem::size_of::<X86Regs>();

    /// Reads a register
    pub fn get(&self, reg: Register) -> usize {
        *self.slot(reg)
    }

    /// Writes a register
    pub fn set(&mut self, reg: Register, value: usize) {
        *self.slot_mut(reg) = value;
    }

    /// Reference to the slot backing `reg`
    pub fn slot(&self, reg: Register) -> &usize {
        match reg {
            Register::Eax => &self.eax,
            Register::Ecx => &self.ecx,
            Register::Edx => &self.edx,
            Register::Ebx => &self.ebx,
            Register::Esp => &self.esp,
            Register::Ebp => &self.ebp,
            Register::Esi => &self.esi,
            Register::Edi => &self.edi,
        }
    }

    /// Mutable reference to the slot backing `reg`
    pub fn slot_mut(&mut self, reg: Register) -> &mut usize {
        match reg {
            Register::Eax => &mut self.eax,
            Register::Ecx => &mut self.ecx,
            Register::Edx => &mut self.edx,
            Register::Ebx => &mut self.ebx,
            Register::Esp => &mut self.esp,
            Register::Ebp => &mut self.ebp,
            Register::Esi => &mut self.esi,
            Register::Edi => &mut self.edi,
        }
    }

    /// Looks up the register named at the start of `name` and returns its slot together with the rest of the string.
    ///
    /// Only the first three characters are compared (case-insensitively), so `"eax+4"` yields `eax`'s slot and `"+4"`.
    pub fn reg<'n>(&mut self, name: &'n str) -> Option<(&mut usize, &'n str)> {
        let (reg, rest) = Register::parse_prefix(name)?;
        Some((self.slot_mut(reg), rest))
    }
}

/// Error for strings that don't name a register
#[derive(Debug, Error)]
#[error("'{0}' is not a general-purpose register")]
pub struct UnknownRegister(String);

/// One of the eight general-purpose registers stored in [`X86Regs`]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Register {
    /// Every register, in encoding order
    pub const ALL: [Register; 8] = [
        Register::Eax,
        Register::Ecx,
        Register::Edx,
        Register::Ebx,
        Register::Esp,
        Register::Ebp,
        Register::Esi,
        Register::Edi,
    ];

    /// Lower-case mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Register::Eax => "eax",
            Register::Ecx => "ecx",
            Register::Edx => "edx",
            Register::Ebx => "ebx",
            Register::Esp => "esp",
            Register::Ebp => "ebp",
            Register::Esi => "esi",
            Register::Edi => "edi",
        }
    }

    /// Matches a register name against the first three characters of `s`
    pub fn parse_prefix(s: &str) -> Option<(Register, &str)> {
        let head = s.get(..3)?;
        let reg = Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(head))?;
        Some((reg, &s[3..]))
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = UnknownRegister;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse_prefix(s) {
            Some((reg, "")) => Ok(reg),
            _ => Err(UnknownRegister(s.to_owned())),
        }
    }
}
