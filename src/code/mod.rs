//! # Code
//!
//! Generation of the machine code that breakpoints are built from.
//!
//! [`CodeBuffer`] writes code into memory that will run at a known address. Every relative branch goes
//! through [`CodeBuffer::emit_branch`], which is the only place where displacements are computed.

pub mod x86;

use thiserror::Error;

use self::x86::{rel32, BRANCH_LEN};

/// Errors while generating code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    /// Not enough room left in the buffer
    #[error("code buffer overflow: {needed} bytes needed, {available} available")]
    Overflow {
        /// Bytes that were about to be written
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },
    /// A branch target isn't reachable with a 32-bit displacement
    #[error("branch from {site:#x} to {target:#x} is out of rel32 range")]
    OutOfRange {
        /// Address of the branch instruction
        site: usize,
        /// Address it should reach
        target: usize,
    },
}

/// Cursor over a block of memory that receives code, tracking the address each byte will execute at.
pub struct CodeBuffer<'a> {
    /// Backing memory
    data: &'a mut [u8],
    /// Address `data[0]` executes at
    base: usize,
    /// Bytes written so far
    pos: usize,
}

impl<'a> CodeBuffer<'a> {
    /// Creates a buffer whose code will run at `base`, e.g. a staging copy of a patch site
    pub fn new(data: &'a mut [u8], base: usize) -> Self {
        Self { data, base, pos: 0 }
    }

    /// Creates a buffer whose code runs where it's written
    pub fn in_place(data: &'a mut [u8]) -> Self {
        let base = data.as_ptr() as usize;
        Self::new(data, base)
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Address the next byte will execute at
    pub fn address(&self) -> usize {
        self.base + self.pos
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything written so far
    pub fn written(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Reserves `len` bytes and returns them for writing
    fn reserve(&mut self, len: usize) -> Result<&mut [u8], CodeError> {
        if len > self.remaining() {
            return Err(CodeError::Overflow {
                needed: len,
                available: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&mut self.data[start..self.pos])
    }

    /// Appends raw bytes
    pub fn emit(&mut self, bytes: &[u8]) -> Result<(), CodeError> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Appends a one-byte-opcode relative branch (`call rel32`, `jmp rel32`) that reaches `target`
    pub fn emit_branch(&mut self, opcode: u8, target: usize) -> Result<(), CodeError> {
        let disp = rel32(self.address(), target)?;
        self.reserve(BRANCH_LEN)?
            .copy_from_slice(&x86::branch(opcode, disp));
        Ok(())
    }

    /// Appends `call target`
    pub fn emit_call(&mut self, target: usize) -> Result<(), CodeError> {
        self.emit_branch(x86::CALL_REL32, target)
    }

    /// Appends `jmp target`
    pub fn emit_jmp(&mut self, target: usize) -> Result<(), CodeError> {
        self.emit_branch(x86::JMP_REL32, target)
    }

    /// Fills with `byte` until `len` bytes have been written in total
    pub fn pad_to(&mut self, len: usize, byte: u8) -> Result<(), CodeError> {
        let fill = len.saturating_sub(self.pos);
        self.reserve(fill)?.fill(byte);
        Ok(())
    }

    /// Fills with `byte` until the next address is a multiple of `align`
    pub fn align(&mut self, align: usize, byte: u8) -> Result<(), CodeError> {
        let misalign = self.address() % align;
        if misalign != 0 {
            self.reserve(align - misalign)?.fill(byte);
        }
        Ok(())
    }

    /// Fills the rest of the buffer with `byte`, leaving the cursor where it was
    pub fn clear_rest(&mut self, byte: u8) {
        self.data[self.pos..].fill(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::{CodeBuffer, CodeError};

    #[test]
    /// Branches are encoded relative to the address they run at, not where they're written
    fn test_branch_displacement() {
        let mut data = [0u8; 16];
        let mut buf = CodeBuffer::new(&mut data, 0x1000);
        buf.emit(&[0x90]).unwrap();
        buf.emit_jmp(0x1100).unwrap();
        buf.emit_call(0x1000).unwrap();
        assert_eq!(buf.position(), 11);
        assert_eq!(buf.address(), 0x100b);

        // jmp at 0x1001: 0x1100 - 0x1006
        assert_eq!(data[1..6], [0xe9, 0xfa, 0x00, 0x00, 0x00]);
        // call at 0x1006: 0x1000 - 0x100b = -11
        assert_eq!(data[6..11], [0xe8, 0xf5, 0xff, 0xff, 0xff]);
    }

    #[test]
    /// Writes past the end are refused without partial output
    fn test_overflow() {
        let mut data = [0u8; 4];
        let mut buf = CodeBuffer::new(&mut data, 0);
        assert_eq!(
            buf.emit_jmp(0x10),
            Err(CodeError::Overflow {
                needed: 5,
                available: 4
            })
        );
        assert_eq!(buf.position(), 0);
    }

    #[test]
    /// Padding and alignment
    fn test_padding() {
        let mut data = [0u8; 16];
        let mut buf = CodeBuffer::new(&mut data, 0x2001);
        buf.emit(&[0xe8]).unwrap();
        buf.align(4, 0xcc).unwrap();
        assert_eq!(buf.address(), 0x2004);
        buf.pad_to(6, 0x90).unwrap();
        buf.clear_rest(0xcc);
        assert_eq!(buf.written(), [0xe8, 0xcc, 0xcc, 0x90, 0x90, 0x90]);
        assert_eq!(data[6..], [0xcc; 10]);
    }
}
