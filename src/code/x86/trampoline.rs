//! # Trampoline
//!
//! The stub every patched breakpoint site calls into. It is position-independent, so one template is built
//! and then copied once per breakpoint, with only the breakpoint pointer differing between copies.
//!
//! ```text
//!     pushad                  ; X86Regs, below the return address of the site's call
//!     pushfd
//!     cld
//!     call anchor
//! anchor:
//!     pop ebx                 ; ebx = anchor, for reading the data slots
//!     mov ebp, esp            ; ebp = saved flags, X86Regs right above
//!     mov esi, [ebp]          ; flags, kept across dispatch
//!     and esp, -16
//!     sub esp, 8
//!     lea eax, [ebp+4]
//!     push eax                ; regs
//!     push [ebx+context]      ; breakpoint
//!     call [ebx+dispatch]     ; eax = stack shift in bytes
//!     lea esp, [ebp+eax+4]    ; where dispatch moved X86Regs to
//!     push esi
//!     popfd
//!     popad
//!     ret                     ; to X86Regs::retaddr
//! dispatch: dd ?
//! context:  dd ?
//! ```
//!
//! Moving X86Regs overwrites the flags `pushfd` saved right below it, so they are restored from `esi`,
//! directly below wherever the registers ended up.

use std::mem;

use super::super::{CodeBuffer, CodeError};
use super::INT3;

/// Offset of the `pop ebx` the data slots are addressed from
const ANCHOR: usize = 8;

/// Length of the instructions
const STUB_LEN: usize = 38;

/// Offset of the dispatch routine's address
pub const DISPATCH_OFFSET: usize = align_up(STUB_LEN, mem::size_of::<usize>());

/// Offset of the per-breakpoint context pointer
pub const CONTEXT_OFFSET: usize = DISPATCH_OFFSET + mem::size_of::<usize>();

/// Total size of one trampoline
pub const TRAMPOLINE_LEN: usize = CONTEXT_OFFSET + mem::size_of::<usize>();

/// Rounds `value` up to a multiple of `align`
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Instructions of the stub
#[rustfmt::skip]
const STUB: [u8; STUB_LEN] = [
    0x60,                                           // pushad
    0x9c,                                           // pushfd
    0xfc,                                           // cld
    0xe8, 0x00, 0x00, 0x00, 0x00,                   // call anchor
    0x5b,                                           // pop ebx
    0x89, 0xe5,                                     // mov ebp, esp
    0x8b, 0x75, 0x00,                               // mov esi, [ebp]
    0x83, 0xe4, 0xf0,                               // and esp, -16
    0x83, 0xec, 0x08,                               // sub esp, 8
    0x8d, 0x45, 0x04,                               // lea eax, [ebp+4]
    0x50,                                           // push eax
    0xff, 0x73, (CONTEXT_OFFSET - ANCHOR) as u8,    // push [ebx+context]
    0xff, 0x53, (DISPATCH_OFFSET - ANCHOR) as u8,   // call [ebx+dispatch]
    0x8d, 0x64, 0x05, 0x04,                         // lea esp, [ebp+eax+4]
    0x56,                                           // push esi
    0x9d,                                           // popfd
    0x61,                                           // popad
    0xc3,                                           // ret
];

/// Trampoline template bound to one dispatch routine
#[derive(Clone)]
pub struct Trampoline {
    /// Template bytes, context slot still empty
    code: [u8; TRAMPOLINE_LEN],
}

impl Trampoline {
    /// Builds the template for a dispatch routine with the signature
    /// `extern "C" fn(context: *const T, regs: *mut X86Regs) -> usize`
    pub fn new(dispatch: usize) -> Self {
        let mut code = [INT3; TRAMPOLINE_LEN];
        code[..STUB_LEN].copy_from_slice(&STUB);
        code[DISPATCH_OFFSET..CONTEXT_OFFSET].copy_from_slice(&dispatch.to_ne_bytes());
        code[CONTEXT_OFFSET..].fill(0);
        Self { code }
    }

    /// Copies the template to the buffer's cursor and points the copy at `context`.
    ///
    /// Returns the address of the new trampoline.
    pub fn instantiate(&self, buf: &mut CodeBuffer, context: usize) -> Result<usize, CodeError> {
        let addr = buf.address();
        let mut code = self.code;
        code[CONTEXT_OFFSET..].copy_from_slice(&context.to_ne_bytes());
        buf.emit(&code)?;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::{Trampoline, CONTEXT_OFFSET, DISPATCH_OFFSET, STUB, TRAMPOLINE_LEN};
    use crate::code::x86::disassemble;
    use crate::code::CodeBuffer;

    #[test]
    /// Data slots are word-aligned and reachable with an 8-bit displacement from the anchor
    fn test_layout() {
        let word = mem::size_of::<usize>();
        assert_eq!(DISPATCH_OFFSET % word, 0);
        assert_eq!(CONTEXT_OFFSET, DISPATCH_OFFSET + word);
        assert_eq!(TRAMPOLINE_LEN, CONTEXT_OFFSET + word);
        assert!(CONTEXT_OFFSET < 0x80);
    }

    #[cfg(target_arch = "x86")]
    #[test]
    /// The whole trampoline is 48 bytes on x86
    fn test_len() {
        assert_eq!(TRAMPOLINE_LEN, 48);
    }

    #[test]
    /// The stub decodes to the expected instruction sequence
    fn test_stub_listing() {
        let listing = disassemble(&STUB, 0);
        let mnemonics: Vec<_> = listing
            .lines()
            .map(|line| line.split_whitespace().nth(1).unwrap_or(""))
            .collect();
        assert_eq!(
            mnemonics,
            [
                "pushad", "pushfd", "cld", "call", "pop", "mov", "mov", "and", "sub", "lea",
                "push", "push", "call", "lea", "push", "popfd", "popad", "ret"
            ]
        );
    }

    #[test]
    /// Flags are read before dispatch and restored right below the shifted registers
    fn test_flags_follow_registers() {
        let listing = disassemble(&STUB, 0);
        let lines: Vec<_> = listing
            .lines()
            .map(|line| line.split_once(' ').map_or("", |(_, instr)| instr))
            .collect();
        let position = |instr: &str| lines.iter().position(|line| *line == instr).unwrap();
        let dispatch = lines.iter().rposition(|line| line.starts_with("call")).unwrap();

        assert!(position("pushfd") < position("mov esi,[ebp]"));
        assert!(position("mov esi,[ebp]") < dispatch);
        let shift = position("lea esp,[ebp+eax+4]");
        assert_eq!(shift, dispatch + 1);
        assert_eq!(&lines[shift + 1..], ["push esi", "popfd", "popad", "ret"]);
    }

    #[test]
    /// Each copy differs only in its context pointer
    fn test_instantiate() {
        let trampoline = Trampoline::new(0x1234_5678);
        let mut data = [0u8; 2 * TRAMPOLINE_LEN];
        let mut buf = CodeBuffer::new(&mut data, 0x10_0000);

        let first = trampoline.instantiate(&mut buf, 0xaaaa).unwrap();
        let second = trampoline.instantiate(&mut buf, 0xbbbb).unwrap();
        assert_eq!(first, 0x10_0000);
        assert_eq!(second, 0x10_0000 + TRAMPOLINE_LEN);
        assert!(trampoline.instantiate(&mut buf, 0xcccc).is_err());

        let (a, b) = data.split_at(TRAMPOLINE_LEN);
        assert_eq!(a[..CONTEXT_OFFSET], b[..CONTEXT_OFFSET]);
        assert_eq!(a[CONTEXT_OFFSET..], 0xaaaausize.to_ne_bytes());
        assert_eq!(b[CONTEXT_OFFSET..], 0xbbbbusize.to_ne_bytes());
        assert_eq!(
            a[DISPATCH_OFFSET..CONTEXT_OFFSET],
            0x1234_5678usize.to_ne_bytes()
        );
    }
}
