//! # Call Hook
//!
//! This hook type uses a `call rel32` to redirect execution. The destination finds the address right after
//! the call on the stack, which is how breakpoints know where they were hit.

use thiserror::Error;

use crate::code::x86::NOP;
use crate::code::{CodeBuffer, CodeError};
use crate::patcher::{PatchGuard, Patcher};

use super::{Hook, HookGuard};

/// Errors while placing a call hook
#[derive(Debug, Error)]
pub enum HookError<E> {
    /// The call can't be encoded for this source and destination
    #[error("{0}")]
    Code(#[from] CodeError),
    /// The underlying patcher failed
    #[error("{0:?}")]
    Patch(E),
}

/// `call destination`, padded with `nop`s to the hooked length
pub struct CallHook<P> {
    /// Underlying patcher to be used to hook
    patcher: P,
}

impl<P: Patcher> CallHook<P> {
    /// Creates a new call hook
    pub const fn new(patcher: P) -> Self {
        Self { patcher }
    }

    /// Machine code that replaces `len` bytes at `source`
    pub fn assemble(source: usize, destination: usize, len: usize) -> Result<Vec<u8>, CodeError> {
        let mut patch = vec![NOP; len];
        let mut buf = CodeBuffer::new(&mut patch, source);
        buf.emit_call(destination)?;
        buf.pad_to(len, NOP)?;
        Ok(patch)
    }
}

unsafe impl<P: Patcher> Hook for CallHook<P> {
    type Error = HookError<P::Error>;
    type Guard<'a> = CallHookGuard<P::Guard<'a>>
    where
        Self: 'a;

    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
        len: usize,
    ) -> Result<Self::Guard<'_>, Self::Error> {
        let patch = Self::assemble(source as usize, destination as usize, len)?;
        let guard = self
            .patcher
            .patch(source as _, &patch)
            .map_err(HookError::Patch)?;

        Ok(CallHookGuard::new(guard))
    }
}

/// Guard for call hooks
pub struct CallHookGuard<G: PatchGuard> {
    /// Underlying patch guard that we're wrapping
    guard: G,
}

impl<G: PatchGuard> CallHookGuard<G> {
    /// Creates a new call hook guard that wraps `guard`
    fn new(guard: G) -> Self {
        Self { guard }
    }

    /// Get the underlying patch guard in case info is needed
    pub fn patch(&self) -> &G {
        &self.guard
    }
}

unsafe impl<G: PatchGuard> HookGuard for CallHookGuard<G> {}

#[cfg(test)]
mod tests {
    use super::CallHook;
    use crate::code::x86::leading_branch;
    use crate::code::CodeError;
    use crate::hook::{Hook, HookGuard};
    use crate::patcher::byte::BytePatcher;

    #[test]
    /// Calls are padded with `nop`s to the exact length
    fn test_assemble() {
        let patch = CallHook::<BytePatcher>::assemble(0x1000, 0x2000, 7).unwrap();
        assert_eq!(patch.len(), 7);
        assert_eq!(patch[..5], [0xe8, 0xfb, 0x0f, 0x00, 0x00]);
        assert_eq!(patch[5..], [0x90, 0x90]);
    }

    #[test]
    /// Too short to hold a call
    fn test_short() {
        assert!(matches!(
            CallHook::<BytePatcher>::assemble(0x1000, 0x2000, 4),
            Err(CodeError::Overflow { .. })
        ));
    }

    #[test]
    /// Hooking writes the call at the source, unhooking restores it
    fn test_hook() {
        let mut data = [0x55u8, 0x89, 0xe5, 0x83, 0xec, 0x10];
        let source = data.as_mut_ptr();
        let hook = CallHook::new(BytePatcher::new());

        let destination = source as usize + 0x100;
        let guard = unsafe { hook.hook(source, destination as *const u8, 6).unwrap() };
        let patched = unsafe { std::slice::from_raw_parts(source, 6) };
        assert_eq!(
            leading_branch(patched, source as usize),
            Some((0xe8, destination))
        );
        assert_eq!(patched[5], 0x90);
        assert_eq!(guard.patch().original(), [0x55, 0x89, 0xe5, 0x83, 0xec, 0x10]);

        guard.unhook();
        assert_eq!(data, [0x55, 0x89, 0xe5, 0x83, 0xec, 0x10]);
    }
}
