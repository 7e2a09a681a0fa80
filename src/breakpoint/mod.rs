//! # Breakpoint
//!
//! Breakpoints run a callback whenever execution reaches an address, with full access to the registers.
//!
//! Every breakpoint owns a 32-byte slot in its batch's relay cave and a trampoline in its batch's call cave:
//!
//! ```text
//! target:      call trampoline            ; replaces `cavesize` bytes, nop-padded
//!              nop ...
//! next:        ...
//!
//! trampoline:  save registers, breakpoint_process(breakpoint, regs), restore registers
//!              ret                        ; to `next`, or to the relay if the callback asked for it
//!
//! relay:       <the displaced bytes>
//!              jmp next
//! ```
//!
//! Callbacks are registered with [`crate::registry::register_breakpoint`] under the breakpoint's name.
//! A name may carry a `#slot` suffix so that one callback serves several sites.

pub mod apply;
pub mod dispatch;

use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::address::AddressError;
use crate::code::x86::BRANCH_LEN;
use crate::code::CodeError;
use crate::config::BreakpointRequest;
use crate::hook::callhook::HookError;
use crate::patcher::mem::PermissionError;
use crate::registry::{self, BP_PREFIX};
use crate::regs::X86Regs;

pub use self::apply::{apply, apply_with, breakpoints_apply, breakpoints_remove_all, BreakpointSet};
pub use self::dispatch::breakpoint_process;

/// Breakpoint callback. Gets the registers and the breakpoint's configuration object, and returns whether
/// the displaced original code should run afterwards.
pub type BreakpointFn = fn(&mut X86Regs, &Value) -> bool;

/// Length of the `call` placed at a breakpoint
pub const CALL_LEN: usize = BRANCH_LEN;

/// Size of one relay cave slot
pub const BP_OFFSET: usize = 32;

/// Smallest cave size, the call has to fit
pub const BP_SOURCE_CAVE_MIN: usize = CALL_LEN;

/// Largest cave size, the jump back has to fit in the slot
pub const BP_SOURCE_CAVE_MAX: usize = BP_OFFSET - CALL_LEN;

/// Reasons a breakpoint isn't installed
#[derive(Debug, Error)]
pub enum BreakpointError {
    /// Cave size outside of [`BP_SOURCE_CAVE_MIN`]..=[`BP_SOURCE_CAVE_MAX`]
    #[error("cavesize exceeds limits (given: {0}, min: 5, max: 27)")]
    BadCaveSize(usize),
    /// Nothing registered under the breakpoint's `BP_` key
    #[error("function {0} not found")]
    CallbackNotFound(String),
    /// Address string didn't resolve
    #[error("can't resolve address {addr:?}: {error}")]
    Unresolved {
        /// The address string
        addr: String,
        /// What went wrong
        error: AddressError,
    },
    /// Address resolved to 0
    #[error("address is null")]
    NullAddress,
    /// Target isn't mapped readable and executable
    #[error("{addr:#x} is not readable and executable for {len} bytes")]
    Inaccessible {
        /// Breakpoint address
        addr: usize,
        /// Bytes that had to be accessible
        len: usize,
    },
    /// Cave code couldn't be generated
    #[error(transparent)]
    Code(#[from] CodeError),
    /// The breakpoint site couldn't be patched
    #[error("patching failed: {0}")]
    Patch(#[from] HookError<PermissionError<()>>),
}

/// Breakpoint descriptor
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Name, possibly with a `#slot` suffix
    pub name: String,
    /// Address as configured
    pub addr_str: String,
    /// Resolved address, 0 until initialized
    pub addr: usize,
    /// Number of original bytes moved into the relay cave
    pub cavesize: usize,
    /// Address of this breakpoint's relay cave slot, 0 until initialized
    pub cave: usize,
    /// Callback
    pub func: Option<BreakpointFn>,
    /// Configuration object, handed to the callback
    pub params: Value,
}

impl Breakpoint {
    /// Creates an uninitialized descriptor for a request
    pub fn new(request: &BreakpointRequest) -> Self {
        Self {
            name: request.name.clone(),
            addr_str: request.addr.clone(),
            addr: 0,
            cavesize: request.cavesize,
            cave: 0,
            func: None,
            params: request.params.clone(),
        }
    }

    /// Part of the name that selects the callback
    pub fn base_name(&self) -> &str {
        match self.name.split_once('#') {
            Some((base, _slot)) => base,
            None => &self.name,
        }
    }

    /// Registry key of the callback
    pub fn key(&self) -> String {
        format!("{BP_PREFIX}{}", self.base_name())
    }

    /// Validates the cave size, looks up the callback and records where the breakpoint lives.
    ///
    /// `addr` and `cave` are stored even if the callback is missing.
    pub fn init(&mut self, addr: usize, cave: usize) -> Result<(), BreakpointError> {
        if addr == 0 {
            return Err(BreakpointError::NullAddress);
        }
        if !(BP_SOURCE_CAVE_MIN..=BP_SOURCE_CAVE_MAX).contains(&self.cavesize) {
            error!(
                "cavesize exceeds limits! (given: {}, min: {BP_SOURCE_CAVE_MIN}, max: {BP_SOURCE_CAVE_MAX})",
                self.cavesize
            );
            return Err(BreakpointError::BadCaveSize(self.cavesize));
        }

        let key = self.key();
        self.func = registry::breakpoint_get(&key);
        self.addr = addr;
        self.cave = cave;
        match self.func {
            Some(_) => Ok(()),
            None => Err(BreakpointError::CallbackNotFound(key)),
        }
    }
}
