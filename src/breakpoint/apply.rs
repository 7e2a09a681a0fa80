//! Generating caves and installing whole batches of breakpoints

use std::slice;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use region::Protection;
use tracing::{debug, error, info, trace, warn};

use super::dispatch::breakpoint_process;
use super::{Breakpoint, BreakpointError, BP_OFFSET};
use crate::address::{AddressError, AddressResolver, SymbolResolver};
use crate::alloc::{self, ExecutableMemory};
use crate::code::x86::trampoline::{Trampoline, TRAMPOLINE_LEN};
use crate::code::x86::{disassemble, leading_branch, BRANCH_LEN, INT3};
use crate::code::{CodeBuffer, CodeError};
use crate::config::BreakpointRequest;
use crate::hook::callhook::{CallHook, CallHookGuard};
use crate::hook::Hook;
use crate::patcher::byte::{BytePatchGuard, BytePatcher};
use crate::patcher::mem::{PermissionWrapper, PermissionWrapperGuard};
use crate::registry;

/// Patches breakpoint sites, making code writable for the duration of the write
static CALL_HOOK: CallHook<PermissionWrapper<BytePatcher>> =
    CallHook::new(PermissionWrapper::new(BytePatcher::new()));

/// Restores one breakpoint site when dropped
type SiteGuard = CallHookGuard<PermissionWrapperGuard<BytePatchGuard>>;

/// An applied batch of breakpoints.
///
/// Dropping the set restores the original code of every installed breakpoint and frees the caves.
/// No thread may be executing inside a cave at that point.
pub struct BreakpointSet {
    /// Patched sites. Declared first so the original code is back before the caves go away
    sites: Vec<SiteGuard>,
    /// Trampolines
    call_cave: Option<ExecutableMemory>,
    /// Displaced code, [`BP_OFFSET`] bytes per breakpoint
    relay_cave: Option<ExecutableMemory>,
    /// Descriptors, referenced by address from the trampolines
    breakpoints: Box<[Breakpoint]>,
    /// Indices of the installed breakpoints
    installed: Vec<usize>,
}

// The raw pointers inside are to process-wide code and never dereferenced outside of drop
unsafe impl Send for BreakpointSet {}

impl BreakpointSet {
    /// Set where nothing was installed
    fn empty(breakpoints: Box<[Breakpoint]>) -> Self {
        Self {
            sites: Vec::new(),
            call_cave: None,
            relay_cave: None,
            breakpoints,
            installed: Vec::new(),
        }
    }

    /// Number of requests that didn't end up installed
    pub fn failed(&self) -> usize {
        self.breakpoints.len() - self.installed.len()
    }

    /// Installed breakpoints
    pub fn installed(&self) -> impl Iterator<Item = &Breakpoint> {
        self.installed.iter().map(|&i| &self.breakpoints[i])
    }

    /// Every descriptor, in request order
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Address of the relay cave block, if one was allocated
    pub fn relay_cave(&self) -> Option<usize> {
        self.relay_cave.as_ref().map(|m| m.address())
    }

    /// Address of the call cave block, if one was allocated
    pub fn call_cave(&self) -> Option<usize> {
        self.call_cave.as_ref().map(|m| m.address())
    }
}

/// Checks that `len` bytes at `addr` are mapped readable and executable without gaps
fn check_region(addr: usize, len: usize) -> Result<(), BreakpointError> {
    let inaccessible = || BreakpointError::Inaccessible { addr, len };
    let end = addr.checked_add(len).ok_or_else(inaccessible)?;
    let regions = region::query_range(addr as *const u8, len).map_err(|_| inaccessible())?;

    let mut next = addr;
    for region in regions {
        let region = region.map_err(|_| inaccessible())?;
        let mapped = region.as_range();
        if mapped.start > next || !region.protection().contains(Protection::READ_EXECUTE) {
            return Err(inaccessible());
        }
        next = mapped.end;
    }
    if next < end {
        return Err(inaccessible());
    }
    Ok(())
}

/// Resolves a breakpoint's address. Trailing characters are only worth a warning.
fn resolve<R: AddressResolver>(
    resolver: &R,
    bp: &Breakpoint,
    module: Option<usize>,
) -> Result<usize, BreakpointError> {
    let ret = resolver.resolve(&bp.addr_str, module);
    match ret.error {
        None => {}
        Some(AddressError::Garbage) if ret.value != 0 => {
            warn!(
                "{}: ignoring {:?} after address",
                bp.name,
                &bp.addr_str[ret.consumed..]
            );
        }
        Some(error) => {
            return Err(BreakpointError::Unresolved {
                addr: bp.addr_str.clone(),
                error,
            })
        }
    }
    match ret.value {
        0 => Err(BreakpointError::NullAddress),
        addr => Ok(addr),
    }
}

/// Fills the breakpoint's relay slot: the displaced bytes, then a jump back behind them.
///
/// A leading `call rel32` / `jmp rel32` is re-encoded so that it still reaches its original target.
///
/// # Safety
///
/// `bp.addr` must be readable for `bp.cavesize` bytes, `slot` must be the memory at `bp.cave`.
unsafe fn build_relay(bp: &Breakpoint, slot: &mut [u8]) -> Result<(), CodeError> {
    let original = slice::from_raw_parts(bp.addr as *const u8, bp.cavesize);
    let mut relay = CodeBuffer::new(slot, bp.cave);

    match leading_branch(original, bp.addr) {
        Some((opcode, target)) => {
            relay.emit_branch(opcode, target)?;
            relay.emit(&original[BRANCH_LEN..])?;
            debug!(
                "fixing rel.addr. {:#x} to {:#x}",
                i32::from_le_bytes([original[1], original[2], original[3], original[4]]),
                i32::from_le_bytes([
                    relay.written()[1],
                    relay.written()[2],
                    relay.written()[3],
                    relay.written()[4]
                ])
            );
        }
        None => relay.emit(original)?,
    }
    relay.emit_jmp(bp.addr + bp.cavesize)?;

    trace!(
        "relay cave of {}:\n{}",
        bp.name,
        disassemble(relay.written(), bp.cave)
    );
    Ok(())
}

/// Builds the caves of an initialized breakpoint and patches its site
///
/// # Safety
///
/// See [`build_relay`]. The site must not be executing.
unsafe fn install(
    bp: &Breakpoint,
    slot: &mut [u8],
    trampoline: &Trampoline,
    calls: &mut CodeBuffer,
) -> Result<SiteGuard, BreakpointError> {
    build_relay(bp, slot)?;
    let entry = trampoline.instantiate(calls, bp as *const Breakpoint as usize)?;
    Ok(CALL_HOOK.hook(bp.addr as *const u8, entry as *const u8, bp.cavesize)?)
}

/// Applies breakpoints, resolving their addresses with the registry.
///
/// `module` is the base for `Rx` addresses, [`registry::module`] if `None`.
///
/// # Safety
///
/// Resolved addresses must be the start of instructions, with `cavesize` bytes that contain whole
/// instructions and no relative addressing besides a leading `call rel32` / `jmp rel32`.
/// No thread may be executing the patched code while this runs.
pub unsafe fn apply(requests: &[BreakpointRequest], module: Option<usize>) -> BreakpointSet {
    apply_with(requests, module, &SymbolResolver::new())
}

/// Applies breakpoints with a custom address resolver.
///
/// Failing breakpoints are logged and skipped; see [`BreakpointSet::failed`].
///
/// # Safety
///
/// See [`apply`]
pub unsafe fn apply_with<R: AddressResolver>(
    requests: &[BreakpointRequest],
    module: Option<usize>,
    resolver: &R,
) -> BreakpointSet {
    let mut breakpoints: Box<[Breakpoint]> = requests.iter().map(Breakpoint::new).collect();
    let count = breakpoints.len();
    if count == 0 {
        info!("No breakpoints to set up.");
        return BreakpointSet::empty(breakpoints);
    }

    let addrs: Vec<_> = breakpoints
        .iter()
        .map(|bp| resolve(resolver, bp, module))
        .collect();

    // caves have to be within rel32 reach of the sites
    let origin = module
        .or_else(registry::module)
        .or_else(|| addrs.iter().find_map(|addr| addr.as_ref().ok().copied()));
    let Some(origin) = origin else {
        error!("None of the {count} breakpoints resolved");
        for (bp, addr) in breakpoints.iter().zip(&addrs) {
            if let Err(e) = addr {
                error!("{}: {e}", bp.name);
            }
        }
        return BreakpointSet::empty(breakpoints);
    };

    let caves = alloc::allocate_executable(origin, count * BP_OFFSET).and_then(|relay| {
        alloc::allocate_executable(origin, count * TRAMPOLINE_LEN).map(|call| (relay, call))
    });
    let (mut relay_cave, mut call_cave) = match caves {
        Ok(caves) => caves,
        Err(e) => {
            error!("can't allocate caves for {count} breakpoints: {e}");
            return BreakpointSet::empty(breakpoints);
        }
    };
    relay_cave.fill(INT3);

    info!(
        "Setting up breakpoints... (source cave at {:#x}, call cave at {:#x})",
        relay_cave.address(),
        call_cave.address()
    );
    info!("-------------------------");

    let trampoline = Trampoline::new(breakpoint_process as usize);
    let relay_base = relay_cave.address();
    let mut calls = CodeBuffer::in_place(&mut call_cave);
    let mut sites = Vec::with_capacity(count);
    let mut installed = Vec::with_capacity(count);

    for (i, ((bp, slot), addr)) in breakpoints
        .iter_mut()
        .zip(relay_cave.chunks_exact_mut(BP_OFFSET))
        .zip(addrs)
        .enumerate()
    {
        let shown = addr.as_ref().copied().unwrap_or(0);
        let result = addr.and_then(|addr| {
            check_region(addr, BP_OFFSET)?;
            bp.init(addr, relay_base + i * BP_OFFSET)?;
            install(bp, slot, &trampoline, &mut calls)
        });

        match result {
            Ok(site) => {
                info!("({:2}/{:2}) {shown:#010x} {}... OK", i + 1, count, bp.name);
                sites.push(site);
                installed.push(i);
            }
            Err(e) => error!("({:2}/{:2}) {shown:#010x} {}... {e}", i + 1, count, bp.name),
        }
    }
    info!("-------------------------");

    BreakpointSet {
        sites,
        call_cave: Some(call_cave),
        relay_cave: Some(relay_cave),
        breakpoints,
        installed,
    }
}

lazy_static! {
    /// Batches applied through [`breakpoints_apply`]
    static ref APPLIED: Mutex<Vec<BreakpointSet>> = Mutex::new(Vec::new());
}

/// Applies breakpoints and keeps them installed until [`breakpoints_remove_all`].
///
/// Returns the number of breakpoints that failed.
///
/// # Safety
///
/// See [`apply`]
pub unsafe fn breakpoints_apply(requests: &[BreakpointRequest], module: Option<usize>) -> usize {
    let set = apply(requests, module);
    let failed = set.failed();
    APPLIED.lock().push(set);
    failed
}

/// Removes every breakpoint installed with [`breakpoints_apply`]
///
/// # Safety
///
/// No thread may be executing inside a breakpoint's caves or patched site.
pub unsafe fn breakpoints_remove_all() {
    let sets = std::mem::take(&mut *APPLIED.lock());
    let count: usize = sets.iter().map(|set| set.installed.len()).sum();
    drop(sets);
    debug!("removed {count} breakpoints");
}
