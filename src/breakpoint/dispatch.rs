//! Dispatch routine called by every trampoline

use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use tracing::error;

use super::Breakpoint;
use crate::regs::X86Regs;

/// Runs the callback of the breakpoint that was hit.
///
/// If the callback returns `true`, the trampoline returns into the breakpoint's relay cave, otherwise to the
/// instruction after the patched site. `popad` doesn't restore `esp`, so a changed `esp` is applied by moving
/// the whole register block by the difference. The difference is returned for the trampoline to follow it.
///
/// A panicking callback is treated as returning `false` without touching the stack.
///
/// # Safety
///
/// `bp` must be null or point to an initialized [`Breakpoint`]. `regs` must be null or point to the register
/// block saved by the trampoline, with room on the stack for it to be moved to wherever the callback points `esp`.
pub unsafe extern "C" fn breakpoint_process(bp: *const Breakpoint, regs: *mut X86Regs) -> usize {
    let (Some(bp), Some(saved)) = (bp.as_ref(), regs.as_mut()) else {
        error!("breakpoint_process: called without a breakpoint or registers");
        return 0;
    };
    let Some(func) = bp.func else {
        return 0;
    };

    let esp_prev = saved.esp;
    let retaddr_prev = saved.retaddr;

    match panic::catch_unwind(AssertUnwindSafe(|| func(saved, &bp.params))) {
        Ok(true) => saved.retaddr = bp.cave,
        Ok(false) => {}
        Err(_) => {
            error!(name = %bp.name, "breakpoint callback panicked");
            saved.esp = esp_prev;
            saved.retaddr = retaddr_prev;
            return 0;
        }
    }

    let esp_diff = saved.esp.wrapping_sub(esp_prev);
    if esp_diff != 0 {
        let moved = regs.cast::<u8>().wrapping_offset(esp_diff as isize).cast::<X86Regs>();
        ptr::copy(regs, moved, 1);
    }
    esp_diff
}

#[cfg(test)]
mod tests {
    use std::mem;

    use serde_json::{json, Value};

    use super::breakpoint_process;
    use crate::breakpoint::Breakpoint;
    use crate::config::BreakpointRequest;
    use crate::json::cave_exec_flag;
    use crate::regs::X86Regs;

    fn follow_config(_regs: &mut X86Regs, params: &Value) -> bool {
        cave_exec_flag(params)
    }

    fn push_two(regs: &mut X86Regs, _params: &Value) -> bool {
        regs.esp -= 8;
        false
    }

    fn boom(regs: &mut X86Regs, _params: &Value) -> bool {
        regs.esp += 16;
        regs.retaddr = 0;
        panic!("boom");
    }

    fn breakpoint(func: super::super::BreakpointFn, params: Value) -> Breakpoint {
        let mut request = BreakpointRequest::new("dispatch_test", "0x1000", 5);
        request.params = params;
        Breakpoint {
            addr: 0x1000,
            cave: 0x2000,
            func: Some(func),
            ..Breakpoint::new(&request)
        }
    }

    fn sample() -> X86Regs {
        X86Regs {
            edi: 1,
            esi: 2,
            ebp: 3,
            esp: 0x8000,
            ebx: 5,
            edx: 6,
            ecx: 7,
            eax: 8,
            retaddr: 0x1005,
        }
    }

    #[test]
    /// The return value picks between the relay cave and falling through
    fn test_redirect() {
        let bp = breakpoint(follow_config, json!({}));
        let mut regs = sample();
        assert_eq!(unsafe { breakpoint_process(&bp, &mut regs) }, 0);
        assert_eq!(regs.retaddr, 0x2000);

        let bp = breakpoint(follow_config, json!({ "cave_exec": false }));
        let mut regs = sample();
        assert_eq!(unsafe { breakpoint_process(&bp, &mut regs) }, 0);
        assert_eq!(regs, sample());
    }

    #[test]
    /// Lowering esp by 8 moves the register block 8 bytes down, values intact
    fn test_esp_shift() {
        let bp = breakpoint(push_two, json!({}));
        let mut stack = [0usize; 32];
        let words = 8 / mem::size_of::<usize>();
        let regs = unsafe { stack.as_mut_ptr().add(16).cast::<X86Regs>() };
        unsafe { regs.write(sample()) };

        let diff = unsafe { breakpoint_process(&bp, regs) };
        assert_eq!(diff as isize, -8);

        let moved = unsafe { stack.as_ptr().add(16 - words).cast::<X86Regs>().read() };
        assert_eq!(
            moved,
            X86Regs {
                esp: 0x8000 - 8,
                ..sample()
            }
        );
    }

    #[test]
    /// A panicking callback neither redirects nor moves the stack
    fn test_panic() {
        let bp = breakpoint(boom, json!({}));
        let mut regs = sample();
        assert_eq!(unsafe { breakpoint_process(&bp, &mut regs) }, 0);
        assert_eq!(regs, sample());
    }

    #[test]
    /// Null pointers and missing callbacks are ignored
    fn test_degenerate() {
        let mut regs = sample();
        assert_eq!(unsafe { breakpoint_process(std::ptr::null(), &mut regs) }, 0);

        let bp = Breakpoint::new(&BreakpointRequest::new("dispatch_test", "0x1000", 5));
        assert_eq!(unsafe { breakpoint_process(&bp, &mut regs) }, 0);
        assert_eq!(unsafe { breakpoint_process(&bp, std::ptr::null_mut()) }, 0);
        assert_eq!(regs, sample());
    }
}
