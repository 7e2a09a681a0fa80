//! # JSON parameters
//!
//! Reading breakpoint parameters out of the JSON object a breakpoint was configured with.
//! Values may be plain integers or expression strings (see [`crate::expr`]).

use serde_json::Value;
use tracing::error;

use crate::expr;
use crate::regs::X86Regs;

/// Integer value of a JSON number, or of a string holding a decimal or `0x`-prefixed hexadecimal number
pub fn hex_value(val: &Value) -> Option<usize> {
    match val {
        Value::Number(n) => n
            .as_u64()
            .map(|v| v as usize)
            .or_else(|| n.as_i64().map(|v| v as usize)),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => usize::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

/// Evaluates a parameter to a value.
///
/// `null` and missing values are 0, integers are taken as-is and strings are evaluated as expressions.
/// Errors are logged and yield 0.
///
/// # Safety
///
/// See [`expr::eval`]
pub unsafe fn immediate_value(val: Option<&Value>, regs: Option<&X86Regs>) -> usize {
    match val {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|v| v as usize)
            .or_else(|| n.as_u64().map(|v| v as usize))
            .unwrap_or_else(|| {
                error!("immediate_value: the expression must be either an integer or a string.");
                0
            }),
        Some(Value::String(s)) => expr::immediate(s, regs),
        Some(_) => {
            error!("immediate_value: the expression must be either an integer or a string.");
            0
        }
    }
}

/// Evaluates a parameter to the address of what it denotes. Only strings naming a register or a dereference qualify.
///
/// # Safety
///
/// See [`expr::eval`]
pub unsafe fn pointer_value(val: Option<&Value>, regs: &mut X86Regs) -> Option<*mut usize> {
    let expr = val?.as_str()?;
    expr::pointer_or_none(expr, regs)
}

/// Slot of the register named by a parameter
pub fn register_pointer<'r>(val: Option<&Value>, regs: &'r mut X86Regs) -> Option<&'r mut usize> {
    expr::register_pointer(val?.as_str()?, regs)
}

/// [`immediate_value`] of `object[key]`
///
/// # Safety
///
/// See [`expr::eval`]
pub unsafe fn object_get_immediate(object: &Value, regs: Option<&X86Regs>, key: &str) -> usize {
    immediate_value(object.get(key), regs)
}

/// [`pointer_value`] of `object[key]`
///
/// # Safety
///
/// See [`expr::eval`]
pub unsafe fn object_get_pointer(
    object: &Value,
    regs: &mut X86Regs,
    key: &str,
) -> Option<*mut usize> {
    pointer_value(object.get(key), regs)
}

/// [`register_pointer`] of `object[key]`
pub fn object_get_register<'r>(
    object: &Value,
    regs: &'r mut X86Regs,
    key: &str,
) -> Option<&'r mut usize> {
    register_pointer(object.get(key), regs)
}

/// Whether a breakpoint should continue into its relay cave. Anything but an explicit `"cave_exec": false` means yes.
pub fn cave_exec_flag(params: &Value) -> bool {
    !matches!(params.get("cave_exec"), Some(Value::Bool(false)))
}
