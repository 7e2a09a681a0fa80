//! # Registry
//!
//! Process-wide tables consulted while breakpoints are applied and evaluated:
//! breakpoint callbacks (`BP_<name>`), named functions usable as `<symbol>` addresses, and typed patch options.
//!
//! The tables are populated during startup and are read-only afterwards; lookups only take a shared lock,
//! so hook callbacks on any thread can use them.

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error};

use crate::breakpoint::BreakpointFn;
use crate::json::hex_value;

/// Prefix that turns a breakpoint name into its callback's registry key
pub const BP_PREFIX: &str = "BP_";

/// Value of a patch option
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatchOption {
    /// `i8`
    Byte(u8),
    /// `i16`
    Word(u16),
    /// `i32`
    Dword(u32),
    /// `f32`
    Float(f32),
    /// `f64`
    Double(f64),
}

impl PatchOption {
    /// Size of the value in bytes
    pub fn size(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::Word(_) => 2,
            Self::Dword(_) | Self::Float(_) => 4,
            Self::Double(_) => 8,
        }
    }

    /// The option as a machine word, as used by address expressions.
    ///
    /// Floating-point options yield their bit pattern.
    pub fn as_word(&self) -> usize {
        match *self {
            Self::Byte(v) => v as usize,
            Self::Word(v) => v as usize,
            Self::Dword(v) => v as usize,
            Self::Float(v) => v.to_bits() as usize,
            Self::Double(v) => v.to_bits() as usize,
        }
    }
}

/// All process-wide tables
#[derive(Default)]
struct Registry {
    /// Base address of the main target module, used for `Rx` addresses
    module: Option<usize>,
    /// Breakpoint callbacks, keyed with [`BP_PREFIX`]
    breakpoints: HashMap<String, BreakpointFn>,
    /// Named addresses
    functions: HashMap<String, usize>,
    /// Patch options
    options: HashMap<String, PatchOption>,
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::default());
}

/// Initializes the registry for a new target module, discarding anything registered before
pub fn init(module: Option<usize>) {
    let mut registry = REGISTRY.write();
    *registry = Registry {
        module,
        ..Default::default()
    };
    debug!(module = ?module.map(|m| format!("{m:#x}")), "registry initialized");
}

/// Clears every table
pub fn teardown() {
    *REGISTRY.write() = Registry::default();
    debug!("registry torn down");
}

/// Base address of the main target module
pub fn module() -> Option<usize> {
    REGISTRY.read().module
}

/// Registers the callback for breakpoints named `name` (or `name#slot`)
pub fn register_breakpoint(name: &str, func: BreakpointFn) {
    REGISTRY
        .write()
        .breakpoints
        .insert(format!("{BP_PREFIX}{name}"), func);
}

/// Looks up a callback by its full key, e.g. `BP_file_size`
pub fn breakpoint_get(key: &str) -> Option<BreakpointFn> {
    REGISTRY.read().breakpoints.get(key).copied()
}

/// Registers a named address
pub fn register_function(name: &str, addr: usize) {
    REGISTRY.write().functions.insert(name.to_owned(), addr);
}

/// Looks up a named address
pub fn func_get(name: &str) -> Option<usize> {
    REGISTRY.read().functions.get(name).copied()
}

/// Looks up a patch option
pub fn opt_get(name: &str) -> Option<PatchOption> {
    REGISTRY.read().options.get(name).copied()
}

/// Loads patch options from a JSON object of the form `{ "name": { "type": "i32", "val": "0x10" } }`.
///
/// Malformed options are logged and skipped. Returns the number of options loaded.
pub fn opts_from_json(opts: &Value) -> usize {
    let Some(opts) = opts.as_object() else {
        error!("patch options must be a JSON object");
        return 0;
    };
    let mut loaded = 0;
    let mut registry = REGISTRY.write();
    for (key, val) in opts {
        match option_from_json(val) {
            Ok(option) => {
                registry.options.insert(key.clone(), option);
                loaded += 1;
            }
            Err(msg) => error!("{msg} for option {key}"),
        }
    }
    loaded
}

/// Parses a single `{ "type", "val" }` option
fn option_from_json(val: &Value) -> Result<PatchOption, &'static str> {
    let obj = val.as_object().ok_or("invalid parameter")?;
    let value = obj
        .get("val")
        .filter(|v| v.is_number() || v.is_string())
        .ok_or("invalid format for value")?;
    let tname = obj.get("type").and_then(Value::as_str).unwrap_or("");
    let mut chars = tname.chars();
    let kind = chars.next();
    let bits: usize = chars.as_str().parse().map_err(|_| "invalid type")?;
    match (kind, bits / 8) {
        (Some('i'), size) => {
            if value.is_f64() {
                return Err("float value specified for integer option");
            }
            let v = hex_value(value).ok_or("invalid integer value")?;
            match size {
                1 => Ok(PatchOption::Byte(v as u8)),
                2 => Ok(PatchOption::Word(v as u16)),
                4 => Ok(PatchOption::Dword(v as u32)),
                _ => Err("invalid integer type"),
            }
        }
        (Some('f'), size) => {
            let real = match value {
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| "invalid float value")?,
                v => v.as_f64().ok_or("invalid float value")?,
            };
            match size {
                4 => Ok(PatchOption::Float(real as f32)),
                8 => Ok(PatchOption::Double(real)),
                _ => Err("invalid float type"),
            }
        }
        _ => Err("invalid type"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{breakpoint_get, func_get, opt_get, opts_from_json, register_breakpoint, register_function, PatchOption};
    use crate::regs::X86Regs;

    fn noop(_regs: &mut X86Regs, _params: &Value) -> bool {
        true
    }

    #[test]
    /// Callbacks are stored under their `BP_` key
    fn test_breakpoint_key() {
        register_breakpoint("registry_test_noop", noop);
        assert!(breakpoint_get("BP_registry_test_noop").is_some());
        assert!(breakpoint_get("registry_test_noop").is_none());
    }

    #[test]
    /// Named functions round through the table
    fn test_functions() {
        register_function("registry_test_fn", 0x1234);
        assert_eq!(func_get("registry_test_fn"), Some(0x1234));
        assert_eq!(func_get("registry_test_missing"), None);
    }

    #[test]
    /// Typed options, with bad entries skipped
    fn test_options() {
        let opts = json!({
            "registry_opt_byte": { "type": "i8", "val": 300 },
            "registry_opt_dword": { "type": "i32", "val": "0x10" },
            "registry_opt_float": { "type": "f32", "val": "1.5" },
            "registry_opt_double": { "type": "f64", "val": 2 },
            "registry_opt_bad_int": { "type": "i32", "val": 1.5 },
            "registry_opt_bad_size": { "type": "i24", "val": 1 },
            "registry_opt_not_obj": 5,
        });
        assert_eq!(opts_from_json(&opts), 4);
        assert_eq!(opt_get("registry_opt_byte"), Some(PatchOption::Byte(44)));
        assert_eq!(opt_get("registry_opt_dword"), Some(PatchOption::Dword(0x10)));
        assert_eq!(opt_get("registry_opt_float"), Some(PatchOption::Float(1.5)));
        assert_eq!(opt_get("registry_opt_double"), Some(PatchOption::Double(2.0)));
        assert_eq!(opt_get("registry_opt_bad_int"), None);
        assert_eq!(opt_get("registry_opt_bad_size"), None);
        assert_eq!(opt_get("registry_opt_dword").unwrap().size(), 4);
    }
}
