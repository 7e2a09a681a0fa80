//! # Address
//!
//! Resolution of textual addresses (`0x401000`, `Rx1000`, `<symbol>`, `<option:name>`, `1234`) into numbers

use thiserror::Error;

use crate::registry;

/// Why an address string did not resolve cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    /// `<name>` is not a registered function or option
    #[error("symbol not found")]
    SymbolNotFound,
    /// The number doesn't fit a machine word
    #[error("value out of range")]
    Overflow,
    /// A module-relative address was given, but there is no module to be relative to
    #[error("module-relative address without a module")]
    NoModule,
    /// Characters remain after the address. The value is still valid
    #[error("trailing characters after address")]
    Garbage,
}

/// Result of resolving an address string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressValue {
    /// Resolved value, 0 if nothing could be resolved
    pub value: usize,
    /// Number of bytes of the input that were consumed
    pub consumed: usize,
    /// Classification of anything that went wrong
    pub error: Option<AddressError>,
}

impl AddressValue {
    /// The value, if the whole string was a valid address
    pub fn ok(&self) -> Option<usize> {
        match self.error {
            None => Some(self.value),
            Some(_) => None,
        }
    }
}

/// Turns address expressions into numbers
pub trait AddressResolver {
    /// Resolves the address at the start of `text`.
    ///
    /// `module` is the base for module-relative addresses, overriding the resolver's own default.
    fn resolve(&self, text: &str, module: Option<usize>) -> AddressValue;
}

/// Default resolver backed by the process-wide [`registry`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolResolver {
    /// Base used for `Rx` addresses when the caller doesn't supply one.
    /// Falls back to [`registry::module`] when `None`.
    module: Option<usize>,
}

impl SymbolResolver {
    /// Creates a resolver using the registry's module
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver with an explicit default module
    pub fn with_module(module: usize) -> Self {
        Self {
            module: Some(module),
        }
    }

    /// Looks up `<name>` or `<option:name>`
    fn symbol(name: &str) -> Option<usize> {
        match name.strip_prefix("option:") {
            Some(opt) => registry::opt_get(opt).map(|o| o.as_word()),
            None => registry::func_get(name),
        }
    }
}

impl AddressResolver for SymbolResolver {
    fn resolve(&self, text: &str, module: Option<usize>) -> AddressValue {
        let bytes = text.as_bytes();

        if bytes.first() == Some(&b'<') {
            let Some(close) = text.find('>') else {
                return failure(AddressError::SymbolNotFound);
            };
            let consumed = close + 1;
            return match Self::symbol(&text[1..close]) {
                Some(value) => AddressValue {
                    value,
                    consumed,
                    error: (consumed < text.len()).then_some(AddressError::Garbage),
                },
                None => AddressValue {
                    value: 0,
                    consumed,
                    error: Some(AddressError::SymbolNotFound),
                },
            };
        }

        let (offset, radix, skip) = match bytes {
            [b'0', b'x' | b'X', ..] => (0, 16, 2),
            [b'R' | b'r', b'x' | b'X', ..] => {
                let Some(base) = module.or(self.module).or_else(registry::module) else {
                    return failure(AddressError::NoModule);
                };
                (base, 16, 2)
            }
            _ => (0, 10, 0),
        };

        let digits = text[skip..]
            .bytes()
            .take_while(|b| (*b as char).is_digit(radix))
            .count();
        if digits == 0 {
            return failure(AddressError::Garbage);
        }
        let consumed = skip + digits;
        let Ok(value) = usize::from_str_radix(&text[skip..consumed], radix) else {
            return AddressValue {
                value: 0,
                consumed,
                error: Some(AddressError::Overflow),
            };
        };
        AddressValue {
            value: value.wrapping_add(offset),
            consumed,
            error: (consumed < text.len()).then_some(AddressError::Garbage),
        }
    }
}

/// Nothing consumed, nothing resolved
fn failure(error: AddressError) -> AddressValue {
    AddressValue {
        value: 0,
        consumed: 0,
        error: Some(error),
    }
}
