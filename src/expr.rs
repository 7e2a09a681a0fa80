//! # Expressions
//!
//! Evaluates the small expression language breakpoint parameters are written in, e.g. `[ebp-8]`,
//! `dword ptr [eax+0x10] * 2` or `Rx1f4c0 + ecx*4`.
//!
//! There is no operator precedence: every operator is folded into the running value as soon as the atom
//! after it has been read, so `1+2*3` is `9`. Parentheses are the only way to group. Existing patches
//! rely on this, so it must stay that way.
//!
//! Atoms are
//! - numbers and symbols, as understood by an [`AddressResolver`],
//! - register names, which read the register's value from the [`X86Regs`] snapshot,
//! - `( expr )`,
//! - `[ expr ]`, which reads memory at the address `expr` evaluates to.
//!
//! Registers and `[ ]` may be prefixed with `byte ptr`, `word ptr` or `dword ptr` to read fewer bytes than a
//! machine word.

use std::mem;
use std::ptr;

use thiserror::Error;
use tracing::{error, warn};

use crate::address::{AddressError, AddressResolver, SymbolResolver};
use crate::regs::X86Regs;

/// Errors while evaluating an expression. Each carries the unparsed remainder of the expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    /// Something that is neither an operator nor an atom
    #[error("Error while evaluating expression around '{0}': unknown character.")]
    UnknownCharacter(String),
    /// A `[` that is never closed
    #[error("Error while evaluating expression around '{0}': '[' without matching ']'.")]
    UnmatchedBracket(String),
    /// `/` or `%` by zero
    #[error("Error while evaluating expression around '{0}': division by zero.")]
    DivisionByZero(String),
    /// The expression has no memory location
    #[error("'{0}' is neither a register nor a dereference")]
    NotAddressable(String),
}

/// Binary operators
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    Eq,
    Ne,
    Le,
    Ge,
}

impl Op {
    /// Two-character operators, which must be tried before the single-character ones
    const TWO_CHAR: [(&'static str, Op); 4] =
        [("==", Op::Eq), ("!=", Op::Ne), ("<=", Op::Le), (">=", Op::Ge)];

    /// Single-character operators
    fn from_char(c: u8) -> Option<Op> {
        Some(match c {
            b'+' => Op::Add,
            b'-' => Op::Sub,
            b'*' => Op::Mul,
            b'/' => Op::Div,
            b'%' => Op::Rem,
            b'<' => Op::Lt,
            b'>' => Op::Gt,
            _ => return None,
        })
    }

    /// Folds `rhs` into `lhs`. `None` on division by zero.
    fn apply(self, lhs: usize, rhs: usize) -> Option<usize> {
        Some(match self {
            Op::Add => lhs.wrapping_add(rhs),
            Op::Sub => lhs.wrapping_sub(rhs),
            Op::Mul => lhs.wrapping_mul(rhs),
            Op::Div => lhs.checked_div(rhs)?,
            Op::Rem => lhs.checked_rem(rhs)?,
            Op::Lt => (lhs < rhs) as usize,
            Op::Gt => (lhs > rhs) as usize,
            Op::Eq => (lhs == rhs) as usize,
            Op::Ne => (lhs != rhs) as usize,
            Op::Le => (lhs <= rhs) as usize,
            Op::Ge => (lhs >= rhs) as usize,
        })
    }
}

/// Size qualifiers for memory and register reads
const PTR_SIZES: [(&str, usize); 3] = [("byte ptr", 1), ("word ptr", 2), ("dword ptr", 4)];

/// Character that ends a (sub-)expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// End of input
    End,
    /// `)`
    Paren,
    /// `]`
    Bracket,
}

impl Terminator {
    /// The terminating character, if any
    fn char(self) -> Option<u8> {
        match self {
            Terminator::End => None,
            Terminator::Paren => Some(b')'),
            Terminator::Bracket => Some(b']'),
        }
    }
}

/// Reads `size` bytes from `addr`, zero-extended to a machine word
///
/// # Safety
///
/// `addr` must be valid for reads of `size` bytes
unsafe fn dereference(addr: usize, size: usize) -> usize {
    let mut ret = 0usize;
    ptr::copy_nonoverlapping(
        addr as *const u8,
        &mut ret as *mut usize as *mut u8,
        size.min(mem::size_of::<usize>()),
    );
    ret
}

/// Keeps the low `size` bytes of `value`, the same as reading a narrower pointer to it
fn truncate(value: usize, size: usize) -> usize {
    if size >= mem::size_of::<usize>() {
        value
    } else {
        value & ((1usize << (size * 8)) - 1)
    }
}

/// Recursive-descent state over one expression string
struct Parser<'e, 'r, R> {
    /// Whole expression
    input: &'e str,
    /// Current byte offset into `input`
    pos: usize,
    /// Register snapshot. Without one, register names are handed to the resolver like any other symbol
    regs: Option<&'r X86Regs>,
    /// Resolver for numbers and symbols
    resolver: &'r R,
}

impl<'e, 'r, R: AddressResolver> Parser<'e, 'r, R> {
    /// Unparsed remainder
    fn rest(&self) -> &'e str {
        &self.input[self.pos..]
    }

    /// Next unparsed byte
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    /// Consumes `token` if the input continues with it, ignoring ASCII case
    fn consume(&mut self, token: &str) -> bool {
        let matches = self
            .rest()
            .get(..token.len())
            .map_or(false, |head| head.eq_ignore_ascii_case(token));
        if matches {
            self.pos += token.len();
        }
        matches
    }

    /// Skips spaces and tabs
    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    /// Consumes an operator if there is one
    fn operator(&mut self) -> Option<Op> {
        for (token, op) in Op::TWO_CHAR {
            if self.consume(token) {
                return Some(op);
            }
        }
        let op = Op::from_char(self.peek()?)?;
        self.pos += 1;
        Some(op)
    }

    /// Consumes a size qualifier, defaulting to a machine word
    fn ptr_size(&mut self) -> usize {
        PTR_SIZES
            .into_iter()
            .find(|(token, _)| self.consume(token))
            .map_or(mem::size_of::<usize>(), |(_, size)| size)
    }

    /// Evaluates up to and including `end`
    ///
    /// # Safety
    ///
    /// Every address dereferenced by the expression must be readable
    unsafe fn expression(&mut self, end: Terminator) -> Result<usize, ExprError> {
        let mut value = 0usize;
        let mut op = Op::Add;

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break,
                c if c == end.char() => break,
                _ => {}
            }
            if let Some(next) = self.operator() {
                op = next;
                continue;
            }

            let size = self.ptr_size();
            self.skip_whitespace();
            let start = self.rest();
            let cur = self.atom(size)?;
            value = op
                .apply(value, cur)
                .ok_or_else(|| ExprError::DivisionByZero(start.to_owned()))?;
        }

        if end == Terminator::Bracket && self.peek() != end.char() {
            return Err(ExprError::UnmatchedBracket(self.rest().to_owned()));
        }
        if self.peek().is_some() {
            self.pos += 1;
        }
        Ok(value)
    }

    /// Evaluates a single atom
    ///
    /// # Safety
    ///
    /// See [`Parser::expression`]
    unsafe fn atom(&mut self, size: usize) -> Result<usize, ExprError> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                return self.expression(Terminator::Paren);
            }
            Some(b'[') => {
                self.pos += 1;
                let addr = self.expression(Terminator::Bracket)?;
                return Ok(if addr != 0 { dereference(addr, size) } else { 0 });
            }
            _ => {}
        }

        let rest = self.rest();
        if let Some(regs) = self.regs {
            if let Some((reg, _)) = crate::regs::Register::parse_prefix(rest) {
                self.pos += 3;
                return Ok(truncate(regs.get(reg), size));
            }
        }

        let addr = self.resolver.resolve(rest, None);
        if addr.consumed == 0 || matches!(addr.error, Some(e) if e != AddressError::Garbage) {
            return Err(ExprError::UnknownCharacter(rest.to_owned()));
        }
        self.pos += addr.consumed;
        Ok(addr.value)
    }
}

/// Evaluates `expr` against `regs` using the default [`SymbolResolver`]
///
/// # Safety
///
/// Every address dereferenced by the expression (`[...]`) must be readable for the size being read
pub unsafe fn eval(expr: &str, regs: Option<&X86Regs>) -> Result<usize, ExprError> {
    eval_with(expr, regs, &SymbolResolver::new())
}

/// Evaluates `expr` against `regs`, resolving numbers and symbols with `resolver`
///
/// # Safety
///
/// See [`eval`]
pub unsafe fn eval_with<R: AddressResolver>(
    expr: &str,
    regs: Option<&X86Regs>,
    resolver: &R,
) -> Result<usize, ExprError> {
    Parser {
        input: expr,
        pos: 0,
        regs,
        resolver,
    }
    .expression(Terminator::End)
}

/// Evaluates `expr`, logging any error and returning 0 for it.
///
/// A legitimate result of 0 and a failure can't be told apart; use [`eval`] when that matters.
///
/// # Safety
///
/// See [`eval`]
pub unsafe fn immediate(expr: &str, regs: Option<&X86Regs>) -> usize {
    eval(expr, regs).unwrap_or_else(|e| {
        error!("{e}");
        0
    })
}

/// Address of the value `expr` denotes.
///
/// Only a bare register name (which yields its slot in `regs`) or a top-level dereference like `[ebp-8]`
/// (which yields `ebp-8`) have an address.
///
/// # Safety
///
/// See [`eval`]
pub unsafe fn pointer(expr: &str, regs: &mut X86Regs) -> Result<*mut usize, ExprError> {
    if let Some((slot, "")) = regs.reg(expr) {
        return Ok(slot as *mut usize);
    }
    let Some(inner) = expr.strip_prefix('[') else {
        return Err(ExprError::NotAddressable(expr.to_owned()));
    };

    let resolver = SymbolResolver::new();
    let mut parser = Parser {
        input: inner,
        pos: 0,
        regs: Some(&*regs),
        resolver: &resolver,
    };
    let addr = parser.expression(Terminator::Bracket)?;
    if !parser.rest().is_empty() {
        warn!("leftover bytes after dereferencing: '{}'", parser.rest());
    }
    Ok(addr as *mut usize)
}

/// [`pointer`], logging any error and returning `None` for it
///
/// # Safety
///
/// See [`eval`]
pub unsafe fn pointer_or_none(expr: &str, regs: &mut X86Regs) -> Option<*mut usize> {
    pointer(expr, regs)
        .map_err(|e| error!("{e}"))
        .ok()
}

/// Slot of the register named at the start of `name`
pub fn register_pointer<'r>(name: &str, regs: &'r mut X86Regs) -> Option<&'r mut usize> {
    regs.reg(name).map(|(slot, _)| slot)
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::{eval, eval_with, pointer, register_pointer, ExprError};
    use crate::address::SymbolResolver;
    use crate::regs::{Register, X86Regs};

    /// Evaluates without registers, panicking on error
    fn value(expr: &str) -> usize {
        unsafe { eval(expr, None).unwrap() }
    }

    #[test]
    /// Operators apply strictly left to right
    fn test_no_precedence() {
        assert_eq!(value("1+2*3"), 9);
        assert_eq!(value("(1+2)*3"), 9);
        assert_eq!(value("1+(2*3)"), 7);
        assert_eq!(value("10-2-3"), 5);
        assert_eq!(value("17 % 5 * 2"), 4);
        assert_eq!(value("0x10 / 4"), 4);
    }

    #[test]
    /// Comparisons fold to 0 or 1
    fn test_comparisons() {
        assert_eq!(value("3 == 3"), 1);
        assert_eq!(value("3 != 3"), 0);
        assert_eq!(value("2 <= 3"), 1);
        assert_eq!(value("2 >= 3"), 0);
        assert_eq!(value("2 < 3"), 1);
        assert_eq!(value("2 > 3"), 0);
        // (1 + 1) == 2
        assert_eq!(value("1 + 1 == 2"), 1);
    }

    #[test]
    /// Whitespace between tokens doesn't matter
    fn test_whitespace() {
        assert_eq!(value("  1 +\t2 "), 3);
        assert_eq!(value("( 1 + 2 ) * 3"), 9);
        assert_eq!(value("-5 + 10"), 5);
    }

    #[test]
    /// Registers yield their values, in any case
    fn test_registers() {
        let regs = X86Regs {
            eax: 5,
            ecx: 7,
            esp: 0x100,
            ..Default::default()
        };
        unsafe {
            assert_eq!(eval("eax", Some(&regs)).unwrap(), 5);
            assert_eq!(eval("EAX + ecx", Some(&regs)).unwrap(), 12);
            assert_eq!(eval("esp-4", Some(&regs)).unwrap(), 0xfc);
            assert_eq!(eval("byte ptr ecx", Some(&regs)).unwrap(), 7);
        }
    }

    #[test]
    /// Memory reads of every size
    fn test_dereference() {
        let data: u32 = 0x1234_5678;
        let regs = X86Regs {
            eax: &data as *const u32 as usize,
            ..Default::default()
        };
        unsafe {
            assert_eq!(eval("dword ptr [eax]", Some(&regs)).unwrap(), 0x1234_5678);
            assert_eq!(eval("word ptr [eax]", Some(&regs)).unwrap(), 0x5678);
            assert_eq!(eval("byte ptr [eax]", Some(&regs)).unwrap(), 0x78);
            assert_eq!(eval("BYTE PTR [eax+1]", Some(&regs)).unwrap(), 0x56);
            assert_eq!(eval("dword ptr [eax] + 1", Some(&regs)).unwrap(), 0x1234_5679);
        }

        let word: usize = 0xabcd;
        let expr = format!("[{:#x}]", &word as *const usize as usize);
        assert_eq!(value(&expr), 0xabcd);
    }

    #[test]
    /// A dereference of address 0 is skipped rather than faulting
    fn test_null_dereference() {
        assert_eq!(value("[0] + 1"), 1);
    }

    #[test]
    /// Malformed expressions are reported
    fn test_errors() {
        let regs = X86Regs::default();
        unsafe {
            assert!(matches!(
                eval("1 + $", Some(&regs)),
                Err(ExprError::UnknownCharacter(rest)) if rest == "$"
            ));
            assert!(matches!(
                eval("[eax", Some(&regs)),
                Err(ExprError::UnmatchedBracket(_))
            ));
            assert!(matches!(
                eval("4 / ecx", Some(&regs)),
                Err(ExprError::DivisionByZero(_))
            ));
        }
        // without a snapshot, a register is just an unknown symbol
        assert!(unsafe { eval("eax", None) }.is_err());
    }

    #[test]
    /// Module-relative atoms go through the resolver
    fn test_resolver() {
        let resolver = SymbolResolver::with_module(0x40_0000);
        assert_eq!(unsafe { eval_with("Rx10 + 2", None, &resolver) }.unwrap(), 0x40_0012);
    }

    #[test]
    /// Registers and `[ ]` have addresses, arbitrary expressions don't
    fn test_pointer() {
        let mut regs = X86Regs::default();
        let mut data = [0usize; 4];
        regs.ebp = data.as_mut_ptr() as usize + 2 * mem::size_of::<usize>();

        let eax = unsafe { pointer("eax", &mut regs) }.unwrap();
        assert_eq!(eax as *const usize, regs.slot(Register::Eax) as *const usize);

        let expr = format!("[ebp-{}]", mem::size_of::<usize>());
        let local = unsafe { pointer(&expr, &mut regs) }.unwrap();
        assert_eq!(local, &mut data[1] as *mut usize);

        assert!(matches!(
            unsafe { pointer("eax+4", &mut regs) },
            Err(ExprError::NotAddressable(_))
        ));
    }

    #[test]
    /// The evaluator and the snapshot agree on every register
    fn test_register_pointer_matches_eval() {
        let mut regs = X86Regs::default();
        for (i, reg) in Register::ALL.into_iter().enumerate() {
            regs.set(reg, 0x1000 * (i + 1));
        }
        for reg in Register::ALL {
            let name = reg.name().to_uppercase();
            let evaluated = unsafe { eval(&name, Some(&regs)) }.unwrap();
            let slot = register_pointer(&name, &mut regs).unwrap();
            assert_eq!(*slot, evaluated);
            let slot = slot as *mut usize;
            let via_pointer = unsafe { pointer(reg.name(), &mut regs) }.unwrap();
            assert_eq!(slot, via_pointer);
        }
    }
}
