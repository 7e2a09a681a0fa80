#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod address;
pub mod alloc;
pub mod breakpoint;
pub mod code;
pub mod config;
pub mod expr;
pub mod hook;
pub mod json;
pub mod patcher;
pub mod registry;
pub mod regs;
