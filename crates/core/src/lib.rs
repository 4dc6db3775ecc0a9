//! Rule engine and rewrite pipeline for the `rewire` static binary
//! rewriter.
//!
//! The library compiles `--match`/`--action` rule pairs into a typed rule
//! tree, disassembles the code section of an x86_64 ELF, evaluates each rule
//! per instruction, and streams instruction/patch messages to a back-end
//! process that produces the rewritten artifact.
//!
//! Everything is single-threaded and synchronous; the only blocking points
//! are the pipe to the back-end and the final wait on its exit. A fatal
//! error aborts the run — rewriting is all-or-nothing.

pub mod csv;
pub mod disasm;
pub mod elf;
pub mod location;
pub mod matcher;
pub mod parser;
pub mod pipeline;
pub mod plugin;
pub mod protocol;
pub mod result;
pub mod rules;

pub use result::{Error, Result};
