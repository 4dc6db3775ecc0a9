//! Core result and error types.
//!
//! Every error in this crate is fatal: the driver prints the message as a
//! one-line diagnostic and exits non-zero. There is no retry and no partial
//! progress — rewriting is all-or-nothing.

use thiserror::Error;

/// Core error type encompassing all rewriting errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The `--match`/`--action` DSL failed to parse.
    #[error("failed to parse {mode}; {message} (column {column})")]
    Parse {
        /// Sub-grammar being parsed (`matching` or `action`).
        mode: &'static str,
        /// What was found and what was expected.
        message: String,
        /// 1-based column within the option string.
        column: usize,
    },

    /// Conflicting or out-of-range command-line flags.
    #[error("bad command-line configuration: {0}")]
    Config(String),

    /// Failed to read a file at the specified path.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// The path that could not be read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A CSV table is malformed.
    #[error("malformed CSV table '{path}' at row {row}, column {column}: {message}")]
    Csv {
        /// Path of the offending file.
        path: String,
        /// 1-based row number.
        row: usize,
        /// 1-based column number.
        column: usize,
        /// Description of the defect.
        message: String,
    },

    /// A USER argument lookup did not select exactly one CSV row.
    #[error("ambiguous lookup in table '{basename}': key {key} selects {count} rows, expected exactly one")]
    CsvLookup {
        /// Basename of the table.
        basename: String,
        /// The join key computed from the bound match.
        key: i64,
        /// Number of rows the key selected.
        count: usize,
    },

    /// The input is not a usable x86_64 ELF file.
    #[error("invalid ELF '{path}': {message}")]
    Elf {
        /// Path of the offending file.
        path: String,
        /// Description of the defect.
        message: String,
    },

    /// A `--start`/`--end` position failed to resolve.
    #[error("bad value for `{option}' option: {message}")]
    Position {
        /// The originating option name.
        option: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A plugin shared object failed to load or is unusable.
    #[error("failed to load plugin \"{path}\": {message}")]
    Plugin {
        /// Requested plugin path.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// The disassembler could not be configured or gave up.
    #[error("disassembly failed: {0}")]
    Disasm(String),

    /// Failed to spawn, write to, or await the back-end process.
    #[error("back-end failure: {0}")]
    Backend(String),

    /// Writing a protocol message failed.
    #[error("message write failed: {0}")]
    Protocol(#[from] std::io::Error),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Core result type.
pub type Result<T> = std::result::Result<T, Error>;
