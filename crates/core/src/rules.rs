//! The compiled rule model.
//!
//! A rule is a conjunction of [`MatchEntry`] predicates owned by one
//! [`Action`]. Match clauses accumulate in [`RuleSet::pending`] until the
//! next action is parsed, at which point ownership transfers into the new
//! action and the accumulator resets. Everything here is a tagged enum; a
//! central match on the kind drives evaluation, no dynamic dispatch.

use crate::csv::{CsvCache, IntIndex};
use crate::elf::Image;
use crate::plugin::{PluginRef, PluginRegistry};
use regex::Regex;
use std::rc::Rc;

/// Hard cap on the number of actions; indices must fit the 10-bit
/// `Location::action` field.
pub const MAX_ACTIONS: usize = 1 << 10;

/// Maximum trampoline arguments the back-end accepts.
pub const MAX_ARGS: usize = 8;

/// What a match predicate observes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchKind {
    True,
    False,
    Plugin,
    Assembly,
    Address,
    Call,
    Jump,
    Mnemonic,
    Offset,
    Random,
    Return,
    Size,
    Op,
    Src,
    Dst,
    Imm,
    Reg,
    Mem,
}

impl MatchKind {
    /// Operand-accessor kinds take an optional `[i]` index and a mandatory
    /// field selector.
    pub fn is_operand(self) -> bool {
        matches!(
            self,
            MatchKind::Op
                | MatchKind::Src
                | MatchKind::Dst
                | MatchKind::Imm
                | MatchKind::Reg
                | MatchKind::Mem
        )
    }
}

/// Field selector on an operand accessor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Field {
    None,
    Size,
    Type,
    Read,
    Write,
}

/// Match comparison operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchCmp {
    EqZero,
    NeqZero,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl MatchCmp {
    /// Algebraic inversion used by the `!` prefix. Applying it twice is the
    /// identity.
    pub fn negate(self) -> Self {
        match self {
            MatchCmp::Eq => MatchCmp::Neq,
            MatchCmp::Neq => MatchCmp::Eq,
            MatchCmp::Lt => MatchCmp::Geq,
            MatchCmp::Geq => MatchCmp::Lt,
            MatchCmp::Leq => MatchCmp::Gt,
            MatchCmp::Gt => MatchCmp::Leq,
            MatchCmp::EqZero => MatchCmp::NeqZero,
            MatchCmp::NeqZero => MatchCmp::EqZero,
        }
    }
}

/// The value payload of a match entry.
#[derive(Debug)]
pub enum Payload {
    /// No comparison values (zero comparators).
    None,
    /// Compiled regular expression (assembly/mnemonic kinds).
    Regex(Regex),
    /// Ordered integer set, possibly backed by a CSV table.
    Values(IntIndex),
}

/// A compiled atomic predicate.
pub struct MatchEntry {
    /// The source text of the `--match` option, kept for diagnostics and the
    /// debug trace.
    pub source: String,
    pub kind: MatchKind,
    /// Operand index for `op[i]`-style accessors; `None` means aggregate.
    pub idx: Option<u8>,
    pub field: Field,
    pub cmp: MatchCmp,
    /// Plugin supplying the observable for `plugin[...]` matches.
    pub plugin: Option<PluginRef>,
    pub payload: Payload,
    /// CSV basename, set when the values came from a table; call arguments
    /// cross-reference it.
    pub basename: Option<String>,
}

/// What an action does to a selected instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Call,
    Passthru,
    Plugin,
    Print,
    Trap,
}

/// Placement of a call trampoline relative to the instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallPosition {
    Before,
    After,
    Replace,
    Conditional,
}

impl CallPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            CallPosition::Before => "before",
            CallPosition::After => "after",
            CallPosition::Replace => "replace",
            CallPosition::Conditional => "conditional",
        }
    }
}

/// A general-purpose or special register nameable as a call argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Register {
    Al, Ah, Bl, Bh, Cl, Ch, Dl, Dh, Spl, Bpl, Sil, Dil,
    R8b, R9b, R10b, R11b, R12b, R13b, R14b, R15b,
    Ax, Bx, Cx, Dx, Sp, Bp, Si, Di,
    R8w, R9w, R10w, R11w, R12w, R13w, R14w, R15w,
    Eax, Ebx, Ecx, Edx, Esp, Ebp, Esi, Edi,
    R8d, R9d, R10d, R11d, R12d, R13d, R14d, R15d,
    Rax, Rbx, Rcx, Rdx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
    Rip, Rflags,
}

impl Register {
    /// Resolves a register name as written in the action DSL.
    pub fn from_name(name: &str) -> Option<Register> {
        use Register::*;
        Some(match name {
            "al" => Al, "ah" => Ah, "bl" => Bl, "bh" => Bh,
            "cl" => Cl, "ch" => Ch, "dl" => Dl, "dh" => Dh,
            "spl" => Spl, "bpl" => Bpl, "sil" => Sil, "dil" => Dil,
            "r8b" => R8b, "r9b" => R9b, "r10b" => R10b, "r11b" => R11b,
            "r12b" => R12b, "r13b" => R13b, "r14b" => R14b, "r15b" => R15b,
            "ax" => Ax, "bx" => Bx, "cx" => Cx, "dx" => Dx,
            "sp" => Sp, "bp" => Bp, "si" => Si, "di" => Di,
            "r8w" => R8w, "r9w" => R9w, "r10w" => R10w, "r11w" => R11w,
            "r12w" => R12w, "r13w" => R13w, "r14w" => R14w, "r15w" => R15w,
            "eax" => Eax, "ebx" => Ebx, "ecx" => Ecx, "edx" => Edx,
            "esp" => Esp, "ebp" => Ebp, "esi" => Esi, "edi" => Edi,
            "r8d" => R8d, "r9d" => R9d, "r10d" => R10d, "r11d" => R11d,
            "r12d" => R12d, "r13d" => R13d, "r14d" => R14d, "r15d" => R15d,
            "rax" => Rax, "rbx" => Rbx, "rcx" => Rcx, "rdx" => Rdx,
            "rsp" => Rsp, "rbp" => Rbp, "rsi" => Rsi, "rdi" => Rdi,
            "r8" => R8, "r9" => R9, "r10" => R10, "r11" => R11,
            "r12" => R12, "r13" => R13, "r14" => R14, "r15" => R15,
            "rip" => Rip, "rflags" => Rflags,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Register::*;
        match self {
            Al => "al", Ah => "ah", Bl => "bl", Bh => "bh",
            Cl => "cl", Ch => "ch", Dl => "dl", Dh => "dh",
            Spl => "spl", Bpl => "bpl", Sil => "sil", Dil => "dil",
            R8b => "r8b", R9b => "r9b", R10b => "r10b", R11b => "r11b",
            R12b => "r12b", R13b => "r13b", R14b => "r14b", R15b => "r15b",
            Ax => "ax", Bx => "bx", Cx => "cx", Dx => "dx",
            Sp => "sp", Bp => "bp", Si => "si", Di => "di",
            R8w => "r8w", R9w => "r9w", R10w => "r10w", R11w => "r11w",
            R12w => "r12w", R13w => "r13w", R14w => "r14w", R15w => "r15w",
            Eax => "eax", Ebx => "ebx", Ecx => "ecx", Edx => "edx",
            Esp => "esp", Ebp => "ebp", Esi => "esi", Edi => "edi",
            R8d => "r8d", R9d => "r9d", R10d => "r10d", R11d => "r11d",
            R12d => "r12d", R13d => "r13d", R14d => "r14d", R15d => "r15d",
            Rax => "rax", Rbx => "rbx", Rcx => "rcx", Rdx => "rdx",
            Rsp => "rsp", Rbp => "rbp", Rsi => "rsi", Rdi => "rdi",
            R8 => "r8", R9 => "r9", R10 => "r10", R11 => "r11",
            R12 => "r12", R13 => "r13", R14 => "r14", R15 => "r15",
            Rip => "rip", Rflags => "rflags",
        }
    }
}

/// Kind of one call argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgumentKind {
    /// Pointer to the assembly string of the instruction.
    Asm,
    /// String length of the assembly string.
    AsmLen,
    /// Buffer size of the assembly string (length + NUL).
    AsmSize,
    /// Instruction address.
    Addr,
    /// PIC base address.
    Base,
    /// File offset of the instruction.
    Offset,
    /// Address of the next instruction.
    Next,
    /// Static (unrelocated) address of the instruction.
    StaticAddr,
    /// Jump/call target address, or -1.
    Target,
    /// Address of the trampoline itself.
    Trampoline,
    /// A fresh draw from the deterministic RNG.
    Random,
    /// Pointer to the raw instruction bytes.
    Bytes,
    /// Number of raw instruction bytes.
    BytesSize,
    /// The i-th operand (`value` holds the index).
    Op,
    /// The i-th source operand.
    Src,
    /// The i-th destination operand.
    Dst,
    /// The i-th immediate operand.
    Imm,
    /// The i-th register operand.
    Reg,
    /// The i-th memory operand.
    Mem,
    /// A named register value.
    Register(Register),
    /// An integer literal (`value` holds it).
    Integer,
    /// CSV row lookup keyed by a sibling match (`value` holds the column).
    User,
}

impl ArgumentKind {
    pub fn is_operand(self) -> bool {
        matches!(
            self,
            ArgumentKind::Op
                | ArgumentKind::Src
                | ArgumentKind::Dst
                | ArgumentKind::Imm
                | ArgumentKind::Reg
                | ArgumentKind::Mem
        )
    }

    /// Whether a `&` prefix (pass-by-pointer) is legal for this kind.
    pub fn supports_pointer(self) -> bool {
        match self {
            k if k.is_operand() => true,
            ArgumentKind::Register(Register::Rip) => false,
            ArgumentKind::Register(_) => true,
            _ => false,
        }
    }

    /// Duplicate detection compares kinds the way trampoline metadata does:
    /// operand accessors of the same family collide even with different
    /// indices, while each register name is a kind of its own.
    pub fn same_kind(self, other: ArgumentKind) -> bool {
        self == other
            || std::mem::discriminant(&self) == std::mem::discriminant(&other)
                && !matches!(self, ArgumentKind::Register(_))
    }
}

/// One bound call argument.
#[derive(Clone, Debug)]
pub struct Argument {
    pub kind: ArgumentKind,
    /// Pass by pointer (`&` prefix).
    pub ptr: bool,
    /// True when an earlier argument has the same kind.
    pub duplicate: bool,
    /// Operand index, integer literal, or CSV column, per kind.
    pub value: i64,
    /// Basename of the CSV table for [`ArgumentKind::User`].
    pub basename: Option<String>,
}

/// A compiled rewrite directive and the predicates that select it.
pub struct Action {
    /// Source text of the `--action` option.
    pub source: String,
    /// Conjunction of predicates; evaluated in parse order.
    pub entries: Vec<MatchEntry>,
    pub kind: ActionKind,
    /// Synthesised trampoline name; the back-end registers each distinct
    /// name exactly once.
    pub name: String,
    /// Callee ELF path (call) or plugin path (plugin).
    pub filename: Option<String>,
    /// Callee symbol (call actions).
    pub symbol: Option<String>,
    /// Parsed callee image, bound by the pipeline on first encounter.
    pub elf: Option<Rc<Image>>,
    pub plugin: Option<PluginRef>,
    pub args: Vec<Argument>,
    /// Clean call convention (save/restore caller state).
    pub clean: bool,
    pub position: CallPosition,
}

/// Synthesises the stable trampoline name for a call action.
pub fn call_trampoline_name(
    clean: bool,
    position: CallPosition,
    symbol: &str,
    filename: &str,
) -> String {
    format!(
        "call_{}_{}_{}_{}",
        if clean { "clean" } else { "naked" },
        position.as_str(),
        symbol,
        filename
    )
}

/// Everything the parser accumulates: compiled actions, pending match
/// clauses, shared plugin and CSV state, and the derived disassembler flags.
///
/// These used to be process globals; threading them as one record keeps the
/// pipeline testable.
#[derive(Default)]
pub struct RuleSet {
    pub actions: Vec<Action>,
    /// Match clauses not yet claimed by an action.
    pub pending: Vec<MatchEntry>,
    pub plugins: PluginRegistry,
    pub csv: CsvCache,
    /// Detailed disassembly (operand/group introspection) required.
    pub detail: bool,
    /// A referenced plugin exports `instr`: run the notification pass.
    pub notify: bool,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }
}
