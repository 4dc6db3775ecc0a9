//! Streaming x86_64 disassembly.
//!
//! Thin wrapper over capstone that decodes one instruction at a time and
//! exposes exactly the introspection surface the rule evaluator consumes:
//! group membership, operand enumeration with access filtering, and branch
//! targets. Detail mode is only enabled when some compiled rule needs it,
//! since it roughly doubles decode cost over a full sweep.

use crate::result::{Error, Result};
use capstone::arch::x86::{ArchMode, ArchSyntax, X86Operand, X86OperandType};
use capstone::arch::{ArchOperand, BuildsCapstone, BuildsCapstoneSyntax};
use capstone::{Capstone, Insn, Instructions, RegAccessType as AccessType};

/// Assembly syntax for rendered instruction strings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Syntax {
    #[default]
    Att,
    Intel,
}

/// Instruction group queried by `call`/`jump`/`return` predicates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Group {
    Call,
    Jump,
    Return,
}

impl Group {
    // Values of the capstone generic group ids.
    fn id(self) -> u8 {
        match self {
            Group::Jump => 1,
            Group::Call => 2,
            Group::Return => 3,
        }
    }
}

/// Operand type observable (`.type` field selector values).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpType {
    Imm = 1,
    Reg = 2,
    Mem = 3,
}

/// Type/access restriction applied while enumerating operands.
#[derive(Copy, Clone, Debug)]
pub struct OperandFilter {
    /// Restrict to one operand type; `None` accepts all.
    pub ty: Option<OpType>,
    /// Require read access.
    pub read: bool,
    /// Require write access.
    pub write: bool,
}

impl OperandFilter {
    /// Accepts any operand, read or written.
    pub fn any() -> Self {
        OperandFilter {
            ty: None,
            read: true,
            write: true,
        }
    }

    /// Accepts read operands (sources).
    pub fn sources() -> Self {
        OperandFilter {
            ty: None,
            read: true,
            write: false,
        }
    }

    /// Accepts written operands (destinations).
    pub fn destinations() -> Self {
        OperandFilter {
            ty: None,
            read: false,
            write: true,
        }
    }

    /// Accepts operands of one type, read or written.
    pub fn of_type(ty: OpType) -> Self {
        OperandFilter {
            ty: Some(ty),
            read: true,
            write: true,
        }
    }
}

/// Field view of one matching operand.
#[derive(Copy, Clone, Debug)]
pub struct OperandView {
    /// Operand size in bytes.
    pub size: u8,
    pub ty: OpType,
    pub read: bool,
    pub write: bool,
}

/// A configured capstone handle.
pub struct Disassembler {
    cs: Capstone,
    /// Whether detail mode (operand/group introspection) is available.
    pub detail: bool,
}

impl Disassembler {
    pub fn new(detail: bool, syntax: Syntax) -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(ArchMode::Mode64)
            .syntax(match syntax {
                Syntax::Att => ArchSyntax::Att,
                Syntax::Intel => ArchSyntax::Intel,
            })
            .detail(detail)
            .build()
            .map_err(|e| Error::Disasm(format!("failed to open capstone handle: {e}")))?;
        Ok(Disassembler { cs, detail })
    }

    /// Decodes at most one instruction at `addr`. An empty result means the
    /// bytes do not form a valid instruction (a failure token for the
    /// pipeline's `--sync` recovery rule).
    pub fn decode<'s>(&'s self, code: &[u8], addr: u64) -> Result<Instructions<'s>> {
        self.cs
            .disasm_count(code, addr, 1)
            .map_err(|e| Error::Disasm(e.to_string()))
    }

    /// Whether the instruction belongs to a generic capstone group.
    pub fn is_in_group(&self, insn: &Insn, group: Group) -> Result<bool> {
        let detail = self
            .cs
            .insn_detail(insn)
            .map_err(|e| Error::Disasm(e.to_string()))?;
        Ok(detail.groups().iter().any(|g| g.0 == group.id()))
    }

    fn operands(&self, insn: &Insn) -> Result<Vec<X86Operand>> {
        let detail = self
            .cs
            .insn_detail(insn)
            .map_err(|e| Error::Disasm(e.to_string()))?;
        Ok(detail
            .arch_detail()
            .operands()
            .into_iter()
            .filter_map(|op| match op {
                ArchOperand::X86Operand(op) => Some(op),
                _ => None,
            })
            .collect())
    }

    /// Number of operands accepted by `filter`.
    pub fn operand_count(&self, insn: &Insn, filter: OperandFilter) -> Result<i64> {
        Ok(self
            .operands(insn)?
            .into_iter()
            .filter(|op| accepts(filter, op))
            .count() as i64)
    }

    /// The `idx`-th operand accepted by `filter`, if any.
    pub fn operand(&self, insn: &Insn, idx: u8, filter: OperandFilter) -> Result<Option<OperandView>> {
        Ok(self
            .operands(insn)?
            .into_iter()
            .filter(|op| accepts(filter, op))
            .nth(idx as usize)
            .and_then(view))
    }

    /// Static branch target of a call/jump, or `None` for indirect branches
    /// and non-branch instructions.
    pub fn branch_target(&self, insn: &Insn) -> Result<Option<i64>> {
        if !(self.is_in_group(insn, Group::Call)? || self.is_in_group(insn, Group::Jump)?) {
            return Ok(None);
        }
        Ok(self.operands(insn)?.into_iter().find_map(|op| match op.op_type {
            X86OperandType::Imm(target) => Some(target),
            _ => None,
        }))
    }
}

fn op_type(op: &X86Operand) -> Option<OpType> {
    match op.op_type {
        X86OperandType::Imm(_) => Some(OpType::Imm),
        X86OperandType::Reg(_) => Some(OpType::Reg),
        X86OperandType::Mem(_) => Some(OpType::Mem),
        _ => None,
    }
}

fn readable(op: &X86Operand) -> bool {
    // Immediates carry no access flags but are always read.
    matches!(op.op_type, X86OperandType::Imm(_))
        || matches!(
            op.access,
            Some(AccessType::ReadOnly) | Some(AccessType::ReadWrite)
        )
}

fn writable(op: &X86Operand) -> bool {
    matches!(
        op.access,
        Some(AccessType::WriteOnly) | Some(AccessType::ReadWrite)
    )
}

fn accepts(filter: OperandFilter, op: &X86Operand) -> bool {
    let Some(ty) = op_type(op) else {
        return false;
    };
    if let Some(want) = filter.ty {
        if ty != want {
            return false;
        }
    }
    (filter.read && readable(op)) || (filter.write && writable(op))
}

fn view(op: X86Operand) -> Option<OperandView> {
    Some(OperandView {
        size: op.size,
        ty: op_type(&op)?,
        read: readable(&op),
        write: writable(&op),
    })
}

/// Renders `mnemonic` or `mnemonic operands` for assembly predicates and
/// `asm` arguments.
pub fn asm_string(insn: &Insn) -> String {
    let mnemonic = insn.mnemonic().unwrap_or("");
    match insn.op_str() {
        Some(ops) if !ops.is_empty() => format!("{mnemonic} {ops}"),
        _ => mnemonic.to_string(),
    }
}
