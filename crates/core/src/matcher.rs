//! Per-instruction rule evaluation.
//!
//! An action fires iff every one of its match entries passes; entries are
//! evaluated in parse order and short-circuit on the first failure. Actions
//! are tried in command-line order and the first hit wins — priority is
//! sequential, there is no conflict resolution beyond that.

use crate::disasm::{asm_string, Disassembler, Group, OperandFilter, OpType};
use crate::result::{Error, Result};
use crate::rules::{Action, Field, MatchCmp, MatchEntry, MatchKind, Payload};
use capstone::Insn;
use owo_colors::OwoColorize;
use rand::rngs::StdRng;
use rand::Rng;

/// Everything evaluation needs besides the rules themselves.
pub struct MatchContext<'a> {
    pub cs: &'a Disassembler,
    /// Deterministic RNG consumed by `random` observables.
    pub rng: &'a mut StdRng,
    /// Emit the per-entry trace to stderr.
    pub debug: bool,
    /// Colourise the trace.
    pub is_tty: bool,
}

impl MatchContext<'_> {
    fn draw(&mut self) -> i64 {
        self.rng.random_range(0..=i32::MAX as i64)
    }
}

/// Returns the index of the first action whose conjunction passes.
pub fn match_actions(
    ctx: &mut MatchContext<'_>,
    actions: &[Action],
    insn: &Insn,
    offset: i64,
) -> Result<Option<usize>> {
    for (idx, action) in actions.iter().enumerate() {
        if match_action(ctx, action, insn, offset)? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

/// Evaluates one action's conjunction against one instruction.
pub fn match_action(
    ctx: &mut MatchContext<'_>,
    action: &Action,
    insn: &Insn,
    offset: i64,
) -> Result<bool> {
    if ctx.debug {
        let addr = format!("0x{:x}", insn.address());
        let addr = if ctx.is_tty {
            addr.cyan().to_string()
        } else {
            addr
        };
        eprint!("{} [{}]:", addr, asm_string(insn));
    }

    let mut pass = false;
    for entry in &action.entries {
        pass = match_entry(ctx, entry, insn, offset)?;
        if ctx.debug {
            let text = if ctx.is_tty {
                if pass {
                    entry.source.green().to_string()
                } else {
                    entry.source.red().to_string()
                }
            } else {
                entry.source.clone()
            };
            eprint!(" [{text}]");
        }
        if !pass {
            break;
        }
    }

    if ctx.debug {
        if pass {
            let text = if ctx.is_tty {
                action.source.yellow().to_string()
            } else {
                action.source.clone()
            };
            eprintln!(" action {text}");
        } else {
            eprintln!();
        }
    }
    Ok(pass)
}

fn match_entry(
    ctx: &mut MatchContext<'_>,
    entry: &MatchEntry,
    insn: &Insn,
    offset: i64,
) -> Result<bool> {
    match entry.kind {
        MatchKind::Assembly | MatchKind::Mnemonic => {
            let text = match entry.kind {
                MatchKind::Assembly => asm_string(insn),
                _ => insn.mnemonic().unwrap_or("").to_string(),
            };
            let Payload::Regex(regex) = &entry.payload else {
                return Ok(false);
            };
            let hit = regex.is_match(&text);
            Ok(if entry.cmp == MatchCmp::Neq { !hit } else { hit })
        }
        _ => {
            let observed = observable(ctx, entry, insn, offset)?;
            let value = observed.unwrap_or(0);
            let pass = match (&entry.cmp, &entry.payload) {
                (MatchCmp::EqZero, _) => value == 0,
                (MatchCmp::NeqZero, _) => value != 0,
                (cmp, Payload::Values(index)) => {
                    if index.is_empty() {
                        return Ok(false);
                    }
                    match cmp {
                        MatchCmp::Eq => index.contains(value),
                        // Preserved quirk: `neq' against a set of more than
                        // one value always passes.
                        MatchCmp::Neq => index.len() != 1 || !index.contains(value),
                        MatchCmp::Lt => value < index.max().unwrap(),
                        MatchCmp::Leq => value <= index.max().unwrap(),
                        MatchCmp::Gt => value > index.min().unwrap(),
                        MatchCmp::Geq => value >= index.min().unwrap(),
                        MatchCmp::EqZero | MatchCmp::NeqZero => unreachable!(),
                    }
                }
                _ => return Ok(false),
            };
            // An undefined observable fails the entry regardless of the
            // comparator.
            Ok(pass && observed.is_some())
        }
    }
}

/// Computes the integer observable for a value-producing match kind.
/// `None` means the observable is undefined for this instruction.
///
/// Also used at emission time to recompute the join key of a CSV-bound
/// match for USER argument lookups.
pub fn observable(
    ctx: &mut MatchContext<'_>,
    entry: &MatchEntry,
    insn: &Insn,
    offset: i64,
) -> Result<Option<i64>> {
    let value = match entry.kind {
        MatchKind::True => 1,
        MatchKind::False => 0,
        MatchKind::Address => insn.address() as i64,
        MatchKind::Offset => offset,
        MatchKind::Size => insn.bytes().len() as i64,
        MatchKind::Random => ctx.draw(),
        MatchKind::Call => ctx.cs.is_in_group(insn, Group::Call)? as i64,
        MatchKind::Jump => ctx.cs.is_in_group(insn, Group::Jump)? as i64,
        MatchKind::Return => ctx.cs.is_in_group(insn, Group::Return)? as i64,
        MatchKind::Plugin => {
            let plugin = entry
                .plugin
                .as_ref()
                .ok_or_else(|| Error::Internal("plugin match without a plugin".into()))?;
            plugin.borrow().result
        }
        MatchKind::Op | MatchKind::Src | MatchKind::Dst | MatchKind::Imm | MatchKind::Reg
        | MatchKind::Mem => {
            let filter = operand_filter(entry.kind);
            return match entry.idx {
                None => match entry.field {
                    // Without an index only the count is defined.
                    Field::Size => Ok(Some(ctx.cs.operand_count(insn, filter)?)),
                    _ => Ok(None),
                },
                Some(idx) => {
                    let Some(op) = ctx.cs.operand(insn, idx, filter)? else {
                        return Ok(None);
                    };
                    Ok(match entry.field {
                        Field::Size => Some(i64::from(op.size)),
                        Field::Type => Some(op.ty as i64),
                        Field::Read => Some(op.read as i64),
                        Field::Write => Some(op.write as i64),
                        Field::None => None,
                    })
                }
            };
        }
        MatchKind::Assembly | MatchKind::Mnemonic => return Ok(None),
    };
    Ok(Some(value))
}

fn operand_filter(kind: MatchKind) -> OperandFilter {
    match kind {
        MatchKind::Src => OperandFilter::sources(),
        MatchKind::Dst => OperandFilter::destinations(),
        MatchKind::Imm => OperandFilter::of_type(OpType::Imm),
        MatchKind::Reg => OperandFilter::of_type(OpType::Reg),
        MatchKind::Mem => OperandFilter::of_type(OpType::Mem),
        _ => OperandFilter::any(),
    }
}
