//! Evaluation semantics across several actions.

use rewire_core::disasm::{Disassembler, Syntax};
use rewire_core::matcher::{match_actions, MatchContext};
use rewire_core::parser::{parse_action, parse_match};
use rewire_core::pipeline::RNG_SEED;
use rewire_core::rules::RuleSet;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn first_match(rules: &RuleSet, code: &[u8], addr: u64) -> Option<usize> {
    let cs = Disassembler::new(true, Syntax::Att).unwrap();
    let insns = cs.decode(code, addr).unwrap();
    let insn = insns.first().unwrap();
    let mut rng = StdRng::seed_from_u64(RNG_SEED);
    let mut ctx = MatchContext {
        cs: &cs,
        rng: &mut rng,
        debug: false,
        is_tty: false,
    };
    match_actions(&mut ctx, &rules.actions, insn, 0).unwrap()
}

const MOV_IMM: &[u8] = &[0xb8, 0x01, 0x00, 0x00, 0x00]; // movl $0x1, %eax
const RET: &[u8] = &[0xc3];

#[test]
fn first_passing_action_wins() {
    let mut rules = RuleSet::new();
    parse_match("size>4", &mut rules).unwrap();
    parse_action("print", &mut rules).unwrap();
    parse_match("mnemonic=/mov.*/", &mut rules).unwrap();
    parse_action("trap", &mut rules).unwrap();

    // Both rules select the mov; sequential priority picks the first.
    assert_eq!(first_match(&rules, MOV_IMM, 0), Some(0));
    // Neither selects ret.
    assert_eq!(first_match(&rules, RET, 0), None);
}

#[test]
fn later_actions_apply_when_earlier_ones_fail() {
    let mut rules = RuleSet::new();
    parse_match("call", &mut rules).unwrap();
    parse_action("print", &mut rules).unwrap();
    parse_match("return", &mut rules).unwrap();
    parse_action("trap", &mut rules).unwrap();

    assert_eq!(first_match(&rules, RET, 0), Some(1));
}

#[test]
fn conjunction_of_mnemonics_and_negated_group() {
    let mut rules = RuleSet::new();
    parse_match("mnemonic=cmpl,testl", &mut rules).unwrap();
    parse_match("!call", &mut rules).unwrap();
    parse_action("print", &mut rules).unwrap();

    let cmp: &[u8] = &[0x39, 0xc3]; // cmpl %eax, %ebx
    let test: &[u8] = &[0x85, 0xc0]; // testl %eax, %eax
    let call: &[u8] = &[0xe8, 0x00, 0x00, 0x00, 0x00];
    assert_eq!(first_match(&rules, cmp, 0), Some(0));
    assert_eq!(first_match(&rules, test, 0), Some(0));
    assert_eq!(first_match(&rules, call, 0), None);
    assert_eq!(first_match(&rules, RET, 0), None);
}

#[test]
fn asm_predicate_selects_by_rendered_string() {
    let mut rules = RuleSet::new();
    parse_match("asm=/mov.*/", &mut rules).unwrap();
    parse_action("passthru", &mut rules).unwrap();

    assert_eq!(first_match(&rules, MOV_IMM, 0), Some(0));
    assert_eq!(first_match(&rules, RET, 0), None);
}
