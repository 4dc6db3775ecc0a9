//! Rule-grammar coverage beyond the in-crate unit tests: whole rule pairs,
//! CSV-backed values, and diagnostics.

use crate::common::scratch_path;
use rewire_core::parser::{parse_action, parse_match};
use rewire_core::result::Error;
use rewire_core::rules::{ActionKind, ArgumentKind, CallPosition, MatchCmp, Payload, RuleSet};
use std::fs;

#[test]
fn double_negation_restores_the_comparator() {
    let mut rules = RuleSet::new();
    parse_match("size<4", &mut rules).unwrap();
    parse_match("!size>=4", &mut rules).unwrap();
    // `!size>=4` is `size<4`; the two entries agree.
    assert_eq!(rules.pending[0].cmp, rules.pending[1].cmp);
    assert_eq!(rules.pending[0].cmp, MatchCmp::Lt);
}

#[test]
fn rule_pairs_accumulate_then_reset() {
    let mut rules = RuleSet::new();
    parse_match("mnemonic=cmpl,testl", &mut rules).unwrap();
    parse_match("!call", &mut rules).unwrap();
    parse_action("print", &mut rules).unwrap();
    parse_match("size>4", &mut rules).unwrap();
    parse_action("trap", &mut rules).unwrap();

    assert_eq!(rules.actions.len(), 2);
    assert_eq!(rules.actions[0].entries.len(), 2);
    assert_eq!(rules.actions[0].kind, ActionKind::Print);
    assert_eq!(rules.actions[1].entries.len(), 1);
    assert_eq!(rules.actions[1].kind, ActionKind::Trap);
    assert!(rules.pending.is_empty());
}

#[test]
fn builtin_actions_use_fixed_trampoline_names() {
    for (source, name) in [("print", "print"), ("passthru", "passthru"), ("trap", "trap")] {
        let mut rules = RuleSet::new();
        parse_match("true", &mut rules).unwrap();
        parse_action(source, &mut rules).unwrap();
        assert_eq!(rules.actions[0].name, name);
    }
}

#[test]
fn call_defaults_are_clean_and_before() {
    let mut rules = RuleSet::new();
    parse_match("true", &mut rules).unwrap();
    parse_action("call foo()@mylib", &mut rules).unwrap();
    let action = &rules.actions[0];
    assert!(action.clean);
    assert_eq!(action.position, CallPosition::Before);
    assert_eq!(action.name, "call_clean_before_foo_mylib");
    assert!(action.args.is_empty());
}

#[test]
fn csv_values_bind_the_basename() {
    let table = scratch_path("parser_csv", "");
    fs::write(format!("{}.csv", table.display()), "1,10\n2,20\n").unwrap();
    let clause = format!("addr=\"{}\"[0]", table.display());

    let mut rules = RuleSet::new();
    parse_match(&clause, &mut rules).unwrap();
    let entry = &rules.pending[0];
    assert_eq!(entry.basename.as_deref(), Some(table.to_str().unwrap()));
    let Payload::Values(index) = &entry.payload else {
        panic!("expected a value index");
    };
    assert!(index.contains(1));
    assert!(index.contains(2));
    assert_eq!(index.max(), Some(2));

    // A bound basename becomes usable as a USER argument...
    let action = format!("call foo(\"{}\"[1])@mylib", table.display());
    parse_action(&action, &mut rules).unwrap();
    let arg = &rules.actions[0].args[0];
    assert_eq!(arg.kind, ArgumentKind::User);
    assert_eq!(arg.value, 1);
    assert_eq!(arg.basename.as_deref(), Some(table.to_str().unwrap()));

    // ...but an unbound one stays an unknown argument.
    let mut rules = RuleSet::new();
    parse_match("true", &mut rules).unwrap();
    let action = format!("call foo(\"{}\"[1])@mylib", table.display());
    assert!(parse_action(&action, &mut rules).is_err());

    let _ = fs::remove_file(format!("{}.csv", table.display()));
}

#[test]
fn csv_suffix_is_tolerated() {
    let table = scratch_path("parser_csv_suffix", "");
    fs::write(format!("{}.csv", table.display()), "7\n").unwrap();
    let clause = format!("addr=\"{}\".csv[0]", table.display());

    let mut rules = RuleSet::new();
    parse_match(&clause, &mut rules).unwrap();
    assert_eq!(
        rules.pending[0].basename.as_deref(),
        Some(table.to_str().unwrap())
    );
    let _ = fs::remove_file(format!("{}.csv", table.display()));
}

#[test]
fn diagnostics_name_the_sub_grammar() {
    let err = parse_match("bogus=1", &mut RuleSet::new()).unwrap_err();
    match err {
        Error::Parse { mode, .. } => assert_eq!(mode, "matching"),
        other => panic!("unexpected error {other:?}"),
    }

    let mut rules = RuleSet::new();
    parse_match("true", &mut rules).unwrap();
    let err = parse_action("bogus", &mut rules).unwrap_err();
    match err {
        Error::Parse { mode, .. } => assert_eq!(mode, "action"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn too_many_arguments_are_rejected() {
    let mut rules = RuleSet::new();
    parse_match("true", &mut rules).unwrap();
    let err = parse_action(
        "call f(addr, offset, size, instr, asm, random, base, next, target)@lib",
        &mut rules,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));
}

#[test]
fn asm_companions_parse() {
    let mut rules = RuleSet::new();
    parse_match("true", &mut rules).unwrap();
    parse_action("call f(asm, asm.len, asm.size)@lib", &mut rules).unwrap();
    let args = &rules.actions[0].args;
    assert_eq!(args[0].kind, ArgumentKind::Asm);
    assert_eq!(args[1].kind, ArgumentKind::AsmLen);
    assert_eq!(args[2].kind, ArgumentKind::AsmSize);
    // asm / asm.len / asm.size are distinct kinds, not duplicates.
    assert!(!args[1].duplicate);
    assert!(!args[2].duplicate);
}
