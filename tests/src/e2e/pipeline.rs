//! Whole-pipeline properties: handshake ordering, trampoline uniqueness,
//! reverse emission, desync recovery, and determinism.

use crate::common::{
    build_elf, build_stub_plugin, of_method, run_pipeline, run_pipeline_with, scratch_path,
    try_pipeline, Clause, TEXT_ADDR, TEXT_OFFSET,
};
use rewire_core::result::Error;
use std::fs;

/// nop; movl $1,%eax; cmpl %eax,%ebx; testl %eax,%eax; callq +0;
/// movl %ebx,%eax; retq
const CODE: &[u8] = &[
    0x90, // 0x401000
    0xb8, 0x01, 0x00, 0x00, 0x00, // 0x401001
    0x39, 0xc3, // 0x401006
    0x85, 0xc0, // 0x401008
    0xe8, 0x00, 0x00, 0x00, 0x00, // 0x40100a
    0x89, 0xd8, // 0x40100f
    0xc3, // 0x401011
];
const INSN_COUNT: usize = 7;

#[test]
fn stream_shape_and_mov_selection() {
    let messages = run_pipeline(
        "mov_passthru",
        CODE,
        &[Clause::Match("asm=/mov.*/"), Clause::Action("passthru")],
    );

    // Handshake first, emit last.
    assert_eq!(messages.first().unwrap()["method"], "binary");
    assert_eq!(messages.first().unwrap()["params"]["mode"], "exe");
    assert_eq!(messages.last().unwrap()["method"], "emit");
    assert_eq!(messages.last().unwrap()["params"]["format"], "binary");

    // One passthru trampoline, defined before any patch.
    let trampolines = of_method(&messages, "trampoline");
    assert_eq!(trampolines.len(), 1);
    assert_eq!(trampolines[0]["params"]["name"], "passthru");

    // Exactly the two mov instructions are patched, in reverse order.
    let patches = of_method(&messages, "patch");
    let offsets: Vec<u64> = patches
        .iter()
        .map(|p| p["params"]["offset"].as_u64().unwrap())
        .collect();
    assert_eq!(offsets, vec![TEXT_OFFSET + 15, TEXT_OFFSET + 1]);
    for patch in &patches {
        assert_eq!(patch["params"]["trampoline"], "passthru");
    }

    // Every instruction lies within jump reach of a patch here, so all are
    // announced, each exactly once, before the first patch message.
    let insn_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m["method"] == "instruction")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(insn_positions.len(), INSN_COUNT);
    let first_patch = messages
        .iter()
        .position(|m| m["method"] == "patch")
        .unwrap();
    assert!(insn_positions.iter().all(|&i| i < first_patch));

    let mut addrs: Vec<u64> = of_method(&messages, "instruction")
        .iter()
        .map(|m| m["params"]["address"].as_u64().unwrap())
        .collect();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), INSN_COUNT);
    assert_eq!(addrs[0], TEXT_ADDR);
    assert_eq!(addrs[INSN_COUNT - 1], TEXT_ADDR + 17);
}

#[test]
fn trap_at_one_address() {
    let messages = run_pipeline(
        "trap_addr",
        CODE,
        &[Clause::Match("addr=0x401006"), Clause::Action("trap")],
    );
    let patches = of_method(&messages, "patch");
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0]["params"]["offset"].as_u64().unwrap(),
        TEXT_OFFSET + (0x401006 - TEXT_ADDR)
    );
    assert_eq!(patches[0]["params"]["trampoline"], "trap");
}

#[test]
fn trampolines_are_defined_once_per_name() {
    let callee = scratch_path("tramp_unique_callee", ".elf");
    fs::write(&callee, build_elf(&[0xc3])).unwrap();
    let callee = callee.to_str().unwrap().to_string();

    let call_a = format!("call foo()@{callee}");
    let call_b = format!("call bar()@{callee}");
    let messages = run_pipeline(
        "tramp_unique",
        CODE,
        &[
            // Two actions share one trampoline name; a third differs.
            Clause::Match("mnemonic=/mov.*/"),
            Clause::Action(&call_a),
            Clause::Match("return"),
            Clause::Action(&call_a),
            Clause::Match("call"),
            Clause::Action(&call_b),
        ],
    );

    let trampolines = of_method(&messages, "trampoline");
    let names: Vec<&str> = trampolines
        .iter()
        .map(|t| t["params"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names[0].starts_with("call_clean_before_foo_"));
    assert!(names[1].starts_with("call_clean_before_bar_"));

    // The shared callee ELF is registered exactly once, before the
    // trampolines that reference it.
    let elfs = of_method(&messages, "elf");
    assert_eq!(elfs.len(), 1);
    let elf_addr = elfs[0]["params"]["address"].as_u64().unwrap();
    assert!(elf_addr > 0x100_0000);
    assert_eq!(elf_addr % 0x1000, 0);

    let _ = fs::remove_file(scratch_path("tramp_unique_callee", ".elf"));
}

#[test]
fn start_end_trim_the_patched_range() {
    let messages = run_pipeline_with(
        "range_trim",
        CODE,
        &[Clause::Match("true"), Clause::Action("passthru")],
        |opts| {
            opts.start = Some("0x401006".into());
            opts.end = Some("0x40100f".into());
        },
    );
    // Only cmpl, testl and callq fall inside [start, end).
    let patches = of_method(&messages, "patch");
    let mut offsets: Vec<u64> = patches
        .iter()
        .map(|p| p["params"]["offset"].as_u64().unwrap())
        .collect();
    offsets.sort_unstable();
    assert_eq!(
        offsets,
        vec![TEXT_OFFSET + 6, TEXT_OFFSET + 8, TEXT_OFFSET + 10]
    );
    for insn in of_method(&messages, "instruction") {
        let addr = insn["params"]["address"].as_u64().unwrap();
        assert!((0x401006..0x40100f).contains(&addr));
    }
}

#[test]
fn desync_is_fatal_without_sync() {
    // nop; (invalid byte); nop; ret
    let broken: &[u8] = &[0x90, 0x06, 0x90, 0xc3];
    let err = try_pipeline(
        "desync_fatal",
        broken,
        &[Clause::Match("true"), Clause::Action("passthru")],
        |_| (),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Disasm(_)));
}

#[test]
fn sync_skips_past_data() {
    let broken: &[u8] = &[0x90, 0x06, 0x90, 0xc3];
    let messages = run_pipeline_with(
        "desync_sync0",
        broken,
        &[Clause::Match("mnemonic=nop"), Clause::Action("passthru")],
        |opts| opts.sync = Some(0),
    );
    // Both nops survive the desync hop.
    assert_eq!(of_method(&messages, "patch").len(), 2);

    let messages = run_pipeline_with(
        "desync_sync1",
        broken,
        &[Clause::Match("mnemonic=nop"), Clause::Action("passthru")],
        |opts| opts.sync = Some(1),
    );
    // The nop right after the bad byte is swallowed by the skip.
    let patches = of_method(&messages, "patch");
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0]["params"]["offset"].as_u64().unwrap(), TEXT_OFFSET);
}

#[test]
fn csv_join_resolves_call_arguments() {
    let table = scratch_path("csv_join", "");
    fs::write(
        format!("{}.csv", table.display()),
        "0x401006,123\n0x401011,456\n",
    )
    .unwrap();
    let callee = scratch_path("csv_join_callee", ".elf");
    fs::write(&callee, build_elf(&[0xc3])).unwrap();

    let m1 = "size>1".to_string();
    let m2 = format!("addr=\"{}\"[0]", table.display());
    let action = format!("call foo(\"{}\"[1])@{}", table.display(), callee.display());
    let messages = run_pipeline(
        "csv_join",
        CODE,
        &[
            Clause::Match(&m1),
            Clause::Match(&m2),
            Clause::Action(&action),
        ],
    );

    // Only cmpl at 0x401006 passes both clauses (the ret at 0x401011 is a
    // single byte), and the argument joins to its column-1 value.
    let patches = of_method(&messages, "patch");
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0]["params"]["offset"].as_u64().unwrap(),
        TEXT_OFFSET + 6
    );
    assert_eq!(patches[0]["params"]["metadata"]["args"][0], 123);

    let _ = fs::remove_file(format!("{}.csv", table.display()));
    let _ = fs::remove_file(&callee);
}

#[test]
fn notification_pass_feeds_plugin_match_results() {
    // The stub counts instructions in its `instr` hook and reports the
    // count from its `match` hook. The count reaches 7 only if the
    // notification pass visits every instruction first, and the rule below
    // only fires if the second (matching) pass then sees that result — so a
    // full set of patches proves both halves of the two-pass path ran.
    let lib = build_stub_plugin(
        "notify_counter",
        r#"
#include <stdint.h>
static int64_t seen = 0;
void *e9_plugin_init_v1(int out, uint64_t base)
{ (void)out; (void)base; return &seen; }
void e9_plugin_instr_v1(int out, const void *insn, void *ctx)
{ (void)out; (void)insn; ++*(int64_t *)ctx; }
int64_t e9_plugin_match_v1(int out, const void *insn, void *ctx)
{ (void)out; (void)insn; return *(int64_t *)ctx; }
"#,
    );

    let clause = format!("plugin[\"{}\"]={}", lib.display(), INSN_COUNT);
    let messages = run_pipeline(
        "notify_counter",
        CODE,
        &[Clause::Match(&clause), Clause::Action("passthru")],
    );

    let patches = of_method(&messages, "patch");
    assert_eq!(patches.len(), INSN_COUNT);
    for patch in &patches {
        assert_eq!(patch["params"]["trampoline"], "passthru");
    }

    let _ = fs::remove_file(&lib);
}

#[test]
fn identical_inputs_produce_identical_streams() {
    let clauses = [
        Clause::Match("random<=2147483647"),
        Clause::Action("passthru"),
    ];
    let first = run_pipeline("determinism_a", CODE, &clauses);
    let clauses = [
        Clause::Match("random<=2147483647"),
        Clause::Action("passthru"),
    ];
    let second = run_pipeline("determinism_b", CODE, &clauses);
    assert_eq!(first, second);
}

#[test]
fn patch_metadata_carries_static_arguments() {
    let callee = scratch_path("metadata_callee", ".elf");
    fs::write(&callee, build_elf(&[0xc3])).unwrap();
    let action = format!(
        "call[clean,before] probe(addr, next, size, offset, rdi)@{}",
        callee.display()
    );
    let messages = run_pipeline(
        "metadata",
        CODE,
        &[Clause::Match("addr=0x401001"), Clause::Action(&action)],
    );

    let patches = of_method(&messages, "patch");
    assert_eq!(patches.len(), 1);
    let args = &patches[0]["params"]["metadata"]["args"];
    assert_eq!(args[0].as_u64().unwrap(), 0x401001); // addr
    assert_eq!(args[1].as_u64().unwrap(), 0x401006); // next
    assert_eq!(args[2].as_u64().unwrap(), 5); // size
    assert_eq!(args[3].as_u64().unwrap(), TEXT_OFFSET + 1); // offset
    assert!(args[4].is_null()); // register: resolved at run time

    // The trampoline definition carries the argument descriptors.
    let trampolines = of_method(&messages, "trampoline");
    assert_eq!(trampolines.len(), 1);
    let descriptors = trampolines[0]["params"]["args"].as_array().unwrap();
    assert_eq!(descriptors.len(), 5);
    assert_eq!(descriptors[0]["kind"], "addr");
    assert_eq!(descriptors[4]["kind"], "register");
    assert_eq!(descriptors[4]["register"], "rdi");

    let _ = fs::remove_file(&callee);
}
