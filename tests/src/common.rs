//! Shared fixtures: a byte-built x86_64 ELF and a JSON-stream pipeline
//! harness.

use rewire_core::parser::{parse_action, parse_match};
use rewire_core::pipeline::{self, Options};
use rewire_core::protocol::Format;
use rewire_core::rules::RuleSet;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

/// Virtual address of the fixture's `.text` section.
pub const TEXT_ADDR: u64 = 0x40_1000;
/// File offset of the fixture's `.text` section.
pub const TEXT_OFFSET: u64 = 0x1000;

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Builds a minimal static x86_64 ELF executable whose `.text` holds `code`.
///
/// Layout: ELF header, one PT_LOAD program header, padding up to
/// `TEXT_OFFSET`, the code, the section name table, then three section
/// headers (null, `.text`, `.shstrtab`).
pub fn build_elf(code: &[u8]) -> Vec<u8> {
    let shstrtab = b"\0.text\0.shstrtab\0";
    let shstrtab_off = TEXT_OFFSET + code.len() as u64;
    let shoff = (shstrtab_off + shstrtab.len() as u64 + 7) & !7;

    let mut out = Vec::new();
    // ELF header.
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    push_u16(&mut out, 2); // ET_EXEC
    push_u16(&mut out, 62); // EM_X86_64
    push_u32(&mut out, 1);
    push_u64(&mut out, TEXT_ADDR); // entry
    push_u64(&mut out, 64); // phoff
    push_u64(&mut out, shoff);
    push_u32(&mut out, 0); // flags
    push_u16(&mut out, 64); // ehsize
    push_u16(&mut out, 56); // phentsize
    push_u16(&mut out, 1); // phnum
    push_u16(&mut out, 64); // shentsize
    push_u16(&mut out, 3); // shnum
    push_u16(&mut out, 2); // shstrndx
    assert_eq!(out.len(), 64);

    // PT_LOAD covering the whole file.
    push_u32(&mut out, 1); // PT_LOAD
    push_u32(&mut out, 5); // R+X
    push_u64(&mut out, 0); // offset
    push_u64(&mut out, 0x40_0000); // vaddr
    push_u64(&mut out, 0x40_0000); // paddr
    let filesz = shstrtab_off + shstrtab.len() as u64;
    push_u64(&mut out, filesz);
    push_u64(&mut out, filesz);
    push_u64(&mut out, 0x1000); // align

    out.resize(TEXT_OFFSET as usize, 0);
    out.extend_from_slice(code);
    out.extend_from_slice(shstrtab);
    out.resize(shoff as usize, 0);

    // Section header 0: null.
    out.extend_from_slice(&[0; 64]);
    // Section header 1: .text.
    push_u32(&mut out, 1); // name offset of ".text"
    push_u32(&mut out, 1); // SHT_PROGBITS
    push_u64(&mut out, 6); // ALLOC | EXECINSTR
    push_u64(&mut out, TEXT_ADDR);
    push_u64(&mut out, TEXT_OFFSET);
    push_u64(&mut out, code.len() as u64);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u64(&mut out, 16);
    push_u64(&mut out, 0);
    // Section header 2: .shstrtab.
    push_u32(&mut out, 7); // name offset of ".shstrtab"
    push_u32(&mut out, 3); // SHT_STRTAB
    push_u64(&mut out, 0);
    push_u64(&mut out, 0);
    push_u64(&mut out, shstrtab_off);
    push_u64(&mut out, shstrtab.len() as u64);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u64(&mut out, 1);
    push_u64(&mut out, 0);

    out
}

/// A match or action clause in command-line order.
pub enum Clause<'a> {
    Match(&'a str),
    Action(&'a str),
}

/// Scratch path under the system temp directory, unique per test name.
pub fn scratch_path(name: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rewire_test_{}_{}{}", std::process::id(), name, suffix))
}

/// Compiles a stub plugin shared object from C source and returns its path.
/// The workspace already needs a C compiler for the disassembler's sys
/// crate, so `cc` is available wherever these tests build.
pub fn build_stub_plugin(name: &str, source: &str) -> PathBuf {
    let src = scratch_path(name, ".c");
    let lib = scratch_path(name, ".so");
    fs::write(&src, source).expect("write stub plugin source");
    let status = std::process::Command::new("cc")
        .args(["-shared", "-fPIC", "-o"])
        .arg(&lib)
        .arg(&src)
        .status()
        .expect("invoke cc");
    assert!(status.success(), "cc failed to build the stub plugin");
    let _ = fs::remove_file(&src);
    lib
}

/// Writes the fixture binary, runs the full pipeline with `--format json`,
/// and returns the parsed message stream.
pub fn run_pipeline(name: &str, code: &[u8], clauses: &[Clause<'_>]) -> Vec<Value> {
    run_pipeline_with(name, code, clauses, |_| ())
}

/// Like [`run_pipeline`], with a hook to adjust the options first.
pub fn run_pipeline_with(
    name: &str,
    code: &[u8],
    clauses: &[Clause<'_>],
    tweak: impl FnOnce(&mut Options),
) -> Vec<Value> {
    try_pipeline(name, code, clauses, tweak).expect("pipeline run")
}

/// Fallible variant for tests that assert on pipeline errors.
pub fn try_pipeline(
    name: &str,
    code: &[u8],
    clauses: &[Clause<'_>],
    tweak: impl FnOnce(&mut Options),
) -> rewire_core::Result<Vec<Value>> {
    let binary = scratch_path(name, ".bin");
    let output = scratch_path(name, ".json");
    fs::write(&binary, build_elf(code)).expect("write fixture binary");

    let mut rules = RuleSet::new();
    for clause in clauses {
        match clause {
            Clause::Match(m) => parse_match(m, &mut rules).expect("parse match"),
            Clause::Action(a) => parse_action(a, &mut rules).expect("parse action"),
        }
    }
    let mut opts = Options {
        format: Format::Json,
        output: output.to_str().unwrap().to_string(),
        ..Options::default()
    };
    tweak(&mut opts);
    let run = pipeline::run(binary.to_str().unwrap(), &opts, &mut rules);
    let _ = fs::remove_file(&binary);
    run?;

    let stream = fs::read_to_string(&output).expect("read message stream");
    let messages = stream
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid JSON message"))
        .collect();
    let _ = fs::remove_file(&output);
    Ok(messages)
}

/// Convenience filter: all messages of one method, in stream order.
pub fn of_method<'a>(messages: &'a [Value], method: &str) -> Vec<&'a Value> {
    messages
        .iter()
        .filter(|m| m["method"] == method)
        .collect()
}
