//! The rewrite pipeline.
//!
//! Sequence: infer the ELF mode, handshake with the back-end, initialize
//! plugins, preload trampolines (loading callee ELFs on first encounter),
//! trim the code section to `--start`/`--end`, sweep-disassemble and match
//! (twice when a plugin wants the notification pass), then emit instruction
//! and patch messages in reverse. The reverse order is essential: a patch
//! may extend a jump into a neighbor's displacement window, so neighbors are
//! announced before the patch that needs them.

use crate::disasm::{asm_string, Disassembler, Syntax};
use crate::elf::{align_up, is_library_filename, Image, PAGE_SIZE};
use crate::location::Location;
use crate::matcher::{match_actions, observable, MatchContext};
use crate::plugin::PluginInsn;
use crate::protocol::{Backend, Format, MessageStream};
use crate::result::{Error, Result};
use crate::rules::{Action, ActionKind, ArgumentKind, Payload, RuleSet};
use capstone::Insn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::io::IsTerminal;
use std::rc::Rc;

/// Fixed RNG seed: two invocations with identical inputs produce
/// byte-identical output streams.
pub const RNG_SEED: u64 = 0xe9e9_e9e9;

/// Neighbor reach of a patch: a short jump displacement plus the jump
/// itself plus one maximum-length instruction.
const JUMP_REACH: i64 = i8::MAX as i64 + 2 + 15;

/// Gap between the input image and the first callee ELF.
const CALLEE_GAP: u64 = 0x100_0000;

/// Driver-supplied configuration for one rewrite.
#[derive(Clone, Debug)]
pub struct Options {
    pub output: String,
    pub format: Format,
    pub syntax: Syntax,
    /// Back-end program to spawn (unused with `--format json`).
    pub backend: String,
    /// Extra options forwarded to the back-end verbatim.
    pub backend_options: Vec<String>,
    /// Compression level 0..9; determines the mapping granularity.
    pub compression: u32,
    /// Instructions to skip after a disassembly desync; `None` makes any
    /// desync fatal.
    pub sync: Option<u32>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub executable: bool,
    pub shared: bool,
    pub static_loader: bool,
    pub trap_all: bool,
    /// Emit the colourised per-entry matcher trace.
    pub debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            output: "a.out".into(),
            format: Format::Binary,
            syntax: Syntax::Att,
            backend: "./rewire-backend".into(),
            backend_options: Vec::new(),
            compression: 9,
            sync: None,
            start: None,
            end: None,
            executable: false,
            shared: false,
            static_loader: false,
            trap_all: false,
            debug: false,
        }
    }
}

/// Runs the whole rewrite of `input` and awaits the back-end.
pub fn run(input: &str, opts: &Options, rules: &mut RuleSet) -> Result<()> {
    let mut image = Image::parse(input, 0)?;

    // Mode inference: a dynamic ELF named like a shared library is a dso
    // unless a flag overrides the guess.
    let dso = if opts.executable {
        false
    } else if opts.shared {
        true
    } else {
        image.dso && is_library_filename(input)
    };
    let mode = if dso { "dso" } else { "exe" };
    tracing::debug!("rewriting '{}' as {}", input, mode);

    // Back-end handshake.
    let mut backend = match opts.format {
        Format::Json => {
            if opts.output == "-" {
                Backend::json_to_stdout()
            } else {
                let mut path = opts.output.clone();
                if !path.ends_with(".json") {
                    path.push_str(".json");
                }
                Backend::json_to_file(&path)?
            }
        }
        _ => {
            let mut options = opts.backend_options.clone();
            if opts.static_loader {
                options.push("--static-loader".into());
            }
            if opts.trap_all {
                options.push("--trap-all".into());
            }
            Backend::spawn(&opts.backend, &options)?
        }
    };
    backend.stream.send_binary(mode, input)?;

    // Plugin init, in canonical filename order.
    if !rules.plugins.is_empty() {
        backend.stream.flush()?;
        let fd = backend.stream.raw_fd();
        for plugin in rules.plugins.iter() {
            plugin.borrow_mut().init(fd, image.base);
        }
    }

    preload_trampolines(&mut backend.stream, rules, &image)?;

    // Trim the code section to the requested range.
    if let Some(start) = &opts.start {
        let start_addr = image.position_to_addr("--start", start)?;
        check_in_text(&image, "--start", start, start_addr)?;
        let delta = start_addr - image.text_addr;
        image.text_offset += delta;
        image.text_addr += delta;
        image.text_size -= delta;
    }
    if let Some(end) = &opts.end {
        let end_addr = image.position_to_addr("--end", end)?;
        check_in_text(&image, "--end", end, end_addr)?;
        image.text_size -= (image.text_addr + image.text_size) - end_addr;
    }

    let cs = Disassembler::new(rules.detail, opts.syntax)?;
    let mut rng = StdRng::seed_from_u64(RNG_SEED);
    let is_tty = std::io::stderr().is_terminal();

    let mut locs = sweep(&cs, &mut rng, is_tty, input, opts, rules, &image, &mut backend.stream)?;
    if rules.notify {
        rematch(&cs, &mut rng, is_tty, opts, rules, &image, &mut backend.stream, &mut locs)?;
    }
    emit(&cs, &mut rng, rules, &image, &mut backend.stream, &mut locs)?;

    // Plugin fini, then shut the stream down.
    if !rules.plugins.is_empty() {
        backend.stream.flush()?;
        let fd = backend.stream.raw_fd();
        for plugin in rules.plugins.iter() {
            plugin.borrow().fini(fd);
        }
    }

    let (mut output, mut format) = (opts.output.clone(), opts.format);
    if let Some(ext) = format.extension() {
        if !output.ends_with(ext) {
            output.push_str(ext);
        }
    }
    if format == Format::Json {
        // The stream itself was the artifact; the trailing emit reverts to
        // the defaults so a back-end replaying the stream produces a binary.
        output = "a.out".into();
        format = Format::Binary;
    }
    let mapping_size = PAGE_SIZE * (1u64 << (9 - opts.compression));
    backend.stream.send_emit(&output, format.name(), mapping_size)?;
    backend.wait()
}

fn check_in_text(image: &Image, option: &'static str, pos: &str, addr: u64) -> Result<()> {
    if addr < image.text_addr || addr > image.text_addr + image.text_size {
        return Err(Error::Position {
            option,
            message: format!("position \"{pos}\" lies outside of the (.text) section"),
        });
    }
    Ok(())
}

/// Step 4: one trampoline definition per distinct name, plus callee ELF
/// registration on first encounter of each file.
fn preload_trampolines(
    stream: &mut MessageStream,
    rules: &mut RuleSet,
    image: &Image,
) -> Result<()> {
    let mut files: HashMap<String, Rc<Image>> = HashMap::new();
    let mut defined: HashSet<String> = HashSet::new();
    let (mut have_print, mut have_passthru, mut have_trap) = (false, false, false);
    let mut file_addr = image.free_addr + CALLEE_GAP;

    for action in rules.actions.iter_mut() {
        match action.kind {
            ActionKind::Print => have_print = true,
            ActionKind::Passthru => have_passthru = true,
            ActionKind::Trap => have_trap = true,
            ActionKind::Call => {
                let filename = action.filename.clone().ok_or_else(|| {
                    Error::Internal("call action without a callee file".into())
                })?;
                let target = match files.get(&filename) {
                    Some(target) => Rc::clone(target),
                    None => {
                        // Page-aligned, with a guard gap past the previous
                        // allocation.
                        let free = align_up(file_addr + 8 * PAGE_SIZE, PAGE_SIZE);
                        let target = Rc::new(Image::parse(&filename, free)?);
                        stream.send_elf_file(&target)?;
                        file_addr = free + target.size;
                        files.insert(filename.clone(), Rc::clone(&target));
                        target
                    }
                };
                action.elf = Some(target);
                if defined.insert(action.name.clone()) {
                    stream.send_call_trampoline(
                        &action.name,
                        &action.args,
                        action.clean,
                        action.position,
                    )?;
                }
            }
            ActionKind::Plugin => {
                if defined.insert(action.name.clone()) {
                    stream.send_plugin_trampoline(&action.name)?;
                }
            }
        }
    }
    if have_passthru {
        stream.send_builtin_trampoline("passthru")?;
    }
    if have_print {
        stream.send_builtin_trampoline("print")?;
    }
    if have_trap {
        stream.send_builtin_trampoline("trap")?;
    }
    Ok(())
}

/// Pass A: linear sweep over the code section. Matching runs inline unless
/// the notification pass is on, in which case plugins only observe.
#[allow(clippy::too_many_arguments)]
fn sweep(
    cs: &Disassembler,
    rng: &mut StdRng,
    is_tty: bool,
    input: &str,
    opts: &Options,
    rules: &RuleSet,
    image: &Image,
    stream: &mut MessageStream,
) -> Result<Vec<Location>> {
    let text = image.text_bytes();
    let mut locs = Vec::new();
    let mut offset = 0u64;
    let mut failed = false;
    let mut sync_left = 0u32;

    while (offset as usize) < text.len() {
        let addr = image.text_addr + offset;
        let insns = cs.decode(&text[offset as usize..], addr)?;
        let Some(insn) = insns.first() else {
            if sync_left > 0 {
                sync_left -= 1;
            } else {
                tracing::warn!("failed to disassemble at address 0x{:x}", addr);
                failed = true;
                sync_left = opts.sync.unwrap_or(0);
            }
            offset += 1;
            continue;
        };
        let size = insn.bytes().len() as u64;
        if sync_left > 0 {
            sync_left -= 1;
            offset += size;
            continue;
        }

        let mut idx = None;
        if rules.notify {
            notify_plugins(rules, stream, insn, offset)?;
        } else {
            match_plugins(rules, stream, insn, offset)?;
            let mut ctx = MatchContext {
                cs,
                rng: &mut *rng,
                debug: opts.debug,
                is_tty,
            };
            idx = match_actions(&mut ctx, &rules.actions, insn, offset as i64)?;
        }
        locs.push(Location::new(
            offset,
            size as u8,
            idx.is_some(),
            idx.map(|i| i as u16),
        ));
        offset += size;
    }

    if failed {
        if opts.sync.is_none() {
            return Err(Error::Disasm(format!(
                "failed to disassemble the (.text) section of \"{input}\"; this may be \
                 caused by (1) data in the .text section, or (2) a bug in the third \
                 party disassembler"
            )));
        }
        tracing::warn!(
            "failed to disassemble the (.text) section of \"{}\"; the rewritten binary \
             may be corrupt",
            input
        );
    }
    Ok(locs)
}

/// Pass B: re-disassemble each recorded location, run plugin `match` hooks,
/// and overwrite the matched action index.
#[allow(clippy::too_many_arguments)]
fn rematch(
    cs: &Disassembler,
    rng: &mut StdRng,
    is_tty: bool,
    opts: &Options,
    rules: &RuleSet,
    image: &Image,
    stream: &mut MessageStream,
    locs: &mut [Location],
) -> Result<()> {
    let text = image.text_bytes();
    for loc in locs.iter_mut() {
        let offset = loc.offset();
        let addr = image.text_addr + offset;
        let code = &text[offset as usize..offset as usize + loc.size() as usize];
        let insns = cs.decode(code, addr)?;
        let insn = insns.first().ok_or_else(|| {
            Error::Disasm(format!("failed to disassemble instruction at address 0x{addr:x}"))
        })?;
        match_plugins(rules, stream, insn, offset)?;
        let mut ctx = MatchContext {
            cs,
            rng: &mut *rng,
            debug: opts.debug,
            is_tty,
        };
        let idx = match_actions(&mut ctx, &rules.actions, insn, offset as i64)?;
        if idx.is_some() {
            *loc = Location::new(offset, loc.size(), true, idx.map(|i| i as u16));
        }
    }
    Ok(())
}

/// Step 8: reverse traversal, announcing reachable neighbors before each
/// patch message.
fn emit(
    cs: &Disassembler,
    rng: &mut StdRng,
    rules: &RuleSet,
    image: &Image,
    stream: &mut MessageStream,
    locs: &mut [Location],
) -> Result<()> {
    let text = image.text_bytes();
    let count = locs.len();
    for i in (0..count).rev() {
        if !locs[i].patch() {
            continue;
        }
        let offset = locs[i].offset();
        let addr = image.text_addr + offset;
        let code = &text[offset as usize..offset as usize + locs[i].size() as usize];
        let insns = cs.decode(code, addr)?;
        let insn = insns.first().ok_or_else(|| {
            Error::Disasm(format!("failed to disassemble instruction at address 0x{addr:x}"))
        })?;

        // Announce still-unemitted neighbors within jump reach, walking
        // outwards in both directions until the reach is exceeded.
        for j in (0..=i).rev() {
            if !announce(stream, &mut locs[j], addr, image)? {
                break;
            }
        }
        for j in i + 1..count {
            if !announce(stream, &mut locs[j], addr, image)? {
                break;
            }
        }

        let idx = locs[i]
            .action()
            .ok_or_else(|| Error::Internal("patched location without an action".into()))?;
        let action = rules
            .actions
            .get(idx as usize)
            .ok_or_else(|| Error::Internal(format!("action index {idx} out of range")))?;
        let file_offset = image.text_offset + offset;
        if action.kind == ActionKind::Plugin {
            let plugin = action
                .plugin
                .as_ref()
                .ok_or_else(|| Error::Internal("plugin action without a plugin".into()))?;
            if plugin.borrow().has_patch {
                stream.flush()?;
                let fd = stream.raw_fd();
                with_plugin_insn(insn, offset, |view| plugin.borrow().patch(fd, view));
            }
        } else {
            let metadata = build_metadata(cs, rng, action, insn, offset as i64, file_offset)?;
            stream.send_patch(&action.name, file_offset, metadata)?;
        }
    }
    Ok(())
}

/// Sends the instruction message for `loc` if it lies within jump reach of
/// the patch at `patch_addr`. Returns false once the reach is exceeded, so
/// the caller can stop walking in that direction.
fn announce(
    stream: &mut MessageStream,
    loc: &mut Location,
    patch_addr: u64,
    image: &Image,
) -> Result<bool> {
    let addr = image.text_addr + loc.offset();
    if (addr as i64 - patch_addr as i64).abs() > JUMP_REACH {
        return Ok(false);
    }
    if loc.emitted() {
        return Ok(true);
    }
    loc.set_emitted();
    stream.send_instruction(addr, loc.size(), image.text_offset + loc.offset())?;
    Ok(true)
}

/// Builds the per-instruction argument metadata of a patch message: one
/// entry per argument, `null` for kinds the back-end resolves at run time.
fn build_metadata(
    cs: &Disassembler,
    rng: &mut StdRng,
    action: &Action,
    insn: &Insn,
    section_offset: i64,
    file_offset: u64,
) -> Result<Value> {
    let mut args = Vec::with_capacity(action.args.len());
    for arg in &action.args {
        let value = match arg.kind {
            ArgumentKind::Asm => json!(asm_string(insn)),
            ArgumentKind::AsmLen => json!(asm_string(insn).len()),
            ArgumentKind::AsmSize => json!(asm_string(insn).len() + 1),
            ArgumentKind::Addr | ArgumentKind::StaticAddr => json!(insn.address()),
            ArgumentKind::Offset => json!(file_offset),
            ArgumentKind::Next => json!(insn.address() + insn.bytes().len() as u64),
            ArgumentKind::Target => json!(cs.branch_target(insn)?.unwrap_or(-1)),
            ArgumentKind::Random => json!(rng.random_range(0..=i32::MAX as i64)),
            ArgumentKind::Bytes => json!(insn.bytes()),
            ArgumentKind::BytesSize => json!(insn.bytes().len()),
            ArgumentKind::Integer => json!(arg.value),
            ArgumentKind::User => json!(user_lookup(cs, rng, action, arg.basename.as_deref(),
                arg.value, insn, section_offset)?),
            ArgumentKind::Base
            | ArgumentKind::Trampoline
            | ArgumentKind::Register(_)
            | ArgumentKind::Op
            | ArgumentKind::Src
            | ArgumentKind::Dst
            | ArgumentKind::Imm
            | ArgumentKind::Reg
            | ArgumentKind::Mem => Value::Null,
        };
        args.push(value);
    }
    Ok(json!({ "args": args }))
}

/// Resolves a USER argument: recompute the bound match's observable and join
/// it against the unique CSV row it selects.
fn user_lookup(
    cs: &Disassembler,
    rng: &mut StdRng,
    action: &Action,
    basename: Option<&str>,
    col: i64,
    insn: &Insn,
    section_offset: i64,
) -> Result<i64> {
    let entry = action
        .entries
        .iter()
        .find(|e| e.basename.as_deref() == basename)
        .ok_or_else(|| Error::Internal("user argument without a bound match".into()))?;
    let mut ctx = MatchContext {
        cs,
        rng,
        debug: false,
        is_tty: false,
    };
    let key = observable(&mut ctx, entry, insn, section_offset)?
        .ok_or_else(|| Error::Internal("undefined observable in user lookup".into()))?;
    let Payload::Values(index) = &entry.payload else {
        return Err(Error::Internal("user lookup against a non-table match".into()));
    };
    index.unique_row_value(key, col as usize)
}

/// Runs `f` with a C-ABI view of `insn`. The strings live for the duration
/// of the call only.
fn with_plugin_insn<R>(insn: &Insn, offset: u64, f: impl FnOnce(&PluginInsn) -> R) -> R {
    let mnemonic = CString::new(insn.mnemonic().unwrap_or("")).unwrap_or_default();
    let op_str = CString::new(insn.op_str().unwrap_or("")).unwrap_or_default();
    let mut bytes = [0u8; 15];
    let n = insn.bytes().len().min(15);
    bytes[..n].copy_from_slice(&insn.bytes()[..n]);
    let view = PluginInsn {
        address: insn.address(),
        offset,
        size: n as u8,
        bytes,
        mnemonic: mnemonic.as_ptr(),
        op_str: op_str.as_ptr(),
    };
    f(&view)
}

/// Notification pass: let every plugin with an `instr` hook observe the
/// instruction. Side effects only.
fn notify_plugins(
    rules: &RuleSet,
    stream: &mut MessageStream,
    insn: &Insn,
    offset: u64,
) -> Result<()> {
    if !rules.plugins.iter().any(|p| p.borrow().has_instr) {
        return Ok(());
    }
    stream.flush()?;
    let fd = stream.raw_fd();
    with_plugin_insn(insn, offset, |view| {
        for plugin in rules.plugins.iter() {
            let plugin = plugin.borrow();
            if plugin.has_instr {
                plugin.instr(fd, view);
            }
        }
    });
    Ok(())
}

/// Matching pass: refresh every plugin's `match` result for this
/// instruction.
fn match_plugins(
    rules: &RuleSet,
    stream: &mut MessageStream,
    insn: &Insn,
    offset: u64,
) -> Result<()> {
    if !rules.plugins.iter().any(|p| p.borrow().has_match) {
        return Ok(());
    }
    stream.flush()?;
    let fd = stream.raw_fd();
    with_plugin_insn(insn, offset, |view| {
        for plugin in rules.plugins.iter() {
            let mut plugin = plugin.borrow_mut();
            if plugin.has_match {
                plugin.match_insn(fd, view);
            }
        }
    });
    Ok(())
}
