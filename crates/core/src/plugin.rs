//! Dynamic-library match/patch plugins.
//!
//! A plugin is a record of optional capabilities rather than a subclass:
//! any subset of the five entry points may be exported, and callers skip
//! plugins that lack the hook they are about to invoke. Libraries are
//! deduplicated by canonical path, so every rule referencing the same file
//! shares one handle, one context pointer, and one match result. Handles
//! live until process exit.
//!
//! The entry points use the C ABI. Hooks receive the raw file descriptor of
//! the back-end message stream (so a `patch` hook can take over emission),
//! a borrowed instruction view, and the context pointer returned by `init`.

use crate::result::{Error, Result};
use libloading::{Library, Symbol};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void};
use std::path::PathBuf;
use std::rc::Rc;

/// Borrowed view of one disassembled instruction, passed to plugin hooks.
#[repr(C)]
pub struct PluginInsn {
    /// Virtual address of the instruction.
    pub address: u64,
    /// File offset within the code section.
    pub offset: u64,
    /// Instruction length in bytes (1..=15).
    pub size: u8,
    /// Raw instruction bytes; only the first `size` are meaningful.
    pub bytes: [u8; 15],
    /// NUL-terminated mnemonic.
    pub mnemonic: *const c_char,
    /// NUL-terminated operand string (empty when there are no operands).
    pub op_str: *const c_char,
}

/// `e9_plugin_init_v1`: once after the back-end handshake; the returned
/// pointer becomes the plugin context for the rest of the run.
pub type PluginInitFn = unsafe extern "C" fn(out: c_int, base: u64) -> *mut c_void;
/// `e9_plugin_instr_v1`: per instruction during the notification pass.
pub type PluginInstrFn = unsafe extern "C" fn(out: c_int, insn: *const PluginInsn, ctx: *mut c_void);
/// `e9_plugin_match_v1`: per instruction during the matching pass; the result
/// feeds `plugin[...]` comparisons.
pub type PluginMatchFn =
    unsafe extern "C" fn(out: c_int, insn: *const PluginInsn, ctx: *mut c_void) -> i64;
/// `e9_plugin_patch_v1`: per selected instruction; replaces the built-in
/// patch message for plugin-kind actions.
pub type PluginPatchFn = unsafe extern "C" fn(out: c_int, insn: *const PluginInsn, ctx: *mut c_void);
/// `e9_plugin_fini_v1`: once before back-end shutdown.
pub type PluginFiniFn = unsafe extern "C" fn(out: c_int, ctx: *mut c_void);

const SYM_INIT: &[u8] = b"e9_plugin_init_v1\0";
const SYM_INSTR: &[u8] = b"e9_plugin_instr_v1\0";
const SYM_MATCH: &[u8] = b"e9_plugin_match_v1\0";
const SYM_PATCH: &[u8] = b"e9_plugin_patch_v1\0";
const SYM_FINI: &[u8] = b"e9_plugin_fini_v1\0";

/// One loaded plugin library.
pub struct Plugin {
    /// Canonical (symlink-resolved) path of the shared object.
    pub path: PathBuf,
    lib: Library,
    /// Context pointer returned by `init`; null until then.
    pub context: *mut c_void,
    /// Most recent `match` hook result.
    pub result: i64,
    pub has_init: bool,
    pub has_instr: bool,
    pub has_match: bool,
    pub has_patch: bool,
    pub has_fini: bool,
}

impl Plugin {
    fn sym<T>(&self, name: &[u8]) -> Option<Symbol<'_, T>> {
        unsafe { self.lib.get(name).ok() }
    }

    /// Invokes `init` if exported, binding the returned context.
    pub fn init(&mut self, out: c_int, base: u64) {
        let Some(f) = self.sym::<PluginInitFn>(SYM_INIT) else {
            return;
        };
        let context = unsafe { f(out, base) };
        self.context = context;
    }

    /// Invokes `instr` if exported (notification pass).
    pub fn instr(&self, out: c_int, insn: &PluginInsn) {
        if let Some(f) = self.sym::<PluginInstrFn>(SYM_INSTR) {
            unsafe { f(out, insn, self.context) };
        }
    }

    /// Invokes `match` if exported, recording the result.
    pub fn match_insn(&mut self, out: c_int, insn: &PluginInsn) {
        let Some(f) = self.sym::<PluginMatchFn>(SYM_MATCH) else {
            return;
        };
        let result = unsafe { f(out, insn, self.context) };
        self.result = result;
    }

    /// Invokes `patch` if exported (emission of a selected instruction).
    pub fn patch(&self, out: c_int, insn: &PluginInsn) {
        if let Some(f) = self.sym::<PluginPatchFn>(SYM_PATCH) {
            unsafe { f(out, insn, self.context) };
        }
    }

    /// Invokes `fini` if exported.
    pub fn fini(&self, out: c_int) {
        if let Some(f) = self.sym::<PluginFiniFn>(SYM_FINI) {
            unsafe { f(out, self.context) };
        }
    }
}

/// Shared handle to a loaded plugin.
pub type PluginRef = Rc<RefCell<Plugin>>;

/// Process-wide plugin map, keyed by canonical path.
///
/// The `BTreeMap` keeps iteration deterministic over the canonicalised
/// filename order, which fixes the `init`/`fini` invocation order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<PathBuf, PluginRef>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads (or reuses) the plugin named by `basename`. A `.so` suffix is
    /// appended when absent; the path is canonicalised before lookup so the
    /// same library referenced through different spellings loads once.
    pub fn open(&mut self, basename: &str) -> Result<PluginRef> {
        let mut filename = basename.to_string();
        if !filename.ends_with(".so") {
            filename.push_str(".so");
        }
        let path = std::fs::canonicalize(&filename).map_err(|e| Error::Plugin {
            path: filename.clone(),
            message: format!("failed to resolve path: {e}"),
        })?;
        if let Some(plugin) = self.plugins.get(&path) {
            return Ok(Rc::clone(plugin));
        }

        let lib = unsafe { Library::new(&path) }.map_err(|e| Error::Plugin {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut plugin = Plugin {
            path: path.clone(),
            lib,
            context: std::ptr::null_mut(),
            result: 0,
            has_init: false,
            has_instr: false,
            has_match: false,
            has_patch: false,
            has_fini: false,
        };
        plugin.has_init = plugin.sym::<PluginInitFn>(SYM_INIT).is_some();
        plugin.has_instr = plugin.sym::<PluginInstrFn>(SYM_INSTR).is_some();
        plugin.has_match = plugin.sym::<PluginMatchFn>(SYM_MATCH).is_some();
        plugin.has_patch = plugin.sym::<PluginPatchFn>(SYM_PATCH).is_some();
        plugin.has_fini = plugin.sym::<PluginFiniFn>(SYM_FINI).is_some();
        if !(plugin.has_init
            || plugin.has_instr
            || plugin.has_match
            || plugin.has_patch
            || plugin.has_fini)
        {
            return Err(Error::Plugin {
                path: path.display().to_string(),
                message: "the shared object does not export any plugin API functions".into(),
            });
        }
        tracing::debug!("loaded plugin {}", path.display());

        let plugin = Rc::new(RefCell::new(plugin));
        self.plugins.insert(path, Rc::clone(&plugin));
        Ok(plugin)
    }

    /// All loaded plugins in canonical-path order.
    pub fn iter(&self) -> impl Iterator<Item = &PluginRef> {
        self.plugins.values()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
