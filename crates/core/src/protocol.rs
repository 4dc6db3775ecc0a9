//! The back-end message stream.
//!
//! The core emits an ordered JSON-RPC stream: one `binary` registration,
//! callee `elf` registrations, one `trampoline` definition per distinct
//! name, interleaved `instruction`/`patch` messages, and a final `emit`.
//! The stream normally feeds a spawned back-end process over a pipe;
//! `--format json` redirects it to stdout or a `.json` file instead.
//!
//! The raw file descriptor of the sink is exposed so plugin `patch` hooks
//! can take over emission; the buffer is flushed before every hook call.

use crate::elf::Image;
use crate::result::{Error, Result};
use crate::rules::{Argument, ArgumentKind, CallPosition};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, Command, Stdio};

/// Output format of the final artifact.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Binary,
    Json,
    Patch,
    PatchGz,
    PatchBz2,
    PatchXz,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Binary => "binary",
            Format::Json => "json",
            Format::Patch => "patch",
            Format::PatchGz => "patch.gz",
            Format::PatchBz2 => "patch.bz2",
            Format::PatchXz => "patch.xz",
        }
    }

    /// Extension appended to the output path when absent.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Format::Patch => Some(".patch"),
            Format::PatchGz => Some(".patch.gz"),
            Format::PatchBz2 => Some(".patch.bz2"),
            Format::PatchXz => Some(".patch.xz"),
            Format::Binary | Format::Json => None,
        }
    }
}

enum Sink {
    Pipe(ChildStdin),
    File(File),
    Stdout(io::Stdout),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Pipe(w) => w.write(buf),
            Sink::File(w) => w.write(buf),
            Sink::Stdout(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Pipe(w) => w.flush(),
            Sink::File(w) => w.flush(),
            Sink::Stdout(w) => w.flush(),
        }
    }
}

/// Buffered, ordered message emission.
pub struct MessageStream {
    w: BufWriter<Sink>,
    fd: RawFd,
    next_id: u64,
}

impl MessageStream {
    fn new(sink: Sink, fd: RawFd) -> Self {
        MessageStream {
            w: BufWriter::new(sink),
            fd,
            next_id: 0,
        }
    }

    /// Raw descriptor of the underlying sink, for plugin hooks.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }

    fn send(&mut self, method: &str, params: Value) -> Result<()> {
        self.next_id += 1;
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id,
        });
        serde_json::to_writer(&mut self.w, &message)
            .map_err(|e| Error::Backend(e.to_string()))?;
        self.w.write_all(b"\n")?;
        Ok(())
    }

    /// Registers the input binary with the back-end.
    pub fn send_binary(&mut self, mode: &str, filename: &str) -> Result<()> {
        self.send(
            "binary",
            json!({
                "filename": filename,
                "mode": mode,
            }),
        )
    }

    /// Registers a callee ELF file loaded at its computed base address.
    pub fn send_elf_file(&mut self, image: &Image) -> Result<()> {
        self.send(
            "elf",
            json!({
                "filename": image.path,
                "address": image.base,
                "size": image.size,
            }),
        )
    }

    /// Defines a call trampoline with its full argument descriptor.
    pub fn send_call_trampoline(
        &mut self,
        name: &str,
        args: &[Argument],
        clean: bool,
        position: CallPosition,
    ) -> Result<()> {
        let args: Vec<Value> = args.iter().map(argument_json).collect();
        self.send(
            "trampoline",
            json!({
                "name": name,
                "kind": "call",
                "clean": clean,
                "position": position.as_str(),
                "args": args,
            }),
        )
    }

    /// Defines the trampoline slot a plugin's `patch` hook will fill.
    pub fn send_plugin_trampoline(&mut self, name: &str) -> Result<()> {
        self.send(
            "trampoline",
            json!({
                "name": name,
                "kind": "plugin",
            }),
        )
    }

    /// Defines a built-in trampoline (`print`, `passthru`, `trap`).
    pub fn send_builtin_trampoline(&mut self, name: &str) -> Result<()> {
        self.send(
            "trampoline",
            json!({
                "name": name,
                "kind": name,
            }),
        )
    }

    /// Announces an instruction's location and size so the back-end can
    /// preserve or relocate it.
    pub fn send_instruction(&mut self, address: u64, length: u8, offset: u64) -> Result<()> {
        self.send(
            "instruction",
            json!({
                "address": address,
                "length": length,
                "offset": offset,
            }),
        )
    }

    /// Redirects one instruction to a trampoline.
    pub fn send_patch(&mut self, trampoline: &str, offset: u64, metadata: Value) -> Result<()> {
        self.send(
            "patch",
            json!({
                "trampoline": trampoline,
                "offset": offset,
                "metadata": metadata,
            }),
        )
    }

    /// Final message: where and how to write the rewritten artifact.
    pub fn send_emit(&mut self, filename: &str, format: &str, mapping_size: u64) -> Result<()> {
        self.send(
            "emit",
            json!({
                "filename": filename,
                "format": format,
                "mapping_size": mapping_size,
            }),
        )
    }
}

fn argument_json(arg: &Argument) -> Value {
    let kind = match arg.kind {
        ArgumentKind::Asm => "asm",
        ArgumentKind::AsmLen => "asmLen",
        ArgumentKind::AsmSize => "asmSize",
        ArgumentKind::Addr => "addr",
        ArgumentKind::Base => "base",
        ArgumentKind::Offset => "offset",
        ArgumentKind::Next => "next",
        ArgumentKind::StaticAddr => "staticAddr",
        ArgumentKind::Target => "target",
        ArgumentKind::Trampoline => "trampoline",
        ArgumentKind::Random => "random",
        ArgumentKind::Bytes => "instr",
        ArgumentKind::BytesSize => "size",
        ArgumentKind::Op => "op",
        ArgumentKind::Src => "src",
        ArgumentKind::Dst => "dst",
        ArgumentKind::Imm => "imm",
        ArgumentKind::Reg => "reg",
        ArgumentKind::Mem => "mem",
        ArgumentKind::Register(_) => "register",
        ArgumentKind::Integer => "integer",
        ArgumentKind::User => "user",
    };
    let mut value = json!({
        "kind": kind,
        "ptr": arg.ptr,
        "duplicate": arg.duplicate,
        "value": arg.value,
    });
    if let ArgumentKind::Register(reg) = arg.kind {
        value["register"] = json!(reg.name());
    }
    if let Some(basename) = &arg.basename {
        value["basename"] = json!(basename);
    }
    value
}

/// The back-end: a spawned child process, or a bare stream for
/// `--format json`.
pub struct Backend {
    child: Option<Child>,
    pub stream: MessageStream,
}

impl Backend {
    /// Spawns the back-end program with the forwarded options, connected by
    /// a pipe.
    pub fn spawn(prog: &str, options: &[String]) -> Result<Backend> {
        let mut child = Command::new(prog)
            .args(options)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Backend(format!("failed to spawn \"{prog}\": {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Backend("no pipe to back-end".into()))?;
        let fd = stdin.as_raw_fd();
        tracing::debug!("spawned back-end \"{}\" (pid {})", prog, child.id());
        Ok(Backend {
            child: Some(child),
            stream: MessageStream::new(Sink::Pipe(stdin), fd),
        })
    }

    /// Pseudo back-end: the raw message stream goes to stdout.
    pub fn json_to_stdout() -> Backend {
        let out = io::stdout();
        let fd = out.as_raw_fd();
        Backend {
            child: None,
            stream: MessageStream::new(Sink::Stdout(out), fd),
        }
    }

    /// Pseudo back-end: the raw message stream goes to a file.
    pub fn json_to_file(path: &str) -> Result<Backend> {
        let file = File::create(path)
            .map_err(|e| Error::Backend(format!("failed to open output file \"{path}\": {e}")))?;
        let fd = file.as_raw_fd();
        Ok(Backend {
            child: None,
            stream: MessageStream::new(Sink::File(file), fd),
        })
    }

    /// Flushes and closes the stream, then awaits the child's exit.
    pub fn wait(mut self) -> Result<()> {
        self.stream.flush()?;
        drop(self.stream);
        if let Some(mut child) = self.child.take() {
            let status = child
                .wait()
                .map_err(|e| Error::Backend(format!("failed to await back-end: {e}")))?;
            if !status.success() {
                return Err(Error::Backend(format!("back-end exited with {status}")));
            }
        }
        Ok(())
    }
}
