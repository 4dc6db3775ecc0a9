//! The `rewire` command-line driver.
//!
//! Compiles the `--match`/`--action` rule pairs in command-line order,
//! validates the flag set, and hands everything to the rewrite pipeline.
//! All errors are fatal: one diagnostic line, non-zero exit.

use clap::{CommandFactory, FromArgMatches, Parser, ValueEnum};
use color_eyre::eyre::eyre;
use rewire_core::disasm::Syntax;
use rewire_core::parser::{parse_action, parse_match};
use rewire_core::pipeline::{self, Options};
use rewire_core::protocol::Format;
use rewire_core::rules::{RuleSet, MAX_ACTIONS};
use tracing_subscriber::EnvFilter;

/// Rewire: static x86_64 ELF binary rewriter
///
/// Matchings (`--match`) select instructions; the following action
/// (`--action`) says how to rewrite them. Multiple match options combine as
/// a conjunction; multiple rule pairs apply in command-line order, first
/// hit wins.
#[derive(Parser)]
#[command(name = "rewire")]
#[command(about = "Rewire: static x86_64 ELF binary rewriter")]
struct Cli {
    /// Instruction matching, e.g. 'asm=/mov.*/' or 'addr=0x401234'.
    #[arg(short = 'M', long = "match", id = "match", value_name = "MATCH")]
    matchings: Vec<String>,

    /// Rewrite action for instructions selected by the preceding matchings,
    /// e.g. 'passthru' or 'call[clean,before] foo(addr)@mylib'.
    #[arg(short = 'A', long = "action", id = "action", value_name = "ACTION")]
    actions: Vec<String>,

    /// Path of the output file.
    #[arg(short = 'o', long, default_value = "a.out")]
    output: String,

    /// Compression level; higher makes the output smaller but needs more
    /// mappings.
    #[arg(short = 'c', long, default_value_t = 9,
          value_parser = clap::value_parser!(u32).range(0..=9))]
    compression: u32,

    /// Replace patched pages statically instead of at initialization time.
    #[arg(short = 's', long)]
    static_loader: bool,

    /// Back-end program.
    #[arg(long, default_value = "./rewire-backend", value_name = "PROG")]
    backend: String,

    /// Enable the per-instruction matching trace.
    #[arg(long)]
    debug: bool,

    /// Only patch the code section up to this address or dynamic symbol.
    #[arg(long, value_name = "END")]
    end: Option<String>,

    /// Treat the input as an executable even if it looks like a shared
    /// library.
    #[arg(long, conflicts_with = "shared")]
    executable: bool,

    /// Output format.
    #[arg(long, value_enum, default_value = "binary")]
    format: FormatArg,

    /// Suppress warning messages.
    #[arg(long)]
    no_warnings: bool,

    /// Option forwarded to the back-end verbatim; may be repeated.
    #[arg(long = "option", id = "option", value_name = "ARG")]
    options: Vec<String>,

    /// Treat the input as a shared library even if it looks like an
    /// executable.
    #[arg(long)]
    shared: bool,

    /// Only patch the code section beginning from this address or dynamic
    /// symbol.
    #[arg(long, value_name = "START")]
    start: Option<String>,

    /// Skip N instructions after a disassembler desync instead of aborting.
    #[arg(long, value_name = "N",
          value_parser = clap::value_parser!(u32).range(0..=1000))]
    sync: Option<u32>,

    /// Assembly syntax of rendered instructions.
    #[arg(long, value_enum, default_value = "ATT")]
    syntax: SyntaxArg,

    /// Insert a trap at each trampoline entry (for debugging).
    #[arg(long)]
    trap_all: bool,

    /// The input binary.
    input: String,
}

#[derive(Copy, Clone, ValueEnum)]
enum FormatArg {
    Binary,
    Json,
    Patch,
    #[value(name = "patch.gz")]
    PatchGz,
    #[value(name = "patch.bz2")]
    PatchBz2,
    #[value(name = "patch.xz")]
    PatchXz,
}

impl From<FormatArg> for Format {
    fn from(value: FormatArg) -> Format {
        match value {
            FormatArg::Binary => Format::Binary,
            FormatArg::Json => Format::Json,
            FormatArg::Patch => Format::Patch,
            FormatArg::PatchGz => Format::PatchGz,
            FormatArg::PatchBz2 => Format::PatchBz2,
            FormatArg::PatchXz => Format::PatchXz,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum SyntaxArg {
    #[value(name = "ATT")]
    Att,
    #[value(name = "intel")]
    Intel,
}

impl From<SyntaxArg> for Syntax {
    fn from(value: SyntaxArg) -> Syntax {
        match value {
            SyntaxArg::Att => Syntax::Att,
            SyntaxArg::Intel => Syntax::Intel,
        }
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let arg_matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&arg_matches).unwrap_or_else(|e| e.exit());

    let default_level = if cli.debug {
        "debug"
    } else if cli.no_warnings {
        "error"
    } else {
        "warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .without_time()
        .init();

    // Recover the interleaving of `--match`/`--action` occurrences: rule
    // pairing depends on command-line order, which clap's per-flag vectors
    // do not preserve on their own.
    let mut clauses: Vec<(usize, bool, &String)> = Vec::new();
    if let Some(indices) = arg_matches.indices_of("match") {
        clauses.extend(indices.zip(&cli.matchings).map(|(i, v)| (i, false, v)));
    }
    if let Some(indices) = arg_matches.indices_of("action") {
        clauses.extend(indices.zip(&cli.actions).map(|(i, v)| (i, true, v)));
    }
    clauses.sort_by_key(|&(i, _, _)| i);

    let mut rules = RuleSet::new();
    for (_, is_action, source) in clauses {
        if is_action {
            parse_action(source, &mut rules)?;
        } else {
            parse_match(source, &mut rules)?;
        }
    }
    if !rules.pending.is_empty() {
        return Err(eyre!(
            "detected extraneous matching option(s) (`--match' or `-M') that are not \
             paired with a corresponding action (`--action' or `-A')"
        ));
    }
    if rules.actions.len() > MAX_ACTIONS {
        return Err(eyre!(
            "the total number of actions ({}) exceeds the maximum ({})",
            rules.actions.len(),
            MAX_ACTIONS
        ));
    }

    let opts = Options {
        output: cli.output,
        format: cli.format.into(),
        syntax: cli.syntax.into(),
        backend: cli.backend,
        backend_options: cli.options,
        compression: cli.compression,
        sync: cli.sync,
        start: cli.start,
        end: cli.end,
        executable: cli.executable,
        shared: cli.shared,
        static_loader: cli.static_loader,
        trap_all: cli.trap_all,
        debug: cli.debug,
    };
    pipeline::run(&cli.input, &opts, &mut rules)?;
    Ok(())
}
