//! `fstar-interactive`: headless front-ends over an incremental verification
//! session.
//!
//! ## Commands
//!
//! - `fstar-interactive check <FILE> [--to LINE:COL]... [--to-marker]`
//! - `fstar-interactive repl <FILE>`
//!
//! Positions on the command line are 1-based, line and column.
//!
//! ## Exit codes (`check`)
//!
//! - 0: every attempt accepted
//! - 1: an attempt was rejected
//! - 2: the verifier could not be started or died

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use fstar_core::ConfigLoader;
use fstar_core::Position;
use fstar_core::SessionConfig;
use fstar_core::config::PreprocessConfig;

pub mod check;
pub mod repl;
pub mod report;

pub const EXIT_ACCEPTED: i32 = 0;
pub const EXIT_REJECTED: i32 = 1;
pub const EXIT_FAILURE: i32 = 2;

/// Drive an F* style verifier incrementally.
#[derive(Debug, Parser)]
#[command(name = "fstar-interactive", version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings that override the configuration file and environment.
#[derive(Debug, Default, clap::Args)]
pub struct GlobalArgs {
    /// Configuration file (default: fstar-interactive.toml next to FILE)
    #[arg(long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Verifier executable
    #[arg(long = "executable", value_name = "EXE", global = true)]
    pub executable: Option<String>,

    /// Verifier argument, repeatable; replaces the configured arguments
    #[arg(
        long = "arg",
        value_name = "ARG",
        global = true,
        allow_hyphen_values = true
    )]
    pub args: Vec<String>,

    /// Working directory for the verifier (default: directory of FILE)
    #[arg(short = 'C', long = "cwd", value_name = "DIR", global = true)]
    pub cwd: Option<PathBuf>,

    /// Command run before the verifier starts, shell-quoted
    #[arg(long = "preprocess", value_name = "CMD", global = true)]
    pub preprocess: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Verify a file up to one or more positions and report diagnostics
    Check(check::CheckArgs),

    /// Interactive line-oriented session on a file
    Repl(repl::ReplArgs),
}

/// Runs the parsed command line and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Check(args) => check::run(&cli.global, args).await,
        Command::Repl(args) => repl::run(&cli.global, args).await,
    }
}

/// Parses a 1-based `LINE:COL` into a 0-based position.
pub fn parse_position(text: &str) -> Result<Position> {
    let Some((line, column)) = text.trim().split_once(':') else {
        bail!("expected LINE:COL, got {text:?}");
    };
    let line: u32 = line
        .parse()
        .with_context(|| format!("invalid line in {text:?}"))?;
    let column: u32 = column
        .parse()
        .with_context(|| format!("invalid column in {text:?}"))?;
    if line == 0 || column == 0 {
        bail!("positions are 1-based, got {text:?}");
    }
    Ok(Position::new(line - 1, column - 1))
}

/// Loads the layered configuration for `file` and applies command-line
/// overrides.
pub fn resolve_config(global: &GlobalArgs, file: &Path) -> Result<SessionConfig> {
    let file = std::path::absolute(file)
        .with_context(|| format!("cannot resolve {}", file.display()))?;
    let file_dir = file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let loader = match &global.config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => match ConfigLoader::find_config_file(&file_dir) {
            Some(found) => ConfigLoader::new().with_file(found),
            None => ConfigLoader::new(),
        },
    };
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(executable) = &global.executable {
        config.executable = executable.clone();
    }
    if !global.args.is_empty() {
        config.arguments = global.args.clone();
    }
    if let Some(cwd) = &global.cwd {
        config.working_directory = Some(cwd.clone());
    }
    if let Some(preprocess) = &global.preprocess {
        let mut words = shlex::split(preprocess)
            .with_context(|| format!("cannot split preprocess command {preprocess:?}"))?;
        if words.is_empty() {
            bail!("empty preprocess command");
        }
        let program = words.remove(0);
        config.preprocess = Some(PreprocessConfig {
            program,
            arguments: words,
        });
    }
    if config.working_directory.is_none() {
        config.working_directory = Some(file_dir);
    }
    Ok(config)
}
