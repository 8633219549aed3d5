//! `fstar-interactive check`: verify a file incrementally, headless.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use fstar_core::Position;
use fstar_core::Session;
use fstar_core::SessionError;
use fstar_core::SessionEvent;
use fstar_core::SessionHandle;
use fstar_core::TextDocument;
use fstar_core::VerifyOutcome;
use fstar_core::spawn_session;
use tokio::sync::mpsc;

use crate::EXIT_ACCEPTED;
use crate::EXIT_FAILURE;
use crate::EXIT_REJECTED;
use crate::GlobalArgs;
use crate::parse_position;
use crate::report;

/// How long to wait for the verifier to go away after the last attempt.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
pub struct CheckArgs {
    /// Source file to verify
    pub file: PathBuf,

    /// Verify up to LINE:COL; repeat to verify in several steps
    #[arg(long = "to", value_name = "LINE:COL", value_parser = parse_position)]
    pub to: Vec<Position>,

    /// Verify up to the first check marker at or below --cursor
    #[arg(long = "to-marker")]
    pub to_marker: bool,

    /// Cursor for --to-marker
    #[arg(long = "cursor", value_name = "LINE:COL", value_parser = parse_position)]
    pub cursor: Option<Position>,

    /// Print verifier output and accepted regions
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Position(Position),
    Marker(Position),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Rejected,
    Failed,
}

impl CheckArgs {
    fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.to.iter().copied().map(Target::Position).collect();
        if self.to_marker {
            targets.push(Target::Marker(self.cursor.unwrap_or(Position::ORIGIN)));
        }
        if targets.is_empty() {
            // Clamped to the end of the document by the session.
            targets.push(Target::Position(Position::new(u32::MAX, u32::MAX)));
        }
        targets
    }
}

pub async fn run(global: &GlobalArgs, args: CheckArgs) -> Result<i32> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let config = crate::resolve_config(global, &args.file)?;
    let working_directory = config
        .working_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let (session, mut events) = Session::new(config, TextDocument::from_text(&text));
    let (handle, _task) = spawn_session(session);
    let printer = Printer {
        file: args.file.clone(),
        working_directory,
        verbose: args.verbose,
    };

    let mut exit_code = EXIT_ACCEPTED;
    for target in args.targets() {
        let sent = match target {
            Target::Position(position) => handle.verify(position).await,
            Target::Marker(cursor) => handle.verify_to_marker(cursor).await,
        };
        match sent {
            Ok(VerifyOutcome::NothingToVerify) => continue,
            Ok(VerifyOutcome::Sent { .. }) => {}
            Err(SessionError::Supervisor(e)) => {
                eprintln!("error: {e}");
                exit_code = EXIT_FAILURE;
                break;
            }
            Err(e) => return Err(e).context("verification request failed"),
        }
        match printer.await_verdict(&mut events).await {
            Verdict::Accepted => {}
            Verdict::Rejected => {
                exit_code = EXIT_REJECTED;
                break;
            }
            Verdict::Failed => {
                exit_code = EXIT_FAILURE;
                break;
            }
        }
    }

    shutdown(&handle, &mut events).await;
    Ok(exit_code)
}

struct Printer {
    file: PathBuf,
    working_directory: PathBuf,
    verbose: bool,
}

impl Printer {
    async fn await_verdict(&self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Verdict {
        while let Some(event) = events.recv().await {
            match &event {
                SessionEvent::OutputAppended(_) => self.print_verbose(&event),
                SessionEvent::CheckpointAccepted { .. } => {
                    self.print_verbose(&event);
                    return Verdict::Accepted;
                }
                SessionEvent::CheckpointRejected { diagnostics, .. } => {
                    for d in diagnostics {
                        println!(
                            "{}",
                            report::diagnostic(&self.file, &self.working_directory, d)
                        );
                    }
                    return Verdict::Rejected;
                }
                SessionEvent::ProcessExited { .. } | SessionEvent::VerificationAborted => {
                    self.print_error(&event);
                    return Verdict::Failed;
                }
                _ => tracing::debug!("check: {event:?}"),
            }
        }
        Verdict::Failed
    }

    fn print_verbose(&self, event: &SessionEvent) {
        if self.verbose {
            for line in report::event(&self.file, &self.working_directory, event) {
                println!("{line}");
            }
        }
    }

    fn print_error(&self, event: &SessionEvent) {
        for line in report::event(&self.file, &self.working_directory, event) {
            eprintln!("error: {line}");
        }
    }
}

async fn shutdown(handle: &SessionHandle, events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    match handle.stop().await {
        Ok(fstar_core::StopOutcome::Aborting) => {
            let wait = async {
                while let Some(event) = events.recv().await {
                    if event == SessionEvent::VerificationAborted {
                        break;
                    }
                }
            };
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait).await.is_err() {
                tracing::warn!("verifier did not exit in time");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("session already closed: {e}"),
    }
}
