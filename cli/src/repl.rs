//! `fstar-interactive repl`: a line-oriented session on one file.
//!
//! Commands are read from stdin, one per line; session events are printed as
//! they arrive. Positions are 1-based `LINE:COL`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use fstar_core::Position;
use fstar_core::Range;
use fstar_core::Session;
use fstar_core::SessionEvent;
use fstar_core::SessionHandle;
use fstar_core::SessionState;
use fstar_core::StopOutcome;
use fstar_core::TextDocument;
use fstar_core::VerifyOutcome;
use fstar_core::spawn_session;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;

use crate::GlobalArgs;
use crate::parse_position;
use crate::report;

const HELP: &str = "\
commands:
  check LINE:COL              verify up to LINE:COL
  marker LINE:COL             verify up to the next check marker
  edit LINE:COL LINE:COL TEXT replace a range (\\n in TEXT is a newline)
  next                        jump to the next diagnostic
  at LINE:COL                 diagnostics covering a position
  status                      session summary
  stop                        kill the verifier
  wait                        wait for the pending verdict
  quit                        stop and exit";

const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
pub struct ReplArgs {
    /// Source file to open
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Check(Position),
    Marker(Position),
    Edit { range: Range, text: String },
    Next,
    At(Position),
    Status,
    Stop,
    Wait,
    Help,
    Quit,
}

impl ReplCommand {
    /// Parses one input line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (word, rest) = next_word(line);
        let command = match word {
            "" => return Ok(None),
            w if w.starts_with('#') => return Ok(None),
            "check" => Self::Check(single_position(rest)?),
            "marker" => Self::Marker(single_position(rest)?),
            "at" => Self::At(single_position(rest)?),
            "edit" => {
                let (start, rest) = next_word(rest);
                let (end, rest) = next_word(rest);
                let range = Range::new(parse_position(start)?, parse_position(end)?);
                let text = rest.strip_prefix([' ', '\t']).unwrap_or(rest);
                Self::Edit {
                    range,
                    text: unescape(text),
                }
            }
            "next" => Self::Next,
            "status" => Self::Status,
            "stop" => Self::Stop,
            "wait" => Self::Wait,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command {other:?}, try help"),
        };
        Ok(Some(command))
    }
}

/// Splits off the first whitespace-delimited word. The remainder keeps its
/// leading separator.
fn next_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(at) => text.split_at(at),
        None => (text, ""),
    }
}

fn single_position(rest: &str) -> Result<Position> {
    let (word, extra) = next_word(rest);
    if word.is_empty() {
        bail!("expected LINE:COL");
    }
    if !extra.trim().is_empty() {
        bail!("unexpected input after {word}: {:?}", extra.trim());
    }
    parse_position(word)
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

struct Repl {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    file: PathBuf,
    working_directory: PathBuf,
}

pub async fn run(global: &GlobalArgs, args: ReplArgs) -> Result<i32> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let config = crate::resolve_config(global, &args.file)?;
    let working_directory = config
        .working_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let (session, events) = Session::new(config, TextDocument::from_text(&text));
    let (handle, _task) = spawn_session(session);

    let mut repl = Repl {
        handle,
        events,
        file: args.file,
        working_directory,
    };
    repl.run().await?;
    Ok(crate::EXIT_ACCEPTED)
}

impl Repl {
    async fn run(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read stdin")? else {
                        break;
                    };
                    match ReplCommand::parse(&line) {
                        Ok(None) => {}
                        Ok(Some(ReplCommand::Quit)) => break,
                        Ok(Some(command)) => self.execute(command).await,
                        Err(e) => println!("error: {e:#}"),
                    }
                }
                Some(event) = self.events.recv() => self.print_event(&event),
            }
        }
        self.quit().await;
        Ok(())
    }

    async fn execute(&mut self, command: ReplCommand) {
        if let Err(e) = self.try_execute(command).await {
            println!("error: {e:#}");
        }
    }

    async fn try_execute(&mut self, command: ReplCommand) -> Result<()> {
        match command {
            ReplCommand::Check(target) => {
                let outcome = self.handle.verify(target).await?;
                print_outcome(outcome);
            }
            ReplCommand::Marker(cursor) => {
                let outcome = self.handle.verify_to_marker(cursor).await?;
                print_outcome(outcome);
            }
            ReplCommand::Edit { range, text } => {
                self.handle.edit(range, text).await?;
            }
            ReplCommand::Next => match self.handle.next_diagnostic().await? {
                Some(d) => println!(
                    "{}",
                    report::diagnostic(&self.file, &self.working_directory, &d)
                ),
                None => println!("no diagnostics"),
            },
            ReplCommand::At(position) => {
                let found = self.handle.diagnostics_at(position).await?;
                if found.is_empty() {
                    println!("no diagnostics at {}", report::position(position));
                }
                for d in &found {
                    println!(
                        "{}",
                        report::diagnostic(&self.file, &self.working_directory, d)
                    );
                }
            }
            ReplCommand::Status => {
                let snapshot = self.handle.snapshot().await?;
                println!("{}", report::snapshot(&snapshot));
            }
            ReplCommand::Stop => match self.handle.stop().await? {
                StopOutcome::NotRunning => println!("not running"),
                StopOutcome::AlreadyStopping | StopOutcome::Aborting => {}
            },
            ReplCommand::Wait => self.wait().await?,
            ReplCommand::Help => println!("{HELP}"),
            // Handled by the input loop.
            ReplCommand::Quit => {}
        }
        Ok(())
    }

    /// Prints events until the in-flight attempt (or abort) has settled.
    async fn wait(&mut self) -> Result<()> {
        let snapshot = self.handle.snapshot().await?;
        let aborting = snapshot.state == SessionState::Aborting;
        if snapshot.in_flight.is_none() && !aborting {
            return Ok(());
        }
        while let Some(event) = self.events.recv().await {
            self.print_event(&event);
            let settled = match &event {
                SessionEvent::CheckpointAccepted { .. } | SessionEvent::CheckpointRejected { .. } => {
                    !aborting
                }
                SessionEvent::VerificationAborted
                | SessionEvent::ProcessExited { .. }
                | SessionEvent::ProcessSpawnFailed { .. }
                | SessionEvent::PreprocessFailed { .. } => true,
                _ => false,
            };
            if settled {
                break;
            }
        }
        Ok(())
    }

    async fn quit(&mut self) {
        match self.handle.stop().await {
            Ok(StopOutcome::Aborting) => {
                let drain = async {
                    while let Some(event) = self.events.recv().await {
                        self.print_event(&event);
                        if event == SessionEvent::VerificationAborted {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(QUIT_TIMEOUT, drain).await.is_err() {
                    tracing::warn!("verifier did not exit in time");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("session already closed: {e}"),
        }
    }

    fn print_event(&self, event: &SessionEvent) {
        for line in report::event(&self.file, &self.working_directory, event) {
            println!("{line}");
        }
    }
}

fn print_outcome(outcome: VerifyOutcome) {
    match outcome {
        VerifyOutcome::NothingToVerify => println!("nothing to verify"),
        VerifyOutcome::Sent { checkpoint, range } => {
            println!("sent {checkpoint} {}", report::range(range));
        }
    }
}
