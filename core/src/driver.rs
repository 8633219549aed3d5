//! Runs a [`Session`] on its own task.
//!
//! The task is the only place the session is touched. It selects over caller
//! commands, verifier process events and the delayed-rollback deadline, so
//! those are applied strictly one at a time. Callers talk to it through a
//! cloneable [`SessionHandle`]; when the last handle is dropped the session is
//! stopped and the verifier killed.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::buffer::SourceBuffer;
use crate::checkpoint::CheckpointId;
use crate::diagnostics::Diagnostic;
use crate::error::Result;
use crate::error::SessionError;
use crate::position::Position;
use crate::position::Range;
use crate::session::Session;
use crate::session::SessionSnapshot;
use crate::session::StopOutcome;
use crate::session::VerifyOutcome;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

enum SessionCommand {
    Verify {
        target: Position,
        reply: oneshot::Sender<Result<VerifyOutcome>>,
    },
    VerifyToMarker {
        cursor: Position,
        reply: oneshot::Sender<Result<VerifyOutcome>>,
    },
    Edit {
        range: Range,
        text: String,
        reply: oneshot::Sender<Vec<CheckpointId>>,
    },
    NextDiagnostic {
        reply: oneshot::Sender<Option<Diagnostic>>,
    },
    DiagnosticsAt {
        position: Position,
        reply: oneshot::Sender<Vec<Diagnostic>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionCommand::Verify { .. } => "Verify",
            SessionCommand::VerifyToMarker { .. } => "VerifyToMarker",
            SessionCommand::Edit { .. } => "Edit",
            SessionCommand::NextDiagnostic { .. } => "NextDiagnostic",
            SessionCommand::DiagnosticsAt { .. } => "DiagnosticsAt",
            SessionCommand::Snapshot { .. } => "Snapshot",
            SessionCommand::Stop { .. } => "Stop",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    pub async fn verify(&self, target: Position) -> Result<VerifyOutcome> {
        self.request(|reply| SessionCommand::Verify { target, reply })
            .await?
    }

    pub async fn verify_to_marker(&self, cursor: Position) -> Result<VerifyOutcome> {
        self.request(|reply| SessionCommand::VerifyToMarker { cursor, reply })
            .await?
    }

    pub async fn edit(&self, range: Range, text: impl Into<String>) -> Result<Vec<CheckpointId>> {
        let text = text.into();
        self.request(|reply| SessionCommand::Edit { range, text, reply })
            .await
    }

    pub async fn next_diagnostic(&self) -> Result<Option<Diagnostic>> {
        self.request(|reply| SessionCommand::NextDiagnostic { reply })
            .await
    }

    pub async fn diagnostics_at(&self, position: Position) -> Result<Vec<Diagnostic>> {
        self.request(|reply| SessionCommand::DiagnosticsAt { position, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    pub async fn stop(&self) -> Result<StopOutcome> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    /// True once the driver task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

/// Moves `session` onto a new task and returns the handle that drives it.
pub fn spawn_session<B>(session: Session<B>) -> (SessionHandle, JoinHandle<()>)
where
    B: SourceBuffer + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let task = tokio::spawn(run(session, rx));
    (SessionHandle { commands: tx }, task)
}

async fn run<B: SourceBuffer>(mut session: Session<B>, mut commands: mpsc::Receiver<SessionCommand>) {
    let mut deferred = VecDeque::new();
    loop {
        if let Some(command) = deferred.pop_front() {
            handle_command(&mut session, command, &mut commands, &mut deferred).await;
            continue;
        }
        let due = session.pending_rollback_due();
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    handle_command(&mut session, command, &mut commands, &mut deferred).await;
                }
                None => break,
            },
            Some(event) = session.next_process_event() => session.handle_process_event(event),
            _ = sleep_until_opt(due) => {
                session.fire_pending_rollback();
            }
        }
    }
    tracing::debug!("all session handles dropped, stopping");
    session.stop();
}

async fn handle_command<B: SourceBuffer>(
    session: &mut Session<B>,
    command: SessionCommand,
    commands: &mut mpsc::Receiver<SessionCommand>,
    deferred: &mut VecDeque<SessionCommand>,
) {
    tracing::trace!("session command: {command:?}");
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        SessionCommand::Verify { target, reply } => {
            let started = until_stopped(session.verify(target), commands, deferred).await;
            finish_verify(session, started, reply);
        }
        SessionCommand::VerifyToMarker { cursor, reply } => {
            let started = until_stopped(session.verify_to_marker(cursor), commands, deferred).await;
            finish_verify(session, started, reply);
        }
        SessionCommand::Edit { range, text, reply } => {
            let _ = reply.send(session.edit(range, &text));
        }
        SessionCommand::NextDiagnostic { reply } => {
            let _ = reply.send(session.cycle_next_diagnostic());
        }
        SessionCommand::DiagnosticsAt { position, reply } => {
            let _ = reply.send(session.diagnostics_at(position));
        }
        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
        SessionCommand::Stop { reply } => {
            let _ = reply.send(session.stop());
        }
    }
}

/// Either the finished work or the reply slot of the `Stop` that cut it short.
type Started<T> = std::result::Result<T, oneshot::Sender<StopOutcome>>;

/// Drives `work` (a verify that may be starting the verifier) while still
/// listening for commands. A `Stop` abandons `work`; anything else waits in
/// `deferred` until `work` is done.
async fn until_stopped<T>(
    work: impl Future<Output = T>,
    commands: &mut mpsc::Receiver<SessionCommand>,
    deferred: &mut VecDeque<SessionCommand>,
) -> Started<T> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            biased;
            done = &mut work => return Ok(done),
            command = commands.recv() => match command {
                Some(SessionCommand::Stop { reply }) => return Err(reply),
                Some(command) => deferred.push_back(command),
                None => return Ok(work.await),
            },
        }
    }
}

fn finish_verify<B: SourceBuffer>(
    session: &mut Session<B>,
    started: Started<Result<VerifyOutcome>>,
    reply: oneshot::Sender<Result<VerifyOutcome>>,
) {
    match started {
        Ok(outcome) => {
            let _ = reply.send(outcome);
        }
        Err(stop_reply) => {
            let _ = reply.send(Err(SessionError::Aborting));
            let _ = stop_reply.send(session.cancel_start());
        }
    }
}

async fn sleep_until_opt(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
