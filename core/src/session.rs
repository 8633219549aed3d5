//! Incremental verification session.
//!
//! The session feeds a long-lived verifier one region at a time. Each region
//! that the verifier accepts becomes a checkpoint; edits that modify an
//! accepted region roll the verifier back with one `#pop` per discarded
//! checkpoint before anything new is pushed.
//!
//! ```text
//!            verify               attempt written
//!   Idle ───────────► Running ─────────────────► Verifying
//!    ▲                   ▲  ◄──── #ok / #fail ───────┘
//!    │ exit              │ stop                      │ stop
//!    └──── Aborting ◄────┴───────────────────────────┘
//! ```
//!
//! `Session` is a plain `&mut self` state machine. Process events arrive on
//! an internal channel and must be fed back through
//! [`Session::handle_process_event`]; [`crate::driver`] does this on a
//! single task together with caller commands and the rollback timer.

use std::collections::VecDeque;
use std::path::Path;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::buffer::RangeChange;
use crate::buffer::SourceBuffer;
use crate::buffer::TrackerId;
use crate::checkpoint::Checkpoint;
use crate::checkpoint::CheckpointId;
use crate::checkpoint::CheckpointStack;
use crate::checkpoint::PopState;
use crate::codec;
use crate::codec::Command;
use crate::codec::Decoded;
use crate::codec::OutputDecoder;
use crate::config::SessionConfig;
use crate::diagnostics::Diagnostic;
use crate::diagnostics::diagnostics_from_output;
use crate::error::CheckpointError;
use crate::error::Result;
use crate::error::SessionError;
use crate::error::SupervisorError;
use crate::position::Position;
use crate::position::Range;
use crate::supervisor::ExitInfo;
use crate::supervisor::ProcessEvent;
use crate::supervisor::ProcessEventKind;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No verifier process.
    Idle,
    /// Process alive, nothing in flight.
    Running,
    /// An attempt has been written and its sentinel has not arrived yet.
    Verifying,
    /// A kill was requested; waiting for the exit.
    Aborting,
}

/// Notifications for whatever presents the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    OutputAppended(String),
    CheckpointAccepted {
        checkpoint: CheckpointId,
        range: Range,
    },
    CheckpointRejected {
        checkpoint: CheckpointId,
        diagnostics: Vec<Diagnostic>,
    },
    /// Checkpoints discarded, top first.
    RolledBack { checkpoints: Vec<CheckpointId> },
    VerificationAborting,
    VerificationAborted,
    ProcessSpawnFailed { executable: String, reason: String },
    PreprocessFailed { program: String, reason: String },
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
        success: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The target is not past the verified prefix.
    NothingToVerify,
    Sent {
        checkpoint: CheckpointId,
        range: Range,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// A kill was already pending; the process was abandoned.
    AlreadyStopping,
    Aborting,
}

/// Push/pop bookkeeping. Every pushed checkpoint is eventually either popped
/// or discarded together with the process that held it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolStats {
    pub pushes: u64,
    pub pops: u64,
    pub discarded: u64,
}

impl ProtocolStats {
    /// Checkpoints the verifier still holds.
    pub fn outstanding(self) -> u64 {
        self.pushes.saturating_sub(self.pops + self.discarded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub verified: Range,
    pub depth: usize,
    pub diagnostics: usize,
    pub in_flight: Option<CheckpointId>,
    pub stats: ProtocolStats,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    checkpoint: CheckpointId,
    base: Position,
    /// An edit popped the checkpoint before its sentinel arrived.
    invalidated: bool,
}

/// A diagnostic from the last rejection. Current-buffer diagnostics are
/// tracked so they follow edits; touching one removes it.
#[derive(Debug, Clone)]
struct StoredDiagnostic {
    diagnostic: Diagnostic,
    tracker: Option<TrackerId>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRollback {
    checkpoint: CheckpointId,
    due: Instant,
}

pub struct Session<B: SourceBuffer> {
    config: SessionConfig,
    buffer: B,
    state: SessionState,
    stack: CheckpointStack,
    supervisor: ProcessSupervisor,
    decoder: OutputDecoder,
    stderr_partial: Vec<u8>,
    diagnostics: VecDeque<StoredDiagnostic>,
    in_flight: Option<InFlight>,
    pending_rollback: Option<PendingRollback>,
    stats: ProtocolStats,
    process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<B: SourceBuffer> Session<B> {
    pub fn new(config: SessionConfig, buffer: B) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            buffer,
            state: SessionState::Idle,
            stack: CheckpointStack::new(),
            supervisor: ProcessSupervisor::new(process_tx),
            decoder: OutputDecoder::new(),
            stderr_partial: Vec::new(),
            diagnostics: VecDeque::new(),
            in_flight: None,
            pending_rollback: None,
            stats: ProtocolStats::default(),
            process_rx,
            events_tx,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> ProtocolStats {
        self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Direct buffer access. Changes reported by the buffer must be passed to
    /// [`Session::on_range_changes`].
    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn checkpoints(&self) -> &CheckpointStack {
        &self.stack
    }

    /// Diagnostics of the last rejection at their current positions.
    pub fn diagnostics(&self) -> impl Iterator<Item = Diagnostic> + '_ {
        self.diagnostics.iter().map(|stored| self.live(stored))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            verified: self.stack.verified_range(),
            depth: self.stack.depth(),
            diagnostics: self.diagnostics.len(),
            in_flight: self.in_flight.map(|f| f.checkpoint),
            stats: self.stats,
        }
    }

    /// Verifies everything from the end of the verified prefix up to `target`.
    /// Returns once the attempt is written; the verdict arrives as an event.
    pub async fn verify(&mut self, target: Position) -> Result<VerifyOutcome> {
        match self.state {
            SessionState::Verifying => return Err(SessionError::VerificationInFlight),
            SessionState::Aborting => return Err(SessionError::Aborting),
            SessionState::Idle | SessionState::Running => {}
        }

        self.fire_pending_rollback();

        let target = self.buffer.clamp(target);
        let start = self.stack.top().range.end;
        if target <= start {
            return Ok(VerifyOutcome::NothingToVerify);
        }
        let range = Range { start, end: target };

        self.clear_diagnostics();
        self.decoder.clear_output();

        if !self.supervisor.is_alive() {
            self.start_process().await?;
        }

        let tracker = self.buffer.track(range);
        let checkpoint = match self.stack.push(range, Some(tracker)) {
            Ok(id) => id,
            Err(e) => {
                self.buffer.untrack(tracker);
                return Err(self.protocol_violation(e));
            }
        };

        let text = self.buffer.text_in_range(range);
        self.state = SessionState::Verifying;
        self.in_flight = Some(InFlight {
            checkpoint,
            base: start,
            invalidated: false,
        });
        self.stats.pushes += 1;
        tracing::debug!("push {checkpoint} {range}");
        self.supervisor
            .write(codec::encode_all(&Command::attempt(text)))?;
        Ok(VerifyOutcome::Sent { checkpoint, range })
    }

    /// Verifies up to the first check marker line at or below `cursor`, or up
    /// to the cursor when there is none.
    pub async fn verify_to_marker(&mut self, cursor: Position) -> Result<VerifyOutcome> {
        let target = self.marker_target(cursor);
        self.verify(target).await
    }

    fn marker_target(&self, cursor: Position) -> Position {
        let marker = self.config.check_marker.trim();
        let mut line = cursor.line;
        while let Some(text) = self.buffer.line_text(line) {
            if text.trim() == marker {
                return Position::new(line, 0);
            }
            line += 1;
        }
        cursor
    }

    /// Applies an edit to the buffer and rolls back whatever it invalidated.
    pub fn edit(&mut self, range: Range, text: &str) -> Vec<CheckpointId> {
        let changes = self.buffer.replace(range, text);
        self.on_range_changes(&changes)
    }

    /// Rolls back every live checkpoint whose text an edit modified. Returns
    /// the popped checkpoints, top first.
    pub fn on_range_changes(&mut self, changes: &[RangeChange]) -> Vec<CheckpointId> {
        self.drop_touched_diagnostics(changes);
        let mut popped = Vec::new();
        for change in changes.iter().filter(|c| c.text_changed) {
            let Some(id) = self.stack.find_by_tracker(change.tracker).map(|c| c.id) else {
                continue;
            };
            popped.extend(self.invalidate(id));
        }
        popped
    }

    /// Pops `checkpoint` and everything above it. A checkpoint that is no
    /// longer live is ignored.
    pub fn invalidate(&mut self, checkpoint: CheckpointId) -> Vec<CheckpointId> {
        let popped = self.stack.rollback_to(checkpoint);
        if popped.is_empty() {
            return Vec::new();
        }
        self.send_pops(&popped);

        let ids: Vec<CheckpointId> = popped.iter().map(|c| c.id).collect();
        if let Some(pending) = self.pending_rollback
            && ids.contains(&pending.checkpoint)
        {
            self.pending_rollback = None;
        }
        if let Some(in_flight) = self.in_flight.as_mut()
            && ids.contains(&in_flight.checkpoint)
        {
            in_flight.invalidated = true;
        }
        self.publish(SessionEvent::RolledBack {
            checkpoints: ids.clone(),
        });
        ids
    }

    fn send_pops(&mut self, popped: &[Checkpoint]) {
        for checkpoint in popped {
            if let Some(tracker) = checkpoint.tracker {
                self.buffer.untrack(tracker);
            }
            tracing::debug!("pop {} {}", checkpoint.id, checkpoint.range);
            match self.supervisor.write(Command::Pop.encode()) {
                Ok(()) => self.stats.pops += 1,
                Err(e) => {
                    tracing::warn!("could not pop {}: {e}", checkpoint.id);
                    self.stats.discarded += 1;
                }
            }
            self.stack.confirm_popped(checkpoint.id);
        }
    }

    /// Deadline of the delayed rollback after a rejection, if one is pending.
    pub fn pending_rollback_due(&self) -> Option<Instant> {
        self.pending_rollback.map(|p| p.due)
    }

    /// Performs the delayed rollback now.
    pub fn fire_pending_rollback(&mut self) -> Vec<CheckpointId> {
        let Some(pending) = self.pending_rollback.take() else {
            return Vec::new();
        };
        if self.stack.pop_state(pending.checkpoint) != Some(PopState::Live) {
            return Vec::new();
        }
        self.invalidate(pending.checkpoint)
    }

    /// Moves the first diagnostic to the back and returns the new first one.
    pub fn cycle_next_diagnostic(&mut self) -> Option<Diagnostic> {
        if self.diagnostics.is_empty() {
            return None;
        }
        self.diagnostics.rotate_left(1);
        self.diagnostics.front().map(|stored| self.live(stored))
    }

    /// Current-buffer diagnostics covering `position`.
    pub fn diagnostics_at(&self, position: Position) -> Vec<Diagnostic> {
        self.diagnostics()
            .filter(|d| d.is_current_buffer() && d.range().contains(position))
            .collect()
    }

    fn live(&self, stored: &StoredDiagnostic) -> Diagnostic {
        let mut diagnostic = stored.diagnostic.clone();
        if let Some(range) = stored
            .tracker
            .and_then(|tracker| self.buffer.tracked_range(tracker))
        {
            diagnostic.start = range.start;
            diagnostic.end = range.end;
        }
        diagnostic
    }

    fn store_diagnostics(&mut self, diagnostics: &[Diagnostic]) {
        self.clear_diagnostics();
        for diagnostic in diagnostics {
            let tracker = diagnostic
                .is_current_buffer()
                .then(|| self.buffer.track(diagnostic.range()));
            self.diagnostics.push_back(StoredDiagnostic {
                diagnostic: diagnostic.clone(),
                tracker,
            });
        }
    }

    fn clear_diagnostics(&mut self) {
        for stored in self.diagnostics.drain(..) {
            if let Some(tracker) = stored.tracker {
                self.buffer.untrack(tracker);
            }
        }
    }

    fn drop_touched_diagnostics(&mut self, changes: &[RangeChange]) {
        let buffer = &mut self.buffer;
        self.diagnostics.retain(|stored| {
            let touched = stored
                .tracker
                .is_some_and(|tracker| changes.iter().any(|c| c.tracker == tracker));
            if touched && let Some(tracker) = stored.tracker {
                buffer.untrack(tracker);
            }
            !touched
        });
    }

    /// Directory relative diagnostic paths resolve against.
    pub fn working_directory(&self) -> Option<&Path> {
        self.config.working_directory.as_deref()
    }

    pub fn stop(&mut self) -> StopOutcome {
        if self.state == SessionState::Idle {
            return StopOutcome::NotRunning;
        }
        self.discard_verifier_state();
        if self.supervisor.kill_requested() {
            tracing::info!("Verifier ignored the kill request, abandoning it");
            self.supervisor.detach();
            self.state = SessionState::Idle;
            self.publish(SessionEvent::VerificationAborted);
            return StopOutcome::AlreadyStopping;
        }
        self.supervisor.force_kill();
        self.state = SessionState::Aborting;
        self.publish(SessionEvent::VerificationAborting);
        StopOutcome::Aborting
    }

    /// Stop that arrived while a `verify` was still starting the verifier
    /// (the preprocessing step). The start was abandoned before anything was
    /// spawned, so there is no exit to wait for.
    pub(crate) fn cancel_start(&mut self) -> StopOutcome {
        if self.state != SessionState::Idle {
            return self.stop();
        }
        tracing::info!("Verifier start cancelled");
        self.publish(SessionEvent::VerificationAborting);
        self.publish(SessionEvent::VerificationAborted);
        StopOutcome::Aborting
    }

    /// Waits for the next event from the verifier process.
    pub async fn next_process_event(&mut self) -> Option<ProcessEvent> {
        self.process_rx.recv().await
    }

    pub fn handle_process_event(&mut self, event: ProcessEvent) {
        if self.supervisor.generation() != Some(event.generation) {
            tracing::debug!(
                "dropping event from stale verifier generation {}",
                event.generation
            );
            return;
        }
        match event.kind {
            ProcessEventKind::Stdout(bytes) => {
                if self.state == SessionState::Aborting {
                    return;
                }
                for decoded in self.decoder.feed(&bytes) {
                    self.on_decoded(decoded);
                }
            }
            ProcessEventKind::Stderr(bytes) => {
                if self.state == SessionState::Aborting {
                    return;
                }
                self.stderr_partial.extend_from_slice(&bytes);
                while let Some(newline) = self.stderr_partial.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = self.stderr_partial.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                    tracing::debug!("verifier stderr: {line}");
                    self.decoder.append_line(&line);
                    self.publish(SessionEvent::OutputAppended(line));
                }
            }
            ProcessEventKind::StdinClosed(reason) => {
                tracing::warn!("verifier stopped reading input: {reason}");
            }
            ProcessEventKind::Exited(exit) => self.on_exit(event.generation, exit),
        }
    }

    fn on_decoded(&mut self, decoded: Decoded) {
        match decoded {
            Decoded::Line(line) => self.publish(SessionEvent::OutputAppended(line)),
            Decoded::Accepted { .. } => {
                let Some(in_flight) = self.finish_attempt() else {
                    return;
                };
                if let Some(checkpoint) = self.stack.get(in_flight.checkpoint) {
                    let range = checkpoint.range;
                    tracing::debug!("accepted {} {range}", in_flight.checkpoint);
                    self.publish(SessionEvent::CheckpointAccepted {
                        checkpoint: in_flight.checkpoint,
                        range,
                    });
                }
            }
            Decoded::Rejected { output } => {
                let Some(in_flight) = self.finish_attempt() else {
                    return;
                };
                let diagnostics = diagnostics_from_output(&output, in_flight.base);
                tracing::debug!(
                    "rejected {} with {} diagnostics",
                    in_flight.checkpoint,
                    diagnostics.len()
                );
                self.store_diagnostics(&diagnostics);
                self.publish(SessionEvent::CheckpointRejected {
                    checkpoint: in_flight.checkpoint,
                    diagnostics,
                });
                self.pending_rollback = Some(PendingRollback {
                    checkpoint: in_flight.checkpoint,
                    due: Instant::now() + self.config.rollback_delay(),
                });
            }
        }
    }

    /// Ends the in-flight attempt. Returns it only when its verdict still
    /// matters.
    fn finish_attempt(&mut self) -> Option<InFlight> {
        let Some(in_flight) = self.in_flight.take() else {
            tracing::warn!("verdict received with no attempt in flight");
            return None;
        };
        self.state = SessionState::Running;
        if in_flight.invalidated {
            tracing::debug!("verdict for {} is stale", in_flight.checkpoint);
            return None;
        }
        Some(in_flight)
    }

    fn on_exit(&mut self, generation: u64, exit: ExitInfo) {
        self.supervisor.on_exited(generation);
        let aborting = self.state == SessionState::Aborting;
        let cleared = self.discard_verifier_state();
        self.state = SessionState::Idle;
        if aborting {
            self.publish(SessionEvent::VerificationAborted);
            return;
        }
        if !cleared.is_empty() {
            self.publish(SessionEvent::RolledBack {
                checkpoints: cleared,
            });
        }
        self.publish(SessionEvent::ProcessExited {
            code: exit.code,
            signal: exit.signal,
            success: exit.success(),
        });
    }

    /// Forgets everything the verifier process held.
    fn discard_verifier_state(&mut self) -> Vec<CheckpointId> {
        let cleared = self.stack.clear();
        for checkpoint in &cleared {
            if let Some(tracker) = checkpoint.tracker {
                self.buffer.untrack(tracker);
            }
        }
        self.stats.discarded += cleared.len() as u64;
        self.in_flight = None;
        self.pending_rollback = None;
        self.decoder.reset();
        self.stderr_partial.clear();
        cleared.iter().map(|c| c.id).collect()
    }

    async fn start_process(&mut self) -> Result<()> {
        let command = self.config.process_command();
        match self.supervisor.start(&command).await {
            Ok(_) => {
                self.decoder.reset();
                self.stderr_partial.clear();
                self.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("failed to start verifier: {e}");
                let event = match &e {
                    SupervisorError::PreprocessSpawn { program, .. }
                    | SupervisorError::PreprocessFailed { program, .. } => {
                        SessionEvent::PreprocessFailed {
                            program: program.clone(),
                            reason: e.to_string(),
                        }
                    }
                    _ => SessionEvent::ProcessSpawnFailed {
                        executable: command.executable.clone(),
                        reason: e.to_string(),
                    },
                };
                self.publish(event);
                self.state = SessionState::Idle;
                Err(e.into())
            }
        }
    }

    fn protocol_violation(&mut self, error: CheckpointError) -> SessionError {
        tracing::error!("checkpoint protocol violation, tearing down verifier: {error}");
        self.discard_verifier_state();
        if self.supervisor.force_kill() {
            self.state = SessionState::Aborting;
            self.publish(SessionEvent::VerificationAborting);
        } else {
            self.state = SessionState::Idle;
        }
        SessionError::ProtocolViolation(error)
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    #[cfg(test)]
    pub(crate) fn attach_in_memory(
        &mut self,
    ) -> (
        u64,
        mpsc::UnboundedReceiver<bytes::Bytes>,
        mpsc::UnboundedReceiver<crate::supervisor::Signal>,
    ) {
        self.state = SessionState::Running;
        self.supervisor.attach_in_memory()
    }
}
