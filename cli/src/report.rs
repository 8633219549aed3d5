//! Human-readable rendering of positions, diagnostics and session events.
//! Everything printed uses 1-based lines and columns.

use std::path::Path;

use fstar_core::Diagnostic;
use fstar_core::Location;
use fstar_core::Position;
use fstar_core::Range;
use fstar_core::SessionEvent;
use fstar_core::SessionSnapshot;

pub fn position(position: Position) -> String {
    format!("{}:{}", position.line + 1, position.column + 1)
}

pub fn range(range: Range) -> String {
    format!("{}-{}", position(range.start), position(range.end))
}

/// `path:line:col: message`, current-buffer diagnostics attributed to `file`.
pub fn diagnostic(file: &Path, working_directory: &Path, diagnostic: &Diagnostic) -> String {
    match diagnostic.location(working_directory) {
        Location::Buffer(start) => format!(
            "{}:{}: {}",
            file.display(),
            position(start),
            diagnostic.message
        ),
        Location::File { path, line, column } => format!(
            "{}:{}:{}: {}",
            path.display(),
            line + 1,
            column + 1,
            diagnostic.message
        ),
    }
}

pub fn snapshot(snapshot: &SessionSnapshot) -> String {
    format!(
        "state={:?} verified={} checkpoints={} diagnostics={} pushes={} pops={}",
        snapshot.state,
        range(snapshot.verified),
        snapshot.depth,
        snapshot.diagnostics,
        snapshot.stats.pushes,
        snapshot.stats.pops
    )
}

/// One or more lines describing `event`.
pub fn event(file: &Path, working_directory: &Path, event: &SessionEvent) -> Vec<String> {
    match event {
        SessionEvent::OutputAppended(line) => vec![format!("| {line}")],
        SessionEvent::CheckpointAccepted { checkpoint, range: r } => {
            vec![format!("accepted {checkpoint} {}", range(*r))]
        }
        SessionEvent::CheckpointRejected {
            checkpoint,
            diagnostics,
        } => std::iter::once(format!("rejected {checkpoint}"))
            .chain(
                diagnostics
                    .iter()
                    .map(|d| diagnostic(file, working_directory, d)),
            )
            .collect(),
        SessionEvent::RolledBack { checkpoints } => {
            let ids: Vec<String> = checkpoints.iter().map(ToString::to_string).collect();
            vec![format!("rolled back {}", ids.join(" "))]
        }
        SessionEvent::VerificationAborting => vec!["aborting".to_string()],
        SessionEvent::VerificationAborted => vec!["aborted".to_string()],
        SessionEvent::ProcessSpawnFailed { executable, reason } => {
            vec![format!("could not start {executable}: {reason}")]
        }
        SessionEvent::PreprocessFailed { program, reason } => {
            vec![format!("preprocessing with {program} failed: {reason}")]
        }
        SessionEvent::ProcessExited {
            code,
            signal,
            success,
        } => {
            let how = match (code, signal) {
                (Some(code), _) => format!("code {code}"),
                (None, Some(signal)) => format!("signal {signal}"),
                (None, None) => "unknown status".to_string(),
            };
            let verdict = if *success { "finished" } else { "failed" };
            vec![format!("verifier {verdict} ({how})")]
        }
    }
}
