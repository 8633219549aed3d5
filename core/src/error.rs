use std::process::ExitStatus;

use thiserror::Error;

use crate::position::Position;

/// Failures starting or talking to the verifier process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("verifier executable not found: {executable}")]
    BinaryNotFound { executable: String },

    #[error(
        "invalid verifier executable {executable:?}: the executable cannot contain whitespace, use arguments for arguments"
    )]
    InvalidExecutable { executable: String },

    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run preprocessing command {program}: {source}")]
    PreprocessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("preprocessing command {program} failed with {status}")]
    PreprocessFailed { program: String, status: ExitStatus },

    #[error("verifier process has no {stream} pipe")]
    StdioUnavailable { stream: &'static str },

    #[error("no verifier process is running")]
    NotRunning,
}

/// Violations of the checkpoint tiling invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint must start at {expected}, got {found}")]
    NonAdjacent { expected: Position, found: Position },

    #[error("empty checkpoint at {at}")]
    EmptyRange { at: Position },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a verification is already in flight")]
    VerificationInFlight,

    #[error("the session is aborting")]
    Aborting,

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] CheckpointError),

    #[error("session driver has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
