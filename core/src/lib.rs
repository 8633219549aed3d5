//! `fstar-core`: incremental verification sessions for an F* style verifier.
//!
//! A session keeps one verifier process running in interactive mode
//! (`fstar.exe --in`), pushes source regions to it one at a time, remembers
//! which regions were accepted, and pops them again when edits invalidate
//! them. Nothing is re-checked that the verifier already holds.
//!
//! ```text
//! SessionHandle ──► driver task ──► Session ──► ProcessSupervisor ──► verifier
//!                                     │  ▲                               │
//!                                     │  └────── ProcessEvent ◄──────────┘
//!                                     └──► SessionEvent (output, verdicts)
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod position;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use buffer::RangeChange;
pub use buffer::SourceBuffer;
pub use buffer::TextDocument;
pub use buffer::TrackerId;
pub use checkpoint::CheckpointId;
pub use config::ConfigError;
pub use config::ConfigLoader;
pub use config::SessionConfig;
pub use diagnostics::Diagnostic;
pub use diagnostics::DiagnosticSource;
pub use diagnostics::Location;
pub use driver::SessionHandle;
pub use driver::spawn_session;
pub use error::CheckpointError;
pub use error::SessionError;
pub use error::SupervisorError;
pub use position::Position;
pub use position::Range;
pub use registry::SessionRegistry;
pub use session::ProtocolStats;
pub use session::Session;
pub use session::SessionEvent;
pub use session::SessionSnapshot;
pub use session::SessionState;
pub use session::StopOutcome;
pub use session::VerifyOutcome;
pub use supervisor::ProcessCommand;
