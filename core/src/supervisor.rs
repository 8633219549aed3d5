//! Owns the verifier child process.
//!
//! ## Architecture
//!
//! ```text
//! ProcessSupervisor (owned by the session)
//!   ├─ stdin writer task   <- unbounded mpsc of byte chunks, FIFO
//!   ├─ stdout reader task  -> ProcessEvent::Stdout
//!   ├─ stderr reader task  -> ProcessEvent::Stderr
//!   └─ waiter task         owns the Child, applies signals, reports Exited
//! ```
//!
//! Every spawned process gets a new generation number and every event is
//! tagged with it, so output from a process that has already been replaced
//! can be told apart and dropped by the consumer.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SupervisorError;

const READ_BUFFER_SIZE: usize = 8192;

/// How long the waiter lets the readers drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Fully resolved verifier invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub executable: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub preprocess: Option<PreprocessCommand>,
}

/// Command run to completion before the verifier is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessCommand {
    pub program: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    Stdout(Bytes),
    Stderr(Bytes),
    /// Writing to stdin failed; the reason is the io error text.
    StdinClosed(String),
    /// Delivered once, after the output readers have drained.
    Exited(ExitInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub generation: u64,
    pub kind: ProcessEventKind,
}

#[derive(Debug)]
struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<Bytes>,
    control_tx: mpsc::UnboundedSender<Signal>,
    kill_requested: bool,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    current: Option<ProcessHandle>,
    generation: u64,
}

impl ProcessSupervisor {
    pub fn new(events_tx: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self {
            events_tx,
            current: None,
            generation: 0,
        }
    }

    /// Runs the preprocessing step, if any, then spawns the verifier.
    /// Returns the new process generation.
    pub async fn start(&mut self, command: &ProcessCommand) -> Result<u64, SupervisorError> {
        if command.executable.chars().any(char::is_whitespace) {
            return Err(SupervisorError::InvalidExecutable {
                executable: command.executable.clone(),
            });
        }
        let cwd = command
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let resolved =
            which::which_in(&command.executable, std::env::var_os("PATH"), &cwd).map_err(|_| {
                SupervisorError::BinaryNotFound {
                    executable: command.executable.clone(),
                }
            })?;

        if let Some(preprocess) = &command.preprocess {
            run_preprocess(preprocess, &cwd).await?;
        }

        tracing::info!(
            "Spawning verifier: {} {:?} (cwd={})",
            resolved.display(),
            command.arguments,
            cwd.display()
        );
        let mut child = Command::new(&resolved)
            .args(&command.arguments)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                executable: command.executable.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::StdioUnavailable { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::StdioUnavailable { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::StdioUnavailable { stream: "stderr" })?;

        self.generation += 1;
        let generation = self.generation;
        let pid = child.id();
        tracing::info!("Verifier spawned: PID={pid:?}, generation={generation}");

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_stdin(
            stdin,
            stdin_rx,
            generation,
            self.events_tx.clone(),
        ));
        let readers = vec![
            tokio::spawn(read_stream(
                stdout,
                generation,
                self.events_tx.clone(),
                ProcessEventKind::Stdout,
            )),
            tokio::spawn(read_stream(
                stderr,
                generation,
                self.events_tx.clone(),
                ProcessEventKind::Stderr,
            )),
        ];
        tokio::spawn(wait_for_exit(
            child,
            control_rx,
            readers,
            generation,
            self.events_tx.clone(),
        ));

        self.current = Some(ProcessHandle {
            generation,
            pid,
            stdin_tx,
            control_tx,
            kill_requested: false,
        });
        Ok(generation)
    }

    /// Queues bytes for the stdin writer.
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<(), SupervisorError> {
        let handle = self.current.as_ref().ok_or(SupervisorError::NotRunning)?;
        handle
            .stdin_tx
            .send(bytes.into())
            .map_err(|_| SupervisorError::NotRunning)
    }

    /// Asks the process to terminate. Completion is only known from the
    /// `Exited` event. Returns false when there is no process.
    pub fn kill(&mut self, signal: Signal) -> bool {
        let Some(handle) = self.current.as_mut() else {
            return false;
        };
        tracing::info!(
            "Signalling verifier: PID={:?}, generation={}, signal={signal:?}",
            handle.pid,
            handle.generation
        );
        handle.kill_requested = true;
        if handle.control_tx.send(signal).is_err() {
            tracing::warn!("Verifier waiter already finished, signal dropped");
        }
        true
    }

    pub fn force_kill(&mut self) -> bool {
        self.kill(Signal::Kill)
    }

    pub fn is_alive(&self) -> bool {
        self.current.is_some()
    }

    pub fn kill_requested(&self) -> bool {
        self.current.as_ref().is_some_and(|h| h.kill_requested)
    }

    /// Generation of the current process, if any.
    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|h| h.generation)
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|h| h.pid)
    }

    /// Forgets the current process. Dropping the control channel makes the
    /// waiter kill the child if it is still around.
    pub fn detach(&mut self) {
        if let Some(handle) = self.current.take() {
            tracing::info!("Detaching verifier generation {}", handle.generation);
        }
    }

    /// Clears the handle if `generation` is the current process. Returns
    /// whether it was.
    pub fn on_exited(&mut self, generation: u64) -> bool {
        if self.generation() == Some(generation) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Installs a process backed only by channels. The returned receivers see
    /// what the session writes and which signals it sends.
    #[cfg(test)]
    pub(crate) fn attach_in_memory(
        &mut self,
    ) -> (
        u64,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedReceiver<Signal>,
    ) {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.generation += 1;
        self.current = Some(ProcessHandle {
            generation: self.generation,
            pid: None,
            stdin_tx,
            control_tx,
            kill_requested: false,
        });
        (self.generation, stdin_rx, control_rx)
    }
}

async fn run_preprocess(preprocess: &PreprocessCommand, cwd: &Path) -> Result<(), SupervisorError> {
    tracing::info!(
        "Running preprocessing: {} {:?}",
        preprocess.program,
        preprocess.arguments
    );
    let output = Command::new(&preprocess.program)
        .args(&preprocess.arguments)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SupervisorError::PreprocessSpawn {
            program: preprocess.program.clone(),
            source,
        })?;
    if !output.stderr.is_empty() {
        tracing::debug!(
            "Preprocessing stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    if output.status.success() {
        Ok(())
    } else {
        Err(SupervisorError::PreprocessFailed {
            program: preprocess.program.clone(),
            status: output.status,
        })
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    while let Some(chunk) = chunks.recv().await {
        let result = match stdin.write_all(&chunk).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Verifier stdin closed: {e}");
            let _ = events_tx.send(ProcessEvent {
                generation,
                kind: ProcessEventKind::StdinClosed(e.to_string()),
            });
            break;
        }
    }
}

async fn read_stream<R>(
    mut reader: R,
    generation: u64,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(Bytes) -> ProcessEventKind,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = ProcessEvent {
                    generation,
                    kind: wrap(Bytes::copy_from_slice(&buf[..n])),
                };
                if events_tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Verifier output read error: {e}");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<Signal>,
    readers: Vec<JoinHandle<()>>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut detached = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = control_rx.recv(), if !detached => match signal {
                Some(signal) => deliver_signal(&mut child, signal),
                None => {
                    detached = true;
                    deliver_signal(&mut child, Signal::Kill);
                }
            },
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            tracing::warn!("Failed to wait for verifier: {e}");
            ExitInfo::default()
        }
    };

    let drain = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!("Verifier output still open after exit, not waiting further");
    }

    tracing::info!(
        "Verifier exited: generation={generation}, code={:?}, signal={:?}",
        exit.code,
        exit.signal
    );
    let _ = events_tx.send(ProcessEvent {
        generation,
        kind: ProcessEventKind::Exited(exit),
    });
}

fn deliver_signal(child: &mut Child, signal: Signal) {
    match signal {
        Signal::Kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("start_kill failed: {e}");
            }
        }
        Signal::Interrupt | Signal::Terminate => {
            #[cfg(unix)]
            {
                let raw = match signal {
                    Signal::Interrupt => libc::SIGINT,
                    _ => libc::SIGTERM,
                };
                if let Some(pid) = child.id() {
                    // SAFETY: plain kill(2) on a pid we spawned and still own.
                    let rc = unsafe { libc::kill(pid as libc::pid_t, raw) };
                    if rc != 0 {
                        tracing::debug!(
                            "kill({pid}, {raw}) failed: {}",
                            std::io::Error::last_os_error()
                        );
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn command(executable: &str) -> ProcessCommand {
        ProcessCommand {
            executable: executable.to_string(),
            arguments: vec!["--in".to_string()],
            working_directory: None,
            preprocess: None,
        }
    }

    #[tokio::test]
    async fn rejects_executable_with_whitespace() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(tx);
        let err = supervisor
            .start(&command("fstar.exe --in"))
            .await
            .expect_err("whitespace must be rejected");
        assert!(matches!(err, SupervisorError::InvalidExecutable { .. }));
        assert!(err.to_string().contains("use arguments for arguments"));
        assert!(!supervisor.is_alive());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(tx);
        let err = supervisor
            .start(&command("definitely-not-a-verifier-binary"))
            .await
            .expect_err("binary should be missing");
        assert!(matches!(err, SupervisorError::BinaryNotFound { .. }));
        assert_eq!(supervisor.generation(), None);
    }

    #[test]
    fn write_without_process_is_not_running() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(tx);
        assert!(matches!(
            supervisor.write("#pop\n"),
            Err(SupervisorError::NotRunning)
        ));
    }

    #[test]
    fn kill_marks_request_and_forwards_signal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(tx);
        assert!(!supervisor.kill(Signal::Terminate));

        let (generation, _stdin, mut signals) = supervisor.attach_in_memory();
        assert!(!supervisor.kill_requested());
        assert!(supervisor.force_kill());
        assert!(supervisor.kill_requested());
        assert_eq!(signals.try_recv().ok(), Some(Signal::Kill));

        assert!(!supervisor.on_exited(generation + 1));
        assert!(supervisor.on_exited(generation));
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn generations_increase_per_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(tx);
        let (first, _, _) = supervisor.attach_in_memory();
        supervisor.detach();
        let (second, _, _) = supervisor.attach_in_memory();
        assert!(second > first);
    }

    #[test]
    fn exit_info_success_requires_zero_code() {
        assert!(
            ExitInfo {
                code: Some(0),
                signal: None
            }
            .success()
        );
        assert!(
            !ExitInfo {
                code: None,
                signal: Some(9)
            }
            .success()
        );
    }
}
