//! Scripted stand-in for the verifier.
//!
//! The script logs every stdin line to `received.log`, answers `#ok` for each
//! attempt, and reacts to a few magic words inside the pushed text:
//! `FAIL` rejects with one diagnostic, `HANG` never answers, `EXIT` exits
//! with status 3 as soon as it is read.

use std::path::PathBuf;
use std::time::Duration;

use fstar_core::SessionConfig;
use fstar_core::SessionEvent;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

const SCRIPT: &str = r##"log="$1"
failed=0
hang=0
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$log"
  case "$line" in
    "#push") failed=0; hang=0 ;;
    "#pop") ;;
    "#end #ok #fail")
      if [ "$hang" = 1 ]; then
        :
      elif [ "$failed" = 1 ]; then
        echo "Verifying attempt"
        echo "<input>(1,0-1,0): parse error near 'FAIL'"
        echo "#fail"
      else
        echo "#ok"
      fi ;;
    *FAIL*) failed=1 ;;
    *HANG*) hang=1 ;;
    *EXIT*) exit 3 ;;
  esac
done
"##;

pub struct FakeVerifier {
    pub dir: TempDir,
    pub log: PathBuf,
    script: PathBuf,
}

impl FakeVerifier {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-verifier.sh");
        std::fs::write(&script, SCRIPT).expect("write fake verifier");
        let log = dir.path().join("received.log");
        Self { dir, log, script }
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig {
            executable: "/bin/sh".to_string(),
            arguments: vec![
                self.script.display().to_string(),
                self.log.display().to_string(),
            ],
            working_directory: Some(self.dir.path().to_path_buf()),
            rollback_delay_ms: 0,
            ..SessionConfig::default()
        }
    }

    /// Lines the fake has read so far.
    pub fn received(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Polls the log until `done` holds for it.
    pub async fn wait_for_received(&self, done: impl Fn(&[String]) -> bool) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let lines = self.received();
            if done(&lines) {
                return lines;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "fake verifier never reached the expected input: {lines:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Next event matching `pred`, skipping the rest.
pub async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let wait = async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("session event stream closed");
    };
    tokio::time::timeout(EVENT_TIMEOUT, wait)
        .await
        .expect("timed out waiting for session event")
}

pub fn count(lines: &[String], wanted: &str) -> usize {
    lines.iter().filter(|line| *line == wanted).count()
}
