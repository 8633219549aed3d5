//! End-to-end tests for the `fstar-interactive` binary against a scripted
//! verifier.
//!
//! ## Exit Codes (`check`)
//! - 0: every attempt accepted
//! - 1: an attempt was rejected
//! - 2: the verifier could not be started or died
#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use predicates::prelude::*;
use tempfile::TempDir;

/// Answers `#ok` to every attempt unless the pushed text contains `FAIL`.
const FAKE_VERIFIER: &str = r##"failed=0
while IFS= read -r line; do
  case "$line" in
    "#push") failed=0 ;;
    "#pop") ;;
    "#end #ok #fail")
      if [ "$failed" = 1 ]; then
        echo "<input>(1,4-1,8): parse error near 'FAIL'"
        echo "#fail"
      else
        echo "checked"
        echo "#ok"
      fi ;;
    *FAIL*) failed=1 ;;
  esac
done
"##;

struct Workspace {
    dir: TempDir,
    script: PathBuf,
}

impl Workspace {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("fake-verifier.sh");
        std::fs::write(&script, FAKE_VERIFIER)?;
        Ok(Self { dir, script })
    }

    fn source(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, text)?;
        Ok(path)
    }

    fn command(&self, subcommand: &str, file: &Path) -> Result<assert_cmd::Command> {
        let mut cmd = assert_cmd::Command::cargo_bin("fstar-interactive")?;
        cmd.current_dir(self.dir.path())
            .env_remove("RUST_LOG")
            .arg(subcommand)
            .arg(file)
            .arg("--executable")
            .arg("/bin/sh")
            .arg("--arg")
            .arg(&self.script);
        Ok(cmd)
    }
}

#[test]
fn check_accepted_file_exits_0() -> Result<()> {
    let ws = Workspace::new()?;
    let file = ws.source("A.fst", "module A\nlet x = 1\nlet y = 2\n")?;

    ws.command("check", &file)?
        .args(["--to", "2:1", "--to", "4:1", "--verbose"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("| checked"))
        .stdout(predicate::str::contains("accepted #1 1:1-2:1"))
        .stdout(predicate::str::contains("accepted #2 2:1-4:1"));
    Ok(())
}

#[test]
fn check_rejected_attempt_exits_1_with_diagnostic() -> Result<()> {
    let ws = Workspace::new()?;
    let file = ws.source("A.fst", "module A\nlet x = 1\nlet FAIL = 2\n")?;

    let output = ws.command("check", &file)?.args(["--to", "3:1"]).output()?;
    assert_eq!(output.status.code(), Some(0), "first attempt stops before the error");

    let output = ws.command("check", &file)?.output()?;
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout)?;
    assert!(
        stdout.contains("A.fst:1:5: parse error near 'FAIL'"),
        "unexpected stdout: {stdout}"
    );
    Ok(())
}

#[test]
fn check_with_missing_verifier_exits_2() -> Result<()> {
    let ws = Workspace::new()?;
    let file = ws.source("A.fst", "module A\n")?;

    let mut cmd = assert_cmd::Command::cargo_bin("fstar-interactive")?;
    cmd.current_dir(ws.dir.path())
        .args(["check"])
        .arg(&file)
        .args(["--executable", "/nonexistent/fstar.exe"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("verifier executable not found"));
    Ok(())
}

#[test]
fn check_unreadable_file_exits_2() -> Result<()> {
    let ws = Workspace::new()?;
    let missing = ws.dir.path().join("Missing.fst");

    ws.command("check", &missing)?
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to read"));
    Ok(())
}

#[test]
fn repl_verifies_and_reports_status() -> Result<()> {
    let ws = Workspace::new()?;
    let file = ws.source("A.fst", "module A\nlet x = 1\n")?;

    ws.command("repl", &file)?
        .write_stdin("check 2:1\nwait\nstatus\nbogus\nquit\n")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("sent #1 1:1-2:1"))
        .stdout(predicate::str::contains("accepted #1 1:1-2:1"))
        .stdout(predicate::str::contains("state=Running"))
        .stdout(predicate::str::contains("error: unknown command \"bogus\""))
        .stdout(predicate::str::contains("aborted"));
    Ok(())
}
