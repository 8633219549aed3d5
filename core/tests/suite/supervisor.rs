use std::time::Duration;

use fstar_core::SupervisorError;
use fstar_core::supervisor::ExitInfo;
use fstar_core::supervisor::PreprocessCommand;
use fstar_core::supervisor::ProcessCommand;
use fstar_core::supervisor::ProcessEvent;
use fstar_core::supervisor::ProcessEventKind;
use fstar_core::supervisor::ProcessSupervisor;
use fstar_core::supervisor::Signal;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use crate::common::EVENT_TIMEOUT;

const SIGTERM: i32 = 15;

fn shell(script: &str) -> ProcessCommand {
    ProcessCommand {
        executable: "/bin/sh".to_string(),
        arguments: vec!["-c".to_string(), script.to_string()],
        working_directory: None,
        preprocess: None,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> ProcessEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for process event")
        .expect("event channel closed")
}

async fn wait_for_exit(events: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> (u64, ExitInfo) {
    loop {
        let event = next_event(events).await;
        if let ProcessEventKind::Exited(exit) = event.kind {
            return (event.generation, exit);
        }
    }
}

#[tokio::test]
async fn stdin_is_echoed_back_through_stdout() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut supervisor = ProcessSupervisor::new(tx);
    let generation = supervisor.start(&shell("exec cat")).await.expect("start");
    assert_eq!(supervisor.generation(), Some(generation));

    supervisor.write("#push\n").expect("write");
    supervisor.write("module A\n").expect("write");

    let mut echoed = Vec::new();
    while echoed != b"#push\nmodule A\n" {
        let event = next_event(&mut events).await;
        assert_eq!(event.generation, generation);
        if let ProcessEventKind::Stdout(bytes) = event.kind {
            echoed.extend_from_slice(&bytes);
        }
    }

    assert!(supervisor.kill(Signal::Terminate));
    let (exited, exit) = wait_for_exit(&mut events).await;
    assert_eq!(exited, generation);
    assert_eq!(exit.signal, Some(SIGTERM));
    assert!(!exit.success());
    assert!(supervisor.on_exited(exited));
    assert!(!supervisor.is_alive());
}

#[tokio::test]
async fn exit_code_and_stderr_are_reported() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut supervisor = ProcessSupervisor::new(tx);
    supervisor
        .start(&shell("echo 'A.fst(1,0-1,3): oops' >&2; exit 0"))
        .await
        .expect("start");

    let mut stderr = Vec::new();
    let exit = loop {
        let event = next_event(&mut events).await;
        match event.kind {
            ProcessEventKind::Stderr(bytes) => stderr.extend_from_slice(&bytes),
            ProcessEventKind::Exited(exit) => break exit,
            _ => {}
        }
    };
    assert_eq!(String::from_utf8_lossy(&stderr), "A.fst(1,0-1,3): oops\n");
    assert_eq!(exit.code, Some(0));
    assert!(exit.success());
}

#[tokio::test]
async fn each_start_gets_a_new_generation() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut supervisor = ProcessSupervisor::new(tx);
    let first = supervisor.start(&shell("exit 0")).await.expect("start");
    let (exited, _) = wait_for_exit(&mut events).await;
    supervisor.on_exited(exited);

    let second = supervisor.start(&shell("exit 0")).await.expect("restart");
    assert!(second > first);
}

#[tokio::test]
async fn failing_preprocess_prevents_spawn() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut supervisor = ProcessSupervisor::new(tx);
    let mut command = shell("exec cat");
    command.preprocess = Some(PreprocessCommand {
        program: "/bin/sh".to_string(),
        arguments: vec!["-c".to_string(), "exit 4".to_string()],
    });

    let err = supervisor.start(&command).await.expect_err("preprocess fails");
    match &err {
        SupervisorError::PreprocessFailed { status, .. } => assert_eq!(status.code(), Some(4)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!supervisor.is_alive());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn preprocess_runs_in_the_working_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (tx, _events) = mpsc::unbounded_channel();
    let mut supervisor = ProcessSupervisor::new(tx);
    let mut command = shell("exec cat");
    command.working_directory = Some(dir.path().to_path_buf());
    command.preprocess = Some(PreprocessCommand {
        program: "/bin/sh".to_string(),
        arguments: vec!["-c".to_string(), "echo built > prep.out".to_string()],
    });

    supervisor.start(&command).await.expect("start");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("prep.out")).expect("preprocess output"),
        "built\n"
    );
    supervisor.force_kill();
}
