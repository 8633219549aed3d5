use std::time::Duration;

use fstar_core::DiagnosticSource;
use fstar_core::Position;
use fstar_core::Range;
use fstar_core::Session;
use fstar_core::SessionError;
use fstar_core::SessionEvent;
use fstar_core::SessionHandle;
use fstar_core::SessionState;
use fstar_core::StopOutcome;
use fstar_core::TextDocument;
use fstar_core::VerifyOutcome;
use fstar_core::config::PreprocessConfig;
use fstar_core::spawn_session;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use crate::common::EVENT_TIMEOUT;
use crate::common::FakeVerifier;
use crate::common::count;
use crate::common::wait_for_event;

fn start(
    fake: &FakeVerifier,
    source: &str,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (session, events) = Session::new(fake.config(), TextDocument::from_text(source));
    let (handle, _task) = spawn_session(session);
    (handle, events)
}

async fn accept(
    handle: &SessionHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    line: u32,
) {
    let outcome = handle
        .verify(Position::new(line, 0))
        .await
        .expect("verify");
    assert!(matches!(outcome, VerifyOutcome::Sent { .. }), "{outcome:?}");
    wait_for_event(events, |e| matches!(e, SessionEvent::CheckpointAccepted { .. })).await;
}

#[tokio::test]
async fn rejection_is_reported_and_popped_once() {
    let fake = FakeVerifier::new();
    let (handle, mut events) = start(&fake, "module A\nlet x = 1\nlet FAIL = 2\nlet y = 3\n");

    accept(&handle, &mut events, 2).await;
    handle.verify(Position::new(3, 0)).await.expect("verify");

    let SessionEvent::CheckpointRejected { diagnostics, .. } = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::CheckpointRejected { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].source, DiagnosticSource::CurrentBuffer);
    assert_eq!(diagnostics[0].range(), Range::new((2, 0), (2, 1)));
    assert_eq!(diagnostics[0].message, "parse error near 'FAIL'");

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::RolledBack { .. })).await;
    let received = fake
        .wait_for_received(|lines| count(lines, "#pop") == 1)
        .await;
    assert_eq!(
        received,
        vec![
            "#push",
            "module A",
            "let x = 1",
            "",
            "#end #ok #fail",
            "#push",
            "let FAIL = 2",
            "",
            "#end #ok #fail",
            "#pop",
        ]
    );

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state, SessionState::Running);
    assert_eq!(snapshot.verified, Range::new((0, 0), (2, 0)));
    assert_eq!(
        handle
            .diagnostics_at(Position::new(2, 0))
            .await
            .expect("query")
            .len(),
        1
    );
}

#[tokio::test]
async fn invalidating_edits_pop_before_the_next_push() {
    let fake = FakeVerifier::new();
    let (handle, mut events) = start(&fake, "module A\nlet a = 1\nlet b = 2\nlet c = 3\n");
    accept(&handle, &mut events, 1).await;
    accept(&handle, &mut events, 2).await;
    accept(&handle, &mut events, 3).await;

    let popped_c = handle
        .edit(Range::new((2, 8), (2, 9)), "20")
        .await
        .expect("edit");
    let popped_b = handle
        .edit(Range::new((1, 8), (1, 9)), "10")
        .await
        .expect("edit");
    assert_eq!(popped_c.len(), 1);
    assert_eq!(popped_b.len(), 1);
    assert!(popped_c[0] > popped_b[0]);

    accept(&handle, &mut events, 4).await;
    let received = fake
        .wait_for_received(|lines| count(lines, "#push") == 4)
        .await;
    let fourth_push = received
        .iter()
        .rposition(|line| line == "#push")
        .expect("fourth push");
    assert_eq!(
        &received[fourth_push - 2..fourth_push + 2],
        &["#pop", "#pop", "#push", "let a = 10"]
    );
    assert_eq!(count(&received, "#pop"), 2);
}

#[tokio::test]
async fn stop_while_verifying_ignores_the_verdict() {
    let fake = FakeVerifier::new();
    let (handle, mut events) = start(&fake, "module A\nlet HANG = 1\n");
    accept(&handle, &mut events, 1).await;
    handle.verify(Position::new(2, 0)).await.expect("verify");
    fake.wait_for_received(|lines| count(lines, "#end #ok #fail") == 2)
        .await;

    assert_eq!(handle.stop().await.expect("stop"), StopOutcome::Aborting);
    wait_for_event(&mut events, |e| *e == SessionEvent::VerificationAborted).await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.depth, 0);
    assert_eq!(snapshot.stats.outstanding(), 0);
}

#[tokio::test]
async fn verifier_exit_returns_session_to_idle() {
    let fake = FakeVerifier::new();
    let (handle, mut events) = start(&fake, "module A\nlet EXIT = 1\n");
    accept(&handle, &mut events, 1).await;
    handle.verify(Position::new(2, 0)).await.expect("verify");

    let exited =
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::ProcessExited { .. })).await;
    assert_eq!(
        exited,
        SessionEvent::ProcessExited {
            code: Some(3),
            signal: None,
            success: false,
        }
    );
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.depth, 0);

    // The next request starts a fresh verifier from the top of the file.
    let outcome = handle.verify(Position::new(1, 0)).await.expect("verify");
    assert!(matches!(
        outcome,
        VerifyOutcome::Sent { range, .. } if range == Range::new((0, 0), (1, 0))
    ));
}

#[tokio::test]
async fn failed_preprocess_never_starts_the_verifier() {
    let fake = FakeVerifier::new();
    let mut config = fake.config();
    config.preprocess = Some(PreprocessConfig {
        program: "/bin/sh".to_string(),
        arguments: vec!["-c".to_string(), "exit 2".to_string()],
    });
    let (session, mut events) = Session::new(config, TextDocument::from_text("module A\n"));
    let (handle, _task) = spawn_session(session);

    let err = handle
        .verify(Position::new(1, 0))
        .await
        .expect_err("preprocess fails");
    assert!(matches!(err, SessionError::Supervisor(_)));
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::PreprocessFailed { .. })
    ));
    assert!(!fake.log.exists());
    assert_eq!(
        handle.snapshot().await.expect("snapshot").state,
        SessionState::Idle
    );
}

#[tokio::test]
async fn stop_during_preprocessing_cancels_the_start() {
    let fake = FakeVerifier::new();
    let mut config = fake.config();
    config.preprocess = Some(PreprocessConfig {
        program: "/bin/sh".to_string(),
        arguments: vec![
            "-c".to_string(),
            "touch preprocessing && sleep 5".to_string(),
        ],
    });
    let (session, mut events) = Session::new(config, TextDocument::from_text("module A\n"));
    let (handle, _task) = spawn_session(session);

    let verifying = tokio::spawn({
        let handle = handle.clone();
        async move { handle.verify(Position::new(1, 0)).await }
    });
    let started = fake.dir.path().join("preprocessing");
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !started.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "preprocessing never started"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stopped = tokio::time::timeout(Duration::from_secs(2), handle.stop())
        .await
        .expect("stop answered while preprocessing runs")
        .expect("stop");
    assert_eq!(stopped, StopOutcome::Aborting);
    assert!(matches!(
        verifying.await.expect("join"),
        Err(SessionError::Aborting)
    ));
    wait_for_event(&mut events, |e| *e == SessionEvent::VerificationAborted).await;
    assert!(!fake.log.exists());
    assert_eq!(
        handle.snapshot().await.expect("snapshot").state,
        SessionState::Idle
    );
}

#[tokio::test]
async fn verify_to_marker_checks_up_to_the_marker() {
    let fake = FakeVerifier::new();
    let (handle, mut events) = start(
        &fake,
        "module A\nlet a = 1\n(* check_marker *)\nlet b = 2\n",
    );
    let outcome = handle
        .verify_to_marker(Position::new(0, 3))
        .await
        .expect("verify");
    assert!(matches!(
        outcome,
        VerifyOutcome::Sent { range, .. } if range == Range::new((0, 0), (2, 0))
    ));
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::CheckpointAccepted { .. })).await;
}
