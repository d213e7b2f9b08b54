//! Status reconciliation end to end with a scripted process table

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use warden_daemon::persistence::{PidMarker, SessionConfig};
use warden_daemon::process::Liveness;
use warden_daemon::session::{GuardianSession, RunMode, SessionMode};
use warden_daemon::status::{ConflictKind, CorrectiveAction, StatusReconciler, StopOutcome};
use warden_tests::helpers::fixture::{GuardedDir, primary_identity};
use warden_tests::{PRIMARY_A, ScriptedProcessController};

fn reconciler(dir: &GuardedDir, processes: Arc<ScriptedProcessController>) -> StatusReconciler {
    StatusReconciler::new(&dir.settings, &dir.paths, processes)
}

#[tokio::test]
async fn dead_marker_is_cleared_and_score_recovers() {
    let dir = GuardedDir::new();
    dir.persistence().write_pid(4242).unwrap();
    let processes = Arc::new(ScriptedProcessController::with(4242, Liveness::Dead));
    let reconciler = reconciler(&dir, processes.clone());

    let outcome = reconciler.sync().await;
    assert_eq!(outcome.before.report.mode, SessionMode::None);
    assert_eq!(outcome.before.report.issues[0].kind, ConflictKind::StalePidMarker);
    assert_eq!(outcome.actions[0].action, CorrectiveAction::RemovePidMarker);
    assert!(outcome.after.report.consistent);
    assert!(outcome.after.report.score > outcome.before.report.score);
    assert_eq!(dir.persistence().read_pid().unwrap(), PidMarker::Absent);
    assert!(processes.terminated().is_empty());
}

#[tokio::test]
async fn sync_never_kills_without_confirmation() {
    let dir = GuardedDir::new();
    dir.persistence().write_pid(4242).unwrap();
    let processes = Arc::new(ScriptedProcessController::with(4242, Liveness::Unknown));
    processes.set_named(vec![4242, 5151]);
    let reconciler = reconciler(&dir, processes.clone());

    let outcome = reconciler.sync().await;
    // an unanswered liveness query reads as stale, but only the marker goes
    assert_eq!(outcome.before.report.issues[0].kind, ConflictKind::StalePidMarker);
    assert!(processes.terminated().is_empty());

    assert_eq!(reconciler.stop_standalone().await.unwrap(), StopOutcome::NotRunning);
    assert!(processes.terminated().is_empty());
}

#[tokio::test]
async fn hung_liveness_query_leaves_the_service_alone() {
    let dir = GuardedDir::new();
    dir.persistence().write_pid(4242).unwrap();
    let processes = Arc::new(ScriptedProcessController::with(4242, Liveness::Alive));
    processes.set_delay(Duration::from_secs(2));
    let reconciler = reconciler(&dir, processes.clone());

    assert_eq!(reconciler.stop_standalone().await.unwrap(), StopOutcome::Unconfirmed(4242));
    assert!(processes.terminated().is_empty());
}

#[tokio::test]
async fn healthy_standalone_service_is_consistent() {
    let dir = GuardedDir::new();
    dir.write_config(&json!({"primaryId": PRIMARY_A}));
    dir.persistence().write_pid(4242).unwrap();
    dir.persistence()
        .save_session(&SessionConfig::new(primary_identity(PRIMARY_A), None))
        .unwrap();
    let reconciler = reconciler(&dir, Arc::new(ScriptedProcessController::with(4242, Liveness::Alive)));

    let snapshot = reconciler.compute_status().await;
    assert_eq!(snapshot.report.mode, SessionMode::Standalone);
    assert!(snapshot.report.consistent);
    assert_eq!(snapshot.report.score, 100);
    assert_eq!(snapshot.protection.carries_target, Some(true));
    assert!(snapshot.summary().starts_with("standalone service running (pid 4242)"));

    assert_eq!(reconciler.sync().await.actions.len(), 0);
}

#[tokio::test]
async fn standalone_wins_over_in_process() {
    let dir = GuardedDir::new();
    dir.persistence().write_pid(4242).unwrap();
    dir.persistence()
        .save_session(&SessionConfig::new(primary_identity(PRIMARY_A), None))
        .unwrap();
    let reconciler = reconciler(&dir, Arc::new(ScriptedProcessController::with(4242, Liveness::Alive)));

    let mut session = GuardianSession::start(primary_identity(PRIMARY_A), RunMode::InProcess, &dir.settings, &dir.paths)
        .await
        .unwrap();
    reconciler.attach_in_process(session.handle());

    let outcome = reconciler.sync().await;
    assert_eq!(outcome.before.report.issues[0].kind, ConflictKind::DuplicateEnforcement);
    assert!(!session.handle().is_running());
    assert_eq!(outcome.after.report.mode, SessionMode::Standalone);
    assert_eq!(dir.persistence().read_pid().unwrap(), PidMarker::Pid(4242));
    session.stop().await;
}
