//! Live sessions against a watched directory:
//! - a burst of external writes costs one corrective write
//! - backups created while running disappear
//! - standalone marker files across stop and resume

use serde_json::json;
use std::process::Command;
use std::time::Duration;
use warden_daemon::errors::GuardianError;
use warden_daemon::identity::IdentityField;
use warden_daemon::persistence::PidMarker;
use warden_daemon::session::{GuardianSession, RunMode, SessionState};
use warden_tests::helpers::fixture::{GuardedDir, primary_identity};
use warden_tests::{PRIMARY_A, PRIMARY_B, wait_for, wait_for_field};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn write_burst_is_corrected_once() {
    let dir = GuardedDir::new().with_settings(|s| s.debounce = Duration::from_millis(200));
    dir.write_config(&json!({"primaryId": PRIMARY_B}));

    let mut session = GuardianSession::start(primary_identity(PRIMARY_A), RunMode::InProcess, &dir.settings, &dir.paths)
        .await
        .unwrap();
    assert_eq!(session.get_stats().corrective_writes, 1);

    for i in 0..5 {
        dir.write_config(&json!({"primaryId": PRIMARY_B, "revision": i}));
    }
    wait_for_field(&dir, "primaryId", PRIMARY_A, TIMEOUT).await.unwrap();
    // let the echo of our own write pass through the loop
    tokio::time::sleep(Duration::from_millis(600)).await;

    let stats = session.get_stats();
    assert_eq!(stats.corrective_writes, 2);
    assert!(stats.events_seen >= 1);
    assert_eq!(dir.read_config().unwrap()["revision"], 4);
    session.stop().await;
}

#[tokio::test]
async fn backup_written_while_running_is_removed() {
    let dir = GuardedDir::new();
    dir.write_config(&json!({"primaryId": PRIMARY_A}));
    let mut session = GuardianSession::start(primary_identity(PRIMARY_A), RunMode::InProcess, &dir.settings, &dir.paths)
        .await
        .unwrap();

    let backup = dir.sibling(".bak");
    std::fs::write(&backup, json!({"primaryId": PRIMARY_B}).to_string()).unwrap();
    wait_for(|| !backup.exists(), TIMEOUT).await.unwrap();

    assert_eq!(session.get_stats().backups_removed, 1);
    assert_eq!(dir.field("primaryId").as_deref(), Some(PRIMARY_A));
    session.stop().await;
}

#[tokio::test]
async fn standalone_session_persists_and_resumes() {
    let dir = GuardedDir::new();
    let persistence = dir.persistence();

    let mut session = GuardianSession::start(primary_identity(PRIMARY_A), RunMode::Standalone, &dir.settings, &dir.paths)
        .await
        .unwrap();
    assert_eq!(persistence.read_pid().unwrap(), PidMarker::Pid(std::process::id()));
    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(persistence.read_pid().unwrap(), PidMarker::Absent);

    let resumed = persistence.load_session().unwrap().unwrap();
    assert_eq!(resumed.target.get(IdentityField::PrimaryId), Some(PRIMARY_A));
    assert_eq!(resumed.target_file.as_deref(), Some(dir.config_path()));

    dir.write_config(&json!({"primaryId": PRIMARY_B}));
    let mut session = GuardianSession::start(resumed.target, RunMode::Standalone, &dir.settings, &dir.paths)
        .await
        .unwrap();
    assert_eq!(dir.field("primaryId").as_deref(), Some(PRIMARY_A));
    session.stop().await;

    let log = persistence.action_log().tail(20);
    assert_eq!(log.iter().filter(|line| line.contains("standalone session started")).count(), 2);
    assert!(log.last().unwrap().ends_with("standalone session stopped"));
}

#[cfg(unix)]
#[tokio::test]
async fn live_standalone_marker_blocks_a_second_service() {
    // stand in for a running service by naming the service after `sleep`
    let dir = GuardedDir::new().with_settings(|s| s.process_name = "sleep".to_string());
    let mut service = Command::new("sleep").arg("30").spawn().unwrap();
    dir.persistence().write_pid(service.id()).unwrap();

    let err = GuardianSession::start(primary_identity(PRIMARY_A), RunMode::Standalone, &dir.settings, &dir.paths)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardianError::SessionActive(RunMode::Standalone)));
    assert_eq!(dir.persistence().read_pid().unwrap(), PidMarker::Pid(service.id()));

    service.kill().unwrap();
    service.wait().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn marker_reused_by_another_program_does_not_block() {
    let dir = GuardedDir::new();
    let mut unrelated = Command::new("sleep").arg("30").spawn().unwrap();
    dir.persistence().write_pid(unrelated.id()).unwrap();

    let mut session = GuardianSession::start(primary_identity(PRIMARY_A), RunMode::Standalone, &dir.settings, &dir.paths)
        .await
        .unwrap();
    assert_eq!(dir.persistence().read_pid().unwrap(), PidMarker::Pid(std::process::id()));
    session.stop().await;

    assert!(unrelated.try_wait().unwrap().is_none());
    unrelated.kill().unwrap();
    unrelated.wait().unwrap();
}
