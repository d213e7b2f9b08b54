use super::*;
use crate::identity::IdentityField;
use tempfile::TempDir;

fn persistence(dir: &TempDir) -> SessionPersistence {
    SessionPersistence::new(WardenPaths::new(dir.path()))
}

fn target() -> TargetIdentity {
    TargetIdentity::new([(IdentityField::PrimaryId, "7c9e6679-7425-40de-944b-e07fc1f90ae7")]).unwrap()
}

#[test]
fn pid_marker_round_trip() {
    let dir = TempDir::new().unwrap();
    let p = persistence(&dir);
    assert_eq!(p.read_pid().unwrap(), PidMarker::Absent);

    p.write_pid(4242).unwrap();
    assert_eq!(p.read_pid().unwrap(), PidMarker::Pid(4242));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(p.paths().pid_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn garbage_pid_marker_is_unreadable() {
    let dir = TempDir::new().unwrap();
    let p = persistence(&dir);
    std::fs::write(p.paths().pid_file(), "not-a-pid").unwrap();
    assert_eq!(p.read_pid().unwrap(), PidMarker::Unreadable);
    assert!(p.read_pid().unwrap().is_present());
}

#[test]
fn remove_pid_if_only_removes_the_expected_marker() {
    let dir = TempDir::new().unwrap();
    let p = persistence(&dir);
    p.write_pid(100).unwrap();

    assert!(!p.remove_pid_if(PidMarker::Pid(200)).unwrap());
    assert_eq!(p.read_pid().unwrap(), PidMarker::Pid(100));

    assert!(p.remove_pid_if(PidMarker::Pid(100)).unwrap());
    assert_eq!(p.read_pid().unwrap(), PidMarker::Absent);
    assert!(!p.remove_pid_if(PidMarker::Pid(100)).unwrap());
}

#[test]
fn session_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let p = persistence(&dir);
    assert!(p.load_session().unwrap().is_none());

    let config = SessionConfig::new(target(), Some(dir.path().join("config.json")));
    p.save_session(&config).unwrap();
    assert_eq!(p.load_session().unwrap(), Some(config));
}

#[test]
fn corrupt_session_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    let p = persistence(&dir);
    std::fs::write(p.paths().session_config_file(), "{\"target\": ").unwrap();
    assert!(matches!(p.load_session(), Err(GuardianError::MalformedConfig { .. })));

    // well-formed JSON with an invalid identity value
    std::fs::write(
        p.paths().session_config_file(),
        r#"{"target": {"primaryId": "nope"}, "started_at": "2024-01-01T00:00:00Z"}"#,
    )
    .unwrap();
    assert!(matches!(p.load_session(), Err(GuardianError::MalformedConfig { .. })));
}

#[test]
fn action_log_appends_and_tails() {
    let dir = TempDir::new().unwrap();
    let log = persistence(&dir).action_log();
    assert!(log.tail(5).is_empty());

    for i in 0..30 {
        log.append(&format!("action {}", i)).unwrap();
    }
    let tail = log.tail(20);
    assert_eq!(tail.len(), 20);
    assert!(tail[0].ends_with("] action 10"));
    assert!(tail[19].ends_with("] action 29"));
    assert!(tail[19].starts_with('['));
}
