use super::*;
use serde_json::{Value, json};
use tempfile::TempDir;

const PRIMARY_OLD: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";
const PRIMARY_NEW: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
const SECONDARY_NEW: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn target() -> TargetIdentity {
    TargetIdentity::new([
        (IdentityField::PrimaryId, PRIMARY_NEW),
        (IdentityField::SecondaryId, SECONDARY_NEW),
    ])
    .unwrap()
}

fn enforcer_in(dir: &TempDir) -> IdentityEnforcer {
    let settings = Settings::for_target(dir.path().join("config.json"));
    IdentityEnforcer::new(&settings, target(), Arc::new(SessionStats::new())).unwrap()
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn reconcile_converges_and_preserves_foreign_keys() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);
    let primary = enforcer.store().path().to_path_buf();
    std::fs::write(
        &primary,
        json!({"primaryId": PRIMARY_OLD, "other.setting": "keep-me"}).to_string(),
    )
    .unwrap();

    let action = enforcer.reconcile_config().unwrap();
    assert_eq!(
        action,
        Some(EnforcementAction::Corrected {
            path: primary.clone(),
            fields: vec![IdentityField::PrimaryId, IdentityField::SecondaryId],
        })
    );
    assert_eq!(
        read_json(&primary),
        json!({"primaryId": PRIMARY_NEW, "other.setting": "keep-me", "secondaryId": SECONDARY_NEW})
    );
    assert!(enforcer.is_protected());
}

#[test]
fn second_reconcile_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);

    assert!(enforcer.reconcile_config().unwrap().is_some());
    let before = std::fs::metadata(enforcer.store().path()).unwrap().modified().unwrap();
    assert!(enforcer.reconcile_config().unwrap().is_none());
    let after = std::fs::metadata(enforcer.store().path()).unwrap().modified().unwrap();

    assert_eq!(before, after);
    assert_eq!(enforcer.stats().snapshot(true).corrective_writes, 1);
}

#[test]
fn backups_are_deleted_whatever_they_contain() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);

    let stale = dir.path().join("config.json.bak");
    let matching = dir.path().join("config.json.backup-20240101");
    std::fs::write(&stale, json!({"primaryId": PRIMARY_OLD}).to_string()).unwrap();
    std::fs::write(&matching, json!({"primaryId": PRIMARY_NEW}).to_string()).unwrap();

    for path in [&stale, &matching] {
        let action = enforcer.intercept_ephemeral(path, PathRole::Backup).unwrap();
        assert!(matches!(action, Some(EnforcementAction::Removed { .. })));
        assert!(!path.exists());
    }
    // already gone
    assert!(enforcer.intercept_ephemeral(&stale, PathRole::Backup).unwrap().is_none());

    let stats = enforcer.stats().snapshot(false);
    assert_eq!(stats.backups_removed, 2);
    assert_eq!(stats.interceptions, 2);
}

#[test]
fn stale_in_progress_file_is_rewritten_in_place() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);
    let tmp = dir.path().join("config.json.tmp");
    std::fs::write(&tmp, json!({"primaryId": PRIMARY_OLD, "window": 3}).to_string()).unwrap();

    let action = enforcer.intercept_ephemeral(&tmp, PathRole::InProgress).unwrap();
    assert!(matches!(action, Some(EnforcementAction::Rewrote { .. })));
    assert_eq!(
        read_json(&tmp),
        json!({"primaryId": PRIMARY_NEW, "window": 3, "secondaryId": SECONDARY_NEW})
    );
    // the primary file is not touched by an interception
    assert!(!enforcer.store().path().exists());
}

#[test]
fn in_progress_file_without_stale_values_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);
    let tmp = dir.path().join("config.json.tmp");
    let original = json!({"primaryId": PRIMARY_NEW, "window": 3}).to_string();
    std::fs::write(&tmp, &original).unwrap();

    assert!(enforcer.intercept_ephemeral(&tmp, PathRole::InProgress).unwrap().is_none());
    assert_eq!(std::fs::read_to_string(&tmp).unwrap(), original);
}

#[test]
fn dispatch_handles_ephemeral_files_before_primary() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);
    let primary = enforcer.store().path().to_path_buf();
    let backup = dir.path().join("config.json.bak");
    std::fs::write(&primary, json!({"primaryId": PRIMARY_OLD}).to_string()).unwrap();
    std::fs::write(&backup, json!({"primaryId": PRIMARY_OLD}).to_string()).unwrap();

    let batch = ChangeBatch {
        changes: vec![
            Change {
                path: backup.clone(),
                role: PathRole::Backup,
                kind: ChangeKind::Created,
            },
            Change {
                path: primary.clone(),
                role: PathRole::Primary,
                kind: ChangeKind::Modified,
            },
        ],
        raw_events: 4,
    };

    let actions = enforcer.dispatch(&batch);
    assert_eq!(actions.len(), 2);
    assert!(matches!(actions[0], EnforcementAction::Removed { role: PathRole::Backup, .. }));
    assert!(matches!(actions[1], EnforcementAction::Corrected { .. }));
    assert!(!backup.exists());
    assert_eq!(read_json(&primary)["primaryId"], PRIMARY_NEW);
    assert_eq!(enforcer.stats().snapshot(true).events_seen, 4);
}

#[test]
fn deleted_ephemeral_changes_are_ignored() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);
    let change = Change {
        path: dir.path().join("config.json.bak"),
        role: PathRole::Backup,
        kind: ChangeKind::Deleted,
    };
    assert!(enforcer.on_config_changed(&change).unwrap().is_none());
}

#[test]
fn purge_removes_every_ephemeral_leftover() {
    let dir = TempDir::new().unwrap();
    let enforcer = enforcer_in(&dir);
    for name in ["config.json.tmp", "config.json.old", "config.json.bak.2", "notes.txt"] {
        std::fs::write(dir.path().join(name), "{}").unwrap();
    }

    let actions = enforcer.purge_ephemerals().unwrap();
    assert_eq!(actions.len(), 3);
    assert!(dir.path().join("notes.txt").exists());
    assert!(!dir.path().join("config.json.tmp").exists());
    assert_eq!(enforcer.stats().snapshot(false).backups_removed, 2);
}

#[test]
fn action_lines_are_readable() {
    let action = EnforcementAction::Corrected {
        path: PathBuf::from("/data/config.json"),
        fields: vec![IdentityField::PrimaryId, IdentityField::SessionId],
    };
    assert_eq!(action.to_string(), "corrected primaryId, sessionId in /data/config.json");
}
