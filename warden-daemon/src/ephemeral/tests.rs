use super::*;
use tempfile::TempDir;

fn matcher(dir: &Path) -> EphemeralMatcher {
    let settings = Settings::for_target(dir.join("config.json"));
    EphemeralMatcher::new(&settings.target_file, &settings).unwrap()
}

#[test]
fn classifies_primary_and_suffixes() {
    let m = matcher(Path::new("/data"));
    assert_eq!(m.classify(Path::new("/data/config.json")), PathRole::Primary);
    assert_eq!(m.classify(Path::new("/data/config.json.tmp")), PathRole::InProgress);
    assert_eq!(m.classify(Path::new("/data/config.json.vsctmp")), PathRole::InProgress);
    assert_eq!(m.classify(Path::new("/data/config.json.bak")), PathRole::Backup);
    assert_eq!(m.classify(Path::new("/data/config.json.backup")), PathRole::Backup);
    assert_eq!(m.classify(Path::new("/data/config.json.old")), PathRole::Backup);
}

#[test]
fn backup_suffix_with_qualifier_is_backup() {
    let m = matcher(Path::new("/data"));
    assert_eq!(m.classify(Path::new("/data/config.json.bak.1")), PathRole::Backup);
    assert_eq!(m.classify(Path::new("/data/config.json.backup-20240101")), PathRole::Backup);
}

#[test]
fn other_siblings_are_unrelated() {
    let m = matcher(Path::new("/data"));
    assert_eq!(m.classify(Path::new("/data/state.db.bak")), PathRole::Unrelated);
    assert_eq!(m.classify(Path::new("/data/config.jsonx")), PathRole::Unrelated);
    assert_eq!(m.classify(Path::new("/data/.config.json.warden-42")), PathRole::Unrelated);
    assert_eq!(m.classify(Path::new("/elsewhere/config.json.bak")), PathRole::Unrelated);
    assert_eq!(m.classify(Path::new("/data/sub/config.json")), PathRole::Unrelated);
}

#[test]
fn glob_metacharacters_in_file_name_are_literal() {
    let settings = Settings::for_target("/data/conf[1].json");
    let m = EphemeralMatcher::new(&settings.target_file, &settings).unwrap();
    assert_eq!(m.classify(Path::new("/data/conf[1].json.bak")), PathRole::Backup);
    assert_eq!(m.classify(Path::new("/data/conf1.json.bak")), PathRole::Unrelated);
}

#[test]
fn scan_lists_backups_before_in_progress() {
    let dir = TempDir::new().unwrap();
    for name in ["config.json", "config.json.tmp", "config.json.bak", "notes.txt", "config.json.old"] {
        std::fs::write(dir.path().join(name), "{}").unwrap();
    }
    let found = matcher(dir.path()).scan().unwrap();
    let roles: Vec<_> = found.iter().map(|(_, role)| *role).collect();
    assert_eq!(roles, vec![PathRole::Backup, PathRole::Backup, PathRole::InProgress]);
}

#[test]
fn scan_of_missing_directory_is_empty() {
    let dir = TempDir::new().unwrap();
    assert!(matcher(&dir.path().join("absent")).scan().unwrap().is_empty());
}
