use super::*;
use crate::settings::Settings;
use std::path::Path;

fn matcher() -> EphemeralMatcher {
    let settings = Settings::for_target("/data/config.json");
    EphemeralMatcher::new(&settings.target_file, &settings).unwrap()
}

fn ev(path: &str, kind: ChangeKind) -> WatchEvent {
    WatchEvent::new(path, kind)
}

#[test]
fn repeated_events_for_one_path_coalesce() {
    let m = matcher();
    let mut c = EventCoalescer::new(&m);
    for _ in 0..10 {
        c.push(ev("/data/config.json", ChangeKind::Modified));
    }
    let batch = c.finish();
    assert_eq!(batch.raw_events, 10);
    assert_eq!(
        batch.changes,
        vec![Change {
            path: PathBuf::from("/data/config.json"),
            role: PathRole::Primary,
            kind: ChangeKind::Modified,
        }]
    );
}

#[test]
fn unrelated_paths_are_dropped() {
    let m = matcher();
    let mut c = EventCoalescer::new(&m);
    c.push(ev("/data/notes.txt", ChangeKind::Created));
    assert!(c.is_empty());
    assert_eq!(c.finish().raw_events, 0);
}

#[test]
fn ephemeral_changes_are_ordered_before_primary() {
    let m = matcher();
    let mut c = EventCoalescer::new(&m);
    c.push(ev("/data/config.json", ChangeKind::Modified));
    c.push(ev("/data/config.json.tmp", ChangeKind::Created));
    c.push(ev("/data/config.json.bak", ChangeKind::Created));

    let batch = c.finish();
    let roles: Vec<_> = batch.changes.iter().map(|c| c.role).collect();
    assert_eq!(roles, vec![PathRole::Backup, PathRole::InProgress, PathRole::Primary]);
    assert!(batch.touches_primary());
}

#[test]
fn kind_merging_rules() {
    assert_eq!(merge_kind(ChangeKind::Created, ChangeKind::Modified), ChangeKind::Created);
    assert_eq!(merge_kind(ChangeKind::Created, ChangeKind::Deleted), ChangeKind::Deleted);
    assert_eq!(merge_kind(ChangeKind::Deleted, ChangeKind::Created), ChangeKind::Modified);
    assert_eq!(merge_kind(ChangeKind::Modified, ChangeKind::Modified), ChangeKind::Modified);
}

#[tokio::test(start_paused = true)]
async fn collect_window_merges_events_inside_the_window() {
    let m = matcher();
    let (tx, mut rx) = mpsc::channel(16);

    tokio::spawn(async move {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(ev("/data/config.json", ChangeKind::Modified)).await.unwrap();
        }
        // lands after the 150ms window
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(ev("/data/config.json.bak", ChangeKind::Created)).await.unwrap();
    });

    let batch = collect_window(
        &m,
        ev("/data/config.json", ChangeKind::Modified),
        &mut rx,
        Duration::from_millis(150),
    )
    .await;
    assert_eq!(batch.raw_events, 6);
    assert_eq!(batch.changes.len(), 1);

    let late = rx.recv().await.unwrap();
    assert_eq!(late.path, Path::new("/data/config.json.bak"));
}
