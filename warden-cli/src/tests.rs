use super::*;
use clap::CommandFactory;
use tempfile::TempDir;
use warden_daemon::identity::IdentityField;
use warden_daemon::status::ConflictKind;

const PRIMARY: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parses_standalone_start_with_fields() {
    let cli = Cli::try_parse_from([
        "warden",
        "start",
        "--field",
        &format!("primaryId={}", PRIMARY),
    ])
    .unwrap();
    match cli.command {
        Commands::Start {
            standalone,
            in_process,
            target,
        } => {
            assert!(!standalone && !in_process);
            assert_eq!(target.fields.len(), 1);
            assert!(!target.is_empty());
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn target_sources_are_exclusive() {
    assert!(Cli::try_parse_from(["warden", "start", "--generate", "--identity", "id.json"]).is_err());
    assert!(Cli::try_parse_from(["warden", "start", "--standalone", "--in-process"]).is_err());
    assert!(Cli::try_parse_from(["warden", "start", "--in-process", "--generate"]).is_ok());
}

#[test]
fn resolve_target_from_each_source() {
    let generated = target::resolve_target(&TargetArgs {
        generate: true,
        ..TargetArgs::default()
    })
    .unwrap()
    .unwrap();
    assert_eq!(generated.len(), IdentityField::ALL.len());

    let from_fields = target::resolve_target(&TargetArgs {
        fields: vec![format!("primaryid={}", PRIMARY)],
        ..TargetArgs::default()
    })
    .unwrap()
    .unwrap();
    assert_eq!(from_fields.get(IdentityField::PrimaryId), Some(PRIMARY));

    assert!(target::resolve_target(&TargetArgs::default()).unwrap().is_none());
}

#[test]
fn identity_file_is_validated() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.json");
    std::fs::write(&good, format!(r#"{{"primaryId": "{}"}}"#, PRIMARY)).unwrap();
    assert_eq!(
        target::read_identity_file(&good).unwrap().get(IdentityField::PrimaryId),
        Some(PRIMARY)
    );

    let bad = dir.path().join("bad.json");
    std::fs::write(&bad, r#"{"primaryId": "not-a-uuid"}"#).unwrap();
    assert!(matches!(
        target::read_identity_file(&bad),
        Err(CliError::IdentityFile { .. })
    ));

    assert!(matches!(
        target::read_identity_file(&dir.path().join("missing.json")),
        Err(CliError::IdentityFile { .. })
    ));
}

#[test]
fn generate_selected_fields() {
    let identity = target::generate(&["sessionId".to_string(), "variantId".to_string()]).unwrap();
    let fields: Vec<_> = identity.field_names().collect();
    assert_eq!(fields, vec![IdentityField::SessionId, IdentityField::VariantId]);

    assert!(matches!(
        target::generate(&["serial".to_string()]),
        Err(CliError::Guardian(_))
    ));
}

#[test]
fn target_is_shortened_for_display() {
    let identity = TargetIdentity::new([(IdentityField::PrimaryId, PRIMARY)]).unwrap();
    assert_eq!(format_target(&identity), "primaryId=7c9e6679…");
}

#[test]
fn uptime_formatting() {
    let now = Utc::now();
    assert_eq!(format_uptime(now), "0s");
    assert_eq!(format_uptime(now - chrono::Duration::seconds(125)), "2m 5s");
    assert_eq!(format_uptime(now - chrono::Duration::seconds(3 * 3600 + 60)), "3h 1m");
    assert_eq!(format_uptime(now - chrono::Duration::seconds(2 * 86400 + 3600)), "2d 1h");
}

fn report(mode: SessionMode, issues: Vec<ConflictKind>, warnings: Vec<ConflictKind>) -> ReconciliationReport {
    let findings = |kinds: Vec<ConflictKind>| {
        kinds
            .into_iter()
            .map(|kind| Finding {
                kind,
                detail: kind.to_string(),
            })
            .collect::<Vec<_>>()
    };
    ReconciliationReport {
        mode,
        consistent: issues.is_empty(),
        issues: findings(issues),
        warnings: findings(warnings),
        score: 100,
    }
}

#[test]
fn summary_tone_ranks_issues_over_warnings() {
    assert_eq!(
        summary_tone(&report(SessionMode::Standalone, vec![], vec![])),
        Tone::Healthy
    );
    assert_eq!(summary_tone(&report(SessionMode::None, vec![], vec![])), Tone::Idle);
    // a consistent report with warnings still stands out
    assert_eq!(
        summary_tone(&report(SessionMode::InProcess, vec![], vec![ConflictKind::TargetMismatch])),
        Tone::Warning
    );
    assert_eq!(
        summary_tone(&report(
            SessionMode::None,
            vec![ConflictKind::StalePidMarker],
            vec![ConflictKind::OrphanedProcess]
        )),
        Tone::Problem
    );
}

#[test]
fn missing_daemon_binary_is_a_spawn_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join(DAEMON_BINARY);
    match start_daemon_detached(&missing, None) {
        Err(CliError::DaemonSpawn { path, .. }) => assert_eq!(path, missing),
        other => panic!("unexpected result {:?}", other),
    }
}
