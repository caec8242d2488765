//! End-to-end deploy and rollback tests against the in-memory backend

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use promotion_common::{
    tags, Environment, Error, FleetGroup, Image, ImageState, LaunchTemplate,
};
use promotion_controller::{
    rollout::{FleetRefresh, TemplatePromotion},
    selection::CurrentSource,
    AuditLog, Controller, ControllerSettings, DeployOutcome, MemoryBackend, RollbackOutcome,
    ScriptedConsole,
};
use std::sync::Arc;
use std::time::Duration;

const MUTATING_CALLS: [&str; 6] = [
    "set_tags",
    "create_version",
    "set_default_version",
    "start_instance_refresh",
    "set_pointer",
    "acquire_lease",
];

fn image(id: &str, env: &str, state: ImageState, minutes: i64) -> Image {
    let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + ChronoDuration::minutes(minutes);
    Image::new(id, state, created).with_tag(tags::ENVIRONMENT, env)
}

/// Backend with a template and fleet for every environment
async fn infrastructure() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    for env in Environment::ALL {
        backend
            .insert_template(
                LaunchTemplate::new(format!("lt-{}", env), format!("web-{}", env))
                    .with_tag(tags::ENVIRONMENT, env.as_str()),
            )
            .await;
        backend
            .insert_fleet(
                FleetGroup::new(format!("asg-{}", env), format!("web-{}", env), 4)
                    .with_tag(tags::ENVIRONMENT, env.as_str()),
            )
            .await;
    }
    backend
}

fn controller(backend: &Arc<MemoryBackend>, audit_dir: &tempfile::TempDir) -> Controller {
    controller_with(backend, audit_dir, ControllerSettings {
        operator: "ops-oncall".to_string(),
        ..ControllerSettings::default()
    })
}

fn controller_with(
    backend: &Arc<MemoryBackend>,
    audit_dir: &tempfile::TempDir,
    settings: ControllerSettings,
) -> Controller {
    Controller::new(backend.clone(), AuditLog::new(audit_dir.path()), settings)
}

async fn mutations(backend: &MemoryBackend) -> Vec<String> {
    backend
        .calls()
        .await
        .into_iter()
        .filter(|call| MUTATING_CALLS.iter().any(|m| call.starts_with(m)))
        .collect()
}

#[tokio::test]
async fn test_staging_rollback_scenario() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("img-1", "staging", ImageState::Available, 0))
        .await;
    backend
        .insert_image(
            image("img-2", "staging", ImageState::Available, 60).with_tag(tags::PRODUCTION, "true"),
        )
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::new(["elevated 5xx after deploy\n", "yes\n"]);
    let outcome = controller
        .rollback(Environment::Staging, None, None, &mut console)
        .await
        .unwrap();

    let RollbackOutcome::RolledBack(report) = outcome else {
        panic!("expected the rollback to proceed");
    };
    assert_eq!(report.from_image_id, "img-2");
    assert_eq!(report.to_image_id, "img-1");
    assert_eq!(
        report.template,
        TemplatePromotion::Promoted {
            template_id: "lt-staging".to_string(),
            version: 1
        }
    );
    assert!(matches!(report.refresh, FleetRefresh::Started { ref fleet_id, .. } if fleet_id == "asg-staging"));
    assert_eq!(console.questions_asked(), 2);

    let superseded = backend.image("img-2").await.unwrap();
    assert_eq!(superseded.tag(tags::STATUS), Some("Superseded"));
    assert_eq!(
        superseded.tag(tags::ROLLBACK_REASON),
        Some("elevated 5xx after deploy")
    );
    assert!(superseded.tag(tags::SUPERSEDED_DATE).is_some());
    // Left set unless configured otherwise
    assert_eq!(superseded.tag(tags::PRODUCTION), Some("true"));

    let restored = backend.image("img-1").await.unwrap();
    assert_eq!(restored.tag(tags::PRODUCTION), Some("true"));
    assert!(restored.tag(tags::ROLLED_BACK_DATE).is_some());

    let template = backend.template("lt-staging").await.unwrap();
    let version = template.default().unwrap();
    assert_eq!(version.image_id, "img-1");
    assert_eq!(version.description, "ROLLBACK: elevated 5xx after deploy");

    let refreshes = backend.refreshes().await;
    assert_eq!(refreshes.len(), 1);
    assert!(refreshes[0].preferences.checkpoint_percentages.is_empty());
    assert_eq!(refreshes[0].preferences.min_healthy_percentage, 90);

    let pointer = backend.pointer(Environment::Staging).await.unwrap();
    assert_eq!(pointer.image_id, "img-1");
    assert_eq!(pointer.previous_image_id.as_deref(), Some("img-2"));

    let records = controller.history(Environment::Staging).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].from_image_id, "img-2");
    assert_eq!(records[0].to_image_id, "img-1");
    assert_eq!(records[0].initiated_by, "ops-oncall");
    assert!(report.record_path.starts_with(audit_dir.path()));

    assert_eq!(backend.lease_holder(Environment::Staging).await, None);
}

#[tokio::test]
async fn test_production_deploy_of_failed_image() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-x", "production", ImageState::Failed, 0))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::new(["yes\n"]);
    let err = controller
        .deploy(Environment::Production, Some("ami-x"), &mut console)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ImageNotAvailable { ref id, .. } if id == "ami-x"));
    assert_eq!(console.questions_asked(), 0);

    let calls = backend.calls().await;
    assert!(!calls
        .iter()
        .any(|c| c.contains("template") || c.contains("version") || c.contains("fleet") || c.contains("refresh")));
    assert!(mutations(&backend).await.is_empty());
}

#[tokio::test]
async fn test_declined_confirmation_modifies_nothing() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-1", "production", ImageState::Available, 0).with_tag(tags::PRODUCTION, "true"))
        .await;
    backend
        .insert_image(image("ami-2", "production", ImageState::Available, 30))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::new(["YES\n"]);
    let outcome = controller
        .deploy(Environment::Production, None, &mut console)
        .await
        .unwrap();
    assert!(matches!(outcome, DeployOutcome::Declined));

    let mut console = ScriptedConsole::new(["y\n"]);
    let outcome = controller
        .rollback(Environment::Production, Some("ami-2"), Some("bad build"), &mut console)
        .await
        .unwrap();
    assert!(matches!(outcome, RollbackOutcome::Declined));

    assert!(mutations(&backend).await.is_empty());
    assert!(backend.image("ami-1").await.unwrap().tag(tags::STATUS).is_none());
    assert!(backend.template("lt-production").await.unwrap().versions.is_empty());
    assert!(controller.history(Environment::Production).unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_reason_aborts_before_mutation() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("img-1", "staging", ImageState::Available, 0))
        .await;
    backend
        .insert_image(image("img-2", "staging", ImageState::Available, 60).with_tag(tags::PRODUCTION, "true"))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    // Supplied on the command line
    let mut console = ScriptedConsole::new(["yes\n"]);
    let err = controller
        .rollback(Environment::Staging, None, Some("   "), &mut console)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyReason));
    assert_eq!(console.questions_asked(), 0);

    // Answered at the prompt
    let mut console = ScriptedConsole::new(["\n", "yes\n"]);
    let err = controller
        .rollback(Environment::Staging, None, None, &mut console)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyReason));
    assert_eq!(console.questions_asked(), 1);

    assert!(mutations(&backend).await.is_empty());
    assert!(backend.image("img-2").await.unwrap().tag(tags::STATUS).is_none());
    assert!(controller.history(Environment::Staging).unwrap().is_empty());
}

#[tokio::test]
async fn test_rollback_to_current_is_rejected() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("img-1", "dev", ImageState::Available, 0).with_tag(tags::PRODUCTION, "true"))
        .await;
    backend
        .insert_image(image("img-2", "dev", ImageState::Available, 10))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::new(["reason\n", "yes\n"]);
    let err = controller
        .rollback(Environment::Dev, None, None, &mut console)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRollbackTarget(_)));
    assert!(mutations(&backend).await.is_empty());
}

#[tokio::test]
async fn test_concurrent_promotion_is_refused() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-1", "staging", ImageState::Available, 0))
        .await;
    backend
        .hold_lease(Environment::Staging, "other-operator", Duration::from_secs(60))
        .await
        .unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::default();
    let err = controller
        .deploy(Environment::Staging, None, &mut console)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::PromotionInProgress { environment: Environment::Staging, ref holder } if holder == "other-operator"
    ));

    assert_eq!(mutations(&backend).await, vec!["acquire_lease staging".to_string()]);
    assert_eq!(
        backend.lease_holder(Environment::Staging).await.as_deref(),
        Some("other-operator")
    );
}

#[tokio::test]
async fn test_out_of_range_lease_ttl_fails_before_mutation() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-1", "dev", ImageState::Available, 0))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller_with(
        &backend,
        &audit_dir,
        ControllerSettings {
            lease_ttl: Duration::from_secs(u64::MAX),
            ..ControllerSettings::default()
        },
    );

    let mut console = ScriptedConsole::default();
    let err = controller
        .deploy(Environment::Dev, None, &mut console)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert_eq!(mutations(&backend).await, vec!["acquire_lease dev".to_string()]);
    assert!(backend.pointer(Environment::Dev).await.is_none());
}

#[tokio::test]
async fn test_dev_deploy_needs_no_confirmation() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-old", "dev", ImageState::Available, 0))
        .await;
    backend
        .insert_image(image("ami-new", "dev", ImageState::Available, 5))
        .await;
    backend
        .insert_image(image("ami-pending", "dev", ImageState::Pending, 10))
        .await;
    backend
        .insert_image(image("ami-stg", "staging", ImageState::Available, 20))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::default();
    let outcome = controller
        .deploy(Environment::Dev, None, &mut console)
        .await
        .unwrap();
    assert_eq!(console.questions_asked(), 0);

    let DeployOutcome::Deployed(report) = outcome else {
        panic!("dev deploys are never gated");
    };
    assert_eq!(report.image_id, "ami-new");

    let deployed = backend.image("ami-new").await.unwrap();
    assert_eq!(deployed.tag(tags::DEPLOYED_TO), Some("dev"));
    assert!(deployed.tag(tags::LAST_DEPLOYED).is_some());

    let version = backend.template("lt-dev").await.unwrap().default().cloned().unwrap();
    assert_eq!(version.image_id, "ami-new");
    assert!(version.description.starts_with("Deployed AMI ami-new on "));

    let refreshes = backend.refreshes().await;
    assert_eq!(refreshes[0].preferences.checkpoint_percentages, vec![50, 100]);
    assert_eq!(refreshes[0].preferences.checkpoint_delay_secs, Some(300));

    assert_eq!(
        backend.pointer(Environment::Dev).await.unwrap().image_id,
        "ami-new"
    );
    // Deploys leave no rollback record
    assert!(controller.history(Environment::Dev).unwrap().is_empty());
}

#[tokio::test]
async fn test_production_deploy_then_rollback_follows_pointer() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-a", "production", ImageState::Available, 0).with_tag(tags::PRODUCTION, "true"))
        .await;
    backend
        .insert_image(image("ami-b", "production", ImageState::Available, 30))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::new(["yes\n"]);
    let outcome = controller
        .deploy(Environment::Production, Some("ami-b"), &mut console)
        .await
        .unwrap();
    assert!(matches!(outcome, DeployOutcome::Deployed(_)));
    assert_eq!(console.questions_asked(), 1);

    let status = controller.status(Environment::Production, None).await.unwrap();
    let (current, source) = status.current.unwrap();
    assert_eq!(current.id, "ami-b");
    assert_eq!(source, CurrentSource::Pointer);

    let mut console = ScriptedConsole::new(["yes\n"]);
    let outcome = controller
        .rollback(Environment::Production, None, Some("latency regression"), &mut console)
        .await
        .unwrap();
    let RollbackOutcome::RolledBack(report) = outcome else {
        panic!("expected the rollback to proceed");
    };
    assert_eq!(report.from_image_id, "ami-b");
    assert_eq!(report.to_image_id, "ami-a");

    let template = backend.template("lt-production").await.unwrap();
    assert_eq!(template.versions.len(), 2);
    assert_eq!(template.default_version, Some(2));
}

#[tokio::test]
async fn test_clear_stale_production_flag() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("img-1", "staging", ImageState::Available, 0))
        .await;
    backend
        .insert_image(image("img-2", "staging", ImageState::Available, 60).with_tag(tags::PRODUCTION, "true"))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller_with(
        &backend,
        &audit_dir,
        ControllerSettings {
            clear_stale_production_flag: true,
            ..ControllerSettings::default()
        },
    );

    let mut console = ScriptedConsole::new(["yes\n"]);
    controller
        .rollback(Environment::Staging, Some("img-1"), Some("canary failed"), &mut console)
        .await
        .unwrap();

    assert_eq!(
        backend.image("img-2").await.unwrap().tag(tags::PRODUCTION),
        Some("false")
    );
    assert_eq!(
        backend.image("img-1").await.unwrap().tag(tags::PRODUCTION),
        Some("true")
    );
}

#[tokio::test]
async fn test_missing_infrastructure_is_skipped() {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .insert_image(image("ami-1", "staging", ImageState::Available, 0))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let mut console = ScriptedConsole::default();
    let DeployOutcome::Deployed(report) = controller
        .deploy(Environment::Staging, None, &mut console)
        .await
        .unwrap()
    else {
        panic!("staging deploys are never gated");
    };

    assert_eq!(report.template, TemplatePromotion::NoTemplate);
    assert_eq!(report.refresh, FleetRefresh::NoFleet);
    // Tags and pointer are still written
    assert_eq!(
        backend.image("ami-1").await.unwrap().tag(tags::DEPLOYED_TO),
        Some("staging")
    );
    assert!(backend.pointer(Environment::Staging).await.is_some());
}

#[tokio::test]
async fn test_status_reports_refresh() {
    let backend = infrastructure().await;
    backend
        .insert_image(image("ami-1", "dev", ImageState::Available, 0))
        .await;
    let audit_dir = tempfile::tempdir().unwrap();
    let controller = controller(&backend, &audit_dir);

    let status = controller.status(Environment::Dev, None).await.unwrap();
    assert!(status.pointer.is_none());
    assert!(status.current.is_none());
    assert_eq!(status.latest_available.unwrap().id, "ami-1");

    let mut console = ScriptedConsole::default();
    let DeployOutcome::Deployed(report) = controller
        .deploy(Environment::Dev, None, &mut console)
        .await
        .unwrap()
    else {
        panic!("dev deploys are never gated");
    };
    let FleetRefresh::Started { refresh_id, .. } = report.refresh else {
        panic!("expected a refresh");
    };

    let status = controller
        .status(Environment::Dev, Some(&refresh_id))
        .await
        .unwrap();
    assert_eq!(status.refresh.unwrap().id, refresh_id);
    let pointer = status.pointer.unwrap();
    assert_eq!(pointer.image_id, "ami-1");
    assert_eq!(pointer.previous_image_id, None);
    assert_eq!(pointer.updated_by, "ops-oncall");
}
