//! Restart recovery from the session store.

use std::sync::Arc;

use convoy::db::Database;
use convoy::driver::ChallengeKind;
use convoy::orchestrator::SessionOrchestrator;
use convoy::registry::{
    CreateSessionOptions, SessionMetadata, SessionRegistry, SessionRepository, SessionStatus,
};

mod common;
use common::{FakeControl, fast_settings, orchestrator_on, wait_for_session, wait_for_status};

fn persistent(
    dir: &tempfile::TempDir,
    control: Arc<FakeControl>,
    repository: &SessionRepository,
) -> SessionOrchestrator {
    let registry = Arc::new(SessionRegistry::with_store(repository.clone()));
    orchestrator_on(dir, control, registry, fast_settings()).with_repository(repository.clone())
}

#[tokio::test]
async fn restore_recovers_live_sessions_and_discards_failed_ones() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::in_memory().await.unwrap();
    let repository = SessionRepository::new(db.pool().clone());

    let before = Arc::new(FakeControl::default());
    let first = persistent(&dir, before.clone(), &repository);
    let session = first
        .create_session("u1", CreateSessionOptions::qr())
        .await
        .unwrap();
    before.authenticate();
    wait_for_status(&first, &session.session_id, SessionStatus::Ready).await;
    first.shutdown().await;

    let mut failed = SessionMetadata::new(
        "failed-session".to_string(),
        "u9".to_string(),
        CreateSessionOptions::qr(),
    );
    failed.status = SessionStatus::Failed;
    failed.error_message = Some("driver lost".to_string());
    repository.upsert(&failed).await.unwrap();

    // Credentials survive in the tenant's data directory.
    let after = Arc::new(FakeControl::default());
    after.persist_credentials();
    let second = persistent(&dir, after.clone(), &repository);

    let report = second.restore().await.unwrap();
    assert_eq!(report.slots.recovered, vec!["u1".to_string()]);
    assert_eq!(report.recovered, vec![session.session_id.clone()]);
    assert_eq!(report.discarded, vec!["failed-session".to_string()]);
    assert!(report.failed.is_empty());

    let restored = wait_for_status(&second, &session.session_id, SessionStatus::Ready).await;
    assert_eq!(restored.user_id, "u1");
    assert_eq!(after.created(), 1);
    assert!(repository.get("failed-session").await.unwrap().is_none());

    let slot = second.allocator().get("u1").await.unwrap();
    assert!(slot.bound_sessions.contains(&session.session_id));
}

#[tokio::test]
async fn restore_without_credentials_issues_a_new_challenge() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::in_memory().await.unwrap();
    let repository = SessionRepository::new(db.pool().clone());

    let first = persistent(&dir, Arc::new(FakeControl::default()), &repository);
    let session = first
        .create_session("u1", CreateSessionOptions::qr())
        .await
        .unwrap();
    assert!(session.auth_data.is_some());
    first.shutdown().await;

    let after = Arc::new(FakeControl::default());
    let second = persistent(&dir, after.clone(), &repository);
    let report = second.restore().await.unwrap();
    assert_eq!(report.recovered, vec![session.session_id.clone()]);

    let awaiting = wait_for_session(
        &second,
        &session.session_id,
        std::time::Duration::from_secs(5),
        |s| s.is_some_and(|s| s.status == SessionStatus::AwaitingAuth && s.auth_data.is_some()),
    )
    .await
    .unwrap();
    assert_eq!(awaiting.auth_data.unwrap().kind, ChallengeKind::Qr);

    after.authenticate();
    wait_for_status(&second, &session.session_id, SessionStatus::Ready).await;
}

#[tokio::test]
async fn restore_without_store_only_reconciles_slots() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(FakeControl::default());
    let first = orchestrator_on(
        &dir,
        control.clone(),
        Arc::new(SessionRegistry::new()),
        fast_settings(),
    );
    first
        .create_session("u1", CreateSessionOptions::qr())
        .await
        .unwrap();
    first.shutdown().await;

    let second = orchestrator_on(
        &dir,
        control,
        Arc::new(SessionRegistry::new()),
        fast_settings(),
    );
    let report = second.restore().await.unwrap();
    assert_eq!(report.slots.recovered, vec!["u1".to_string()]);
    assert!(report.recovered.is_empty());
    assert!(second.list_sessions().is_empty());
}
