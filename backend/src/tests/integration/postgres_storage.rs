// Postgres storage tests. They need a disposable database:
// TEST_DATABASE_URL=postgres://... cargo test -- --ignored

use autoflow_shared::{AutomationRun, Platform, RunStatus};
use chrono::{Duration, NaiveDate, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::automations::AutomationRegistry;
use crate::database;
use crate::error::EngineError;
use crate::storage::{
    AutomationRepository, MetricDelta, MetricsStore, PgAutomationRepository, PgMetricsStore, PgRunQueue, RunQueue,
};
use crate::tests::fakes::ManualClock;
use crate::tests::fixtures::{actions, keyword_draft, webhook_draft};

async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("Failed to connect to test database");
    database::migrate(&pool).await.expect("Failed to run migrations");
    pool
}

fn suspended_run(automation_id: Uuid, run_at: chrono::DateTime<Utc>) -> AutomationRun {
    AutomationRun {
        id: Uuid::new_v4(),
        automation_id,
        owner_id: Uuid::new_v4(),
        contact_id: 1,
        platform: Platform::Whatsapp,
        status: RunStatus::Suspended,
        remaining_actions: actions(json!([{ "id": 2, "type": "send_message", "message": "later" }])),
        delay_served: false,
        context: json!({ "order": 1 }),
        actions_completed: 1,
        run_at,
        locked_until: None,
        error_message: None,
        started_at: run_at,
        completed_at: None,
    }
}

#[tokio::test]
#[ignore]
async fn test_registry_round_trip_keeps_creation_order() {
    let pool = test_pool().await;
    let registry = AutomationRegistry::new(
        Arc::new(PgAutomationRepository::new(pool)),
        Arc::new(ManualClock::default()),
    );
    let owner = Uuid::new_v4();

    let first = registry.create(owner, keyword_draft("first", &["a"])).await.unwrap();
    let second = registry.create(owner, keyword_draft("second", &["b"])).await.unwrap();

    let listed = registry.list_active(owner).await.unwrap();
    assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    assert_eq!(listed[0], first);
}

#[tokio::test]
#[ignore]
async fn test_duplicate_webhook_token_write_is_validation_error() {
    let pool = test_pool().await;
    let repo = Arc::new(PgAutomationRepository::new(pool));
    let registry = AutomationRegistry::new(repo.clone(), Arc::new(ManualClock::default()));
    let token = format!("hook-{}", Uuid::new_v4());

    let first = registry.create(Uuid::new_v4(), webhook_draft("first", &token, "hi")).await.unwrap();

    // Same token written straight to the table, as a racing request would.
    let mut second = first.clone();
    second.id = Uuid::new_v4();
    second.owner_id = Uuid::new_v4();
    let err = repo.insert(&second).await.unwrap_err();

    match err {
        EngineError::Validation(details) => assert!(details.contains_key("trigger_config.token")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
#[ignore]
async fn test_claimed_runs_are_leased() {
    let pool = test_pool().await;
    let queue = PgRunQueue::new(pool);
    let now = Utc::now();
    let run = suspended_run(Uuid::new_v4(), now - Duration::seconds(1));
    queue.insert(&run).await.unwrap();

    let lease = now + Duration::seconds(300);
    let claimed = queue.claim_due(now, 1000, lease).await.unwrap();
    let mine = claimed.iter().find(|r| r.id == run.id).expect("run was not claimed");
    assert_eq!(mine.status, RunStatus::Running);
    assert_eq!(mine.remaining_actions, run.remaining_actions);
    assert_eq!(mine.context, run.context);

    let again = queue.claim_due(now, 1000, lease).await.unwrap();
    assert!(again.iter().all(|r| r.id != run.id));
}

#[tokio::test]
#[ignore]
async fn test_metrics_upsert_and_unique_contacts() {
    let pool = test_pool().await;
    let store = PgMetricsStore::new(pool);
    let id = Uuid::new_v4();
    let day = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();

    store.increment(id, day, MetricDelta::trigger()).await.unwrap();
    store.increment(id, day, MetricDelta::message()).await.unwrap();
    assert!(store.add_contact(id, day, 7).await.unwrap());
    assert!(!store.add_contact(id, day, 7).await.unwrap());
    store.set_conversion_rate(id, day, 0.5).await.unwrap();

    let rows = store.fetch(id, day, day).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].triggers_count, 1);
    assert_eq!(rows[0].messages_sent, 1);
    assert_eq!(rows[0].unique_contacts, 1);
    assert_eq!(rows[0].conversion_rate, 0.5);
}
