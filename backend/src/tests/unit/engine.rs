// Unit tests for event routing, schedule fan-out and run bookkeeping

use autoflow_shared::{Platform, RunStatus};
use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use crate::automations::{Clock, DispatchedRun};
use crate::error::EngineError;
use crate::tests::fixtures::{contact, daily_schedule_draft, draft, keyword_draft, webhook_draft};
use crate::tests::helpers::TestHarness;

async fn finish(runs: Vec<DispatchedRun>) -> Vec<RunStatus> {
    let mut statuses = Vec::with_capacity(runs.len());
    for run in runs {
        statuses.push(run.task.await.unwrap());
    }
    statuses
}

#[tokio::test]
async fn test_inbound_message_matches_owner_automations_in_creation_order() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    let other_owner = Uuid::new_v4();

    let first = h.engine.registry().create(owner, keyword_draft("first", &["promo"])).await.unwrap();
    let second = h.engine.registry().create(owner, keyword_draft("second", &["PROMO"])).await.unwrap();
    h.engine.registry().create(owner, keyword_draft("unrelated", &["refund"])).await.unwrap();
    h.engine.registry().create(other_owner, keyword_draft("foreign", &["promo"])).await.unwrap();

    let runs = h
        .engine
        .handle_inbound_message(owner, Platform::Whatsapp, "+5511999990001", "Quero a Promo de hoje")
        .await
        .unwrap();

    let matched: Vec<Uuid> = runs.iter().map(|r| r.automation_id).collect();
    assert_eq!(matched, vec![first.id, second.id]);
    assert_eq!(finish(runs).await, vec![RunStatus::Completed, RunStatus::Completed]);
    assert_eq!(h.dispatcher.sent().len(), 2);
}

#[tokio::test]
async fn test_inbound_message_creates_contact_and_stamps_interaction() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();

    let runs = h
        .engine
        .handle_inbound_message(owner, Platform::Instagram, "+5511999990002", "hello")
        .await
        .unwrap();
    assert!(runs.is_empty());

    let contacts = crate::integrations::ContactStore::list(h.contacts.as_ref(), owner).await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].phone, "+5511999990002");
    assert_eq!(contacts[0].last_interaction, Some(h.clock.now()));
}

#[tokio::test]
async fn test_inactive_automations_never_match() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    let automation = h.engine.registry().create(owner, keyword_draft("promo", &["promo"])).await.unwrap();
    h.engine.registry().set_active(owner, automation.id, false).await.unwrap();

    let runs = h
        .engine
        .handle_inbound_message(owner, Platform::Whatsapp, "+5511999990001", "promo")
        .await
        .unwrap();

    assert!(runs.is_empty());
    assert!(h.dispatcher.sent().is_empty());
}

#[tokio::test]
async fn test_failing_run_does_not_affect_siblings() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();

    // Missing template and empty literal: the send resolves to nothing.
    h.engine
        .registry()
        .create(
            owner,
            draft(
                "broken",
                "keyword",
                json!({ "keywords": ["promo"] }),
                json!([{ "id": 1, "type": "send_message", "template_id": 404, "message": "" }]),
            ),
        )
        .await
        .unwrap();
    h.engine.registry().create(owner, keyword_draft("working", &["promo"])).await.unwrap();

    let runs = h
        .engine
        .handle_inbound_message(owner, Platform::Whatsapp, "+5511999990001", "promo")
        .await
        .unwrap();

    assert_eq!(finish(runs).await, vec![RunStatus::Failed, RunStatus::Completed]);
    assert_eq!(h.dispatcher.sent().len(), 1);
}

#[tokio::test]
async fn test_webhook_payload_reaches_templates() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(7, "+5511999990007", Some("Bia")));
    let automation = h
        .engine
        .registry()
        .create(owner, webhook_draft("paid", "order-paid", "{{name}}, order {{payload.order.id}} is paid"))
        .await
        .unwrap();

    let runs = h
        .engine
        .handle_webhook("order-paid", 7, Platform::Whatsapp, json!({ "order": { "id": 42 } }))
        .await
        .unwrap();

    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].automation_id, automation.id);
    finish(runs).await;
    assert_eq!(h.dispatcher.sent_contents(), vec!["Bia, order 42 is paid"]);
}

#[tokio::test]
async fn test_unknown_webhook_token_is_not_found() {
    let h = TestHarness::new();

    let err = h
        .engine
        .handle_webhook("nope", 1, Platform::Whatsapp, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_schedule_tick_fans_out_once_per_day() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    for id in 1..=3 {
        h.contacts.insert(owner, contact(id, &format!("+55119999900{:02}", id), None));
    }
    let automation = h
        .engine
        .registry()
        .create(owner, daily_schedule_draft("morning", "10:00"))
        .await
        .unwrap();

    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 3);
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 0);

    let stored = h.engine.registry().get(owner, automation.id).await.unwrap();
    assert_eq!(stored.last_triggered_at, Some(h.clock.now()));
    assert_eq!(h.engine.run_history(owner, automation.id, 10).await.unwrap().len(), 3);

    h.clock.advance(Duration::minutes(1));
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 0);

    h.clock.advance(Duration::days(1) - Duration::minutes(1));
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 3);
}

#[tokio::test]
async fn test_schedule_retries_after_contact_listing_fails() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));
    let automation = h
        .engine
        .registry()
        .create(owner, daily_schedule_draft("morning", "10:00"))
        .await
        .unwrap();

    h.contacts.fail_next_list();
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 0);
    let stored = h.engine.registry().get(owner, automation.id).await.unwrap();
    assert_eq!(stored.last_triggered_at, None);

    h.clock.advance(Duration::seconds(20));
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 1);
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_schedule_listing_failure_does_not_block_other_schedules() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));
    h.engine.registry().create(owner, daily_schedule_draft("first", "10:00")).await.unwrap();
    h.engine.registry().create(owner, daily_schedule_draft("second", "10:00")).await.unwrap();

    // Only the first listing fails; the second schedule still fans out.
    h.contacts.fail_next_list();
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 1);
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 1);
    assert_eq!(h.engine.run_schedule_tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_history_is_owner_scoped() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    let automation = h.engine.registry().create(owner, keyword_draft("promo", &["promo"])).await.unwrap();

    let err = h.engine.run_history(Uuid::new_v4(), automation.id, 10).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_purge_removes_only_old_finished_runs() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));
    let automation = h
        .engine
        .registry()
        .create(
            owner,
            draft(
                "two-step",
                "keyword",
                json!({ "keywords": ["go"] }),
                json!([
                    { "id": 1, "type": "send_message", "message": "now" },
                    { "id": 2, "type": "delay", "seconds": 3600 * 24 * 90 },
                    { "id": 3, "type": "send_message", "message": "much later" }
                ]),
            ),
        )
        .await
        .unwrap();
    let quick = h
        .engine
        .registry()
        .create(owner, keyword_draft("quick", &["go"]))
        .await
        .unwrap();

    let runs = h
        .engine
        .handle_inbound_message(owner, Platform::Whatsapp, "+5511999990001", "go")
        .await
        .unwrap();
    assert_eq!(finish(runs).await, vec![RunStatus::Suspended, RunStatus::Completed]);

    h.clock.advance(Duration::days(31));
    assert_eq!(h.engine.purge_finished_runs().await.unwrap(), 1);

    assert_eq!(h.engine.run_history(owner, automation.id, 10).await.unwrap().len(), 1);
    assert!(h.engine.run_history(owner, quick.id, 10).await.unwrap().is_empty());
}
