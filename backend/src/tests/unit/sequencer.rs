// Unit tests for action execution: template resolution, delays, failure handling

use autoflow_shared::{AutomationRun, Platform, RunStatus};
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::automations::{ActionSequencer, AnalyticsAggregator, ContactLocks, RunOutcome};
use crate::error::EngineError;
use crate::integrations::{CollaboratorError, MockContactStore, MockMessageDispatcher, MockTemplateStore};
use crate::storage::MemoryMetricsStore;
use crate::tests::fakes::ManualClock;
use crate::tests::fixtures::{actions, contact, draft};
use crate::tests::helpers::TestHarness;

async fn run_once(h: &TestHarness, owner: Uuid, raw_actions: serde_json::Value, context: serde_json::Value) -> RunStatus {
    let automation = h
        .engine
        .registry()
        .create(owner, draft("seq", "keyword", json!({ "keywords": ["go"] }), raw_actions))
        .await
        .unwrap();

    h.engine
        .start_run(&automation, 1, Platform::Whatsapp, context)
        .await
        .unwrap()
        .task
        .await
        .unwrap()
}

#[tokio::test]
async fn test_template_content_wins_over_literal() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", Some("Ana")));
    h.templates.insert(owner, 7, "Olá {{name}}, pedido {{payload.code}}");

    let status = run_once(
        &h,
        owner,
        json!([{ "id": 1, "type": "send_message", "template_id": 7, "message": "literal" }]),
        json!({ "code": "X1" }),
    )
    .await;

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(h.dispatcher.sent_contents(), vec!["Olá Ana, pedido X1"]);
}

#[tokio::test]
async fn test_blank_or_missing_template_falls_back_to_literal() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));
    h.templates.insert(owner, 7, "   ");

    run_once(
        &h,
        owner,
        json!([
            { "id": 1, "type": "send_message", "template_id": 7, "message": "blank template" },
            { "id": 2, "type": "send_message", "template_id": 99, "message": "missing template" }
        ]),
        json!(null),
    )
    .await;

    assert_eq!(h.dispatcher.sent_contents(), vec!["blank template", "missing template"]);
}

#[tokio::test]
async fn test_unresolved_name_is_left_verbatim() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));

    run_once(
        &h,
        owner,
        json!([{ "id": 1, "type": "send_message", "message": "Hi {{name}} ({{phone}})" }]),
        json!(null),
    )
    .await;

    assert_eq!(h.dispatcher.sent_contents(), vec!["Hi {{name}} (+5511999990001)"]);
}

#[tokio::test]
async fn test_dispatch_failure_stops_run_without_rollback() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", Some("Ana")));
    h.dispatcher.set_failing(true);

    let status = run_once(
        &h,
        owner,
        json!([
            { "id": 1, "type": "add_tag", "tag": "lead" },
            { "id": 2, "type": "send_message", "message": "Hi" },
            { "id": 3, "type": "add_tag", "tag": "contacted" }
        ]),
        json!(null),
    )
    .await;

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(h.contacts.contact(owner, 1).unwrap().tags, vec!["lead"]);

    let automation = &h.engine.registry().list(owner).await.unwrap()[0];
    let history = h.engine.run_history(owner, automation.id, 10).await.unwrap();
    assert_eq!(history[0].status, RunStatus::Failed);
    assert_eq!(history[0].actions_completed, 1);
    assert!(history[0].error_message.as_deref().unwrap().contains("dispatch"));
}

#[tokio::test]
async fn test_repeated_tag_is_written_once() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));

    run_once(
        &h,
        owner,
        json!([
            { "id": 1, "type": "add_tag", "tag": "vip" },
            { "id": 2, "type": "add_tag", "tag": "vip" },
            { "id": 3, "type": "remove_tag", "tag": "never-there" },
            { "id": 4, "type": "update_field", "field": "plan", "value": "gold" }
        ]),
        json!(null),
    )
    .await;

    let stored = h.contacts.contact(owner, 1).unwrap();
    assert_eq!(stored.tags, vec!["vip"]);
    assert_eq!(stored.custom_fields.get("plan").map(String::as_str), Some("gold"));
    assert_eq!(h.contacts.update_count(), 2);
}

#[tokio::test]
async fn test_delay_action_suspends_until_due() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));

    let status = run_once(
        &h,
        owner,
        json!([
            { "id": 1, "type": "send_message", "message": "one" },
            { "id": 2, "type": "delay", "seconds": 60 },
            { "id": 3, "type": "send_message", "message": "two" }
        ]),
        json!(null),
    )
    .await;

    assert_eq!(status, RunStatus::Suspended);
    assert_eq!(h.dispatcher.sent_contents(), vec!["one"]);
    assert_eq!(h.engine.resume_due().await.unwrap(), 0);

    h.clock.advance(Duration::seconds(61));
    assert_eq!(h.engine.resume_due().await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["one", "two"]);

    let automation = &h.engine.registry().list(owner).await.unwrap()[0];
    let history = h.engine.run_history(owner, automation.id, 10).await.unwrap();
    assert_eq!(history[0].status, RunStatus::Completed);
    assert_eq!(history[0].actions_completed, 3);
}

#[tokio::test]
async fn test_message_delay_tag_sequence_resumes_after_delay() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", Some("Ana")));

    let status = run_once(
        &h,
        owner,
        json!([
            { "id": 1, "type": "send_message", "message": "Welcome {{name}}" },
            { "id": 2, "type": "delay", "seconds": 3600 },
            { "id": 3, "type": "add_tag", "tag": "followed-up" }
        ]),
        json!(null),
    )
    .await;

    assert_eq!(status, RunStatus::Suspended);
    assert_eq!(h.dispatcher.sent_contents(), vec!["Welcome Ana"]);
    assert!(h.contacts.contact(owner, 1).unwrap().tags.is_empty());

    h.clock.advance(Duration::minutes(30));
    assert_eq!(h.engine.resume_due().await.unwrap(), 0);
    assert!(h.contacts.contact(owner, 1).unwrap().tags.is_empty());

    h.clock.advance(Duration::minutes(30));
    assert_eq!(h.engine.resume_due().await.unwrap(), 1);
    assert_eq!(h.contacts.contact(owner, 1).unwrap().tags, vec!["followed-up"]);
    assert_eq!(h.dispatcher.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_keep_every_tag() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));

    let tags = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let mut automations = Vec::new();
    for tag in tags {
        let automation = h
            .engine
            .registry()
            .create(
                owner,
                draft(tag, "keyword", json!({ "keywords": ["go"] }), json!([{ "id": 1, "type": "add_tag", "tag": tag }])),
            )
            .await
            .unwrap();
        automations.push(automation);
    }

    let mut started = Vec::new();
    for automation in &automations {
        started.push(h.engine.start_run(automation, 1, Platform::Whatsapp, json!(null)).await.unwrap());
    }
    for run in started {
        assert_eq!(run.task.await.unwrap(), RunStatus::Completed);
    }

    let mut stored = h.contacts.contact(owner, 1).unwrap().tags;
    stored.sort();
    let mut expected: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    expected.sort();
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn test_send_delay_waits_before_sending() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));

    let status = run_once(
        &h,
        owner,
        json!([{ "id": 1, "type": "send_message", "message": "later", "delay_seconds": 120 }]),
        json!(null),
    )
    .await;

    assert_eq!(status, RunStatus::Suspended);
    assert!(h.dispatcher.sent().is_empty());

    h.clock.advance(Duration::seconds(120));
    assert_eq!(h.engine.resume_due().await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["later"]);
}

#[tokio::test]
async fn test_completion_records_trigger_and_unique_contact() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(1, "+5511999990001", None));

    let automation = h
        .engine
        .registry()
        .create(
            owner,
            draft(
                "metrics",
                "keyword",
                json!({ "keywords": ["go"] }),
                json!([{ "id": 1, "type": "send_message", "message": "hello" }]),
            ),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let run = h.engine.start_run(&automation, 1, Platform::Whatsapp, json!(null)).await.unwrap();
        run.task.await.unwrap();
    }

    let today = h.engine.analytics().today();
    let rows = h.engine.analytics().query(automation.id, Some(today), Some(today)).await.unwrap();
    assert_eq!(rows[0].triggers_count, 2);
    assert_eq!(rows[0].messages_sent, 2);
    assert_eq!(rows[0].unique_contacts, 1);
}

fn sequencer_with(
    contacts: MockContactStore,
    templates: MockTemplateStore,
    dispatcher: MockMessageDispatcher,
) -> ActionSequencer {
    let clock = Arc::new(ManualClock::default());
    let analytics = Arc::new(AnalyticsAggregator::new(
        Arc::new(MemoryMetricsStore::new()),
        clock.clone(),
        366,
    ));

    ActionSequencer::new(
        Arc::new(contacts),
        Arc::new(templates),
        Arc::new(dispatcher),
        analytics,
        Arc::new(ContactLocks::new()),
        clock,
    )
}

fn pending_run(raw_actions: serde_json::Value) -> AutomationRun {
    let now = chrono::Utc::now();
    AutomationRun {
        id: Uuid::new_v4(),
        automation_id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        contact_id: 1,
        platform: Platform::Telegram,
        status: RunStatus::Running,
        remaining_actions: actions(raw_actions),
        delay_served: false,
        context: json!(null),
        actions_completed: 0,
        run_at: now,
        locked_until: None,
        error_message: None,
        started_at: now,
        completed_at: None,
    }
}

#[tokio::test]
async fn test_transport_error_is_reported_as_dispatch_failure() {
    let mut contacts = MockContactStore::new();
    contacts
        .expect_get()
        .returning(|_, id| Ok(contact(id, "+5511999990001", Some("Ana"))));

    let mut templates = MockTemplateStore::new();
    templates.expect_get().never();

    let mut dispatcher = MockMessageDispatcher::new();
    dispatcher
        .expect_send()
        .times(1)
        .withf(|_, message| message.content == "Hi Ana" && message.platform == Platform::Telegram)
        .returning(|_, _| Err(CollaboratorError::Transport("connection reset".to_string())));

    let sequencer = sequencer_with(contacts, templates, dispatcher);
    let mut run = pending_run(json!([
        { "id": 1, "type": "send_message", "message": "Hi {{name}}" },
        { "id": 2, "type": "add_tag", "tag": "never" }
    ]));

    let outcome = sequencer.advance(&mut run).await;

    assert!(matches!(outcome, RunOutcome::Failed(EngineError::Dispatch(_))));
    assert_eq!(run.actions_completed, 0);
    assert_eq!(run.remaining_actions.len(), 2);
}

#[tokio::test]
async fn test_zero_second_delay_does_not_suspend() {
    let mut dispatcher = MockMessageDispatcher::new();
    dispatcher.expect_send().never();

    let sequencer = sequencer_with(MockContactStore::new(), MockTemplateStore::new(), dispatcher);
    let mut run = pending_run(json!([{ "id": 1, "type": "delay", "seconds": 0 }]));

    let outcome = sequencer.advance(&mut run).await;

    assert!(matches!(outcome, RunOutcome::Completed));
    assert_eq!(run.actions_completed, 1);
    assert!(run.remaining_actions.is_empty());
}
