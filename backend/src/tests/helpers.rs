use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Method, Request, Response},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::fakes::{FakeContacts, FakeDispatcher, FakeTemplates, ManualClock};
use crate::auth::jwt::create_jwt;
use crate::automations::{AutomationEngine, Collaborators, RecurrenceOracle, Stores};
use crate::config::{CollaboratorConfig, Config, EngineConfig, StorageBackend};
use crate::storage::{MemoryAutomationRepository, MemoryMetricsStore, MemoryRunQueue};
use crate::{build_router, AppState};

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_only";

pub fn create_test_jwt(owner_id: Uuid) -> String {
    create_jwt(owner_id, TEST_JWT_SECRET, chrono::Duration::hours(1)).expect("Failed to create test JWT")
}

pub fn bearer(owner_id: Uuid) -> String {
    format!("Bearer {}", create_test_jwt(owner_id))
}

pub fn test_config(storage: StorageBackend) -> Config {
    Config {
        database_url: std::env::var("TEST_DATABASE_URL").unwrap_or_default(),
        server_addr: "127.0.0.1:0".to_string(),
        jwt_secret: TEST_JWT_SECRET.to_string(),
        storage,
        collaborators: CollaboratorConfig {
            base_url: "http://collaborators.test".to_string(),
            api_token: "test-token".to_string(),
            timeout_secs: 5,
        },
        engine: EngineConfig::default(),
    }
}

/// Engine on the memory backend with fake collaborators and a manual clock.
pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub contacts: Arc<FakeContacts>,
    pub templates: Arc<FakeTemplates>,
    pub dispatcher: Arc<FakeDispatcher>,
    pub engine: Arc<AutomationEngine>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_clock(ManualClock::default())
    }

    pub fn with_clock(clock: ManualClock) -> Self {
        let clock = Arc::new(clock);
        let contacts = Arc::new(FakeContacts::new());
        let templates = Arc::new(FakeTemplates::default());
        let dispatcher = Arc::new(FakeDispatcher::default());

        let engine = Arc::new(AutomationEngine::new(
            Stores {
                automations: Arc::new(MemoryAutomationRepository::new()),
                metrics: Arc::new(MemoryMetricsStore::new()),
                runs: Arc::new(MemoryRunQueue::new()),
            },
            Collaborators {
                contacts: contacts.clone(),
                templates: templates.clone(),
                dispatcher: dispatcher.clone(),
            },
            clock.clone(),
            Arc::new(RecurrenceOracle),
            EngineConfig::default(),
        ));

        Self {
            clock,
            contacts,
            templates,
            dispatcher,
            engine,
        }
    }

    pub fn router(&self) -> Router {
        build_router(Arc::new(AppState {
            config: test_config(StorageBackend::Memory),
            db_pool: None,
            engine: self.engine.clone(),
        }))
    }
}

pub fn json_request(method: Method, uri: &str, owner_id: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner_id) = owner_id {
        builder = builder.header(AUTHORIZATION, bearer(owner_id));
    }

    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("response body is not JSON")
}

pub fn collaborator_config(server: &MockServer) -> CollaboratorConfig {
    CollaboratorConfig {
        base_url: server.uri(),
        api_token: "test-token".to_string(),
        timeout_secs: 5,
    }
}

/// Collaborator API that accepts every message send.
pub async fn create_mock_messaging_server() -> MockServer {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/messages/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "success": true })))
        .mount(&mock_server)
        .await;

    mock_server
}
