use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use opencode_api::{
    ApiError, CancellationSignal, EventEnvelope, EventStream, Message, MessageWithParts, Part,
    Role, Session,
};
use opencode_view::api::SessionApi;
use opencode_view::app::{
    ClientApp, Screen, SettingsError, CONNECT_FAILED_ALERT, ENDPOINT_REQUIRED_ALERT,
    ENDPOINT_UNREACHABLE_ALERT,
};
use opencode_view::config::{ClientConfig, Theme};
use opencode_view::subscription::{CloseReason, SubscriptionState};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{timeout, Duration};

#[derive(Default)]
struct ServerState {
    sessions: Vec<Session>,
    messages: HashMap<String, Vec<MessageWithParts>>,
    events: Vec<EventEnvelope>,
    hang_after_events: bool,
    fail_sessions: bool,
    fail_messages: bool,
    calls: Vec<String>,
}

type Shared = Arc<Mutex<ServerState>>;

struct FakeApi {
    endpoint: String,
    state: Shared,
}

fn unreachable() -> ApiError {
    ApiError::RetryExhausted {
        status: None,
        last_error: Some("connection refused".to_string()),
    }
}

impl FakeApi {
    fn record(&self, call: String) {
        self.state.lock().expect("state lock").calls.push(call);
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn list_sessions(&self) -> Result<Vec<Session>, ApiError> {
        self.record(format!("list_sessions {}", self.endpoint));
        let state = self.state.lock().expect("state lock");
        if state.fail_sessions {
            return Err(unreachable());
        }
        Ok(state.sessions.clone())
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, ApiError> {
        self.record(format!("session_messages {session_id}"));
        let state = self.state.lock().expect("state lock");
        if state.fail_messages {
            return Err(unreachable());
        }
        Ok(state.messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn subscribe_events(&self, _: &CancellationSignal) -> Result<EventStream, ApiError> {
        self.record("subscribe_events".to_string());
        let state = self.state.lock().expect("state lock");
        let events = stream::iter(
            state
                .events
                .clone()
                .into_iter()
                .map(Ok::<EventEnvelope, ApiError>),
        );
        if state.hang_after_events {
            Ok(Box::pin(events.chain(stream::pending())))
        } else {
            Ok(Box::pin(events))
        }
    }
}

fn app_with(state: &Shared, endpoint: Option<&str>) -> ClientApp<FakeApi> {
    let state = Arc::clone(state);
    ClientApp::new(
        ClientConfig::new(endpoint.map(str::to_string), Theme::Dark),
        move |endpoint: &str| {
            if endpoint.contains("bad") {
                return Err(ApiError::InvalidBaseUrl(endpoint.to_string()));
            }
            Ok(FakeApi {
                endpoint: endpoint.to_string(),
                state: Arc::clone(&state),
            })
        },
    )
}

fn bundle(id: &str, session_id: &str, text: &str) -> MessageWithParts {
    MessageWithParts {
        info: Message::new(id, session_id, Role::User),
        parts: vec![Part::text(format!("{id}-p"), session_id, id, text)],
    }
}

fn seeded_state() -> Shared {
    let mut state = ServerState {
        sessions: vec![
            Session::new("s1", "Old", 100),
            Session::new("s2", "Newest", 300),
            Session::new("s3", "Middle", 200),
        ],
        hang_after_events: true,
        ..ServerState::default()
    };
    state
        .messages
        .insert("s2".to_string(), vec![bundle("m1", "s2", "hello")]);
    state
        .messages
        .insert("s1".to_string(), vec![bundle("m9", "s1", "older")]);
    Arc::new(Mutex::new(state))
}

fn calls(state: &Shared) -> Vec<String> {
    state.lock().expect("state lock").calls.clone()
}

async fn wait_for_calls(state: &Shared, count: usize) {
    timeout(Duration::from_secs(5), async {
        while calls(state).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected calls should happen");
}

#[tokio::test]
async fn missing_endpoint_shows_settings_without_requests() {
    let state = seeded_state();
    let mut app = app_with(&state, None);

    assert!(!app.bootstrap().await);
    assert_eq!(app.screen(), Screen::Settings);
    assert_eq!(app.alert(), None);
    assert!(calls(&state).is_empty());
}

#[tokio::test]
async fn bootstrap_loads_newest_session_then_subscribes() {
    let state = seeded_state();
    let mut app = app_with(&state, Some("http://localhost:9999"));

    assert!(app.bootstrap().await);
    assert_eq!(app.screen(), Screen::Chat);
    wait_for_calls(&state, 3).await;

    assert_eq!(
        calls(&state),
        vec![
            "list_sessions http://localhost:9999",
            "session_messages s2",
            "subscribe_events",
        ]
    );
    let order: Vec<_> = app.store().sessions().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, vec!["s2", "s3", "s1"]);
    assert_eq!(app.store().current_session_id(), Some("s2"));
    assert_eq!(app.store().current_messages().len(), 1);
    app.shutdown();
}

#[tokio::test]
async fn fetch_failure_alerts_and_keeps_last_known_state() {
    let state = seeded_state();
    let mut app = app_with(&state, Some("http://localhost:9999"));
    assert!(app.bootstrap().await);

    state.lock().expect("state lock").fail_sessions = true;
    assert!(!app.bootstrap().await);

    assert_eq!(app.alert(), Some(CONNECT_FAILED_ALERT));
    assert_eq!(app.screen(), Screen::Settings);
    assert_eq!(app.store().sessions().len(), 3);
    assert_eq!(app.store().current_messages().len(), 1);
    app.shutdown();
}

#[tokio::test]
async fn message_fetch_failure_is_reported() {
    let state = seeded_state();
    state.lock().expect("state lock").fail_messages = true;
    let mut app = app_with(&state, Some("http://localhost:9999"));

    assert!(!app.bootstrap().await);
    assert_eq!(app.alert(), Some(CONNECT_FAILED_ALERT));
    assert_eq!(app.subscription_state(), &SubscriptionState::Idle);
}

#[tokio::test]
async fn settings_require_an_endpoint() {
    let state = seeded_state();
    let mut app = app_with(&state, None);

    let result = app.save_settings("   ", Theme::Nord).await;
    assert_eq!(result, Err(SettingsError::EndpointRequired));
    assert_eq!(app.alert(), Some(ENDPOINT_REQUIRED_ALERT));
    assert_eq!(app.config().endpoint, None);
    assert!(calls(&state).is_empty());
}

#[tokio::test]
async fn settings_reject_unreachable_endpoints() {
    let state = seeded_state();
    let mut app = app_with(&state, None);

    assert_eq!(
        app.save_settings("not a url", Theme::Nord).await,
        Err(SettingsError::Unreachable)
    );
    assert_eq!(
        app.save_settings("http://bad.example", Theme::Nord).await,
        Err(SettingsError::Unreachable)
    );

    state.lock().expect("state lock").fail_sessions = true;
    assert_eq!(
        app.save_settings("http://localhost:1234", Theme::Nord).await,
        Err(SettingsError::Unreachable)
    );
    assert_eq!(app.alert(), Some(ENDPOINT_UNREACHABLE_ALERT));
    assert_eq!(app.config().endpoint, None);
    assert_eq!(app.theme(), Theme::Dark);
}

#[tokio::test]
async fn saved_settings_bootstrap_against_new_endpoint() {
    let state = seeded_state();
    let mut app = app_with(&state, None);

    app.save_settings(" http://127.0.0.1:4096/ ", Theme::Dracula)
        .await
        .expect("settings should save");

    assert_eq!(app.config().endpoint(), Some("http://127.0.0.1:4096"));
    assert_eq!(app.theme(), Theme::Dracula);
    assert_eq!(app.screen(), Screen::Chat);
    assert_eq!(app.alert(), None);
    assert_eq!(app.store().current_session_id(), Some("s2"));

    let recorded = calls(&state);
    assert_eq!(recorded[0], "list_sessions http://127.0.0.1:4096");
    assert_eq!(recorded[1], "list_sessions http://127.0.0.1:4096");
    app.shutdown();
}

#[tokio::test]
async fn saved_settings_report_a_failed_reload() {
    let state = seeded_state();
    state.lock().expect("state lock").fail_messages = true;
    let mut app = app_with(&state, None);

    assert_eq!(
        app.save_settings("http://127.0.0.1:4096", Theme::Nord).await,
        Err(SettingsError::LoadFailed)
    );
    assert_eq!(app.config().endpoint(), Some("http://127.0.0.1:4096"));
    assert_eq!(app.alert(), Some(CONNECT_FAILED_ALERT));
    assert_eq!(app.screen(), Screen::Settings);
}

#[tokio::test]
async fn selecting_a_session_loads_its_messages() {
    let state = seeded_state();
    let mut app = app_with(&state, Some("http://localhost:9999"));
    assert!(app.bootstrap().await);

    assert!(app.select_session("s1").await);
    assert_eq!(app.store().current_session_id(), Some("s1"));
    let messages = app.store().current_messages();
    assert_eq!(messages[0].info.id, "m9");

    assert!(!app.select_session("missing").await);
    assert_eq!(app.store().current_session_id(), Some("s1"));
    app.shutdown();
}

#[tokio::test]
async fn streamed_events_reach_the_store_in_order() {
    let state = seeded_state();
    {
        let mut guard = state.lock().expect("state lock");
        guard.hang_after_events = false;
        guard.events = vec![
            EventEnvelope::new(
                "message.part.updated",
                json!({"part": {"id": "p2", "sessionID": "s2", "messageID": "m2", "type": "text", "text": "hi"}}),
            ),
            EventEnvelope::new(
                "message.updated",
                json!({"info": {"id": "m2", "sessionID": "s2", "role": "assistant", "time": {"created": 5}}}),
            ),
            EventEnvelope::new(
                "message.part.updated",
                json!({"part": {"id": "p2", "sessionID": "s2", "messageID": "m2", "type": "text", "text": "hi there"}}),
            ),
            EventEnvelope::new("message.removed", json!({"sessionID": "s2", "messageID": "m1"})),
        ];
    }
    let mut app = app_with(&state, Some("http://localhost:9999"));
    assert!(app.bootstrap().await);

    let mut applied = 0;
    while !matches!(app.subscription_state(), SubscriptionState::Closed(_)) {
        applied += timeout(Duration::from_secs(5), app.next_update())
            .await
            .expect("subscription should deliver");
    }

    assert_eq!(applied, 4);
    assert_eq!(
        app.subscription_state(),
        &SubscriptionState::Closed(CloseReason::Ended)
    );
    let messages = app.store().current_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].info.id, "m2");
    assert_eq!(messages[0].parts.len(), 1);
    assert_eq!(
        messages[0].parts[0].kind,
        opencode_api::PartKind::Text {
            text: "hi there".into(),
            synthetic: false
        }
    );
}

#[tokio::test]
async fn shutdown_detaches_the_subscription() {
    let state = seeded_state();
    let mut app = app_with(&state, Some("http://localhost:9999"));
    assert!(app.bootstrap().await);

    app.shutdown();
    assert_eq!(
        app.subscription_state(),
        &SubscriptionState::Closed(CloseReason::Detached)
    );
    assert_eq!(app.pump(), 0);
}
