//! Lifecycle of the single long-lived event subscription.
//!
//! A background task opens the event stream, decodes envelopes and forwards
//! them over a channel. The owner of the [`Store`] drains that channel on its
//! own task, so store mutation stays single-threaded. Every attach gets a new
//! generation number; deliveries tagged with an older generation come from a
//! torn-down task and are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use opencode_api::{await_or_cancel, ApiError, CancellationSignal};

use crate::api::SessionApi;
use crate::events::{decode_event, ServerEvent};
use crate::store::Store;

pub type Generation = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed the stream.
    Ended,
    Failed(String),
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Streaming,
    Closed(CloseReason),
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription is already active")]
    AlreadyActive,

    #[error("no async runtime available to run the subscription")]
    NoRuntime,
}

#[derive(Debug)]
enum Delivery {
    Opened,
    Event(ServerEvent),
    Closed(CloseReason),
}

#[derive(Debug)]
struct Tagged {
    generation: Generation,
    delivery: Delivery,
}

#[derive(Debug)]
pub struct Subscription {
    state: SubscriptionState,
    generation: Generation,
    cancellation: Option<CancellationSignal>,
    task: Option<JoinHandle<()>>,
    sender: UnboundedSender<Tagged>,
    receiver: UnboundedReceiver<Tagged>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: SubscriptionState::Idle,
            generation: 0,
            cancellation: None,
            task: None,
            sender,
            receiver,
        }
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Start streaming from `api`. Replaces a closed or detached subscription.
    pub fn attach<A: SessionApi>(&mut self, api: Arc<A>) -> Result<(), SubscriptionError> {
        if self.state.is_active() {
            return Err(SubscriptionError::AlreadyActive);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SubscriptionError::NoRuntime)?;

        self.generation += 1;
        let cancellation: CancellationSignal = Arc::new(AtomicBool::new(false));
        let task = runtime.spawn(run_stream(
            api,
            Arc::clone(&cancellation),
            self.generation,
            self.sender.clone(),
        ));

        tracing::debug!(generation = self.generation, "subscription attached");
        self.cancellation = Some(cancellation);
        self.task = Some(task);
        self.state = SubscriptionState::Connecting;
        Ok(())
    }

    /// Apply every delivery queued so far, in arrival order. Returns the number
    /// of events handed to the store.
    pub fn drain_into(&mut self, store: &mut Store) -> usize {
        let mut applied = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(tagged) => applied += self.accept(tagged, store),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        applied
    }

    /// Wait for at least one delivery, then drain whatever else is queued.
    ///
    /// Never resolves while nothing is attached.
    pub async fn recv_into(&mut self, store: &mut Store) -> usize {
        let Some(first) = self.receiver.recv().await else {
            return 0;
        };
        self.accept(first, store) + self.drain_into(store)
    }

    /// Stop the current subscription. Deliveries still in flight are discarded.
    pub fn detach(&mut self) {
        if let Some(cancellation) = self.cancellation.take() {
            cancellation.store(true, Ordering::Release);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
        if self.state.is_active() {
            tracing::debug!(generation = self.generation, "subscription detached");
            self.state = SubscriptionState::Closed(CloseReason::Detached);
        }
    }

    fn accept(&mut self, tagged: Tagged, store: &mut Store) -> usize {
        if tagged.generation != self.generation {
            tracing::debug!(
                stale = tagged.generation,
                current = self.generation,
                "dropping delivery from superseded subscription"
            );
            return 0;
        }

        match tagged.delivery {
            Delivery::Opened => {
                if self.state == SubscriptionState::Connecting {
                    self.state = SubscriptionState::Streaming;
                }
                0
            }
            Delivery::Event(event) => {
                store.apply(event);
                1
            }
            Delivery::Closed(reason) => {
                self.cancellation = None;
                self.task = None;
                self.state = SubscriptionState::Closed(reason);
                0
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn run_stream<A: SessionApi>(
    api: Arc<A>,
    cancellation: CancellationSignal,
    generation: Generation,
    sender: UnboundedSender<Tagged>,
) {
    let send = |delivery| sender.send(Tagged { generation, delivery }).is_ok();

    let mut stream = match api.subscribe_events(&cancellation).await {
        Ok(stream) => stream,
        Err(ApiError::Cancelled) => return,
        Err(error) => {
            tracing::warn!(%error, "event stream failed to open");
            send(Delivery::Closed(CloseReason::Failed(error.to_string())));
            return;
        }
    };
    tracing::info!(generation, "event stream open");
    if !send(Delivery::Opened) {
        return;
    }

    loop {
        let next = match await_or_cancel(stream.next(), Some(&cancellation)).await {
            Ok(next) => next,
            Err(_) => return,
        };

        match next {
            None => {
                tracing::info!(generation, "event stream ended");
                send(Delivery::Closed(CloseReason::Ended));
                return;
            }
            Some(Err(error)) => {
                tracing::warn!(%error, "event stream failed");
                send(Delivery::Closed(CloseReason::Failed(error.to_string())));
                return;
            }
            Some(Ok(envelope)) => match decode_event(&envelope) {
                Ok(ServerEvent::Unknown { event_type }) => {
                    tracing::trace!(
                        event_type = event_type.as_deref().unwrap_or("<untyped>"),
                        "ignoring event"
                    );
                }
                Ok(event) => {
                    if !send(Delivery::Event(event)) {
                        return;
                    }
                }
                Err(error) => tracing::warn!(%error, "skipping malformed event"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CloseReason, Delivery, Subscription, SubscriptionError, SubscriptionState, Tagged};
    use crate::api::SessionApi;
    use crate::events::ServerEvent;
    use crate::store::Store;
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};
    use opencode_api::{
        ApiError, CancellationSignal, EventEnvelope, EventStream, MessageWithParts, Session,
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::time::{timeout, Duration};

    enum Script {
        Events(Vec<Result<EventEnvelope, ApiError>>),
        EventsThenHang(Vec<EventEnvelope>),
        OpenFails,
    }

    struct FakeApi {
        script: Mutex<Option<Script>>,
    }

    impl FakeApi {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Some(script)),
            })
        }
    }

    #[async_trait]
    impl SessionApi for FakeApi {
        async fn list_sessions(&self) -> Result<Vec<Session>, ApiError> {
            Ok(Vec::new())
        }

        async fn session_messages(&self, _: &str) -> Result<Vec<MessageWithParts>, ApiError> {
            Ok(Vec::new())
        }

        async fn subscribe_events(&self, _: &CancellationSignal) -> Result<EventStream, ApiError> {
            let script = self.script.lock().expect("script lock").take();
            match script {
                Some(Script::Events(items)) => Ok(Box::pin(stream::iter(items))),
                Some(Script::EventsThenHang(items)) => Ok(Box::pin(
                    stream::iter(items.into_iter().map(Ok::<EventEnvelope, ApiError>))
                        .chain(stream::pending()),
                )),
                Some(Script::OpenFails) | None => Err(ApiError::RetryExhausted {
                    status: None,
                    last_error: Some("overloaded".to_string()),
                }),
            }
        }
    }

    fn message_updated(id: &str) -> EventEnvelope {
        EventEnvelope::new(
            "message.updated",
            json!({"info": {"id": id, "sessionID": "s1", "role": "assistant", "time": {"created": 1}}}),
        )
    }

    async fn drain_until_closed(subscription: &mut Subscription, store: &mut Store) -> usize {
        let mut applied = 0;
        while !matches!(subscription.state(), SubscriptionState::Closed(_)) {
            applied += timeout(Duration::from_secs(5), subscription.recv_into(store))
                .await
                .expect("subscription should make progress");
        }
        applied
    }

    #[tokio::test]
    async fn events_are_applied_in_arrival_order_then_stream_ends() {
        let api = FakeApi::new(Script::Events(vec![
            Ok(message_updated("m1")),
            Ok(EventEnvelope::new("server.connected", json!({}))),
            Ok(message_updated("m2")),
        ]));
        let mut subscription = Subscription::new();
        let mut store = Store::default();

        subscription.attach(api).expect("attach");
        assert_eq!(subscription.state(), &SubscriptionState::Connecting);

        let applied = drain_until_closed(&mut subscription, &mut store).await;
        assert_eq!(applied, 2);
        assert_eq!(subscription.state(), &SubscriptionState::Closed(CloseReason::Ended));
        assert_eq!(store.message_ids("s1").to_vec(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let api = FakeApi::new(Script::Events(vec![
            Ok(EventEnvelope::new("message.updated", json!({"info": 7}))),
            Ok(message_updated("m1")),
        ]));
        let mut subscription = Subscription::new();
        let mut store = Store::default();

        subscription.attach(api).expect("attach");
        assert_eq!(drain_until_closed(&mut subscription, &mut store).await, 1);
        assert_eq!(store.messages_for("s1").len(), 1);
    }

    #[tokio::test]
    async fn stream_error_closes_with_failure() {
        let api = FakeApi::new(Script::Events(vec![
            Ok(message_updated("m1")),
            Err(ApiError::Cancelled),
            Ok(message_updated("m2")),
        ]));
        let mut subscription = Subscription::new();
        let mut store = Store::default();

        subscription.attach(api).expect("attach");
        drain_until_closed(&mut subscription, &mut store).await;
        assert!(matches!(
            subscription.state(),
            SubscriptionState::Closed(CloseReason::Failed(_))
        ));
        assert_eq!(store.message_ids("s1").to_vec(), vec!["m1"]);
    }

    #[tokio::test]
    async fn open_failure_closes_with_failure() {
        let mut subscription = Subscription::new();
        let mut store = Store::default();

        subscription.attach(FakeApi::new(Script::OpenFails)).expect("attach");
        assert_eq!(drain_until_closed(&mut subscription, &mut store).await, 0);
        assert!(matches!(
            subscription.state(),
            SubscriptionState::Closed(CloseReason::Failed(message)) if message.contains("overloaded")
        ));
    }

    #[tokio::test]
    async fn detach_drops_late_deliveries() {
        let api = FakeApi::new(Script::EventsThenHang(vec![message_updated("m1")]));
        let mut subscription = Subscription::new();
        let mut store = Store::default();

        subscription.attach(api).expect("attach");
        let applied = timeout(Duration::from_secs(5), subscription.recv_into(&mut store))
            .await
            .expect("first delivery");
        let applied = if applied == 0 {
            timeout(Duration::from_secs(5), subscription.recv_into(&mut store))
                .await
                .expect("event delivery")
        } else {
            applied
        };
        assert_eq!(applied, 1);
        assert_eq!(subscription.state(), &SubscriptionState::Streaming);

        let stale = subscription.generation();
        subscription.detach();
        assert_eq!(subscription.state(), &SubscriptionState::Closed(CloseReason::Detached));

        subscription
            .sender
            .send(Tagged {
                generation: stale,
                delivery: Delivery::Event(ServerEvent::MessageRemoved {
                    session_id: "s1".into(),
                    message_id: "m1".into(),
                }),
            })
            .expect("channel open");
        assert_eq!(subscription.drain_into(&mut store), 0);
        assert_eq!(store.messages_for("s1").len(), 1);
    }

    #[tokio::test]
    async fn attach_is_rejected_while_active_and_allowed_after_close() {
        let mut subscription = Subscription::new();
        let mut store = Store::default();

        subscription
            .attach(FakeApi::new(Script::EventsThenHang(Vec::new())))
            .expect("first attach");
        assert_eq!(
            subscription.attach(FakeApi::new(Script::Events(Vec::new()))),
            Err(SubscriptionError::AlreadyActive)
        );

        subscription.detach();
        subscription
            .attach(FakeApi::new(Script::Events(vec![Ok(message_updated("m3"))])))
            .expect("re-attach after detach");
        drain_until_closed(&mut subscription, &mut store).await;
        assert_eq!(store.message_ids("s1").to_vec(), vec!["m3"]);
    }

    #[test]
    fn attach_without_runtime_fails() {
        let mut subscription = Subscription::new();
        assert_eq!(
            subscription.attach(FakeApi::new(Script::Events(Vec::new()))),
            Err(SubscriptionError::NoRuntime)
        );
        assert_eq!(subscription.state(), &SubscriptionState::Idle);
    }
}
