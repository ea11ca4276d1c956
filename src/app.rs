//! Client orchestration: configuration gating, initial loads, the live
//! subscription and user-facing alerts.

use std::sync::Arc;

use thiserror::Error;

use opencode_api::{ApiConfig, ApiError, OpencodeClient};

use crate::api::SessionApi;
use crate::config::{validate_endpoint, ClientConfig, Theme};
use crate::store::Store;
use crate::subscription::{Subscription, SubscriptionState};

pub const CONNECT_FAILED_ALERT: &str =
    "Failed to connect to OpenCode API. Please check your settings.";
pub const ENDPOINT_REQUIRED_ALERT: &str = "API endpoint is required";
pub const ENDPOINT_UNREACHABLE_ALERT: &str =
    "Failed to connect to API endpoint. Please check the URL and try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// Configuration prompt.
    Settings,
    Chat,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("API endpoint is required")]
    EndpointRequired,

    #[error("Failed to connect to API endpoint. Please check the URL and try again.")]
    Unreachable,

    /// The endpoint was saved but loading from it failed.
    #[error("Failed to connect to OpenCode API. Please check your settings.")]
    LoadFailed,
}

impl SettingsError {
    pub fn alert(&self) -> &'static str {
        match self {
            Self::EndpointRequired => ENDPOINT_REQUIRED_ALERT,
            Self::Unreachable => ENDPOINT_UNREACHABLE_ALERT,
            Self::LoadFailed => CONNECT_FAILED_ALERT,
        }
    }
}

type Connector<A> = Box<dyn Fn(&str) -> Result<A, ApiError> + Send + Sync>;

/// Builds transport clients for the real server.
pub fn http_connector(endpoint: &str) -> Result<OpencodeClient, ApiError> {
    OpencodeClient::new(ApiConfig::new(endpoint))
}

pub struct ClientApp<A: SessionApi> {
    config: ClientConfig,
    connector: Connector<A>,
    api: Option<Arc<A>>,
    store: Store,
    subscription: Subscription,
    screen: Screen,
    alert: Option<String>,
}

impl ClientApp<OpencodeClient> {
    pub fn with_http(config: ClientConfig) -> Self {
        Self::new(config, http_connector)
    }
}

impl<A: SessionApi> ClientApp<A> {
    pub fn new<F>(config: ClientConfig, connector: F) -> Self
    where
        F: Fn(&str) -> Result<A, ApiError> + Send + Sync + 'static,
    {
        Self {
            config,
            connector: Box::new(connector),
            api: None,
            store: Store::default(),
            subscription: Subscription::new(),
            screen: Screen::Settings,
            alert: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn theme(&self) -> Theme {
        self.config.theme
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn alert(&self) -> Option<&str> {
        self.alert.as_deref()
    }

    pub fn dismiss_alert(&mut self) {
        self.alert = None;
    }

    pub fn subscription_state(&self) -> &SubscriptionState {
        self.subscription.state()
    }

    /// Load sessions and the selected session's messages, then start the
    /// live subscription. Returns `false` when the settings screen is shown.
    pub async fn bootstrap(&mut self) -> bool {
        let Some(endpoint) = self.config.endpoint().map(str::to_string) else {
            tracing::info!("no API endpoint configured");
            self.screen = Screen::Settings;
            return false;
        };

        let api = match (self.connector)(&endpoint) {
            Ok(api) => Arc::new(api),
            Err(error) => return self.connect_failed(&error),
        };

        let sessions = match api.list_sessions().await {
            Ok(sessions) => sessions,
            Err(error) => return self.connect_failed(&error),
        };
        self.store.load_sessions(sessions);

        let target = self
            .store
            .current_session_id()
            .filter(|id| self.store.session(id).is_some())
            .or_else(|| self.store.sessions().first().map(|session| session.id.as_str()))
            .map(str::to_string);

        if let Some(session_id) = &target {
            match api.session_messages(session_id).await {
                Ok(messages) => self.store.load_messages(session_id, messages),
                Err(error) => return self.connect_failed(&error),
            }
        }
        self.store.select_session(target.as_deref());

        self.subscription.detach();
        if let Err(error) = self.subscription.attach(Arc::clone(&api)) {
            tracing::warn!(%error, "could not start event subscription");
            self.alert = Some(CONNECT_FAILED_ALERT.to_string());
        } else {
            self.alert = None;
        }

        tracing::info!(
            endpoint = %endpoint,
            sessions = self.store.sessions().len(),
            "client bootstrapped"
        );
        self.api = Some(api);
        self.screen = Screen::Chat;
        true
    }

    /// Switch to `session_id` and load its messages.
    pub async fn select_session(&mut self, session_id: &str) -> bool {
        let Some(api) = self.api.clone() else {
            return false;
        };
        if self.store.session(session_id).is_none() {
            tracing::warn!(session_id, "ignoring selection of unknown session");
            return false;
        }

        match api.session_messages(session_id).await {
            Ok(messages) => {
                self.store.load_messages(session_id, messages);
                self.store.select_session(Some(session_id));
                true
            }
            Err(error) => {
                tracing::warn!(session_id, %error, "failed to load session messages");
                self.alert = Some(CONNECT_FAILED_ALERT.to_string());
                false
            }
        }
    }

    /// Validate and apply a new endpoint, then start over against it. The
    /// endpoint stays saved when only the reload fails.
    pub async fn save_settings(&mut self, endpoint: &str, theme: Theme) -> Result<(), SettingsError> {
        let result = self.validate_settings(endpoint).await;
        let endpoint = match result {
            Ok(endpoint) => endpoint,
            Err(error) => {
                self.alert = Some(error.alert().to_string());
                return Err(error);
            }
        };

        self.shutdown();
        self.store.reset();
        self.config.endpoint = Some(endpoint);
        self.config.theme = theme;
        self.alert = None;
        if self.bootstrap().await {
            Ok(())
        } else {
            Err(SettingsError::LoadFailed)
        }
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.config.theme = theme;
    }

    /// Show the settings screen without dropping current state.
    pub fn open_settings(&mut self) {
        self.screen = Screen::Settings;
    }

    /// Leave the settings screen when there is something to go back to.
    pub fn close_settings(&mut self) -> bool {
        if self.api.is_some() {
            self.screen = Screen::Chat;
            true
        } else {
            false
        }
    }

    /// Apply whatever the subscription delivered so far.
    pub fn pump(&mut self) -> usize {
        self.subscription.drain_into(&mut self.store)
    }

    /// Wait for the next subscription delivery and apply it with anything queued behind it.
    pub async fn next_update(&mut self) -> usize {
        self.subscription.recv_into(&mut self.store).await
    }

    pub fn shutdown(&mut self) {
        self.subscription.detach();
        self.api = None;
    }

    async fn validate_settings(&self, endpoint: &str) -> Result<String, SettingsError> {
        let trimmed = endpoint.trim();
        if trimmed.is_empty() {
            return Err(SettingsError::EndpointRequired);
        }

        let normalized = validate_endpoint(trimmed).map_err(|error| {
            tracing::warn!(%error, "rejecting endpoint");
            SettingsError::Unreachable
        })?;
        let api = (self.connector)(&normalized).map_err(|error| {
            tracing::warn!(%error, "rejecting endpoint");
            SettingsError::Unreachable
        })?;
        api.list_sessions().await.map_err(|error| {
            tracing::warn!(endpoint = %normalized, %error, "endpoint check failed");
            SettingsError::Unreachable
        })?;
        Ok(normalized)
    }

    fn connect_failed(&mut self, error: &ApiError) -> bool {
        tracing::warn!(%error, "failed to load from API");
        self.alert = Some(CONNECT_FAILED_ALERT.to_string());
        self.screen = Screen::Settings;
        false
    }
}
