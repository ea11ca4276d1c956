//! Streaming client for the opencode server.
//!
//! The crate is a headless core plus a small terminal front end:
//!
//! - [`events`] decodes raw event envelopes into [`ServerEvent`]s.
//! - [`store`] reconciles sessions, messages and parts from bulk loads and
//!   events, and exposes derived read views.
//! - [`subscription`] owns the live event stream and hands decoded events to
//!   the store on the caller's task.
//! - [`viewport`] computes the visible window of a virtualized transcript.
//! - [`app`] ties them together behind the [`SessionApi`] seam.
//!
//! Invariant: the [`Store`] is only mutated by the task that owns it; the
//! subscription task communicates exclusively through its channel.

pub mod api;
pub mod app;
pub mod config;
pub mod events;
pub mod logging;
pub mod render;
pub mod store;
pub mod subscription;
pub mod terminal;
pub mod viewport;

pub use crate::api::SessionApi;
pub use crate::app::{ClientApp, Screen, SettingsError};
pub use crate::config::{ClientConfig, ConfigError, Theme};
pub use crate::events::{decode_event, DecodeError, ServerEvent};
pub use crate::store::{MessageStatus, Store, StoreOptions};
pub use crate::subscription::{CloseReason, Subscription, SubscriptionError, SubscriptionState};
pub use crate::viewport::{VirtualList, VirtualListOptions, VisibleRow};

/// Wire types, re-exported for front ends.
pub use opencode_api::{
    EventEnvelope, Message, MessageWithParts, Part, PartKind, Role, Session, ToolState, ToolStatus,
};
