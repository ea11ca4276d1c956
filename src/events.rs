//! Decoding of raw event envelopes into the closed set of store events.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use opencode_api::{EventEnvelope, Message, Part, Session};

pub const MESSAGE_UPDATED: &str = "message.updated";
pub const MESSAGE_REMOVED: &str = "message.removed";
pub const PART_UPDATED: &str = "message.part.updated";
pub const SESSION_UPDATED: &str = "session.updated";

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    MessageUpdated { info: Message },
    MessageRemoved { session_id: String, message_id: String },
    PartUpdated { part: Part },
    SessionUpdated { info: Session },
    /// Any event kind the store does not consume; `None` when the envelope had no type.
    Unknown { event_type: Option<String> },
}

impl ServerEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::MessageUpdated { .. } => MESSAGE_UPDATED,
            Self::MessageRemoved { .. } => MESSAGE_REMOVED,
            Self::PartUpdated { .. } => PART_UPDATED,
            Self::SessionUpdated { .. } => SESSION_UPDATED,
            Self::Unknown { event_type } => event_type.as_deref().unwrap_or("<untyped>"),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

#[derive(Debug, Error)]
#[error("malformed '{event_type}' event: {source}")]
pub struct DecodeError {
    pub event_type: &'static str,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: Message,
}

#[derive(Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(rename = "messageID", default)]
    message_id: String,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: Part,
}

#[derive(Deserialize)]
struct SessionUpdatedProps {
    #[serde(alias = "session")]
    info: Session,
}

/// Map one envelope onto a [`ServerEvent`].
///
/// Missing or unrecognized types become [`ServerEvent::Unknown`]; only a
/// recognized type whose properties do not match its shape is an error.
pub fn decode_event(envelope: &EventEnvelope) -> Result<ServerEvent, DecodeError> {
    let Some(event_type) = envelope.event_type.as_deref() else {
        return Ok(ServerEvent::Unknown { event_type: None });
    };

    let event = match event_type {
        MESSAGE_UPDATED => {
            let props: MessageUpdatedProps = props(MESSAGE_UPDATED, &envelope.properties)?;
            ServerEvent::MessageUpdated { info: props.info }
        }
        MESSAGE_REMOVED => {
            let props: MessageRemovedProps = props(MESSAGE_REMOVED, &envelope.properties)?;
            ServerEvent::MessageRemoved {
                session_id: props.session_id,
                message_id: props.message_id,
            }
        }
        PART_UPDATED => {
            let props: PartUpdatedProps = props(PART_UPDATED, &envelope.properties)?;
            ServerEvent::PartUpdated { part: props.part }
        }
        SESSION_UPDATED => {
            let props: SessionUpdatedProps = props(SESSION_UPDATED, &envelope.properties)?;
            ServerEvent::SessionUpdated { info: props.info }
        }
        other => ServerEvent::Unknown {
            event_type: Some(other.to_string()),
        },
    };

    Ok(event)
}

fn props<T>(event_type: &'static str, properties: &Value) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de>,
{
    T::deserialize(properties).map_err(|source| DecodeError { event_type, source })
}
