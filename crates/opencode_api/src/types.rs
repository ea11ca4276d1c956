//! Wire types shared by the REST endpoints and the event stream.
//!
//! Identifier fields default to the empty string when absent so a single
//! malformed record can be rejected by the consumer instead of failing the
//! whole payload. Fields the viewer does not interpret are kept in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

/// One conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn new(id: impl Into<String>, title: impl Into<String>, updated: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            time: SessionTime {
                created: updated,
                updated,
            },
            parent_id: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// One turn in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            time: MessageTime::default(),
            error: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Discriminated payload of a message part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartKind {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    File {
        #[serde(default)]
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default)]
        url: String,
    },
    Tool {
        #[serde(rename = "callID", default)]
        call_id: String,
        #[serde(default)]
        tool: String,
        #[serde(default)]
        state: ToolState,
    },
    StepStart,
    StepFinish {
        #[serde(default)]
        cost: f64,
    },
    Snapshot {
        #[serde(default)]
        snapshot: String,
    },
    Patch {
        #[serde(default)]
        hash: String,
        #[serde(default)]
        files: Vec<String>,
    },
    Agent {
        #[serde(default)]
        name: String,
    },
    /// Part type this client does not render.
    #[serde(other)]
    Other,
}

/// Incremental content fragment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    pub fn text(
        id: impl Into<String>,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            message_id: message_id.into(),
            kind: PartKind::Text {
                text: text.into(),
                synthetic: false,
            },
        }
    }
}

/// Message paired with its ordered parts, as returned by the messages endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: Message,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Raw `{ type, properties }` envelope carried by one SSE frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub properties: Value,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: Some(event_type.into()),
            properties,
        }
    }
}
