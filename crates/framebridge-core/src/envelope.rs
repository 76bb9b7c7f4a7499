//! Wire envelope exchanged between host and guest.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_millis;

/// Envelope identifier, unique per sending messenger.
pub type MessageId = String;

/// Which side of the channel a messenger speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The outer page that embeds the guest document.
    Host,
    /// The embedded document.
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
        }
    }
}

/// Top-level message category. Actions are scoped to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Navigation,
    State,
    Auth,
    Data,
    Ui,
    Error,
    Lifecycle,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Navigation => "navigation",
            Self::State => "state",
            Self::Auth => "auth",
            Self::Data => "data",
            Self::Ui => "ui",
            Self::Error => "error",
            Self::Lifecycle => "lifecycle",
        };
        f.write_str(name)
    }
}

/// Standard action vocabulary.
pub mod actions {
    /// `navigation/*` actions.
    pub mod navigation {
        pub const NAVIGATE_TO: &str = "navigate_to";
        pub const GO_BACK: &str = "go_back";
        pub const RELOAD: &str = "reload";
        pub const CLOSE: &str = "close";
    }

    /// `state/*` actions.
    pub mod state {
        pub const SYNC: &str = "sync";
        pub const UPDATE: &str = "update";
        pub const REQUEST: &str = "request";
        pub const RESET: &str = "reset";
    }

    /// `ui/*` actions.
    pub mod ui {
        pub const RESIZE: &str = "resize";
        pub const FOCUS: &str = "focus";
        pub const BLUR: &str = "blur";
        pub const MODAL_OPEN: &str = "modal_open";
        pub const MODAL_CLOSE: &str = "modal_close";
    }

    /// `data/*` actions.
    pub mod data {
        pub const REQUEST: &str = "request";
        pub const UPDATE: &str = "update";
    }
}

/// The atomic unit of communication.
///
/// Flat and JSON-compatible; never mutated after it is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: MessageId,
    pub category: Category,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    /// Send time in milliseconds since the Unix epoch.
    pub sent_at: i64,
    #[serde(default)]
    pub requires_response: bool,
    /// Id of the envelope this one replies to. Present only on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<MessageId>,
    pub sender: Role,
    /// Origin the receiver should observe this envelope arriving from.
    pub expected_origin: String,
}

impl Envelope {
    /// Build a request or notification envelope with a fresh id.
    #[must_use]
    pub fn new(
        sender: Role,
        expected_origin: impl Into<String>,
        category: Category,
        action: impl Into<String>,
        data: Value,
        requires_response: bool,
    ) -> Self {
        Self {
            id: generate_id(),
            category,
            action: action.into(),
            data,
            sent_at: now_millis(),
            requires_response,
            response_to: None,
            sender,
            expected_origin: expected_origin.into(),
        }
    }

    /// Build a reply to `original`. Replies reuse the original category and action.
    #[must_use]
    pub fn reply(
        sender: Role,
        expected_origin: impl Into<String>,
        original: &Self,
        data: Value,
    ) -> Self {
        let mut reply = Self::new(
            sender,
            expected_origin,
            original.category,
            original.action.clone(),
            data,
            false,
        );
        reply.response_to = Some(original.id.clone());
        reply
    }

    /// Whether this envelope answers an earlier request.
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.response_to.is_some()
    }
}

/// Generate a time + random composite id.
///
/// Unique enough within the lifetime of one channel; not globally unique.
#[must_use]
pub fn generate_id() -> MessageId {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", now_millis(), &random[..9])
}

/// Error body carried inside an [`ErrorPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Explicit error reply sent instead of letting the caller time out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPayload {
    pub error: ErrorBody,
}

impl ErrorPayload {
    pub const NO_HANDLER: &'static str = "no_handler";
    pub const HANDLER_FAILED: &'static str = "handler_failed";

    /// Create a payload with the given code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    /// No handler was registered for the request.
    #[must_use]
    pub fn no_handler(category: Category, action: &str) -> Self {
        Self::new(
            Self::NO_HANDLER,
            format!("No handler found for {category}/{action}"),
        )
    }

    /// The handler ran but failed.
    #[must_use]
    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::new(Self::HANDLER_FAILED, message)
    }

    /// Recognise an error payload inside a reply body.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.get("error").is_some_and(Value::is_object) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Convert into a JSON value for the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "error": { "code": self.error.code, "message": self.error.message }
        })
    }
}
