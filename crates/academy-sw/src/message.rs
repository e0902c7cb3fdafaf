//! Page ⇄ worker message shapes.
//!
//! ```text
//! page → worker   { "type": "SKIP_WAITING" }
//!                 { "type": "GET_VERSION" }   reply: { "version": "v1.0.1" }
//!                 { "type": "CLEAR_CACHE" }   reply: { "success": true }
//! worker → pages  { "type": "CACHE_UPDATED", "version": "v1.0.1", "action": "CLEAR_STORAGE" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::debug;

/// A control request posted by a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Ask for the worker version.
    GetVersion,
    /// Delete every cache namespace.
    ClearCache,
}

impl ControlMessage {
    /// Parse a posted message. Unknown or malformed messages yield `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        match serde_json::from_value(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(%data, error = %e, "Ignoring unrecognized message");
                None
            }
        }
    }
}

/// Answer sent back on a reply port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version { version: String },
    Cleared { success: bool },
}

/// The single-use reply channel that travels with a message.
#[derive(Debug)]
pub struct ReplyPort(oneshot::Sender<ControlReply>);

impl ReplyPort {
    /// Create a port and the page-side receiver.
    pub fn channel() -> (Self, oneshot::Receiver<ControlReply>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Post the reply. Returns `false` if the page stopped listening.
    pub fn post(self, reply: ControlReply) -> bool {
        self.0.send(reply).is_ok()
    }
}

/// What a page should do with its own persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageAction {
    ClearStorage,
}

/// Worker-initiated notice pushed to pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    CacheUpdated {
        version: String,
        action: StorageAction,
    },
}

impl ClientMessage {
    pub fn cache_updated(version: impl Into<String>) -> Self {
        Self::CacheUpdated {
            version: version.into(),
            action: StorageAction::ClearStorage,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
