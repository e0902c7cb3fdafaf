//! Push payloads and the notifications they produce.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clients::{ClientConnection, ClientId};
use crate::config::NotificationConfig;

/// Action that opens the target page.
pub const ACTION_EXPLORE: &str = "explore";
/// Action that only dismisses the notification.
pub const ACTION_CLOSE: &str = "close";

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Data attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Page opened on click.
    pub url: String,
}

/// A notification to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

/// Fields a push sender may override.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
    title: Option<String>,
    body: Option<String>,
    url: Option<String>,
    icon: Option<String>,
}

impl PushPayload {
    /// JSON objects override fields; any other non-empty text becomes the body.
    fn parse(payload: &[u8]) -> Self {
        if let Ok(parsed) = serde_json::from_slice::<PushPayload>(payload) {
            return parsed;
        }
        let text = String::from_utf8_lossy(payload).trim().to_string();
        debug!(bytes = payload.len(), "Push payload is not JSON, using it as body");
        Self {
            body: (!text.is_empty()).then_some(text),
            ..Default::default()
        }
    }
}

impl Notification {
    /// Build the notification for a push event.
    pub fn from_push(payload: Option<&[u8]>, defaults: &NotificationConfig) -> Self {
        let payload = payload.map(PushPayload::parse).unwrap_or_default();
        Self {
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            body: payload.body.unwrap_or_else(|| defaults.body.clone()),
            icon: payload.icon.unwrap_or_else(|| defaults.icon.clone()),
            badge: defaults.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data: NotificationData {
                url: payload.url.unwrap_or_else(|| "/".to_string()),
            },
            actions: vec![
                NotificationAction {
                    action: ACTION_EXPLORE.to_string(),
                    title: "View".to_string(),
                },
                NotificationAction {
                    action: ACTION_CLOSE.to_string(),
                    title: "Close".to_string(),
                },
            ],
        }
    }
}

/// What a notification click did.
#[derive(Debug)]
pub enum NotificationClickOutcome {
    /// The close action was chosen.
    Dismissed,
    /// An open window already showed the target and was focused.
    Focused(ClientId),
    /// A new window was opened.
    Opened(ClientConnection),
}
