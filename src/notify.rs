//! Push payloads to user notifications, and activation back to the foreground.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Push message body as delivered by the push service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub data: Option<Value>,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  pub tag: Option<String>,
  #[serde(default)]
  pub require_interaction: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub url: Option<String>,
}

/// A notification ready to be shown.
pub type Notification = PushPayload;

/// Where notifications are displayed.
pub trait NotificationSink: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
}

/// Messages sent to the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForegroundMessage {
  /// Focus an open client on this URL, or open one
  Navigate(String),
}

pub struct NotificationBridge<S: NotificationSink> {
  sink: S,
  foreground: mpsc::UnboundedSender<ForegroundMessage>,
}

impl<S: NotificationSink> NotificationBridge<S> {
  pub fn new(sink: S, foreground: mpsc::UnboundedSender<ForegroundMessage>) -> Self {
    Self { sink, foreground }
  }

  /// Parse a push message and show it.
  pub fn receive(&self, raw: &[u8]) -> Result<Notification> {
    let payload: PushPayload =
      serde_json::from_slice(raw).map_err(|e| eyre!("Invalid push payload: {}", e))?;
    self.sink.show(&payload)?;
    Ok(payload)
  }

  /// Route a click to the foreground. `action` is the clicked action, or
  /// `None` for the notification body; either resolves to a URL through the
  /// action's `url` or `data.url`. Returns the URL navigated to.
  pub fn activate(&self, notification: &Notification, action: Option<&str>) -> Option<String> {
    let from_action = action.and_then(|name| {
      notification
        .actions
        .iter()
        .find(|a| a.action == name)
        .and_then(|a| a.url.clone())
    });

    let url = from_action.or_else(|| {
      notification
        .data
        .as_ref()
        .and_then(|d| d.get("url"))
        .and_then(Value::as_str)
        .map(String::from)
    })?;

    debug!(url = %url, "notification activated");
    self
      .foreground
      .send(ForegroundMessage::Navigate(url.clone()))
      .ok()?;
    Some(url)
  }
}
