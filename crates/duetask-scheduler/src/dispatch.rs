//! Notification dispatch — actually sends push messages to users.
//!
//! [`Notifier`] is the best-effort boundary: channel errors are logged here
//! and never reach the caller. [`PushChannel`] is the seam to the remote API;
//! [`OneSignalChannel`] implements it over HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duetask_core::config::PushConfig;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::notify::NotificationMessage;

/// A remote push notification API.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Send one message to one recipient.
    async fn send(&self, message: &NotificationMessage) -> Result<(), ChannelError>;
}

/// OneSignal-style push API over HTTP.
pub struct OneSignalChannel {
    endpoint: String,
    app_id: String,
    authorization: String,
    client: reqwest::Client,
}

impl OneSignalChannel {
    /// Build the channel; the HTTP client carries the configured timeout and
    /// redirect limit.
    pub fn new(config: &PushConfig) -> Result<Self, ChannelError> {
        if !config.is_configured() {
            return Err(ChannelError::NotConfigured("push.api_key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            app_id: config.app_id.clone(),
            authorization: format!("{} {}", config.auth_scheme, config.api_key),
            client,
        })
    }

    /// Request body for one message. Built per call.
    fn payload(&self, message: &NotificationMessage) -> serde_json::Value {
        json!({
            "app_id": self.app_id,
            "include_aliases": {
                "external_id": [message.recipient_user_id],
            },
            "target_channel": "push",
            "contents": { "en": message.body },
        })
    }
}

#[async_trait]
impl PushChannel for OneSignalChannel {
    fn name(&self) -> &'static str {
        "onesignal"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&self.payload(message))
            .send()
            .await?;

        if resp.status().is_success() {
            debug!(recipient = %message.recipient_user_id, "Push notification accepted");
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(ChannelError::Rejected { status, body })
        }
    }
}

/// Channel that keeps messages in memory instead of sending them.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<NotificationMessage>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages accepted so far.
    pub fn messages(&self) -> Vec<NotificationMessage> {
        self.sent.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PushChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Other("recording channel set to fail".into()));
        }
        self.sent
            .lock()
            .map_err(|_| ChannelError::Other("recording channel lock poisoned".into()))?
            .push(message.clone());
        Ok(())
    }
}

/// Best-effort notification dispatcher.
pub struct Notifier {
    channel: Option<Arc<dyn PushChannel>>,
}

impl Notifier {
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    /// A notifier that drops every message.
    pub const fn disabled() -> Self {
        Self { channel: None }
    }

    /// OneSignal when a credential is configured, disabled otherwise.
    pub fn from_config(config: &PushConfig) -> Result<Self, ChannelError> {
        if !config.is_configured() {
            info!("Push notifications disabled (no API key configured)");
            return Ok(Self::disabled());
        }
        let channel = OneSignalChannel::new(config)?;
        info!(endpoint = %config.endpoint, "Push notifications enabled");
        Ok(Self::new(Arc::new(channel)))
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// Send `body` to `user_id`. Returns whether the channel accepted it;
    /// failures are logged, never propagated.
    pub async fn dispatch(&self, user_id: &str, body: String) -> bool {
        let Some(channel) = &self.channel else {
            debug!(recipient = %user_id, "Notifications disabled, dropping message");
            return false;
        };

        let message = NotificationMessage::new(user_id, body);
        match channel.send(&message).await {
            Ok(()) => {
                debug!(channel = channel.name(), recipient = %user_id, "Notification sent");
                true
            }
            Err(e) => {
                warn!(
                    channel = channel.name(),
                    recipient = %user_id,
                    error = %e,
                    "Failed to send notification"
                );
                false
            }
        }
    }

    /// Fire-and-forget variant of [`Notifier::dispatch`]; requires a tokio
    /// runtime. The handle may be dropped.
    pub fn dispatch_detached(self: &Arc<Self>, user_id: &str, body: String) -> JoinHandle<bool> {
        let notifier = Arc::clone(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move { notifier.dispatch(&user_id, body).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn push_config(endpoint: String) -> PushConfig {
        PushConfig {
            endpoint,
            app_id: "app-123".into(),
            api_key: "secret".into(),
            ..PushConfig::default()
        }
    }

    #[tokio::test]
    async fn test_onesignal_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/notifications"))
            .and(header("authorization", "Basic secret"))
            .and(body_json(json!({
                "app_id": "app-123",
                "include_aliases": { "external_id": ["user-1"] },
                "target_channel": "push",
                "contents": { "en": "hello" },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "n1"})))
            .expect(1)
            .mount(&server)
            .await;

        let channel =
            OneSignalChannel::new(&push_config(format!("{}/api/v1/notifications", server.uri())))
                .unwrap();
        channel
            .send(&NotificationMessage::new("user-1", "hello".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_onesignal_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid app_id"))
            .mount(&server)
            .await;

        let channel = OneSignalChannel::new(&push_config(server.uri())).unwrap();
        let err = channel
            .send(&NotificationMessage::new("user-1", "hello".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_notifier_swallows_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = Notifier::from_config(&push_config(server.uri())).unwrap();
        assert!(notifier.is_enabled());
        assert!(!notifier.dispatch("user-1", "hello".into()).await);
    }

    #[test]
    fn test_unconfigured_push_is_disabled() {
        let notifier = Notifier::from_config(&PushConfig::default()).unwrap();
        assert!(!notifier.is_enabled());
        assert!(OneSignalChannel::new(&PushConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_fresh_message_per_dispatch() {
        let channel = Arc::new(RecordingChannel::new());
        let notifier = Notifier::new(channel.clone());
        notifier.dispatch("u1", "first".into()).await;
        notifier.dispatch("u2", "second".into()).await;

        let sent = channel.messages();
        assert_eq!(sent[0], NotificationMessage::new("u1", "first".into()));
        assert_eq!(sent[1], NotificationMessage::new("u2", "second".into()));
    }

    #[tokio::test]
    async fn test_detached_dispatch_reports_acceptance() {
        let channel = Arc::new(RecordingChannel::new());
        let notifier = Arc::new(Notifier::new(channel.clone()));
        assert!(notifier.dispatch_detached("u1", "x".into()).await.unwrap());
        assert_eq!(channel.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_recording_channel_failure_is_swallowed() {
        let channel = Arc::new(RecordingChannel::new());
        channel.set_failing(true);
        let notifier = Notifier::new(channel.clone());
        assert!(!notifier.dispatch("u1", "x".into()).await);
        assert!(channel.messages().is_empty());
    }
}
