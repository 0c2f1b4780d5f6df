//! Outbound messaging exchanges and the email helper.
//!
//! Lifecycle events go out on two exchanges with identical payloads: the
//! generic notifications exchange and the integrations exchange. The
//! exchanges themselves live behind the notifications web API; the core
//! only publishes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Settings;
use crate::error::Result;

/// An outbound messaging exchange.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, message: Value) -> Result<()>;
}

/// Exchange reached through the notifications web API.
pub struct HttpExchange {
    client: reqwest::Client,
    url: String,
    token: String,
    name: String,
}

impl HttpExchange {
    pub fn new(base_url: &str, token: &str, name: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}publish", ensure_trailing_slash(base_url)),
            token: token.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: Value) -> Result<()> {
        self.client
            .post(&self.url)
            .header("Authorization", format!("token: {}", self.token))
            .json(&json!({"exchange": self.name, "message": message}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// In-memory exchange for tests.
#[derive(Clone, Default)]
pub struct MemoryExchange {
    name: String,
    messages: Arc<std::sync::Mutex<Vec<Value>>>,
}

impl MemoryExchange {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Arc::default(),
        }
    }

    pub fn messages(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: Value) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// The pair of exchanges every lifecycle event is published on.
#[derive(Clone)]
pub struct Exchanges {
    notifications: Arc<dyn Exchange>,
    integrations_notifications: Arc<dyn Exchange>,
}

impl Exchanges {
    pub fn new(
        notifications: Arc<dyn Exchange>,
        integrations_notifications: Arc<dyn Exchange>,
    ) -> Self {
        Self {
            notifications,
            integrations_notifications,
        }
    }

    /// Exchanges backed by the notifications web API.
    pub fn http(settings: &Settings) -> Self {
        Self::new(
            Arc::new(HttpExchange::new(
                &settings.notifications_api_url,
                &settings.notifications_api_token,
                "notifications",
            )),
            Arc::new(HttpExchange::new(
                &settings.notifications_api_url,
                &settings.notifications_api_token,
                "integrations_notifications",
            )),
        )
    }

    /// In-memory exchanges for tests. Returns the pair plus handles to
    /// inspect what was published on each.
    pub fn in_memory() -> (Self, MemoryExchange, MemoryExchange) {
        let notifications = MemoryExchange::new("notifications");
        let integrations = MemoryExchange::new("integrations_notifications");
        (
            Self::new(Arc::new(notifications.clone()), Arc::new(integrations.clone())),
            notifications,
            integrations,
        )
    }

    /// Publishes the same payload on both exchanges. Publication failures
    /// are logged and swallowed; they never affect build state.
    pub async fn publish(&self, message: Value) {
        for exchange in [&self.notifications, &self.integrations_notifications] {
            if let Err(e) = exchange.publish(message.clone()).await {
                tracing::error!("Failed to publish on {}: {}", exchange.name(), e);
            }
        }
    }
}

/// Sends an email through the notifications web api.
pub async fn send_email(
    settings: &Settings,
    recipients: &[String],
    subject: &str,
    message: &str,
) -> Result<bool> {
    let url = format!(
        "{}send-email",
        ensure_trailing_slash(&settings.notifications_api_url)
    );
    let body = json!({
        "recipients": recipients,
        "subject": subject,
        "message": message,
    });

    reqwest::Client::new()
        .post(&url)
        .header(
            "Authorization",
            format!("token: {}", settings.notifications_api_token),
        )
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    Ok(true)
}

fn ensure_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_hits_both_exchanges() {
        let (exchanges, notifications, integrations) = Exchanges::in_memory();
        let msg = json!({"event_type": "build-started", "uuid": "x"});

        exchanges.publish(msg.clone()).await;

        assert_eq!(notifications.messages(), vec![msg.clone()]);
        assert_eq!(integrations.messages(), vec![msg]);
    }

    #[test]
    fn test_ensure_trailing_slash() {
        assert_eq!(ensure_trailing_slash("http://x/"), "http://x/");
        assert_eq!(ensure_trailing_slash("http://x"), "http://x/");
    }
}
