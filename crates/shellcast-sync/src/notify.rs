use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::config::NotificationConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub region: String,
    pub subject: String,
    pub message: String,
}

impl Notification {
    pub fn failure(region: &str, message: impl Into<String>) -> Self {
        Self {
            region: region.to_string(),
            subject: format!("ShellCast {} pipeline failed", region.to_uppercase()),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        error!(
            region = %notification.region,
            subject = %notification.subject,
            "{}",
            notification.message
        );
        Ok(())
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .with_context(|| format!("posting notification to {}", self.url))?
            .error_for_status()
            .context("notification webhook rejected the request")?;
        Ok(())
    }
}

pub fn notifier_from_config(config: &NotificationConfig) -> Result<Box<dyn Notifier>> {
    Ok(match config {
        NotificationConfig::Log => Box::new(LogNotifier),
        NotificationConfig::Webhook { url, timeout_secs } => Box::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_notifications_name_the_region() {
        let n = Notification::failure("nc", "freshness_check: grid files carry 2 dates");
        assert_eq!(n.subject, "ShellCast NC pipeline failed");
        assert_eq!(
            serde_json::to_value(&n).expect("json")["region"],
            serde_json::json!("nc")
        );
    }

    #[tokio::test]
    async fn unreachable_webhooks_surface_an_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_secs(5)).expect("client");
        let result = notifier.notify(&Notification::failure("sc", "boom")).await;
        assert!(result.is_err());
    }
}
