//! Notification channels
//!
//! The alert manager depends only on the `Notifier` contract; transports
//! stay behind it. Channels are attempted independently with bounded
//! exponential-backoff retry, so one dead channel never blocks another
//! or alert intake.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use super::Alert;
use crate::config::ChannelConfig;

/// Delivery failure surfaced by a channel
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel rejected alert: status {0}")]
    Rejected(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The dispatch contract every channel implements
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError>;
}

/// Retry budget for one (alert, channel) pair. Both the attempt count and
/// the wall clock are capped so a dead channel cannot accumulate
/// unbounded retry state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based attempt that just failed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        (self.initial_backoff * factor).min(self.max_backoff)
    }
}

/// Writes alerts to stdout
pub struct ConsoleNotifier {
    name: String,
}

impl ConsoleNotifier {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        println!(
            "[{}] {} {} (count {}, confidence {:.2})",
            alert.severity, alert.title, alert.description, alert.occurrence_count,
            alert.combined_confidence
        );
        Ok(())
    }
}

/// Posts the full alert as JSON to an HTTP endpoint
pub struct WebhookNotifier {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Posts a Slack-style message to an incoming webhook
pub struct SlackNotifier {
    name: String,
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(name: &str, webhook_url: &str) -> Self {
        Self {
            name: name.to_string(),
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        let payload = json!({
            "text": format!(
                ":rotating_light: *{}* {}\n{} (seen {}×, confidence {:.2})",
                alert.severity, alert.title, alert.description,
                alert.occurrence_count, alert.combined_confidence
            )
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Build channels from configuration. Disabled entries are skipped;
/// unknown types are warned about and ignored.
pub fn build_channels(configs: &[ChannelConfig]) -> Vec<std::sync::Arc<dyn Notifier>> {
    let mut channels: Vec<std::sync::Arc<dyn Notifier>> = Vec::new();
    for config in configs {
        if !config.enabled {
            continue;
        }
        let name = config.effective_name();
        match config.channel_type.as_str() {
            "console" => channels.push(std::sync::Arc::new(ConsoleNotifier::new(&name))),
            "webhook" => match &config.url {
                Some(url) => {
                    channels.push(std::sync::Arc::new(WebhookNotifier::new(&name, url)))
                }
                None => warn!(channel = %name, "webhook channel without url ignored"),
            },
            "slack" => match &config.url {
                Some(url) => {
                    channels.push(std::sync::Arc::new(SlackNotifier::new(&name, url)))
                }
                None => warn!(channel = %name, "slack channel without url ignored"),
            },
            other => warn!(channel = %name, kind = other, "unknown channel type ignored"),
        }
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            max_elapsed: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(8));
    }

    #[test]
    fn test_build_channels_skips_unknown_and_disabled() {
        let configs = vec![
            ChannelConfig {
                channel_type: "console".to_string(),
                name: None,
                enabled: true,
                url: None,
            },
            ChannelConfig {
                channel_type: "console".to_string(),
                name: Some("off".to_string()),
                enabled: false,
                url: None,
            },
            ChannelConfig {
                channel_type: "pager".to_string(),
                name: None,
                enabled: true,
                url: None,
            },
            ChannelConfig {
                channel_type: "webhook".to_string(),
                name: None,
                enabled: true,
                url: None,
            },
        ];
        let channels = build_channels(&configs);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name(), "console");
    }
}
