//! Failure alerting
//!
//! Every failed run is reported to each configured [`Alerter`]. Delivery is
//! best effort: a failing alerter is logged and never changes the outcome
//! of the run it reports on.

use crate::error::{EtlError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// One `alerting:` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlerterConfig {
    Log,
    /// Slack-compatible incoming webhook
    #[serde(alias = "slack")]
    Webhook {
        url: String,
        #[serde(default)]
        channel: Option<String>,
    },
}

impl AlerterConfig {
    pub fn validate(&self) -> Result<()> {
        if let AlerterConfig::Webhook { url, .. } = self {
            url::Url::parse(url)
                .map_err(|e| EtlError::config(format!("invalid alerting webhook URL: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub dataset: String,
    pub run_id: Uuid,
    pub stage: String,
    pub kind: String,
    pub message: String,
}

impl Alert {
    pub fn subject(&self) -> String {
        format!("PMDA ETL run failed: {}", self.dataset)
    }

    pub fn body(&self) -> String {
        format!(
            "Run {} failed during {} ({}): {}",
            self.run_id, self.stage, self.kind, self.message
        )
    }
}

#[async_trait]
pub trait Alerter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Writes the alert as a structured error event
#[derive(Debug, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        error!(
            dataset = %alert.dataset,
            run_id = %alert.run_id,
            stage = %alert.stage,
            kind = %alert.kind,
            "ALERT - {}: {}",
            alert.subject(),
            alert.message
        );
        Ok(())
    }
}

/// Posts `{"text": ...}` to an incoming webhook
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
    channel: Option<String>,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>, channel: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .map_err(|e| EtlError::config(format!("cannot build webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            channel,
        })
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut payload = serde_json::json!({
            "text": format!("*{}*\n\n{}", alert.subject(), alert.body()),
        });
        if let Some(channel) = &self.channel {
            payload["channel"] = serde_json::Value::String(channel.clone());
        }

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EtlError::fetch(&self.url, e.to_string(), false))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EtlError::fetch(
                &self.url,
                format!("webhook answered {status}"),
                false,
            ));
        }
        Ok(())
    }
}

/// Fans an alert out to every configured alerter
#[derive(Default)]
pub struct AlertManager {
    alerters: Vec<Box<dyn Alerter>>,
}

impl AlertManager {
    pub fn new(alerters: Vec<Box<dyn Alerter>>) -> Self {
        Self { alerters }
    }

    pub fn from_config(configs: &[AlerterConfig]) -> Result<Self> {
        let mut alerters: Vec<Box<dyn Alerter>> = Vec::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            match config {
                AlerterConfig::Log => alerters.push(Box::new(LogAlerter)),
                AlerterConfig::Webhook { url, channel } => {
                    alerters.push(Box::new(WebhookAlerter::new(url.clone(), channel.clone())?))
                }
            }
        }
        Ok(Self::new(alerters))
    }

    pub fn len(&self) -> usize {
        self.alerters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerters.is_empty()
    }

    pub async fn notify(&self, alert: &Alert) {
        if self.alerters.is_empty() {
            debug!(dataset = %alert.dataset, "No alerters configured, skipping alert");
            return;
        }

        for alerter in &self.alerters {
            if let Err(e) = alerter.send(alert).await {
                warn!(
                    alerter = alerter.name(),
                    dataset = %alert.dataset,
                    error = %e,
                    "Failed to deliver alert"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        Alert {
            dataset: "approvals".into(),
            run_id: Uuid::nil(),
            stage: "fetching".into(),
            kind: "fetch_error".into(),
            message: "503 Service Unavailable".into(),
        }
    }

    #[test]
    fn test_alerting_config() {
        let configs: Vec<AlerterConfig> = serde_yaml::from_str(
            "- type: log\n- type: slack\n  url: https://hooks.example.org/T000\n  channel: '#etl'\n",
        )
        .unwrap();
        assert_eq!(configs[0], AlerterConfig::Log);
        assert!(matches!(&configs[1], AlerterConfig::Webhook { channel: Some(c), .. } if c == "#etl"));

        let manager = AlertManager::from_config(&configs).unwrap();
        assert_eq!(manager.len(), 2);

        let bad = AlerterConfig::Webhook {
            url: "not a url".into(),
            channel: None,
        };
        assert!(AlertManager::from_config(&[bad]).is_err());
    }

    #[tokio::test]
    async fn test_webhook_posts_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({"channel": "#etl"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let alerter =
            WebhookAlerter::new(format!("{}/hook", server.uri()), Some("#etl".into())).unwrap();
        alerter.send(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let webhook = WebhookAlerter::new(server.uri(), None).unwrap();
        assert!(webhook.send(&alert()).await.is_err());

        let manager = AlertManager::new(vec![Box::new(LogAlerter)]);
        manager.notify(&alert()).await;
    }
}
