// src/plugins/webhook_alert.rs

//! `push_alert_method` implementation that POSTs a JSON payload to a
//! configured webhook URL. Grounded on the `reqwest::Client` usage in
//! cache-fetch origin requests: a bare client, no retry, error text folded
//! into the plugin result rather than propagated as a typed error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::plugin::{Plugin, PluginResult};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    source: &'a str,
    message: &'a str,
}

pub struct WebhookAlertPlugin {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertPlugin {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Plugin for WebhookAlertPlugin {
    fn name(&self) -> &str {
        "webhook_alert"
    }

    /// `args = [message]`.
    async fn run(&self, args: &[String]) -> PluginResult {
        let Some(message) = args.first() else {
            return PluginResult::fail("webhook_alert.run requires a message");
        };
        let payload = WebhookPayload { source: "handyrepd", message };

        let response = self.client.post(&self.url).json(&payload).send().await;
        match response {
            Ok(res) if res.status().is_success() => PluginResult::ok("alert delivered"),
            Ok(res) => PluginResult::fail(format!("webhook responded with {}", res.status())),
            Err(e) => PluginResult::fail(format!("webhook request failed: {e}")),
        }
    }

    async fn test(&self) -> PluginResult {
        if self.url.is_empty() {
            return PluginResult::fail("webhook_alert has no configured url");
        }
        PluginResult::ok("webhook_alert is configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_without_a_message_fails_without_sending() {
        let plugin = WebhookAlertPlugin::new("http://127.0.0.1:1/unused");
        let result = plugin.run(&[]).await;
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn test_hook_rejects_empty_url() {
        let plugin = WebhookAlertPlugin::new("");
        let result = plugin.test().await;
        assert!(!result.ok);
    }
}
