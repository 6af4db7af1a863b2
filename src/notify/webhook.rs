use super::{Notifier, PipelineNotification};
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::Duration;

/// POSTs each notification as JSON to a fixed URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    async fn post(&self, n: &PipelineNotification) -> Result<()> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(n)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &PipelineNotification) -> Result<()> {
        self.post(n).await
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;

    #[tokio::test]
    async fn unreachable_endpoint_fails_after_retries() {
        let hook = WebhookNotifier::new("http://127.0.0.1:9/hook".into())
            .with_timeout(1)
            .with_retries(1);
        let n = PipelineNotification::CorrelationCreated {
            user_id: "u1".into(),
            correlation_id: "g1".into(),
            strength: 0.8,
            platforms: vec![Platform::Chat],
        };
        assert!(hook.notify(&n).await.is_err());
    }
}
