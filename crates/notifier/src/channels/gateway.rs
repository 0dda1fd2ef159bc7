use std::time::Duration;

use crate::error::DeliveryError;

/// HTTP client for one provider gateway.
///
/// Without a URL the client runs as a development sink: payloads are logged
/// and reported as delivered.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl GatewayClient {
    pub fn new(
        url: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
            api_key,
        })
    }

    /// A client with no gateway configured.
    pub fn log_only() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: None,
            api_key: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// POST `payload` and require a 2xx answer.
    pub async fn post(&self, payload: &serde_json::Value) -> Result<(), DeliveryError> {
        let Some(url) = &self.url else {
            tracing::info!(payload = %payload, "No gateway configured, message logged only");
            return Ok(());
        };

        let mut request = self.client.post(url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Gateway {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
