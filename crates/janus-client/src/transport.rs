use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::error::{JanusError, JanusResult};

/// JSON-over-HTTP requests against the gateway.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn post(&self, url: &str, body: &Value) -> JanusResult<Value>;

    /// Long-poll GET; may be held open by the gateway until an event arrives.
    async fn get(&self, url: &str, query: &[(&str, String)]) -> JanusResult<Value>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    request_timeout: Duration,
    poll_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, poll_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            request_timeout,
            poll_timeout,
        }
    }
}

#[async_trait]
impl SignalingTransport for HttpTransport {
    async fn post(&self, url: &str, body: &Value) -> JanusResult<Value> {
        trace!(target = "janus::transport", %url, "POST");
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        decode_body(response).await
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> JanusResult<Value> {
        trace!(target = "janus::transport", %url, "GET");
        let response = self
            .http
            .get(url)
            .timeout(self.poll_timeout)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        decode_body(response).await
    }
}

async fn decode_body(response: reqwest::Response) -> JanusResult<Value> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|err| JanusError::Protocol {
        reason: format!("gateway reply is not json: {err}"),
        envelope: Value::String(text),
    })
}
