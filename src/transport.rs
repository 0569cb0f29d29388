use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::GraphQLRequest;
use crate::error::TransportError;

/// Sends one GraphQL request to an upstream and returns its JSON body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, url: &str, request: &GraphQLRequest) -> Result<Value, TransportError>;
}

/// GraphQL-over-HTTP POST using a shared connection pool.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, url: &str, request: &GraphQLRequest) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response.json::<Value>().await?;
        if !body.is_object() {
            return Err(TransportError::Decode(
                "expected a JSON object".to_string(),
            ));
        }
        Ok(body)
    }
}
