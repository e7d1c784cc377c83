use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// `GET <url>`: healthy on HTTP 200 with a JSON body whose `status` is `ok`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> bool {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "health request failed");
                return false;
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            return false;
        }
        match resp.json::<Value>().await {
            Ok(body) => is_ok_status(&body),
            Err(_) => false,
        }
    }
}

pub(crate) fn is_ok_status(body: &Value) -> bool {
    body.get("status")
        .and_then(Value::as_str)
        .map(|s| s.eq_ignore_ascii_case("ok"))
        .unwrap_or(false)
}
