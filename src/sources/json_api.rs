use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::{RecordSource, SourceError};

/// Any JSON endpoint returning an array of records, optionally nested.
///
/// `records_path` is dotted (`pairs`, `data`); empty means the body itself.
/// Covers pump.fun's token list, Dexscreener searches and GeckoTerminal pools.
pub struct JsonApiSource {
    name: String,
    url: String,
    records_path: String,
    timeout: Duration,
    client: Client,
}

impl JsonApiSource {
    pub fn new(name: &str, url: &str, records_path: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pump-watch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            records_path: records_path.to_string(),
            timeout,
            client,
        })
    }

    fn network_error(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

/// Pull the record array out of a decoded response body.
pub fn records_at(body: Value, records_path: &str) -> Result<Vec<Value>, SourceError> {
    let target = if records_path.trim().is_empty() {
        body
    } else {
        let pointer = format!("/{}", records_path.trim().replace('.', "/"));
        match body.pointer(&pointer) {
            // Dexscreener returns `"pairs": null` for empty searches.
            Some(Value::Null) => return Ok(vec![]),
            Some(v) => v.clone(),
            None => {
                return Err(SourceError::Parse(format!("no '{}' in response", records_path)));
            }
        }
    };

    match target {
        Value::Array(items) => Ok(items),
        other => Err(SourceError::Parse(format!(
            "expected array at '{}', got {}",
            records_path,
            type_name(&other)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl RecordSource for JsonApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        let resp = self.client.get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body: Value = resp.json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        records_at(body, &self.records_path)
    }
}
