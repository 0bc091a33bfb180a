use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{Map, Value};
use tracing::debug;
use tsk_reconcile::normalizer::CORRELATION_FIELD;
use tsk_reconcile::{CorrelationToken, Fields};

use crate::{MutationTransport, TransportError, CORRELATION_HEADER};

/// REST mutation transport against `{base_url}/api/tasks`.
///
/// The bearer credential is handed in by the caller; do not log it.
#[derive(Debug, Clone)]
pub struct HttpMutationTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMutationTransport {
    pub fn new(
        base_url: impl Into<String>,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = bearer {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::Config("bearer credential is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/api/tasks", self.base_url.trim_end_matches('/'))
    }

    fn item_url(&self, identity: &str) -> String {
        format!("{}/{}", self.collection_url(), identity)
    }
}

/// Decode a response: non-2xx becomes `Rejected`, an empty 2xx body `Null`.
async fn read_body(resp: reqwest::Response) -> Result<Value, TransportError> {
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        return Err(TransportError::rejected(
            status.as_u16(),
            error_message(&text).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            }),
        ));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
}

/// `message` or `error` from a JSON error body, or a short plain-text body.
fn error_message(body: &str) -> Option<String> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        return ["message", "error"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string);
    }
    let trimmed = body.trim();
    (!trimmed.is_empty() && trimmed.len() <= 200).then(|| trimmed.to_string())
}

fn create_body(token: &CorrelationToken, fields: &Fields) -> Value {
    let mut body: Map<String, Value> = fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    body.insert(
        CORRELATION_FIELD.to_string(),
        Value::String(token.as_str().to_string()),
    );
    Value::Object(body)
}

#[async_trait]
impl MutationTransport for HttpMutationTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn submit_create(
        &self,
        token: &CorrelationToken,
        fields: &Fields,
    ) -> Result<Value, TransportError> {
        debug!(token = %token, "POST task");
        let resp = self
            .http
            .post(self.collection_url())
            .header(CORRELATION_HEADER, token.as_str())
            .json(&create_body(token, fields))
            .send()
            .await?;
        read_body(resp).await
    }

    async fn submit_update(&self, identity: &str, fields: &Fields) -> Result<Value, TransportError> {
        debug!(identity, "PUT task");
        let resp = self
            .http
            .put(self.item_url(identity))
            .json(fields)
            .send()
            .await?;
        read_body(resp).await
    }

    async fn submit_delete(&self, identity: &str) -> Result<(), TransportError> {
        debug!(identity, "DELETE task");
        let resp = self.http.delete(self.item_url(identity)).send().await?;
        read_body(resp).await.map(|_| ())
    }

    async fn fetch_all(&self) -> Result<Value, TransportError> {
        let resp = self.http.get(self.collection_url()).send().await?;
        read_body(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_json_fields() {
        assert_eq!(
            error_message(r#"{"message":"Task not found"}"#).as_deref(),
            Some("Task not found")
        );
        assert_eq!(
            error_message(r#"{"error":"Unauthorized"}"#).as_deref(),
            Some("Unauthorized")
        );
        assert_eq!(error_message("Bad Gateway").as_deref(), Some("Bad Gateway"));
        assert_eq!(error_message(""), None);
        assert_eq!(error_message(r#"{"code":7}"#), None);
    }

    #[test]
    fn create_body_carries_token() {
        let mut fields = Fields::new();
        fields.insert("title".into(), Value::String("Buy milk".into()));
        let body = create_body(&CorrelationToken::new("T1"), &fields);
        assert_eq!(
            body,
            serde_json::json!({"title": "Buy milk", "correlationToken": "T1"})
        );
    }

    #[test]
    fn urls_tolerate_trailing_slash() {
        let t = HttpMutationTransport::with_client(reqwest::Client::new(), "http://h:1/");
        assert_eq!(t.collection_url(), "http://h:1/api/tasks");
        assert_eq!(t.item_url("srv-1"), "http://h:1/api/tasks/srv-1");
    }
}
