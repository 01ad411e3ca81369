use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tracing::instrument;

use beacon_core::{DispatchMeta, Request, RequestKind, SdkError, ServerResponse, Transport};

pub const DEFAULT_API_URL: &str = "https://api.beacon.test";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-over-HTTPS transport.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    sdk_key: SecretString,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, sdk_key: SecretString) -> Result<Self, SdkError> {
        Self::with_connect_timeout(base_url, sdk_key, CONNECT_TIMEOUT)
    }

    /// Per-attempt deadlines are enforced by the dispatcher; this only
    /// bounds connection setup.
    pub fn with_connect_timeout(
        base_url: &str,
        sdk_key: SecretString,
        connect_timeout: Duration,
    ) -> Result<Self, SdkError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SdkError::InvalidState(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            sdk_key,
            connect_timeout,
        })
    }

    /// Only a timeout during connection setup has a known deadline.
    fn classify(&self, e: reqwest::Error) -> SdkError {
        if e.is_timeout() && e.is_connect() {
            SdkError::Timeout(self.connect_timeout)
        } else {
            SdkError::NetworkFailure(e.to_string())
        }
    }

    pub fn url_for(&self, request: &Request) -> String {
        format!("{}/{}", self.base_url, request.path().trim_start_matches('/'))
    }

    /// Request body: the payload fields plus the SDK key and idempotence key.
    pub fn body_for(&self, request: &Request, meta: DispatchMeta) -> Value {
        let payload = match request.kind {
            RequestKind::Generic => request.payload.get("body").cloned().unwrap_or(Value::Null),
            _ => request.payload.clone(),
        };
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        body.insert("sdk_key".into(), Value::String(self.sdk_key.expose_secret().to_string()));
        body.insert("request_id".into(), Value::String(request.id.to_string()));
        body.insert(
            "instrumentation".into(),
            serde_json::json!({
                "attempt": meta.attempt,
                "queue_depth": meta.queue_depth,
                "request_age_ms": meta.age_ms,
            }),
        );
        Value::Object(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(request_id = %request.id, kind = %request.kind, attempt = meta.attempt))]
    async fn send(&self, request: &Request, meta: DispatchMeta) -> Result<ServerResponse, SdkError> {
        if request.path().trim_matches('/').is_empty() {
            return Err(SdkError::InvalidState(format!("{} request has no path", request.kind)));
        }
        let response = self
            .client
            .post(self.url_for(request))
            .header("accept", "application/json")
            .header("x-request-id", request.id.as_str())
            .header("x-beacon-attempt", meta.attempt)
            .header("x-beacon-queue-depth", meta.queue_depth)
            .json(&self.body_for(request, meta))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| self.classify(e))?;
        if !(200..300).contains(&status) {
            return Err(SdkError::from_status(status, text));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| SdkError::InvalidResponse(format!("body: {e}")))?
        };
        Ok(ServerResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{LinkContext, SessionPayload};

    fn transport() -> HttpTransport {
        HttpTransport::new("https://api.example.test/", SecretString::from("key_live_123".to_string())).unwrap()
    }

    #[test]
    fn url_joins_base_and_endpoint() {
        let t = transport();
        assert_eq!(t.url_for(&Request::logout()), "https://api.example.test/v1/logout");
        let generic = Request::generic("/v1/credits", Value::Null).unwrap();
        assert_eq!(t.url_for(&generic), "https://api.example.test/v1/credits");
    }

    #[test]
    fn body_carries_key_id_and_instrumentation() {
        let t = transport();
        let req = Request::open(SessionPayload::new(Some(&LinkContext::url("https://x.test/abc")), None));
        let meta = DispatchMeta {
            attempt: 2,
            queue_depth: 3,
            age_ms: 1500,
        };
        let body = t.body_for(&req, meta);
        assert_eq!(body["sdk_key"], "key_live_123");
        assert_eq!(body["request_id"], req.id.as_str());
        assert_eq!(body["primary_url"], "https://x.test/abc");
        assert_eq!(body["instrumentation"]["attempt"], 2);
        assert_eq!(body["instrumentation"]["request_age_ms"], 1500);
    }

    #[test]
    fn generic_body_unwraps_inner_object() {
        let t = transport();
        let req = Request::generic("v1/credits", serde_json::json!({"bucket": "default"})).unwrap();
        let body = t.body_for(&req, DispatchMeta::default());
        assert_eq!(body["bucket"], "default");
        assert!(body.get("path").is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let t = HttpTransport::with_connect_timeout(
            &format!("http://127.0.0.1:{port}"),
            SecretString::from("key_live_123".to_string()),
            Duration::from_millis(250),
        )
        .unwrap();

        let err = t.send(&Request::logout(), DispatchMeta::default()).await.unwrap_err();
        assert!(matches!(err, SdkError::NetworkFailure(_)), "got: {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn restored_generic_without_path_is_not_posted() {
        let t = transport();
        let req = Request::new(RequestKind::Generic, serde_json::json!({"body": {}}));
        let err = t.send(&req, DispatchMeta::default()).await.unwrap_err();
        assert!(matches!(err, SdkError::InvalidState(_)));
        assert!(!err.is_retryable());
    }
}
