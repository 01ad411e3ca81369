use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SdkError;
use crate::ids::{IdentityId, SessionId};
use crate::link::LinkContext;

/// Session identifiers and link data returned by an Install/Open response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: SessionId,
    pub identity_id: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_fingerprint_id: Option<String>,
    /// Developer-assigned user id, if one was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default)]
    pub link_data: Value,
    #[serde(default)]
    pub is_first_session: bool,
    #[serde(default)]
    pub clicked_link: bool,
}

impl SessionData {
    /// Decode an Install/Open response body.
    ///
    /// `data` may arrive either as an object or as a JSON-encoded string.
    pub fn from_response(body: &Value, is_first_session: bool) -> Result<Self, SdkError> {
        let session_id = body
            .get("session_id")
            .and_then(value_as_id)
            .ok_or_else(|| SdkError::InvalidResponse("missing session_id".into()))?;
        let identity_id = body
            .get("identity_id")
            .or_else(|| body.get("randomized_bundle_token"))
            .and_then(value_as_id)
            .ok_or_else(|| SdkError::InvalidResponse("missing identity_id".into()))?;

        let link_data = match body.get("data") {
            Some(Value::String(raw)) => serde_json::from_str(raw)
                .map_err(|e| SdkError::InvalidResponse(format!("link data: {e}")))?,
            Some(other) => other.clone(),
            None => Value::Object(Default::default()),
        };
        let clicked_link = link_data
            .get("+clicked_branch_link")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            session_id: SessionId::from_raw(session_id),
            identity_id: IdentityId::from_raw(identity_id),
            device_fingerprint_id: body
                .get("device_fingerprint_id")
                .and_then(value_as_id),
            identity: body.get("identity").and_then(Value::as_str).map(str::to_owned),
            link_data,
            is_first_session,
            clicked_link,
        })
    }
}

/// Ids may be sent as strings or numbers.
fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What each caller of an initialization entry point receives.
///
/// Every waiter of one generation shares the same `session` allocation.
#[derive(Clone, Debug)]
pub struct SessionResult {
    pub session: Arc<SessionData>,
    /// The link this particular caller arrived with.
    pub link: Option<LinkContext>,
    /// Every URL accumulated by the coalesced triggers of the generation.
    pub urls: Vec<String>,
}

impl SessionResult {
    pub fn primary_url(&self) -> Option<&str> {
        self.urls.last().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_link_data() {
        let body = json!({
            "session_id": "s-1",
            "identity_id": 42,
            "device_fingerprint_id": "df-9",
            "data": {"+clicked_branch_link": true, "product": "abc"}
        });
        let session = SessionData::from_response(&body, true).unwrap();
        assert_eq!(session.session_id.as_str(), "s-1");
        assert_eq!(session.identity_id.as_str(), "42");
        assert_eq!(session.device_fingerprint_id.as_deref(), Some("df-9"));
        assert!(session.clicked_link);
        assert!(session.is_first_session);
        assert_eq!(session.link_data["product"], "abc");
    }

    #[test]
    fn parses_string_encoded_link_data() {
        let body = json!({
            "session_id": "s-2",
            "randomized_bundle_token": "rbt",
            "data": "{\"~channel\":\"email\"}"
        });
        let session = SessionData::from_response(&body, false).unwrap();
        assert_eq!(session.identity_id.as_str(), "rbt");
        assert_eq!(session.link_data["~channel"], "email");
        assert!(!session.clicked_link);
    }

    #[test]
    fn missing_session_id_is_invalid() {
        let err = SessionData::from_response(&json!({"identity_id": "x"}), false).unwrap_err();
        assert!(matches!(err, SdkError::InvalidResponse(_)));
    }

    #[test]
    fn malformed_link_data_is_invalid() {
        let body = json!({"session_id": "s", "identity_id": "i", "data": "{not json"});
        assert!(SessionData::from_response(&body, false).is_err());
    }
}
