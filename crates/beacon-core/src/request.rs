//! Outgoing units of work.
//!
//! A [`Request`] is immutable after construction except for its attempt
//! counter and, for session requests that have not been sent yet, merged
//! link metadata. Its [`RequestId`] is the idempotence key the server
//! deduplicates on, so it is preserved across persistence and retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SdkError;
use crate::ids::{IdentityId, RequestId};
use crate::link::LinkContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Install,
    Open,
    Event,
    Identify,
    Logout,
    ShortUrl,
    Generic,
}

impl RequestKind {
    /// Install and Open establish a session and obey the single-flight rule.
    pub fn is_session_establishing(self) -> bool {
        matches!(self, Self::Install | Self::Open)
    }

    /// Kinds that stay queued after the retry budget is spent.
    pub fn survives_exhaustion(self) -> bool {
        matches!(self, Self::Identify | Self::Logout)
    }

    /// Server path for this kind. Generic requests carry their own path.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Install => "v1/install",
            Self::Open => "v1/open",
            Self::Event => "v2/event/custom",
            Self::Identify => "v1/profile",
            Self::Logout => "v1/logout",
            Self::ShortUrl => "v1/url",
            Self::Generic => "",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Open => "open",
            Self::Event => "event",
            Self::Identify => "identify",
            Self::Logout => "logout",
            Self::ShortUrl => "short_url",
            Self::Generic => "generic",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "open" => Ok(Self::Open),
            "event" => Ok(Self::Event),
            "identify" => Ok(Self::Identify),
            "logout" => Ok(Self::Logout),
            "short_url" => Ok(Self::ShortUrl),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown request kind: {other}")),
        }
    }
}

/// Payload of an Install/Open request.
///
/// `primary_url` is last-URL-wins; `urls` keeps every distinct URL seen by
/// the coalesced triggers, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
}

impl SessionPayload {
    pub fn new(link: Option<&LinkContext>, identity_id: Option<IdentityId>) -> Self {
        let mut payload = Self {
            identity_id,
            ..Default::default()
        };
        if let Some(link) = link {
            payload.merge_link(link);
        }
        payload
    }

    pub fn merge_link(&mut self, link: &LinkContext) {
        if let Some(url) = &link.url {
            self.primary_url = Some(url.clone());
            if !self.urls.contains(url) {
                self.urls.push(url.clone());
            }
        }
        if link.scene_identifier.is_some() {
            self.scene_identifier.clone_from(&link.scene_identifier);
        }
        if link.source_application.is_some() {
            self.source_application.clone_from(&link.source_application);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub attempts: u32,
}

impl Request {
    pub fn new(kind: RequestKind, payload: Value) -> Self {
        Self {
            id: RequestId::new(),
            kind,
            created_at: Utc::now(),
            payload,
            attempts: 0,
        }
    }

    pub fn install(payload: SessionPayload) -> Self {
        Self::new(RequestKind::Install, session_value(&payload))
    }

    pub fn open(payload: SessionPayload) -> Self {
        Self::new(RequestKind::Open, session_value(&payload))
    }

    pub fn event(name: &str, data: Value) -> Self {
        Self::new(RequestKind::Event, serde_json::json!({ "name": name, "data": data }))
    }

    pub fn identify(user_id: &str) -> Self {
        Self::new(RequestKind::Identify, serde_json::json!({ "identity": user_id }))
    }

    pub fn logout() -> Self {
        Self::new(RequestKind::Logout, Value::Object(Default::default()))
    }

    pub fn short_url(params: Value) -> Self {
        Self::new(RequestKind::ShortUrl, params)
    }

    /// Request to an arbitrary API path. The path must name an endpoint.
    pub fn generic(path: &str, body: Value) -> Result<Self, SdkError> {
        if path.trim_matches('/').trim().is_empty() {
            return Err(SdkError::InvalidState("generic request needs a non-empty path".into()));
        }
        Ok(Self::new(
            RequestKind::Generic,
            serde_json::json!({ "path": path, "body": body }),
        ))
    }

    pub fn is_session_establishing(&self) -> bool {
        self.kind.is_session_establishing()
    }

    /// Path relative to the API base URL.
    pub fn path(&self) -> &str {
        match self.kind {
            RequestKind::Generic => self
                .payload
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            kind => kind.endpoint(),
        }
    }

    /// Decoded session payload, for Install/Open only.
    pub fn session_payload(&self) -> Option<SessionPayload> {
        if !self.is_session_establishing() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Merge link metadata into a session request. Returns false for other kinds.
    pub fn merge_link(&mut self, link: &LinkContext) -> bool {
        let Some(mut payload) = self.session_payload() else {
            return false;
        };
        payload.merge_link(link);
        self.payload = session_value(&payload);
        true
    }

    /// Milliseconds since the request was created.
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_milliseconds().max(0) as u64
    }
}

fn session_value(payload: &SessionPayload) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_string() {
        for kind in [
            RequestKind::Install,
            RequestKind::Open,
            RequestKind::Event,
            RequestKind::Identify,
            RequestKind::Logout,
            RequestKind::ShortUrl,
            RequestKind::Generic,
        ] {
            let parsed: RequestKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("bogus".parse::<RequestKind>().is_err());
    }

    #[test]
    fn only_install_and_open_establish_sessions() {
        assert!(RequestKind::Install.is_session_establishing());
        assert!(RequestKind::Open.is_session_establishing());
        assert!(!RequestKind::Event.is_session_establishing());
        assert!(!RequestKind::Identify.is_session_establishing());
    }

    #[test]
    fn merge_link_is_last_url_wins_and_keeps_all() {
        let mut req = Request::open(SessionPayload::new(Some(&LinkContext::url("https://x.test/one")), None));
        assert!(req.merge_link(&LinkContext::url("https://x.test/two")));
        assert!(req.merge_link(&LinkContext::url("https://x.test/one")));

        let payload = req.session_payload().unwrap();
        assert_eq!(payload.primary_url.as_deref(), Some("https://x.test/one"));
        assert_eq!(payload.urls, vec!["https://x.test/one", "https://x.test/two"]);
    }

    #[test]
    fn merge_link_keeps_id() {
        let mut req = Request::install(SessionPayload::default());
        let id = req.id.clone();
        req.merge_link(&LinkContext::url("https://x.test/abc").with_scene("s1"));
        assert_eq!(req.id, id);
        assert_eq!(req.session_payload().unwrap().scene_identifier.as_deref(), Some("s1"));
    }

    #[test]
    fn merge_link_rejects_non_session_requests() {
        let mut req = Request::event("purchase", serde_json::json!({"sku": "a"}));
        assert!(!req.merge_link(&LinkContext::url("https://x.test/abc")));
    }

    #[test]
    fn generic_path_comes_from_payload() {
        let req = Request::generic("v1/credits", serde_json::json!({})).unwrap();
        assert_eq!(req.path(), "v1/credits");
        assert_eq!(Request::logout().path(), "v1/logout");
    }

    #[test]
    fn generic_without_path_is_rejected() {
        for path in ["", "/", " ", "//"] {
            let err = Request::generic(path, serde_json::json!({})).unwrap_err();
            assert!(matches!(err, SdkError::InvalidState(_)), "path {path:?}");
        }
    }

    #[test]
    fn serde_preserves_attempts_and_id() {
        let mut req = Request::identify("user-7");
        req.attempts = 2;
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }
}
