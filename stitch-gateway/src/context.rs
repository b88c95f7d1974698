//! Request scoped state shared by every field resolution of one request.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::policy::PolicyCache;

const BEARER_PREFIX: &str = "Bearer ";

/// State of one GraphQL request.
///
/// Cloning is cheap and clones share the JWT claims and the policy cache.
#[derive(Clone, Debug)]
pub struct RequestContext {
    id: Uuid,
    headers: Arc<HeaderMap>,
    headers_value: Arc<OnceCell<Value>>,
    jwt: Arc<OnceCell<Option<Object>>>,
    policy_cache: PolicyCache,
    ignore_policies: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(HeaderMap::new())
    }
}

impl RequestContext {
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: Arc::new(headers),
            headers_value: Default::default(),
            jwt: Default::default(),
            policy_cache: PolicyCache::default(),
            ignore_policies: false,
        }
    }

    /// A context for a query issued on behalf of a policy. It shares this request's caches and
    /// skips policy checks.
    pub(crate) fn for_policy_query(&self) -> Self {
        Self {
            ignore_policies: true,
            ..self.clone()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn ignore_policies(&self) -> bool {
        self.ignore_policies
    }

    pub(crate) fn policy_cache(&self) -> &PolicyCache {
        &self.policy_cache
    }

    fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .filter(|token| !token.is_empty())
    }

    /// Requests without a bearer token are anonymous.
    pub fn is_anonymous_access(&self) -> bool {
        self.bearer_token().is_none()
    }

    /// The claims of the bearer token, decoded on first use.
    ///
    /// The signature is not verified here; authentication happens in front of the gateway.
    pub fn decode_once(&self) -> Option<&Object> {
        self.jwt
            .get_or_init(|| {
                let token = self.bearer_token()?;
                match decode_claims(token) {
                    Ok(claims) => Some(claims),
                    Err(error) => {
                        tracing::debug!(request_id = %self.id, %error, "could not decode bearer token");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// The request headers as templates see them: lowercase names, repeated values joined.
    pub(crate) fn headers_value(&self) -> &Value {
        self.headers_value.get_or_init(|| {
            let mut headers = Object::new();
            for name in self.headers.keys() {
                let value = self
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .collect::<Vec<_>>()
                    .join(", ");
                headers.insert(name.as_str().to_string(), Value::String(value));
            }
            Value::Object(headers)
        })
    }
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum JwtError {
    /// token does not have three segments
    Malformed,
    /// payload is not valid base64: {0}
    Base64(#[from] base64::DecodeError),
    /// payload is not a JSON object: {0}
    Json(#[from] serde_json::Error),
}

fn decode_claims(token: &str) -> Result<Object, JwtError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err(JwtError::Malformed),
    };
    // Some issuers pad the payload anyway.
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use http::HeaderName;
    use http::HeaderValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn token(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.signature")
    }

    fn context_with_authorization(value: &str) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        RequestContext::new(headers)
    }

    #[test]
    fn decodes_bearer_claims() {
        let context =
            context_with_authorization(&format!("Bearer {}", token(&json!({"sub": "user-1"}))));
        assert!(!context.is_anonymous_access());
        assert_eq!(
            context.decode_once().and_then(|claims| claims.get("sub")),
            Some(&json!("user-1"))
        );
    }

    #[test]
    fn missing_or_foreign_scheme_is_anonymous() {
        let context = RequestContext::default();
        assert!(context.is_anonymous_access());
        assert_eq!(context.decode_once(), None);

        let context = context_with_authorization("Basic dXNlcjpwYXNz");
        assert!(context.is_anonymous_access());
        assert_eq!(context.decode_once(), None);
    }

    #[test]
    fn malformed_token_has_no_claims() {
        let context = context_with_authorization("Bearer not-a-jwt");
        assert!(!context.is_anonymous_access());
        assert_eq!(context.decode_once(), None);
    }

    #[test]
    fn policy_query_context_shares_state() {
        let context =
            context_with_authorization(&format!("Bearer {}", token(&json!({"sub": "user-1"}))));
        let nested = context.for_policy_query();
        assert!(nested.ignore_policies());
        assert!(!context.ignore_policies());
        assert_eq!(nested.id(), context.id());
        assert_eq!(
            nested.decode_once().and_then(|claims| claims.get("sub")),
            Some(&json!("user-1"))
        );
    }

    #[test]
    fn headers_are_exposed_lowercase() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"X-Client-Id").unwrap(),
            HeaderValue::from_static("client"),
        );
        headers.append("accept", HeaderValue::from_static("a"));
        headers.append("accept", HeaderValue::from_static("b"));
        let context = RequestContext::new(headers);
        assert_eq!(
            context.headers_value(),
            &json!({"x-client-id": "client", "accept": "a, b"})
        );
    }
}
