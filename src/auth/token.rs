use crate::cache::CachableEndpoint;
use crate::http::{CachePolicy, ControlRequest, HttpMethod, HttpTransport};
use crate::Result;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const TOKEN_ENDPOINT: &str = "/v1/auth/issue-jwt-token";

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: Option<String>,
}

/// Exchanges the API key for a short-lived access token. Tokens are cached
/// per API key by the transport.
pub struct TokenRetriever {
    api_key: String,
    transport: Arc<dyn HttpTransport>,
}

impl TokenRetriever {
    pub fn new(api_key: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        transport.register_cachable(
            CachableEndpoint::new(TOKEN_ENDPOINT, [HttpMethod::Post]).with_key_generator(api_key_of),
            false,
        );
        Self {
            api_key: api_key.into(),
            transport,
        }
    }

    /// `refresh` skips the cached token and re-caches a fresh one.
    /// `Ok(None)` means the control plane did not issue a token.
    pub async fn get_token(&self, refresh: bool) -> Result<Option<String>> {
        let request = ControlRequest::new(HttpMethod::Post, TOKEN_ENDPOINT)
            .with_json(Some(json!({ "api_key": self.api_key })))
            .with_cache(if refresh {
                CachePolicy::Refresh
            } else {
                CachePolicy::Force
            });
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            tracing::warn!(
                status = response.status.as_u16(),
                body = %response.text(),
                "failed to get access token"
            );
            return Ok(None);
        }
        match response.json::<TokenReply>() {
            Ok(TokenReply {
                access_token: Some(token),
            }) => Ok(Some(token)),
            _ => {
                tracing::warn!(body = %response.text(), "failed to get access token");
                Ok(None)
            }
        }
    }
}

fn api_key_of(body: &[u8]) -> Vec<u8> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("api_key").and_then(|k| k.as_str()).map(str::to_string))
        .unwrap_or_else(|| "invalid-key".to_string())
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_the_api_key() {
        assert_eq!(api_key_of(br#"{"api_key":"abc"}"#), b"abc".to_vec());
        assert_eq!(api_key_of(b"not json"), b"invalid-key".to_vec());
    }
}
