//! External notification provider client.
//!
//! The provider speaks a token-authenticated JSON API: an access token is
//! exchanged for the account's app credentials, then each templated message is
//! posted with that token and answered with an `errcode` plus a provider
//! message id. Tokens live on a per-credential [`ProviderClient`], which is why
//! clients are cached rather than rebuilt per message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::ClientCache;

/// Refresh tokens this long before the provider says they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Error codes meaning the access token is no longer accepted.
const STALE_TOKEN_CODES: &[i64] = &[40001, 40014, 42001];

/// App credentials of a sending account. Also the client cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub app_id: String,
    pub app_secret: String,
}

/// Mini-program jump target attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniProgram {
    pub appid: String,
    pub pagepath: String,
}

/// One templated message addressed to one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateMessage {
    pub touser: String,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miniprogram: Option<MiniProgram>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("unexpected provider response: {0}")]
    Malformed(String),
}

/// Delivers one message to the external provider.
///
/// Returns the provider-assigned message id on success.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    async fn send(
        &self,
        credentials: &Credentials,
        message: &TemplateMessage,
    ) -> Result<String, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    msgid: Option<serde_json::Value>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Provider client bound to one set of credentials.
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    token: Mutex<Option<AccessToken>>,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let resp: TokenResponse = self
            .http
            .get(format!("{}/cgi-bin/token", self.base_url))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.credentials.app_id.as_str()),
                ("secret", self.credentials.app_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(value) = resp.access_token else {
            return Err(ProviderError::Rejected {
                code: resp.errcode,
                message: resp.errmsg,
            });
        };
        let lifetime = Duration::from_secs(resp.expires_in.unwrap_or(7200));

        tracing::debug!(app_id = %self.credentials.app_id, "Provider access token refreshed");

        *slot = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(value)
    }

    /// Post one templated message and return the provider message id.
    pub async fn send_template(&self, message: &TemplateMessage) -> Result<String, ProviderError> {
        let token = self.access_token().await?;

        let resp: SendResponse = self
            .http
            .post(format!("{}/cgi-bin/message/template/send", self.base_url))
            .query(&[("access_token", token.as_str())])
            .json(message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.errcode != 0 {
            if STALE_TOKEN_CODES.contains(&resp.errcode) {
                *self.token.lock().await = None;
            }
            return Err(ProviderError::Rejected {
                code: resp.errcode,
                message: resp.errmsg,
            });
        }

        match resp.msgid {
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s),
            other => Err(ProviderError::Malformed(format!(
                "missing msgid in response: {:?}",
                other
            ))),
        }
    }
}

/// HTTP provider that keeps one [`ProviderClient`] per credential.
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    clients: ClientCache<Credentials, ProviderClient>,
}

impl HttpProvider {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        cache_ttl: Duration,
        cache_capacity: usize,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            clients: ClientCache::new(cache_ttl, cache_capacity),
        })
    }

    fn client_for(&self, credentials: &Credentials) -> Arc<ProviderClient> {
        self.clients.get_or_insert_with(credentials, || {
            ProviderClient::new(self.http.clone(), self.base_url.clone(), credentials.clone())
        })
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl NotificationProvider for HttpProvider {
    async fn send(
        &self,
        credentials: &Credentials,
        message: &TemplateMessage,
    ) -> Result<String, ProviderError> {
        self.client_for(credentials).send_template(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            app_id: "wx-app".to_string(),
            app_secret: "secret".to_string(),
        }
    }

    fn message() -> TemplateMessage {
        TemplateMessage {
            touser: "openid-1".to_string(),
            template_id: "tpl-1".to_string(),
            url: None,
            color: None,
            data: serde_json::json!({"first": {"value": "hello"}}),
            miniprogram: None,
        }
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .and(query_param("appid", "wx-app"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 7200})),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(
            server.uri(),
            Duration::from_secs(5),
            Duration::from_secs(3600),
            8,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_provider_msg_id() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/template/send"))
            .and(query_param("access_token", "tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"errcode": 0, "errmsg": "ok", "msgid": 200228332})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let first = provider.send(&credentials(), &message()).await.unwrap();
        let second = provider.send(&credentials(), &message()).await.unwrap();

        assert_eq!(first, "200228332");
        assert_eq!(second, "200228332");
        // token fetched once, client reused
        assert_eq!(provider.cached_clients(), 1);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_send_surfaces_provider_rejection() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/template/send"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"errcode": 43004, "errmsg": "require subscribe"})),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .send(&credentials(), &message())
            .await
            .unwrap_err();

        match err {
            ProviderError::Rejected { code, message } => {
                assert_eq!(code, 43004);
                assert_eq!(message, "require subscribe");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_is_transport_failure() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/template/send"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server)
            .send(&credentials(), &message())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
    }
}
