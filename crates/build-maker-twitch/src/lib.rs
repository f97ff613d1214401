//! Twitch identity collaborator: OAuth token validation, moderator listing and channel
//! profile lookup.

use std::future::Future;
use std::time::Duration;

use build_maker_core::{ChannelInfo, ChannelMod};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Moderators requested per page.
const MOD_PAGE_SIZE: u32 = 100;
/// Upper bound on moderator pages followed for one channel.
const MAX_MOD_PAGES: usize = 100;

#[derive(Debug, Error)]
pub enum TwitchError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected HTTP status {status} from {endpoint}")]
    Status { status: u16, endpoint: &'static str },
    #[error("parse error: {0}")]
    Parse(String),
}

/// The user behind a validated OAuth token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TwitchUser {
    pub id: String,
    pub name: String,
    pub expires_in: u64,
}

/// Identity lookups the handlers depend on. `token` is always the caller's OAuth token.
pub trait IdentityProvider: Send + Sync {
    /// `None` when the provider rejects the token.
    fn validate_token(
        &self,
        token: &str,
    ) -> impl Future<Output = anyhow::Result<Option<TwitchUser>>> + Send;

    /// Every moderator of the channel, across all pages.
    fn channel_mods(
        &self,
        channel_id: &str,
        token: &str,
    ) -> impl Future<Output = anyhow::Result<Vec<ChannelMod>>> + Send;

    fn channel_info(
        &self,
        channel_id: &str,
        token: &str,
    ) -> impl Future<Output = anyhow::Result<ChannelInfo>> + Send;
}

/// Twitch request configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TwitchConfig {
    pub client_id: String,
    /// Helix API origin (default: `https://api.twitch.tv`)
    pub api_base_url: String,
    /// OAuth origin (default: `https://id.twitch.tv`)
    pub auth_base_url: String,
    /// Request timeout in seconds (default: 10)
    pub timeout_secs: u64,
    /// Retries for transport errors and 5xx responses (default: 3)
    pub max_retries: u32,
    /// Base retry delay in milliseconds, multiplied by the attempt number (default: 200)
    pub retry_delay_ms: u64,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            api_base_url: "https://api.twitch.tv".to_string(),
            auth_base_url: "https://id.twitch.tv".to_string(),
            timeout_secs: 10,
            max_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    user_id: String,
    login: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModeratorPage {
    data: Vec<ChannelMod>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct UserProfile {
    display_name: String,
    #[serde(default)]
    profile_image_url: String,
    #[serde(default)]
    offline_image_url: String,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<UserProfile>,
}

fn parse<T: serde::de::DeserializeOwned>(
    body: serde_json::Value,
    what: &str,
) -> Result<T, TwitchError> {
    serde_json::from_value(body).map_err(|err| TwitchError::Parse(format!("{what}: {err}")))
}

/// Decode an `oauth2/validate` response body.
///
/// # Errors
/// Returns [`TwitchError::Parse`] when `user_id` or `login` is missing.
pub fn parse_validation(body: serde_json::Value) -> Result<TwitchUser, TwitchError> {
    let response: ValidateResponse = parse(body, "token validation")?;
    Ok(TwitchUser { id: response.user_id, name: response.login, expires_in: response.expires_in })
}

/// Decode one moderator page into its moderators and the cursor of the next page.
///
/// # Errors
/// Returns [`TwitchError::Parse`] when the body is not a moderator page.
pub fn parse_moderator_page(
    body: serde_json::Value,
) -> Result<(Vec<ChannelMod>, Option<String>), TwitchError> {
    let page: ModeratorPage = parse(body, "moderator page")?;
    let cursor = page.pagination.cursor.filter(|cursor| !cursor.is_empty());
    Ok((page.data, cursor))
}

/// Decode a `helix/users` response for a single user. The picture falls back to the
/// offline image when the profile image is empty.
///
/// # Errors
/// Returns [`TwitchError::Parse`] when the body has no user.
pub fn parse_channel_info(body: serde_json::Value) -> Result<ChannelInfo, TwitchError> {
    let response: UsersResponse = parse(body, "user lookup")?;
    let Some(profile) = response.data.into_iter().next() else {
        return Err(TwitchError::Parse("user lookup returned no users".to_string()));
    };
    let pic = if profile.profile_image_url.is_empty() {
        profile.offline_image_url
    } else {
        profile.profile_image_url
    };
    Ok(ChannelInfo { name: profile.display_name, pic })
}

/// Twitch API client. Tokens are passed per call and never stored or logged.
#[derive(Debug, Clone)]
pub struct TwitchClient {
    client: Client,
    config: TwitchConfig,
}

impl TwitchClient {
    /// # Errors
    /// Returns [`TwitchError::Request`] when the HTTP client cannot be built.
    pub fn new(mut config: TwitchConfig) -> Result<Self, TwitchError> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        config.api_base_url = config.api_base_url.trim_end_matches('/').to_string();
        config.auth_base_url = config.auth_base_url.trim_end_matches('/').to_string();
        Ok(Self { client, config })
    }

    fn helix(&self, path: &str, token: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{path}", self.config.api_base_url))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header("Client-ID", &self.config.client_id)
    }

    /// Send with retries on transport errors and 5xx responses. Any other response is
    /// returned to the caller as-is.
    async fn send_with_retry(
        &self,
        endpoint: &'static str,
        request_fn: impl Fn() -> RequestBuilder,
    ) -> Result<Response, TwitchError> {
        let mut attempt = 0_u32;
        loop {
            let outcome = request_fn().send().await;
            let retryable = match &outcome {
                Ok(response) => response.status().is_server_error(),
                Err(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            };
            if !retryable || attempt >= self.config.max_retries {
                return match outcome {
                    Ok(response) if response.status().is_server_error() => Err(TwitchError::Status {
                        status: response.status().as_u16(),
                        endpoint,
                    }),
                    Ok(response) => Ok(response),
                    Err(err) => Err(TwitchError::Request(err)),
                };
            }

            attempt += 1;
            tracing::debug!(endpoint, attempt, "retrying twitch request");
            tokio::time::sleep(Duration::from_millis(
                self.config.retry_delay_ms.saturating_mul(u64::from(attempt)),
            ))
            .await;
        }
    }

    async fn json_body(
        response: Response,
        endpoint: &'static str,
    ) -> Result<serde_json::Value, TwitchError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TwitchError::Status { status: status.as_u16(), endpoint });
        }
        Ok(response.json().await?)
    }

    /// # Errors
    /// Returns an error for transport failures, statuses other than 200 and 401, or an
    /// unreadable body.
    pub async fn validate(&self, token: &str) -> Result<Option<TwitchUser>, TwitchError> {
        let url = format!("{}/oauth2/validate", self.config.auth_base_url);
        let response = self
            .send_with_retry("oauth2/validate", || {
                self.client.get(&url).header(header::AUTHORIZATION, format!("OAuth {token}"))
            })
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let body = Self::json_body(response, "oauth2/validate").await?;
        let user = parse_validation(body)?;
        tracing::debug!(user_id = %user.id, "validated twitch token");
        Ok(Some(user))
    }

    /// # Errors
    /// Returns an error for transport failures, unsuccessful statuses, unreadable pages, or
    /// a moderator list longer than the page limit.
    pub async fn moderators(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Result<Vec<ChannelMod>, TwitchError> {
        let mut mods = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_MOD_PAGES {
            let response = self
                .send_with_retry("helix/moderation/moderators", || {
                    let mut query = vec![
                        ("broadcaster_id", channel_id.to_string()),
                        ("first", MOD_PAGE_SIZE.to_string()),
                    ];
                    if let Some(after) = &cursor {
                        query.push(("after", after.clone()));
                    }
                    self.helix("/helix/moderation/moderators", token).query(&query)
                })
                .await?;
            let body = Self::json_body(response, "helix/moderation/moderators").await?;
            let (page, next) = parse_moderator_page(body)?;
            mods.extend(page);

            match next {
                Some(next) => cursor = Some(next),
                None => {
                    tracing::debug!(channel_id, count = mods.len(), "fetched channel moderators");
                    return Ok(mods);
                }
            }
        }

        Err(TwitchError::Parse(format!("moderator list exceeded {MAX_MOD_PAGES} pages")))
    }

    /// # Errors
    /// Returns an error for transport failures, unsuccessful statuses, or an unknown user.
    pub async fn user_info(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Result<ChannelInfo, TwitchError> {
        let response = self
            .send_with_retry("helix/users", || {
                self.helix("/helix/users", token).query(&[("id", channel_id)])
            })
            .await?;
        let body = Self::json_body(response, "helix/users").await?;
        parse_channel_info(body)
    }
}

impl IdentityProvider for TwitchClient {
    async fn validate_token(&self, token: &str) -> anyhow::Result<Option<TwitchUser>> {
        Ok(self.validate(token).await?)
    }

    async fn channel_mods(&self, channel_id: &str, token: &str) -> anyhow::Result<Vec<ChannelMod>> {
        Ok(self.moderators(channel_id, token).await?)
    }

    async fn channel_info(&self, channel_id: &str, token: &str) -> anyhow::Result<ChannelInfo> {
        Ok(self.user_info(channel_id, token).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn parse_validation_reads_user_fields() {
        let user = parse_validation(json!({
            "client_id": "wbmytr93xzw8zbg0p1izqyzzc5mbiz",
            "login": "twitchdev",
            "scopes": ["moderation:read"],
            "user_id": "141981764",
            "expires_in": 5_520_838
        }))
        .unwrap_or_else(|err| panic!("validation body should parse: {err}"));

        assert_eq!(
            user,
            TwitchUser {
                id: "141981764".to_string(),
                name: "twitchdev".to_string(),
                expires_in: 5_520_838,
            }
        );
        assert!(matches!(parse_validation(json!({"login": "x"})), Err(TwitchError::Parse(_))));
    }

    #[test]
    fn parse_moderator_page_reads_cursor() {
        let (mods, cursor) = parse_moderator_page(json!({
            "data": [{"user_id": "424596340", "user_login": "quotrok", "user_name": "quotrok"}],
            "pagination": {"cursor": "eyJiIjpudWxsLCJhIjp7IkN1cnNvciI6IjEwMDQ3MzA2NDo4NjQwNjU3MX19"}
        }))
        .unwrap_or_else(|err| panic!("page should parse: {err}"));
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].id, "424596340");
        assert_eq!(
            cursor.as_deref(),
            Some("eyJiIjpudWxsLCJhIjp7IkN1cnNvciI6IjEwMDQ3MzA2NDo4NjQwNjU3MX19")
        );

        let (_, last) = parse_moderator_page(json!({"data": [], "pagination": {}}))
            .unwrap_or_else(|err| panic!("last page should parse: {err}"));
        assert_eq!(last, None);
    }

    #[test]
    fn parse_channel_info_falls_back_to_offline_image() {
        let info = parse_channel_info(json!({"data": [{
            "display_name": "MyChannel",
            "profile_image_url": "",
            "offline_image_url": "https://example.test/offline.png"
        }]}))
        .unwrap_or_else(|err| panic!("user should parse: {err}"));
        assert_eq!(info.name, "MyChannel");
        assert_eq!(info.pic, "https://example.test/offline.png");

        assert!(matches!(parse_channel_info(json!({"data": []})), Err(TwitchError::Parse(_))));
    }

    #[derive(Clone, Default)]
    struct MockTwitch {
        user_calls: Arc<AtomicU32>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|value| value.to_str().ok()) == Some("Bearer good")
            && headers.get("client-id").and_then(|value| value.to_str().ok()) == Some("client")
    }

    async fn validate_handler(headers: HeaderMap) -> Result<Json<Value>, AxumStatus> {
        match headers.get("authorization").and_then(|value| value.to_str().ok()) {
            Some("OAuth good") => {
                Ok(Json(json!({"user_id": "123456", "login": "streamer", "expires_in": 3600})))
            }
            _ => Err(AxumStatus::UNAUTHORIZED),
        }
    }

    async fn moderators_handler(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, AxumStatus> {
        let broadcaster = query.get("broadcaster_id").map(String::as_str);
        if !authorized(&headers) || broadcaster != Some("123456") {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        let body = match query.get("after").map(String::as_str) {
            None => json!({
                "data": [{"user_id": "1", "user_login": "mod1", "user_name": "Mod1"}],
                "pagination": {"cursor": "page2"}
            }),
            Some("page2") => json!({
                "data": [{"user_id": "2", "user_login": "mod2", "user_name": "Mod2"}],
                "pagination": {}
            }),
            Some(_) => return Err(AxumStatus::BAD_REQUEST),
        };
        Ok(Json(body))
    }

    async fn users_handler(
        State(state): State<MockTwitch>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, AxumStatus> {
        // The first two lookups fail to exercise retries.
        if state.user_calls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(AxumStatus::SERVICE_UNAVAILABLE);
        }
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        Ok(Json(json!({"data": [{
            "display_name": "Streamer",
            "profile_image_url": "https://example.test/p.png",
            "offline_image_url": ""
        }]})))
    }

    async fn spawn_mock(state: MockTwitch) -> String {
        let app = Router::new()
            .route("/oauth2/validate", get(validate_handler))
            .route("/helix/moderation/moderators", get(moderators_handler))
            .route("/helix/users", get(users_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("mock listener should bind: {err}"));
        let addr = listener.local_addr().unwrap_or_else(|err| panic!("local addr: {err}"));
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                panic!("mock server failed: {err}");
            }
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str, max_retries: u32) -> TwitchClient {
        TwitchClient::new(TwitchConfig {
            client_id: "client".to_string(),
            api_base_url: format!("{base_url}/"),
            auth_base_url: base_url.to_string(),
            timeout_secs: 5,
            max_retries,
            retry_delay_ms: 1,
        })
        .unwrap_or_else(|err| panic!("client should build: {err}"))
    }

    #[tokio::test]
    async fn validate_maps_unauthorized_to_none() {
        let base_url = spawn_mock(MockTwitch::default()).await;
        let client = client(&base_url, 0);

        let user = client
            .validate_token("good")
            .await
            .unwrap_or_else(|err| panic!("validate: {err}"));
        assert_eq!(user.map(|user| user.id), Some("123456".to_string()));

        let rejected = client
            .validate_token("bad")
            .await
            .unwrap_or_else(|err| panic!("validate: {err}"));
        assert_eq!(rejected, None);
    }

    #[tokio::test]
    async fn moderators_follow_pagination() {
        let base_url = spawn_mock(MockTwitch::default()).await;
        let mods = client(&base_url, 0)
            .channel_mods("123456", "good")
            .await
            .unwrap_or_else(|err| panic!("moderators: {err}"));

        let ids = mods.into_iter().map(|moderator| moderator.id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn user_lookup_retries_server_errors() {
        let state = MockTwitch::default();
        let base_url = spawn_mock(state.clone()).await;

        let info = client(&base_url, 3)
            .channel_info("123456", "good")
            .await
            .unwrap_or_else(|err| panic!("user lookup: {err}"));
        assert_eq!(info.name, "Streamer");
        assert_eq!(info.pic, "https://example.test/p.png");
        assert_eq!(state.user_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn user_lookup_gives_up_after_retry_budget() {
        let state = MockTwitch::default();
        let base_url = spawn_mock(state.clone()).await;

        let result = client(&base_url, 1).user_info("123456", "good").await;
        assert!(matches!(result, Err(TwitchError::Status { status: 503, .. })));
        assert_eq!(state.user_calls.load(Ordering::SeqCst), 2);
    }
}
