use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use build_maker_api::{
    ApiError, BuildMakerApi, BuildView, ChannelView, PruneSummary, TokenInfo, TokenStatus,
    API_CONTRACT_VERSION,
};
use build_maker_core::{
    now_millis, Build, Channel, ChannelMod, DirectoryCatalogs, OptionCatalog, ReleaseCatalog,
    Settings, Token,
};
use build_maker_store_sqlite::{BuildEntry, ChannelEntry};
use build_maker_twitch::{IdentityProvider, TwitchClient, TwitchConfig};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

/// Header carrying the caller's Twitch OAuth token.
const TOKEN_HEADER: &str = "x-twitch-token";

struct ServiceState<I> {
    api: BuildMakerApi<I>,
}

impl<I> Clone for ServiceState<I> {
    fn clone(&self) -> Self {
        Self { api: self.api.clone() }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "build-maker-service")]
#[command(about = "HTTP service for channel build requests")]
struct Args {
    #[arg(long, env = "BUILD_MAKER_DB", default_value = "./build_maker.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "BUILD_MAKER_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Directory holding `releases.json` and one `<release>.json` per release. The
    /// catalogs compiled into the binary are used when unset.
    #[arg(long, env = "BUILD_MAKER_CATALOG_DIR")]
    catalog_dir: Option<PathBuf>,
    #[arg(long, env = "BUILD_COMPLETED_EXPIRE_HOURS", default_value_t = 6)]
    build_completed_expire_hours: i64,
    #[arg(long, env = "BUILD_UNCOMPLETED_EXPIRE_DAYS", default_value_t = 15)]
    build_uncompleted_expire_days: i64,
    #[arg(long, env = "CHANNEL_EXPIRE_DAYS", default_value_t = 90)]
    channel_expire_days: i64,
    #[arg(long, env = "TOKEN_EXPIRE_HOURS", default_value_t = 24)]
    token_expire_hours: i64,
    #[arg(long, env = "TOKEN_MIN_LENGTH", default_value_t = 3)]
    token_min_length: u32,
    #[arg(long, env = "TOKEN_MAX_LENGTH", default_value_t = 4)]
    token_max_length: u32,
    #[arg(long, env = "TWITCH_CLIENT_ID", default_value = "")]
    twitch_client_id: String,
    #[arg(long, env = "TWITCH_API_URL", default_value = "https://api.twitch.tv")]
    twitch_api_url: String,
    #[arg(long, env = "TWITCH_AUTH_URL", default_value = "https://id.twitch.tv")]
    twitch_auth_url: String,
    #[arg(long, env = "TWITCH_TIMEOUT_SECS", default_value_t = 10)]
    twitch_timeout_secs: u64,
    #[arg(long, env = "TWITCH_MAX_RETRIES", default_value_t = 3)]
    twitch_max_retries: u32,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            build_completed_expire_hours: self.build_completed_expire_hours,
            build_uncompleted_expire_days: self.build_uncompleted_expire_days,
            channel_expire_days: self.channel_expire_days,
            token_expire_hours: self.token_expire_hours,
            token_min_length: self.token_min_length,
            token_max_length: self.token_max_length,
        }
    }

    fn catalog(&self) -> ReleaseCatalog {
        match &self.catalog_dir {
            Some(root) => ReleaseCatalog::new(DirectoryCatalogs::new(root.clone())),
            None => ReleaseCatalog::bundled(),
        }
    }

    fn twitch_config(&self) -> TwitchConfig {
        TwitchConfig {
            client_id: self.twitch_client_id.clone(),
            api_base_url: self.twitch_api_url.clone(),
            auth_base_url: self.twitch_auth_url.clone(),
            timeout_secs: self.twitch_timeout_secs,
            max_retries: self.twitch_max_retries,
            ..TwitchConfig::default()
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            field: None,
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::BadRequest { message, field } => {
                Self { field, ..Self::new(StatusCode::BAD_REQUEST, message) }
            }
            ApiError::Forbidden(reason) => Self::new(StatusCode::FORBIDDEN, reason),
            ApiError::NotFound(what) => {
                Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
            }
            ApiError::Internal(err) => {
                tracing::error!(error = ?err, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// The caller's OAuth token, empty when the header is missing or not ASCII.
fn caller_token(headers: &HeaderMap) -> String {
    headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app<I>(state: ServiceState<I>) -> Router
where
    I: IdentityProvider + 'static,
{
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/build-options", get(build_options::<I>))
        .route("/v1/channels", get(list_channels::<I>).post(create_channel::<I>))
        .route(
            "/v1/channels/:channel_id",
            get(get_channel::<I>).delete(delete_channel::<I>).patch(patch_channel::<I>),
        )
        .route("/v1/channels/:channel_id/mods", post(update_mods::<I>))
        .route("/v1/channels/:channel_id/tokens", post(create_token::<I>))
        .route("/v1/channels/:channel_id/tokens/:token", get(get_token::<I>))
        .route("/v1/channels/:channel_id/builds", get(list_builds::<I>))
        .route(
            "/v1/channels/:channel_id/builds/:build_id",
            get(get_build::<I>).put(confirm_build::<I>).patch(patch_build::<I>),
        )
        .route("/v1/prune", post(prune::<I>))
        .route("/v1/twitch/validate", get(validate_twitch_token::<I>))
        .route_layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Logs the matched route rather than the raw path, which may carry a submission token.
async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(String::new, |path| path.as_str().to_string());
    let response = next.run(request).await;
    tracing::info!(%method, route = %route, status = response.status().as_u16(), "handled request");
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let settings = args.settings();
    settings.validate().context("invalid lifetime or token settings")?;
    if args.twitch_client_id.is_empty() {
        tracing::warn!("TWITCH_CLIENT_ID is empty; Helix requests will be rejected");
    }

    let twitch = TwitchClient::new(args.twitch_config()).context("failed to build Twitch client")?;
    let api = BuildMakerApi::new(args.db.clone(), settings, args.catalog(), twitch);
    let status = api.schema_status().context("failed to prepare database")?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = status.current_version,
        "database ready"
    );

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn build_options<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
) -> ServiceResult<OptionCatalog> {
    Ok(Json(envelope(state.api.build_options(now_millis())?)))
}

async fn list_channels<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
) -> ServiceResult<Vec<ChannelEntry>> {
    Ok(Json(envelope(state.api.list_channels()?)))
}

async fn create_channel<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    headers: HeaderMap,
) -> ServiceResult<ChannelView> {
    let channel = state.api.create_channel(&caller_token(&headers), now_millis()).await?;
    Ok(Json(envelope(channel)))
}

async fn get_channel<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path(channel_id): Path<String>,
) -> ServiceResult<ChannelView> {
    Ok(Json(envelope(state.api.get_channel(&channel_id)?)))
}

async fn delete_channel<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> ServiceResult<Option<Channel>> {
    let deleted = state.api.delete_channel(&channel_id, &caller_token(&headers)).await?;
    Ok(Json(envelope(deleted)))
}

async fn patch_channel<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<ChannelView> {
    let Json(patch) = payload?;
    let channel = state.api.patch_channel(&channel_id, &caller_token(&headers), &patch).await?;
    Ok(Json(envelope(channel)))
}

async fn update_mods<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> ServiceResult<Vec<ChannelMod>> {
    let mods = state.api.update_mods(&channel_id, &caller_token(&headers)).await?;
    Ok(Json(envelope(mods)))
}

async fn create_token<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<Token> {
    let Json(payload) = payload?;
    let token = state
        .api
        .create_token(&channel_id, &caller_token(&headers), &payload, now_millis())
        .await?;
    Ok(Json(envelope(token)))
}

async fn get_token<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path((channel_id, token)): Path<(String, String)>,
) -> ServiceResult<TokenInfo> {
    Ok(Json(envelope(state.api.get_token(&channel_id, &token, now_millis())?)))
}

async fn list_builds<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path(channel_id): Path<String>,
) -> ServiceResult<Vec<BuildEntry>> {
    Ok(Json(envelope(state.api.list_builds(&channel_id)?)))
}

async fn get_build<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path((channel_id, build_id)): Path<(String, String)>,
) -> ServiceResult<Build> {
    Ok(Json(envelope(state.api.get_build(&channel_id, &build_id)?)))
}

async fn confirm_build<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path((channel_id, build_id)): Path<(String, String)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<BuildView> {
    let Json(payload) = payload?;
    let build = state.api.confirm_build(&channel_id, &build_id, &payload, now_millis())?;
    Ok(Json(envelope(BuildView { build_id, channel_id, build })))
}

async fn patch_build<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    Path((channel_id, build_id)): Path<(String, String)>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<BuildView> {
    let Json(patch) = payload?;
    let build = state
        .api
        .patch_build(&channel_id, &build_id, &caller_token(&headers), &patch, now_millis())
        .await?;
    Ok(Json(envelope(build)))
}

async fn prune<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
) -> ServiceResult<PruneSummary> {
    let summary = state.api.prune(now_millis())?;
    tracing::info!(
        builds = summary.builds_deleted,
        tokens = summary.tokens_deleted,
        channels = summary.channels_deleted,
        "pruned expired records"
    );
    Ok(Json(envelope(summary)))
}

async fn validate_twitch_token<I: IdentityProvider>(
    State(state): State<ServiceState<I>>,
    headers: HeaderMap,
) -> ServiceResult<TokenStatus> {
    Ok(Json(envelope(state.api.validate_twitch_token(&caller_token(&headers)).await?)))
}
