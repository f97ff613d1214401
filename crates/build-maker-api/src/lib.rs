use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use build_maker_core::{
    apply_build_patch, apply_channel_patch, authorize_build_patch, authorize_channel_patch,
    validate_build, validate_submitter, Build, Channel, ChannelMod, CoreError, Millis,
    OptionCatalog, PatchOperation, RawBuild, ReleaseCatalog, Settings, StoredToken, Token,
    TokenGenerator,
};
use build_maker_store_sqlite::{BuildEntry, ChannelEntry, SchemaStatus, SqliteStore};
use build_maker_twitch::{IdentityProvider, TwitchUser};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { message: String, field: Option<String> },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidField(field) => Self::BadRequest {
                message: format!("invalid field: {field}"),
                field: Some(field),
            },
            CoreError::MalformedPatch(_) => {
                Self::BadRequest { message: err.to_string(), field: None }
            }
            CoreError::Forbidden(reason) => Self::Forbidden(reason),
            internal => Self::Internal(anyhow::Error::new(internal)),
        }
    }
}

/// A channel together with its key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub channel_id: String,
    #[serde(flatten)]
    pub channel: Channel,
}

/// A build together with its keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildView {
    pub build_id: String,
    pub channel_id: String,
    #[serde(flatten)]
    pub build: Build,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    pub submitter: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenValidity {
    Valid,
    Invalid,
}

/// Outcome of checking an OAuth token with the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenStatus {
    pub status: TokenValidity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<Option<TwitchUser>> for TokenStatus {
    fn from(user: Option<TwitchUser>) -> Self {
        match user {
            Some(user) => {
                Self { status: TokenValidity::Valid, id: Some(user.id), name: Some(user.name) }
            }
            None => Self { status: TokenValidity::Invalid, id: None, name: None },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PruneSummary {
    pub builds_deleted: usize,
    pub channels_recounted: usize,
    pub tokens_deleted: usize,
    pub channels_deleted: usize,
}

/// Build maker use cases. Each call opens the database, so the value is cheap to clone and
/// share between request handlers.
pub struct BuildMakerApi<I> {
    db_path: PathBuf,
    settings: Settings,
    catalog: ReleaseCatalog,
    identity: Arc<I>,
}

impl<I> Clone for BuildMakerApi<I> {
    fn clone(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            settings: self.settings,
            catalog: self.catalog.clone(),
            identity: Arc::clone(&self.identity),
        }
    }
}

impl<I> Debug for BuildMakerApi<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildMakerApi")
            .field("db_path", &self.db_path)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<I: IdentityProvider> BuildMakerApi<I> {
    #[must_use]
    pub fn new(db_path: PathBuf, settings: Settings, catalog: ReleaseCatalog, identity: I) -> Self {
        Self { db_path, settings, catalog, identity: Arc::new(identity) }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    async fn require_user(&self, token: &str) -> Result<TwitchUser, ApiError> {
        if token.is_empty() {
            return Err(ApiError::Forbidden("missing token".to_string()));
        }
        self.identity
            .validate_token(token)
            .await?
            .ok_or_else(|| ApiError::Forbidden("invalid token".to_string()))
    }

    fn require_channel(store: &SqliteStore, channel_id: &str) -> Result<Channel, ApiError> {
        store.get_channel(channel_id)?.ok_or_else(|| ApiError::NotFound("channel".to_string()))
    }

    fn require_manager(
        channel: &Channel,
        channel_id: &str,
        user: &TwitchUser,
    ) -> Result<(), ApiError> {
        if channel.is_managed_by(channel_id, &user.id) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("not a channel owner or moderator".to_string()))
        }
    }

    fn require_owner(channel_id: &str, user: &TwitchUser) -> Result<(), ApiError> {
        if channel_id == user.id {
            Ok(())
        } else {
            Err(ApiError::Forbidden("not the channel owner".to_string()))
        }
    }

    /// Apply pending schema migrations and report the resulting status.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Options selectable at `now`.
    ///
    /// # Errors
    /// Returns [`ApiError::Internal`] when no release is active or its catalog cannot load.
    pub fn build_options(&self, now: Millis) -> Result<OptionCatalog, ApiError> {
        Ok(self.catalog.active_catalog(now)?)
    }

    /// # Errors
    /// Returns [`ApiError::Internal`] when the store cannot be read.
    pub fn list_channels(&self) -> Result<Vec<ChannelEntry>, ApiError> {
        Ok(self.open_store()?.list_channels()?)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown channel.
    pub fn get_channel(&self, channel_id: &str) -> Result<ChannelView, ApiError> {
        let store = self.open_store()?;
        let channel = Self::require_channel(&store, channel_id)?;
        Ok(ChannelView { channel_id: channel_id.to_string(), channel })
    }

    /// Create (or reset) the channel owned by the token's user.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for an invalid token and [`ApiError::Internal`] when
    /// the identity provider or store fails.
    pub async fn create_channel(&self, token: &str, now: Millis) -> Result<ChannelView, ApiError> {
        let user = self.require_user(token).await?;
        let info = self.identity.channel_info(&user.id, token).await?;
        let mods = self.identity.channel_mods(&user.id, token).await?;

        let store = self.open_store()?;
        let mut channel = Channel::new(info, mods, now);
        store.put_channel(&user.id, &channel)?;
        if let Some(counts) = store.update_channel_counts(&user.id, Some(now))? {
            channel.counts = counts;
        }

        tracing::info!(channel_id = %user.id, mods = channel.mods.len(), "created channel");
        Ok(ChannelView { channel_id: user.id, channel })
    }

    /// Delete a channel. Only the owner may do this. `None` when there was nothing to delete.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless the token belongs to the channel owner.
    pub async fn delete_channel(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Result<Option<Channel>, ApiError> {
        let user = self.require_user(token).await?;
        Self::require_owner(channel_id, &user)?;

        let store = self.open_store()?;
        let Some(channel) = store.get_channel(channel_id)? else {
            return Ok(None);
        };
        store.delete_channel(channel_id)?;

        tracing::info!(channel_id, "deleted channel");
        Ok(Some(channel))
    }

    /// Refresh the moderator list from the identity provider.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless the token belongs to the channel owner, and
    /// [`ApiError::NotFound`] for an unknown channel.
    pub async fn update_mods(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Result<Vec<ChannelMod>, ApiError> {
        let user = self.require_user(token).await?;
        Self::require_owner(channel_id, &user)?;
        {
            let store = self.open_store()?;
            Self::require_channel(&store, channel_id)?;
        }

        let mods = self.identity.channel_mods(channel_id, token).await?;

        let store = self.open_store()?;
        let mut channel = Self::require_channel(&store, channel_id)?;
        channel.mods.clone_from(&mods);
        store.put_channel(channel_id, &channel)?;

        tracing::info!(channel_id, mods = mods.len(), "updated channel moderators");
        Ok(mods)
    }

    /// Edit channel notes or disabled options.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for callers who do not manage the channel or paths
    /// outside the channel allowlist, [`ApiError::NotFound`] for an unknown channel, and
    /// [`ApiError::BadRequest`] for a patch that cannot be applied.
    pub async fn patch_channel(
        &self,
        channel_id: &str,
        token: &str,
        patch: &Value,
    ) -> Result<ChannelView, ApiError> {
        let operations = PatchOperation::parse_all(patch)?;
        authorize_channel_patch(&operations)?;
        let user = self.require_user(token).await?;

        let store = self.open_store()?;
        let channel = Self::require_channel(&store, channel_id)?;
        Self::require_manager(&channel, channel_id, &user)?;

        let patched = apply_channel_patch(&channel, &operations)?;
        store.put_channel(channel_id, &patched)?;

        tracing::info!(channel_id, operations = operations.len(), "patched channel");
        Ok(ChannelView { channel_id: channel_id.to_string(), channel: patched })
    }

    /// Issue a submission token for `{"submitter": "<name>"}`.
    ///
    /// # Errors
    /// Returns [`ApiError::BadRequest`] for a bad payload, [`ApiError::Forbidden`] for
    /// callers who do not manage the channel and [`ApiError::NotFound`] for an unknown channel.
    pub async fn create_token(
        &self,
        channel_id: &str,
        token: &str,
        payload: &Value,
        now: Millis,
    ) -> Result<Token, ApiError> {
        let submitter = validate_submitter(payload)?;
        let user = self.require_user(token).await?;
        self.issue_token(channel_id, &user, submitter, now)
    }

    fn issue_token(
        &self,
        channel_id: &str,
        user: &TwitchUser,
        submitter: String,
        now: Millis,
    ) -> Result<Token, ApiError> {
        let store = self.open_store()?;
        let channel = Self::require_channel(&store, channel_id)?;
        Self::require_manager(&channel, channel_id, user)?;

        let generator = TokenGenerator::from_settings(&self.settings)?;
        let issued = generator.next_token(&mut rand::thread_rng(), now, |candidate| {
            store.token_value_in_use(channel_id, candidate)
        })?;
        store.put_token(channel_id, &StoredToken::new(issued.clone(), submitter))?;

        tracing::info!(channel_id, expiration = issued.expiration, "created submission token");
        Ok(issued)
    }

    /// Submitter of a live token.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] when the token is unknown or expired.
    pub fn get_token(
        &self,
        channel_id: &str,
        token: &str,
        now: Millis,
    ) -> Result<TokenInfo, ApiError> {
        let store = self.open_store()?;
        match store.get_token(channel_id, token)? {
            Some(stored) if stored.is_live(now) => Ok(TokenInfo { submitter: stored.submitter }),
            _ => Err(ApiError::NotFound("token".to_string())),
        }
    }

    /// # Errors
    /// Returns [`ApiError::Internal`] when the store cannot be read.
    pub fn list_builds(&self, channel_id: &str) -> Result<Vec<BuildEntry>, ApiError> {
        Ok(self.open_store()?.list_builds(channel_id)?)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown build.
    pub fn get_build(&self, channel_id: &str, build_id: &str) -> Result<Build, ApiError> {
        self.open_store()?
            .get_build(channel_id, build_id)?
            .ok_or_else(|| ApiError::NotFound("build".to_string()))
    }

    /// Redeem the live token `build_id` for a validated build.
    ///
    /// The stored build takes its submitter from the token and always starts pending; the
    /// token is consumed and the channel's counts are refreshed.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] when the token is unknown or expired,
    /// [`ApiError::NotFound`] for an unknown channel and [`ApiError::BadRequest`] when the
    /// build fails validation.
    pub fn confirm_build(
        &self,
        channel_id: &str,
        build_id: &str,
        payload: &Value,
        now: Millis,
    ) -> Result<Build, ApiError> {
        let store = self.open_store()?;
        let token = match store.get_token(channel_id, build_id)? {
            Some(token) if token.is_live(now) => token,
            _ => return Err(ApiError::Forbidden("unknown or expired token".to_string())),
        };
        let channel = Self::require_channel(&store, channel_id)?;
        let catalog = self.catalog.active_catalog(now)?;

        let raw = RawBuild {
            completed: None,
            submitter: Some(token.submitter),
            ..RawBuild::from_value(payload)?
        };
        let build = validate_build(&raw, &channel.disabled(), &catalog, &self.settings, now)?;

        store.put_build(channel_id, build_id, &build)?;
        store.delete_token(channel_id, build_id)?;
        store.update_channel_counts(channel_id, Some(now))?;

        tracing::info!(channel_id, build_id, "confirmed build");
        Ok(build)
    }

    /// Mark a build completed or pending and re-derive its expiration.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for callers who do not manage the channel or paths
    /// other than `/completed`, [`ApiError::NotFound`] for an unknown channel or build, and
    /// [`ApiError::BadRequest`] for a patch that cannot be applied.
    pub async fn patch_build(
        &self,
        channel_id: &str,
        build_id: &str,
        token: &str,
        patch: &Value,
        now: Millis,
    ) -> Result<BuildView, ApiError> {
        let operations = PatchOperation::parse_all(patch)?;
        authorize_build_patch(&operations)?;
        let user = self.require_user(token).await?;

        let store = self.open_store()?;
        let channel = Self::require_channel(&store, channel_id)?;
        Self::require_manager(&channel, channel_id, &user)?;
        let build = store
            .get_build(channel_id, build_id)?
            .ok_or_else(|| ApiError::NotFound("build".to_string()))?;

        let patched = apply_build_patch(&build, &operations, &self.settings, now)?;
        store.put_build(channel_id, build_id, &patched)?;
        store.update_channel_counts(channel_id, Some(now))?;

        tracing::info!(channel_id, build_id, completed = patched.is_completed(), "patched build");
        Ok(BuildView {
            build_id: build_id.to_string(),
            channel_id: channel_id.to_string(),
            build: patched,
        })
    }

    /// # Errors
    /// Returns [`ApiError::Internal`] when the identity provider fails.
    pub async fn validate_twitch_token(&self, token: &str) -> Result<TokenStatus, ApiError> {
        if token.is_empty() {
            return Ok(TokenStatus::from(None::<TwitchUser>));
        }
        Ok(TokenStatus::from(self.identity.validate_token(token).await?))
    }

    /// Remove expired builds and tokens, and channels idle for longer than the channel
    /// lifetime. Recounting after build removal leaves `lastModified` untouched.
    ///
    /// # Errors
    /// Returns [`ApiError::Internal`] when any store operation fails.
    pub fn prune(&self, now: Millis) -> Result<PruneSummary, ApiError> {
        let store = self.open_store()?;
        let mut summary = PruneSummary::default();

        let expired_builds = store.expired_builds(now)?;
        for key in &expired_builds {
            if store.delete_build(&key.channel_id, &key.build_id)? {
                summary.builds_deleted += 1;
            }
        }
        let touched: BTreeSet<&str> =
            expired_builds.iter().map(|key| key.channel_id.as_str()).collect();
        for channel_id in touched {
            if store.update_channel_counts(channel_id, None)?.is_some() {
                summary.channels_recounted += 1;
            }
        }

        for key in store.expired_tokens(now)? {
            if store.delete_token(&key.channel_id, &key.token)? {
                summary.tokens_deleted += 1;
            }
        }

        let channel_expire_ms = self.settings.channel_expire_ms();
        for entry in store.list_channels()? {
            if entry.data.last_modified.saturating_add(channel_expire_ms) <= now
                && store.delete_channel(&entry.id)?
            {
                summary.channels_deleted += 1;
            }
        }

        tracing::info!(
            builds = summary.builds_deleted,
            recounted = summary.channels_recounted,
            tokens = summary.tokens_deleted,
            channels = summary.channels_deleted,
            "pruned expired data"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use build_maker_core::{ChannelCounts, ChannelInfo};
    use serde_json::json;

    use super::*;

    /// 2023-11-14, well after the bundled release.
    const NOW: Millis = 1_700_000_000_000;
    const CHANNEL_ID: &str = "123456";
    const MOD_ID: &str = "269300532";

    struct FakeTwitch {
        users: HashMap<&'static str, TwitchUser>,
        mods: Vec<ChannelMod>,
    }

    impl FakeTwitch {
        fn new() -> Self {
            let user = |id: &str, name: &str| TwitchUser {
                id: id.to_string(),
                name: name.to_string(),
                expires_in: 3_600,
            };
            Self {
                users: HashMap::from([
                    ("owner-token", user(CHANNEL_ID, "streamer")),
                    ("mod-token", user(MOD_ID, "mod1")),
                    ("other-token", user("999", "lurker")),
                ]),
                mods: vec![ChannelMod {
                    id: MOD_ID.to_string(),
                    login: "mod1".to_string(),
                    name: "Mod1".to_string(),
                }],
            }
        }
    }

    impl IdentityProvider for FakeTwitch {
        async fn validate_token(&self, token: &str) -> anyhow::Result<Option<TwitchUser>> {
            Ok(self.users.get(token).cloned())
        }

        async fn channel_mods(
            &self,
            _channel_id: &str,
            _token: &str,
        ) -> anyhow::Result<Vec<ChannelMod>> {
            Ok(self.mods.clone())
        }

        async fn channel_info(
            &self,
            channel_id: &str,
            _token: &str,
        ) -> anyhow::Result<ChannelInfo> {
            Ok(ChannelInfo {
                name: format!("channel-{channel_id}"),
                pic: "https://example.test/pic.png".to_string(),
            })
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("build-maker-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn api() -> BuildMakerApi<FakeTwitch> {
        BuildMakerApi::new(
            unique_temp_db_path(),
            Settings::default(),
            ReleaseCatalog::bundled(),
            FakeTwitch::new(),
        )
    }

    fn killer_build() -> Value {
        json!({
            "character": "Wraith",
            "addon1": "Bone Clapper",
            "addon2": "None",
            "offering": "Ebony Memento Mori",
            "perk1": "Dark Devotion",
            "perk2": "Eruption",
            "perk3": "Oppression",
            "perk4": "None"
        })
    }

    async fn channel_with_token(api: &BuildMakerApi<FakeTwitch>) -> Token {
        api.create_channel("owner-token", NOW)
            .await
            .unwrap_or_else(|err| panic!("channel should be created: {err}"));
        api.create_token(CHANNEL_ID, "mod-token", &json!({"submitter": "cfb"}), NOW)
            .await
            .unwrap_or_else(|err| panic!("token should be issued: {err}"))
    }

    fn cleanup(api: &BuildMakerApi<FakeTwitch>) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", api.db_path.display()));
        }
    }

    #[tokio::test]
    async fn create_channel_stores_profile_and_moderators() {
        let api = api();
        let created = api
            .create_channel("owner-token", NOW)
            .await
            .unwrap_or_else(|err| panic!("channel should be created: {err}"));

        assert_eq!(created.channel_id, CHANNEL_ID);
        assert_eq!(created.channel.name, "channel-123456");
        assert_eq!(created.channel.counts, ChannelCounts::default());
        assert_eq!(created.channel.last_modified, NOW);
        assert!(created.channel.disabled_options.is_empty());

        let loaded = api.get_channel(CHANNEL_ID).unwrap_or_else(|err| panic!("get channel: {err}"));
        assert_eq!(loaded, created);

        let listed = api.list_channels().unwrap_or_else(|err| panic!("list channels: {err}"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].data.mods[0].id, MOD_ID);

        assert!(matches!(api.get_channel("missing"), Err(ApiError::NotFound(_))));
        cleanup(&api);
    }

    #[tokio::test]
    async fn create_channel_requires_valid_token() {
        let api = api();
        assert!(matches!(api.create_channel("bogus", NOW).await, Err(ApiError::Forbidden(_))));
        assert!(matches!(api.create_channel("", NOW).await, Err(ApiError::Forbidden(_))));
        cleanup(&api);
    }

    #[tokio::test]
    async fn token_redeems_for_a_pending_build() {
        let api = api();
        let token = channel_with_token(&api).await;
        assert_eq!(token.expiration, NOW + Settings::default().token_expire_ms());

        let info = api
            .get_token(CHANNEL_ID, &token.value, NOW)
            .unwrap_or_else(|err| panic!("token should be readable: {err}"));
        assert_eq!(info.submitter, "cfb");

        let mut payload = killer_build();
        if let Some(object) = payload.as_object_mut() {
            object.insert("completed".to_string(), json!(NOW));
            object.insert("submitter".to_string(), json!("impostor"));
            object.insert("isAdmin".to_string(), json!(true));
        }
        let build = api
            .confirm_build(CHANNEL_ID, &token.value, &payload, NOW)
            .unwrap_or_else(|err| panic!("build should be confirmed: {err}"));

        assert_eq!(build.submitter.as_deref(), Some("cfb"));
        assert_eq!(build.completed, None);
        assert_eq!(build.expiration, NOW + Settings::default().uncompleted_expire_ms());
        assert!(matches!(api.get_token(CHANNEL_ID, &token.value, NOW), Err(ApiError::NotFound(_))));

        let stored = api
            .get_build(CHANNEL_ID, &token.value)
            .unwrap_or_else(|err| panic!("build should be stored: {err}"));
        assert_eq!(stored, build);
        let builds = api.list_builds(CHANNEL_ID).unwrap_or_else(|err| panic!("list builds: {err}"));
        assert_eq!(builds.len(), 1);

        let channel =
            api.get_channel(CHANNEL_ID).unwrap_or_else(|err| panic!("get channel: {err}"));
        assert_eq!(channel.channel.counts, ChannelCounts { completed: 0, pending: 1 });

        // The token is spent.
        assert!(matches!(
            api.confirm_build(CHANNEL_ID, &token.value, &killer_build(), NOW),
            Err(ApiError::Forbidden(_))
        ));
        cleanup(&api);
    }

    #[tokio::test]
    async fn expired_or_unknown_tokens_cannot_confirm() {
        let api = api();
        let token = channel_with_token(&api).await;

        assert!(matches!(
            api.confirm_build(CHANNEL_ID, "nope", &killer_build(), NOW),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            api.confirm_build(CHANNEL_ID, &token.value, &killer_build(), token.expiration),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            api.get_token(CHANNEL_ID, &token.value, token.expiration),
            Err(ApiError::NotFound(_))
        ));
        cleanup(&api);
    }

    #[tokio::test]
    async fn invalid_build_keeps_the_token() {
        let api = api();
        let token = channel_with_token(&api).await;

        let mut payload = killer_build();
        if let Some(object) = payload.as_object_mut() {
            object.insert("perk1".to_string(), json!("Buckle Up"));
        }
        let result = api.confirm_build(CHANNEL_ID, &token.value, &payload, NOW);
        match result {
            Err(ApiError::BadRequest { field, .. }) => assert_eq!(field.as_deref(), Some("perk1")),
            other => panic!("expected bad request, got {other:?}"),
        }
        assert!(api.get_token(CHANNEL_ID, &token.value, NOW).is_ok());
        cleanup(&api);
    }

    #[tokio::test]
    async fn token_issue_requires_manager_and_submitter() {
        let api = api();
        api.create_channel("owner-token", NOW)
            .await
            .unwrap_or_else(|err| panic!("channel should be created: {err}"));

        let submitter = json!({"submitter": "cfb"});
        let denied = api.create_token(CHANNEL_ID, "other-token", &submitter, NOW).await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let bad = api.create_token(CHANNEL_ID, "owner-token", &json!({"name": "cfb"}), NOW).await;
        match bad {
            Err(ApiError::BadRequest { field, .. }) => {
                assert_eq!(field.as_deref(), Some("submitter"));
            }
            other => panic!("expected bad request, got {other:?}"),
        }

        let missing = api.create_token("555", "owner-token", &submitter, NOW).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
        cleanup(&api);
    }

    #[tokio::test]
    async fn completing_a_build_recomputes_expiration_and_counts() {
        let api = api();
        let token = channel_with_token(&api).await;
        api.confirm_build(CHANNEL_ID, &token.value, &killer_build(), NOW)
            .unwrap_or_else(|err| panic!("build should be confirmed: {err}"));

        let completed_at = NOW + 1_000;
        let patched = api
            .patch_build(
                CHANNEL_ID,
                &token.value,
                "mod-token",
                &json!([{"op": "replace", "path": "/completed", "value": completed_at}]),
                NOW + 2_000,
            )
            .await
            .unwrap_or_else(|err| panic!("completion patch should apply: {err}"));

        assert_eq!(patched.build_id, token.value);
        assert_eq!(patched.build.completed, Some(completed_at));
        assert_eq!(
            patched.build.expiration,
            completed_at + Settings::default().completed_expire_ms()
        );

        let channel =
            api.get_channel(CHANNEL_ID).unwrap_or_else(|err| panic!("get channel: {err}"));
        assert_eq!(channel.channel.counts, ChannelCounts { completed: 1, pending: 0 });
        assert_eq!(channel.channel.last_modified, NOW + 2_000);
        cleanup(&api);
    }

    #[tokio::test]
    async fn build_patch_rejections() {
        let api = api();
        let token = channel_with_token(&api).await;
        let confirmed = api.confirm_build(CHANNEL_ID, &token.value, &killer_build(), NOW)
            .unwrap_or_else(|err| panic!("build should be confirmed: {err}"));
        let complete = json!([{"op": "replace", "path": "/completed", "value": NOW}]);

        let character = json!([{"op": "replace", "path": "/character", "value": "Nea"}]);
        assert!(matches!(
            api.patch_build(CHANNEL_ID, &token.value, "owner-token", &character, NOW).await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            api.patch_build(CHANNEL_ID, &token.value, "other-token", &complete, NOW).await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            api.patch_build(CHANNEL_ID, "zzzz", "owner-token", &complete, NOW).await,
            Err(ApiError::NotFound(_))
        ));
        let malformed = json!({"op": "replace"});
        assert!(matches!(
            api.patch_build(CHANNEL_ID, &token.value, "owner-token", &malformed, NOW).await,
            Err(ApiError::BadRequest { .. })
        ));
        let half_applied = json!([
            {"op": "replace", "path": "/completed", "value": NOW},
            {"op": "test", "path": "/completed", "value": 0}
        ]);
        assert!(matches!(
            api.patch_build(CHANNEL_ID, &token.value, "owner-token", &half_applied, NOW).await,
            Err(ApiError::BadRequest { .. })
        ));

        let stored = api
            .get_build(CHANNEL_ID, &token.value)
            .unwrap_or_else(|err| panic!("build should remain stored: {err}"));
        assert_eq!(stored, confirmed);
        assert_eq!(stored.completed, None);
        cleanup(&api);
    }

    #[tokio::test]
    async fn channel_patch_disables_notes_for_new_builds() {
        let api = api();
        let token = channel_with_token(&api).await;

        let patched = api
            .patch_channel(
                CHANNEL_ID,
                "mod-token",
                &json!([{"op": "add", "path": "/disabledOptions/-", "value": "Notes"}]),
            )
            .await
            .unwrap_or_else(|err| panic!("channel patch should apply: {err}"));
        assert_eq!(patched.channel.disabled_options, vec!["Notes".to_string()]);

        let renamed = json!([{"op": "replace", "path": "/name", "value": "Hijacked"}]);
        assert!(matches!(
            api.patch_channel(CHANNEL_ID, "owner-token", &renamed).await,
            Err(ApiError::Forbidden(_))
        ));

        let mut payload = killer_build();
        if let Some(object) = payload.as_object_mut() {
            object.insert("notes".to_string(), json!("Bring a flashlight"));
        }
        assert!(matches!(
            api.confirm_build(CHANNEL_ID, &token.value, &payload, NOW),
            Err(ApiError::Forbidden(_))
        ));
        cleanup(&api);
    }

    #[tokio::test]
    async fn only_the_owner_manages_channel_lifecycle() {
        let api = api();
        api.create_channel("owner-token", NOW)
            .await
            .unwrap_or_else(|err| panic!("channel should be created: {err}"));

        let denied = api.delete_channel(CHANNEL_ID, "mod-token").await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));
        let denied = api.update_mods(CHANNEL_ID, "mod-token").await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let mods = api
            .update_mods(CHANNEL_ID, "owner-token")
            .await
            .unwrap_or_else(|err| panic!("mods should refresh: {err}"));
        assert_eq!(mods.len(), 1);

        let deleted = api
            .delete_channel(CHANNEL_ID, "owner-token")
            .await
            .unwrap_or_else(|err| panic!("channel should delete: {err}"));
        assert_eq!(deleted.map(|channel| channel.name), Some("channel-123456".to_string()));

        let again = api
            .delete_channel(CHANNEL_ID, "owner-token")
            .await
            .unwrap_or_else(|err| panic!("second delete should succeed: {err}"));
        assert_eq!(again, None);
        let gone = api.update_mods(CHANNEL_ID, "owner-token").await;
        assert!(matches!(gone, Err(ApiError::NotFound(_))));
        cleanup(&api);
    }

    #[tokio::test]
    async fn prune_removes_expired_data() {
        let api = api();
        let token = channel_with_token(&api).await;
        let build = api
            .confirm_build(CHANNEL_ID, &token.value, &killer_build(), NOW)
            .unwrap_or_else(|err| panic!("build should be confirmed: {err}"));
        let second = api
            .create_token(CHANNEL_ID, "owner-token", &json!({"submitter": "late"}), NOW)
            .await
            .unwrap_or_else(|err| panic!("token should be issued: {err}"));

        let nothing = api.prune(NOW).unwrap_or_else(|err| panic!("prune: {err}"));
        assert_eq!(nothing, PruneSummary::default());

        let summary = api.prune(build.expiration).unwrap_or_else(|err| panic!("prune: {err}"));
        assert_eq!(
            summary,
            PruneSummary {
                builds_deleted: 1,
                channels_recounted: 1,
                tokens_deleted: 1,
                channels_deleted: 0,
            }
        );
        assert!(matches!(
            api.get_token(CHANNEL_ID, &second.value, NOW),
            Err(ApiError::NotFound(_))
        ));

        let channel =
            api.get_channel(CHANNEL_ID).unwrap_or_else(|err| panic!("get channel: {err}"));
        assert_eq!(channel.channel.counts, ChannelCounts::default());
        assert_eq!(channel.channel.last_modified, NOW);

        let idle = NOW + Settings::default().channel_expire_ms();
        let summary = api.prune(idle).unwrap_or_else(|err| panic!("prune: {err}"));
        assert_eq!(summary.channels_deleted, 1);
        assert!(api.list_channels().unwrap_or_else(|err| panic!("list: {err}")).is_empty());
        cleanup(&api);
    }

    #[tokio::test]
    async fn prune_removes_builds_with_non_positive_expiration() {
        let api = api();
        let token = channel_with_token(&api).await;
        let mut payload = killer_build();
        if let Some(object) = payload.as_object_mut() {
            object.insert("expiration".to_string(), json!(-1));
        }
        let build = api
            .confirm_build(CHANNEL_ID, &token.value, &payload, NOW)
            .unwrap_or_else(|err| panic!("build should be confirmed: {err}"));
        assert_eq!(build.expiration, -1);

        let summary = api.prune(NOW).unwrap_or_else(|err| panic!("prune: {err}"));
        assert_eq!(summary.builds_deleted, 1);
        assert_eq!(summary.channels_recounted, 1);
        assert!(matches!(api.get_build(CHANNEL_ID, &token.value), Err(ApiError::NotFound(_))));

        let channel =
            api.get_channel(CHANNEL_ID).unwrap_or_else(|err| panic!("get channel: {err}"));
        assert_eq!(channel.channel.counts, ChannelCounts::default());
        cleanup(&api);
    }

    #[tokio::test]
    async fn twitch_token_status_reports_validity() {
        let api = api();
        let valid = api
            .validate_twitch_token("owner-token")
            .await
            .unwrap_or_else(|err| panic!("validation: {err}"));
        assert_eq!(valid.status, TokenValidity::Valid);
        assert_eq!(valid.id.as_deref(), Some(CHANNEL_ID));

        let invalid = api
            .validate_twitch_token("nope")
            .await
            .unwrap_or_else(|err| panic!("validation: {err}"));
        assert_eq!(invalid, TokenStatus { status: TokenValidity::Invalid, id: None, name: None });
        cleanup(&api);
    }

    #[test]
    fn build_options_follow_the_release_schedule() {
        let api = api();
        let catalog = api.build_options(NOW).unwrap_or_else(|err| panic!("options: {err}"));
        assert!(catalog.killer.characters.contains_key("Wraith"));
        assert!(matches!(api.build_options(0), Err(ApiError::Internal(_))));
    }

    #[test]
    fn core_errors_map_to_api_errors() {
        assert!(matches!(
            ApiError::from(CoreError::InvalidField("perk1".to_string())),
            ApiError::BadRequest { field: Some(field), .. } if field == "perk1"
        ));
        assert!(matches!(
            ApiError::from(CoreError::Forbidden("notes".to_string())),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::from(CoreError::MalformedPatch("x".to_string())),
            ApiError::BadRequest { field: None, .. }
        ));
        assert!(matches!(
            ApiError::from(CoreError::Catalog("x".to_string())),
            ApiError::Internal(_)
        ));
    }
}
