use std::path::Path;

use anyhow::{anyhow, Context, Result};
use build_maker_core::{Build, Channel, ChannelCounts, Millis, StoredToken};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS builds (
  channel_id TEXT NOT NULL,
  build_id TEXT NOT NULL,
  data_json TEXT NOT NULL,
  expiration INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (channel_id, build_id)
);

CREATE TABLE IF NOT EXISTS channels (
  channel_id TEXT PRIMARY KEY,
  data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
  channel_id TEXT NOT NULL,
  token TEXT NOT NULL,
  submitter TEXT NOT NULL,
  expiration INTEGER NOT NULL,
  PRIMARY KEY (channel_id, token)
);

CREATE INDEX IF NOT EXISTS idx_builds_expiration ON builds(expiration);
CREATE INDEX IF NOT EXISTS idx_tokens_expiration ON tokens(expiration);
";

/// Builds, channels and submission tokens keyed the way the handlers address them.
///
/// Writes are independent statements; read-modify-write sequences such as
/// [`SqliteStore::update_channel_counts`] take no lock and may race with other writers.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// A stored build together with its keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildEntry {
    pub channel_id: String,
    pub id: String,
    pub data: Build,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelEntry {
    pub id: String,
    pub data: Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BuildKey {
    pub channel_id: String,
    pub build_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenKey {
    pub channel_id: String,
    pub token: String,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database was written by a newer
    /// schema.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup or JSON decoding fails.
    pub fn get_build(&self, channel_id: &str, build_id: &str) -> Result<Option<Build>> {
        let value = self
            .conn
            .query_row(
                "SELECT data_json FROM builds WHERE channel_id = ?1 AND build_id = ?2",
                params![channel_id, build_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read build")?;
        value.map(|json| decode(&json, "build")).transpose()
    }

    /// Insert or overwrite a build.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put_build(&self, channel_id: &str, build_id: &str, build: &Build) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO builds(channel_id, build_id, data_json, expiration)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel_id, build_id)
                 DO UPDATE SET data_json = excluded.data_json, expiration = excluded.expiration",
                params![channel_id, build_id, encode(build, "build")?, build.expiration],
            )
            .context("failed to write build")?;
        Ok(())
    }

    /// Returns whether a build was deleted.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_build(&self, channel_id: &str, build_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM builds WHERE channel_id = ?1 AND build_id = ?2",
                params![channel_id, build_id],
            )
            .context("failed to delete build")?;
        Ok(deleted > 0)
    }

    /// All builds of one channel, ordered by build id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_builds(&self, channel_id: &str) -> Result<Vec<BuildEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT build_id, data_json FROM builds WHERE channel_id = ?1 ORDER BY build_id ASC",
        )?;
        let mut rows = stmt.query(params![channel_id])?;
        let mut builds = Vec::new();

        while let Some(row) = rows.next()? {
            let json: String = row.get(1)?;
            builds.push(BuildEntry {
                channel_id: channel_id.to_string(),
                id: row.get(0)?,
                data: decode(&json, "build")?,
            });
        }

        Ok(builds)
    }

    /// Keys of builds whose expiration is at or before `now`.
    ///
    /// # Errors
    /// Returns an error when the scan fails.
    pub fn expired_builds(&self, now: Millis) -> Result<Vec<BuildKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel_id, build_id FROM builds
             WHERE expiration <= ?1
             ORDER BY channel_id ASC, build_id ASC",
        )?;
        let keys = stmt
            .query_map(params![now], |row| {
                Ok(BuildKey { channel_id: row.get(0)?, build_id: row.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to scan expired builds")?;
        Ok(keys)
    }

    /// # Errors
    /// Returns an error when lookup or JSON decoding fails.
    pub fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let value = self
            .conn
            .query_row(
                "SELECT data_json FROM channels WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read channel")?;
        value.map(|json| decode(&json, "channel")).transpose()
    }

    /// Insert or overwrite a channel.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put_channel(&self, channel_id: &str, channel: &Channel) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO channels(channel_id, data_json) VALUES (?1, ?2)
                 ON CONFLICT(channel_id) DO UPDATE SET data_json = excluded.data_json",
                params![channel_id, encode(channel, "channel")?],
            )
            .context("failed to write channel")?;
        Ok(())
    }

    /// Returns whether a channel was deleted. Its builds and tokens are left to expire.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_channel(&self, channel_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM channels WHERE channel_id = ?1", params![channel_id])
            .context("failed to delete channel")?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_channels(&self) -> Result<Vec<ChannelEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel_id, data_json FROM channels
             ORDER BY channel_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut channels = Vec::new();

        while let Some(row) = rows.next()? {
            let json: String = row.get(1)?;
            channels.push(ChannelEntry { id: row.get(0)?, data: decode(&json, "channel")? });
        }

        Ok(channels)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_token(&self, channel_id: &str, token: &str) -> Result<Option<StoredToken>> {
        self.conn
            .query_row(
                "SELECT token, expiration, submitter FROM tokens
                 WHERE channel_id = ?1 AND token = ?2",
                params![channel_id, token],
                |row| {
                    Ok(StoredToken {
                        value: row.get(0)?,
                        expiration: row.get(1)?,
                        submitter: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to read token")
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn put_token(&self, channel_id: &str, token: &StoredToken) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tokens(channel_id, token, submitter, expiration)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel_id, token)
                 DO UPDATE SET submitter = excluded.submitter, expiration = excluded.expiration",
                params![channel_id, token.value, token.submitter, token.expiration],
            )
            .context("failed to write token")?;
        Ok(())
    }

    /// Returns whether a token was deleted.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_token(&self, channel_id: &str, token: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM tokens WHERE channel_id = ?1 AND token = ?2",
                params![channel_id, token],
            )
            .context("failed to delete token")?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when the scan fails.
    pub fn expired_tokens(&self, now: Millis) -> Result<Vec<TokenKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel_id, token FROM tokens
             WHERE expiration <= ?1
             ORDER BY channel_id ASC, token ASC",
        )?;
        let keys = stmt
            .query_map(params![now], |row| {
                Ok(TokenKey { channel_id: row.get(0)?, token: row.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to scan expired tokens")?;
        Ok(keys)
    }

    /// Whether `value` is taken in the channel, either as a token or as a build id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn token_value_in_use(&self, channel_id: &str, value: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tokens WHERE channel_id = ?1 AND token = ?2)
                     OR EXISTS(SELECT 1 FROM builds WHERE channel_id = ?1 AND build_id = ?2)",
                params![channel_id, value],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check token value")?;
        Ok(exists == 1)
    }

    /// Recount the channel's builds and store the counts on the channel record.
    /// `touch_at` also refreshes `lastModified`. Returns `None` when the channel is missing.
    ///
    /// # Errors
    /// Returns an error when any read or write fails.
    pub fn update_channel_counts(
        &self,
        channel_id: &str,
        touch_at: Option<Millis>,
    ) -> Result<Option<ChannelCounts>> {
        let builds = self.list_builds(channel_id)?;
        let counts = ChannelCounts::tally(builds.iter().map(|entry| &entry.data));

        let Some(mut channel) = self.get_channel(channel_id)? else {
            return Ok(None);
        };
        channel.counts = counts;
        if let Some(touch_at) = touch_at {
            channel.last_modified = touch_at;
        }
        self.put_channel(channel_id, &channel)?;

        Ok(Some(counts))
    }
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {what}"))
}

fn decode<T: DeserializeOwned>(json: &str, what: &str) -> Result<T> {
    serde_json::from_str(json).with_context(|| format!("failed to deserialize stored {what}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
