use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{to_millis, CoreError, Millis};

/// Release schedule compiled into the binary.
pub const BUNDLED_SCHEDULE_JSON: &str = include_str!("../catalogs/releases.json");

const BUNDLED_CATALOGS: &[(&str, &str)] =
    &[("chapter-26", include_str!("../catalogs/chapter-26.json"))];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillerOptions {
    /// Killer name to the add-ons that killer may bring.
    pub characters: BTreeMap<String, Vec<String>>,
    pub offerings: Vec<String>,
    pub perks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurvivorOptions {
    pub characters: Vec<String>,
    /// Item name to the add-ons that fit the item.
    pub items: BTreeMap<String, Vec<String>>,
    pub offerings: Vec<String>,
    pub perks: Vec<String>,
}

/// The selectable options of one game release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionCatalog {
    pub killer: KillerOptions,
    pub survivor: SurvivorOptions,
}

impl OptionCatalog {
    /// Parse a catalog document.
    ///
    /// # Errors
    /// Returns [`CoreError::Catalog`] when the document does not match the catalog shape.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|err| CoreError::Catalog(format!("invalid catalog: {err}")))
    }
}

/// A catalog together with the instant it takes effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub effective_at: Millis,
    pub catalog: OptionCatalog,
}

/// Latest entry whose effective time is not after `now`. Ties keep the earlier entry in
/// input order; input order is otherwise irrelevant.
fn latest_effective<T>(
    now: Millis,
    entries: &[T],
    effective_at: impl Fn(&T) -> Millis,
) -> Option<&T> {
    entries.iter().filter(|entry| effective_at(entry) <= now).reduce(|best, entry| {
        if effective_at(entry) > effective_at(best) {
            entry
        } else {
            best
        }
    })
}

/// Select the catalog in force at `now`.
///
/// # Errors
/// Returns [`CoreError::NoActiveRelease`] when `releases` is empty or every release takes
/// effect after `now`.
pub fn resolve_active(now: Millis, releases: &[Release]) -> Result<&OptionCatalog, CoreError> {
    latest_effective(now, releases, |release| release.effective_at)
        .map(|release| &release.catalog)
        .ok_or(CoreError::NoActiveRelease { now })
}

/// One row of the release schedule: which catalog takes effect when.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRelease {
    pub release_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub release_time: OffsetDateTime,
}

impl ScheduledRelease {
    #[must_use]
    pub fn effective_at(&self) -> Millis {
        to_millis(self.release_time)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ReleaseSchedule(Vec<ScheduledRelease>);

impl ReleaseSchedule {
    #[must_use]
    pub fn new(entries: Vec<ScheduledRelease>) -> Self {
        Self(entries)
    }

    /// Parse a schedule document (a JSON array of `{releaseId, releaseTime}`).
    ///
    /// # Errors
    /// Returns [`CoreError::Catalog`] when the document is not a valid schedule.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|err| CoreError::Catalog(format!("invalid release schedule: {err}")))
    }

    #[must_use]
    pub fn entries(&self) -> &[ScheduledRelease] {
        &self.0
    }

    /// The release in force at `now`.
    ///
    /// # Errors
    /// Returns [`CoreError::NoActiveRelease`] when no scheduled release has started.
    pub fn active_release(&self, now: Millis) -> Result<&ScheduledRelease, CoreError> {
        latest_effective(now, &self.0, ScheduledRelease::effective_at)
            .ok_or(CoreError::NoActiveRelease { now })
    }
}

/// Source of release schedules and the catalogs they name.
pub trait CatalogLoader: Send + Sync {
    /// # Errors
    /// Returns [`CoreError::Catalog`] when the schedule cannot be read.
    fn schedule(&self) -> Result<ReleaseSchedule, CoreError>;

    /// # Errors
    /// Returns [`CoreError::Catalog`] when the catalog for `release_id` is unknown or unreadable.
    fn load(&self, release_id: &str) -> Result<OptionCatalog, CoreError>;
}

/// Catalogs compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundledCatalogs;

impl CatalogLoader for BundledCatalogs {
    fn schedule(&self) -> Result<ReleaseSchedule, CoreError> {
        ReleaseSchedule::from_json(BUNDLED_SCHEDULE_JSON)
    }

    fn load(&self, release_id: &str) -> Result<OptionCatalog, CoreError> {
        let (_, raw) = BUNDLED_CATALOGS
            .iter()
            .find(|(id, _)| *id == release_id)
            .ok_or_else(|| {
                CoreError::Catalog(format!("no bundled catalog for release {release_id}"))
            })?;
        OptionCatalog::from_json(raw)
    }
}

/// Catalogs read from `<root>/releases.json` and `<root>/<release_id>.json` on every call,
/// so a new release can be published without redeploying.
#[derive(Debug, Clone)]
pub struct DirectoryCatalogs {
    root: PathBuf,
}

impl DirectoryCatalogs {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, file_name: &str) -> Result<String, CoreError> {
        let path = self.root.join(file_name);
        std::fs::read_to_string(&path)
            .map_err(|err| CoreError::Catalog(format!("failed to read {}: {err}", path.display())))
    }
}

impl CatalogLoader for DirectoryCatalogs {
    fn schedule(&self) -> Result<ReleaseSchedule, CoreError> {
        ReleaseSchedule::from_json(&self.read("releases.json")?)
    }

    fn load(&self, release_id: &str) -> Result<OptionCatalog, CoreError> {
        let is_plain_name = !release_id.is_empty()
            && Path::new(release_id).file_name().and_then(|name| name.to_str()) == Some(release_id)
            && release_id != "..";
        if !is_plain_name {
            return Err(CoreError::Catalog(format!("invalid release id: {release_id}")));
        }
        OptionCatalog::from_json(&self.read(&format!("{release_id}.json"))?)
    }
}

/// Resolves the active catalog through a [`CatalogLoader`].
///
/// A release whose catalog fails to load is a hard failure; older releases are never
/// substituted for it.
#[derive(Clone)]
pub struct ReleaseCatalog {
    loader: Arc<dyn CatalogLoader>,
}

impl ReleaseCatalog {
    pub fn new(loader: impl CatalogLoader + 'static) -> Self {
        Self { loader: Arc::new(loader) }
    }

    #[must_use]
    pub fn bundled() -> Self {
        Self::new(BundledCatalogs)
    }

    /// # Errors
    /// Returns [`CoreError::Catalog`] when the schedule is unreadable, or
    /// [`CoreError::NoActiveRelease`] when nothing has been released by `now`.
    pub fn active_release(&self, now: Millis) -> Result<ScheduledRelease, CoreError> {
        let schedule = self.loader.schedule()?;
        schedule.active_release(now).cloned()
    }

    /// # Errors
    /// Same as [`ReleaseCatalog::active_release`], plus [`CoreError::Catalog`] when the
    /// active release's catalog cannot be loaded.
    pub fn active_catalog(&self, now: Millis) -> Result<OptionCatalog, CoreError> {
        let release = self.active_release(now)?;
        self.loader.load(&release.release_id)
    }
}

impl Debug for ReleaseCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseCatalog").finish_non_exhaustive()
    }
}
