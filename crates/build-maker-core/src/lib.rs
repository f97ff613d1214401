//! Domain core for the build maker: versioned option catalogs, build and submitter
//! validation, patch authorization, and submission token generation.
//!
//! Everything in this crate is synchronous and free of persistence concerns. Callers
//! supply the current time, the channel's disabled options and [`Settings`] explicitly.

mod catalog;
mod error;
mod model;
mod patch;
mod settings;
mod token;
mod validate;

pub use catalog::{
    resolve_active, BundledCatalogs, CatalogLoader, DirectoryCatalogs, KillerOptions,
    OptionCatalog, Release, ReleaseCatalog, ReleaseSchedule, ScheduledRelease, SurvivorOptions,
    BUNDLED_SCHEDULE_JSON,
};
pub use error::CoreError;
pub use model::{
    Build, Channel, ChannelCounts, ChannelInfo, ChannelMod, DisabledOptions, RawBuild,
    StoredToken, Token, ANY_OPTION, NONE_OPTION,
};
pub use patch::{
    apply_build_patch, apply_channel_patch, apply_patch, authorize_build_patch,
    authorize_channel_patch, authorize_patch, PatchOperation,
};
pub use settings::Settings;
pub use token::{decode_token_value, encode_token_value, TokenGenerator, TOKEN_ALPHABET};
pub use validate::{validate_build, validate_submitter};

/// Milliseconds since the Unix epoch. Every timestamp in the system uses this unit.
pub type Millis = i64;

/// Current wall-clock time in [`Millis`].
#[must_use]
pub fn now_millis() -> Millis {
    to_millis(time::OffsetDateTime::now_utc())
}

/// Convert an instant to [`Millis`], saturating outside the `i64` range.
#[must_use]
pub fn to_millis(value: time::OffsetDateTime) -> Millis {
    Millis::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(Millis::MAX)
}
