use std::collections::BTreeSet;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};

use crate::{CoreError, Millis};

/// Wildcard selection present in every option list.
pub const ANY_OPTION: &str = "Any";
/// "Nothing selected" value present in every option list.
pub const NONE_OPTION: &str = "None";

/// A validated build as persisted for a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub character: String,
    pub addon1: String,
    pub addon2: String,
    pub offering: String,
    pub perk1: String,
    pub perk2: String,
    pub perk3: String,
    pub perk4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_millis"
    )]
    pub completed: Option<Millis>,
    #[serde(deserialize_with = "deserialize_millis")]
    pub expiration: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
}

impl Build {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}

/// An unvalidated build submission. Every field is optional so that missing values can be
/// reported as field errors instead of decode failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBuild {
    pub character: Option<String>,
    pub addon1: Option<String>,
    pub addon2: Option<String>,
    pub offering: Option<String>,
    pub perk1: Option<String>,
    pub perk2: Option<String>,
    pub perk3: Option<String>,
    pub perk4: Option<String>,
    pub item: Option<String>,
    pub notes: Option<String>,
    pub completed: Option<Millis>,
    pub expiration: Option<Millis>,
    pub submitter: Option<String>,
}

impl RawBuild {
    /// Read the recognised build fields out of a JSON document. Unknown properties are
    /// dropped; a recognised property holding the wrong JSON type is a field error.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] naming the first mistyped field, or `build`
    /// when the document is not an object.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        let Some(object) = value.as_object() else {
            return Err(CoreError::invalid_field("build"));
        };

        Ok(Self {
            character: string_field(object, "character")?,
            addon1: string_field(object, "addon1")?,
            addon2: string_field(object, "addon2")?,
            offering: string_field(object, "offering")?,
            perk1: string_field(object, "perk1")?,
            perk2: string_field(object, "perk2")?,
            perk3: string_field(object, "perk3")?,
            perk4: string_field(object, "perk4")?,
            item: string_field(object, "item")?,
            notes: string_field(object, "notes")?,
            completed: millis_field(object, "completed")?,
            expiration: millis_field(object, "expiration")?,
            submitter: string_field(object, "submitter")?,
        })
    }
}

impl From<&Build> for RawBuild {
    fn from(build: &Build) -> Self {
        Self {
            character: Some(build.character.clone()),
            addon1: Some(build.addon1.clone()),
            addon2: Some(build.addon2.clone()),
            offering: Some(build.offering.clone()),
            perk1: Some(build.perk1.clone()),
            perk2: Some(build.perk2.clone()),
            perk3: Some(build.perk3.clone()),
            perk4: Some(build.perk4.clone()),
            item: build.item.clone(),
            notes: build.notes.clone(),
            completed: build.completed,
            expiration: Some(build.expiration),
            submitter: build.submitter.clone(),
        }
    }
}

fn string_field(object: &Map<String, Value>, field: &str) -> Result<Option<String>, CoreError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(CoreError::invalid_field(field)),
    }
}

fn millis_field(object: &Map<String, Value>, field: &str) -> Result<Option<Millis>, CoreError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => {
            number_to_millis(number).map(Some).ok_or_else(|| CoreError::invalid_field(field))
        }
        Some(_) => Err(CoreError::invalid_field(field)),
    }
}

/// Browsers send `Date.now()` results that may arrive as whole-number floats.
#[allow(clippy::cast_possible_truncation)]
fn number_to_millis(number: &Number) -> Option<Millis> {
    if let Some(value) = number.as_i64() {
        return Some(value);
    }
    match number.as_f64() {
        Some(value) if value.is_finite() && value.fract() == 0.0 => Some(value as Millis),
        _ => None,
    }
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
    let number = Number::deserialize(deserializer)?;
    number_to_millis(&number)
        .ok_or_else(|| D::Error::custom(format!("invalid timestamp {number}")))
}

fn deserialize_optional_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Millis>, D::Error> {
    match Option::<Number>::deserialize(deserializer)? {
        Some(number) => number_to_millis(&number)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp {number}"))),
        None => Ok(None),
    }
}

/// Options a channel owner has switched off. Besides option and character names the set
/// may hold the category switches [`DisabledOptions::KILLERS`],
/// [`DisabledOptions::SURVIVORS`] and [`DisabledOptions::NOTES`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisabledOptions(BTreeSet<String>);

impl DisabledOptions {
    pub const KILLERS: &'static str = "Killers";
    pub const SURVIVORS: &'static str = "Survivors";
    pub const NOTES: &'static str = "Notes";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_disabled(&self, option: &str) -> bool {
        self.0.contains(option)
    }

    #[must_use]
    pub fn is_enabled(&self, option: &str) -> bool {
        !self.is_disabled(option)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for DisabledOptions {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<&[String]> for DisabledOptions {
    fn from(values: &[String]) -> Self {
        values.iter().cloned().collect()
    }
}

/// A moderator of a channel as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMod {
    #[serde(alias = "user_id")]
    pub id: String,
    #[serde(alias = "user_login")]
    pub login: String,
    #[serde(alias = "user_name")]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelCounts {
    pub completed: u32,
    pub pending: u32,
}

impl ChannelCounts {
    /// Tally completed and pending builds.
    pub fn tally<'a>(builds: impl IntoIterator<Item = &'a Build>) -> Self {
        builds.into_iter().fold(Self::default(), |counts, build| {
            if build.is_completed() {
                Self { completed: counts.completed + 1, ..counts }
            } else {
                Self { pending: counts.pending + 1, ..counts }
            }
        })
    }
}

/// Public profile of a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub pic: String,
}

/// A channel record. The channel key is the owning user's identity-provider id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub name: String,
    pub pic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub disabled_options: Vec<String>,
    #[serde(default)]
    pub mods: Vec<ChannelMod>,
    #[serde(default)]
    pub counts: ChannelCounts,
    #[serde(default)]
    pub last_modified: Millis,
}

impl Channel {
    #[must_use]
    pub fn new(info: ChannelInfo, mods: Vec<ChannelMod>, now: Millis) -> Self {
        Self {
            name: info.name,
            pic: info.pic,
            notes: None,
            disabled_options: Vec::new(),
            mods,
            counts: ChannelCounts::default(),
            last_modified: now,
        }
    }

    #[must_use]
    pub fn disabled(&self) -> DisabledOptions {
        DisabledOptions::from(self.disabled_options.as_slice())
    }

    /// Whether `user_id` may manage builds and tokens of the channel keyed `channel_id`.
    #[must_use]
    pub fn is_managed_by(&self, channel_id: &str, user_id: &str) -> bool {
        channel_id == user_id || self.mods.iter().any(|moderator| moderator.id == user_id)
    }
}

/// A submission token as handed to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expiration: Millis,
}

/// A token as persisted, carrying the submitter it was issued for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    pub value: String,
    pub expiration: Millis,
    pub submitter: String,
}

impl StoredToken {
    #[must_use]
    pub fn new(token: Token, submitter: String) -> Self {
        Self { value: token.value, expiration: token.expiration, submitter }
    }

    #[must_use]
    pub fn is_live(&self, now: Millis) -> bool {
        self.expiration > now
    }
}
