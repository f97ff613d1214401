use serde_json::Value;

use crate::{
    Build, CoreError, DisabledOptions, Millis, OptionCatalog, RawBuild, Settings, ANY_OPTION,
    NONE_OPTION,
};

enum Role<'a> {
    Killer { addons: &'a [String] },
    Survivor,
}

/// Value of `field` if it is one of `allowed` and not disabled.
fn allowed_value<'a>(
    value: Option<&'a str>,
    field: &str,
    allowed: &[String],
    disabled: &DisabledOptions,
) -> Result<&'a str, CoreError> {
    match value {
        Some(value)
            if disabled.is_enabled(value) && allowed.iter().any(|option| option == value) =>
        {
            Ok(value)
        }
        _ => Err(CoreError::invalid_field(field)),
    }
}

fn resolve_role<'a>(
    character: Option<&str>,
    catalog: &'a OptionCatalog,
    disabled: &DisabledOptions,
) -> Result<Role<'a>, CoreError> {
    let Some(character) = character else {
        return Err(CoreError::invalid_field("character"));
    };
    if disabled.is_disabled(character) {
        return Err(CoreError::invalid_field("character"));
    }

    if disabled.is_enabled(DisabledOptions::KILLERS) {
        if let Some(addons) = catalog.killer.characters.get(character) {
            return Ok(Role::Killer { addons });
        }
    }

    // "Any" is listed for both roles; with killers switched off it still resolves here.
    if disabled.is_enabled(DisabledOptions::SURVIVORS)
        && catalog.survivor.characters.iter().any(|name| name == character)
    {
        return Ok(Role::Survivor);
    }

    Err(CoreError::invalid_field("character"))
}

fn check_perks(
    raw: &RawBuild,
    perks: &[String],
    disabled: &DisabledOptions,
) -> Result<(), CoreError> {
    for (field, value) in [
        ("perk1", &raw.perk1),
        ("perk2", &raw.perk2),
        ("perk3", &raw.perk3),
        ("perk4", &raw.perk4),
    ] {
        allowed_value(value.as_deref(), field, perks, disabled)?;
    }
    Ok(())
}

fn check_killer(
    raw: &RawBuild,
    addons: &[String],
    catalog: &OptionCatalog,
    disabled: &DisabledOptions,
) -> Result<(), CoreError> {
    allowed_value(raw.addon1.as_deref(), "addon1", addons, disabled)?;
    allowed_value(raw.addon2.as_deref(), "addon2", addons, disabled)?;

    if let Some(item) = raw.item.as_deref() {
        if item != ANY_OPTION && item != NONE_OPTION {
            return Err(CoreError::invalid_field("item"));
        }
    }

    allowed_value(raw.offering.as_deref(), "offering", &catalog.killer.offerings, disabled)?;
    check_perks(raw, &catalog.killer.perks, disabled)
}

fn check_survivor(
    raw: &RawBuild,
    catalog: &OptionCatalog,
    disabled: &DisabledOptions,
) -> Result<(), CoreError> {
    let item = match raw.item.as_deref() {
        None => None,
        Some(item) if disabled.is_enabled(item) && catalog.survivor.items.contains_key(item) => {
            Some(item)
        }
        Some(_) => return Err(CoreError::invalid_field("item")),
    };

    match item.and_then(|item| catalog.survivor.items.get(item).map(|addons| (item, addons))) {
        Some((item, addons)) if item != NONE_OPTION => {
            allowed_value(raw.addon1.as_deref(), "addon1", addons, disabled)?;
            allowed_value(raw.addon2.as_deref(), "addon2", addons, disabled)?;
        }
        _ => {
            // Add-ons need an item to attach to.
            let no_addons = raw.addon1.as_deref() == Some(NONE_OPTION)
                && raw.addon2.as_deref() == Some(NONE_OPTION);
            if !no_addons {
                return Err(CoreError::invalid_field("addons"));
            }
        }
    }

    allowed_value(raw.offering.as_deref(), "offering", &catalog.survivor.offerings, disabled)?;
    check_perks(raw, &catalog.survivor.perks, disabled)
}

fn required(value: Option<&String>) -> String {
    value.cloned().unwrap_or_default()
}

/// Validate a submitted build against the active catalog and a channel's disabled options,
/// returning the canonical build.
///
/// The result keeps only recognised fields and always carries an expiration: the submitted
/// one when present, otherwise `now` plus the pending-build lifetime.
///
/// # Errors
/// Returns [`CoreError::InvalidField`] for the first field that is missing, unknown to the
/// catalog, disabled, or inconsistent with the chosen character or item;
/// [`CoreError::Forbidden`] when notes are supplied but disabled for the channel.
pub fn validate_build(
    raw: &RawBuild,
    disabled: &DisabledOptions,
    catalog: &OptionCatalog,
    settings: &Settings,
    now: Millis,
) -> Result<Build, CoreError> {
    match resolve_role(raw.character.as_deref(), catalog, disabled)? {
        Role::Killer { addons } => check_killer(raw, addons, catalog, disabled)?,
        Role::Survivor => check_survivor(raw, catalog, disabled)?,
    }

    if disabled.is_disabled(DisabledOptions::NOTES)
        && raw.notes.as_deref().is_some_and(|notes| !notes.is_empty())
    {
        return Err(CoreError::Forbidden("notes".to_string()));
    }

    let maximum_expiration = now.saturating_add(settings.uncompleted_expire_ms());
    let expiration = match raw.expiration {
        Some(expiration) if expiration > maximum_expiration => {
            return Err(CoreError::invalid_field("expiration"));
        }
        Some(expiration) => expiration,
        None => maximum_expiration,
    };

    Ok(Build {
        character: required(raw.character.as_ref()),
        addon1: required(raw.addon1.as_ref()),
        addon2: required(raw.addon2.as_ref()),
        offering: required(raw.offering.as_ref()),
        perk1: required(raw.perk1.as_ref()),
        perk2: required(raw.perk2.as_ref()),
        perk3: required(raw.perk3.as_ref()),
        perk4: required(raw.perk4.as_ref()),
        item: raw.item.clone(),
        notes: raw.notes.clone(),
        completed: raw.completed,
        expiration,
        submitter: raw.submitter.clone(),
    })
}

/// Extract the submitter name from a `{"submitter": "<name>"}` payload.
///
/// # Errors
/// Returns [`CoreError::InvalidField`] (`submitter`) for any other shape, including extra
/// properties or a non-string value.
pub fn validate_submitter(payload: &Value) -> Result<String, CoreError> {
    match payload.as_object() {
        Some(object) if object.len() == 1 => match object.get("submitter") {
            Some(Value::String(submitter)) => Ok(submitter.clone()),
            _ => Err(CoreError::invalid_field("submitter")),
        },
        _ => Err(CoreError::invalid_field("submitter")),
    }
}
