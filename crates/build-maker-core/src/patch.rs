use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{Build, Channel, CoreError, Millis, Settings};

/// One JSON Patch (RFC 6902) operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    /// Target pointer of the operation.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Move { path, .. }
            | Self::Copy { path, .. }
            | Self::Test { path, .. } => path,
        }
    }

    /// Source pointer for `move` and `copy`.
    #[must_use]
    pub fn from(&self) -> Option<&str> {
        match self {
            Self::Move { from, .. } | Self::Copy { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Parse a patch document, which must be an array of operation objects.
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedPatch`] when the document has any other shape.
    pub fn parse_all(document: &Value) -> Result<Vec<Self>, CoreError> {
        if !document.is_array() {
            return Err(CoreError::MalformedPatch(
                "patch must be an array of operations".to_string(),
            ));
        }
        serde_json::from_value(document.clone())
            .map_err(|err| CoreError::MalformedPatch(err.to_string()))
    }
}

/// Reject the whole patch unless every pointer it touches satisfies `allowed`.
///
/// # Errors
/// Returns [`CoreError::Forbidden`] naming the first disallowed pointer.
pub fn authorize_patch(
    operations: &[PatchOperation],
    allowed: impl Fn(&str) -> bool,
) -> Result<(), CoreError> {
    for operation in operations {
        for pointer in std::iter::once(operation.path()).chain(operation.from()) {
            if !allowed(pointer) {
                return Err(CoreError::Forbidden(format!("patch path {pointer}")));
            }
        }
    }
    Ok(())
}

/// Builds may only have their completion changed.
///
/// # Errors
/// Returns [`CoreError::Forbidden`] for any pointer other than `/completed`.
pub fn authorize_build_patch(operations: &[PatchOperation]) -> Result<(), CoreError> {
    authorize_patch(operations, |path| path == "/completed")
}

/// Channel owners may edit notes and the disabled option list.
///
/// # Errors
/// Returns [`CoreError::Forbidden`] for any pointer outside `/notes` and `/disabledOptions/`.
pub fn authorize_channel_patch(operations: &[PatchOperation]) -> Result<(), CoreError> {
    authorize_patch(operations, |path| path == "/notes" || path.starts_with("/disabledOptions/"))
}

fn malformed(message: impl Into<String>) -> CoreError {
    CoreError::MalformedPatch(message.into())
}

fn parse_pointer(pointer: &str) -> Result<Vec<String>, CoreError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(malformed(format!("pointer {pointer:?} must start with '/'")));
    };
    rest.split('/').map(|token| unescape_token(pointer, token)).collect()
}

fn unescape_token(pointer: &str, token: &str) -> Result<String, CoreError> {
    let mut unescaped = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        if ch == '~' {
            match chars.next() {
                Some('0') => unescaped.push('~'),
                Some('1') => unescaped.push('/'),
                _ => return Err(malformed(format!("bad escape in pointer {pointer:?}"))),
            }
        } else {
            unescaped.push(ch);
        }
    }
    Ok(unescaped)
}

fn array_index(token: &str, len: usize, allow_end: bool) -> Result<usize, CoreError> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let well_formed = !token.is_empty()
        && token.bytes().all(|byte| byte.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    let index = if well_formed { token.parse::<usize>().ok() } else { None };
    match index {
        Some(index) if index < len || (allow_end && index == len) => Ok(index),
        _ => Err(malformed(format!("array index {token:?} out of bounds"))),
    }
}

fn resolve<'a>(document: &'a Value, tokens: &[String]) -> Result<&'a Value, CoreError> {
    tokens.iter().try_fold(document, |node, token| match node {
        Value::Object(object) => {
            object.get(token).ok_or_else(|| malformed(format!("no member {token:?}")))
        }
        Value::Array(items) => Ok(&items[array_index(token, items.len(), false)?]),
        _ => Err(malformed(format!("cannot descend into scalar at {token:?}"))),
    })
}

fn resolve_mut<'a>(document: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, CoreError> {
    tokens.iter().try_fold(document, |node, token| match node {
        Value::Object(object) => {
            object.get_mut(token).ok_or_else(|| malformed(format!("no member {token:?}")))
        }
        Value::Array(items) => {
            let index = array_index(token, items.len(), false)?;
            Ok(&mut items[index])
        }
        _ => Err(malformed(format!("cannot descend into scalar at {token:?}"))),
    })
}

/// Split a pointer into its parent container and final token. The root has no parent.
fn split_parent<'a>(
    document: &'a mut Value,
    pointer: &str,
) -> Result<Option<(&'a mut Value, String)>, CoreError> {
    let mut tokens = parse_pointer(pointer)?;
    let Some(last) = tokens.pop() else {
        return Ok(None);
    };
    Ok(Some((resolve_mut(document, &tokens)?, last)))
}

fn add(document: &mut Value, pointer: &str, value: Value) -> Result<(), CoreError> {
    let Some((parent, last)) = split_parent(document, pointer)? else {
        *document = value;
        return Ok(());
    };
    match parent {
        Value::Object(object) => {
            object.insert(last, value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(&last, items.len(), true)?;
            items.insert(index, value);
            Ok(())
        }
        _ => Err(malformed(format!("cannot add below scalar at {pointer:?}"))),
    }
}

fn remove(document: &mut Value, pointer: &str) -> Result<Value, CoreError> {
    let Some((parent, last)) = split_parent(document, pointer)? else {
        return Err(malformed("cannot remove the document root"));
    };
    match parent {
        Value::Object(object) => {
            object.shift_remove(&last).ok_or_else(|| malformed(format!("no member at {pointer:?}")))
        }
        Value::Array(items) => {
            let index = array_index(&last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(malformed(format!("cannot remove below scalar at {pointer:?}"))),
    }
}

/// Replace sets a missing member of an existing object; `/completed` is absent on pending
/// builds.
fn replace(document: &mut Value, pointer: &str, value: Value) -> Result<(), CoreError> {
    let Some((parent, last)) = split_parent(document, pointer)? else {
        *document = value;
        return Ok(());
    };
    match parent {
        Value::Object(object) => {
            object.insert(last, value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(&last, items.len(), false)?;
            items[index] = value;
            Ok(())
        }
        _ => Err(malformed(format!("cannot replace below scalar at {pointer:?}"))),
    }
}

fn apply_operation(document: &mut Value, operation: &PatchOperation) -> Result<(), CoreError> {
    match operation {
        PatchOperation::Add { path, value } => add(document, path, value.clone()),
        PatchOperation::Remove { path } => remove(document, path).map(drop),
        PatchOperation::Replace { path, value } => replace(document, path, value.clone()),
        PatchOperation::Move { from, path } => {
            let into_child =
                path.starts_with(from.as_str()) && path[from.len()..].starts_with('/');
            if path != from && into_child {
                return Err(malformed(format!("cannot move {from:?} into its own child {path:?}")));
            }
            let value = remove(document, from)?;
            add(document, path, value)
        }
        PatchOperation::Copy { from, path } => {
            let value = resolve(document, &parse_pointer(from)?)?.clone();
            add(document, path, value)
        }
        PatchOperation::Test { path, value } => {
            if resolve(document, &parse_pointer(path)?)? == value {
                Ok(())
            } else {
                Err(malformed(format!("test failed at {path:?}")))
            }
        }
    }
}

/// Apply `operations` in order to a copy of `document`. The input is never modified and
/// a failing operation discards the partial result.
///
/// # Errors
/// Returns [`CoreError::MalformedPatch`] when an operation references a missing location,
/// uses a bad pointer, or fails a `test`.
pub fn apply_patch(document: &Value, operations: &[PatchOperation]) -> Result<Value, CoreError> {
    let mut patched = document.clone();
    for operation in operations {
        apply_operation(&mut patched, operation)?;
    }
    Ok(patched)
}

fn patch_record<T: Serialize + DeserializeOwned>(
    record: &T,
    operations: &[PatchOperation],
) -> Result<T, CoreError> {
    let document = serde_json::to_value(record).map_err(|err| malformed(err.to_string()))?;
    let patched = apply_patch(&document, operations)?;
    serde_json::from_value(patched).map_err(|err| malformed(err.to_string()))
}

/// Patch a build and re-derive its expiration from the resulting completion state.
///
/// # Errors
/// Returns [`CoreError::MalformedPatch`] when the patch cannot be applied or leaves the
/// record without a valid build shape.
pub fn apply_build_patch(
    build: &Build,
    operations: &[PatchOperation],
    settings: &Settings,
    now: Millis,
) -> Result<Build, CoreError> {
    let mut patched = patch_record(build, operations)?;
    patched.expiration = match patched.completed {
        Some(completed) => completed.saturating_add(settings.completed_expire_ms()),
        None => now.saturating_add(settings.uncompleted_expire_ms()),
    };
    Ok(patched)
}

/// # Errors
/// Returns [`CoreError::MalformedPatch`] when the patch cannot be applied or leaves the
/// record without a valid channel shape.
pub fn apply_channel_patch(
    channel: &Channel,
    operations: &[PatchOperation],
) -> Result<Channel, CoreError> {
    patch_record(channel, operations)
}
