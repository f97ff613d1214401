use crate::Millis;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("no active release at {now}")]
    NoActiveRelease { now: Millis },
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no free token value after {attempts} attempts")]
    TokenSpaceExhausted { attempts: u32 },
}

impl CoreError {
    pub(crate) fn invalid_field(field: &str) -> Self {
        Self::InvalidField(field.to_string())
    }

    /// Whether the failure is a deployment or configuration fault rather than a problem
    /// with caller-supplied input.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::NoActiveRelease { .. }
                | Self::Catalog(_)
                | Self::InvalidConfig(_)
                | Self::TokenSpaceExhausted { .. }
        )
    }

    /// Name of the offending field for [`CoreError::InvalidField`].
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidField(field) => Some(field),
            _ => None,
        }
    }
}
