use serde::{Deserialize, Serialize};

use crate::{CoreError, Millis};

const HOUR_MS: Millis = 3_600_000;
const DAY_MS: Millis = 86_400_000;

/// Longest token the generator supports: `24^13` still fits in a `u64`.
pub(crate) const MAX_TOKEN_LENGTH: u32 = 13;

/// Process-wide lifetimes and token bounds, read once at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub build_completed_expire_hours: i64,
    pub build_uncompleted_expire_days: i64,
    pub channel_expire_days: i64,
    pub token_expire_hours: i64,
    pub token_min_length: u32,
    pub token_max_length: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_completed_expire_hours: 6,
            build_uncompleted_expire_days: 15,
            channel_expire_days: 90,
            token_expire_hours: 24,
            token_min_length: 3,
            token_max_length: 4,
        }
    }
}

impl Settings {
    /// How long a completed build is kept after completion.
    #[must_use]
    pub fn completed_expire_ms(&self) -> Millis {
        self.build_completed_expire_hours.saturating_mul(HOUR_MS)
    }

    /// Longest lifetime of a pending build.
    #[must_use]
    pub fn uncompleted_expire_ms(&self) -> Millis {
        self.build_uncompleted_expire_days.saturating_mul(DAY_MS)
    }

    /// Idle time after which a channel is pruned.
    #[must_use]
    pub fn channel_expire_ms(&self) -> Millis {
        self.channel_expire_days.saturating_mul(DAY_MS)
    }

    #[must_use]
    pub fn token_expire_ms(&self) -> Millis {
        self.token_expire_hours.saturating_mul(HOUR_MS)
    }

    /// Check that every lifetime is positive and the token bounds are usable.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<(), CoreError> {
        let lifetimes = [
            ("build_completed_expire_hours", self.build_completed_expire_hours),
            ("build_uncompleted_expire_days", self.build_uncompleted_expire_days),
            ("channel_expire_days", self.channel_expire_days),
            ("token_expire_hours", self.token_expire_hours),
        ];
        for (name, value) in lifetimes {
            if value <= 0 {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        if self.token_min_length == 0 {
            return Err(CoreError::InvalidConfig("token_min_length must be at least 1".to_string()));
        }
        if self.token_min_length > self.token_max_length {
            return Err(CoreError::InvalidConfig(format!(
                "token_min_length ({}) exceeds token_max_length ({})",
                self.token_min_length, self.token_max_length
            )));
        }
        if self.token_max_length > MAX_TOKEN_LENGTH {
            return Err(CoreError::InvalidConfig(format!(
                "token_max_length must be at most {MAX_TOKEN_LENGTH}"
            )));
        }

        Ok(())
    }
}
