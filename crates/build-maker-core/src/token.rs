use std::ops::Range;

use rand::Rng;

use crate::{settings::MAX_TOKEN_LENGTH, CoreError, Millis, Settings, Token};

/// Token digits. Vowels, look-alike digits and ambiguous letters are left out so tokens
/// cannot spell words and survive being read aloud.
pub const TOKEN_ALPHABET: &str = "256789bcdfghjmnpqrstvwxz";

const RADIX: u64 = TOKEN_ALPHABET.len() as u64;

/// Draws before giving up on finding an unused value.
const MAX_ATTEMPTS: u32 = 64;

/// Render `value` in the token alphabet, most significant digit first.
#[must_use]
pub fn encode_token_value(mut value: u64) -> String {
    let alphabet = TOKEN_ALPHABET.as_bytes();
    let mut digits = Vec::new();
    loop {
        // The remainder is below RADIX, so it always indexes the alphabet.
        #[allow(clippy::cast_possible_truncation)]
        digits.push(char::from(alphabet[(value % RADIX) as usize]));
        value /= RADIX;
        if value == 0 {
            break;
        }
    }
    digits.iter().rev().collect()
}

/// Inverse of [`encode_token_value`]. `None` for empty input, characters outside the
/// alphabet, or values that overflow.
#[must_use]
pub fn decode_token_value(token: &str) -> Option<u64> {
    if token.is_empty() {
        return None;
    }
    token.chars().try_fold(0_u64, |value, ch| {
        let digit = TOKEN_ALPHABET.find(ch)? as u64;
        value.checked_mul(RADIX)?.checked_add(digit)
    })
}

/// Issues short submission tokens for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGenerator {
    min_length: u32,
    max_length: u32,
    lifetime_ms: Millis,
}

impl TokenGenerator {
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] when the bounds are empty, inverted or too long
    /// for a `u64`, or the lifetime is not positive.
    pub fn new(min_length: u32, max_length: u32, lifetime_ms: Millis) -> Result<Self, CoreError> {
        if min_length == 0 || min_length > max_length || max_length > MAX_TOKEN_LENGTH {
            return Err(CoreError::InvalidConfig(format!(
                "token lengths {min_length}..={max_length} outside 1..={MAX_TOKEN_LENGTH}"
            )));
        }
        if lifetime_ms <= 0 {
            return Err(CoreError::InvalidConfig("token lifetime must be positive".to_string()));
        }
        Ok(Self { min_length, max_length, lifetime_ms })
    }

    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] when `settings` fail validation.
    pub fn from_settings(settings: &Settings) -> Result<Self, CoreError> {
        settings.validate()?;
        Self::new(settings.token_min_length, settings.token_max_length, settings.token_expire_ms())
    }

    /// Values whose encodings are between `min_length` and `max_length` characters long.
    #[must_use]
    pub fn value_range(&self) -> Range<u64> {
        RADIX.pow(self.min_length - 1)..RADIX.pow(self.max_length)
    }

    /// Draw random values until `exists` reports one unused, and return it with an
    /// expiration of `now` plus the token lifetime.
    ///
    /// `exists` must report a candidate taken when it is either a live token or a build
    /// id of the channel.
    ///
    /// # Errors
    /// Propagates errors from `exists`, and fails with [`CoreError::TokenSpaceExhausted`]
    /// after too many collisions.
    pub fn next_token<E: From<CoreError>>(
        &self,
        rng: &mut impl Rng,
        now: Millis,
        mut exists: impl FnMut(&str) -> Result<bool, E>,
    ) -> Result<Token, E> {
        let range = self.value_range();
        for _ in 0..MAX_ATTEMPTS {
            let candidate = encode_token_value(rng.gen_range(range.clone()));
            if !exists(&candidate)? {
                return Ok(Token {
                    value: candidate,
                    expiration: now.saturating_add(self.lifetime_ms),
                });
            }
        }
        Err(CoreError::TokenSpaceExhausted { attempts: MAX_ATTEMPTS }.into())
    }
}
