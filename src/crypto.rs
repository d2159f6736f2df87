//! Secure random token values
//!
//! Token values are opaque: random bytes from the system CSPRNG, encoded as
//! URL-safe base64 without padding so they can travel in headers and query
//! strings untouched.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;

use crate::error::{Error, Result};

/// Default number of random bytes in a token value
pub const DEFAULT_TOKEN_LENGTH: usize = 32;

const MIN_TOKEN_LENGTH: usize = 16;

/// Source of fresh token values
pub trait TokenGenerator: Send + Sync + fmt::Debug {
    /// Produces a new token value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the random source fails.
    fn generate(&self) -> Result<String>;
}

/// Generates tokens from `ring`'s system random source
#[derive(Debug, Clone)]
pub struct SecureTokenGenerator {
    rng: SystemRandom,
    length: usize,
}

impl SecureTokenGenerator {
    /// Create a generator producing `length` random bytes per token
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if `length` is below 16 bytes.
    pub fn new(length: usize) -> Result<Self> {
        if length < MIN_TOKEN_LENGTH {
            return Err(Error::Crypto(format!(
                "Token length must be at least {MIN_TOKEN_LENGTH} bytes, got {length}"
            )));
        }

        Ok(Self {
            rng: SystemRandom::new(),
            length,
        })
    }
}

impl Default for SecureTokenGenerator {
    fn default() -> Self {
        Self {
            rng: SystemRandom::new(),
            length: DEFAULT_TOKEN_LENGTH,
        }
    }
}

impl TokenGenerator for SecureTokenGenerator {
    fn generate(&self) -> Result<String> {
        let mut bytes = vec![0u8; self.length];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| Error::Crypto("Failed to generate token".into()))?;
        Ok(URL_SAFE_NO_PAD.encode(&bytes))
    }
}

/// Short, non-reversible identifier for a token value, safe to log
pub(crate) fn fingerprint(token: &str) -> String {
    digest(&SHA256, token.as_bytes())
        .as_ref()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Hands out a fixed script of values, then falls back to secure ones.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedGenerator {
    script: std::sync::Mutex<std::collections::VecDeque<String>>,
    fallback: SecureTokenGenerator,
}

#[cfg(test)]
impl ScriptedGenerator {
    pub(crate) fn new(values: &[&str]) -> Self {
        Self {
            script: std::sync::Mutex::new(values.iter().map(ToString::to_string).collect()),
            fallback: SecureTokenGenerator::default(),
        }
    }
}

#[cfg(test)]
impl TokenGenerator for ScriptedGenerator {
    fn generate(&self) -> Result<String> {
        let next = self
            .script
            .lock()
            .map_err(|_| Error::Crypto("script poisoned".into()))?
            .pop_front();
        next.map_or_else(|| self.fallback.generate(), Ok)
    }
}
