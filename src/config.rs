//! Issuance configuration and time source

use std::fmt;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

use crate::crypto::{SecureTokenGenerator, TokenGenerator};
use crate::error::{Error, Result};

/// Default token lifetime: one hour
pub const DEFAULT_EXPIRY: Duration = Duration::seconds(3600);

/// Source of the current instant
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current UTC instant
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to
///
/// Useful for exercising expiry and per-day behaviour without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    /// Start the clock at `at`
    #[must_use]
    pub const fn new(at: OffsetDateTime) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Jump to `at`
    pub fn set(&self, at: OffsetDateTime) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    /// Move forward (or backward, for negative values) by `by`
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now = now.saturating_add(by);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now
            .lock()
            .map_or_else(|poisoned| *poisoned.into_inner(), |now| *now)
    }
}

/// Process-wide issuance settings, fixed at construction
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Lifetime of tokens issued without an explicit expiry
    pub default_expiry: Duration,
    /// Source of token values
    pub generator: Arc<dyn TokenGenerator>,
    /// Source of the current instant
    pub clock: Arc<dyn Clock>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_expiry: DEFAULT_EXPIRY,
            generator: Arc::new(SecureTokenGenerator::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

impl TokenConfig {
    /// Configuration with the defaults: one hour expiry, 32 byte tokens, wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default token lifetime
    #[must_use]
    pub const fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    /// Set the token value source
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Set the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reject settings the issuer cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the default expiry is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.default_expiry <= Duration::ZERO {
            return Err(Error::Config(format!(
                "default expiry must be positive, got {}",
                self.default_expiry
            )));
        }
        Ok(())
    }

    /// Current instant at the whole-second precision tokens are stored with
    pub(crate) fn now(&self) -> OffsetDateTime {
        whole_second(self.clock.now())
    }
}

/// Drops the sub-second part of `instant`
pub(crate) fn whole_second(instant: OffsetDateTime) -> OffsetDateTime {
    instant.replace_nanosecond(0).unwrap_or(instant)
}
