//! Relay strategy descriptors.
//!
//! A strategy is either unbuffered forwarding or buffered forwarding with
//! three drain limits. Unbuffered is equivalent to a buffer that drains on
//! every message: `max_age = 0`, `max_count = 1`, `max_bytes = ∞`.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default relay-set size for unbuffered relaying
pub const DEFAULT_UNBUFFERED_RELAYS: usize = 5;

/// Default relay-set size for buffered relaying
pub const DEFAULT_BUFFERED_RELAYS: usize = 2;

/// Relay transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// Every message is forwarded as soon as it arrives
    Unbuffered,
    /// Messages accumulate and are forwarded in batches
    Buffered,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbuffered => write!(f, "unbuffered"),
            Self::Buffered => write!(f, "buffered"),
        }
    }
}

/// Drain limits of a message buffer.
///
/// "Unlimited" is represented by `usize::MAX` / `Duration::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Oldest pending message age that forces a drain
    pub max_age: Duration,
    /// Pending message count that forces a drain
    pub max_count: usize,
    /// Pending byte total that forces a drain
    pub max_bytes: usize,
}

impl BufferLimits {
    /// Limits that never force a drain.
    pub const UNLIMITED: Self = Self {
        max_age: Duration::MAX,
        max_count: usize::MAX,
        max_bytes: usize::MAX,
    };

    /// Limits equivalent to unbuffered forwarding.
    pub const IMMEDIATE: Self = Self {
        max_age: Duration::ZERO,
        max_count: 1,
        max_bytes: usize::MAX,
    };

    /// Create limits from all three values.
    #[must_use]
    pub const fn new(max_age: Duration, max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_age,
            max_count,
            max_bytes,
        }
    }

    /// Drain only on age.
    #[must_use]
    pub const fn age_only(max_age: Duration) -> Self {
        Self {
            max_age,
            ..Self::UNLIMITED
        }
    }

    /// Drain only on count.
    #[must_use]
    pub const fn count_only(max_count: usize) -> Self {
        Self {
            max_count,
            ..Self::UNLIMITED
        }
    }

    /// Check that every limit is positive.
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` naming the first zero limit.
    pub fn validate(&self) -> RelayResult<()> {
        if self.max_age.is_zero() {
            return Err(RelayError::InvalidConfig(
                "buffer max_age must be positive".to_string(),
            ));
        }
        if self.max_count == 0 {
            return Err(RelayError::InvalidConfig(
                "buffer max_count must be positive".to_string(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(RelayError::InvalidConfig(
                "buffer max_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BufferLimits {
    /// Two seconds, a thousand messages or 64 KiB, whichever comes first.
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 1000, 64 * 1024)
    }
}

/// How a relay connection carries messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayStrategy {
    /// Forward every message immediately
    #[default]
    Unbuffered,
    /// Accumulate messages and forward them in batches
    Buffered(BufferLimits),
}

impl RelayStrategy {
    /// Relay kind carried in registrations
    #[must_use]
    pub fn kind(&self) -> RelayKind {
        match self {
            Self::Unbuffered => RelayKind::Unbuffered,
            Self::Buffered(_) => RelayKind::Buffered,
        }
    }

    /// Effective drain limits
    #[must_use]
    pub fn limits(&self) -> BufferLimits {
        match self {
            Self::Unbuffered => BufferLimits::IMMEDIATE,
            Self::Buffered(limits) => *limits,
        }
    }

    /// Whether messages go through a buffer
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }

    /// Relay-set size used when none is configured
    #[must_use]
    pub fn default_max_relay_count(&self) -> usize {
        match self {
            Self::Unbuffered => DEFAULT_UNBUFFERED_RELAYS,
            Self::Buffered(_) => DEFAULT_BUFFERED_RELAYS,
        }
    }

    /// Validate the buffer limits of a buffered strategy.
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if any limit is zero.
    pub fn validate(&self) -> RelayResult<()> {
        match self {
            Self::Unbuffered => Ok(()),
            Self::Buffered(limits) => limits.validate(),
        }
    }
}

impl fmt::Display for RelayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbuffered => write!(f, "unbuffered"),
            Self::Buffered(limits) => write!(
                f,
                "buffered(age={:?}, count={}, bytes={})",
                limits.max_age, limits.max_count, limits.max_bytes
            ),
        }
    }
}
