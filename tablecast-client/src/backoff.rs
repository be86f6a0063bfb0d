//! Retry delay policies
//!
//! One [`ReconnectPolicy`] decides how long to wait before each reconnect
//! attempt and when to stop. Policies are stateless: the caller owns the
//! attempt counter and passes it in, so a single policy can be shared by
//! every [`Reconnector`](crate::Reconnector) through an `Arc`.
//!
//! # Built-in Policies
//!
//! - **ExponentialBackoff**: `base * 2^attempt`, 1s/2s/4s/8s/16s by default
//! - **FixedDelay**: constant delay between attempts
//! - **NoReconnect**: never retry
//!
//! # Examples
//!
//! ```rust
//! use tablecast_client::{ExponentialBackoff, ReconnectPolicy};
//! use std::time::Duration;
//!
//! let policy = ExponentialBackoff::default();
//! assert_eq!(policy.delay_for(0), Some(Duration::from_secs(1)));
//! assert_eq!(policy.delay_for(4), Some(Duration::from_secs(16)));
//! assert_eq!(policy.delay_for(5), None);
//! ```

use std::time::Duration;

/// Decides the delay before reconnect attempt number `attempt`
pub trait ReconnectPolicy: Send + Sync {
    /// Delay before the retry following `attempt` earlier retries
    ///
    /// `attempt` is 0 for the first retry. `None` means give up.
    fn delay_for(&self, attempt: u32) -> Option<Duration>;

    /// Upper bound on retries, `None` for unlimited
    fn max_attempts(&self) -> Option<u32>;
}

/// Doubling delay with an optional cap and jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Option<Duration>,
    max_attempts: Option<u32>,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Unlimited attempts starting at `base`
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max_delay: None,
            max_attempts: None,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Never wait longer than `max_delay` (before jitter)
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Add a random 0-25% on top of each delay
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000)).with_max_attempts(5)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let mut delay = self.base.checked_mul(factor).unwrap_or(Duration::MAX);
        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }

        if self.jitter {
            use rand::Rng;
            let millis = delay.as_millis().min(u64::MAX as u128) as u64;
            let jitter_ms = rand::thread_rng().gen_range(0..=(millis / 4));
            delay = delay.saturating_add(Duration::from_millis(jitter_ms));
        }

        Some(delay)
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Same delay every time
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectPolicy for FixedDelay {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(self.delay),
        }
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn delay_for(&self, _attempt: u32) -> Option<Duration> {
        None
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(0)
    }
}
