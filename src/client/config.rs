//! Client-visible configuration knobs: a response timeout, two retry
//! delays, a retry count, an idle-close timeout, and the range-planning
//! overrides.
//!
//! Follows `tcp::Options`/`connection::Args`'s shape (a plain struct with a
//! `Default` impl and fluent `with_*` setters) minus the `clap` derive,
//! since parsing CLI flags is out of scope here.

use std::time::Duration;

/// Configuration for a [`super::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-attempt deadline for a response. `Duration::MAX` disables the
    /// deadline (no timeout).
    pub response_timeout: Duration,
    /// Delay before retrying after a non-protocol (I/O) error, before
    /// jitter is added.
    pub exception_retry_delay: Duration,
    /// Delay before retrying after a `ServerDeviceBusy` exception, before
    /// jitter is added.
    pub busy_retry_delay: Duration,
    /// Maximum number of retries per request (so `retry_count + 1` total
    /// attempts).
    pub retry_count: u32,
    /// How long the connection is kept open after the lock is released
    /// with no further requests. Zero closes immediately; `Duration::MAX`
    /// never closes on its own.
    pub idle_timeout: Duration,
    /// Override for the protocol's per-request object count cap. Zero
    /// means "use the protocol cap" (123 registers, 2008 bits).
    pub max_request_length: u16,
    /// Gap, in addresses, that the range planner is allowed to bridge when
    /// merging two requested ranges into one request.
    pub allowed_request_waste: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            exception_retry_delay: Duration::from_millis(500),
            busy_retry_delay: Duration::from_secs(1),
            retry_count: 4,
            idle_timeout: Duration::from_secs(7),
            max_request_length: 0,
            allowed_request_waste: 0,
        }
    }
}

impl ClientConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_exception_retry_delay(mut self, delay: Duration) -> Self {
        self.exception_retry_delay = delay;
        self
    }

    pub fn with_busy_retry_delay(mut self, delay: Duration) -> Self {
        self.busy_retry_delay = delay;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_request_length(mut self, max_length: u16) -> Self {
        self.max_request_length = max_length;
        self
    }

    pub fn with_allowed_request_waste(mut self, waste: u16) -> Self {
        self.allowed_request_waste = waste;
        self
    }
}
