//! Manager configuration.

use std::time::Duration;

// ============================================================================
// Manager Configuration
// ============================================================================

/// Configuration for a [`crate::manager::HumanLoopManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Timeout applied to requests that don't specify their own
    pub default_timeout: Duration,
    /// Cadence of the expiry/poll sweep
    pub check_interval: Duration,
    /// How long terminal requests are retained before pruning removes them
    pub terminal_grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600), // 10 minutes
            check_interval: Duration::from_secs(5),
            terminal_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl ManagerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HUMANLOOP_DEFAULT_TIMEOUT_SECS` - default request timeout (default: 600)
    /// - `HUMANLOOP_CHECK_INTERVAL_SECS` - sweep cadence (default: 5)
    /// - `HUMANLOOP_TERMINAL_GRACE_SECS` - terminal retention (default: 3600)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_timeout = std::env::var("HUMANLOOP_DEFAULT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_timeout);

        let check_interval = std::env::var("HUMANLOOP_CHECK_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_interval);

        let terminal_grace_period = std::env::var("HUMANLOOP_TERMINAL_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.terminal_grace_period);

        Self {
            default_timeout,
            check_interval,
            terminal_grace_period,
        }
    }

    /// Sets the default request timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the sweep cadence.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the terminal retention grace period.
    #[must_use]
    pub fn with_terminal_grace_period(mut self, grace: Duration) -> Self {
        self.terminal_grace_period = grace;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
