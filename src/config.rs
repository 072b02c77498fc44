//! Stack configuration.
//!
//! Replaces the teacher's split client/server configuration with a single
//! `StackConfig` plus a fluent builder, since this crate's `Stack` always
//! plays both UAC and UAS roles depending on the transaction in flight.
//!
//! ## Example
//!
//! ```rust
//! use sip_dialog_core::config::StackConfig;
//! use std::time::Duration;
//!
//! let config = StackConfig::builder()
//!     .local_host_port("192.168.1.10", 5060)
//!     .max_concurrent_dialogs(Some(10_000))
//!     .refer_subscription_expiry(Duration::from_secs(120))
//!     .build()
//!     .expect("valid config");
//! ```

use std::time::Duration;

use crate::error::{DialogError, DialogResult};

/// RFC 3261 base timers (T1, T2, T4) that every other timer derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self { t1: Duration::from_millis(500), t2: Duration::from_secs(4), t4: Duration::from_secs(5) }
    }
}

/// Stack-wide configuration. Construct via [`StackConfig::default`] or
/// [`StackConfig::builder`].
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub timers: TimerSettings,
    /// Number of dialog-registry shards. Must be a power of two, minimum 8.
    pub registry_shards: usize,
    /// Target fill level for each of the Call-ID/tag/branch ID pools.
    pub id_pool_size: usize,
    /// Hard cap on live dialogs; `None` means unbounded.
    pub max_concurrent_dialogs: Option<usize>,
    /// How long an implicit REFER subscription stays open without a final NOTIFY.
    pub refer_subscription_expiry: Duration,
    pub user_agent: Option<String>,
    pub max_forwards: u8,
    /// `(host, port)` used to derive the ID generator's node component.
    pub local_host_port: (String, u16),
    /// Upper bound on how long `Stack::shutdown` waits for in-flight dialogs.
    pub shutdown_grace_period: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timers: TimerSettings::default(),
            registry_shards: 32,
            id_pool_size: 1024,
            max_concurrent_dialogs: None,
            refer_subscription_expiry: Duration::from_secs(180),
            user_agent: None,
            max_forwards: 70,
            local_host_port: ("0.0.0.0".to_string(), 5060),
            shutdown_grace_period: Duration::from_secs(5),
        }
    }
}

impl StackConfig {
    pub fn builder() -> StackConfigBuilder {
        StackConfigBuilder { config: StackConfig::default() }
    }

    fn validate(&self) -> DialogResult<()> {
        if self.registry_shards < 8 || !self.registry_shards.is_power_of_two() {
            return Err(DialogError::protocol_error(format!(
                "registry_shards must be a power of two >= 8, got {}",
                self.registry_shards
            )));
        }
        if self.timers.t1.is_zero() {
            return Err(DialogError::protocol_error("T1 must be non-zero"));
        }
        if self.timers.t2 < self.timers.t1 {
            return Err(DialogError::protocol_error("T2 must be >= T1"));
        }
        if self.id_pool_size == 0 {
            return Err(DialogError::protocol_error("id_pool_size must be non-zero"));
        }
        Ok(())
    }
}

/// Fluent builder for [`StackConfig`]; `build()` validates the result.
#[derive(Debug, Clone)]
pub struct StackConfigBuilder {
    config: StackConfig,
}

impl StackConfigBuilder {
    pub fn timers(mut self, timers: TimerSettings) -> Self {
        self.config.timers = timers;
        self
    }

    pub fn registry_shards(mut self, shards: usize) -> Self {
        self.config.registry_shards = shards;
        self
    }

    pub fn id_pool_size(mut self, size: usize) -> Self {
        self.config.id_pool_size = size;
        self
    }

    pub fn max_concurrent_dialogs(mut self, max: Option<usize>) -> Self {
        self.config.max_concurrent_dialogs = max;
        self
    }

    pub fn refer_subscription_expiry(mut self, expiry: Duration) -> Self {
        self.config.refer_subscription_expiry = expiry;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = Some(ua.into());
        self
    }

    pub fn max_forwards(mut self, max_forwards: u8) -> Self {
        self.config.max_forwards = max_forwards;
        self
    }

    pub fn local_host_port(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.local_host_port = (host.into(), port);
        self
    }

    pub fn shutdown_grace_period(mut self, period: Duration) -> Self {
        self.config.shutdown_grace_period = period;
        self
    }

    pub fn build(self) -> DialogResult<StackConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(StackConfig::builder().build().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_shards() {
        let err = StackConfig::builder().registry_shards(30).build().unwrap_err();
        assert!(matches!(err, DialogError::ProtocolViolation { .. }));
    }

    #[test]
    fn rejects_too_few_shards() {
        assert!(StackConfig::builder().registry_shards(4).build().is_err());
    }

    #[test]
    fn rejects_zero_t1() {
        let timers = TimerSettings { t1: Duration::ZERO, ..Default::default() };
        assert!(StackConfig::builder().timers(timers).build().is_err());
    }
}
