// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime configuration
//!
//! Defaults suit a single caller scoring one request at a time. Every value
//! can be overridden from the environment:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `GNA_THREAD_COUNT` | worker threads (1..=127) |
//! | `GNA_MAX_QUEUED_REQUESTS` | pending request limit |
//! | `GNA_WAIT_TIMEOUT_MS` | default wait timeout |

use std::time::Duration;

use crate::error::{GnaError, Result};

/// Largest worker pool size
pub const MAX_THREAD_COUNT: usize = 127;

/// Default pending request limit
pub const DEFAULT_MAX_QUEUED_REQUESTS: usize = 64;

/// Runtime tuning shared by all devices opened through one registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads per device
    pub thread_count: usize,
    /// Pending request limit per device
    pub max_queued_requests: usize,
    /// Timeout used by `Device::wait_default`
    pub wait_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            max_queued_requests: DEFAULT_MAX_QUEUED_REQUESTS,
            wait_timeout: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied
    ///
    /// # Errors
    ///
    /// Returns [`GnaError::Config`] when a variable is set but unparsable, or
    /// the result fails [`RuntimeConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides from an arbitrary key lookup
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "GNA_THREAD_COUNT")? {
            config.thread_count = v;
        }
        if let Some(v) = parse_var(&lookup, "GNA_MAX_QUEUED_REQUESTS")? {
            config.max_queued_requests = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "GNA_WAIT_TIMEOUT_MS")? {
            config.wait_timeout = Duration::from_millis(v);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`GnaError::ThreadCountInvalid`] or [`GnaError::Config`].
    pub fn validate(&self) -> Result<()> {
        validate_thread_count(self.thread_count)?;
        if self.max_queued_requests == 0 {
            return Err(GnaError::Config {
                key: "max_queued_requests".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Check a worker thread count
///
/// # Errors
///
/// Returns [`GnaError::ThreadCountInvalid`] outside `1..=MAX_THREAD_COUNT`.
pub fn validate_thread_count(count: usize) -> Result<()> {
    if (1..=MAX_THREAD_COUNT).contains(&count) {
        Ok(())
    } else {
        Err(GnaError::ThreadCountInvalid { count })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|e: T::Err| GnaError::Config {
        key: key.to_string(),
        reason: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("GNA_THREAD_COUNT", "4"),
            ("GNA_WAIT_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.wait_timeout, Duration::from_millis(250));
        assert_eq!(config.max_queued_requests, DEFAULT_MAX_QUEUED_REQUESTS);
    }

    #[test]
    fn test_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("GNA_THREAD_COUNT", "many")])),
            Err(GnaError::Config { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("GNA_THREAD_COUNT", "0")])),
            Err(GnaError::ThreadCountInvalid { count: 0 })
        ));
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("GNA_MAX_QUEUED_REQUESTS", "0")])),
            Err(GnaError::Config { .. })
        ));
    }
}
