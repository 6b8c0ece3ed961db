//! Typed environment lookups for provider settings

use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

/// Value of `key`, treating empty strings as unset.
pub fn get(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Value of `key` or a configuration error naming the missing variable.
pub fn get_required(provider: &str, key: &str) -> Result<String> {
    get(key).ok_or_else(|| Error::configuration(provider, format!("{} is required", key)))
}

pub fn get_or_default_string(key: &str, default: &str) -> String {
    get(key).unwrap_or_else(|| default.to_string())
}

/// Whole seconds from `key`, or `default` when unset or malformed.
pub fn get_or_default_secs(key: &str, default: Duration) -> Duration {
    match get(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(
                    "Invalid value for {}: {:?}, using default {}s",
                    key,
                    raw,
                    default.as_secs()
                );
                default
            }
        },
        None => default,
    }
}

pub fn get_or_default_u32(key: &str, default: u32) -> u32 {
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default {}", key, raw, default);
            default
        }),
        None => default,
    }
}

/// Every variable whose name starts with `prefix`.
pub fn with_prefix(prefix: &str) -> Vec<(String, String)> {
    std::env::vars().filter(|(k, _)| k.starts_with(prefix)).collect()
}
