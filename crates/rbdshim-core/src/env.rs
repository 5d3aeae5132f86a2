//! Environment variable helpers
//!
//! The C surface has no configuration entry point, so the process-wide
//! engine reads its settings from `RBDSHIM_*` variables through these.
//!
//! ```ignore
//! use rbdshim_core::env::{env_get, env_get_bool, env_get_with};
//!
//! let workers: usize = env_get("RBDSHIM_WORKERS", 0);
//! let flush = env_get_bool("RBDSHIM_FLUSH_EPRINT", false);
//! let level = env_get_with("RBDSHIM_LOG_LEVEL", LogLevel::Warn, LogLevel::parse);
//! ```

use std::str::FromStr;

/// Variable parsed as `T`, or `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Variable parsed as `T`, `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Variable parsed with a custom parser, or `default`.
#[inline]
pub fn env_get_with<T, F>(key: &str, default: T, parse: F) -> T
where
    F: FnOnce(&str) -> Option<T>,
{
    std::env::var(key).ok().and_then(|v| parse(&v)).unwrap_or(default)
}

/// Boolean variable.
///
/// "1", "true", "yes", "on" are true; "0", "false", "no", "off" are false
/// (case-insensitive). Unset or anything else yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    env_get_with(key, default, |v| match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// String variable, or `default`.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
