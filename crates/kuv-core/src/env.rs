//! Environment variable utilities
//!
//! Generic `env_get<T>` function for parsing environment variables with defaults.
//!
//! # Usage
//!
//! ```ignore
//! use kuv_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let threads: usize = env_get("KUV_THREAD_COUNT", 4);
//! let no_delay = env_get_bool("KUV_NO_DELAY", true);
//! let timeout = env_get_ms("KUV_SHUTDOWN_TIMEOUT_MS", 5000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
///
/// Works with any type that implements `FromStr`. Unparseable values
/// fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
///
/// Returns `Some(T)` if the variable is set and parses successfully,
/// `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Get environment variable holding milliseconds as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__KUV_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_bool_default() {
        assert!(env_get_bool("__KUV_TEST_UNSET_VAR__", true));
        assert!(!env_get_bool("__KUV_TEST_UNSET_VAR__", false));
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<usize> = env_get_opt("__KUV_TEST_UNSET_VAR__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_str_default() {
        assert_eq!(env_get_str("__KUV_TEST_UNSET_VAR__", "info"), "info");
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__KUV_TEST_NUM__", "123");
        let val: usize = env_get("__KUV_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__KUV_TEST_NUM__");
    }

    #[test]
    fn test_env_get_ms() {
        std::env::set_var("__KUV_TEST_MS__", "250");
        assert_eq!(env_get_ms("__KUV_TEST_MS__", 1), Duration::from_millis(250));
        std::env::remove_var("__KUV_TEST_MS__");
        assert_eq!(env_get_ms("__KUV_TEST_MS__", 7), Duration::from_millis(7));
    }

    #[test]
    fn test_env_get_bool_variants() {
        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__KUV_TEST_BOOL__", truthy);
            assert!(env_get_bool("__KUV_TEST_BOOL__", false), "{truthy}");
        }
        for falsy in ["0", "false", "garbage"] {
            std::env::set_var("__KUV_TEST_BOOL__", falsy);
            assert!(!env_get_bool("__KUV_TEST_BOOL__", true), "{falsy}");
        }
        std::env::remove_var("__KUV_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__KUV_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__KUV_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__KUV_TEST_INVALID__");
    }
}
