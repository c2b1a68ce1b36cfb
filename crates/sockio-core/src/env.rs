//! Environment variable utilities
//!
//! Typed lookups used by the runtime configuration:
//!
//! ```ignore
//! use sockio_core::env::env_get;
//!
//! let workers: usize = env_get("SOCKIO_NUM_WORKERS", 4);
//! let timeout_ms: u64 = env_get("SOCKIO_POLL_TIMEOUT_MS", 100);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or `default` when unset or
/// unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable parsed as `T`, `None` when unset or unparsable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as a boolean.
///
/// "1", "true", "yes", "on" (any case) are true; any other value is false;
/// unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__SOCKIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u64>("__SOCKIO_TEST_UNSET__").is_none());
        assert!(env_get_bool("__SOCKIO_TEST_UNSET__", true));
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__SOCKIO_TEST_NUM__", " 123 ");
        assert_eq!(env_get("__SOCKIO_TEST_NUM__", 0usize), 123);
        std::env::set_var("__SOCKIO_TEST_NUM__", "many");
        assert_eq!(env_get("__SOCKIO_TEST_NUM__", 7usize), 7);
        std::env::remove_var("__SOCKIO_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for v in ["1", "TRUE", "yes", "On"] {
            std::env::set_var("__SOCKIO_TEST_BOOL__", v);
            assert!(env_get_bool("__SOCKIO_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "nope"] {
            std::env::set_var("__SOCKIO_TEST_BOOL__", v);
            assert!(!env_get_bool("__SOCKIO_TEST_BOOL__", true), "{}", v);
        }
        std::env::remove_var("__SOCKIO_TEST_BOOL__");
    }
}
