//! Configuration errors and value helpers shared by the config loaders.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// One device definition is unusable; the rest of the file may be fine.
    #[error("device '{uid}': {reason}")]
    Device { uid: String, reason: String },
}

/// Parse a cadence such as `30s`, `5m` or `1h30m`.
///
/// A bare integer is taken as seconds, which is how tier intervals are
/// usually written.
///
/// ```
/// use routerwatch::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
/// assert_eq!(parse_duration("300").unwrap().as_secs(), 300);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}

static ENV_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

/// Replace `${VAR}` and `${VAR:-fallback}` with values from the environment.
///
/// Unset variables without a fallback expand to an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let Some(re) = ENV_REF.as_ref() else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &Captures| {
        std::env::var(&caps[1])
            .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_duration_bare_seconds() {
        assert_eq!(parse_duration("3600").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 5 ").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-5").is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        assert_eq!(expand_env_vars("plain-password"), "plain-password");
        assert_eq!(
            expand_env_vars("${ROUTERWATCH_TEST_UNSET_VAR:-fallback}"),
            "fallback"
        );
        assert_eq!(expand_env_vars("a${ROUTERWATCH_TEST_UNSET_VAR}b"), "ab");

        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("ROUTERWATCH_TEST_SECRET", "hunter2") };
        assert_eq!(expand_env_vars("${ROUTERWATCH_TEST_SECRET:-x}"), "hunter2");
        // SAFETY: as above.
        unsafe { std::env::remove_var("ROUTERWATCH_TEST_SECRET") };
    }
}
