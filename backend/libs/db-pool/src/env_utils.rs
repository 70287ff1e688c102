//! Environment variable parsing utilities
//!
//! Missing variables fall back to a default; present but unparseable ones are
//! reported instead of silently replaced.

use std::str::FromStr;

use crate::DbConfigError;

/// Parse an environment variable, using `default` when it is unset
///
/// # Example
/// ```ignore
/// let max: u32 = parse_env_or("DB_MAX_CONNECTIONS", 10)?;
/// ```
pub fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T, DbConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| DbConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Read a variable that must be present and non-empty
pub fn require_env(key: &str) -> Result<String, DbConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(DbConfigError::Missing(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_parse_env_or() {
        let result: u32 = parse_env_or("NONEXISTENT_VAR_XYZ", 42).unwrap();
        assert_eq!(result, 42);

        std::env::set_var("TEST_DB_PORT", " 8080 ");
        let result: u16 = parse_env_or("TEST_DB_PORT", 3000).unwrap();
        assert_eq!(result, 8080);

        std::env::set_var("TEST_DB_PORT", "eighty");
        let err = parse_env_or::<u16>("TEST_DB_PORT", 3000).unwrap_err();
        assert!(err.to_string().contains("TEST_DB_PORT"));
        std::env::remove_var("TEST_DB_PORT");
    }

    #[test]
    #[serial_test::serial]
    fn test_require_env() {
        assert!(matches!(
            require_env("NONEXISTENT_VAR_XYZ"),
            Err(DbConfigError::Missing(_))
        ));

        std::env::set_var("TEST_DB_REQ", "  ");
        assert!(require_env("TEST_DB_REQ").is_err());

        std::env::set_var("TEST_DB_REQ", "postgres://x");
        assert_eq!(require_env("TEST_DB_REQ").unwrap(), "postgres://x");
        std::env::remove_var("TEST_DB_REQ");
    }
}
