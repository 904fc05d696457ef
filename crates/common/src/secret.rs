//! Secret types for values that must never reach logs.
//!
//! Re-exports [`secrecy`] so every crate in the workspace wraps sensitive
//! configuration the same way. `SecretString` implements `Debug` with
//! redaction, which means deriving `Debug` on a config struct that holds one
//! stays safe for `{:?}` and tracing fields.
//!
//! Currently used for:
//! - the Redis presence backend URL (may embed a password)
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@cache:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert_eq!(url.expose_secret(), "redis://:hunter2@cache:6379");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:pa55@localhost:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("pa55"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("redis://localhost:6379");
        assert_eq!(secret.expose_secret(), "redis://localhost:6379");
    }

    #[test]
    fn test_optional_secret_in_struct_is_redacted() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Backend {
            name: String,
            url: Option<SecretString>,
        }

        let backend = Backend {
            name: "presence".to_string(),
            url: Some(SecretString::from("redis://:topsecret@cache")),
        };

        let debug_str = format!("{backend:?}");
        assert!(debug_str.contains("presence"));
        assert!(!debug_str.contains("topsecret"));
    }

    #[test]
    fn test_deserialize() {
        #[derive(Debug, Deserialize)]
        struct Settings {
            redis_url: SecretString,
        }

        let json = r#"{"redis_url": "redis://:abc@host"}"#;
        let settings: Settings = serde_json::from_str(json).expect("deserialize");

        assert_eq!(settings.redis_url.expose_secret(), "redis://:abc@host");
        assert!(!format!("{settings:?}").contains("abc@host"));
    }
}
