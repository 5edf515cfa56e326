//! Sensitive-value masking heuristics.
//!
//! Variable maps are masked before they hit any log sink. The heuristics are
//! key-pattern based: a key that looks like a credential gets its value
//! replaced with a `<masked>` marker regardless of the value's content.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Replacement written in place of a masked value.
pub const MASKED_VALUE: &str = "<masked>";

/// String values longer than this keep their first and last characters visible.
const FULL_MASK_THRESHOLD: usize = 8;

static SENSITIVE_KEY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)(^|_)(key|token|secret|password|passwd|credential)s?($|_)").unwrap(),
        Regex::new(r"(?i)(^|_)auth(orization)?($|_)").unwrap(),
        Regex::new(r"(?i)(^|_)(api|session|bearer|refresh)_?(key|token)($|_)").unwrap(),
        Regex::new(r"(?i)private").unwrap(),
    ]
});

static INTERNAL_ENV_KEY: Lazy<Regex> = Lazy::new(|| {
    // Environment-style keys the engine generates internally, e.g.
    // `TRELLIS_NODE_ID` or `__runtime_marker`.
    Regex::new(r"^(TRELLIS_[A-Z0-9_]+|__[a-z0-9_]+)$").unwrap()
});

/// Whether a variable key matches the credential naming heuristics.
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_PATTERNS.iter().any(|pattern| pattern.is_match(key))
}

/// Whether a key is an internally-generated environment-style key that should
/// be excluded from user-facing variable listings.
pub fn is_internal_env_key(key: &str) -> bool {
    INTERNAL_ENV_KEY.is_match(key)
}

/// Masks a value whose key was flagged as sensitive.
///
/// Long string values keep a one-character prefix and suffix so operators can
/// still correlate values across logs; everything else collapses to the
/// masked marker.
pub fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(text) if text.chars().count() > FULL_MASK_THRESHOLD => {
            let mut chars = text.chars();
            let first = chars.next().unwrap_or('?');
            let last = text.chars().next_back().unwrap_or('?');
            Value::String(format!("{first}***{last}"))
        }
        _ => Value::String(MASKED_VALUE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_credential_like_keys() {
        for key in ["api_key", "AUTH_TOKEN", "password", "client_secret", "private_key", "refresh_token"] {
            assert!(is_sensitive_key(key), "expected '{key}' to be sensitive");
        }
        for key in ["username", "base_url", "retries", "monkey"] {
            assert!(!is_sensitive_key(key), "expected '{key}' to be plain");
        }
    }

    #[test]
    fn flags_internal_env_keys() {
        assert!(is_internal_env_key("TRELLIS_NODE_ID"));
        assert!(is_internal_env_key("__runtime_marker"));
        assert!(!is_internal_env_key("USER_EMAIL"));
    }

    #[test]
    fn masks_short_values_fully() {
        assert_eq!(mask_value(&json!("abc")), json!(MASKED_VALUE));
        assert_eq!(mask_value(&json!(42)), json!(MASKED_VALUE));
    }

    #[test]
    fn keeps_edges_of_long_values() {
        assert_eq!(mask_value(&json!("supersecretvalue")), json!("s***e"));
    }
}
