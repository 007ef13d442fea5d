//! Core identifier and clock helpers for Chatsync

use ulid::Ulid;

/// Generate a fresh identifier for branches, messages, tabs, clients and calls.
///
/// Uses ULID so identifiers sort lexicographically by creation time.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// This is a producer-local clock; clocks of different origins are not
/// synchronized.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether an optional identifier is present and non-empty.
pub fn has_id(id: &Option<String>) -> bool {
    id.as_deref().is_some_and(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_has_id() {
        assert!(has_id(&Some("t1".to_string())));
        assert!(!has_id(&Some(String::new())));
        assert!(!has_id(&None));
    }
}
