//! Cache key helpers
//!
//! Namespacing is a naming convention (`namespace:key`), not a storage partition,
//! so patterns and tags always operate on the full key.
//!
//! Invalidation patterns use `*` as the only wildcard (zero or more characters).
//! The local store compiles them into anchored regular expressions; Redis receives
//! them as SCAN globs with every other glob metacharacter escaped.

use regex::Regex;

/// Separator placed between a namespace and the key
pub const NAMESPACE_SEPARATOR: char = ':';

/// Build the full key stored in the backend
///
/// # Examples
///
/// ```
/// use resilient_cache::keys::full_key;
///
/// assert_eq!(full_key(Some("users"), "42"), "users:42");
/// assert_eq!(full_key(None, "42"), "42");
/// ```
#[must_use]
pub fn full_key(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}{NAMESPACE_SEPARATOR}{key}"),
        _ => key.to_string(),
    }
}

/// Compile a `*` wildcard pattern into a regex anchored on both ends
///
/// Every character other than `*` is matched literally.
///
/// # Errors
///
/// Returns an error if the resulting expression exceeds the regex size limit.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?s)^{body}$"))
}

/// Translate a `*` wildcard pattern into a Redis glob
///
/// Redis globs also treat `?`, `[`, `]` and `\` specially, so those are escaped
/// to keep both backends matching the same set of keys.
#[must_use]
pub fn wildcard_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if matches!(ch, '?' | '[' | ']' | '\\') {
            glob.push('\\');
        }
        glob.push(ch);
    }
    glob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_key_with_and_without_namespace() {
        assert_eq!(full_key(Some("session"), "abc"), "session:abc");
        assert_eq!(full_key(Some(""), "abc"), "abc");
        assert_eq!(full_key(None, "abc"), "abc");
    }

    #[test]
    fn test_wildcard_regex_is_anchored() {
        let re = wildcard_regex("user:*").unwrap();
        assert!(re.is_match("user:1"));
        assert!(re.is_match("user:42"));
        assert!(re.is_match("user:"));
        assert!(!re.is_match("session:1"));
        assert!(!re.is_match("app:user:1"));
    }

    #[test]
    fn test_wildcard_regex_escapes_metacharacters() {
        let re = wildcard_regex("price.(usd)*").unwrap();
        assert!(re.is_match("price.(usd):10"));
        assert!(!re.is_match("priceX(usd):10"));

        let middle = wildcard_regex("a*c").unwrap();
        assert!(middle.is_match("ac"));
        assert!(middle.is_match("abbbc"));
        assert!(!middle.is_match("abcd"));
    }

    #[test]
    fn test_wildcard_glob_escapes_redis_specials() {
        assert_eq!(wildcard_glob("user:*"), "user:*");
        assert_eq!(wildcard_glob("what?[x]*"), "what\\?\\[x\\]*");
    }
}
