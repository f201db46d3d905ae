//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Image and inference URLs can carry signed query strings or credentials
//! in userinfo. These helpers keep them out of logs.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Strips userinfo and the query string from a URL.
///
/// - `https://user:pw@host/a.jpg?sig=abc` → `https://****@host/a.jpg`
/// - `https://host/a.jpg?token=x#frag` → `https://host/a.jpg`
/// - `file:///srv/scans/a.jpg` → `file:///srv/scans/a.jpg` (no change)
pub fn redact_url(url: &str) -> String {
    let without_query = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url);

    if let Some(scheme_end) = without_query.find("://") {
        let after_scheme = &without_query[scheme_end + 3..];
        let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
        if let Some(at_pos) = after_scheme[..authority_end].find('@') {
            let scheme = &without_query[..scheme_end + 3];
            let after_at = &after_scheme[at_pos + 1..];
            return format!("{}****@{}", scheme, after_at);
        }
    }

    without_query.to_string()
}

/// Short display name for an image URL: the last path segment.
pub fn url_name(url: &str) -> String {
    let redacted = redact_url(url);
    redacted
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("<unknown>")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/srv/scans/book-1/0001.jpg")),
            "0001.jpg"
        );
    }

    #[test]
    fn test_redact_path_no_filename() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_redact_url_strips_userinfo_and_query() {
        assert_eq!(
            redact_url("https://user:pw@cdn.example.org/scans/a.jpg?sig=abc"),
            "https://****@cdn.example.org/scans/a.jpg"
        );
    }

    #[test]
    fn test_redact_url_strips_fragment() {
        assert_eq!(
            redact_url("https://cdn.example.org/a.jpg#page=2"),
            "https://cdn.example.org/a.jpg"
        );
    }

    #[test]
    fn test_redact_url_ignores_at_in_path() {
        assert_eq!(
            redact_url("https://cdn.example.org/@archive/a.jpg"),
            "https://cdn.example.org/@archive/a.jpg"
        );
    }

    #[test]
    fn test_redact_url_file_scheme_unchanged() {
        assert_eq!(redact_url("file:///srv/scans/a.jpg"), "file:///srv/scans/a.jpg");
    }

    #[test]
    fn test_url_name() {
        assert_eq!(url_name("https://host/scans/0007.png?x=1"), "0007.png");
        assert_eq!(url_name("https://host/"), "host");
    }
}
