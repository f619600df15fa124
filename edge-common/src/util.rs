//! String helpers.

/// Truncate to at most `max_chars` characters, appending "..." when cut.
///
/// Counts characters, not bytes, so emoji and accented tickers are safe.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Escape the three characters Telegram's HTML parse mode treats specially.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// First `n` characters of `s` (char-safe prefix).
pub fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string_untouched() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_with_ellipsis("📈📉📈", 2), "📈📉...");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("P&L <b>"), "P&amp;L &lt;b&gt;");
    }

    #[test]
    fn test_char_prefix() {
        assert_eq!(char_prefix("Apple beats estimates", 5), "Apple");
        assert_eq!(char_prefix("abc", 10), "abc");
    }
}
