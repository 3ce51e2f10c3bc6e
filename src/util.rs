/// Shorten `text` for status lines and rejection reasons.
///
/// Keeps at most `max_chars` characters (never splitting a multi-byte
/// character) and marks a cut with a trailing ellipsis.
pub fn ellipsize(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
    }
}

#[cfg(test)]
mod tests {
    use super::ellipsize;

    #[test]
    fn test_ellipsize_leaves_short_text_alone() {
        assert_eq!(ellipsize("ok", 10), "ok");
        assert_eq!(ellipsize("exact", 5), "exact");
        assert_eq!(ellipsize("", 0), "");
    }

    #[test]
    fn test_ellipsize_cuts_on_character_boundaries() {
        assert_eq!(ellipsize("naïveté in Zürich", 7), "naïveté...");
    }

    #[test]
    fn test_ellipsize_trims_whitespace_before_the_marker() {
        assert_eq!(ellipsize("stack trace follows", 6), "stack...");
    }
}
