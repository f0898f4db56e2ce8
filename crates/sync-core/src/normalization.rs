/// Maximum number of characters taken from the first message for a title.
pub const TITLE_MAX_CHARS: usize = 50;
/// Marker appended to truncated titles.
pub const TITLE_ELLIPSIS: &str = "...";

/// Derive a conversation title from its first message.
pub fn conversation_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    let mut chars = trimmed.chars();
    let mut title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        title.push_str(TITLE_ELLIPSIS);
    }
    title
}

/// Trim outgoing content, rejecting messages that are empty after trimming.
pub fn normalize_outgoing_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_titles_are_kept_verbatim() {
        assert_eq!(conversation_title("  hello there "), "hello there");
    }

    #[test]
    fn long_titles_are_cut_at_fifty_chars_with_marker() {
        let text = "a".repeat(51);
        let title = conversation_title(&text);
        assert_eq!(title, format!("{}...", "a".repeat(50)));

        let exact = "b".repeat(50);
        assert_eq!(conversation_title(&exact), exact);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let text = "é".repeat(60);
        let title = conversation_title(&text);
        assert_eq!(title.chars().count(), 53);
    }

    #[test]
    fn blank_content_is_rejected() {
        assert_eq!(normalize_outgoing_content("   \n"), None);
        assert_eq!(normalize_outgoing_content(" hi ").as_deref(), Some("hi"));
    }
}
