//! Body sanitization: markup in, bounded prompt-safe text out.
//!
//! Pure string processing. HTML goes through an HTML→markdown pass first so
//! paragraph and list structure survive, then everything is flattened by
//! [`clean_text`]. Nothing in here can fail.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{ContentType, EmailBody};

/// Default cap on sanitized output, in chars.
pub const DEFAULT_MAX_CHARS: usize = 4000;

const SKIPPED_TAGS: [&str; 5] = ["script", "style", "head", "meta", "link"];

const NOREPLY_PATTERNS: [&str; 6] = [
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "postmaster",
];

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static RULE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{3,}").unwrap());
static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static QUOTE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*>.*$").unwrap());
static NEWLINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\r\n]+").unwrap());
static SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^\w\s.,!?@:;'"%-]"#).unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// Sanitize a message body, truncating to `max_chars`.
pub fn sanitize_body(body: &EmailBody, max_chars: usize) -> String {
    sanitize(&body.content, body.content_type, max_chars)
}

/// Sanitize raw content of the given type.
pub fn sanitize(content: &str, content_type: ContentType, max_chars: usize) -> String {
    if content.trim().is_empty() {
        return String::new();
    }

    let cleaned = match content_type {
        ContentType::Html => clean_text(&html_to_markdown(content)),
        ContentType::Text => clean_text(content),
    };
    truncate_chars(&cleaned, max_chars)
}

/// Sanitize raw bytes. Invalid UTF-8 is replaced, never rejected.
pub fn sanitize_bytes(content: &[u8], content_type: ContentType, max_chars: usize) -> String {
    sanitize(&String::from_utf8_lossy(content), content_type, max_chars)
}

/// Convert HTML to markdown, dropping non-content elements.
///
/// Falls back to [`strip_html`] when the converter errors out.
pub fn html_to_markdown(html: &str) -> String {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIPPED_TAGS.to_vec())
        .build();
    match converter.convert(html) {
        Ok(markdown) => markdown,
        Err(e) => {
            debug!(error = %e, "HTML conversion failed, stripping tags instead");
            strip_html(html)
        }
    }
}

/// Strip HTML tags (and the contents of script/style blocks) from a string.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();
    let mut skipping: Option<&str> = None;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                match skipping {
                    Some(open) if tag.starts_with('/') && name == open => skipping = None,
                    None if !tag.starts_with('/') && (name == "script" || name == "style") => {
                        skipping = Some(if name == "script" { "script" } else { "style" });
                    }
                    _ => {}
                }
                result.push(' ');
            }
            _ if in_tag => tag.push(ch),
            _ if skipping.is_none() => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Flatten text into a single compact line.
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = TAG_RE.replace_all(text, "");
    let text = IMAGE_RE.replace_all(&text, "");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = text.replace('|', " ");
    let text = RULE_RE.replace_all(&text, "");
    let text = URL_RE.replace_all(&text, "");
    let text = QUOTE_RE.replace_all(&text, "");
    let text = NEWLINES_RE.replace_all(&text, " ");
    let text = SYMBOL_RE.replace_all(&text, "");
    let text = SPACES_RE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Truncate to at most `max_chars` chars, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Lower-cased domain of an address, or `None` when there is no single `@`.
pub fn extract_sender_domain(address: &str) -> Option<String> {
    let address = address.trim();
    let (local, domain) = address.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Whether an address looks like an automated no-reply sender.
pub fn is_noreply_address(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    !lower.is_empty() && NOREPLY_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── clean_text ──────────────────────────────────────────────────

    #[test]
    fn clean_keeps_link_text_and_drops_images() {
        let text = "See [the report](https://x.io/r) ![logo](https://x.io/l.png) now";
        assert_eq!(clean_text(text), "See the report now");
    }

    #[test]
    fn clean_removes_urls_rules_and_pipes() {
        let text = "a | b\n---\nvisit https://example.com/path?q=1 today";
        assert_eq!(clean_text(text), "a b visit today");
    }

    #[test]
    fn clean_drops_quoted_reply_lines() {
        let text = "Thanks!\n> earlier message\n>> older\nBye";
        assert_eq!(clean_text(text), "Thanks! Bye");
    }

    #[test]
    fn clean_strips_uncommon_symbols() {
        assert_eq!(clean_text("Hello ★ world ™ 50% off!"), "Hello world 50% off!");
    }

    #[test]
    fn clean_empty() {
        assert_eq!(clean_text(""), "");
    }

    // ── sanitize ────────────────────────────────────────────────────

    #[test]
    fn html_drops_script_and_style() {
        let html = "<html><head><title>T</title><style>p{color:red}</style></head>\
                    <body><script>alert(1)</script><p>Hello <b>there</b></p></body></html>";
        let out = sanitize(html, ContentType::Html, DEFAULT_MAX_CHARS);
        assert!(out.contains("Hello"));
        assert!(out.contains("there"));
        assert!(!out.contains("alert"));
        assert!(!out.contains("color"));
    }

    #[test]
    fn text_is_cleaned_directly() {
        let out = sanitize("Line one\n\nLine   two", ContentType::Text, DEFAULT_MAX_CHARS);
        assert_eq!(out, "Line one Line two");
    }

    #[test]
    fn truncates_with_ellipsis() {
        let long = "word ".repeat(2000);
        let out = sanitize(&long, ContentType::Text, 20);
        assert_eq!(out.chars().count(), 23);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll...");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let bytes = b"Hello \xff\xfe world";
        let out = sanitize_bytes(bytes, ContentType::Text, DEFAULT_MAX_CHARS);
        assert!(out.starts_with("Hello"));
        assert!(out.ends_with("world"));
    }

    #[test]
    fn blank_input_is_empty() {
        assert_eq!(sanitize("   ", ContentType::Html, DEFAULT_MAX_CHARS), "");
    }

    // ── strip_html ──────────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p><p>World</p>"), "Hello World");
    }

    #[test]
    fn strip_html_skips_script_bodies() {
        assert_eq!(strip_html("a<script>var x = 1;</script>b"), "a b");
    }

    // ── address helpers ─────────────────────────────────────────────

    #[test]
    fn sender_domain() {
        assert_eq!(extract_sender_domain("Bob@Example.COM"), Some("example.com".into()));
        assert_eq!(extract_sender_domain("nobody"), None);
        assert_eq!(extract_sender_domain("a@b@c"), None);
        assert_eq!(extract_sender_domain("@example.com"), None);
    }

    #[test]
    fn noreply_detection() {
        assert!(is_noreply_address("no-reply@shop.com"));
        assert!(is_noreply_address("NoReply@shop.com"));
        assert!(is_noreply_address("MAILER-DAEMON@mx.example.org"));
        assert!(!is_noreply_address("alice@shop.com"));
        assert!(!is_noreply_address(""));
    }
}
