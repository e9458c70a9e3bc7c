//! HTML → styled plain text.
//!
//! Answer blocks from the web search bot are HTML fragments. They are
//! rendered to plain text with `nanohtml2text`, keeping the hyperlinks the
//! HTML already carried as [`LinkSpan`]s, then bare URLs in the text are
//! linkified. A detected URL that overlaps an existing span is dropped, so
//! no range is ever linked twice.

use regex::Regex;
use std::sync::LazyLock;

static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#).unwrap()
});

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"']+"#).unwrap());

/// Block-level tag at the start of a fragment.
static LEADING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*<(?:br|/?(?:p|div|li|ul|ol|h[1-6]|tr|table|blockquote|pre))\b[^>]*>")
        .unwrap()
});

/// Block-level tag at the end of a fragment.
static TRAILING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:br|/?(?:p|div|li|ul|ol|h[1-6]|tr|table|blockquote|pre))\b[^>]*>\s*$")
        .unwrap()
});

/// A hyperlink over `text[start..end]` (byte offsets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpan {
    pub start: usize,
    pub end: usize,
    pub url: String,
}

/// Plain text plus the hyperlinks laid over it.
///
/// Spans are sorted by `start` and never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyledText {
    pub text: String,
    pub links: Vec<LinkSpan>,
}

impl StyledText {
    /// Text with no links.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            links: Vec::new(),
        }
    }

    /// The visible text covered by `span`.
    pub fn span_text(&self, span: &LinkSpan) -> &str {
        self.text.get(span.start..span.end).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Convert an HTML fragment into styled text with anchors preserved and
/// bare URLs linkified.
pub fn html_to_styled(html: &str) -> StyledText {
    let mut styled = StyledText::default();
    let mut cursor = 0;

    for caps in ANCHOR.captures_iter(html) {
        let (Some(whole), Some(href), Some(label)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };

        push_fragment(&mut styled.text, &html[cursor..whole.start()]);

        let url = decode_attribute(href.as_str().trim());
        let mut label_text = nanohtml2text::html2text(label.as_str()).trim().to_string();
        if label_text.is_empty() {
            label_text = url.clone();
        }

        let start = styled.text.len();
        styled.text.push_str(&label_text);
        if !url.is_empty() {
            styled.links.push(LinkSpan {
                start,
                end: styled.text.len(),
                url,
            });
        }
        cursor = whole.end();
    }
    push_fragment(&mut styled.text, &html[cursor..]);

    let visible_len = styled.text.trim_end().len();
    styled.text.truncate(visible_len);

    linkify(&mut styled);
    styled
}

/// Add spans for bare URLs that no existing span already covers.
pub fn linkify(styled: &mut StyledText) {
    let mut detected = Vec::new();

    for found in BARE_URL.find_iter(&styled.text) {
        let candidate = found
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')'));
        if candidate.is_empty() {
            continue;
        }
        let start = found.start();
        let end = start + candidate.len();

        let overlaps = styled
            .links
            .iter()
            .any(|existing| existing.start < end && start < existing.end);
        if overlaps {
            continue;
        }

        let url = if candidate.len() >= 4 && candidate[..4].eq_ignore_ascii_case("www.") {
            format!("http://{candidate}")
        } else {
            candidate.to_string()
        };
        detected.push(LinkSpan { start, end, url });
    }

    styled.links.extend(detected);
    styled.links.sort_by_key(|span| span.start);
}

/// Append the plain-text rendering of `raw`. A block-level tag at either
/// edge becomes a line break, plain whitespace a single space.
fn push_fragment(out: &mut String, raw: &str) {
    if raw.is_empty() {
        return;
    }
    let converted = nanohtml2text::html2text(raw);
    let converted = converted.trim();

    let before = edge_separator(raw.starts_with(char::is_whitespace), LEADING_BLOCK.is_match(raw));
    let after = edge_separator(raw.ends_with(char::is_whitespace), TRAILING_BLOCK.is_match(raw));

    push_separator(out, before);
    out.push_str(converted);
    push_separator(out, after);
}

fn edge_separator(whitespace: bool, block: bool) -> Option<char> {
    match (block, whitespace) {
        (true, _) => Some('\n'),
        (false, true) => Some(' '),
        (false, false) => None,
    }
}

fn push_separator(out: &mut String, separator: Option<char>) {
    if let Some(separator) = separator {
        if !out.is_empty() && !out.ends_with(char::is_whitespace) {
            out.push(separator);
        }
    }
}

fn decode_attribute(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
