//! Text and markup normalization shared by getters and builders.

use scraper::{Html, Selector};

/// Characters that are invalid in file names on at least one mainstream filesystem.
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Elements dropped from chapter fragments.
const UNSAFE_ELEMENTS: &str = "script, style, noscript, iframe, object, embed";

/// Remove characters that cannot appear in a file name.
///
/// Control characters are dropped too, and trailing dots and spaces are trimmed
/// (Windows silently strips them, which would change the name on disk).
pub fn remove_invalid_chars(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !INVALID_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    cleaned.trim().trim_end_matches(['.', ' ']).to_string()
}

/// Collapse line breaks (and the whitespace around them) into single spaces.
pub fn replace_newline(s: &str) -> String {
    s.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Wrap already-escaped text in `<tag>...</tag>`.
pub fn cover_tag(s: &str, tag: &str) -> String {
    format!("<{tag}>{s}</{tag}>")
}

/// Turn a plain multi-line annotation into paragraphs, one per non-empty line.
pub fn paragraphs(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| cover_tag(&escape_html(line), "p"))
        .collect()
}

/// Parse a raw markup fragment into a document tree with unsafe elements removed.
pub fn parse_fragment(markup: &str) -> Html {
    let mut doc = Html::parse_fragment(markup);
    let Ok(unsafe_sel) = Selector::parse(UNSAFE_ELEMENTS) else {
        return doc;
    };
    let ids: Vec<_> = doc.select(&unsafe_sel).map(|el| el.id()).collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
    doc
}

/// Serialize a fragment tree back to markup, without the synthetic `<html>` wrapper.
pub fn fragment_markup(doc: &Html) -> String {
    doc.root_element().inner_html().trim().to_string()
}

/// Sanitize a markup fragment: parse, drop unsafe elements, serialize.
pub fn sanitize_fragment(markup: &str) -> String {
    fragment_markup(&parse_fragment(markup))
}

/// Plain text of a markup fragment, one line per block of text.
pub fn plain_text(markup: &str) -> String {
    let doc = Html::parse_fragment(markup);
    let text = doc
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        markup.trim().to_string()
    } else {
        text
    }
}
