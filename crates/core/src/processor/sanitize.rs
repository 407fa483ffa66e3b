//! Input normalisation.

use super::types::Mention;

/// Punctuation kept by [`sanitize`]; everything else that is not a letter,
/// digit or whitespace is dropped.
const ALLOWED_PUNCTUATION: &[char] = &['-', '_', '.', '@', '&', '+', '#', '(', ')', '（', '）'];

/// Trim, drop punctuation outside the allowed set and collapse whitespace.
/// Idempotent.
pub fn sanitize(text: &str) -> String {
    let kept: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || ALLOWED_PUNCTUATION.contains(c))
        .collect();
    collapse_whitespace(&kept)
}

/// Postback payloads are structured; only trim them and strip control
/// characters.
pub fn sanitize_postback(data: &str) -> String {
    data.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove mention spans (codepoint index and length) from the original
/// text, last first so earlier indices stay valid. Out-of-range spans are
/// clamped.
pub fn strip_mentions(text: &str, mentions: &[Mention]) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    let mut spans: Vec<&Mention> = mentions.iter().collect();
    spans.sort_by(|a, b| b.index.cmp(&a.index));
    for m in spans {
        let start = m.index.min(chars.len());
        let end = m.index.saturating_add(m.length).min(chars.len());
        chars.drain(start..end);
    }
    chars.into_iter().collect()
}
