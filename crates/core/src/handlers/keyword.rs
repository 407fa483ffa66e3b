//! Leading-keyword claims.

/// Ordered keyword set matched at the start of a message, longest first.
///
/// ASCII keywords fold case and must end on a word boundary. CJK keywords
/// claim any prefix ("學生會" starts with "學生"), as CJK text carries no
/// word separators and "學生王小明" is a valid query.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<&'static str>,
}

impl KeywordMatcher {
    pub fn new(keywords: &[&'static str]) -> Self {
        let mut keywords: Vec<&'static str> =
            keywords.iter().copied().filter(|k| !k.is_empty()).collect();
        // Longest first so "課程查詢" is not stolen by "課程".
        keywords.sort_by_key(|k| std::cmp::Reverse(k.chars().count()));
        Self { keywords }
    }

    pub fn keywords(&self) -> &[&'static str] {
        &self.keywords
    }

    /// The keyword that starts `text` (trimmed) and the trimmed remainder.
    pub fn strip<'a>(&self, text: &'a str) -> Option<(&'static str, &'a str)> {
        let text = text.trim();
        self.keywords.iter().find_map(|kw| {
            let head = text.get(..kw.len())?;
            if !head.eq_ignore_ascii_case(kw) {
                return None;
            }
            let rest = &text[kw.len()..];
            // ASCII keywords must end on a word boundary.
            let ends_ascii_word = kw.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
            if ends_ascii_word && rest.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            Some((*kw, rest.trim()))
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.strip(text).is_some()
    }
}

/// Byte offset of the first occurrence of `needle`, folding ASCII case the
/// same way [`KeywordMatcher::strip`] does.
fn find_ignore_ascii_case(text: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    text.char_indices().map(|(i, _)| i).find(|&i| {
        text.get(i..i + needle.len())
            .is_some_and(|window| window.eq_ignore_ascii_case(needle))
    })
}

/// Remove the first occurrence of `keyword` wherever it appears and return
/// the rest with whitespace collapsed.
pub fn extract_search_term(text: &str, keyword: &str) -> String {
    let remainder = match find_ignore_ascii_case(text, keyword) {
        Some(i) => format!("{} {}", &text[..i], &text[i + keyword.len()..]),
        None => text.to_string(),
    };
    remainder.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Leading run of ASCII digits and the remainder.
pub(crate) fn leading_digits(text: &str) -> (&str, &str) {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    (&text[..end], &text[end..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_keyword_wins() {
        let m = KeywordMatcher::new(&["課程", "課程查詢", "course"]);
        assert_eq!(m.strip("課程查詢 微積分"), Some(("課程查詢", "微積分")));
        assert_eq!(m.strip("  課程 微積分 "), Some(("課程", "微積分")));
        assert_eq!(m.strip("微積分 課程"), None);
    }

    #[test]
    fn test_ascii_keywords_fold_case_and_need_boundary() {
        let m = KeywordMatcher::new(&["class"]);
        assert_eq!(m.strip("Class calculus"), Some(("class", "calculus")));
        assert!(!m.matches("classroom"));
        assert!(m.matches("class"));
    }

    #[test]
    fn test_extract_search_term_positions() {
        assert_eq!(extract_search_term("課程 微積分", "課程"), "微積分");
        assert_eq!(extract_search_term("微積分 課程", "課程"), "微積分");
        assert_eq!(extract_search_term("113 課程 微積分", "課程"), "113 微積分");
        assert_eq!(extract_search_term("微積分", "課程"), "微積分");
    }

    #[test]
    fn test_extract_search_term_folds_ascii_case() {
        assert_eq!(extract_search_term("Course 微積分", "course"), "微積分");
        assert_eq!(extract_search_term("CLASS 微積分", "class"), "微積分");
        assert_eq!(extract_search_term("微積分 cOuRsE", "course"), "微積分");
        assert_eq!(extract_search_term("課程 微積分", "course"), "課程 微積分");
    }

    #[test]
    fn test_leading_digits() {
        assert_eq!(leading_digits("411285001 x"), ("411285001", " x"));
        assert_eq!(leading_digits("abc"), ("", "abc"));
        assert_eq!(leading_digits("123"), ("123", ""));
    }
}
