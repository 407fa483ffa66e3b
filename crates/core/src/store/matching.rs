//! Exact and fuzzy match predicates.
//!
//! Both fold ASCII letters to lowercase and compare every other codepoint
//! as-is. Both tiers run in Rust over the fresh working set.

use std::collections::HashMap;

fn fold(c: char) -> char {
    c.to_ascii_lowercase()
}

/// Substring containment (ASCII case-insensitive).
pub fn exact_contains(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let hay: String = haystack.chars().map(fold).collect();
    let pat: String = needle.chars().map(fold).collect();
    hay.contains(&pat)
}

/// Character-multiset containment: every codepoint of `needle` appears in
/// `haystack` at least as often as in `needle`. Order and adjacency are
/// ignored, as is whitespace in the needle.
pub fn fuzzy_contains(haystack: &str, needle: &str) -> bool {
    let mut wanted: HashMap<char, usize> = HashMap::new();
    for c in needle.chars().filter(|c| !c.is_whitespace()) {
        *wanted.entry(fold(c)).or_insert(0) += 1;
    }
    if wanted.is_empty() {
        return false;
    }

    for c in haystack.chars() {
        let c = fold(c);
        if let Some(count) = wanted.get_mut(&c) {
            *count -= 1;
            if *count == 0 {
                wanted.remove(&c);
                if wanted.is_empty() {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    const ALPHABET: &[char] = &['線', '性', '代', '數', '微', '積', '分', 'a', 'B', 'c', ' '];

    fn random_text(rng: &mut impl Rng, len: usize) -> String {
        (0..len)
            .map(|_| *ALPHABET.choose(rng).unwrap())
            .collect()
    }

    #[test]
    fn test_exact_contains_case_folding() {
        assert!(exact_contains("Linear Algebra", "algebra"));
        assert!(exact_contains("線性代數", "代數"));
        assert!(!exact_contains("線性代數", "線代"));
        assert!(!exact_contains("anything", ""));
    }

    #[test]
    fn test_fuzzy_contains_abbreviation() {
        assert!(fuzzy_contains("線性代數", "線代"));
        assert!(fuzzy_contains("王小明", "王明"));
        assert!(!fuzzy_contains("王小明", "王大明"));
    }

    #[test]
    fn test_fuzzy_counts_multiplicity() {
        assert!(!fuzzy_contains("王小明", "王王"));
        assert!(fuzzy_contains("王小王", "王王"));
    }

    #[test]
    fn test_fuzzy_ignores_needle_whitespace() {
        assert!(fuzzy_contains("王小明", "王 明"));
        assert!(!fuzzy_contains("王小明", "   "));
    }

    #[test]
    fn test_exact_implies_fuzzy() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let text_len = rng.gen_range(1..20);
            let text = random_text(&mut rng, text_len);
            let chars: Vec<char> = text.chars().collect();
            let start = rng.gen_range(0..chars.len());
            let end = rng.gen_range(start + 1..=chars.len());
            let needle: String = chars[start..end].iter().collect();
            if exact_contains(&text, &needle) && !needle.trim().is_empty() {
                assert!(fuzzy_contains(&text, &needle), "{:?} / {:?}", text, needle);
            }
        }
    }

    #[test]
    fn test_fuzzy_is_permutation_invariant() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let text_len = rng.gen_range(0..20);
            let text = random_text(&mut rng, text_len);
            let needle_len = rng.gen_range(1..6);
            let needle = random_text(&mut rng, needle_len);
            let mut shuffled: Vec<char> = needle.chars().collect();
            shuffled.shuffle(&mut rng);
            let shuffled: String = shuffled.into_iter().collect();
            assert_eq!(
                fuzzy_contains(&text, &needle),
                fuzzy_contains(&text, &shuffled)
            );
        }
    }
}
