// SPDX-License-Identifier: PMPL-1.0-or-later
//! Lexical fallback scoring
//!
//! Token-overlap similarity for insights that arrive without embeddings.
//! Tokens are collected into a `BTreeSet` so the result never depends on
//! hash ordering.

use std::collections::BTreeSet;

/// Split text into lower-cased tokens with punctuation stripped.
///
/// Apostrophes inside words are dropped rather than splitting the word, so
/// "isn't" becomes "isnt".
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '\'' && c != '%'))
        .map(|raw| {
            raw.chars()
                .filter(|c| c.is_alphanumeric() || *c == '%')
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Jaccard index of the token sets of `a` and `b`.
///
/// Two texts that both tokenize to nothing score 0.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_strips_punctuation() {
        let tokens = tokenize("Acme's Q3 launch: POSITIVE, (mostly)!");
        let expected: BTreeSet<String> = ["acmes", "q3", "launch", "positive", "mostly"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_tokenize_keeps_percent() {
        let tokens = tokenize("share fell 12% overnight");
        assert!(tokens.contains("12%"));
    }

    #[test]
    fn test_jaccard_bounds() {
        assert_eq!(jaccard("a b c", "a b c"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        assert_eq!(jaccard("", ""), 0.0);
        assert!((jaccard("a b c", "a b d") - 0.5).abs() < 1e-12);
    }
}
