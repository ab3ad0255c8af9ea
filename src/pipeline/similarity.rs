//! Tail-focused text similarity used to recognise revised transcripts.
//!
//! Streaming STT often re-emits the same utterance with small changes
//! (punctuation, casing, a corrected last word). Comparing only the last few
//! words of each normalised text tells "same utterance, lightly revised"
//! apart from "a different utterance".

use similar::TextDiff;

/// Similarity in `[0.0, 1.0]` between the last `tail_words` words of `a` and `b`.
///
/// Texts are lowercased, stripped of punctuation and whitespace-collapsed
/// first. Two empty texts are identical; an empty text is unlike any
/// non-empty one.
pub fn tail_similarity(a: &str, b: &str, tail_words: usize) -> f64 {
    let a = tail(&normalize(a), tail_words);
    let b = tail(&normalize(b), tail_words);
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio()),
    }
}

fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tail(text: &str, words: usize) -> String {
    let all: Vec<&str> = text.split(' ').filter(|w| !w.is_empty()).collect();
    let start = all.len().saturating_sub(words.max(1));
    all[start..].join(" ")
}
