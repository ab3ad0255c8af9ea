//! Quick-answer sentence boundary detection.

use crate::config::BoundaryConfig;

/// Find the end (byte offset, split character included) of the shortest
/// acceptable quick answer at the start of `text`.
///
/// Scans at most `max_len` characters. A split character only ends the quick
/// answer once at least `min_len` characters have been scanned and at least
/// `min_alnum` of them were alphanumeric, so short interjections and a lone
/// leading comma never qualify.
pub fn find_boundary(text: &str, config: &BoundaryConfig) -> Option<usize> {
    let mut alnum = 0usize;
    for (scanned, (offset, ch)) in text.char_indices().take(config.max_len).enumerate() {
        if ch.is_alphanumeric() {
            alnum += 1;
        }
        if config.split_chars.contains(&ch)
            && scanned + 1 >= config.min_len
            && alnum >= config.min_alnum
        {
            return Some(offset + ch.len_utf8());
        }
    }
    None
}

/// Split `text` into `(quick answer, overhang)` if it is long enough to be
/// checked and contains a boundary.
pub fn split_quick_answer<'a>(
    text: &'a str,
    config: &BoundaryConfig,
) -> Option<(&'a str, &'a str)> {
    if text.chars().count() <= config.min_accumulated_chars {
        return None;
    }
    find_boundary(text, config).map(|end| text.split_at(end))
}
