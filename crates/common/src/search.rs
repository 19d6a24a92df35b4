//! Byte pattern search and layout-preserving substitution
//!
//! Short patterns use a straight scan. Longer patterns use Boyer-Moore with
//! the bad-character table, which skips ahead on mismatches and wins once the
//! pattern is long enough to amortize building the table.

use crate::error::{HotpatchError, Result};

/// Patterns up to this length use the naive scan
pub const NAIVE_PATTERN_LIMIT: usize = 4;

/// Naive left-to-right scan starting at `start`
pub fn naive_find_from(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    let m = needle.len();
    if m == 0 || start > haystack.len() || haystack.len() - start < m {
        return None;
    }
    (start..=haystack.len() - m).find(|&i| &haystack[i..i + m] == needle)
}

/// Boyer-Moore search (bad-character rule) starting at `start`
pub fn boyer_moore_find_from(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    let m = needle.len();
    let n = haystack.len();
    if m == 0 || start > n || n - start < m {
        return None;
    }

    let mut last = [-1isize; 256];
    for (i, &b) in needle.iter().enumerate() {
        last[b as usize] = i as isize;
    }

    let mut shift = start;
    while shift <= n - m {
        let mut j = m as isize - 1;
        while j >= 0 && needle[j as usize] == haystack[shift + j as usize] {
            j -= 1;
        }
        if j < 0 {
            return Some(shift);
        }
        let bad = last[haystack[shift + j as usize] as usize];
        shift += (j - bad).max(1) as usize;
    }
    None
}

/// First occurrence of `needle` at or after `start`
pub fn find_from(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.len() <= NAIVE_PATTERN_LIMIT {
        naive_find_from(haystack, needle, start)
    } else {
        boyer_moore_find_from(haystack, needle, start)
    }
}

/// First occurrence of `needle`
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    find_from(haystack, needle, 0)
}

/// Offsets of all non-overlapping occurrences
pub fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut hits = Vec::new();
    let mut pos = 0;
    while let Some(idx) = find_from(haystack, needle, pos) {
        hits.push(idx);
        pos = idx + needle.len();
    }
    hits
}

/// Substitute equal-length occurrences in place
///
/// The buffer length never changes; only matched ranges are written. Returns
/// the number of replacements made, capped by `max_occurrences` when given.
pub fn replace_in_place(
    buffer: &mut [u8],
    pattern: &[u8],
    replacement: &[u8],
    max_occurrences: Option<usize>,
) -> Result<usize> {
    if pattern.is_empty() {
        return Err(HotpatchError::invalid_input("empty search pattern"));
    }
    if pattern.len() != replacement.len() {
        return Err(HotpatchError::invalid_input(format!(
            "replacement length {} differs from pattern length {}",
            replacement.len(),
            pattern.len()
        )));
    }

    let limit = max_occurrences.unwrap_or(usize::MAX);
    let mut count = 0;
    let mut pos = 0;
    while count < limit {
        let Some(idx) = find_from(buffer, pattern, pos) else {
            break;
        };
        buffer[idx..idx + pattern.len()].copy_from_slice(replacement);
        count += 1;
        pos = idx + pattern.len();
    }
    Ok(count)
}

/// Substitute all occurrences, producing a new buffer of possibly different length
pub fn replace_all(buffer: &[u8], pattern: &[u8], replacement: &[u8]) -> (Vec<u8>, usize) {
    if pattern.is_empty() {
        return (buffer.to_vec(), 0);
    }
    let mut out = Vec::with_capacity(buffer.len());
    let mut count = 0;
    let mut pos = 0;
    while let Some(idx) = find_from(buffer, pattern, pos) {
        out.extend_from_slice(&buffer[pos..idx]);
        out.extend_from_slice(replacement);
        count += 1;
        pos = idx + pattern.len();
    }
    out.extend_from_slice(&buffer[pos..]);
    (out, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_find_dispatch() {
        let hay = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(find(hay, b"the"), Some(0));
        assert_eq!(find_from(hay, b"the", 1), Some(31));
        assert_eq!(find(hay, b"lazy dog"), Some(35));
        assert_eq!(find(hay, b"cat"), None);
        assert_eq!(find(hay, b""), None);
        assert_eq!(find(b"ab", b"abc"), None);
    }

    #[test]
    fn test_find_all_non_overlapping() {
        assert_eq!(find_all(b"aaaa", b"aa"), vec![0, 2]);
        assert_eq!(find_all(b"abcabcabc", b"abc"), vec![0, 3, 6]);
    }

    #[test]
    fn test_replace_in_place_preserves_length() {
        let mut buf = b"foo bar foo baz foo".to_vec();
        let n = replace_in_place(&mut buf, b"foo", b"qux", Some(2)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"qux bar qux baz foo");

        let err = replace_in_place(&mut buf, b"foo", b"longer", None);
        assert!(err.is_err());
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn test_replace_all_grows() {
        let (out, n) = replace_all(b"a-b-c", b"-", b"--");
        assert_eq!(n, 2);
        assert_eq!(&out, b"a--b--c");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_boyer_moore_matches_naive(
            haystack in proptest::collection::vec(0u8..4, 0..512),
            needle in proptest::collection::vec(0u8..4, 1..=64),
            start in 0usize..64,
        ) {
            prop_assert_eq!(
                boyer_moore_find_from(&haystack, &needle, start),
                naive_find_from(&haystack, &needle, start)
            );
        }

        #[test]
        fn prop_boyer_moore_finds_embedded(
            prefix in proptest::collection::vec(any::<u8>(), 0..256),
            needle in proptest::collection::vec(any::<u8>(), 1..=64),
        ) {
            let mut haystack = prefix.clone();
            haystack.extend_from_slice(&needle);
            prop_assert_eq!(
                boyer_moore_find_from(&haystack, &needle, 0),
                naive_find_from(&haystack, &needle, 0)
            );
            prop_assert!(boyer_moore_find_from(&haystack, &needle, 0).is_some());
        }
    }
}
