//! Word-boundary text chunker with percentage overlap.
//!
//! Splits extracted document text into chunks whose UTF-8 byte length stays
//! within a target budget. Words are accumulated greedily; when the next word
//! would push the chunk past the budget, the chunk is closed and the next one
//! is seeded with the trailing `overlap_percent`% of its words. The overlap is
//! recomputed at every boundary from the closed chunk's own word count.
//!
//! A single word longer than the budget is emitted on its own rather than
//! truncated or dropped.

/// Split `text` into overlapping chunks of roughly `target_size` bytes.
///
/// Whitespace-only input yields no chunks.
pub fn split_text(text: &str, target_size: usize, overlap_percent: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_size = 0usize;

    for word in text.split_whitespace() {
        let word_size = word.len() + 1;

        if current_size + word_size > target_size && !current.is_empty() {
            chunks.push(current.join(" "));

            let overlap_words = current.len() * overlap_percent / 100;
            if overlap_words > 0 && overlap_words < current.len() {
                let seed = current.split_off(current.len() - overlap_words);
                current = seed;
                current_size = joined_len(&current);
            } else {
                current.clear();
                current_size = 0;
            }
        }

        current.push(word);
        current_size += word_size;
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

/// Number of whitespace-separated words in `text`.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn joined_len(words: &[&str]) -> usize {
    let bytes: usize = words.iter().map(|w| w.len()).sum();
    bytes + words.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 512, 50);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_and_whitespace_text() {
        assert!(split_text("", 512, 50).is_empty());
        assert!(split_text("   ", 512, 50).is_empty());
        assert!(split_text("\n\t \n", 512, 50).is_empty());
    }

    #[test]
    fn test_whitespace_normalised() {
        let chunks = split_text("alpha\n\n beta\tgamma", 512, 0);
        assert_eq!(chunks, vec!["alpha beta gamma".to_string()]);
    }

    #[test]
    fn test_oversized_word_kept_whole() {
        let long = "x".repeat(40);
        let text = format!("a {} b", long);
        let chunks = split_text(&text, 10, 0);
        assert_eq!(chunks, vec!["a".to_string(), long, "b".to_string()]);
    }

    #[test]
    fn test_no_overlap_partitions_words() {
        // each word costs 3 toward the budget, so three fit in 10
        let text = "w0 w1 w2 w3 w4 w5 w6 w7 w8 w9";
        let chunks = split_text(text, 10, 0);
        assert_eq!(chunks, vec!["w0 w1 w2", "w3 w4 w5", "w6 w7 w8", "w9"]);
    }

    #[test]
    fn test_overlap_seeds_next_chunk() {
        let text = "aa bb cc dd ee ff";
        let chunks = split_text(text, 12, 50);
        assert_eq!(chunks, vec!["aa bb cc dd", "cc dd ee ff"]);
    }

    #[test]
    fn test_overlap_recomputed_per_boundary() {
        // six words carry three forward, then four words carry two
        let chunks = split_text("a b c d e f ggggggg h", 12, 50);
        assert_eq!(chunks, vec!["a b c d e f", "d e f ggggggg", "f ggggggg h"]);
    }

    #[test]
    fn test_single_word_chunk_gets_no_overlap() {
        let chunks = split_text("aaaaaaaa bbbbbbbb", 10, 50);
        assert_eq!(chunks, vec!["aaaaaaaa", "bbbbbbbb"]);
    }

    #[test]
    fn test_full_overlap_is_ignored() {
        // overlap_words == len(chunk) would never make progress
        let chunks = split_text("aa bb cc dd", 6, 100);
        assert_eq!(chunks, vec!["aa bb", "cc dd"]);
    }

    #[test]
    fn test_coverage_preserves_word_order() {
        let text = numbered_words(400);
        let chunks = split_text(&text, 64, 30);
        assert!(chunks.len() > 1);

        let mut seen = 0usize;
        for chunk in &chunks {
            for word in chunk.split(' ') {
                let idx: usize = word[1..].parse().unwrap();
                if idx == seen {
                    seen += 1;
                } else {
                    assert!(idx < seen, "word {} skipped ahead of {}", idx, seen);
                }
            }
        }
        assert_eq!(seen, 400);
    }

    #[test]
    fn test_size_bound() {
        let text = numbered_words(1000);
        let longest = text.split_whitespace().map(|w| w.len()).max().unwrap();
        for chunk in split_text(&text, 120, 50) {
            assert!(chunk.len() <= 120 + longest, "chunk too long: {}", chunk);
        }
    }

    #[test]
    fn test_budget_counts_bytes() {
        // "éé" is four bytes, so only two of them fit in ten
        assert_eq!(split_text("éé éé éé", 10, 0), vec!["éé éé", "éé"]);
        assert_eq!(split_text("ee ee ee", 10, 0), vec!["ee ee ee"]);
    }

    #[test]
    fn test_deterministic() {
        let text = numbered_words(300);
        assert_eq!(split_text(&text, 50, 25), split_text(&text, 50, 25));
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("  one two\nthree  "), 3);
        assert_eq!(word_count(""), 0);
    }
}
