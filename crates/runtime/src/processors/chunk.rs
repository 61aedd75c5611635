//! Deterministic text chunkers for document ingestion.

use std::sync::LazyLock;

use regex::Regex;

use cf_domain::event::ChunkStrategy;

/// Sentence boundary: terminator (+ closing quotes/brackets) followed
/// by whitespace, or end of input.
static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[^.!?]*[.!?]+["')\]]*\s*|[^.!?]+$"#).expect("sentence regex is valid")
});

/// Split `text` into chunks of roughly `chunk_size` characters with
/// `overlap` characters carried between consecutive chunks.
pub fn chunk_text(
    text: &str,
    strategy: ChunkStrategy,
    chunk_size: usize,
    overlap: usize,
) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(chunk_size.saturating_sub(1));
    match strategy {
        ChunkStrategy::Sentences => chunk_by_sentences(text, chunk_size, overlap),
        ChunkStrategy::Fixed => chunk_fixed(text, chunk_size, overlap),
    }
}

/// Rough token estimate (4 chars per token).
pub fn estimate_tokens(text: &str) -> i32 {
    ((text.chars().count() + 3) / 4) as i32
}

fn chunk_by_sentences(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let sentences: Vec<&str> = SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|s| !s.trim().is_empty())
        .collect();

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for sentence in sentences {
        // A single sentence longer than the target gets split fixed.
        if sentence.len() > chunk_size {
            if !current.is_empty() {
                chunks.push(join_trimmed(&current));
                current.clear();
                current_len = 0;
            }
            chunks.extend(chunk_fixed(sentence.trim(), chunk_size, overlap));
            continue;
        }

        if current_len + sentence.len() > chunk_size && !current.is_empty() {
            chunks.push(join_trimmed(&current));
            // Carry trailing sentences up to `overlap` characters.
            let mut carried: Vec<&str> = Vec::new();
            let mut carried_len = 0usize;
            for s in current.iter().rev() {
                if carried_len + s.len() > overlap {
                    break;
                }
                carried_len += s.len();
                carried.push(s);
            }
            carried.reverse();
            current = carried;
            current_len = carried_len;
        }
        current_len += sentence.len();
        current.push(sentence);
    }

    if !current.is_empty() {
        let tail = join_trimmed(&current);
        // Avoid emitting an overlap-only duplicate tail.
        if chunks.last().map(String::as_str) != Some(tail.as_str()) {
            chunks.push(tail);
        }
    }
    chunks
}

fn join_trimmed(sentences: &[&str]) -> String {
    sentences.concat().trim().to_string()
}

fn chunk_fixed(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            chunks.push(piece);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_chunks_cover_text_with_overlap() {
        let text = "abcdefghij";
        let chunks = chunk_text(text, ChunkStrategy::Fixed, 4, 2);
        assert_eq!(chunks, vec!["abcd", "cdef", "efgh", "ghij"]);
    }

    #[test]
    fn fixed_without_overlap() {
        let chunks = chunk_text("abcdefghij", ChunkStrategy::Fixed, 5, 0);
        assert_eq!(chunks, vec!["abcde", "fghij"]);
    }

    #[test]
    fn sentences_pack_to_size() {
        let text = "One. Two. Three. Four. Five.";
        let chunks = chunk_text(text, ChunkStrategy::Sentences, 12, 0);
        assert!(chunks.len() > 1, "{chunks:?}");
        // Every sentence survives somewhere, in order.
        let joined = chunks.join(" ");
        for s in ["One.", "Two.", "Three.", "Four.", "Five."] {
            assert!(joined.contains(s), "missing {s} in {joined:?}");
        }
    }

    #[test]
    fn sentence_overlap_carries_tail() {
        let text = "Alpha beta. Gamma delta. Epsilon zeta.";
        let chunks = chunk_text(text, ChunkStrategy::Sentences, 26, 14);
        assert_eq!(chunks.len(), 2, "{chunks:?}");
        // The second chunk starts with the carried previous sentence.
        assert!(
            chunks[1].starts_with("Gamma delta."),
            "no overlap carried: {chunks:?}"
        );
    }

    #[test]
    fn sentence_overlap_smaller_than_sentence_carries_nothing() {
        let text = "Alpha beta. Gamma delta. Epsilon zeta.";
        let chunks = chunk_text(text, ChunkStrategy::Sentences, 26, 8);
        assert_eq!(chunks, vec!["Alpha beta. Gamma delta.", "Epsilon zeta."]);
    }

    #[test]
    fn oversized_sentence_falls_back_to_fixed() {
        let text = "Short. Thisisaverylongsentencewithoutanyboundarymarkers continuing on.";
        let chunks = chunk_text(text, ChunkStrategy::Sentences, 20, 0);
        assert!(chunks.iter().all(|c| c.len() <= 20), "{chunks:?}");
    }

    #[test]
    fn deterministic() {
        let text = "One two three. Four five six. Seven eight nine.";
        let a = chunk_text(text, ChunkStrategy::Sentences, 20, 5);
        let b = chunk_text(text, ChunkStrategy::Sentences, 20, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(chunk_text("", ChunkStrategy::Sentences, 100, 10).is_empty());
        assert!(chunk_text("   ", ChunkStrategy::Fixed, 100, 10).is_empty());
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
