//! Text chunking and deterministic document ids for bulk ingestion.
//!
//! Text extraction from binary formats is out of scope; callers hand this
//! module plain text (uploaded `.txt`/`.md` content or pre-extracted text)
//! and get back overlapping chunks plus stable per-chunk ids.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Collapses whitespace artifacts: CRLF → LF, trailing spaces, runs of blank
/// lines, runs of spaces/tabs.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.split('\n') {
        let line = line.trim_end();
        let mut compact = String::with_capacity(line.len());
        let mut in_gap = false;
        for ch in line.chars() {
            if ch == ' ' || ch == '\t' {
                if !in_gap {
                    compact.push(' ');
                }
                in_gap = true;
            } else {
                compact.push(ch);
                in_gap = false;
            }
        }
        if compact.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&compact);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Splits normalized text into overlapping chunks of at most `chunk_size`
/// bytes, preferring to cut at a paragraph, line, sentence, or clause
/// boundary found after 60% of the window.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let text = normalize_text(text);
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= chunk_size || chunk_size == 0 {
        return vec![text];
    }

    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut last_start: Option<usize> = None;

    while start < bytes.len() {
        let mut end = (start + chunk_size).min(bytes.len());
        // Walk back to a char boundary.
        while end < bytes.len() && !text.is_char_boundary(end) {
            end -= 1;
        }

        if end < bytes.len() {
            let window = &text[start..end];
            let search_start = (window.len() as f64 * 0.6) as usize;
            let cut = ["\n\n", "\n", ". ", "; "]
                .iter()
                .filter_map(|sep| rfind_from(window, sep, search_start))
                .max();
            if let Some(cut) = cut {
                end = start + cut + 1;
            }
        }

        let chunk = text[start..end].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        let mut next_start = end.saturating_sub(overlap);
        while next_start < bytes.len() && !text.is_char_boundary(next_start) {
            next_start += 1;
        }
        if let Some(last) = last_start {
            if next_start <= last {
                next_start = end;
            }
        }
        last_start = Some(start);
        start = next_start;
    }

    chunks
}

fn rfind_from(window: &str, needle: &str, from: usize) -> Option<usize> {
    let from = if window.is_char_boundary(from) {
        from
    } else {
        (from..window.len()).find(|i| window.is_char_boundary(*i))?
    };
    window[from..].rfind(needle).map(|i| from + i)
}

/// SHA-256 of raw file bytes, hex-encoded; the file identity used in
/// deterministic chunk ids.
pub fn file_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Deterministic per-chunk document id:
/// `uuid = first-16-bytes-of-sha256(index ":" file_sha256 ":" chunk_index)`.
/// Stable across runs so re-ingestion upserts instead of duplicating.
pub fn chunk_document_id(index_name: &str, file_hash: &str, chunk_index: usize) -> String {
    let digest = Sha256::digest(format!("{index_name}:{file_hash}:{chunk_index}").as_bytes());
    Uuid::from_slice(&digest[..16])
        .expect("sha256 digest always has 16 bytes to take")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        let raw = "a  b\t\tc   \r\nd\r\n\r\n\r\n\r\ne";
        assert_eq!(normalize_text(raw), "a b c\nd\n\ne");
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("short text", 1500, 300), vec!["short text"]);
        assert!(chunk_text("   ", 1500, 300).is_empty());
    }

    #[test]
    fn long_text_chunks_cover_the_input_with_overlap() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(50);
        let chunks = chunk_text(&text, 200, 40);
        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 200);
            assert!(!chunk.is_empty());
        }
        // First and last words survive chunking.
        assert!(chunks.first().unwrap().starts_with("The quick"));
        assert!(chunks.last().unwrap().contains("lazy dog"));
    }

    #[test]
    fn chunks_prefer_sentence_boundaries() {
        let text = format!("{}{}", "x".repeat(150), ". Short tail sentence here.");
        let chunks = chunk_text(&text, 160, 20);
        assert!(chunks[0].ends_with('.') || chunks.len() == 1);
    }

    /// **Scenario**: same (index, file bytes, chunk index) always yields the
    /// same UUID; any component change yields a different one.
    #[test]
    fn chunk_ids_are_stable_and_distinct() {
        let hash = file_sha256(b"file contents");
        let a1 = chunk_document_id("docs", &hash, 0);
        let a2 = chunk_document_id("docs", &hash, 0);
        assert_eq!(a1, a2);
        assert!(Uuid::parse_str(&a1).is_ok());

        assert_ne!(a1, chunk_document_id("docs", &hash, 1));
        assert_ne!(a1, chunk_document_id("other", &hash, 0));
        assert_ne!(a1, chunk_document_id("docs", &file_sha256(b"other"), 0));
    }

    #[test]
    fn chunking_handles_multibyte_text() {
        let text = "ração e coração são palavras acentuadas. ".repeat(30);
        let chunks = chunk_text(&text, 100, 20);
        assert!(!chunks.is_empty());
        // No chunk may split a UTF-8 sequence (String construction would
        // have panicked); spot-check content survived.
        assert!(chunks[0].contains("ração"));
    }
}
