//! Splitting source documents into overlapping word windows before upload.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{RagError, Result};

/// Default words per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50;
/// Default words shared by consecutive chunks of one paragraph.
pub const DEFAULT_OVERLAP: usize = 10;

/// Reads `path` and returns its non-empty paragraphs (blocks separated by a blank line).
pub fn load_paragraphs(path: &Path) -> io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(split_paragraphs(&text))
}

/// Paragraphs of `text`, trimmed, empty ones dropped.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|para| !para.is_empty())
        .map(str::to_string)
        .collect()
}

/// Word windows of `chunk_size` words advancing by `chunk_size - overlap`.
///
/// Windows never span paragraphs. The tail window of a paragraph may be shorter.
pub fn create_chunks(paragraphs: &[String], chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    if chunk_size == 0 || overlap >= chunk_size {
        return Err(RagError::Input(format!(
            "chunk size {chunk_size} must exceed overlap {overlap}"
        )));
    }
    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    for para in paragraphs {
        let words: Vec<&str> = para.split_whitespace().collect();
        let mut start = 0;
        while start < words.len() {
            let end = (start + chunk_size).min(words.len());
            chunks.push(words[start..end].join(" "));
            start += step;
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Tokyo is large.\n\n\n  Kyoto has temples. \r\n\r\nLima is in Peru.\n").unwrap();
        let paragraphs = load_paragraphs(file.path()).unwrap();
        assert_eq!(
            paragraphs,
            vec!["Tokyo is large.", "Kyoto has temples.", "Lima is in Peru."]
        );
    }

    #[test]
    fn windows_overlap_within_a_paragraph() {
        let paragraphs = vec!["a b c d e f g".to_string(), "x y".to_string()];
        let chunks = create_chunks(&paragraphs, 3, 1).unwrap();
        assert_eq!(chunks, vec!["a b c", "c d e", "e f g", "g", "x y"]);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        assert!(create_chunks(&[], 3, 3).is_err());
        assert!(create_chunks(&[], 0, 0).is_err());
    }
}
