//! Overlapping, separator-aware text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters, where consecutive chunks share up to `chunk_overlap`
//! characters. Inside each window the chunker prefers to cut at a natural
//! boundary so chunks read as coherent passages.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and ordinal, plus a SHA-256 hash of its text. Re-chunking identical
//! text with identical parameters yields an identical sequence, which is
//! what lets the indexer treat re-ingestion as an upsert.
//!
//! # Algorithm
//!
//! 1. Skip leading whitespace; the window starts at the first visible char.
//! 2. If the rest of the text fits in `chunk_size`, emit it and stop.
//! 3. Otherwise search backward from `start + chunk_size` for the last
//!    `"\n\n"`, then `"\n"`, then `". "`, then `" "`. A boundary only
//!    counts if the chunk would extend past the overlap region, so every
//!    step makes progress.
//! 4. With no usable boundary, hard-cut at `chunk_size`.
//! 5. Trim trailing whitespace from the emitted span, then restart the
//!    window `chunk_overlap` characters before the cut, nudged forward to
//!    the next word start.
//!
//! # Example
//!
//! ```rust
//! use docchat_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams { chunk_size: 512, chunk_overlap: 128 };
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].ordinal, 0);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{chunk_id, Chunk};

/// Boundaries tried in order of preference.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Window parameters, both measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 128,
        }
    }
}

/// Split `text` into overlapping chunks.
///
/// Returns an empty vector when `text` has no visible content. Ordinals
/// are contiguous from 0 and `start`/`end` are character offsets into
/// `text` such that the chunk text is exactly that slice.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(size - 1);

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut chunks = Vec::new();

    let mut start = skip_whitespace(&chars, 0);
    while start < n {
        let hard_end = (start + size).min(n);
        let end = if hard_end == n {
            n
        } else {
            find_break(&chars, start, hard_end, overlap).unwrap_or(hard_end)
        };

        let mut span_end = end;
        while span_end > start && chars[span_end - 1].is_whitespace() {
            span_end -= 1;
        }
        let body: String = chars[start..span_end].iter().collect();
        chunks.push(make_chunk(document_id, chunks.len() as u32, start, span_end, body));

        if end == n {
            break;
        }
        start = skip_whitespace(&chars, overlap_start(&chars, end - overlap, end));
    }

    chunks
}

/// Last separator-terminated position in `(start + overlap, hard_end]`.
fn find_break(chars: &[char], start: usize, hard_end: usize, overlap: usize) -> Option<usize> {
    let floor = start + overlap;
    for sep in SEPARATORS {
        let sep: Vec<char> = sep.chars().collect();
        let width = sep.len();
        if hard_end < start + width {
            continue;
        }
        let mut pos = hard_end - width;
        loop {
            let cut = pos + width;
            if cut <= floor {
                break;
            }
            if chars[pos..cut] == sep[..] {
                return Some(cut);
            }
            if pos == start {
                break;
            }
            pos -= 1;
        }
    }
    None
}

/// Restart point inside `[from, end)`: just past the first whitespace so
/// the next chunk opens on a word, or `from` when the region has none.
fn overlap_start(chars: &[char], from: usize, end: usize) -> usize {
    chars[from..end]
        .iter()
        .position(|c| c.is_whitespace())
        .map(|i| from + i + 1)
        .unwrap_or(from)
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn make_chunk(document_id: &str, ordinal: u32, start: usize, end: usize, text: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, ordinal),
        document_id: document_id.to_string(),
        ordinal,
        start,
        end,
        text,
        hash,
    }
}
