//! Sentence-boundary chunker with provenance tracking.
//!
//! Splittable content items are sentence-tokenized and flattened into a
//! single ordered stream across the whole document; the greedy boundary
//! algorithm accumulates sentences until the current chunk reaches
//! `min_chunk_size`, never splitting mid-sentence. Items with
//! `can_split = false` (tabular data) pass through as single chunks
//! unchanged.
//!
//! Every chunk records the ordered locations and source-item indexes of its
//! contributing sentences plus `char_index`, its offset in the virtual
//! space-joined document. Joining chunk contents with single spaces
//! reproduces the original sentence stream losslessly (only whitespace is
//! normalized), and re-chunking identical items yields byte-identical
//! boundaries.

use crate::models::{estimate_tokens, Chunk, ContentItem};

/// Split normalized text into sentences.
///
/// A sentence ends at `.`, `!`, or `?` followed by a space (or end of
/// input). Whitespace is normalized to single spaces; no characters are
/// dropped, so rejoining with spaces reproduces the input
/// whitespace-normalized.
pub fn split_sentences(text: &str) -> Vec<String> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = normalized.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            // Consume trailing terminal punctuation ("?!", "...").
            while i + 1 < chars.len() && matches!(chars[i + 1], '.' | '!' | '?') {
                i += 1;
                current.push(chars[i]);
            }
            let at_boundary = chars.get(i + 1).map(|&n| n == ' ').unwrap_or(true);
            if at_boundary {
                sentences.push(current.trim().to_string());
                current.clear();
                i += 1; // skip the boundary space
            }
        }
        i += 1;
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// One entry of the flattened document stream.
struct StreamEntry {
    text: String,
    location: serde_json::Value,
    orig_index: usize,
    splittable: bool,
}

struct ChunkBuilder {
    content: String,
    locations: Vec<serde_json::Value>,
    orig_indexes: Vec<usize>,
}

impl ChunkBuilder {
    fn new() -> Self {
        Self {
            content: String::new(),
            locations: Vec::new(),
            orig_indexes: Vec::new(),
        }
    }

    fn push(&mut self, entry: &StreamEntry) {
        if !self.content.is_empty() {
            self.content.push(' ');
        }
        self.content.push_str(&entry.text);
        // Consecutive sentences usually share a location; record transitions.
        if self.locations.last() != Some(&entry.location) {
            self.locations.push(entry.location.clone());
        }
        if self.orig_indexes.last() != Some(&entry.orig_index) {
            self.orig_indexes.push(entry.orig_index);
        }
    }

    fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    fn seal(&mut self, char_index: usize) -> Chunk {
        let content = std::mem::take(&mut self.content);
        let token_count = estimate_tokens(&content);
        Chunk {
            token_count,
            content,
            locations: std::mem::take(&mut self.locations),
            orig_indexes: std::mem::take(&mut self.orig_indexes),
            char_index,
        }
    }
}

/// Chunk one document's content items.
///
/// Deterministic for identical input; chunking a single document must run
/// sequentially so `char_index` and `orig_indexes` stay stable across
/// re-processing.
pub fn chunk_items(items: &[ContentItem], min_chunk_size: usize) -> Vec<Chunk> {
    let mut stream: Vec<StreamEntry> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        if item.can_split {
            for sentence in split_sentences(&item.content) {
                stream.push(StreamEntry {
                    text: sentence,
                    location: item.location.clone(),
                    orig_index: idx,
                    splittable: true,
                });
            }
        } else if !item.content.is_empty() {
            stream.push(StreamEntry {
                text: item.content.clone(),
                location: item.location.clone(),
                orig_index: idx,
                splittable: false,
            });
        }
    }

    let mut chunks = Vec::new();
    let mut current = ChunkBuilder::new();
    // Offset of the next character in the virtual space-joined document.
    let mut offset = 0usize;
    // Offset where the current (unsealed) chunk starts.
    let mut chunk_start = 0usize;

    let seal =
        |current: &mut ChunkBuilder, chunks: &mut Vec<Chunk>, chunk_start: &mut usize, offset: usize| {
            if !current.is_empty() {
                chunks.push(current.seal(*chunk_start));
            }
            *chunk_start = offset;
        };

    for entry in &stream {
        let entry_len = entry.text.chars().count();

        // Unsplittable items and oversized sentences become exactly one
        // chunk; no mid-sentence splitting.
        if !entry.splittable || entry_len >= min_chunk_size {
            seal(&mut current, &mut chunks, &mut chunk_start, offset);
            current.push(entry);
            offset += entry_len + 1;
            seal(&mut current, &mut chunks, &mut chunk_start, offset);
            continue;
        }

        current.push(entry);
        offset += entry_len + 1;

        // Greedy boundary: the chunk is sealed as soon as the sentence that
        // crossed `min_chunk_size` lands, so every sealed chunk except the
        // document tail meets the minimum.
        if current.content.chars().count() >= min_chunk_size {
            seal(&mut current, &mut chunks, &mut chunk_start, offset);
        }
    }
    seal(&mut current, &mut chunks, &mut chunk_start, offset);

    chunks
}
