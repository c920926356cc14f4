//! Paragraph- and sentence-aware text chunker with overlap.
//!
//! Splits document text into [`Chunk`]s that target `max_chunk_chars`,
//! never leave an undersized trailing fragment when there is something to
//! merge it into, and carry a word-aligned tail of each chunk into the next
//! one so retrieval does not lose context at chunk boundaries.
//!
//! # Algorithm
//!
//! 1. Split text on blank lines into paragraphs.
//! 2. Paragraphs longer than `max_chunk_chars` are split at sentence
//!    boundaries (`.`, `!`, `?` followed by whitespace); a paragraph with no
//!    sentence boundary is word-wrapped instead. A short final sentence
//!    fragment is merged into the fragment before it.
//! 3. Segments are packed greedily. The buffer is flushed when the next
//!    segment would push it past `max_chunk_chars` **and** it already holds
//!    at least `min_chunk_chars`; otherwise it keeps growing past the soft
//!    limit.
//! 4. After a flush the last `overlap_chars` characters of the emitted chunk
//!    (trimmed forward to a word boundary) seed the next buffer.
//! 5. Every chunk gets `chunk_index` and `chunk_count` in its metadata.
//!
//! All lengths and offsets are counted in `char`s.
//!
//! # Example
//!
//! ```rust
//! use ragnetic_core::chunk::{chunk_text, ChunkParams};
//! use ragnetic_core::models::Metadata;
//!
//! let params = ChunkParams::new(600, 80, 180).unwrap();
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", &params, &Metadata::new());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index(), Some(0));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::models::{Chunk, Metadata, MetadataValue};

/// Size targets for [`chunk_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    /// Soft upper bound on chunk length.
    pub max_chunk_chars: usize,
    /// Length of the tail carried into the next chunk; `0` disables overlap.
    pub overlap_chars: usize,
    /// Chunks are not flushed before reaching this length.
    pub min_chunk_chars: usize,
}

impl ChunkParams {
    pub const DEFAULT_MAX_CHUNK_CHARS: usize = 600;
    pub const DEFAULT_OVERLAP_CHARS: usize = 80;
    pub const DEFAULT_MIN_CHUNK_CHARS: usize = 180;

    /// Validate and build chunking parameters.
    ///
    /// # Errors
    ///
    /// [`RagError::InvalidChunkParameters`] when `max_chunk_chars` or
    /// `min_chunk_chars` is zero.
    pub fn new(max_chunk_chars: usize, overlap_chars: usize, min_chunk_chars: usize) -> Result<Self> {
        if max_chunk_chars == 0 {
            return Err(RagError::InvalidChunkParameters(
                "max_chunk_chars must be > 0".to_string(),
            ));
        }
        if min_chunk_chars == 0 {
            return Err(RagError::InvalidChunkParameters(
                "min_chunk_chars must be > 0".to_string(),
            ));
        }
        Ok(Self {
            max_chunk_chars,
            overlap_chars,
            min_chunk_chars,
        })
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chunk_chars: Self::DEFAULT_MAX_CHUNK_CHARS,
            overlap_chars: Self::DEFAULT_OVERLAP_CHARS,
            min_chunk_chars: Self::DEFAULT_MIN_CHUNK_CHARS,
        }
    }
}

/// A piece of a paragraph with its `[start, end)` char span in the source.
#[derive(Debug, Clone, PartialEq)]
struct Segment {
    text: String,
    start: usize,
    end: usize,
}

impl Segment {
    fn len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Split `text` into ordered, overlapping chunks.
///
/// Never fails: empty or whitespace-only input yields an empty vector.
/// Every returned chunk carries the entries of `metadata_base` plus
/// `chunk_index`, `chunk_count`, `paragraph_count`, and `char_length`.
/// Output is a pure function of the arguments.
pub fn chunk_text(text: &str, params: &ChunkParams, metadata_base: &Metadata) -> Vec<Chunk> {
    let segments = segment_text(text, params);
    if segments.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buf = PackBuffer::default();
    let last = segments.len() - 1;

    for (i, seg) in segments.into_iter().enumerate() {
        let seg_len = seg.len();
        let would_be = buf.len() + 2 + seg_len;
        let trailing_fragment = i == last && seg_len < params.min_chunk_chars;
        if would_be > params.max_chunk_chars
            && buf.len() >= params.min_chunk_chars
            && !trailing_fragment
        {
            buf.flush(&mut chunks, params, metadata_base);
        }
        buf.push(seg);
    }
    buf.flush(&mut chunks, params, metadata_base);

    let total = chunks.len();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.metadata.insert("chunk_index".to_string(), i.into());
        chunk.metadata.insert("chunk_count".to_string(), total.into());
    }
    chunks
}

#[derive(Debug, Default)]
struct PackBuffer {
    text: String,
    start: usize,
    end: usize,
    segments: usize,
}

impl PackBuffer {
    fn len(&self) -> usize {
        self.text.chars().count()
    }

    fn push(&mut self, seg: Segment) {
        if self.text.is_empty() {
            self.start = seg.start;
        } else {
            self.text.push_str("\n\n");
        }
        self.text.push_str(&seg.text);
        self.end = self.end.max(seg.end);
        self.segments += 1;
    }

    /// Emit the buffer as a chunk and reseed it with the overlap tail.
    fn flush(&mut self, chunks: &mut Vec<Chunk>, params: &ChunkParams, base: &Metadata) {
        let body = self.text.trim();
        if body.is_empty() {
            return;
        }
        let char_length = body.chars().count();
        let mut metadata = base.clone();
        metadata.insert(
            "paragraph_count".to_string(),
            MetadataValue::from(self.segments),
        );
        metadata.insert("char_length".to_string(), char_length.into());
        chunks.push(Chunk {
            text: body.to_string(),
            metadata,
            start_char: self.start,
            end_char: self.end,
        });

        // Without overlap the next pushed segment sets its own start.
        let overlap = tail_overlap(body, params.overlap_chars);
        self.start = self.end.saturating_sub(overlap.chars().count());
        self.text = overlap;
        self.segments = 0;
    }
}

/// Last `overlap_chars` characters of `text`, trimmed forward so that the
/// first word is not cut.
fn tail_overlap(text: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 || text.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if overlap_chars >= chars.len() {
        return text.trim().to_string();
    }
    let cut = chars.len() - overlap_chars;
    let tail = &chars[cut..];
    let starts_on_boundary = chars[cut - 1].is_whitespace() || tail[0].is_whitespace();
    let tail = if starts_on_boundary {
        tail
    } else {
        match tail.iter().position(|c| c.is_whitespace()) {
            Some(pos) if pos + 1 < tail.len() => &tail[pos + 1..],
            // The tail is one partial word; better no overlap than half a word.
            _ => &[],
        }
    };
    tail.iter().collect::<String>().trim().to_string()
}

/// Paragraph split plus oversize handling: the ordered segments to pack.
fn segment_text(text: &str, params: &ChunkParams) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut offsets = CharOffsets::new(text);
    for (byte_start, para) in split_paragraphs(text) {
        let leading = para.len() - para.trim_start().len();
        let trimmed = para.trim();
        let char_start = offsets.char_index(byte_start + leading);
        segments.extend(split_long_segment(trimmed, char_start, params));
    }
    segments
}

/// Split on blank lines (`\n`, optional whitespace, `\n`), returning the
/// byte offset and slice of every non-blank paragraph.
fn split_paragraphs(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if c != '\n' {
            continue;
        }
        let mut newlines = 1;
        let mut last_newline = i;
        while let Some(&(j, next)) = iter.peek() {
            if !next.is_whitespace() {
                break;
            }
            if next == '\n' {
                newlines += 1;
                last_newline = j;
            }
            iter.next();
        }
        if newlines >= 2 {
            out.push((start, &text[start..i]));
            start = last_newline + 1;
        }
    }
    out.push((start, &text[start..]));
    out.retain(|(_, p)| !p.trim().is_empty());
    out
}

/// Break an oversized paragraph into sentence groups, or word-wrap it when
/// it has no sentence boundaries. `text` must already be trimmed.
fn split_long_segment(text: &str, start: usize, params: &ChunkParams) -> Vec<Segment> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= params.max_chunk_chars {
        return vec![Segment {
            text: text.to_string(),
            start,
            end: start + chars.len(),
        }];
    }

    let sentences = sentence_spans(&chars);
    if sentences.len() <= 1 {
        return pack_spans(&chars, &word_spans(&chars), start, params.max_chunk_chars);
    }

    let mut out = pack_spans(&chars, &sentences, start, params.max_chunk_chars);
    if out.len() > 1 && out[out.len() - 1].len() < params.min_chunk_chars {
        if let Some(tail) = out.pop() {
            if let Some(prev) = out.last_mut() {
                prev.text = format!("{}\n{}", prev.text, tail.text);
                prev.end = tail.end;
            }
        }
    }
    out
}

/// Greedily join spans with single spaces, starting a new segment whenever
/// the next span would push the current one past `max_chars`. A single span
/// longer than `max_chars` becomes its own segment.
fn pack_spans(chars: &[char], spans: &[(usize, usize)], base: usize, max_chars: usize) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current: Option<(String, usize, usize, usize)> = None; // text, len, start, end

    for &(s, e) in spans {
        let piece: String = chars[s..e].iter().collect();
        let piece_len = e - s;
        current = match current.take() {
            None => Some((piece, piece_len, s, e)),
            Some((text, len, cs, ce)) => {
                if len + 1 + piece_len > max_chars {
                    out.push(Segment {
                        text,
                        start: base + cs,
                        end: base + ce,
                    });
                    Some((piece, piece_len, s, e))
                } else {
                    Some((format!("{} {}", text, piece), len + 1 + piece_len, cs, e))
                }
            }
        };
    }
    if let Some((text, _, cs, ce)) = current {
        out.push(Segment {
            text,
            start: base + cs,
            end: base + ce,
        });
    }
    out
}

/// Sentence spans: a boundary is `.`, `!` or `?` followed by whitespace.
fn sentence_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if i > 0 && chars[i].is_whitespace() && matches!(chars[i - 1], '.' | '!' | '?') {
            push_trimmed(&mut spans, chars, start, i);
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            start = i;
            continue;
        }
        i += 1;
    }
    push_trimmed(&mut spans, chars, start, chars.len());
    spans
}

/// Whitespace-delimited word spans.
fn word_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in chars.iter().enumerate() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, chars.len()));
    }
    spans
}

fn push_trimmed(spans: &mut Vec<(usize, usize)>, chars: &[char], mut s: usize, mut e: usize) {
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    if s < e {
        spans.push((s, e));
    }
}

/// Converts monotonically increasing byte offsets into char offsets.
struct CharOffsets<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharOffsets<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            chars: 0,
        }
    }

    fn char_index(&mut self, byte: usize) -> usize {
        if byte < self.byte {
            return self.text[..byte].chars().count();
        }
        self.chars += self.text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}
