//! Sentence-aware text chunker.
//!
//! Splits document text into overlapping, size-bounded chunks. Splitting is
//! hierarchical: paragraphs accumulate until the size budget is hit; an
//! oversized paragraph is sub-split at sentence boundaries; a sentence that
//! still exceeds the budget falls back to character windows with overlap.
//!
//! Every emitted chunk is trimmed, non-empty, and carries a stable identifier
//! of the form `<sanitized source>_<index>`.

use crate::error::{KilnError, Result};

/// A single chunk of text from a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Stable identifier, e.g. `docs_intro_md_0`.
    pub id: String,
    /// Trimmed chunk text.
    pub content: String,
    /// Originating document name.
    pub source: String,
    /// Position of this chunk within the source.
    pub index: usize,
}

/// Chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// Maximum number of characters per chunk.
    pub chunk_size: usize,
    /// Characters of overlap between character-window chunks.
    pub overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

impl ChunkOptions {
    /// Compute chunk options from a model's token limit using the ~4 chars
    /// per token estimate with a 10% safety margin. Values of zero fall back
    /// to the defaults; the chunk size never drops below 200.
    pub fn from_max_tokens(max_tokens: usize) -> Self {
        if max_tokens == 0 {
            return Self::default();
        }
        let chunk_size = ((max_tokens as f64) * 4.0 * 0.9) as usize;
        let chunk_size = chunk_size.max(200);
        Self {
            chunk_size,
            overlap: chunk_size / 5,
        }
    }
}

/// Splits documents into overlapping text chunks.
#[derive(Debug)]
pub struct Chunker {
    opts: ChunkOptions,
}

impl Chunker {
    /// Create a chunker. A zero `chunk_size` is rejected; an overlap that is
    /// not strictly smaller than the chunk size is coerced to a quarter of it.
    pub fn new(mut opts: ChunkOptions) -> Result<Self> {
        if opts.chunk_size == 0 {
            return Err(KilnError::InvalidConfig(
                "chunk size must be greater than 0".into(),
            ));
        }
        if opts.overlap >= opts.chunk_size {
            opts.overlap = opts.chunk_size / 4;
        }
        Ok(Self { opts })
    }

    /// Split text into fixed-size character windows with overlap.
    ///
    /// The last resort when no sentence boundary is available. Window
    /// positions advance by `chunk_size - overlap`.
    pub fn chunk_text(&self, text: &str, source: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let text = text.replace("\r\n", "\n");
        let runes: Vec<char> = text.chars().collect();
        let total = runes.len();
        let mut step = self.opts.chunk_size.saturating_sub(self.opts.overlap);
        if step == 0 {
            step = self.opts.chunk_size;
        }

        let mut chunks = Vec::new();
        let mut idx = 0usize;
        let mut start = 0usize;
        while start < total {
            let end = (start + self.opts.chunk_size).min(total);
            let content: String = runes[start..end].iter().collect();
            let content = content.trim();
            if content.is_empty() {
                idx += 1;
                start += step;
                continue;
            }

            chunks.push(Chunk {
                id: chunk_id(source, idx),
                content: content.to_string(),
                source: source.to_string(),
                index: idx,
            });
            idx += 1;

            if end == total {
                break;
            }
            start += step;
        }

        chunks
    }

    /// Split text into sentence-aware chunks.
    ///
    /// The main entry point. Paragraphs (blank-line separated) accumulate
    /// until adding the next one would exceed the chunk size; oversized
    /// paragraphs are sub-split at sentence boundaries; truly huge sentences
    /// fall back to [`Chunker::chunk_text`].
    pub fn split_by_sentence(&self, text: &str, source: &str) -> Result<Vec<Chunk>> {
        let text = text.replace("\r\n", "\n");

        let mut acc = Accumulator {
            buf: String::new(),
            chunks: Vec::new(),
            idx: 0,
            chunk_size: self.opts.chunk_size,
            source,
        };

        for para in text.split("\n\n") {
            let para = para.trim();
            if para.is_empty() {
                continue;
            }

            if para.len() <= self.opts.chunk_size {
                acc.add_fragment(para);
                continue;
            }

            // Oversized paragraph — flush, then sub-split at sentence boundaries
            acc.flush();
            for sent in split_sentences(para) {
                let sent = sent.trim();
                if sent.is_empty() {
                    continue;
                }

                if sent.len() <= self.opts.chunk_size {
                    acc.add_fragment(sent);
                    continue;
                }

                // Single sentence exceeds the budget — character windows
                acc.flush();
                for sub in self.chunk_text(sent, source) {
                    let idx = acc.idx;
                    acc.chunks.push(Chunk {
                        id: chunk_id(source, idx),
                        content: sub.content,
                        source: source.to_string(),
                        index: idx,
                    });
                    acc.idx += 1;
                }
            }
        }
        acc.flush();

        Ok(acc.chunks)
    }
}

/// Paragraph accumulator used by [`Chunker::split_by_sentence`].
struct Accumulator<'a> {
    buf: String,
    chunks: Vec<Chunk>,
    idx: usize,
    chunk_size: usize,
    source: &'a str,
}

impl Accumulator<'_> {
    fn flush(&mut self) {
        let content = self.buf.trim();
        if !content.is_empty() {
            self.chunks.push(Chunk {
                id: chunk_id(self.source, self.idx),
                content: content.to_string(),
                source: self.source.to_string(),
                index: self.idx,
            });
            self.idx += 1;
        }
        self.buf.clear();
    }

    /// Add a fragment known to fit within the chunk size, flushing first
    /// when accumulation would overflow.
    fn add_fragment(&mut self, frag: &str) {
        let frag = frag.trim();
        if frag.is_empty() {
            return;
        }
        if !self.buf.is_empty() && self.buf.len() + frag.len() + 2 > self.chunk_size {
            self.flush();
        }
        if !self.buf.is_empty() {
            self.buf.push_str("\n\n");
        }
        self.buf.push_str(frag);
    }
}

/// Split text at sentence boundaries (`.`, `!`, `?` followed by whitespace or
/// end of text), keeping the delimiter attached to the preceding sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    let runes: Vec<char> = text.chars().collect();
    for i in 0..runes.len() {
        current.push(runes[i]);

        if matches!(runes[i], '.' | '!' | '?') {
            let at_boundary = match runes.get(i + 1) {
                None => true,
                Some(&c) => c == ' ' || c == '\n' || c == '\t',
            };
            if at_boundary {
                sentences.push(std::mem::take(&mut current));
            }
        }
    }

    if !current.is_empty() {
        sentences.push(current);
    }

    sentences
}

/// Build a stable chunk identifier from the source name and index.
fn chunk_id(source: &str, idx: usize) -> String {
    if source.is_empty() {
        return format!("chunk_{idx}");
    }
    let sanitized: String = source
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' | ' ' => '_',
            other => other,
        })
        .collect();
    format!("{sanitized}_{idx}")
}
