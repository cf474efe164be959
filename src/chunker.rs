//! # Chunker
//!
//! Splits document text into overlapping word windows, the unit that gets
//! embedded and indexed.
//!
//! Windows hold `chunk_size` words and start every `chunk_size - overlap`
//! words, so consecutive chunks share `overlap` words of context. The last
//! window may be shorter. Splitting is on any Unicode whitespace and the
//! words of a window are re-joined with single spaces.
//!
//! ```
//! use ravecraft::chunker::chunk;
//!
//! let chunks = chunk("a b c d e", 2, 1).unwrap();
//! assert_eq!(chunks, vec!["a b", "b c", "c d", "d e", "e"]);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A source file read during ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
}

/// A window of a [`Document`]'s words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_path: String,
    pub text: String,
    /// Zero-based window index within the source document.
    pub ordinal: usize,
}

/// Window geometry, validated once and reused for every document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Build a chunker, rejecting geometries whose stride would be zero.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(ConfigError::InvalidChunking {
                chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Split `text` into window strings.
    pub fn split(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        (0..words.len())
            .step_by(self.stride())
            .map(|start| {
                let end = (start + self.chunk_size).min(words.len());
                words[start..end].join(" ")
            })
            .collect()
    }

    /// Split a document into [`Chunk`]s tagged with its path and ordinal.
    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        let source_path = document.path.to_string_lossy().into_owned();
        self.split(&document.text)
            .into_iter()
            .enumerate()
            .map(|(ordinal, text)| Chunk {
                source_path: source_path.clone(),
                text,
                ordinal,
            })
            .collect()
    }
}

/// Split `text` into windows of `chunk_size` words advancing by
/// `chunk_size - overlap`.
///
/// # Errors
/// [`ConfigError::InvalidChunking`] unless `overlap < chunk_size`.
pub fn chunk(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>, ConfigError> {
    Ok(Chunker::new(chunk_size, overlap)?.split(text))
}
