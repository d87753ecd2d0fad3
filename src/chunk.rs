//! Structure-aware chunk splitting and chunk identity.
//!
//! Splitting is a pluggable [`SplitPolicy`]. The default,
//! [`StructuredSplitter`], works from coarse to fine:
//!
//! 1. Split the body into Markdown sections at ATX headings (`#` … `######`),
//!    ignoring headings inside fenced code blocks. Each section keeps its
//!    heading line.
//! 2. A section longer than `max_chars` is packed paragraph by paragraph
//!    (`\n\n` boundaries) into units no longer than `max_chars`.
//! 3. A single paragraph that is still too long goes to the
//!    [`SizeBoundedSplitter`] fallback: fixed-size windows with overlap,
//!    broken at the last newline or space where possible.
//!
//! Identity is assigned afterwards by [`assign_identities`]: the unit at
//! 0-based position `i` gets `sha256(text) + ":" + i`. Editing an early unit
//! therefore changes the identity of every later unit, even unchanged ones.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{source_key, Chunk};

/// A policy that turns a normalized body into ordered text units.
pub trait SplitPolicy: Send + Sync {
    fn split(&self, text: &str) -> Vec<String>;
}

/// Fixed-size windows with overlap, used for oversized units.
#[derive(Debug, Clone)]
pub struct SizeBoundedSplitter {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
}

impl SplitPolicy for SizeBoundedSplitter {
    fn split(&self, text: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let len = text.len();
        let mut start = 0usize;

        while start < len {
            let mut end = snap_to_char_boundary(text, (start + self.chunk_chars).min(len));
            if end < len {
                if let Some(pos) = text[start..end].rfind(|c: char| c == '\n' || c == ' ') {
                    if pos > 0 {
                        end = start + pos + 1;
                    }
                }
            }
            if end <= start {
                end = next_char_boundary(text, start);
            }

            let piece = text[start..end].trim();
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }
            if end >= len {
                break;
            }

            // Step back by the overlap, then forward to a word start.
            let back = snap_to_char_boundary(text, end.saturating_sub(self.overlap_chars));
            let mut next = if back > start { back } else { end };
            if next < end {
                if let Some(pos) = text[next..end].find(char::is_whitespace) {
                    let candidate = next + pos + 1;
                    if candidate < end {
                        next = snap_to_char_boundary(text, candidate);
                    }
                }
            }
            start = if next > start { next } else { end };
        }

        pieces
    }
}

/// Markdown sections, then paragraph packing, then size-bounded windows.
#[derive(Debug, Clone)]
pub struct StructuredSplitter {
    pub max_chars: usize,
    pub fallback: SizeBoundedSplitter,
}

impl StructuredSplitter {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_chars,
            fallback: SizeBoundedSplitter {
                chunk_chars: config.fallback_chunk_chars,
                overlap_chars: config.fallback_overlap_chars,
            },
        }
    }

    fn pack_paragraphs(&self, section: &str, out: &mut Vec<String>) {
        let mut buf = String::new();
        for para in section.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }

            let would_be = if buf.is_empty() {
                trimmed.len()
            } else {
                buf.len() + 2 + trimmed.len()
            };
            if would_be > self.max_chars && !buf.is_empty() {
                out.push(std::mem::take(&mut buf));
            }

            if trimmed.len() > self.max_chars {
                out.extend(self.fallback.split(trimmed));
            } else {
                if !buf.is_empty() {
                    buf.push_str("\n\n");
                }
                buf.push_str(trimmed);
            }
        }
        if !buf.is_empty() {
            out.push(buf);
        }
    }
}

impl SplitPolicy for StructuredSplitter {
    fn split(&self, text: &str) -> Vec<String> {
        let mut units = Vec::new();
        for section in markdown_sections(text) {
            if section.len() <= self.max_chars {
                units.push(section);
            } else {
                self.pack_paragraphs(&section, &mut units);
            }
        }
        units
    }
}

/// Split on ATX headings outside fenced code blocks.
fn markdown_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in text.split('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        if !in_fence && is_atx_heading(trimmed) && !current.is_empty() {
            push_section(&mut sections, &current);
            current.clear();
        }
        current.push(line);
    }
    push_section(&mut sections, &current);
    sections
}

fn push_section(sections: &mut Vec<String>, lines: &[&str]) {
    let joined = lines.join("\n");
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        sections.push(trimmed.to_string());
    }
}

fn is_atx_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && line[hashes..]
            .chars()
            .next()
            .map_or(true, |c| c == ' ' || c == '\t')
}

/// Give each unit its positional identity within one pass over a document.
pub fn assign_identities(scope: &str, path: &str, units: Vec<String>) -> Vec<Chunk> {
    let key = source_key(scope, path);
    units
        .into_iter()
        .enumerate()
        .map(|(seq, text)| Chunk {
            id: chunk_id(&text, seq as i64),
            source_key: key.clone(),
            seq: seq as i64,
            text,
        })
        .collect()
}

/// `sha256(text) + ":" + seq`.
pub fn chunk_id(text: &str, seq: i64) -> String {
    format!("{}:{}", hex::encode(Sha256::digest(text.as_bytes())), seq)
}

/// Split a normalized body and assign identities in one step.
pub fn chunk_document(
    policy: &dyn SplitPolicy,
    scope: &str,
    path: &str,
    body: &str,
) -> Vec<Chunk> {
    assign_identities(scope, path, policy.split(body))
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}
