//! Content canonicalization applied before hashing.
//!
//! Downstream dedup depends on [`normalize`] being a pure function: the same
//! input and options always produce the same output. Steps run in a fixed
//! order:
//!
//! 1. strip a leading byte-order mark
//! 2. unify `\r\n` and `\r` to `\n`
//! 3. trim trailing whitespace on every line
//! 4. collapse blank-line runs longer than the configured maximum
//! 5. trim the whole text

use sha2::{Digest, Sha256};

use crate::config::NormalizeConfig;

const BOM: char = '\u{feff}';

pub fn normalize(text: &str, options: &NormalizeConfig) -> String {
    let mut out: &str = text;
    if options.strip_bom {
        out = out.strip_prefix(BOM).unwrap_or(out);
    }

    let mut owned = if options.unify_line_endings {
        out.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        out.to_string()
    };

    if options.strip_trailing_whitespace {
        owned = owned
            .split('\n')
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
    }

    owned = collapse_blank_lines(&owned, options.max_consecutive_blank_lines);
    owned.trim().to_string()
}

/// Keep at most `max_blank` empty lines between two non-empty lines.
///
/// A run of `max_blank` blank lines is `max_blank + 1` consecutive newlines.
fn collapse_blank_lines(text: &str, max_blank: usize) -> String {
    let max_newlines = max_blank + 1;
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            run += 1;
            if run <= max_newlines {
                out.push(ch);
            }
        } else {
            run = 0;
            out.push(ch);
        }
    }
    out
}

/// SHA-256 hex digest of already-normalized content.
pub fn content_hash(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Lowercased alphanumeric runs, the token model shared by the in-memory
/// term index and the hashing embedder.
pub fn word_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeConfig {
        NormalizeConfig::default()
    }

    #[test]
    fn test_strips_bom() {
        assert_eq!(normalize("\u{feff}hello", &opts()), "hello");
    }

    #[test]
    fn test_unifies_line_endings() {
        assert_eq!(normalize("a\r\nb\rc", &opts()), "a\nb\nc");
    }

    #[test]
    fn test_trailing_whitespace_per_line() {
        assert_eq!(normalize("a  \nb\t\nc", &opts()), "a\nb\nc");
    }

    #[test]
    fn test_collapses_blank_runs() {
        let input = "a\n\n\n\n\n\nb";
        assert_eq!(normalize(input, &opts()), "a\n\n\nb");
        let mut tight = opts();
        tight.max_consecutive_blank_lines = 0;
        assert_eq!(normalize(input, &tight), "a\nb");
    }

    #[test]
    fn test_whitespace_only_lines_count_as_blank() {
        assert_eq!(normalize("a\n  \n \n\t\n \nb", &opts()), "a\n\n\nb");
    }

    #[test]
    fn test_options_can_be_disabled() {
        let off = NormalizeConfig {
            strip_bom: false,
            unify_line_endings: false,
            strip_trailing_whitespace: false,
            max_consecutive_blank_lines: 10,
        };
        assert_eq!(normalize("\u{feff}a \r\nb", &off), "\u{feff}a \r\nb");
    }

    #[test]
    fn test_word_tokens() {
        assert_eq!(word_tokens("PROJ-1234: OAuth2 flow!"), vec!["proj", "1234", "oauth2", "flow"]);
    }

    #[test]
    fn test_deterministic_hash() {
        let a = normalize("Title\r\n\r\nBody  \r\n", &opts());
        let b = normalize("Title\n\nBody\n", &opts());
        assert_eq!(a, b);
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn test_content_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
