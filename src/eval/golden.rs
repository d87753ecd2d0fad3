//! Golden query files.
//!
//! Either a JSON array of query objects or `{ "version": "...", "queries":
//! [...] }`:
//!
//! ```json
//! {
//!   "query": "oauth2 authentication",
//!   "expected_docs": ["target.md"],
//!   "difficulty": "easy",
//!   "retriever_types": ["bm25", "vector", "hybrid"],
//!   "notes": "optional"
//! }
//! ```
//!
//! `retriever_types` defaults to every configuration. A malformed entry
//! fails the whole load with a [`Validation`](HarnessError::Validation)
//! error naming its index.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Fusion,
}

impl Difficulty {
    pub const ALL: [Difficulty; 4] = [Self::Easy, Self::Medium, Self::Hard, Self::Fusion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
            Self::Fusion => "fusion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == s)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retrieval configuration under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverType {
    Bm25,
    Vector,
    Hybrid,
    HybridRerank,
}

impl RetrieverType {
    pub const ALL: [RetrieverType; 4] = [Self::Bm25, Self::Vector, Self::Hybrid, Self::HybridRerank];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bm25 => "bm25",
            Self::Vector => "vector",
            Self::Hybrid => "hybrid",
            Self::HybridRerank => "hybrid_rerank",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for RetrieverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenQuery {
    pub query: String,
    pub expected_docs: Vec<String>,
    pub difficulty: Difficulty,
    #[serde(default = "all_retrievers")]
    pub retriever_types: Vec<RetrieverType>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn all_retrievers() -> Vec<RetrieverType> {
    RetrieverType::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoldenSet {
    /// `"unversioned"` when the file carries no version.
    pub version: String,
    pub queries: Vec<GoldenQuery>,
}

pub fn load_golden_queries(path: &Path) -> Result<GoldenSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read golden queries: {}", path.display()))?;
    parse_golden_queries(&text)
        .with_context(|| format!("Invalid golden queries file: {}", path.display()))
}

pub fn parse_golden_queries(text: &str) -> Result<GoldenSet> {
    let payload: serde_json::Value = serde_json::from_str(text)?;
    let (version, items) = match payload {
        serde_json::Value::Array(items) => (None, items),
        serde_json::Value::Object(mut obj) => {
            let version = obj
                .get("version")
                .and_then(|v| v.as_str())
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string);
            match obj.remove("queries") {
                Some(serde_json::Value::Array(items)) => (version, items),
                _ => anyhow::bail!("expected a 'queries' array"),
            }
        }
        _ => anyhow::bail!("expected a JSON array or an object with a 'queries' array"),
    };

    let queries = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let entry = format!("queries[{}]", i);
            let q: GoldenQuery = serde_json::from_value(item)
                .map_err(|e| HarnessError::validation(&entry, e.to_string()))?;
            if q.query.trim().is_empty() {
                return Err(HarnessError::validation(&entry, "empty query"));
            }
            if q.expected_docs.is_empty() {
                return Err(HarnessError::validation(&entry, "expected_docs is empty"));
            }
            if q.retriever_types.is_empty() {
                return Err(HarnessError::validation(&entry, "retriever_types is empty"));
            }
            Ok(q)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(GoldenSet {
        version: version.unwrap_or_else(|| "unversioned".to_string()),
        queries,
    })
}
