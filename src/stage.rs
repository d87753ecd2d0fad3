//! Pre-persistence stages.
//!
//! A [`Stage`] rewrites a whole batch of source items before the
//! persistence mediator sees them. [`StagePipeline`] holds an ordered list
//! of stages and runs them front to back.

use anyhow::Result;
use globset::GlobSet;
use tracing::debug;

use crate::config::IngestConfig;
use crate::models::SourceItem;
use crate::source::build_globset;

pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, batch: Vec<SourceItem>) -> Vec<SourceItem>;
}

#[derive(Default)]
pub struct StagePipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl StagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Stages selected by `[ingest]`: path filter (when `skip_globs` is
    /// set), then frontmatter extraction.
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let mut pipeline = Self::new();
        if !config.skip_globs.is_empty() {
            pipeline = pipeline.with(PathFilterStage::new(&config.skip_globs)?);
        }
        if config.frontmatter {
            pipeline = pipeline.with(FrontmatterStage);
        }
        Ok(pipeline)
    }

    pub fn run(&self, mut batch: Vec<SourceItem>) -> Vec<SourceItem> {
        for stage in &self.stages {
            let before = batch.len();
            batch = stage.apply(batch);
            debug!(stage = stage.name(), before, after = batch.len(), "stage applied");
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Drops items whose path matches any of the patterns.
pub struct PathFilterStage {
    excludes: GlobSet,
}

impl PathFilterStage {
    pub fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            excludes: build_globset(patterns)?,
        })
    }
}

impl Stage for PathFilterStage {
    fn name(&self) -> &str {
        "path-filter"
    }

    fn apply(&self, batch: Vec<SourceItem>) -> Vec<SourceItem> {
        batch
            .into_iter()
            .filter(|item| !self.excludes.is_match(&item.path))
            .collect()
    }
}

/// Copies `key: value` lines of a leading `---` block into metadata. The
/// body is left untouched.
pub struct FrontmatterStage;

impl Stage for FrontmatterStage {
    fn name(&self) -> &str {
        "frontmatter"
    }

    fn apply(&self, batch: Vec<SourceItem>) -> Vec<SourceItem> {
        batch
            .into_iter()
            .map(|mut item| {
                for (key, value) in parse_frontmatter(&item.content) {
                    item.metadata
                        .entry(key)
                        .or_insert(serde_json::Value::String(value));
                }
                item
            })
            .collect()
    }
}

/// Key/value pairs of a leading frontmatter block; empty if the block is
/// missing or never closed.
pub fn parse_frontmatter(content: &str) -> Vec<(String, String)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return Vec::new();
    }

    let mut pairs = Vec::new();
    for line in lines {
        let line = line.trim_end();
        if line == "---" || line == "..." {
            return pairs;
        }
        // Nested values are not flattened.
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() && !key.starts_with('#') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                pairs.push((key.to_string(), value.to_string()));
            }
        }
    }
    Vec::new()
}
