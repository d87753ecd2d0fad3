//! Filesystem document source.
//!
//! Walks `[source].root`, keeps files matching `include_globs` and not
//! matching `exclude_globs` (plus the default `.git`, `target` and
//! `node_modules` excludes), and yields one [`SourceItem`] per file with a
//! `/`-separated relative path. Items come back sorted by path.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::{Provenance, SourceItem};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Relative path and absolute path of every matching file, sorted.
pub fn list_files(config: &SourceConfig) -> Result<Vec<(String, PathBuf)>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Source root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((rel_str, path.to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Read every matching file into a [`SourceItem`].
pub fn scan(config: &SourceConfig) -> Result<Vec<SourceItem>> {
    list_files(config)?
        .into_iter()
        .map(|(rel, path)| read_item(&path, &rel))
        .collect()
}

fn read_item(path: &Path, relative_path: &str) -> Result<SourceItem> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let last_modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

    let mut item = SourceItem::new(relative_path, String::from_utf8_lossy(&bytes).into_owned());
    item.provenance = Provenance {
        etag: Some(hex::encode(Sha256::digest(&bytes))),
        last_modified,
    };
    Ok(item)
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}
