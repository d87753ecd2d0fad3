use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub eval: EvalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NormalizeConfig {
    #[serde(default = "default_true")]
    pub strip_bom: bool,
    #[serde(default = "default_true")]
    pub unify_line_endings: bool,
    #[serde(default = "default_true")]
    pub strip_trailing_whitespace: bool,
    #[serde(default = "default_max_blank_lines")]
    pub max_consecutive_blank_lines: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            strip_bom: true,
            unify_line_endings: true,
            strip_trailing_whitespace: true,
            max_consecutive_blank_lines: default_max_blank_lines(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_blank_lines() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_fallback_chunk_chars")]
    pub fallback_chunk_chars: usize,
    #[serde(default = "default_fallback_overlap_chars")]
    pub fallback_overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            fallback_chunk_chars: default_fallback_chunk_chars(),
            fallback_overlap_chars: default_fallback_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    2000
}
fn default_fallback_chunk_chars() -> usize {
    512
}
fn default_fallback_overlap_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_weight")]
    pub term_weight: f64,
    #[serde(default = "default_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_channel_timeout_secs")]
    pub channel_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            term_weight: default_weight(),
            vector_weight: default_weight(),
            candidate_k: default_candidate_k(),
            top_n: default_top_n(),
            channel_timeout_secs: default_channel_timeout_secs(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_weight() -> f64 {
    1.0
}
fn default_candidate_k() -> usize {
    30
}
fn default_top_n() -> usize {
    10
}
fn default_channel_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_judge_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_judge_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_doc_chars")]
    pub max_doc_chars: usize,
    #[serde(default = "default_top_tier_end")]
    pub top_tier_end: usize,
    #[serde(default = "default_mid_tier_end")]
    pub mid_tier_end: usize,
    #[serde(default = "default_top_tier_weight")]
    pub top_tier_weight: f64,
    #[serde(default = "default_mid_tier_weight")]
    pub mid_tier_weight: f64,
    #[serde(default = "default_tail_weight")]
    pub tail_weight: f64,
    /// Memoise judge scores in the `judge_cache` table.
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_judge_provider(),
            model: None,
            url: None,
            max_candidates: default_max_candidates(),
            timeout_secs: default_judge_timeout_secs(),
            max_doc_chars: default_max_doc_chars(),
            top_tier_end: default_top_tier_end(),
            mid_tier_end: default_mid_tier_end(),
            top_tier_weight: default_top_tier_weight(),
            mid_tier_weight: default_mid_tier_weight(),
            tail_weight: default_tail_weight(),
            cache: true,
            cache_ttl_hours: default_cache_ttl_hours(),
        }
    }
}

fn default_judge_provider() -> String {
    "disabled".to_string()
}
fn default_max_candidates() -> usize {
    20
}
fn default_judge_timeout_secs() -> u64 {
    10
}
fn default_max_doc_chars() -> usize {
    2000
}
fn default_top_tier_end() -> usize {
    3
}
fn default_mid_tier_end() -> usize {
    10
}
fn default_top_tier_weight() -> f64 {
    0.75
}
fn default_mid_tier_weight() -> f64 {
    0.60
}
fn default_tail_weight() -> f64 {
    0.40
}
fn default_cache_ttl_hours() -> u64 {
    168
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub scope: String,
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl SourceConfig {
    pub fn new(scope: &str, root: PathBuf) -> Self {
        Self {
            scope: scope.to_string(),
            root,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Copy a leading `---` frontmatter block into document metadata.
    #[serde(default = "default_true")]
    pub frontmatter: bool,
    /// Paths dropped by the path-filter stage after discovery.
    #[serde(default)]
    pub skip_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            frontmatter: true,
            skip_globs: Vec::new(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvalConfig {
    #[serde(default = "default_k_values")]
    pub k_values: Vec<usize>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// `"<config>/<difficulty>"` to `hit_at_<k>` minimums, layered over the
    /// built-in gate.
    #[serde(default)]
    pub thresholds: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            k_values: default_k_values(),
            output_dir: default_output_dir(),
            thresholds: BTreeMap::new(),
        }
    }
}

fn default_k_values() -> Vec<usize> {
    vec![1, 3, 5, 10]
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./eval-runs")
}

impl Config {
    /// Config rooted at `db_path` with every section at its default, used by
    /// tests and library callers that build the pipeline by hand.
    pub fn with_defaults(db_path: PathBuf, scope: &str, root: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            normalize: NormalizeConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            rerank: RerankConfig::default(),
            source: SourceConfig::new(scope, root),
            ingest: IngestConfig::default(),
            eval: EvalConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    let chunking = &config.chunking;
    if chunking.max_chars == 0 || chunking.fallback_chunk_chars == 0 {
        bail!("chunking.max_chars and chunking.fallback_chunk_chars must be > 0");
    }
    if chunking.fallback_overlap_chars >= chunking.fallback_chunk_chars {
        bail!("chunking.fallback_overlap_chars must be smaller than chunking.fallback_chunk_chars");
    }

    // Retrieval
    let retrieval = &config.retrieval;
    if retrieval.rrf_k <= 0.0 {
        bail!("retrieval.rrf_k must be > 0");
    }
    if retrieval.term_weight < 0.0 || retrieval.vector_weight < 0.0 {
        bail!("retrieval weights must be non-negative");
    }
    if retrieval.top_n == 0 || retrieval.candidate_k == 0 {
        bail!("retrieval.top_n and retrieval.candidate_k must be >= 1");
    }

    // Rerank
    let rerank = &config.rerank;
    for (key, w) in [
        ("top_tier_weight", rerank.top_tier_weight),
        ("mid_tier_weight", rerank.mid_tier_weight),
        ("tail_weight", rerank.tail_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            bail!("rerank.{} must be in [0.0, 1.0]", key);
        }
    }
    if rerank.top_tier_end > rerank.mid_tier_end {
        bail!("rerank.top_tier_end must not exceed rerank.mid_tier_end");
    }
    match rerank.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if rerank.enabled && rerank.provider != "disabled" && rerank.model.is_none() {
        bail!(
            "rerank.model must be specified when provider is '{}'",
            rerank.provider
        );
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    // Source
    if config.source.scope.trim().is_empty() {
        bail!("source.scope must not be empty");
    }
    if config.source.scope.contains(':') {
        bail!("source.scope must not contain ':'");
    }

    if config.ingest.concurrency == 0 {
        bail!("ingest.concurrency must be >= 1");
    }
    if config.eval.k_values.is_empty() || config.eval.k_values.contains(&0) {
        bail!("eval.k_values must be non-empty and positive");
    }
    crate::eval::metrics::configured_thresholds(&config.eval.thresholds)?;
    if rerank.cache_ttl_hours == 0 {
        bail!("rerank.cache_ttl_hours must be >= 1");
    }

    Ok(())
}
