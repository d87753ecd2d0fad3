//! # Corpus Harness
//!
//! Ingests text documents into a local corpus and answers retrieval queries
//! through independent term and vector channels, combined by weighted
//! Reciprocal Rank Fusion and optionally reranked by an external relevance
//! judge. An evaluation harness measures hit@k and MRR against labeled
//! query sets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │  Source  │──▶│  Stages  │──▶│  Persist  │──▶│ Term channel │
//! │   (fs)   │   │          │   │ (mediator)│   │ Vector chan. │
//! └──────────┘   └──────────┘   └───────────┘   └──────┬───────┘
//!                                                      │
//!                      query ──▶ fan-out ──▶ fusion ──▶ rerank ──▶ results
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Domain error taxonomy |
//! | [`normalize`] | Content canonicalization and hashing |
//! | [`chunk`] | Split policies and chunk identity |
//! | [`store`] | Document record store (SQLite, in-memory) |
//! | [`persist`] | Idempotent upsert mediator |
//! | [`ingest`] | Batch orchestration and cleanup |
//! | [`stage`] | Pre-persistence stages |
//! | [`source`] | Filesystem document source |
//! | [`channel`] | Term and vector index channels |
//! | [`embedding`] | Embedding backends and identity binding |
//! | [`fusion`] | Weighted Reciprocal Rank Fusion |
//! | [`rerank`] | Judge reranking with position-aware blending |
//! | [`search`] | Query fan-out and mode selection |
//! | [`eval`] | Golden-query evaluation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod channel;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod fusion;
pub mod get;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod persist;
pub mod progress;
pub mod rerank;
pub mod search;
pub mod source;
pub mod stage;
pub mod stats;
pub mod store;
