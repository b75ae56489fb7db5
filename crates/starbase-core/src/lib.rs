//! # Starbase Core
//!
//! Engine for turning a user's starred repositories into a continually
//! refreshed, searchable knowledge base:
//!
//! - **Sync**: reconciles the remote starred set against the local store
//!   with per-field change classification, soft deletion, and history
//! - **Store**: SQLite with an FTS5 index kept in lockstep via triggers
//! - **Hybrid Search**: parallel BM25 + cosine-similarity retrieval merged
//!   by a normalized weighted sum, degrading to lexical-only
//! - **Graph**: author/ecosystem/collection/semantic edges feeding a
//!   three-stage recommender with diversity optimization
//! - **Vectors**: HNSW index (USearch) fed by an external embedding service
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use starbase_core::{Config, Store, SyncEngine, SyncMode};
//!
//! let config = Config::from_env()?;
//! let store = Store::open(config.store_path.clone())?;
//! // wire remote client, embedder, vector index, then:
//! let report = engine.sync(SyncMode::Incremental).await?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod model;
pub mod recommend;
pub mod remote;
pub mod search;
pub mod storage;
pub mod sync;
pub mod vector;
pub mod vectorize;

#[cfg(test)]
pub(crate) mod testutil;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{Config, WallClock};
pub use error::{Error, Result};

pub use model::{
    ChangeBucket, Collection, EdgeKind, GraphEdge, HybridHit, MatchType, OwnerType,
    RecallSource, Recommendation, RemoteRepo, RepoNote, Repository, SearchFilters,
    SyncCounters, SyncHistoryEntry, SyncMode, Tag,
};

pub use storage::{Store, sanitize_fts_query};

pub use remote::{GithubClient, GithubClientConfig, RemoteSource};

pub use embedding::{EMBEDDING_DIMENSIONS, Embedder, HttpEmbedder, cosine_similarity};

pub use vector::{
    MetadataFilter, QueryHit, VectorDocument, VectorIndex, VectorIndexError, VectorMetadata,
};

pub use vectorize::{Vectorizer, summarize_readme};

pub use graph::GraphService;

pub use sync::{SyncEngine, SyncReport, classify_change};

pub use search::{HybridSearch, SearchWeights, sigmoid};

pub use recommend::Recommender;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
