//! Domain types
//!
//! Repository records, remote snapshots, graph edges, sync history, user
//! annotations, and the search/recommendation result DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// OWNER TYPE
// ============================================================================

/// Kind of account that owns a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    #[default]
    User,
    Organization,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::User => "user",
            OwnerType::Organization => "organization",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "organization" | "org" => OwnerType::Organization,
            _ => OwnerType::User,
        }
    }
}

impl std::fmt::Display for OwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// A starred repository as persisted locally
///
/// Identity is `name_with_owner` (`owner/name`), immutable once set.
/// Upstream-derived fields are mutated only by sync; analysis fields only
/// by the analyzer. Soft-deleted rows are retained for annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Row id (AUTOINCREMENT)
    pub id: i64,
    pub owner: String,
    pub name: String,
    /// `owner/name`, unique
    pub name_with_owner: String,
    pub description: Option<String>,
    /// Section-filtered README extract used for embedding
    pub readme_summary: Option<String>,
    pub primary_language: Option<String>,
    /// All languages reported upstream
    pub languages: Vec<String>,
    pub topics: Vec<String>,
    pub homepage: Option<String>,
    pub stargazer_count: i64,
    pub fork_count: i64,
    pub owner_type: OwnerType,
    pub archived: bool,
    pub visibility: String,
    pub license: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub starred_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_analyzed_at: Option<DateTime<Utc>>,

    // Analysis-derived fields
    pub summary: Option<String>,
    pub categories: Vec<String>,
    pub features: Vec<String>,
    pub use_cases: Vec<String>,

    /// Soft-delete flag; deleted rows are excluded from default reads
    pub is_deleted: bool,
    /// Set by sync when a heavy update or language change requires re-analysis
    pub needs_analysis: bool,
}

impl Repository {
    /// Compact text representation fed to the embedder
    pub fn embedding_text(&self) -> String {
        let description = self.description.as_deref().unwrap_or("");
        let summary = self.readme_summary.as_deref().unwrap_or("");
        format!("{} - {}\n\n{}", self.name, description, summary)
            .trim()
            .to_string()
    }
}

// ============================================================================
// REMOTE SNAPSHOT
// ============================================================================

/// A repository as reported by the code-hosting API, normalized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepo {
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub primary_language: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub homepage: Option<String>,
    #[serde(default)]
    pub stargazer_count: i64,
    #[serde(default)]
    pub fork_count: i64,
    #[serde(default)]
    pub owner_type: OwnerType,
    #[serde(default)]
    pub archived: bool,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    pub license: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub starred_at: Option<DateTime<Utc>>,
}

fn default_visibility() -> String {
    "public".to_string()
}

impl RemoteRepo {
    /// `owner/name` identity key
    pub fn name_with_owner(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

// ============================================================================
// SEARCH FILTERS
// ============================================================================

/// Filter set accepted by every search/list operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    /// Keep only repositories whose primary language is in this set
    pub languages: Vec<String>,
    pub min_stars: Option<i64>,
    pub starred_after: Option<DateTime<Utc>>,
    pub owner_type: Option<OwnerType>,
    /// Pushed within the last 7 days
    pub is_active: Option<bool>,
    /// Created within the last 6 months
    pub is_new: Option<bool>,
    pub exclude_archived: bool,
    /// None = live only (default); Some(true) = deleted only; Some(false) = live only
    pub is_deleted: Option<bool>,
}

// ============================================================================
// GRAPH EDGES
// ============================================================================

/// Relationship kind between two repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Same owner
    Author,
    /// Shared language or overlapping topics
    Ecosystem,
    /// Co-members of a user collection
    Collection,
    /// Embedding cosine similarity
    Semantic,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Author => "author",
            EdgeKind::Ecosystem => "ecosystem",
            EdgeKind::Collection => "collection",
            EdgeKind::Semantic => "semantic",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "author" => Some(EdgeKind::Author),
            "ecosystem" => Some(EdgeKind::Ecosystem),
            "collection" => Some(EdgeKind::Collection),
            "semantic" => Some(EdgeKind::Semantic),
            _ => None,
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored relationship between two repositories
///
/// Undirected in meaning; weight is clipped to [0, 1]. Primary key is
/// `(source, target, kind)`, endpoints are `name_with_owner` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub weight: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl GraphEdge {
    pub fn new(source: &str, target: &str, kind: EdgeKind, weight: f32) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            weight: weight.clamp(0.0, 1.0),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The endpoint that is not `id`, if this edge touches `id`
    pub fn other_endpoint(&self, id: &str) -> Option<&str> {
        if self.source == id {
            Some(&self.target)
        } else if self.target == id {
            Some(&self.source)
        } else {
            None
        }
    }
}

// ============================================================================
// SYNC
// ============================================================================

/// Sync mode requested by the scheduler or the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Default: bounded by the oldest `last_synced_at`
    Incremental,
    /// Ignore `since`; fetch everything
    Full,
    /// As full, plus mark every observed repository for re-analysis
    FullReanalyze,
}

impl SyncMode {
    pub fn is_full(&self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::FullReanalyze)
    }

    /// History rows record only full vs incremental
    pub fn history_kind(&self) -> &'static str {
        if self.is_full() { "full" } else { "incremental" }
    }
}

/// Change bucket produced by the sync classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeBucket {
    /// New commits (or missing local languages): re-fetch, re-embed, re-analyze
    Heavy,
    /// Description or primary language changed: overwrite + re-embed
    Text,
    /// Star/fork/flag columns changed: overwrite those columns only
    Counters,
    /// Nothing observable changed; bump `last_synced_at` only
    Unchanged,
}

/// Per-run counters recorded in sync history
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncCounters {
    pub added: i64,
    pub updated: i64,
    pub deleted: i64,
    pub failed: i64,
}

/// A sync history row
///
/// `completed_at` is null while the run is in flight; rows are append-only
/// and never updated after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub id: i64,
    /// "full" or "incremental"
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub added: i64,
    pub updated: i64,
    pub deleted: i64,
    pub failed: i64,
    pub error_message: Option<String>,
}

// ============================================================================
// USER ANNOTATIONS
// ============================================================================

/// An ordered, named collection of repositories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

/// A user tag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// Free-text note with a 1-5 rating, attached to one repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoNote {
    pub id: i64,
    pub repo_id: i64,
    pub body: String,
    pub rating: i32,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// SEARCH & RECOMMENDATION RESULTS
// ============================================================================

/// Which retrieval leg produced a hybrid hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Fts,
    Semantic,
    Hybrid,
}

/// A single hybrid-search result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridHit {
    pub repository: Repository,
    /// Sigmoid-normalized BM25 score, [0, 1]; 0 when the lexical leg missed
    pub fts_score: f32,
    /// Cosine similarity, [0, 1]; 0 when the semantic leg missed
    pub semantic_score: f32,
    /// Weighted sum of the two normalized scores
    pub final_score: f32,
    pub match_type: MatchType,
}

/// Recall source that contributed a recommendation candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallSource {
    Graph,
    Semantic,
}

/// A single recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub repository: Repository,
    /// Fused score, [0, 1]
    pub score: f32,
    /// Normalized graph-recall score, [0, 1]
    pub graph_score: f32,
    /// Cosine similarity from semantic recall, [0, 1]
    pub semantic_score: f32,
    /// Which recall stages saw this candidate
    pub sources: Vec<RecallSource>,
}
