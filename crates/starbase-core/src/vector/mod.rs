//! Persistent Vector Index
//!
//! HNSW index (USearch, cosine metric) keyed by `owner/name`, with a JSON
//! sidecar persisting key mappings and per-key documents (metadata + source
//! text). `similarity = 1 - distance`, descending order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embedding::EMBEDDING_DIMENSIONS;

// ============================================================================
// CONSTANTS
// ============================================================================

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search (higher = better recall, slower)
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Index file name under the configured directory
const INDEX_FILE: &str = "repos.usearch";

/// Sidecar file holding key mappings and documents
const DOCS_FILE: &str = "repos.docs.json";

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("Index creation failed: {0}")]
    Creation(String),
    #[error("Failed to add vector: {0}")]
    Add(String),
    #[error("Search failed: {0}")]
    Search(String),
    #[error("Persistence failed: {0}")]
    Persistence(String),
    #[error("Invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
}

impl From<VectorIndexError> for crate::error::Error {
    fn from(e: VectorIndexError) -> Self {
        crate::error::Error::VectorIndex(e.to_string())
    }
}

// ============================================================================
// DOCUMENTS
// ============================================================================

/// Metadata bag stored next to each vector
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub language: Option<String>,
    pub stars: i64,
    pub owner: String,
    /// Comma-joined topic list
    pub topics: String,
}

/// The document stored per key: metadata, source text, and the vector
/// itself (kept here so per-key lookup never needs the HNSW graph)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorDocument {
    pub metadata: VectorMetadata,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Optional metadata predicate applied to query results
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub language: Option<String>,
    pub owner: Option<String>,
}

impl MetadataFilter {
    fn matches(&self, metadata: &VectorMetadata) -> bool {
        if let Some(lang) = &self.language {
            if metadata.language.as_deref() != Some(lang.as_str()) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if &metadata.owner != owner {
                return false;
            }
        }
        true
    }
}

/// A single query result
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub key: String,
    /// Cosine similarity, [0, 1], descending
    pub similarity: f32,
    pub metadata: VectorMetadata,
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    key_to_id: HashMap<String, u64>,
    next_id: u64,
    docs: HashMap<String, VectorDocument>,
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// Persistent cosine-similarity index keyed by repository identifier
pub struct VectorIndex {
    index: Index,
    dimensions: usize,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    docs: HashMap<String, VectorDocument>,
    next_id: u64,
    root: Option<PathBuf>,
}

impl VectorIndex {
    fn hnsw_options(dimensions: usize) -> IndexOptions {
        IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            multi: false,
        }
    }

    /// In-memory index (tests, ephemeral runs)
    pub fn in_memory() -> Result<Self, VectorIndexError> {
        let index = Index::new(&Self::hnsw_options(EMBEDDING_DIMENSIONS))
            .map_err(|e| VectorIndexError::Creation(e.to_string()))?;
        Ok(Self {
            index,
            dimensions: EMBEDDING_DIMENSIONS,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            docs: HashMap::new(),
            next_id: 0,
            root: None,
        })
    }

    /// Open a persistent index rooted at `dir`, loading any prior state
    pub fn open(dir: &Path) -> Result<Self, VectorIndexError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        let mut idx = Self::in_memory()?;
        idx.root = Some(dir.to_path_buf());

        let index_path = dir.join(INDEX_FILE);
        let docs_path = dir.join(DOCS_FILE);
        if index_path.exists() && docs_path.exists() {
            idx.load_from(&index_path, &docs_path)?;
            tracing::info!("Vector index loaded: {} entries", idx.count());
        }

        Ok(idx)
    }

    fn load_from(&mut self, index_path: &Path, docs_path: &Path) -> Result<(), VectorIndexError> {
        let index_str = index_path
            .to_str()
            .ok_or_else(|| VectorIndexError::Persistence("invalid path".to_string()))?;
        self.index
            .load(index_str)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        let raw = std::fs::read_to_string(docs_path)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        let sidecar: Sidecar = serde_json::from_str(&raw)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        self.id_to_key = sidecar.key_to_id.iter().map(|(k, &v)| (v, k.clone())).collect();
        self.key_to_id = sidecar.key_to_id;
        self.docs = sidecar.docs;
        self.next_id = sidecar.next_id;
        Ok(())
    }

    /// Persist index and sidecar to the configured directory; no-op for
    /// in-memory indexes
    pub fn save(&self) -> Result<(), VectorIndexError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let index_str = root
            .join(INDEX_FILE)
            .to_str()
            .ok_or_else(|| VectorIndexError::Persistence("invalid path".to_string()))?
            .to_string();
        self.index
            .save(&index_str)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        let sidecar = Sidecar {
            key_to_id: self.key_to_id.clone(),
            next_id: self.next_id,
            docs: self.docs.clone(),
        };
        let encoded = serde_json::to_string(&sidecar)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        std::fs::write(root.join(DOCS_FILE), encoded)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Number of indexed keys
    pub fn count(&self) -> usize {
        self.key_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// The stored vector for a key (semantic-recall seed)
    pub fn get_vector(&self, key: &str) -> Option<&[f32]> {
        self.docs.get(key).map(|d| d.vector.as_slice())
    }

    /// The stored document for a key
    pub fn get_document(&self, key: &str) -> Option<&VectorDocument> {
        self.docs.get(key)
    }

    /// Insert or replace the entry for `key`
    ///
    /// Replacement removes then re-adds under the same numeric id, so a
    /// concurrent query sees old or new, never a blend.
    pub fn upsert(
        &mut self,
        key: &str,
        vector: Vec<f32>,
        doc: VectorDocument,
    ) -> Result<(), VectorIndexError> {
        if vector.len() != self.dimensions {
            return Err(VectorIndexError::InvalidDimensions {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        if let Some(&existing_id) = self.key_to_id.get(key) {
            self.index
                .remove(existing_id)
                .map_err(|e| VectorIndexError::Add(e.to_string()))?;
            self.reserve_for(self.index.size() + 1)?;
            self.index
                .add(existing_id, &vector)
                .map_err(|e| VectorIndexError::Add(e.to_string()))?;
            self.docs.insert(key.to_string(), doc);
            return Ok(());
        }

        self.reserve_for(self.index.size() + 1)?;

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, &vector)
            .map_err(|e| VectorIndexError::Add(e.to_string()))?;

        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        self.docs.insert(key.to_string(), doc);
        Ok(())
    }

    /// Upsert a batch; returns how many succeeded
    pub fn upsert_batch(
        &mut self,
        entries: Vec<(String, Vec<f32>, VectorDocument)>,
    ) -> Result<usize, VectorIndexError> {
        let mut stored = 0;
        for (key, vector, doc) in entries {
            match self.upsert(&key, vector, doc) {
                Ok(()) => stored += 1,
                Err(e) => tracing::warn!("Vector upsert failed for {}: {}", key, e),
            }
        }
        Ok(stored)
    }

    /// Remove the entry for `key`; false when absent
    pub fn delete(&mut self, key: &str) -> Result<bool, VectorIndexError> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.docs.remove(key);
            self.index
                .remove(id)
                .map_err(|e| VectorIndexError::Add(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Nearest neighbors of `query`, descending similarity
    pub fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>, VectorIndexError> {
        if query.len() != self.dimensions {
            return Err(VectorIndexError::InvalidDimensions {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        // Over-fetch when filtering so post-filter results can still fill k
        let fetch = if filter.is_some() { k.saturating_mul(3) } else { k };
        let results = self
            .index
            .search(query, fetch.max(1))
            .map_err(|e| VectorIndexError::Search(e.to_string()))?;

        let mut hits = Vec::with_capacity(k);
        for (id, distance) in results.keys.iter().zip(results.distances.iter()) {
            let Some(key) = self.id_to_key.get(id) else {
                continue;
            };
            let Some(doc) = self.docs.get(key) else {
                continue;
            };
            if let Some(f) = filter {
                if !f.matches(&doc.metadata) {
                    continue;
                }
            }
            hits.push(QueryHit {
                key: key.clone(),
                similarity: (1.0 - distance).clamp(0.0, 1.0),
                metadata: doc.metadata.clone(),
            });
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    /// Drop everything, in memory and (on next save) on disk
    pub fn clear(&mut self) -> Result<(), VectorIndexError> {
        self.index = Index::new(&Self::hnsw_options(self.dimensions))
            .map_err(|e| VectorIndexError::Creation(e.to_string()))?;
        self.key_to_id.clear();
        self.id_to_key.clear();
        self.docs.clear();
        self.next_id = 0;
        Ok(())
    }

    // usearch requires reserve() before add() once capacity is reached
    fn reserve_for(&self, wanted: usize) -> Result<(), VectorIndexError> {
        let capacity = self.index.capacity();
        if wanted > capacity {
            let new_capacity = std::cmp::max(capacity * 2, 64).max(wanted);
            self.index
                .reserve(new_capacity)
                .map_err(|e| VectorIndexError::Creation(e.to_string()))?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
