//! Recommender
//!
//! Three-stage fusion: multi-source recall (graph edges + embedding
//! similarity), weighted score fusion, then diversity optimization with a
//! per-owner cap. Falls back to graph-only when the vector side has
//! nothing for the seed repository.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::model::{EdgeKind, RecallSource, Recommendation};
use crate::storage::Store;
use crate::vector::VectorIndex;

/// Graph recall reads this many edges per seed
const GRAPH_RECALL_LIMIT: i64 = 100;

/// Semantic recall takes this many nearest neighbors
const SEMANTIC_RECALL_K: usize = 20;

/// Graph scores are normalized by this divisor before capping at 1
const GRAPH_NORMALIZER: f32 = 2.0;

/// At most this many recommendations share an owner
const PER_OWNER_CAP: usize = 2;

/// Per-kind multiplier applied to edge weights during graph recall
fn kind_weight(kind: EdgeKind) -> f32 {
    match kind {
        EdgeKind::Author => 1.0,
        EdgeKind::Ecosystem => 0.5,
        EdgeKind::Collection => 0.5,
        // semantic edges feed semantic recall, not graph recall
        EdgeKind::Semantic => 0.0,
    }
}

#[derive(Default)]
struct Candidate {
    graph_score: f32,
    semantic_score: f32,
    sources: Vec<RecallSource>,
}

/// Weighted recommendation engine over graph edges and the vector index
pub struct Recommender {
    store: Arc<Store>,
    index: Arc<Mutex<VectorIndex>>,
    /// Weight of the graph side; the semantic side gets the complement
    graph_weight: f32,
}

impl Recommender {
    pub fn new(store: Arc<Store>, index: Arc<Mutex<VectorIndex>>, graph_weight: f32) -> Self {
        Self {
            store,
            index,
            graph_weight: graph_weight.clamp(0.0, 1.0),
        }
    }

    /// Stage 1a: accumulate per-candidate graph scores from stored edges
    fn graph_recall(&self, seed: &str) -> Result<HashMap<String, f32>> {
        let edges = self.store.edges_for(
            seed,
            &[EdgeKind::Author, EdgeKind::Ecosystem, EdgeKind::Collection],
            GRAPH_RECALL_LIMIT,
        )?;

        let mut scores: HashMap<String, f32> = HashMap::new();
        for edge in edges {
            let Some(other) = edge.other_endpoint(seed) else {
                continue;
            };
            *scores.entry(other.to_string()).or_default() += edge.weight * kind_weight(edge.kind);
        }

        for score in scores.values_mut() {
            *score = (*score / GRAPH_NORMALIZER).min(1.0);
        }
        Ok(scores)
    }

    /// Stage 1b: nearest neighbors of the seed's stored embedding
    fn semantic_recall(&self, seed: &str) -> Result<Vec<(String, f32)>> {
        let index = self
            .index
            .lock()
            .map_err(|_| Error::Internal("vector index lock poisoned".into()))?;
        let Some(vector) = index.get_vector(seed) else {
            return Ok(vec![]);
        };
        let vector = vector.to_vec();

        let hits = index.query(&vector, SEMANTIC_RECALL_K + 1, None)?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.key != seed)
            .take(SEMANTIC_RECALL_K)
            .map(|hit| (hit.key, hit.similarity))
            .collect())
    }

    /// Recommend repositories related to `seed`
    ///
    /// `exclude` drops specific candidates; `include_semantic=false` (or an
    /// unavailable vector side) yields graph-only results.
    pub fn recommend(
        &self,
        seed: &str,
        limit: usize,
        include_semantic: bool,
        exclude: &[String],
    ) -> Result<Vec<Recommendation>> {
        let seed_repo = self
            .store
            .get_by_name(seed)?
            .filter(|r| !r.is_deleted)
            .ok_or_else(|| Error::NotFound(format!("repository {}", seed)))?;

        // Stage 1: multi-source recall
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        for (key, score) in self.graph_recall(seed)? {
            let entry = candidates.entry(key).or_default();
            entry.graph_score = score;
            entry.sources.push(RecallSource::Graph);
        }

        if include_semantic {
            for (key, similarity) in self.semantic_recall(seed)? {
                let entry = candidates.entry(key).or_default();
                entry.semantic_score = similarity;
                entry.sources.push(RecallSource::Semantic);
            }
        }

        // Stage 2: weighted fusion
        let semantic_weight = 1.0 - self.graph_weight;
        let mut fused: Vec<(String, Candidate, f32)> = candidates
            .into_iter()
            .map(|(key, candidate)| {
                let score = self.graph_weight * candidate.graph_score
                    + semantic_weight * candidate.semantic_score;
                (key, candidate, score.clamp(0.0, 1.0))
            })
            .collect();
        fused.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        // Stage 3: diversity optimization
        let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        let mut per_owner: HashMap<String, usize> = HashMap::new();
        let mut result = Vec::with_capacity(limit);

        for (key, candidate, score) in fused {
            if result.len() >= limit {
                break;
            }
            if key == seed_repo.name_with_owner || excluded.contains(key.as_str()) {
                continue;
            }
            let Some(repository) = self.store.get_by_name(&key)? else {
                continue;
            };
            if repository.is_deleted {
                continue;
            }

            let owner_count = per_owner.entry(repository.owner.clone()).or_insert(0);
            if *owner_count >= PER_OWNER_CAP {
                continue;
            }
            *owner_count += 1;

            result.push(Recommendation {
                repository,
                score,
                graph_score: candidate.graph_score,
                semantic_score: candidate.semantic_score,
                sources: candidate.sources,
            });
        }

        Ok(result)
    }
}

// ============================================================================
// TESTS
// ============================================================================
