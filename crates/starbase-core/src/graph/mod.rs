//! Edge Discovery
//!
//! Computes the relationship graph over a live-repository snapshot:
//! author, ecosystem (shared language / overlapping topics), collection,
//! and semantic (embedding similarity) edges. Only this module writes
//! `graph_edges`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::model::{EdgeKind, GraphEdge, Repository};
use crate::storage::Store;
use crate::vector::VectorIndex;

/// Author edges connect same-owner repositories
const AUTHOR_WEIGHT: f32 = 1.0;

/// Shared-primary-language edges
const LANGUAGE_WEIGHT: f32 = 0.6;

/// Collection co-membership edges
const COLLECTION_WEIGHT: f32 = 0.5;

/// Languages with at least this many repositories qualify
const LANGUAGE_MIN_COUNT: usize = 2;

/// Mega-languages are skipped: pair explosion, no signal
const LANGUAGE_MAX_COUNT: usize = 50;

/// At most this many repositories per language are paired
const LANGUAGE_PAIR_CAP: usize = 20;

/// Minimum shared topics before a topic edge is considered
const TOPIC_MIN_SHARED: usize = 2;

/// Jaccard threshold for topic edges
const TOPIC_MIN_JACCARD: f32 = 0.3;

/// Normalize a pair so `source < target`; dedupes unordered pairs
fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a < b { (a, b) } else { (b, a) }
}

// ============================================================================
// PURE EDGE COMPUTATION
// ============================================================================

/// Same-owner edges: every unordered pair under an owner with more than
/// one repository, weight 1.0
pub fn author_edges(repos: &[Repository]) -> Vec<GraphEdge> {
    let mut by_owner: HashMap<&str, Vec<&str>> = HashMap::new();
    for repo in repos {
        by_owner
            .entry(repo.owner.as_str())
            .or_default()
            .push(repo.name_with_owner.as_str());
    }

    let mut edges = Vec::new();
    for (owner, members) in by_owner {
        if members.len() < 2 {
            continue;
        }
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let (source, target) = ordered(members[i], members[j]);
                edges.push(
                    GraphEdge::new(source, target, EdgeKind::Author, AUTHOR_WEIGHT)
                        .with_metadata(serde_json::json!({ "owner": owner })),
                );
            }
        }
    }
    edges
}

/// Shared-primary-language edges, weight 0.6
///
/// Languages with fewer than 2 or 50+ repositories are skipped, and at most
/// 20 repositories per language are paired.
pub fn language_edges(repos: &[Repository]) -> Vec<GraphEdge> {
    let mut by_language: HashMap<&str, Vec<&str>> = HashMap::new();
    for repo in repos {
        if let Some(language) = repo.primary_language.as_deref() {
            by_language
                .entry(language)
                .or_default()
                .push(repo.name_with_owner.as_str());
        }
    }

    let mut edges = Vec::new();
    for (language, members) in by_language {
        if members.len() < LANGUAGE_MIN_COUNT || members.len() >= LANGUAGE_MAX_COUNT {
            continue;
        }
        let capped = &members[..members.len().min(LANGUAGE_PAIR_CAP)];
        for i in 0..capped.len() {
            for j in (i + 1)..capped.len() {
                let (source, target) = ordered(capped[i], capped[j]);
                edges.push(
                    GraphEdge::new(source, target, EdgeKind::Ecosystem, LANGUAGE_WEIGHT)
                        .with_metadata(serde_json::json!({ "language": language })),
                );
            }
        }
    }
    edges
}

/// Topic-overlap edges: pairs sharing at least 2 topics with Jaccard
/// similarity above 0.3, weight = Jaccard rounded to 2 decimals
pub fn topic_edges(repos: &[Repository]) -> Vec<GraphEdge> {
    // Invert topics to keep the pair candidates sparse
    let mut by_topic: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, repo) in repos.iter().enumerate() {
        for topic in &repo.topics {
            by_topic.entry(topic.as_str()).or_default().push(idx);
        }
    }

    let mut candidates: HashSet<(usize, usize)> = HashSet::new();
    for members in by_topic.values() {
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let (a, b) = (members[i].min(members[j]), members[i].max(members[j]));
                candidates.insert((a, b));
            }
        }
    }

    let mut edges = Vec::new();
    for (a, b) in candidates {
        let topics_a: HashSet<&str> = repos[a].topics.iter().map(String::as_str).collect();
        let topics_b: HashSet<&str> = repos[b].topics.iter().map(String::as_str).collect();
        let shared = topics_a.intersection(&topics_b).count();
        if shared < TOPIC_MIN_SHARED {
            continue;
        }
        let union = topics_a.union(&topics_b).count();
        let jaccard = shared as f32 / union as f32;
        if jaccard <= TOPIC_MIN_JACCARD {
            continue;
        }
        let weight = (jaccard * 100.0).round() / 100.0;
        let mut shared_topics: Vec<&str> =
            topics_a.intersection(&topics_b).copied().collect();
        shared_topics.sort_unstable();

        let (source, target) = ordered(&repos[a].name_with_owner, &repos[b].name_with_owner);
        edges.push(
            GraphEdge::new(source, target, EdgeKind::Ecosystem, weight)
                .with_metadata(serde_json::json!({ "sharedTopics": shared_topics })),
        );
    }
    edges
}

/// Collection co-membership edges, weight 0.5, deduped across collections
pub fn collection_edges(members: &[(i64, String)]) -> Vec<GraphEdge> {
    let mut by_collection: HashMap<i64, Vec<&str>> = HashMap::new();
    for (collection_id, key) in members {
        by_collection.entry(*collection_id).or_default().push(key);
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut edges = Vec::new();
    for (collection_id, keys) in by_collection {
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                let (source, target) = ordered(keys[i], keys[j]);
                if !seen.insert((source.to_string(), target.to_string())) {
                    continue;
                }
                edges.push(
                    GraphEdge::new(source, target, EdgeKind::Collection, COLLECTION_WEIGHT)
                        .with_metadata(serde_json::json!({ "collectionId": collection_id })),
                );
            }
        }
    }
    edges
}

// ============================================================================
// GRAPH SERVICE
// ============================================================================

/// Owns graph-edge persistence on top of the pure computations
pub struct GraphService {
    store: Arc<Store>,
    index: Arc<Mutex<VectorIndex>>,
    min_similarity: f32,
    top_k: usize,
}

impl GraphService {
    pub fn new(
        store: Arc<Store>,
        index: Arc<Mutex<VectorIndex>>,
        min_similarity: f32,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            index,
            min_similarity,
            top_k,
        }
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, VectorIndex>> {
        self.index
            .lock()
            .map_err(|_| Error::Internal("vector index lock poisoned".into()))
    }

    /// Recompute author/ecosystem/collection edges from the live snapshot,
    /// replacing the previous set atomically; semantic edges are untouched.
    /// Deterministic for a given snapshot.
    pub fn rebuild_all(&self) -> Result<usize> {
        let snapshot = self.store.all_live()?;
        let members = self.store.collection_members()?;

        let mut edges = author_edges(&snapshot);
        edges.extend(language_edges(&snapshot));
        edges.extend(topic_edges(&snapshot));
        edges.extend(collection_edges(&members));

        let count = self.store.replace_non_semantic_edges(&edges)?;
        tracing::info!("Graph rebuild: {} non-semantic edges", count);
        Ok(count)
    }

    /// Compute semantic edges for one repository from its current vector
    fn semantic_edges_for(
        &self,
        name_with_owner: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<GraphEdge>> {
        let index = self.lock_index()?;
        let Some(vector) = index.get_vector(name_with_owner) else {
            return Ok(vec![]);
        };
        let vector = vector.to_vec();

        // +1 because the repository itself is its own nearest neighbor
        let hits = index.query(&vector, top_k + 1, None)?;
        let edges = hits
            .into_iter()
            .filter(|hit| hit.key != name_with_owner)
            .filter(|hit| hit.similarity >= min_similarity)
            .take(top_k)
            .map(|hit| {
                GraphEdge::new(name_with_owner, &hit.key, EdgeKind::Semantic, hit.similarity)
            })
            .collect();
        Ok(edges)
    }

    /// Replace the semantic edges touching one repository; called whenever
    /// its embedding changes
    pub fn refresh_semantic_for(&self, name_with_owner: &str) -> Result<usize> {
        self.store.delete_semantic_edges_for(name_with_owner)?;
        let edges = self.semantic_edges_for(name_with_owner, self.top_k, self.min_similarity)?;
        self.store.insert_edges(&edges)?;
        Ok(edges.len())
    }

    /// Rebuild every semantic edge from scratch
    pub fn rebuild_semantic(&self, top_k: usize, min_similarity: f32) -> Result<usize> {
        self.store.clear_semantic_edges()?;

        let keys: Vec<String> = self.store.live_keys()?;
        let mut total = 0;
        for key in keys {
            let edges = self.semantic_edges_for(&key, top_k, min_similarity)?;
            total += self.store.insert_edges(&edges)?;
        }
        tracing::info!("Semantic rebuild: {} edges", total);
        Ok(total)
    }

    /// Drop every edge touching a repository (soft-delete cleanup)
    pub fn remove_repository(&self, name_with_owner: &str) -> Result<usize> {
        self.store.delete_edges_touching(name_with_owner)
    }
}

// ============================================================================
// TESTS
// ============================================================================
