//! Hybrid Search
//!
//! Runs the lexical (FTS5/BM25) and semantic (vector) legs in parallel and
//! merges them by a normalized weighted sum. When the embedder is down or
//! returns nothing, results degrade to lexical-only; degradation is never
//! an error.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::model::{HybridHit, MatchType, Repository, SearchFilters};
use crate::storage::Store;
use crate::vector::VectorIndex;
use crate::vectorize::Vectorizer;

/// Query-embedding cache capacity
const QUERY_CACHE_SIZE: usize = 100;

/// Hybrid search always recalls at least this many per leg
const MIN_TOP_K: i64 = 10;

/// Leg weights for the fused score
#[derive(Debug, Clone, Copy)]
pub struct SearchWeights {
    pub fts: f32,
    pub semantic: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            fts: 0.3,
            semantic: 0.7,
        }
    }
}

/// Monotonic squash of a raw BM25 score into [0, 1] so scores are
/// comparable across queries
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Does a repository pass the filter set? Used to post-filter semantic
/// hits, which bypass the SQL WHERE clause.
fn matches_filters(repo: &Repository, filters: &SearchFilters, now: DateTime<Utc>) -> bool {
    if repo.is_deleted != filters.is_deleted.unwrap_or(false) {
        return false;
    }
    if !filters.languages.is_empty() {
        let Some(language) = repo.primary_language.as_deref() else {
            return false;
        };
        if !filters.languages.iter().any(|l| l == language) {
            return false;
        }
    }
    if let Some(min_stars) = filters.min_stars {
        if repo.stargazer_count < min_stars {
            return false;
        }
    }
    if let Some(starred_after) = filters.starred_after {
        if repo.starred_at.is_none_or(|t| t < starred_after) {
            return false;
        }
    }
    if let Some(owner_type) = filters.owner_type {
        if repo.owner_type != owner_type {
            return false;
        }
    }
    if filters.is_active == Some(true) && repo.pushed_at.is_none_or(|t| t < now - Duration::days(7))
    {
        return false;
    }
    if filters.is_new == Some(true)
        && repo.created_at.is_none_or(|t| t < now - Duration::days(180))
    {
        return false;
    }
    if filters.exclude_archived && repo.archived {
        return false;
    }
    true
}

// ============================================================================
// HYBRID SEARCH
// ============================================================================

struct MergedScores {
    fts: Option<f32>,
    semantic: Option<f32>,
}

/// Parallel FTS + semantic retrieval with weighted score fusion
pub struct HybridSearch {
    store: Arc<Store>,
    vectorizer: Arc<Vectorizer>,
    index: Arc<Mutex<VectorIndex>>,
    weights: SearchWeights,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl HybridSearch {
    pub fn new(
        store: Arc<Store>,
        vectorizer: Arc<Vectorizer>,
        index: Arc<Mutex<VectorIndex>>,
        weights: SearchWeights,
    ) -> Self {
        Self {
            store,
            vectorizer,
            index,
            weights,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Embed a query, consulting the LRU cache first; an empty vector means
    /// the semantic leg is unavailable for this query
    async fn query_embedding(&self, query: &str) -> Vec<f32> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(query) {
                return hit.clone();
            }
        }
        let vector = self.vectorizer.embed_query(query).await;
        if !vector.is_empty() {
            if let Ok(mut cache) = self.query_cache.lock() {
                cache.put(query.to_string(), vector.clone());
            }
        }
        vector
    }

    /// The semantic leg: embed, then nearest-neighbor lookup. `None` means
    /// the leg was unavailable (no query embedding, lock trouble, or a
    /// search failure) and results must degrade to lexical-only scoring.
    async fn semantic_leg(&self, query: &str, top_k: usize) -> Option<Vec<(String, f32)>> {
        let embedding = self.query_embedding(query).await;
        if embedding.is_empty() {
            return None;
        }
        let index = self.index.lock().ok()?;
        match index.query(&embedding, top_k, None) {
            Ok(hits) => Some(hits.into_iter().map(|h| (h.key, h.similarity)).collect()),
            Err(e) => {
                tracing::warn!("Semantic leg failed for '{}': {}", query, e);
                None
            }
        }
    }

    /// Hybrid search: both legs in parallel, normalized weighted merge,
    /// deterministic ordering, enrichment from the store.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: i64,
    ) -> Result<Vec<HybridHit>> {
        let top_k = limit.max(MIN_TOP_K);

        let store = Arc::clone(&self.store);
        let fts_query = query.to_string();
        let fts_filters = filters.clone();
        let fts_leg = tokio::task::spawn_blocking(move || {
            store.full_text_search(&fts_query, &fts_filters, top_k)
        });

        let (fts_outcome, semantic_outcome) =
            tokio::join!(fts_leg, self.semantic_leg(query, top_k as usize));

        // Lexical failure is fatal (store trouble); semantic failure is not
        let fts_hits = fts_outcome.map_err(|e| Error::Internal(format!("join error: {}", e)))??;
        let semantic_available = semantic_outcome.is_some();
        let semantic_hits = semantic_outcome.unwrap_or_default();

        let mut repos: HashMap<String, Repository> = HashMap::new();
        let mut merged: HashMap<String, MergedScores> = HashMap::new();

        for (repo, raw) in fts_hits {
            let key = repo.name_with_owner.clone();
            merged.insert(
                key.clone(),
                MergedScores {
                    fts: Some(sigmoid(raw)),
                    semantic: None,
                },
            );
            repos.insert(key, repo);
        }

        let now = Utc::now();
        for (key, similarity) in semantic_hits {
            if !repos.contains_key(&key) {
                // Semantic-only hit: enrich and post-filter
                let Some(repo) = self.store.get_by_name(&key)? else {
                    continue;
                };
                if !matches_filters(&repo, filters, now) {
                    continue;
                }
                repos.insert(key.clone(), repo);
            }
            merged
                .entry(key)
                .or_insert(MergedScores {
                    fts: None,
                    semantic: None,
                })
                .semantic = Some(similarity);
        }

        let mut hits: Vec<HybridHit> = merged
            .into_iter()
            .filter_map(|(key, scores)| {
                let repository = repos.remove(&key)?;
                let fts_score = scores.fts.unwrap_or(0.0);
                let semantic_score = scores.semantic.unwrap_or(0.0).clamp(0.0, 1.0);
                let match_type = match (scores.fts.is_some(), scores.semantic.is_some()) {
                    (true, true) => MatchType::Hybrid,
                    (false, true) => MatchType::Semantic,
                    _ => MatchType::Fts,
                };
                // With the semantic leg down, results degrade to pure
                // lexical scoring; otherwise the weighted sum applies even
                // when one side contributed zero.
                let final_score = if semantic_available {
                    self.weights.fts * fts_score + self.weights.semantic * semantic_score
                } else {
                    fts_score
                };
                Some(HybridHit {
                    repository,
                    fts_score,
                    semantic_score,
                    final_score: final_score.clamp(0.0, 1.0),
                    match_type,
                })
            })
            .collect();

        // Deterministic: final desc, then fts desc, then key asc
        hits.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.fts_score
                        .partial_cmp(&a.fts_score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then_with(|| {
                    a.repository
                        .name_with_owner
                        .cmp(&b.repository.name_with_owner)
                })
        });
        hits.truncate(limit as usize);
        Ok(hits)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerType;
    use crate::testutil::{FakeEmbedder, remote_repo};

    #[test]
    fn test_sigmoid_bounds() {
        assert!(sigmoid(0.0) - 0.5 < 0.0001);
        assert!(sigmoid(100.0) <= 1.0);
        assert!(sigmoid(-100.0) >= 0.0);
        assert!(sigmoid(2.0) > sigmoid(1.0));
    }

    fn filters() -> SearchFilters {
        SearchFilters::default()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        search: HybridSearch,
        embedder: Arc<FakeEmbedder>,
        vectorizer: Arc<Vectorizer>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("test.db"))).unwrap());
        let embedder = Arc::new(FakeEmbedder::default());
        let index = Arc::new(Mutex::new(VectorIndex::in_memory().unwrap()));
        let vectorizer = Arc::new(Vectorizer::new(
            Arc::clone(&embedder) as Arc<dyn crate::embedding::Embedder>,
            Arc::clone(&index),
        ));
        let search = HybridSearch::new(
            Arc::clone(&store),
            Arc::clone(&vectorizer),
            index,
            SearchWeights::default(),
        );
        Harness {
            _dir: dir,
            store,
            search,
            embedder,
            vectorizer,
        }
    }

    async fn seed(h: &Harness) {
        for (owner, name, description) in [
            ("celery", "celery", "Distributed task queue"),
            ("acme", "widget", "Small CLI for files"),
            ("beta", "oxide", "Fast web framework"),
        ] {
            let repo = h
                .store
                .upsert_repository(&remote_repo(owner, name, description), Utc::now())
                .unwrap();
            h.vectorizer.index_repository(&repo).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_lexical_match_scores_in_bounds() {
        let h = harness();
        seed(&h).await;

        let hits = h.search.search("task queue", &filters(), 10).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].repository.name_with_owner, "celery/celery");
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.fts_score));
            assert!((0.0..=1.0).contains(&hit.semantic_score));
            assert!((0.0..=1.0).contains(&hit.final_score));
        }
    }

    #[tokio::test]
    async fn test_hybrid_match_type_when_both_legs_hit() {
        let h = harness();
        seed(&h).await;

        let hits = h
            .search
            .search("distributed task queue", &filters(), 10)
            .await
            .unwrap();
        let top = &hits[0];
        assert_eq!(top.repository.name_with_owner, "celery/celery");
        assert!(matches!(top.match_type, MatchType::Hybrid | MatchType::Semantic));
    }

    #[tokio::test]
    async fn test_degrades_to_lexical_when_embedder_down() {
        let h = harness();
        seed(&h).await;
        h.embedder
            .healthy
            .store(false, std::sync::atomic::Ordering::Relaxed);

        let hits = h.search.search("task queue", &filters(), 10).await.unwrap();
        assert!(!hits.is_empty());
        for hit in &hits {
            assert_eq!(hit.match_type, MatchType::Fts);
            assert_eq!(hit.semantic_score, 0.0);
            assert!((hit.final_score - hit.fts_score).abs() < f32::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_no_lexical_hit_no_semantic_returns_empty_not_error() {
        let h = harness();
        seed(&h).await;
        h.embedder
            .healthy
            .store(false, std::sync::atomic::Ordering::Relaxed);

        // No lexical overlap with any description
        let hits = h.search.search("nonexistent phrase", &filters(), 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_filters_apply_to_semantic_hits() {
        let h = harness();
        seed(&h).await;

        let restrictive = SearchFilters {
            min_stars: Some(10_000),
            ..Default::default()
        };
        let hits = h
            .search
            .search("distributed task queue", &restrictive, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_limit_trims_results() {
        let h = harness();
        seed(&h).await;
        let hits = h.search.search("for", &filters(), 1).await.unwrap();
        assert!(hits.len() <= 1);
    }

    #[test]
    fn test_matches_filters_owner_type_and_archived() {
        let repo = Repository {
            id: 1,
            owner: "acme".into(),
            name: "widget".into(),
            name_with_owner: "acme/widget".into(),
            description: None,
            readme_summary: None,
            primary_language: Some("Go".into()),
            languages: vec![],
            topics: vec![],
            homepage: None,
            stargazer_count: 5,
            fork_count: 0,
            owner_type: OwnerType::User,
            archived: true,
            visibility: "public".into(),
            license: None,
            created_at: None,
            pushed_at: None,
            starred_at: None,
            last_synced_at: None,
            last_analyzed_at: None,
            summary: None,
            categories: vec![],
            features: vec![],
            use_cases: vec![],
            is_deleted: false,
            needs_analysis: false,
        };
        let now = Utc::now();

        assert!(matches_filters(&repo, &SearchFilters::default(), now));
        assert!(!matches_filters(
            &repo,
            &SearchFilters {
                exclude_archived: true,
                ..Default::default()
            },
            now
        ));
        assert!(!matches_filters(
            &repo,
            &SearchFilters {
                owner_type: Some(OwnerType::Organization),
                ..Default::default()
            },
            now
        ));
        assert!(!matches_filters(
            &repo,
            &SearchFilters {
                is_active: Some(true),
                ..Default::default()
            },
            now
        ));
    }
}
