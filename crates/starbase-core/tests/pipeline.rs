//! End-to-end pipeline: sync against a fake remote, then search and
//! recommend over what landed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use starbase_core::{
    EMBEDDING_DIMENSIONS, EdgeKind, Embedder, GraphService, HybridSearch, MatchType,
    OwnerType, Recommender, RemoteRepo, RemoteSource, Result, SearchFilters, SearchWeights,
    Store, SyncEngine, SyncMode, VectorIndex, Vectorizer,
};

// ----------------------------------------------------------------------
// fakes
// ----------------------------------------------------------------------

struct WordHashEmbedder;

fn hash_vector(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut v = vec![0.0_f32; EMBEDDING_DIMENSIONS];
    for word in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        v[(hasher.finish() as usize) % EMBEDDING_DIMENSIONS] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl Embedder for WordHashEmbedder {
    async fn embed(&self, text: &str) -> Vec<f32> {
        if text.trim().is_empty() {
            vec![]
        } else {
            hash_vector(text)
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for t in texts {
            out.push(self.embed(t).await);
        }
        out
    }

    async fn health(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        "word-hash"
    }
}

#[derive(Default)]
struct ScriptedRemote {
    repos: Mutex<Vec<RemoteRepo>>,
}

impl ScriptedRemote {
    fn set(&self, repos: Vec<RemoteRepo>) {
        *self.repos.lock().unwrap() = repos;
    }
}

#[async_trait]
impl RemoteSource for ScriptedRemote {
    async fn list_starred(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRepo>> {
        Ok(self.repos.lock().unwrap().clone())
    }

    async fn fetch_readme(
        &self,
        _owner: &str,
        name: &str,
        _pushed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        Ok(Some(format!(
            "{} is a well documented project with enough prose to summarize properly.",
            name
        )))
    }
}

fn remote(owner: &str, name: &str, description: &str, topics: &[&str]) -> RemoteRepo {
    RemoteRepo {
        owner: owner.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        primary_language: Some("Go".to_string()),
        languages: vec!["Go".to_string()],
        topics: topics.iter().map(|t| t.to_string()).collect(),
        homepage: None,
        stargazer_count: 42,
        fork_count: 3,
        owner_type: OwnerType::User,
        archived: false,
        visibility: "public".to_string(),
        license: Some("MIT".to_string()),
        created_at: Some("2020-01-01T00:00:00Z".parse().unwrap()),
        pushed_at: Some("2024-03-01T00:00:00Z".parse().unwrap()),
        starred_at: Some("2024-02-01T00:00:00Z".parse().unwrap()),
    }
}

struct World {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    remote: Arc<ScriptedRemote>,
    engine: Arc<SyncEngine>,
    search: HybridSearch,
    recommender: Recommender,
}

fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(Some(dir.path().join("starbase.db"))).unwrap());
    let remote = Arc::new(ScriptedRemote::default());
    let index = Arc::new(Mutex::new(VectorIndex::in_memory().unwrap()));
    let vectorizer = Arc::new(Vectorizer::new(Arc::new(WordHashEmbedder), Arc::clone(&index)));
    let graph = Arc::new(GraphService::new(Arc::clone(&store), Arc::clone(&index), 0.3, 10));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&remote) as Arc<dyn RemoteSource>,
        Arc::clone(&vectorizer),
        Arc::clone(&graph),
        500,
    ));
    let search = HybridSearch::new(
        Arc::clone(&store),
        Arc::clone(&vectorizer),
        Arc::clone(&index),
        SearchWeights::default(),
    );
    let recommender = Recommender::new(Arc::clone(&store), Arc::clone(&index), 0.65);
    World {
        _dir: dir,
        store,
        remote,
        engine,
        search,
        recommender,
    }
}

// ----------------------------------------------------------------------
// scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn full_sync_then_hybrid_search_finds_semantic_match() {
    let w = world();
    w.remote.set(vec![
        remote("celery", "celery", "Distributed task queue", &["queue", "jobs"]),
        remote("acme", "widget", "Small CLI for files", &["cli", "files"]),
        remote("beta", "oxide", "Fast web framework", &["web", "http"]),
    ]);

    let report = w.engine.sync_and_wait(SyncMode::Full).await.unwrap();
    assert_eq!(report.counters.added, 3);
    assert_eq!(w.store.count_live().unwrap(), 3);
    assert_eq!(w.store.fts_row_count().unwrap(), 3);

    let hits = w
        .search
        .search("distributed task queue", &SearchFilters::default(), 3)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    let top3: Vec<&str> = hits
        .iter()
        .map(|h| h.repository.name_with_owner.as_str())
        .collect();
    assert!(top3.contains(&"celery/celery"));
    let celery = hits
        .iter()
        .find(|h| h.repository.name_with_owner == "celery/celery")
        .unwrap();
    assert!(matches!(celery.match_type, MatchType::Semantic | MatchType::Hybrid));
}

#[tokio::test]
async fn sync_builds_graph_and_recommender_uses_it() {
    let w = world();
    w.remote.set(vec![
        remote("acme", "widget", "Task runner with retries", &["tasks", "jobs"]),
        remote("acme", "gadget", "Task scheduler daemon", &["tasks", "jobs"]),
        remote("beta", "oxide", "Web framework", &["web"]),
    ]);
    w.engine.sync_and_wait(SyncMode::Full).await.unwrap();

    // Full sync rebuilt the non-semantic graph
    let edges = w.store.edges_for("acme/widget", &[], 50).unwrap();
    assert!(edges.iter().any(|e| e.kind == EdgeKind::Author));
    assert!(edges.iter().any(|e| e.kind == EdgeKind::Ecosystem));

    let recs = w.recommender.recommend("acme/widget", 5, true, &[]).unwrap();
    assert!(!recs.is_empty());
    assert_eq!(recs[0].repository.name_with_owner, "acme/gadget");
    for rec in &recs {
        assert!((0.0..=1.0).contains(&rec.score));
    }
}

#[tokio::test]
async fn unstarring_cleans_vectors_and_search() {
    let w = world();
    w.remote.set(vec![
        remote("celery", "celery", "Distributed task queue", &["queue"]),
        remote("acme", "widget", "Small CLI", &["cli"]),
    ]);
    w.engine.sync_and_wait(SyncMode::Full).await.unwrap();

    w.remote.set(vec![remote("acme", "widget", "Small CLI", &["cli"])]);
    let report = w.engine.sync_and_wait(SyncMode::Incremental).await.unwrap();
    assert_eq!(report.counters.deleted, 1);

    // Lexical search no longer surfaces the soft-deleted repo
    let hits = w
        .search
        .search("task queue", &SearchFilters::default(), 10)
        .await
        .unwrap();
    assert!(
        hits.iter()
            .all(|h| h.repository.name_with_owner != "celery/celery")
    );

    // but the row survives for annotations
    let gone = w.store.get_by_name("celery/celery").unwrap().unwrap();
    assert!(gone.is_deleted);
}

#[tokio::test]
async fn second_sync_without_changes_is_a_no_op() {
    let w = world();
    w.remote.set(vec![remote("acme", "widget", "Small CLI", &["cli"])]);
    w.engine.sync_and_wait(SyncMode::Incremental).await.unwrap();
    let report = w.engine.sync_and_wait(SyncMode::Incremental).await.unwrap();

    assert_eq!(report.counters.added, 0);
    assert_eq!(report.counters.updated, 0);
    assert_eq!(report.counters.deleted, 0);
    assert_eq!(w.store.list_history(10).unwrap().len(), 2);
}

#[tokio::test]
async fn history_invariants_hold() {
    let w = world();
    w.remote.set(vec![remote("acme", "widget", "Small CLI", &["cli"])]);
    w.engine.sync_and_wait(SyncMode::Full).await.unwrap();
    w.remote.set(vec![]);
    w.engine.sync_and_wait(SyncMode::Incremental).await.unwrap();

    for row in w.store.list_history(10).unwrap() {
        let completed = row.completed_at.expect("all runs finished");
        assert!(completed >= row.started_at);
        assert!(row.added >= 0 && row.updated >= 0 && row.deleted >= 0 && row.failed >= 0);
    }
}
