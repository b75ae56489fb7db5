//! API endpoint handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use starbase_core::{EdgeKind, Error, OwnerType, SearchFilters, SyncMode};

use super::error_response;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn fail(e: Error) -> (StatusCode, Json<Value>) {
    error_response(e)
}

fn invalid(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    error_response(Error::InputInvalid(message.into()))
}

/// Parse a CSV query parameter into a trimmed list
fn csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// SYNC
// ============================================================================

/// GET /api/sync/status
pub async fn sync_status(State(state): State<AppState>) -> ApiResult {
    let last = state.store.last_completed_sync().map_err(fail)?;
    let live = state.store.count_live().map_err(fail)?;
    let since = last.as_ref().map(|h| h.started_at).unwrap_or_else(Utc::now);
    let pending = state.store.count_pending_update(since).map_err(fail)?;

    Ok(Json(json!({
        "running": state.engine.is_running(),
        "lastSync": last,
        "liveCount": live,
        "pendingUpdateCount": pending,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SyncManualParams {
    pub full_sync: Option<bool>,
    pub reanalyze: Option<bool>,
}

/// POST /api/sync/manual?full_sync={bool}&reanalyze={bool}
///
/// Triggers the sync as a background job; a run already in flight is a 409.
pub async fn sync_manual(
    State(state): State<AppState>,
    Query(params): Query<SyncManualParams>,
) -> ApiResult {
    let mode = match (
        params.full_sync.unwrap_or(false),
        params.reanalyze.unwrap_or(false),
    ) {
        (true, true) => SyncMode::FullReanalyze,
        (true, false) => SyncMode::Full,
        (false, _) => SyncMode::Incremental,
    };

    if state.engine.is_running() {
        return Err(fail(Error::Conflict("sync already running".to_string())));
    }

    let engine = state.engine.clone();
    tokio::spawn(async move {
        // Conflict here means another caller won the race; the engine's own
        // lock keeps the single-writer guarantee either way.
        if let Err(e) = engine.sync(mode).await {
            tracing::warn!("Manual sync ended with error: {}", e);
        }
    });

    Ok(Json(json!({
        "status": "started",
        "kind": mode.history_kind(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

/// GET /api/sync/history?limit=N
pub async fn sync_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult {
    let limit = params.limit.unwrap_or(20).clamp(1, 200);
    let history = state.store.list_history(limit).map_err(fail)?;
    Ok(Json(json!({ "history": history })))
}

/// POST /api/sync/repo/{owner}/{name}/reanalyze
pub async fn reanalyze_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult {
    let key = format!("{}/{}", owner, name);
    let repo = state
        .store
        .get_by_name(&key)
        .map_err(fail)?
        .filter(|r| !r.is_deleted)
        .ok_or_else(|| fail(Error::NotFound(format!("repository {}", key))))?;

    state.store.set_needs_analysis(&key, true).map_err(fail)?;
    Ok(Json(json!({
        "status": "queued",
        "repository": repo.name_with_owner,
    })))
}

// ============================================================================
// SEARCH & REPOSITORIES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub languages: Option<String>,
    pub min_stars: Option<i64>,
    pub owner_type: Option<String>,
    pub is_active: Option<bool>,
    pub is_new: Option<bool>,
    pub exclude_archived: Option<bool>,
    pub include_related: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn filters_from(params: &SearchParams) -> SearchFilters {
    SearchFilters {
        languages: csv(&params.languages),
        min_stars: params.min_stars,
        starred_after: None,
        owner_type: params.owner_type.as_deref().map(OwnerType::parse_name),
        is_active: params.is_active,
        is_new: params.is_new,
        exclude_archived: params.exclude_archived.unwrap_or(false),
        is_deleted: None,
    }
}

/// GET /api/search
pub async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult {
    let query = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| invalid("query parameter 'q' is required"))?;

    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);
    let filters = filters_from(&params);

    let hits = state
        .search
        .search(query, &filters, limit + offset)
        .await
        .map_err(fail)?;
    let hits: Vec<_> = hits.into_iter().skip(offset as usize).collect();

    let related = if params.include_related.unwrap_or(false) {
        match hits.first() {
            Some(top) => state
                .recommender
                .recommend(&top.repository.name_with_owner, 5, true, &[])
                .unwrap_or_default(),
            None => vec![],
        }
    } else {
        vec![]
    };

    Ok(Json(json!({
        "query": query,
        "total": hits.len(),
        "results": hits,
        "related": related,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub languages: Option<String>,
    pub min_stars: Option<i64>,
    pub owner_type: Option<String>,
    pub is_active: Option<bool>,
    pub is_new: Option<bool>,
    pub exclude_archived: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/repos — filtered listing, `starred_at` descending
pub async fn list_repos(State(state): State<AppState>, Query(params): Query<ListParams>) -> ApiResult {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);
    let filters = SearchFilters {
        languages: csv(&params.languages),
        min_stars: params.min_stars,
        starred_after: None,
        owner_type: params.owner_type.as_deref().map(OwnerType::parse_name),
        is_active: params.is_active,
        is_new: params.is_new,
        exclude_archived: params.exclude_archived.unwrap_or(false),
        is_deleted: None,
    };

    let repos = state.store.list_live(&filters, limit, offset).map_err(fail)?;
    Ok(Json(json!({
        "total": repos.len(),
        "repositories": repos,
    })))
}

/// GET /api/repos/{owner}/{name}
pub async fn get_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult {
    let key = format!("{}/{}", owner, name);
    let repo = state
        .store
        .get_by_name(&key)
        .map_err(fail)?
        .filter(|r| !r.is_deleted)
        .ok_or_else(|| fail(Error::NotFound(format!("repository {}", key))))?;
    Ok(Json(json!(repo)))
}

// ============================================================================
// RECOMMENDATIONS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecommendParams {
    pub limit: Option<usize>,
    pub include_semantic: Option<bool>,
    pub exclude_repos: Option<String>,
}

/// GET /api/recommendations/{owner}/{name}
pub async fn recommendations(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<RecommendParams>,
) -> ApiResult {
    let key = format!("{}/{}", owner, name);
    let limit = params.limit.unwrap_or(10).clamp(1, 50);
    let include_semantic = params.include_semantic.unwrap_or(true);
    let exclude = csv(&params.exclude_repos);

    let state_clone = state.clone();
    let recs = tokio::task::spawn_blocking(move || {
        state_clone
            .recommender
            .recommend(&key, limit, include_semantic, &exclude)
    })
    .await
    .map_err(|e| fail(Error::Internal(format!("join error: {}", e))))?
    .map_err(fail)?;

    Ok(Json(json!({
        "total": recs.len(),
        "recommendations": recs,
    })))
}

// ============================================================================
// GRAPH
// ============================================================================

/// POST /api/graph/rebuild — author/ecosystem/collection edges
pub async fn graph_rebuild(State(state): State<AppState>) -> ApiResult {
    let graph = state.graph.clone();
    let edges = tokio::task::spawn_blocking(move || graph.rebuild_all())
        .await
        .map_err(|e| fail(Error::Internal(format!("join error: {}", e))))?
        .map_err(fail)?;
    Ok(Json(json!({ "status": "completed", "edges": edges })))
}

#[derive(Debug, Deserialize)]
pub struct SemanticRebuildParams {
    pub top_k: Option<usize>,
    pub min_similarity: Option<f32>,
}

/// POST /api/graph/semantic-edges/rebuild — background job
pub async fn semantic_edges_rebuild(
    State(state): State<AppState>,
    Query(params): Query<SemanticRebuildParams>,
) -> ApiResult {
    let top_k = params.top_k.unwrap_or(state.config.semantic_top_k).clamp(1, 100);
    let min_similarity = params
        .min_similarity
        .unwrap_or(state.config.semantic_min_similarity)
        .clamp(0.0, 1.0);

    let graph = state.graph.clone();
    tokio::spawn(async move {
        let outcome =
            tokio::task::spawn_blocking(move || graph.rebuild_semantic(top_k, min_similarity)).await;
        match outcome {
            Ok(Ok(edges)) => tracing::info!("Semantic edge rebuild finished: {} edges", edges),
            Ok(Err(e)) => tracing::warn!("Semantic edge rebuild failed: {}", e),
            Err(e) => tracing::warn!("Semantic edge rebuild panicked: {}", e),
        }
    });

    Ok(Json(json!({
        "status": "started",
        "topK": top_k,
        "minSimilarity": min_similarity,
    })))
}

/// GET /api/graph/status
pub async fn graph_status(State(state): State<AppState>) -> ApiResult {
    let counts = state.store.edge_counts().map_err(fail)?;
    let last_rebuild = state.store.last_edges_computed().map_err(fail)?;
    let by_kind: Value = counts.into_iter().map(|(k, c)| (k, json!(c))).collect::<serde_json::Map<_, _>>().into();
    Ok(Json(json!({
        "edgesByKind": by_kind,
        "lastRebuildAt": last_rebuild,
    })))
}

#[derive(Debug, Deserialize)]
pub struct NodeEdgesParams {
    pub edge_types: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/graph/nodes/{owner}/{name}/edges
pub async fn node_edges(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<NodeEdgesParams>,
) -> ApiResult {
    let key = format!("{}/{}", owner, name);
    state
        .store
        .get_by_name(&key)
        .map_err(fail)?
        .filter(|r| !r.is_deleted)
        .ok_or_else(|| fail(Error::NotFound(format!("repository {}", key))))?;

    let mut kinds = Vec::new();
    for raw in csv(&params.edge_types) {
        let kind = EdgeKind::parse_name(&raw)
            .ok_or_else(|| invalid(format!("unknown edge type '{}'", raw)))?;
        kinds.push(kind);
    }
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let edges = state.store.edges_for(&key, &kinds, limit).map_err(fail)?;
    Ok(Json(json!({
        "repository": key,
        "total": edges.len(),
        "edges": edges,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RelatedParams {
    pub limit: Option<usize>,
}

/// GET /api/graph/nodes/{owner}/{name}/related — graph recall only
pub async fn node_related(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<RelatedParams>,
) -> ApiResult {
    let key = format!("{}/{}", owner, name);
    let limit = params.limit.unwrap_or(10).clamp(1, 50);

    let recommender = state.recommender.clone();
    let related = tokio::task::spawn_blocking(move || recommender.recommend(&key, limit, false, &[]))
        .await
        .map_err(|e| fail(Error::Internal(format!("join error: {}", e))))?
        .map_err(fail)?;

    Ok(Json(json!({
        "total": related.len(),
        "related": related,
    })))
}

// ============================================================================
// VECTORS
// ============================================================================

/// GET /api/vector/status
pub async fn vector_status(State(state): State<AppState>) -> ApiResult {
    let healthy = state.vectorizer.embedder_healthy().await;
    let indexed = state.vectorizer.count().map_err(fail)?;
    let total = state.store.count_live().map_err(fail)?;
    Ok(Json(json!({
        "embedderHealthy": healthy,
        "embedderModel": state.vectorizer.embedder_model(),
        "indexedCount": indexed,
        "totalCount": total,
    })))
}

/// POST /api/vector/reindex — re-embed every live repository, background
pub async fn vector_reindex(State(state): State<AppState>) -> ApiResult {
    let total = state.store.count_live().map_err(fail)?;

    let store = state.store.clone();
    let vectorizer = state.vectorizer.clone();
    tokio::spawn(async move {
        let repos = match store.all_live() {
            Ok(repos) => repos,
            Err(e) => {
                tracing::warn!("Reindex aborted: {}", e);
                return;
            }
        };
        match vectorizer.index_batch(&repos).await {
            Ok(indexed) => tracing::info!("Reindex finished: {}/{} embedded", indexed, repos.len()),
            Err(e) => tracing::warn!("Reindex failed: {}", e),
        }
    });

    Ok(Json(json!({
        "status": "started",
        "totalCount": total,
    })))
}

// ============================================================================
// LIVENESS
// ============================================================================

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
