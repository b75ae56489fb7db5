//! Sync Engine
//!
//! Reconciles the remote starred set against the local store: inserts new
//! observations, soft-deletes unstarred ones, classifies changes on the
//! rest, and records every run in sync history. Embedding and graph work
//! for per-repository deltas runs off the critical path.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::graph::GraphService;
use crate::model::{ChangeBucket, RemoteRepo, Repository, SyncCounters, SyncMode};
use crate::remote::RemoteSource;
use crate::storage::Store;
use crate::vectorize::{Vectorizer, summarize_readme};

/// Post-hook queue bound; beyond it the oldest pending entries are dropped
/// (the next sync picks them up)
const POST_HOOK_QUEUE_CAP: usize = 256;

// ============================================================================
// CHANGE CLASSIFICATION
// ============================================================================

/// Classify the delta between a remote snapshot and the local row
///
/// Heavy wins over everything: new commits (or a local row that never
/// recorded languages) force a full refresh. Text changes win over counter
/// changes because they invalidate the embedding.
pub fn classify_change(remote: &RemoteRepo, local: &Repository) -> ChangeBucket {
    if remote.pushed_at != local.pushed_at || local.languages.is_empty() {
        return ChangeBucket::Heavy;
    }

    if remote.description != local.description
        || remote.primary_language != local.primary_language
    {
        return ChangeBucket::Text;
    }

    if remote.stargazer_count != local.stargazer_count
        || remote.fork_count != local.fork_count
        || remote.archived != local.archived
        || remote.visibility != local.visibility
        || remote.owner_type != local.owner_type
    {
        return ChangeBucket::Counters;
    }

    ChangeBucket::Unchanged
}

// ============================================================================
// SYNC REPORT
// ============================================================================

/// Outcome of one sync run
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub history_id: i64,
    pub kind: String,
    pub counters: SyncCounters,
}

// ============================================================================
// SYNC ENGINE
// ============================================================================

/// Orchestrates remote reconciliation
///
/// At most one sync runs at a time; a second invocation returns a
/// `Conflict` error rather than blocking.
pub struct SyncEngine {
    store: Arc<Store>,
    remote: Arc<dyn RemoteSource>,
    vectorizer: Arc<Vectorizer>,
    graph: Arc<GraphService>,
    run_lock: tokio::sync::Mutex<()>,
    stop_flag: AtomicBool,
    readme_max_chars: usize,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteSource>,
        vectorizer: Arc<Vectorizer>,
        graph: Arc<GraphService>,
        readme_max_chars: usize,
    ) -> Self {
        Self {
            store,
            remote,
            vectorizer,
            graph,
            run_lock: tokio::sync::Mutex::new(()),
            stop_flag: AtomicBool::new(false),
            readme_max_chars,
        }
    }

    /// Whether a sync is currently in flight
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Ask an in-flight sync to stop at the next repository boundary
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Run a sync, spawning post-hooks (embedding, semantic edges, full
    /// graph rebuild) in the background. Returns once the store is
    /// reconciled and the history row is closed.
    pub async fn sync(&self, mode: SyncMode) -> Result<SyncReport> {
        self.sync_inner(mode, false).await
    }

    /// As `sync`, but awaits the post-hooks before returning; used by tests
    /// and the manual reindex path where completion matters.
    pub async fn sync_and_wait(&self, mode: SyncMode) -> Result<SyncReport> {
        self.sync_inner(mode, true).await
    }

    async fn sync_inner(&self, mode: SyncMode, wait_for_hooks: bool) -> Result<SyncReport> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Err(Error::Conflict("sync already running".to_string()));
        };
        self.stop_flag.store(false, Ordering::Relaxed);

        let started = Utc::now();
        let history_id = self.store.open_history(mode.history_kind(), started)?;
        tracing::info!("Sync started: mode={:?} history_id={}", mode, history_id);

        let mut counters = SyncCounters::default();
        let outcome = self.reconcile(mode, &mut counters).await;

        match outcome {
            Ok(changed) => {
                self.store.close_history(history_id, counters, None)?;
                tracing::info!(
                    "Sync complete: added={} updated={} deleted={} failed={}",
                    counters.added,
                    counters.updated,
                    counters.deleted,
                    counters.failed
                );

                let hooks = Self::run_post_hooks(
                    Arc::clone(&self.store),
                    Arc::clone(&self.vectorizer),
                    Arc::clone(&self.graph),
                    mode,
                    changed,
                );
                if wait_for_hooks {
                    hooks.await;
                } else {
                    tokio::spawn(hooks);
                }

                Ok(SyncReport {
                    history_id,
                    kind: mode.history_kind().to_string(),
                    counters,
                })
            }
            Err(e) => {
                // The run still closes its history row on failure
                self.store
                    .close_history(history_id, counters, Some(&e.to_string()))?;
                tracing::error!("Sync failed: {}", e);
                Err(e)
            }
        }
    }

    /// The reconciliation critical path: store writes only, in small
    /// transactions; embedding and graph work is deferred to post-hooks.
    async fn reconcile(
        &self,
        mode: SyncMode,
        counters: &mut SyncCounters,
    ) -> Result<Vec<String>> {
        let since = if mode.is_full() {
            None
        } else {
            self.store.min_last_synced()?
        };

        let remote_repos = self.remote.list_starred(since).await?;
        let remote_map: HashMap<String, RemoteRepo> = remote_repos
            .into_iter()
            .map(|r| (r.name_with_owner(), r))
            .collect();
        let local_keys: HashSet<String> = self.store.live_keys()?.into_iter().collect();
        let remote_keys: HashSet<String> = remote_map.keys().cloned().collect();

        let mut changed: Vec<String> = Vec::new();

        // Removed first: upstream no longer lists them
        for key in local_keys.difference(&remote_keys) {
            if self.stopped()? {
                return Err(Error::Cancelled);
            }
            match self.remove_repository(key) {
                Ok(()) => counters.deleted += 1,
                Err(e) => {
                    tracing::warn!("Soft delete failed for {}: {}", key, e);
                    counters.failed += 1;
                }
            }
        }

        for (key, remote) in &remote_map {
            if self.stopped()? {
                return Err(Error::Cancelled);
            }

            let local = self.store.get_by_name(key)?;
            let result = match local {
                // Soft-deleted rows re-appear through the same added path
                Some(local) if !local.is_deleted => {
                    self.apply_change(key, remote, &local, mode, counters, &mut changed)
                        .await
                }
                _ => self.add_repository(key, remote, mode, counters, &mut changed).await,
            };
            if let Err(e) = result {
                tracing::warn!("Sync failed for {}: {}", key, e);
                counters.failed += 1;
            }
        }

        Ok(changed)
    }

    fn stopped(&self) -> Result<bool> {
        Ok(self.stop_flag.load(Ordering::Relaxed))
    }

    async fn add_repository(
        &self,
        key: &str,
        remote: &RemoteRepo,
        mode: SyncMode,
        counters: &mut SyncCounters,
        changed: &mut Vec<String>,
    ) -> Result<()> {
        let now = Utc::now();
        self.store.upsert_repository(remote, now)?;
        self.refresh_readme(remote).await?;
        if mode == SyncMode::FullReanalyze {
            self.store.set_needs_analysis(key, true)?;
        }
        counters.added += 1;
        changed.push(key.to_string());
        Ok(())
    }

    async fn apply_change(
        &self,
        key: &str,
        remote: &RemoteRepo,
        local: &Repository,
        mode: SyncMode,
        counters: &mut SyncCounters,
        changed: &mut Vec<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let bucket = classify_change(remote, local);
        tracing::debug!("{} classified {:?}", key, bucket);

        match bucket {
            ChangeBucket::Heavy => {
                self.store.upsert_repository(remote, now)?;
                self.refresh_readme(remote).await?;
                self.store.set_needs_analysis(key, true)?;
                counters.updated += 1;
                changed.push(key.to_string());
            }
            ChangeBucket::Text => {
                self.store.apply_text_update(key, remote, now)?;
                if remote.primary_language != local.primary_language {
                    self.store.set_needs_analysis(key, true)?;
                }
                counters.updated += 1;
                changed.push(key.to_string());
            }
            ChangeBucket::Counters => {
                self.store.apply_counter_update(key, remote, now)?;
                counters.updated += 1;
            }
            ChangeBucket::Unchanged => {
                self.store.touch_synced(key, now)?;
            }
        }

        if mode == SyncMode::FullReanalyze {
            self.store.set_needs_analysis(key, true)?;
        }
        Ok(())
    }

    /// Fetch and summarize the README; a missing README clears nothing
    async fn refresh_readme(&self, remote: &RemoteRepo) -> Result<()> {
        let readme = self
            .remote
            .fetch_readme(&remote.owner, &remote.name, remote.pushed_at)
            .await?;
        if let Some(raw) = readme {
            let summary = summarize_readme(&raw, self.readme_max_chars);
            self.store
                .set_readme_summary(&remote.name_with_owner(), &summary)?;
        }
        Ok(())
    }

    /// Soft-delete one repository and scrub its vector entry and semantic
    /// edges; annotations are untouched. Store row first, then vector,
    /// then edges.
    fn remove_repository(&self, key: &str) -> Result<()> {
        self.store.soft_delete(key)?;
        self.vectorizer.remove_repository(key)?;
        self.store.delete_semantic_edges_for(key)?;
        Ok(())
    }

    /// Post-sync work off the critical path: re-embedding changed
    /// repositories, refreshing their semantic edges, and (after a full
    /// sync) rebuilding the whole non-semantic graph. Failures are logged
    /// and retried naturally by the next sync.
    async fn run_post_hooks(
        store: Arc<Store>,
        vectorizer: Arc<Vectorizer>,
        graph: Arc<GraphService>,
        mode: SyncMode,
        mut changed: Vec<String>,
    ) {
        if changed.len() > POST_HOOK_QUEUE_CAP {
            let dropped = changed.len() - POST_HOOK_QUEUE_CAP;
            tracing::warn!(
                "Post-hook queue over capacity; dropping {} oldest entries until the next sync",
                dropped
            );
            changed.drain(..dropped);
        }

        for key in &changed {
            let repo = match store.get_by_name(key) {
                Ok(Some(repo)) if !repo.is_deleted => repo,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Post-hook load failed for {}: {}", key, e);
                    continue;
                }
            };

            match vectorizer.index_repository(&repo).await {
                Ok(true) => {
                    if let Err(e) = graph.refresh_semantic_for(key) {
                        tracing::warn!("Semantic edge refresh failed for {}: {}", key, e);
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Vectorization failed for {}: {}", key, e),
            }
        }

        if mode.is_full() {
            if let Err(e) = graph.rebuild_all() {
                tracing::warn!("Graph rebuild after full sync failed: {}", e);
            }
            if let Err(e) = store.optimize_fts() {
                tracing::warn!("FTS optimize failed: {}", e);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
