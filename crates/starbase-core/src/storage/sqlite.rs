//! SQLite Store Implementation
//!
//! Relational persistence for repositories, graph edges, user annotations,
//! and sync history, with an FTS5 index kept in lockstep via triggers.

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{
    Collection, EdgeKind, GraphEdge, RemoteRepo, RepoNote, Repository, SearchFilters,
    SyncCounters, SyncHistoryEntry, Tag,
};

/// Column list shared by every repository SELECT; `row_to_repo` maps it
/// positionally, so the two must stay in the same order.
const REPO_COLUMNS: &str = "id, owner, name, name_with_owner, description, readme_summary, \
     primary_language, languages, topics, homepage, stargazer_count, fork_count, \
     owner_type, archived, visibility, license, created_at, pushed_at, starred_at, \
     last_synced_at, last_analyzed_at, summary, categories, features, use_cases, \
     is_deleted, needs_analysis";

fn prefixed_repo_columns(prefix: &str) -> String {
    REPO_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", prefix, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Escape a user query into an FTS5 MATCH expression
///
/// Every whitespace token becomes a quoted phrase term; a trailing `*`
/// survives as an explicit prefix wildcard. Non-ASCII (e.g. CJK) is kept
/// verbatim inside the quotes.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .filter_map(|token| {
            let (body, prefix) = match token.strip_suffix('*') {
                Some(stripped) => (stripped, true),
                None => (token, false),
            };
            let cleaned: String = body
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || !c.is_ascii())
                .collect();
            if cleaned.is_empty() {
                None
            } else if prefix {
                Some(format!("\"{}\"*", cleaned))
            } else {
                Some(format!("\"{}\"", cleaned))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed store
///
/// Uses separate reader/writer connections for interior mutability. All
/// methods take `&self`, making the store `Send + Sync` so callers share it
/// as `Arc<Store>`.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store, applying pending migrations
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                p
            }
            None => {
                let proj_dirs = ProjectDirs::from("dev", "starbase", "starbase").ok_or_else(
                    || Error::Internal("could not determine project directories".to_string()),
                )?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("starbase.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| Error::Internal("writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| Error::Internal("reader lock poisoned".into()))
    }

    // ========================================================================
    // REPOSITORIES
    // ========================================================================

    /// Insert a repository from a remote snapshot, or overwrite every
    /// upstream field if it already exists. Re-observation of a
    /// soft-deleted row restores it.
    pub fn upsert_repository(&self, remote: &RemoteRepo, now: DateTime<Utc>) -> Result<Repository> {
        let name_with_owner = remote.name_with_owner();
        let languages = serde_json::to_string(&remote.languages)?;
        let topics = serde_json::to_string(&remote.topics)?;

        {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO repositories (
                    owner, name, name_with_owner, description, primary_language,
                    languages, topics, homepage, stargazer_count, fork_count,
                    owner_type, archived, visibility, license,
                    created_at, pushed_at, starred_at, last_synced_at, is_deleted
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17, ?18, 0
                )
                ON CONFLICT(name_with_owner) DO UPDATE SET
                    description = excluded.description,
                    primary_language = excluded.primary_language,
                    languages = excluded.languages,
                    topics = excluded.topics,
                    homepage = excluded.homepage,
                    stargazer_count = excluded.stargazer_count,
                    fork_count = excluded.fork_count,
                    owner_type = excluded.owner_type,
                    archived = excluded.archived,
                    visibility = excluded.visibility,
                    license = excluded.license,
                    created_at = excluded.created_at,
                    pushed_at = excluded.pushed_at,
                    starred_at = excluded.starred_at,
                    last_synced_at = excluded.last_synced_at,
                    is_deleted = 0",
                params![
                    remote.owner,
                    remote.name,
                    name_with_owner,
                    remote.description,
                    remote.primary_language,
                    languages,
                    topics,
                    remote.homepage,
                    remote.stargazer_count,
                    remote.fork_count,
                    remote.owner_type.as_str(),
                    remote.archived,
                    remote.visibility,
                    remote.license,
                    remote.created_at,
                    remote.pushed_at,
                    remote.starred_at,
                    now,
                ],
            )?;
        }

        self.get_by_name(&name_with_owner)?
            .ok_or_else(|| Error::NotFound(name_with_owner))
    }

    /// Overwrite only the counter/flag columns (stars, forks, archived,
    /// visibility, owner type); embeddings and analysis stay intact.
    pub fn apply_counter_update(
        &self,
        name_with_owner: &str,
        remote: &RemoteRepo,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE repositories SET
                stargazer_count = ?1, fork_count = ?2, archived = ?3,
                visibility = ?4, owner_type = ?5, last_synced_at = ?6
             WHERE name_with_owner = ?7",
            params![
                remote.stargazer_count,
                remote.fork_count,
                remote.archived,
                remote.visibility,
                remote.owner_type.as_str(),
                now,
                name_with_owner,
            ],
        )?;
        Ok(())
    }

    /// Overwrite the textual columns that feed the embedding (description,
    /// primary language) plus any changed counters.
    pub fn apply_text_update(
        &self,
        name_with_owner: &str,
        remote: &RemoteRepo,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE repositories SET
                description = ?1, primary_language = ?2,
                stargazer_count = ?3, fork_count = ?4, archived = ?5,
                visibility = ?6, owner_type = ?7, last_synced_at = ?8
             WHERE name_with_owner = ?9",
            params![
                remote.description,
                remote.primary_language,
                remote.stargazer_count,
                remote.fork_count,
                remote.archived,
                remote.visibility,
                remote.owner_type.as_str(),
                now,
                name_with_owner,
            ],
        )?;
        Ok(())
    }

    /// Bump `last_synced_at` without touching anything else
    pub fn touch_synced(&self, name_with_owner: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE repositories SET last_synced_at = ?1 WHERE name_with_owner = ?2",
            params![now, name_with_owner],
        )?;
        Ok(())
    }

    /// Store the filtered README extract
    pub fn set_readme_summary(&self, name_with_owner: &str, summary: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE repositories SET readme_summary = ?1 WHERE name_with_owner = ?2",
            params![summary, name_with_owner],
        )?;
        Ok(())
    }

    /// Flag a repository for re-analysis
    pub fn set_needs_analysis(&self, name_with_owner: &str, needs: bool) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE repositories SET needs_analysis = ?1 WHERE name_with_owner = ?2",
            params![needs, name_with_owner],
        )?;
        Ok(())
    }

    /// Record a completed analysis pass
    pub fn mark_analyzed(&self, name_with_owner: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE repositories SET last_analyzed_at = ?1, needs_analysis = 0
             WHERE name_with_owner = ?2",
            params![now, name_with_owner],
        )?;
        Ok(())
    }

    /// Soft-delete: the row and all annotations survive, default reads and
    /// the FTS index exclude it. Returns false if the key is unknown.
    pub fn soft_delete(&self, name_with_owner: &str) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE repositories SET is_deleted = 1 WHERE name_with_owner = ?1 AND is_deleted = 0",
            params![name_with_owner],
        )?;
        Ok(changed > 0)
    }

    /// Undo a soft delete
    pub fn restore(&self, name_with_owner: &str) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE repositories SET is_deleted = 0 WHERE name_with_owner = ?1 AND is_deleted = 1",
            params![name_with_owner],
        )?;
        Ok(changed > 0)
    }

    /// Fetch one repository by `owner/name`, live or deleted
    pub fn get_by_name(&self, name_with_owner: &str) -> Result<Option<Repository>> {
        let reader = self.reader()?;
        let sql = format!(
            "SELECT {} FROM repositories WHERE name_with_owner = ?1",
            REPO_COLUMNS
        );
        reader
            .query_row(&sql, params![name_with_owner], Self::row_to_repo)
            .optional()
            .map_err(Error::from)
    }

    /// Fetch one repository by row id
    pub fn get_by_id(&self, id: i64) -> Result<Option<Repository>> {
        let reader = self.reader()?;
        let sql = format!("SELECT {} FROM repositories WHERE id = ?1", REPO_COLUMNS);
        reader
            .query_row(&sql, params![id], Self::row_to_repo)
            .optional()
            .map_err(Error::from)
    }

    /// List live repositories, filtered, ordered by `starred_at` descending
    pub fn list_live(
        &self,
        filters: &SearchFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Repository>> {
        let (clause, bound) = Self::filter_sql(filters, Utc::now());
        let sql = format!(
            "SELECT {} FROM repositories WHERE {} ORDER BY starred_at DESC LIMIT {} OFFSET {}",
            REPO_COLUMNS, clause, limit, offset
        );

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(bound.iter().map(|p| p.as_ref())),
            Self::row_to_repo,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// All live repositories, unpaginated (graph rebuild snapshot)
    pub fn all_live(&self) -> Result<Vec<Repository>> {
        let reader = self.reader()?;
        let sql = format!(
            "SELECT {} FROM repositories WHERE is_deleted = 0 ORDER BY name_with_owner",
            REPO_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_repo)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Soft-deleted repositories
    pub fn list_deleted(&self) -> Result<Vec<Repository>> {
        let reader = self.reader()?;
        let sql = format!(
            "SELECT {} FROM repositories WHERE is_deleted = 1 ORDER BY name_with_owner",
            REPO_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_repo)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// `name_with_owner` keys of every live repository
    pub fn live_keys(&self) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT name_with_owner FROM repositories WHERE is_deleted = 0")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_live(&self) -> Result<i64> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT COUNT(*) FROM repositories WHERE is_deleted = 0",
                [],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    /// Live rows not synced since `since` (or never synced)
    pub fn count_pending_update(&self, since: DateTime<Utc>) -> Result<i64> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT COUNT(*) FROM repositories
                 WHERE is_deleted = 0 AND (last_synced_at IS NULL OR last_synced_at < ?1)",
                params![since],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    /// Oldest `last_synced_at` across live rows; the incremental sync bound
    pub fn min_last_synced(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT MIN(last_synced_at) FROM repositories WHERE is_deleted = 0",
                [],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    // ========================================================================
    // FULL-TEXT SEARCH
    // ========================================================================

    /// Lexical search over the FTS index
    ///
    /// Returns `(repository, raw_bm25)` where `raw_bm25` is positive and
    /// higher-is-better (the negated FTS5 rank). The search layer squashes
    /// it; ordering here is relevance first, then `starred_at`.
    pub fn full_text_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: i64,
    ) -> Result<Vec<(Repository, f32)>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }

        let (clause, mut bound) = Self::filter_sql(filters, Utc::now());
        let sql = format!(
            "SELECT {}, bm25(repositories_fts) AS rank
             FROM repositories_fts
             JOIN repositories r ON r.id = repositories_fts.rowid
             WHERE repositories_fts MATCH ?{} AND {}
             ORDER BY rank, r.starred_at DESC
             LIMIT {}",
            prefixed_repo_columns("r"),
            bound.len() + 1,
            clause.replace("is_deleted", "r.is_deleted"),
            limit
        );
        bound.push(Box::new(sanitized));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(bound.iter().map(|p| p.as_ref())),
            |row| {
                let repo = Self::row_to_repo(row)?;
                let rank: f64 = row.get(27)?;
                Ok((repo, (-rank).max(0.0) as f32))
            },
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Rows currently in the FTS index (equals the live count at rest)
    pub fn fts_row_count(&self) -> Result<i64> {
        let reader = self.reader()?;
        reader
            .query_row("SELECT COUNT(*) FROM repositories_fts", [], |row| row.get(0))
            .map_err(Error::from)
    }

    /// Merge FTS b-tree segments after bulk writes
    pub fn optimize_fts(&self) -> Result<()> {
        let writer = self.writer()?;
        writer.execute_batch(
            "INSERT INTO repositories_fts(repositories_fts) VALUES('optimize');",
        )?;
        Ok(())
    }

    /// Build the WHERE clause for a filter set
    ///
    /// Time-relative filters (`is_active`, `is_new`) are computed against
    /// `now` in Rust so both comparison operands use the same text format.
    fn filter_sql(
        filters: &SearchFilters,
        now: DateTime<Utc>,
    ) -> (String, Vec<Box<dyn ToSql + Send + Sync>>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut bound: Vec<Box<dyn ToSql + Send + Sync>> = Vec::new();

        match filters.is_deleted {
            Some(true) => clauses.push("is_deleted = 1".to_string()),
            _ => clauses.push("is_deleted = 0".to_string()),
        }

        if !filters.languages.is_empty() {
            let placeholders: Vec<String> = filters
                .languages
                .iter()
                .map(|lang| {
                    bound.push(Box::new(lang.clone()));
                    format!("?{}", bound.len())
                })
                .collect();
            clauses.push(format!("primary_language IN ({})", placeholders.join(", ")));
        }

        if let Some(min_stars) = filters.min_stars {
            bound.push(Box::new(min_stars));
            clauses.push(format!("stargazer_count >= ?{}", bound.len()));
        }

        if let Some(starred_after) = filters.starred_after {
            bound.push(Box::new(starred_after));
            clauses.push(format!("starred_at >= ?{}", bound.len()));
        }

        if let Some(owner_type) = filters.owner_type {
            bound.push(Box::new(owner_type.as_str()));
            clauses.push(format!("owner_type = ?{}", bound.len()));
        }

        if filters.is_active == Some(true) {
            bound.push(Box::new(now - Duration::days(7)));
            clauses.push(format!("pushed_at >= ?{}", bound.len()));
        }

        if filters.is_new == Some(true) {
            bound.push(Box::new(now - Duration::days(180)));
            clauses.push(format!("created_at >= ?{}", bound.len()));
        }

        if filters.exclude_archived {
            clauses.push("archived = 0".to_string());
        }

        (clauses.join(" AND "), bound)
    }

    fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
        let languages: String = row.get(7)?;
        let topics: String = row.get(8)?;
        let categories: String = row.get(22)?;
        let features: String = row.get(23)?;
        let use_cases: String = row.get(24)?;
        let owner_type: String = row.get(12)?;

        Ok(Repository {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            name_with_owner: row.get(3)?,
            description: row.get(4)?,
            readme_summary: row.get(5)?,
            primary_language: row.get(6)?,
            languages: serde_json::from_str(&languages).unwrap_or_default(),
            topics: serde_json::from_str(&topics).unwrap_or_default(),
            homepage: row.get(9)?,
            stargazer_count: row.get(10)?,
            fork_count: row.get(11)?,
            owner_type: crate::model::OwnerType::parse_name(&owner_type),
            archived: row.get(13)?,
            visibility: row.get(14)?,
            license: row.get(15)?,
            created_at: row.get(16)?,
            pushed_at: row.get(17)?,
            starred_at: row.get(18)?,
            last_synced_at: row.get(19)?,
            last_analyzed_at: row.get(20)?,
            summary: row.get(21)?,
            categories: serde_json::from_str(&categories).unwrap_or_default(),
            features: serde_json::from_str(&features).unwrap_or_default(),
            use_cases: serde_json::from_str(&use_cases).unwrap_or_default(),
            is_deleted: row.get(25)?,
            needs_analysis: row.get(26)?,
        })
    }

    // ========================================================================
    // GRAPH EDGES
    // ========================================================================

    /// Insert a batch of edges in one transaction, replacing duplicates
    pub fn insert_edges(&self, edges: &[GraphEdge]) -> Result<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO graph_edges (source, target, kind, weight, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for edge in edges {
                let metadata = if edge.metadata.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&edge.metadata)?)
                };
                stmt.execute(params![
                    edge.source,
                    edge.target,
                    edge.kind.as_str(),
                    edge.weight as f64,
                    metadata,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(edges.len())
    }

    /// Atomically clear every non-semantic edge and insert the replacement
    /// batch; used by the full graph rebuild.
    pub fn replace_non_semantic_edges(&self, edges: &[GraphEdge]) -> Result<usize> {
        let now = Utc::now();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM graph_edges WHERE kind != 'semantic'", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO graph_edges (source, target, kind, weight, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for edge in edges {
                let metadata = if edge.metadata.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&edge.metadata)?)
                };
                stmt.execute(params![
                    edge.source,
                    edge.target,
                    edge.kind.as_str(),
                    edge.weight as f64,
                    metadata,
                    now,
                ])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO graph_status (repo_id, edges_computed_at)
             SELECT id, ?1 FROM repositories WHERE is_deleted = 0",
            params![now],
        )?;
        tx.commit()?;
        Ok(edges.len())
    }

    /// Delete semantic edges with `id` as either endpoint
    pub fn delete_semantic_edges_for(&self, name_with_owner: &str) -> Result<usize> {
        let writer = self.writer()?;
        let deleted = writer.execute(
            "DELETE FROM graph_edges WHERE kind = 'semantic' AND (source = ?1 OR target = ?1)",
            params![name_with_owner],
        )?;
        Ok(deleted)
    }

    /// Delete every edge touching `id`, any kind (soft-delete cleanup)
    pub fn delete_edges_touching(&self, name_with_owner: &str) -> Result<usize> {
        let writer = self.writer()?;
        let deleted = writer.execute(
            "DELETE FROM graph_edges WHERE source = ?1 OR target = ?1",
            params![name_with_owner],
        )?;
        Ok(deleted)
    }

    /// Delete all semantic edges (semantic rebuild)
    pub fn clear_semantic_edges(&self) -> Result<usize> {
        let writer = self.writer()?;
        let deleted = writer.execute("DELETE FROM graph_edges WHERE kind = 'semantic'", [])?;
        Ok(deleted)
    }

    /// Edges touching `id` as either endpoint, heaviest first
    ///
    /// Edges are undirected in meaning, so recall must look at both
    /// endpoint columns; an empty `kinds` slice means every kind.
    pub fn edges_for(
        &self,
        name_with_owner: &str,
        kinds: &[EdgeKind],
        limit: i64,
    ) -> Result<Vec<GraphEdge>> {
        let kind_clause = if kinds.is_empty() {
            String::new()
        } else {
            let list = kinds
                .iter()
                .map(|k| format!("'{}'", k.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("AND kind IN ({})", list)
        };
        let sql = format!(
            "SELECT source, target, kind, weight, metadata FROM graph_edges
             WHERE (source = ?1 OR target = ?1) {}
             ORDER BY weight DESC LIMIT {}",
            kind_clause, limit
        );

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(params![name_with_owner], Self::row_to_edge)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Edge counts grouped by kind
    pub fn edge_counts(&self) -> Result<Vec<(String, i64)>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT kind, COUNT(*) FROM graph_edges GROUP BY kind ORDER BY kind")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Most recent `edges_computed_at` across live repositories
    pub fn last_edges_computed(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        reader
            .query_row("SELECT MAX(edges_computed_at) FROM graph_status", [], |row| {
                row.get(0)
            })
            .map_err(Error::from)
    }

    fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
        let kind: String = row.get(2)?;
        let metadata: Option<String> = row.get(4)?;
        Ok(GraphEdge {
            source: row.get(0)?,
            target: row.get(1)?,
            kind: EdgeKind::parse_name(&kind).unwrap_or(EdgeKind::Ecosystem),
            weight: row.get::<_, f64>(3)? as f32,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }

    // ========================================================================
    // USER ANNOTATIONS
    // ========================================================================

    /// Create a collection (position appended at the end)
    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        let now = Utc::now();
        let id = {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO collections (name, position, created_at)
                 VALUES (?1, (SELECT COALESCE(MAX(position), -1) + 1 FROM collections), ?2)",
                params![name, now],
            )?;
            writer.last_insert_rowid()
        };
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT id, name, position, created_at FROM collections WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Collection {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        position: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .map_err(Error::from)
    }

    /// Add a repository to a collection
    pub fn add_to_collection(&self, collection_id: i64, repo_id: i64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR IGNORE INTO repo_collections (collection_id, repo_id, position)
             VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(position), -1) + 1 FROM repo_collections WHERE collection_id = ?1))",
            params![collection_id, repo_id],
        )?;
        Ok(())
    }

    /// `(collection_id, name_with_owner)` pairs for live members, ordered;
    /// the edge-discovery input for collection edges.
    pub fn collection_members(&self) -> Result<Vec<(i64, String)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT rc.collection_id, r.name_with_owner
             FROM repo_collections rc
             JOIN repositories r ON r.id = rc.repo_id
             WHERE r.is_deleted = 0
             ORDER BY rc.collection_id, rc.position",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Create a tag if absent, returning its id
    pub fn ensure_tag(&self, name: &str) -> Result<i64> {
        let writer = self.writer()?;
        writer.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
        writer
            .query_row("SELECT id FROM tags WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .map_err(Error::from)
    }

    /// Attach a tag to a repository
    pub fn tag_repo(&self, tag_id: i64, repo_id: i64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR IGNORE INTO repo_tags (tag_id, repo_id) VALUES (?1, ?2)",
            params![tag_id, repo_id],
        )?;
        Ok(())
    }

    /// Tags attached to a repository
    pub fn tags_for(&self, repo_id: i64) -> Result<Vec<Tag>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT t.id, t.name FROM tags t
             JOIN repo_tags rt ON rt.tag_id = t.id
             WHERE rt.repo_id = ?1 ORDER BY t.name",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok(Tag {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Create or update the note for a repository
    pub fn upsert_note(&self, repo_id: i64, body: &str, rating: i32) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(Error::InputInvalid(format!(
                "rating must be 1-5, got {}",
                rating
            )));
        }
        let now = Utc::now();
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE repo_notes SET body = ?1, rating = ?2, updated_at = ?3 WHERE repo_id = ?4",
            params![body, rating, now, repo_id],
        )?;
        if changed == 0 {
            writer.execute(
                "INSERT INTO repo_notes (repo_id, body, rating, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![repo_id, body, rating, now],
            )?;
        }
        Ok(())
    }

    /// Notes attached to a repository
    pub fn notes_for(&self, repo_id: i64) -> Result<Vec<RepoNote>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, repo_id, body, rating, updated_at FROM repo_notes
             WHERE repo_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok(RepoNote {
                id: row.get(0)?,
                repo_id: row.get(1)?,
                body: row.get(2)?,
                rating: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Collection memberships of a repository
    pub fn collections_for(&self, repo_id: i64) -> Result<Vec<Collection>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT c.id, c.name, c.position, c.created_at FROM collections c
             JOIN repo_collections rc ON rc.collection_id = c.id
             WHERE rc.repo_id = ?1 ORDER BY c.position",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok(Collection {
                id: row.get(0)?,
                name: row.get(1)?,
                position: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ========================================================================
    // SYNC HISTORY
    // ========================================================================

    /// Open a history row with `completed_at = NULL`, returning its id
    pub fn open_history(&self, kind: &str, started_at: DateTime<Utc>) -> Result<i64> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO sync_history (kind, started_at) VALUES (?1, ?2)",
            params![kind, started_at],
        )?;
        Ok(writer.last_insert_rowid())
    }

    /// Close a history row: freeze counters, set `completed_at`, record any
    /// error. Already-closed rows are immutable; closing twice is a no-op.
    pub fn close_history(
        &self,
        id: i64,
        counters: SyncCounters,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sync_history SET
                completed_at = ?1, added = ?2, updated = ?3, deleted = ?4,
                failed = ?5, error_message = ?6
             WHERE id = ?7 AND completed_at IS NULL",
            params![
                now,
                counters.added,
                counters.updated,
                counters.deleted,
                counters.failed,
                error_message,
                id,
            ],
        )?;
        Ok(())
    }

    /// Most recent history rows, newest first
    pub fn list_history(&self, limit: i64) -> Result<Vec<SyncHistoryEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, kind, started_at, completed_at, added, updated, deleted, failed, error_message
             FROM sync_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], Self::row_to_history)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// The newest completed history row, if any
    pub fn last_completed_sync(&self) -> Result<Option<SyncHistoryEntry>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT id, kind, started_at, completed_at, added, updated, deleted, failed, error_message
                 FROM sync_history WHERE completed_at IS NOT NULL ORDER BY id DESC LIMIT 1",
                [],
                Self::row_to_history,
            )
            .optional()
            .map_err(Error::from)
    }

    fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncHistoryEntry> {
        Ok(SyncHistoryEntry {
            id: row.get(0)?,
            kind: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            added: row.get(4)?,
            updated: row.get(5)?,
            deleted: row.get(6)?,
            failed: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    /// Checkpoint the WAL (graceful shutdown)
    pub fn checkpoint(&self) -> Result<()> {
        let writer = self.writer()?;
        writer.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerType;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(dir.path().join("test.db"))).unwrap();
        (dir, store)
    }

    fn remote(owner: &str, name: &str) -> RemoteRepo {
        RemoteRepo {
            owner: owner.to_string(),
            name: name.to_string(),
            description: Some("Small CLI".to_string()),
            primary_language: Some("Go".to_string()),
            languages: vec!["Go".to_string()],
            topics: vec!["cli".to_string(), "tool".to_string()],
            homepage: None,
            stargazer_count: 42,
            fork_count: 3,
            owner_type: OwnerType::Organization,
            archived: false,
            visibility: "public".to_string(),
            license: Some("MIT".to_string()),
            created_at: Some(Utc::now() - Duration::days(400)),
            pushed_at: Some(Utc::now() - Duration::days(2)),
            starred_at: Some(Utc::now() - Duration::days(30)),
        }
    }

    #[test]
    fn test_upsert_round_trip() {
        let (_dir, store) = test_store();
        let r = remote("acme", "widget");
        let saved = store.upsert_repository(&r, Utc::now()).unwrap();

        assert_eq!(saved.name_with_owner, "acme/widget");
        assert_eq!(saved.description.as_deref(), Some("Small CLI"));
        assert_eq!(saved.stargazer_count, 42);
        assert_eq!(saved.owner_type, OwnerType::Organization);
        assert_eq!(saved.topics, vec!["cli", "tool"]);
        assert!(!saved.is_deleted);
        assert!(saved.last_synced_at.is_some());
    }

    #[test]
    fn test_upsert_is_idempotent_on_key() {
        let (_dir, store) = test_store();
        let r = remote("acme", "widget");
        store.upsert_repository(&r, Utc::now()).unwrap();
        store.upsert_repository(&r, Utc::now()).unwrap();
        assert_eq!(store.count_live().unwrap(), 1);
    }

    #[test]
    fn test_soft_delete_preserves_annotations_and_restores() {
        let (_dir, store) = test_store();
        let saved = store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();

        let coll = store.create_collection("favorites").unwrap();
        store.add_to_collection(coll.id, saved.id).unwrap();
        let tag = store.ensure_tag("rust").unwrap();
        store.tag_repo(tag, saved.id).unwrap();
        store.upsert_note(saved.id, "great tool", 5).unwrap();

        assert!(store.soft_delete("acme/widget").unwrap());
        assert_eq!(store.count_live().unwrap(), 0);
        assert_eq!(store.list_deleted().unwrap().len(), 1);

        // Annotations survive the soft delete
        assert_eq!(store.notes_for(saved.id).unwrap().len(), 1);
        assert_eq!(store.tags_for(saved.id).unwrap().len(), 1);
        assert_eq!(store.collections_for(saved.id).unwrap().len(), 1);

        assert!(store.restore("acme/widget").unwrap());
        let back = store.get_by_name("acme/widget").unwrap().unwrap();
        assert!(!back.is_deleted);
        assert_eq!(store.notes_for(saved.id).unwrap()[0].rating, 5);
    }

    #[test]
    fn test_fts_count_tracks_live_count() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();
        store.upsert_repository(&remote("acme", "gadget"), Utc::now()).unwrap();
        assert_eq!(store.fts_row_count().unwrap(), store.count_live().unwrap());

        store.soft_delete("acme/widget").unwrap();
        assert_eq!(store.fts_row_count().unwrap(), store.count_live().unwrap());

        store.restore("acme/widget").unwrap();
        assert_eq!(store.fts_row_count().unwrap(), store.count_live().unwrap());
    }

    #[test]
    fn test_full_text_search_finds_by_description() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();
        let mut other = remote("beta", "daemon");
        other.description = Some("Distributed task queue".to_string());
        store.upsert_repository(&other, Utc::now()).unwrap();

        let hits = store
            .full_text_search("task queue", &SearchFilters::default(), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.name_with_owner, "beta/daemon");
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn test_full_text_search_prefix_requires_wildcard() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();

        let without = store
            .full_text_search("widg", &SearchFilters::default(), 10)
            .unwrap();
        assert!(without.is_empty());

        let with = store
            .full_text_search("widg*", &SearchFilters::default(), 10)
            .unwrap();
        assert_eq!(with.len(), 1);
    }

    #[test]
    fn test_search_respects_filters() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();
        let mut rusty = remote("beta", "oxide");
        rusty.primary_language = Some("Rust".to_string());
        rusty.stargazer_count = 900;
        store.upsert_repository(&rusty, Utc::now()).unwrap();

        let filters = SearchFilters {
            languages: vec!["Rust".to_string()],
            ..Default::default()
        };
        let listed = store.list_live(&filters, 50, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_with_owner, "beta/oxide");

        let filters = SearchFilters {
            min_stars: Some(100),
            ..Default::default()
        };
        let listed = store.list_live(&filters, 50, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stargazer_count, 900);
    }

    #[test]
    fn test_counter_update_leaves_text_alone() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();
        store.set_readme_summary("acme/widget", "a fine readme").unwrap();

        let mut bumped = remote("acme", "widget");
        bumped.stargazer_count = 57;
        store
            .apply_counter_update("acme/widget", &bumped, Utc::now())
            .unwrap();

        let repo = store.get_by_name("acme/widget").unwrap().unwrap();
        assert_eq!(repo.stargazer_count, 57);
        assert_eq!(repo.readme_summary.as_deref(), Some("a fine readme"));
        assert_eq!(repo.description.as_deref(), Some("Small CLI"));
    }

    #[test]
    fn test_edges_round_trip_and_both_directions() {
        let (_dir, store) = test_store();
        let edges = vec![
            GraphEdge::new("acme/widget", "acme/gadget", EdgeKind::Author, 1.0),
            GraphEdge::new("acme/widget", "beta/oxide", EdgeKind::Ecosystem, 0.6),
        ];
        store.insert_edges(&edges).unwrap();

        let all = store.edges_for("acme/widget", &[], 10).unwrap();
        assert_eq!(all.len(), 2);

        // target-side lookup works too
        let reverse = store.edges_for("beta/oxide", &[], 10).unwrap();
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].other_endpoint("beta/oxide"), Some("acme/widget"));

        let authors = store.edges_for("acme/widget", &[EdgeKind::Author], 10).unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].weight, 1.0);
    }

    #[test]
    fn test_replace_non_semantic_preserves_semantic() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();
        store
            .insert_edges(&[
                GraphEdge::new("acme/widget", "beta/oxide", EdgeKind::Semantic, 0.8),
                GraphEdge::new("acme/widget", "acme/gadget", EdgeKind::Author, 1.0),
            ])
            .unwrap();

        store
            .replace_non_semantic_edges(&[GraphEdge::new(
                "acme/widget",
                "gamma/hub",
                EdgeKind::Collection,
                0.5,
            )])
            .unwrap();

        let remaining = store.edges_for("acme/widget", &[], 10).unwrap();
        let kinds: Vec<EdgeKind> = remaining.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EdgeKind::Semantic));
        assert!(kinds.contains(&EdgeKind::Collection));
        assert!(!kinds.contains(&EdgeKind::Author));
        assert!(store.last_edges_computed().unwrap().is_some());
    }

    #[test]
    fn test_history_lifecycle() {
        let (_dir, store) = test_store();
        let started = Utc::now();
        let id = store.open_history("incremental", started).unwrap();

        let open = store.list_history(10).unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].completed_at.is_none());

        let counters = SyncCounters {
            added: 1,
            updated: 2,
            deleted: 0,
            failed: 0,
        };
        store.close_history(id, counters, None).unwrap();

        let closed = store.last_completed_sync().unwrap().unwrap();
        assert_eq!(closed.added, 1);
        assert_eq!(closed.updated, 2);
        assert!(closed.completed_at.unwrap() > closed.started_at - Duration::seconds(1));

        // closed rows are immutable
        store
            .close_history(id, SyncCounters { added: 99, ..Default::default() }, Some("late"))
            .unwrap();
        let unchanged = store.last_completed_sync().unwrap().unwrap();
        assert_eq!(unchanged.added, 1);
        assert!(unchanged.error_message.is_none());
    }

    #[test]
    fn test_sanitize_fts_query() {
        assert_eq!(sanitize_fts_query("task queue"), "\"task\" \"queue\"");
        assert_eq!(sanitize_fts_query("widg*"), "\"widg\"*");
        assert_eq!(sanitize_fts_query("rust\" OR 1=1"), "\"rust\" \"OR\" \"11\"");
        assert_eq!(sanitize_fts_query("后台任务"), "\"后台任务\"");
        assert_eq!(sanitize_fts_query("  "), "");
    }

    #[test]
    fn test_count_pending_update() {
        let (_dir, store) = test_store();
        store.upsert_repository(&remote("acme", "widget"), Utc::now()).unwrap();
        assert_eq!(store.count_pending_update(Utc::now() - Duration::hours(1)).unwrap(), 0);
        assert_eq!(store.count_pending_update(Utc::now() + Duration::hours(1)).unwrap(), 1);
    }
}
