//! Database Migrations
//!
//! Numbered SQL batches applied in order at startup and tracked in the
//! `_migrations` table. A failing migration rolls back and aborts startup.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: repositories, FTS5 index, sync history",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Relationship graph: edges and per-repo status",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "User annotations: collections, tags, notes",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "Analysis expansion: features, use cases, re-analysis marks",
        up: MIGRATION_V4_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: repositories, FTS5 mirror, sync history
///
/// The FTS table is external-content over `repositories` and indexes ONLY
/// live rows: every trigger gates on `is_deleted` so soft deletion drops
/// the row from the index and restoration re-adds it.
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    name_with_owner TEXT NOT NULL UNIQUE,
    description TEXT,
    readme_summary TEXT,
    primary_language TEXT,
    languages TEXT NOT NULL DEFAULT '[]',
    topics TEXT NOT NULL DEFAULT '[]',
    homepage TEXT,
    stargazer_count INTEGER NOT NULL DEFAULT 0,
    fork_count INTEGER NOT NULL DEFAULT 0,
    owner_type TEXT NOT NULL DEFAULT 'user',
    archived INTEGER NOT NULL DEFAULT 0,
    visibility TEXT NOT NULL DEFAULT 'public',
    license TEXT,
    created_at TEXT,
    pushed_at TEXT,
    starred_at TEXT,
    last_synced_at TEXT,
    last_analyzed_at TEXT,

    -- Analysis-derived fields
    summary TEXT,
    categories TEXT NOT NULL DEFAULT '[]',

    is_deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_repos_owner ON repositories(owner);
CREATE INDEX IF NOT EXISTS idx_repos_language ON repositories(primary_language);
CREATE INDEX IF NOT EXISTS idx_repos_starred ON repositories(starred_at);
CREATE INDEX IF NOT EXISTS idx_repos_deleted ON repositories(is_deleted);
CREATE INDEX IF NOT EXISTS idx_repos_synced ON repositories(last_synced_at);

-- FTS5 virtual table, kept in lockstep with repositories via triggers.
-- Writers never touch it directly.
CREATE VIRTUAL TABLE IF NOT EXISTS repositories_fts USING fts5(
    name,
    name_with_owner,
    description,
    summary,
    categories,
    content='repositories',
    content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS repos_ai AFTER INSERT ON repositories
WHEN NEW.is_deleted = 0 BEGIN
    INSERT INTO repositories_fts(rowid, name, name_with_owner, description, summary, categories)
    VALUES (NEW.id, NEW.name, NEW.name_with_owner, NEW.description, NEW.summary, NEW.categories);
END;

CREATE TRIGGER IF NOT EXISTS repos_ad AFTER DELETE ON repositories
WHEN OLD.is_deleted = 0 BEGIN
    INSERT INTO repositories_fts(repositories_fts, rowid, name, name_with_owner, description, summary, categories)
    VALUES ('delete', OLD.id, OLD.name, OLD.name_with_owner, OLD.description, OLD.summary, OLD.categories);
END;

CREATE TRIGGER IF NOT EXISTS repos_au_del AFTER UPDATE ON repositories
WHEN OLD.is_deleted = 0 BEGIN
    INSERT INTO repositories_fts(repositories_fts, rowid, name, name_with_owner, description, summary, categories)
    VALUES ('delete', OLD.id, OLD.name, OLD.name_with_owner, OLD.description, OLD.summary, OLD.categories);
END;

CREATE TRIGGER IF NOT EXISTS repos_au_ins AFTER UPDATE ON repositories
WHEN NEW.is_deleted = 0 BEGIN
    INSERT INTO repositories_fts(rowid, name, name_with_owner, description, summary, categories)
    VALUES (NEW.id, NEW.name, NEW.name_with_owner, NEW.description, NEW.summary, NEW.categories);
END;

CREATE TABLE IF NOT EXISTS sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    added INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_started ON sync_history(started_at);
"#;

/// V2: relationship graph
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS graph_edges (
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    kind TEXT NOT NULL,
    weight REAL NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source, target, kind)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON graph_edges(source);
CREATE INDEX IF NOT EXISTS idx_edges_target ON graph_edges(target);
CREATE INDEX IF NOT EXISTS idx_edges_kind ON graph_edges(kind);

-- Per-repository edge bookkeeping
CREATE TABLE IF NOT EXISTS graph_status (
    repo_id INTEGER PRIMARY KEY REFERENCES repositories(id),
    edges_computed_at TEXT
);
"#;

/// V3: user annotations
///
/// No ON DELETE CASCADE anywhere: repositories are only ever soft-deleted,
/// and annotations must survive that.
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    position INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repo_collections (
    collection_id INTEGER NOT NULL REFERENCES collections(id),
    repo_id INTEGER NOT NULL REFERENCES repositories(id),
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (collection_id, repo_id)
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS repo_tags (
    tag_id INTEGER NOT NULL REFERENCES tags(id),
    repo_id INTEGER NOT NULL REFERENCES repositories(id),
    PRIMARY KEY (tag_id, repo_id)
);

CREATE TABLE IF NOT EXISTS repo_notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id INTEGER NOT NULL REFERENCES repositories(id),
    body TEXT NOT NULL,
    rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notes_repo ON repo_notes(repo_id);
"#;

/// V4: analysis expansion
const MIGRATION_V4_UP: &str = r#"
ALTER TABLE repositories ADD COLUMN features TEXT NOT NULL DEFAULT '[]';
ALTER TABLE repositories ADD COLUMN use_cases TEXT NOT NULL DEFAULT '[]';
ALTER TABLE repositories ADD COLUMN needs_analysis INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_repos_needs_analysis ON repositories(needs_analysis);
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .or(Ok(0))
}

/// Apply pending migrations, each inside its own transaction
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );

            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration.up)?;
            tx.execute(
                "INSERT INTO _migrations (version, description, applied_at)
                 VALUES (?1, ?2, datetime('now'))",
                rusqlite::params![migration.version, migration.description],
            )?;
            tx.commit()?;

            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), MIGRATIONS.last().unwrap().version);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_fts_indexes_only_live_rows() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO repositories (owner, name, name_with_owner, description)
             VALUES ('acme', 'widget', 'acme/widget', 'Small CLI')",
            [],
        )
        .unwrap();
        let fts_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM repositories_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts_count, 1);

        conn.execute("UPDATE repositories SET is_deleted = 1 WHERE name_with_owner = 'acme/widget'", [])
            .unwrap();
        let fts_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM repositories_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts_count, 0);

        conn.execute("UPDATE repositories SET is_deleted = 0 WHERE name_with_owner = 'acme/widget'", [])
            .unwrap();
        let fts_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM repositories_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts_count, 1);
    }
}
