//! Vectorization Service
//!
//! Builds the compact text representation for each repository, drives the
//! embedder, and keeps the vector index in step. Only this service writes
//! the vector index.

use std::sync::{Arc, Mutex};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::model::Repository;
use crate::vector::{VectorDocument, VectorIndex, VectorMetadata};

/// Repositories with less derived text than this are skipped
const MIN_TEXT_CHARS: usize = 10;

/// Filtered summaries shorter than this fall back to the raw head
const MIN_SUMMARY_CHARS: usize = 50;

/// Length of the raw-README fallback
const FALLBACK_CHARS: usize = 200;

/// Section headings dropped from README summaries, lowercase, with common
/// translations. Matched by substring against the heading text.
const DENIED_HEADINGS: &[&str] = &[
    "installation",
    "install",
    "contributing",
    "contribution",
    "license",
    "licence",
    "changelog",
    "tests",
    "testing",
    "development",
    "faq",
    "donate",
    "donation",
    "sponsor",
    "authors",
    "acknowledgements",
    "acknowledgments",
    // zh
    "安装",
    "贡献",
    "许可证",
    "更新日志",
    "测试",
    "开发",
    "常见问题",
    "捐赠",
    "作者",
    "致谢",
    // es / fr / de
    "instalación",
    "contribución",
    "licencia",
    "contribuer",
    "licence",
    "installieren",
    "mitwirken",
    "lizenz",
];

// ============================================================================
// README FILTER
// ============================================================================

/// Whether a heading belongs to a section the summary should drop
fn is_denied_heading(heading: &str) -> bool {
    let lowered = heading.to_lowercase();
    DENIED_HEADINGS.iter().any(|deny| lowered.contains(deny))
}

/// Remove Markdown image spans (`![alt](url)`), including badge rows where
/// the image is itself wrapped in a link.
fn strip_badge_images(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(start) = rest.find("![") {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        // span ends at the ')' closing the (url) part
        let Some(mid) = after.find("](") else {
            out.push_str(after);
            rest = "";
            break;
        };
        let Some(end) = after[mid..].find(')') else {
            out.push_str(after);
            rest = "";
            break;
        };
        rest = &after[mid + end + 1..];
    }
    out.push_str(rest);

    // Unwrap leftover empty links: "[](https://...)" from linked badges
    let trimmed = out.trim();
    if trimmed
        .chars()
        .all(|c| matches!(c, '[' | ']' | '(' | ')' | '!' | ' ') )
        && !trimmed.is_empty()
    {
        return String::new();
    }
    while let Some(start) = out.find("[](") {
        if let Some(end) = out[start..].find(')') {
            out.replace_range(start..start + end + 1, "");
        } else {
            break;
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Section-aware README summary
///
/// Drops deny-listed sections, strips badge images, truncates to
/// `max_chars`; a result shorter than 50 characters falls back to the
/// first 200 characters of the raw input.
pub fn summarize_readme(raw: &str, max_chars: usize) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut skipping = false;

    for line in raw.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            let heading = trimmed.trim_start_matches('#').trim();
            skipping = is_denied_heading(heading);
            if skipping {
                continue;
            }
        }
        if skipping {
            continue;
        }
        let cleaned = strip_badge_images(line);
        if cleaned.trim().is_empty() && kept.last().is_none_or(|l| l.trim().is_empty()) {
            continue;
        }
        kept.push(cleaned);
    }

    let filtered = truncate_chars(kept.join("\n").trim(), max_chars);
    if filtered.chars().count() < MIN_SUMMARY_CHARS {
        return truncate_chars(raw.trim(), FALLBACK_CHARS);
    }
    filtered
}

// ============================================================================
// VECTORIZER
// ============================================================================

/// Drives the embedder and the vector index for repository text
pub struct Vectorizer {
    embedder: Arc<dyn Embedder>,
    index: Arc<Mutex<VectorIndex>>,
}

impl Vectorizer {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<Mutex<VectorIndex>>) -> Self {
        Self { embedder, index }
    }

    fn metadata_for(repo: &Repository) -> VectorMetadata {
        VectorMetadata {
            language: repo.primary_language.clone(),
            stars: repo.stargazer_count,
            owner: repo.owner.clone(),
            topics: repo.topics.join(","),
        }
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, VectorIndex>> {
        self.index
            .lock()
            .map_err(|_| Error::Internal("vector index lock poisoned".into()))
    }

    /// Embed one repository and upsert its vector entry
    ///
    /// Returns false (without error) when the derived text is too short or
    /// the embedder yields nothing.
    pub async fn index_repository(&self, repo: &Repository) -> Result<bool> {
        let text = repo.embedding_text();
        if text.chars().count() < MIN_TEXT_CHARS {
            tracing::debug!("Skipping {}: derived text too short", repo.name_with_owner);
            return Ok(false);
        }

        let vector = self.embedder.embed(&text).await;
        if vector.is_empty() {
            tracing::warn!(
                "No embedding for {}; leaving vector entry as-is",
                repo.name_with_owner
            );
            return Ok(false);
        }

        let doc = VectorDocument {
            metadata: Self::metadata_for(repo),
            text,
            vector: vector.clone(),
        };
        {
            let mut index = self.lock_index()?;
            index.upsert(&repo.name_with_owner, vector, doc)?;
            index.save()?;
        }
        Ok(true)
    }

    /// Embed a batch of repositories; returns how many were indexed
    pub async fn index_batch(&self, repos: &[Repository]) -> Result<usize> {
        let eligible: Vec<&Repository> = repos
            .iter()
            .filter(|r| r.embedding_text().chars().count() >= MIN_TEXT_CHARS)
            .collect();
        if eligible.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = eligible.iter().map(|r| r.embedding_text()).collect();
        let vectors = self.embedder.embed_batch(&texts).await;

        let mut entries = Vec::new();
        for ((repo, text), vector) in eligible.iter().zip(texts).zip(vectors) {
            if vector.is_empty() {
                tracing::warn!("No embedding for {} in batch", repo.name_with_owner);
                continue;
            }
            let doc = VectorDocument {
                metadata: Self::metadata_for(repo),
                text,
                vector: vector.clone(),
            };
            entries.push((repo.name_with_owner.clone(), vector, doc));
        }

        let stored = {
            let mut index = self.lock_index()?;
            let stored = index.upsert_batch(entries)?;
            index.save()?;
            stored
        };
        Ok(stored)
    }

    /// Drop the vector entry for a repository (soft delete)
    pub fn remove_repository(&self, name_with_owner: &str) -> Result<bool> {
        let mut index = self.lock_index()?;
        let removed = index.delete(name_with_owner)?;
        index.save()?;
        Ok(removed)
    }

    /// Indexed entry count
    pub fn count(&self) -> Result<usize> {
        Ok(self.lock_index()?.count())
    }

    /// Embed a free-text query (hybrid search / recommendations)
    pub async fn embed_query(&self, query: &str) -> Vec<f32> {
        self.embedder.embed(query).await
    }

    /// Embedder reachability
    pub async fn embedder_healthy(&self) -> bool {
        self.embedder.health().await
    }

    pub fn embedder_model(&self) -> String {
        self.embedder.model_name().to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerType;
    use crate::testutil::FakeEmbedder;

    fn repo(name: &str, description: &str, summary: &str) -> Repository {
        Repository {
            id: 1,
            owner: "acme".into(),
            name: name.into(),
            name_with_owner: format!("acme/{}", name),
            description: Some(description.into()),
            readme_summary: Some(summary.into()),
            primary_language: Some("Go".into()),
            languages: vec!["Go".into()],
            topics: vec!["cli".into()],
            homepage: None,
            stargazer_count: 42,
            fork_count: 1,
            owner_type: OwnerType::User,
            archived: false,
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
        }
    }

    fn vectorizer() -> Vectorizer {
        Vectorizer::new(
            Arc::new(FakeEmbedder::default()),
            Arc::new(Mutex::new(VectorIndex::in_memory().unwrap())),
        )
    }

    #[tokio::test]
    async fn test_index_repository_and_requery() {
        let v = vectorizer();
        let r = repo("widget", "Small CLI for tasks", "Manages background jobs");
        assert!(v.index_repository(&r).await.unwrap());
        assert_eq!(v.count().unwrap(), 1);

        // The same text must come back as the top hit
        let query = v.embed_query(&r.embedding_text()).await;
        let index = v.index.lock().unwrap();
        let hits = index.query(&query, 3, None).unwrap();
        assert_eq!(hits[0].key, "acme/widget");
        assert!(hits[0].similarity >= 0.99);
    }

    #[tokio::test]
    async fn test_short_text_skipped() {
        let v = vectorizer();
        let mut r = repo("x", "", "");
        r.description = None;
        r.readme_summary = None;
        assert!(!v.index_repository(&r).await.unwrap());
        assert_eq!(v.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_index_batch_counts_only_indexed() {
        let v = vectorizer();
        let good = repo("widget", "Small CLI for tasks", "Manages background jobs");
        let mut empty = repo("y", "", "");
        empty.description = None;
        empty.readme_summary = None;

        let stored = v.index_batch(&[good, empty]).await.unwrap();
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn test_remove_repository() {
        let v = vectorizer();
        let r = repo("widget", "Small CLI for tasks", "Manages background jobs");
        v.index_repository(&r).await.unwrap();
        assert!(v.remove_repository("acme/widget").unwrap());
        assert!(!v.remove_repository("acme/widget").unwrap());
        assert_eq!(v.count().unwrap(), 0);
    }

    #[test]
    fn test_summary_drops_denied_sections() {
        let readme = "Intro paragraph about the project and what it does for you.\n\n\
            # Features\nFast and small and reliable, with many capabilities listed.\n\n\
            # Installation\nRun cargo install to get going.\n\n\
            # Usage\nInvoke the binary with a subcommand to start working.\n\n\
            # License\nMIT";
        let summary = summarize_readme(readme, 500);
        assert!(summary.contains("Intro paragraph"));
        assert!(summary.contains("Fast and small"));
        assert!(summary.contains("Invoke the binary"));
        assert!(!summary.contains("cargo install"));
        assert!(!summary.contains("MIT"));
    }

    #[test]
    fn test_summary_drops_translated_sections() {
        let readme = "一个小工具，用来管理后台任务，功能完整，性能可靠，适合日常使用。\n\n\
            # 安装\n使用包管理器安装。\n\n\
            # 用法\n运行命令即可开始，支持多种参数与配置方式。";
        let summary = summarize_readme(readme, 500);
        assert!(summary.contains("后台任务"));
        assert!(!summary.contains("包管理器"));
    }

    #[test]
    fn test_summary_strips_badges() {
        let readme = "[![CI](https://img.shields.io/badge/ci-pass-green)](https://ci.example.com)\n\
            ![coverage](https://img.shields.io/badge/cov-90-green)\n\n\
            A task runner with pluggable backends, scheduling, and retries built in.";
        let summary = summarize_readme(readme, 500);
        assert!(!summary.contains("img.shields.io"));
        assert!(summary.contains("task runner"));
    }

    #[test]
    fn test_summary_truncates() {
        let long_line = "word ".repeat(400);
        let summary = summarize_readme(&long_line, 500);
        assert!(summary.chars().count() <= 500);
    }

    #[test]
    fn test_summary_short_result_falls_back_to_raw_head() {
        // Everything lands in denied sections, so the filtered result is
        // empty and the raw head wins
        let readme = "# Installation\nA very long installation section explaining every step \
            of the setup in detail so the fallback has content to use.";
        let summary = summarize_readme(readme, 500);
        assert!(summary.starts_with("# Installation"));
        assert!(summary.chars().count() <= FALLBACK_CHARS);
    }
}
