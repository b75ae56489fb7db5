//! Remote Code-Hosting Client
//!
//! Paginated fetch of the authenticated user's starred repositories, with
//! rate limiting, retry, and an on-disk README cache.

mod github;

pub use github::{GithubClient, GithubClientConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::RemoteRepo;

/// Capability interface for the upstream code-hosting API
///
/// The sync engine only ever talks to this trait; tests substitute a
/// scripted fake.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Every repository the user has starred, normalized
    ///
    /// `since` is a hint: the upstream listing is star-ordered, so callers
    /// may still observe unmodified repositories.
    async fn list_starred(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRepo>>;

    /// Raw README content, or None when the repository has none
    ///
    /// Results are cached by `(owner/name, pushed_at)` so unchanged content
    /// is never re-downloaded.
    async fn fetch_readme(
        &self,
        owner: &str,
        name: &str,
        pushed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>>;
}
