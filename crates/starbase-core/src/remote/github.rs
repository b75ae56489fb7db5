//! GitHub-shaped REST client
//!
//! Star-paginated listing with `Accept: application/vnd.github.star+json`
//! so `starred_at` rides along, exponential backoff with jitter on 429/5xx,
//! and a token bucket sized to the upstream quota.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::model::{OwnerType, RemoteRepo};
use crate::remote::RemoteSource;

/// Items per page; the upstream maximum
const PER_PAGE: usize = 100;

/// Retry attempts for 429/5xx/transport failures
const MAX_RETRIES: u32 = 5;

/// Backoff base delay
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Backoff ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(32);

/// Authenticated quota: 5000 requests/hour
const AUTHENTICATED_QUOTA_PER_HOUR: f64 = 5000.0;

/// Anonymous quota: 60 requests/hour
const ANONYMOUS_QUOTA_PER_HOUR: f64 = 60.0;

// ============================================================================
// TOKEN BUCKET
// ============================================================================

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously refilled token bucket enforcing the upstream quota
struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    per_second: f64,
}

impl TokenBucket {
    fn new(quota_per_hour: f64) -> Self {
        // Burst capacity of one minute's worth, at least one request
        let capacity = (quota_per_hour / 60.0).max(1.0);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            per_second: quota_per_hour / 3600.0,
        }
    }

    /// Take one token, sleeping until one is available
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct StarredEntry {
    starred_at: Option<DateTime<Utc>>,
    repo: ApiRepo,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    name: String,
    owner: ApiOwner,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    homepage: Option<String>,
    #[serde(default)]
    stargazers_count: i64,
    #[serde(default)]
    forks_count: i64,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    visibility: Option<String>,
    license: Option<ApiLicense>,
    created_at: Option<DateTime<Utc>>,
    pushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLicense {
    spdx_id: Option<String>,
}

fn normalize(entry: StarredEntry) -> RemoteRepo {
    let repo = entry.repo;
    RemoteRepo {
        owner: repo.owner.login,
        name: repo.name,
        description: repo.description,
        primary_language: repo.language.clone(),
        languages: repo.language.into_iter().collect(),
        topics: repo.topics,
        homepage: repo.homepage.filter(|h| !h.is_empty()),
        stargazer_count: repo.stargazers_count,
        fork_count: repo.forks_count,
        owner_type: repo
            .owner
            .kind
            .as_deref()
            .map(OwnerType::parse_name)
            .unwrap_or_default(),
        archived: repo.archived,
        visibility: repo.visibility.unwrap_or_else(|| "public".to_string()),
        license: repo.license.and_then(|l| l.spdx_id).filter(|s| s != "NOASSERTION"),
        created_at: repo.created_at,
        pushed_at: repo.pushed_at,
        starred_at: entry.starred_at,
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Client configuration
#[derive(Debug, Clone)]
pub struct GithubClientConfig {
    /// API base, default `https://api.github.com`
    pub base_url: String,
    /// Bearer token; absent means anonymous mode at the lower quota
    pub token: Option<String>,
    /// Directory for the README cache; uncached when absent
    pub readme_cache_dir: Option<PathBuf>,
}

impl Default for GithubClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            readme_cache_dir: None,
        }
    }
}

/// GitHub REST client for the starred-repositories listing
pub struct GithubClient {
    client: reqwest::Client,
    config: GithubClientConfig,
    bucket: TokenBucket,
}

impl GithubClient {
    pub fn new(config: GithubClientConfig) -> Self {
        let quota = if config.token.is_some() {
            AUTHENTICATED_QUOTA_PER_HOUR
        } else {
            ANONYMOUS_QUOTA_PER_HOUR
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("starbase/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            bucket: TokenBucket::new(quota),
        }
    }

    fn request(&self, url: &str, accept: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(url)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Issue a request with retry: 429 and 5xx back off exponentially with
    /// jitter; any other 4xx fails fast with a typed error.
    async fn send_with_retry(&self, url: &str, accept: &str) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            self.bucket.acquire().await;

            match self.request(url, accept).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.as_u16() == 404 {
                        return Ok(response);
                    }
                    if status.as_u16() != 429 && !status.is_server_error() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(Error::RemoteFatal {
                            status: status.as_u16(),
                            message,
                        });
                    }
                    tracing::warn!("Remote returned {} for {} (attempt {})", status, url, attempt + 1);
                }
                Err(e) => {
                    tracing::warn!("Remote transport error for {}: {} (attempt {})", url, e, attempt + 1);
                }
            }

            attempt += 1;
            if attempt >= MAX_RETRIES {
                return Err(Error::RemoteTransient(format!(
                    "{} failed after {} attempts",
                    url, MAX_RETRIES
                )));
            }
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }

    fn cache_path(&self, owner: &str, name: &str, pushed_at: Option<DateTime<Utc>>) -> Option<PathBuf> {
        let dir = self.config.readme_cache_dir.as_ref()?;
        let stamp = pushed_at.map(|t| t.timestamp()).unwrap_or(0);
        let file = format!(
            "{}__{}__{}.md",
            sanitize_path_component(owner),
            sanitize_path_component(name),
            stamp
        );
        Some(dir.join(file))
    }
}

/// Exponential backoff with jitter in [0.5, 1.5)
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(BACKOFF_CAP);
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    capped.mul_f64(jitter)
}

fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[async_trait]
impl RemoteSource for GithubClient {
    async fn list_starred(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRepo>> {
        // The listing is star-ordered, so `since` cannot bound pagination:
        // removal detection needs the complete set either way.
        if let Some(since) = since {
            tracing::debug!("Incremental sync bound {} (advisory only)", since);
        }

        let mut all = Vec::new();
        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/user/starred?per_page={}&page={}",
                self.config.base_url, PER_PAGE, page
            );
            let response = self
                .send_with_retry(&url, "application/vnd.github.star+json")
                .await?;

            if response.status().as_u16() == 404 {
                return Err(Error::RemoteFatal {
                    status: 404,
                    message: "starred listing unavailable; is the token valid?".to_string(),
                });
            }

            let entries: Vec<StarredEntry> = response
                .json()
                .await
                .map_err(|e| Error::RemoteTransient(format!("listing parse error: {}", e)))?;
            let page_len = entries.len();
            all.extend(entries.into_iter().map(normalize));

            if page_len < PER_PAGE {
                break;
            }
            page += 1;
        }

        tracing::info!("Fetched {} starred repositories across {} pages", all.len(), page);
        Ok(all)
    }

    async fn fetch_readme(
        &self,
        owner: &str,
        name: &str,
        pushed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let cache_path = self.cache_path(owner, name, pushed_at);
        if let Some(path) = &cache_path {
            if let Ok(cached) = std::fs::read_to_string(path) {
                tracing::debug!("README cache hit for {}/{}", owner, name);
                return Ok(Some(cached));
            }
        }

        let url = format!("{}/repos/{}/{}/readme", self.config.base_url, owner, name);
        let response = self
            .send_with_retry(&url, "application/vnd.github.raw+json")
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::RemoteTransient(format!("README read error: {}", e)))?;

        if let Some(path) = &cache_path {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(path, &body) {
                tracing::warn!("README cache write failed for {}/{}: {}", owner, name, e);
            }
        }

        Ok(Some(body))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_entry() {
        let raw = r#"{
            "starred_at": "2024-03-05T12:00:00Z",
            "repo": {
                "name": "widget",
                "owner": {"login": "acme", "type": "Organization"},
                "description": "Small CLI",
                "language": "Go",
                "topics": ["cli", "tool"],
                "homepage": "",
                "stargazers_count": 42,
                "forks_count": 3,
                "archived": false,
                "visibility": "public",
                "license": {"spdx_id": "MIT"},
                "created_at": "2020-01-01T00:00:00Z",
                "pushed_at": "2024-03-01T00:00:00Z"
            }
        }"#;
        let entry: StarredEntry = serde_json::from_str(raw).unwrap();
        let repo = normalize(entry);

        assert_eq!(repo.name_with_owner(), "acme/widget");
        assert_eq!(repo.owner_type, OwnerType::Organization);
        assert_eq!(repo.primary_language.as_deref(), Some("Go"));
        assert_eq!(repo.languages, vec!["Go"]);
        assert_eq!(repo.license.as_deref(), Some("MIT"));
        assert!(repo.homepage.is_none());
        assert!(repo.starred_at.is_some());
    }

    #[test]
    fn test_normalize_tolerates_sparse_payloads() {
        let raw = r#"{
            "repo": {
                "name": "bare",
                "owner": {"login": "solo"},
                "description": null,
                "language": null,
                "homepage": null,
                "license": null,
                "created_at": null,
                "pushed_at": null
            }
        }"#;
        let entry: StarredEntry = serde_json::from_str(raw).unwrap();
        let repo = normalize(entry);

        assert_eq!(repo.name_with_owner(), "solo/bare");
        assert_eq!(repo.owner_type, OwnerType::User);
        assert_eq!(repo.visibility, "public");
        assert!(repo.languages.is_empty());
        assert_eq!(repo.stargazer_count, 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for _ in 0..16 {
            let d1 = backoff_delay(1);
            let d5 = backoff_delay(5);
            // attempt 1: 500ms * [0.5, 1.5); attempt 5: 8s * [0.5, 1.5)
            assert!(d1 >= Duration::from_millis(250) && d1 < Duration::from_millis(750));
            assert!(d5 >= Duration::from_secs(4) && d5 < Duration::from_secs(12));
            assert!(backoff_delay(30) <= BACKOFF_CAP.mul_f64(1.5));
        }
    }

    #[test]
    fn test_cache_path_varies_with_pushed_at() {
        let dir = tempfile::tempdir().unwrap();
        let client = GithubClient::new(GithubClientConfig {
            readme_cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });

        let t1 = Some(Utc::now());
        let t2 = Some(Utc::now() + chrono::Duration::days(1));
        let p1 = client.cache_path("acme", "widget", t1).unwrap();
        let p2 = client.cache_path("acme", "widget", t2).unwrap();
        assert_ne!(p1, p2);

        let odd = client.cache_path("we/ird", "na me", None).unwrap();
        let file = odd.file_name().unwrap().to_string_lossy().to_string();
        assert!(!file.contains('/'));
        assert!(!file.contains(' '));
    }

    #[tokio::test]
    async fn test_token_bucket_allows_burst_then_throttles() {
        let bucket = TokenBucket::new(3600.0); // 1/sec, capacity 60
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        // Burst capacity absorbs the first few acquisitions instantly
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_waits_when_drained() {
        let bucket = TokenBucket::new(3600.0); // capacity 60, 1 token/sec
        for _ in 0..60 {
            bucket.acquire().await;
        }
        let start = Instant::now();
        bucket.acquire().await; // must wait ~1s of (virtual) time
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
