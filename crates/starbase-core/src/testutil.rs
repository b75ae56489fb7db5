//! In-memory fakes shared by unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use crate::embedding::{EMBEDDING_DIMENSIONS, Embedder};
use crate::error::Result;
use crate::model::{OwnerType, RemoteRepo};
use crate::remote::RemoteSource;

/// Deterministic embedder: hashes words into a unit vector, so identical
/// text embeds identically and overlapping text lands nearby
pub struct FakeEmbedder {
    pub healthy: std::sync::atomic::AtomicBool,
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

pub fn hash_vector(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut v = vec![0.0_f32; EMBEDDING_DIMENSIONS];
    for word in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        let h = hasher.finish();
        v[(h as usize) % EMBEDDING_DIMENSIONS] += 1.0;
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
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Vec<f32> {
        if !self.healthy.load(std::sync::atomic::Ordering::Relaxed) || text.trim().is_empty() {
            return vec![];
        }
        hash_vector(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await);
        }
        out
    }

    async fn health(&self) -> bool {
        self.healthy.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

/// Scripted remote: returns whatever the test last put into it
#[derive(Default)]
pub struct FakeRemote {
    pub repos: Mutex<Vec<RemoteRepo>>,
    pub readmes: Mutex<std::collections::HashMap<String, String>>,
}

impl FakeRemote {
    pub fn set_repos(&self, repos: Vec<RemoteRepo>) {
        *self.repos.lock().unwrap() = repos;
    }

    pub fn set_readme(&self, name_with_owner: &str, readme: &str) {
        self.readmes
            .lock()
            .unwrap()
            .insert(name_with_owner.to_string(), readme.to_string());
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn list_starred(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRepo>> {
        Ok(self.repos.lock().unwrap().clone())
    }

    async fn fetch_readme(
        &self,
        owner: &str,
        name: &str,
        _pushed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        Ok(self
            .readmes
            .lock()
            .unwrap()
            .get(&format!("{}/{}", owner, name))
            .cloned())
    }
}

/// A remote snapshot with sensible defaults for tests
pub fn remote_repo(owner: &str, name: &str, description: &str) -> RemoteRepo {
    RemoteRepo {
        owner: owner.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        primary_language: Some("Go".to_string()),
        languages: vec!["Go".to_string()],
        topics: vec!["cli".to_string(), "tool".to_string()],
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
