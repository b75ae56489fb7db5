//! Semantic Embeddings
//!
//! The embedding model runs out of process; this module is the HTTP client
//! for it plus the similarity helpers. Callers never see embedder failures:
//! an unreachable or erroring service yields an empty vector and a warning,
//! and search/vectorization degrade accordingly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Width of every embedding vector
pub const EMBEDDING_DIMENSIONS: usize = 1024;

/// Maximum text length sent to the embedder (truncated if longer)
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size cap protecting the embedding backend
pub const BATCH_SIZE: usize = 10;

/// Per-request deadline
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// EMBEDDER TRAIT
// ============================================================================

/// Capability interface for the embedding collaborator
///
/// An empty returned vector means "no embedding" and is never an error.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text; empty input or backend failure yields an empty vector
    async fn embed(&self, text: &str) -> Vec<f32>;

    /// Embed many texts; output length always equals input length, with
    /// empty vectors standing in for per-item failures
    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>>;

    /// Whether the backend is reachable
    async fn health(&self) -> bool;

    /// Model identifier, for status reporting
    fn model_name(&self) -> &str;
}

// ============================================================================
// HTTP EMBEDDER
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for an HTTP embedding service (`POST {base}/api/embed`)
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    /// One round trip for a batch of at most `BATCH_SIZE` texts
    async fn request(&self, texts: Vec<&str>) -> Option<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Embedder unreachable at {}: {}", url, e);
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::warn!("Embedder returned {} from {}", response.status(), url);
            return None;
        }

        match response.json::<EmbedResponse>().await {
            Ok(parsed) => Some(parsed.embeddings.into_iter().map(normalize).collect()),
            Err(e) => {
                tracing::warn!("Embedder response parse error: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Vec<f32> {
        let text = text.trim();
        if text.is_empty() {
            return vec![];
        }
        let text = truncate(text, MAX_TEXT_LENGTH);
        match self.request(vec![text]).await {
            Some(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            _ => vec![],
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(BATCH_SIZE) {
            let prepared: Vec<&str> = chunk
                .iter()
                .map(|t| truncate(t.trim(), MAX_TEXT_LENGTH))
                .collect();

            // A wholly empty chunk never hits the network
            if prepared.iter().all(|t| t.is_empty()) {
                out.extend(std::iter::repeat_n(vec![], chunk.len()));
                continue;
            }

            match self.request(prepared).await {
                Some(vectors) if vectors.len() == chunk.len() => out.extend(vectors),
                Some(vectors) => {
                    tracing::warn!(
                        "Embedder returned {} vectors for a batch of {}",
                        vectors.len(),
                        chunk.len()
                    );
                    out.extend(std::iter::repeat_n(vec![], chunk.len()));
                }
                None => out.extend(std::iter::repeat_n(vec![], chunk.len())),
            }
        }

        out
    }

    async fn health(&self) -> bool {
        match self.client.get(&self.base_url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Truncate on a char boundary
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// L2-normalize so cosine similarity lands in [0, 1] for related text
fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Compute cosine similarity between two vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot_product / denominator
    } else {
        0.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
