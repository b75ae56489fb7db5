//! Environment-driven configuration
//!
//! Parsed once at startup and passed through the composition root; no
//! component reads the environment after this.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default hybrid-search weight for the lexical leg
pub const DEFAULT_FTS_WEIGHT: f32 = 0.3;
/// Default hybrid-search weight for the semantic leg
pub const DEFAULT_SEMANTIC_WEIGHT: f32 = 0.7;
/// Default recommender weight for graph recall (semantic gets 1 - graph)
pub const DEFAULT_GRAPH_WEIGHT: f32 = 0.65;
/// Default cap on the filtered README summary
pub const DEFAULT_README_MAX_CHARS: usize = 500;
/// Default threshold below which semantic edges are not stored
pub const DEFAULT_SEMANTIC_MIN_SIMILARITY: f32 = 0.6;
/// Default neighbor count for semantic edge discovery
pub const DEFAULT_SEMANTIC_TOP_K: usize = 10;

/// A wall-clock time of day for the scheduler, parsed from `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub hour: u32,
    pub minute: u32,
}

impl WallClock {
    /// Parse `HH:MM` (24-hour)
    pub fn parse(s: &str) -> Result<Self> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| Error::InputInvalid(format!("expected HH:MM, got '{}'", s)))?;
        let hour: u32 = h
            .trim()
            .parse()
            .map_err(|_| Error::InputInvalid(format!("bad hour in '{}'", s)))?;
        let minute: u32 = m
            .trim()
            .parse()
            .map_err(|_| Error::InputInvalid(format!("bad minute in '{}'", s)))?;
        if hour > 23 || minute > 59 {
            return Err(Error::InputInvalid(format!("out-of-range time '{}'", s)));
        }
        Ok(Self { hour, minute })
    }
}

/// Process configuration, sourced from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the code-hosting API; unauthenticated mode when absent
    pub remote_token: Option<String>,
    /// SQLite database file
    pub store_path: Option<PathBuf>,
    /// Directory holding the persistent vector index
    pub vector_path: Option<PathBuf>,
    /// Directory holding the on-disk README cache
    pub readme_cache_path: Option<PathBuf>,
    /// Base URL of the embedding service
    pub embedder_url: String,
    /// Model name sent to the embedding service
    pub embedder_model: String,
    /// Hybrid search lexical weight
    pub fts_weight: f32,
    /// Hybrid search semantic weight
    pub semantic_weight: f32,
    /// Recommender graph-recall weight
    pub graph_weight: f32,
    /// Daily incremental sync time
    pub sync_daily: WallClock,
    /// Weekly full sync time (Sundays)
    pub sync_weekly: WallClock,
    /// Cap on the filtered README summary
    pub readme_max_chars: usize,
    /// Minimum similarity for semantic edges
    pub semantic_min_similarity: f32,
    /// Neighbor count for semantic edge discovery
    pub semantic_top_k: usize,
    /// HTTP bind host
    pub host: String,
    /// HTTP bind port
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_token: None,
            store_path: None,
            vector_path: None,
            readme_cache_path: None,
            embedder_url: "http://localhost:11434".to_string(),
            embedder_model: "bge-m3".to_string(),
            fts_weight: DEFAULT_FTS_WEIGHT,
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            graph_weight: DEFAULT_GRAPH_WEIGHT,
            sync_daily: WallClock { hour: 2, minute: 0 },
            sync_weekly: WallClock { hour: 3, minute: 0 },
            readme_max_chars: DEFAULT_README_MAX_CHARS,
            semantic_min_similarity: DEFAULT_SEMANTIC_MIN_SIMILARITY,
            semantic_top_k: DEFAULT_SEMANTIC_TOP_K,
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::InputInvalid(format!("unparseable {}: '{}'", key, raw))),
        None => Ok(default),
    }
}

impl Config {
    /// Build from the process environment; unparseable values are startup errors
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let sync_daily = match env_var("SYNC_CRON_DAILY") {
            Some(raw) => WallClock::parse(&raw)?,
            None => defaults.sync_daily,
        };
        let sync_weekly = match env_var("SYNC_CRON_WEEKLY") {
            Some(raw) => WallClock::parse(&raw)?,
            None => defaults.sync_weekly,
        };

        Ok(Self {
            remote_token: env_var("REMOTE_TOKEN"),
            store_path: env_var("STORE_PATH").map(PathBuf::from),
            vector_path: env_var("VECTOR_PATH").map(PathBuf::from),
            readme_cache_path: env_var("README_CACHE_PATH").map(PathBuf::from),
            embedder_url: env_var("EMBEDDER_URL").unwrap_or(defaults.embedder_url),
            embedder_model: env_var("EMBEDDER_MODEL").unwrap_or(defaults.embedder_model),
            fts_weight: env_parse("FTS_WEIGHT", defaults.fts_weight)?,
            semantic_weight: env_parse("SEMANTIC_WEIGHT", defaults.semantic_weight)?,
            graph_weight: env_parse("GRAPH_WEIGHT", defaults.graph_weight)?,
            sync_daily,
            sync_weekly,
            readme_max_chars: env_parse("README_MAX_CHARS", defaults.readme_max_chars)?,
            semantic_min_similarity: env_parse(
                "SEMANTIC_MIN_SIMILARITY",
                defaults.semantic_min_similarity,
            )?,
            semantic_top_k: env_parse("SEMANTIC_TOP_K", defaults.semantic_top_k)?,
            host: env_var("STARBASE_HOST").unwrap_or(defaults.host),
            port: env_parse("STARBASE_PORT", defaults.port)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_parse() {
        assert_eq!(WallClock::parse("02:00").unwrap(), WallClock { hour: 2, minute: 0 });
        assert_eq!(
            WallClock::parse("23:59").unwrap(),
            WallClock { hour: 23, minute: 59 }
        );
        assert!(WallClock::parse("24:00").is_err());
        assert!(WallClock::parse("2am").is_err());
        assert!(WallClock::parse("12:60").is_err());
    }

    #[test]
    fn test_default_weights_sum() {
        let cfg = Config::default();
        assert!((cfg.fts_weight + cfg.semantic_weight - 1.0).abs() < f32::EPSILON);
    }
}
