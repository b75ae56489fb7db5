//! Starbase Server
//!
//! Composition root: wires the store, vector index, embedder, remote
//! client, sync engine, scheduler, and the HTTP surface, then serves until
//! shutdown. Configuration is environment-driven (see `Config`).

mod api;
mod scheduler;
mod state;

use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use starbase_core::{
    Config, GithubClient, GithubClientConfig, GraphService, HttpEmbedder, HybridSearch,
    Recommender, RemoteSource, SearchWeights, Store, SyncEngine, VectorIndex, Vectorizer,
};

use crate::scheduler::Scheduler;
use crate::state::AppState;

/// Exit code for unparseable or missing mandatory configuration
const EXIT_CONFIG: i32 = 2;
/// Exit code for store / migration failure
const EXIT_STORE: i32 = 3;
/// Exit code for port bind failure
const EXIT_BIND: i32 = 4;

fn default_vector_dir() -> std::path::PathBuf {
    directories::ProjectDirs::from("dev", "starbase", "starbase")
        .map(|dirs| dirs.data_dir().join("vectors"))
        .unwrap_or_else(|| std::path::PathBuf::from(".starbase/vectors"))
}

fn default_readme_cache_dir() -> std::path::PathBuf {
    directories::ProjectDirs::from("dev", "starbase", "starbase")
        .map(|dirs| dirs.cache_dir().join("readmes"))
        .unwrap_or_else(|| std::path::PathBuf::from(".starbase/readmes"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if config.remote_token.is_none() {
        warn!("REMOTE_TOKEN not set; running unauthenticated at the lower rate cap");
    }

    // Store: migration failure aborts startup
    let store = match Store::open(config.store_path.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Store unavailable: {}", e);
            std::process::exit(EXIT_STORE);
        }
    };

    let vector_dir = config.vector_path.clone().unwrap_or_else(default_vector_dir);
    let index = match VectorIndex::open(&vector_dir) {
        Ok(index) => Arc::new(Mutex::new(index)),
        Err(e) => {
            error!("Vector index unavailable at {:?}: {}", vector_dir, e);
            std::process::exit(EXIT_STORE);
        }
    };

    let embedder = Arc::new(HttpEmbedder::new(&config.embedder_url, &config.embedder_model));
    let remote: Arc<dyn RemoteSource> = Arc::new(GithubClient::new(GithubClientConfig {
        token: config.remote_token.clone(),
        readme_cache_dir: Some(
            config
                .readme_cache_path
                .clone()
                .unwrap_or_else(default_readme_cache_dir),
        ),
        ..Default::default()
    }));

    let vectorizer = Arc::new(Vectorizer::new(embedder, Arc::clone(&index)));
    let graph = Arc::new(GraphService::new(
        Arc::clone(&store),
        Arc::clone(&index),
        config.semantic_min_similarity,
        config.semantic_top_k,
    ));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        remote,
        Arc::clone(&vectorizer),
        Arc::clone(&graph),
        config.readme_max_chars,
    ));
    let search = Arc::new(HybridSearch::new(
        Arc::clone(&store),
        Arc::clone(&vectorizer),
        Arc::clone(&index),
        SearchWeights {
            fts: config.fts_weight,
            semantic: config.semantic_weight,
        },
    ));
    let recommender = Arc::new(Recommender::new(
        Arc::clone(&store),
        Arc::clone(&index),
        config.graph_weight,
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&engine),
        config.sync_daily,
        config.sync_weekly,
    ));
    scheduler.start();

    let app_state = AppState {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        vectorizer,
        graph,
        engine: Arc::clone(&engine),
        search,
        recommender,
    };
    let router = api::build_router(app_state);

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not bind {}: {}", bind_addr, e);
            std::process::exit(EXIT_BIND);
        }
    };
    info!("Starbase v{} listening on http://{}", starbase_core::VERSION, bind_addr);

    let shutdown = shutdown_signal();
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Shutting down");
    engine.request_stop();
    scheduler.stop().await;
    if let Ok(index) = index.lock() {
        if let Err(e) = index.save() {
            warn!("Vector index save on shutdown failed: {}", e);
        }
    }
    if let Err(e) = store.checkpoint() {
        warn!("WAL checkpoint on shutdown failed: {}", e);
    }
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
