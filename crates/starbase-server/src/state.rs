//! Shared handler state

use std::sync::Arc;

use starbase_core::{
    Config, GraphService, HybridSearch, Recommender, Store, SyncEngine, Vectorizer,
};

/// Everything the HTTP handlers need, wired once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub vectorizer: Arc<Vectorizer>,
    pub graph: Arc<GraphService>,
    pub engine: Arc<SyncEngine>,
    pub search: Arc<HybridSearch>,
    pub recommender: Arc<Recommender>,
}
