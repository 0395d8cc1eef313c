//! ragcore HTTP server binary.

use ragcore::config::RagConfig;
use ragcore::embedder::build_embedder;
use ragcore::fabric::Fabric;
use ragcore::llm::build_llm;
use ragcore::server::{spawn_worker, AppState};
use ragcore::store::InMemoryStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let config = Arc::new(RagConfig::from_env());
    let embedder: Arc<dyn ragcore::embedder::Embedder> = Arc::from(build_embedder(&config));
    let llm: Arc<dyn ragcore::llm::Llm> = Arc::from(build_llm(&config));
    let store = InMemoryStore::new();
    let fabric = Arc::new(Fabric::new(&config));

    let state = AppState {
        config,
        store,
        embedder,
        llm,
        fabric,
    };

    spawn_worker(&state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081);

    ragcore::server::run_server(state, port).await
}
