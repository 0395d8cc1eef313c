//! ragcore - retrieval, reranking, context assembly and grounded generation
//! for workspace question answering.
//!
//! Pipeline: hybrid retrieval (dense + lexical + document-citation graph,
//! fused with reciprocal rank fusion) -> multi-factor reranking and
//! cross-source conflict detection -> token-budgeted evidence packet
//! assembly -> grounded prompt construction -> LLM generation -> citation
//! verification. The orchestrator in [`orchestrator`] chains these stages;
//! [`fabric`] and [`worker`] decouple request acceptance from generation
//! behind a durable job queue, status store and token stream bus; [`server`]
//! exposes the whole thing over HTTP and WebSocket.

pub mod citation_verifier;
pub mod config;
pub mod context_assembly;
pub mod embedder;
pub mod error;
pub mod fabric;
pub mod llm;
pub mod orchestrator;
pub mod prompt_builder;
pub mod query_expansion;
pub mod reranker;
pub mod retriever;
pub mod server;
pub mod store;
pub mod types;
pub mod worker;

pub use config::RagConfig;
pub use error::{RagError, RagResult};
pub use fabric::Fabric;
pub use orchestrator::Orchestrator;
pub use server::{create_router, run_server, spawn_worker, AppState};
pub use types::*;
