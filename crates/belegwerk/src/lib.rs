pub mod cache;
pub mod citations;
pub mod config;
pub mod crawler;
pub mod embeddings;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod processing;
pub mod research;
pub mod retrieve;
pub mod security;
pub mod storage;
pub mod types;
pub mod websearch;

// Re-export primary types for convenience
pub use config::EngineConfig;
pub use engine::{Engine, EngineComponents};
pub use error::{Error, Result};
pub use ingest::{IngestMetadata, IngestOutcome, IngestSource};
pub use research::{ResearchMode, ResearchOutput, ResearchRequest};
pub use retrieve::{RetrieveOptions, SearchMode, SearchOutcome};
pub use types::{
    DocumentRecord, DocumentRef, DocumentStatus, Reference, SearchFilter, SourceKind,
    WebSearchResult,
};

pub use uuid::Uuid;

#[cfg(test)]
pub(crate) mod test_logging {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Opt-in tracing output for tests:
    /// `RUST_LOG=belegwerk=debug cargo test -- --nocapture`.
    pub(crate) fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}
