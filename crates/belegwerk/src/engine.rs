//! Process-wide engine: wires configuration and collaborators into the
//! ingestion, retrieval, enrichment, and research surfaces.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::KvBackend;
use crate::config::EngineConfig;
use crate::crawler::{Crawler, HeadlessFetcher};
use crate::embeddings::EmbeddingProvider;
use crate::enrich::{EnrichRequest, EnrichedContext, RequestEnricher};
use crate::error::{Error, Result};
use crate::ingest::{IngestMetadata, IngestOutcome, IngestSource, IngestionPipeline};
use crate::llm::LanguageModel;
use crate::processing::{OcrEngine, TextExtractor};
use crate::research::{ResearchGraph, ResearchOutput, ResearchRequest};
use crate::retrieve::{HybridRetriever, RetrieveOptions, SearchMode, SearchOutcome};
use crate::storage::{DocumentStore, PayloadIndex, TextIndex, VectorStore};

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Optional collaborators beyond the two every deployment must provide.
#[derive(Default)]
pub struct EngineComponents {
    pub kv_backend: Option<Arc<dyn KvBackend>>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub headless: Option<Arc<dyn HeadlessFetcher>>,
}

pub struct Engine {
    config: EngineConfig,
    vectors: Arc<VectorStore>,
    text_index: Arc<TextIndex>,
    documents: Arc<DocumentStore>,
    retriever: Arc<HybridRetriever>,
    ingestion: IngestionPipeline,
    grundsatz_ingestion: IngestionPipeline,
    enricher: RequestEnricher,
    research: ResearchGraph,
}

impl Engine {
    pub async fn new(
        config: EngineConfig,
        embeddings: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        Self::with_components(config, embeddings, llm, EngineComponents::default()).await
    }

    pub async fn with_components(
        config: EngineConfig,
        embeddings: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LanguageModel>,
        components: EngineComponents,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(Error::InvalidInput)?;
        std::fs::create_dir_all(&config.data_dir).ok();

        let lance_path = config.data_dir.join("lance_data");
        let vectors = Arc::new(
            VectorStore::new(
                lance_path.to_str().unwrap_or("./lance_data"),
                embeddings.dimension(),
            )
            .await?,
        );

        let payload_indexes = [
            PayloadIndex::tenant("owner_id"),
            PayloadIndex::keyword("doc_id"),
            PayloadIndex::keyword("source_type"),
        ];
        vectors
            .ensure_collection(&config.search.chunks_collection, &payload_indexes)
            .await?;
        vectors
            .ensure_collection(&config.search.grundsatz_collection, &payload_indexes)
            .await?;
        vectors.start_health_probe(HEALTH_PROBE_INTERVAL);

        let text_index = Arc::new(TextIndex::new(
            config.data_dir.to_str().unwrap_or("./data"),
        )?);
        let documents = Arc::new(DocumentStore::new(&config.data_dir.join("documents.db")).await?);

        let mut extractor = TextExtractor::new(config.chunking.max_pdf_pages);
        if let Some(ocr) = components.ocr {
            extractor = extractor.with_ocr(ocr);
        }
        let extractor = Arc::new(extractor);

        let mut crawler = Crawler::new(config.crawler.clone())?;
        if let Some(headless) = components.headless {
            crawler = crawler.with_headless(headless);
        }
        let crawler = Arc::new(crawler);

        let websearch = Arc::new(crate::websearch::MetaSearchClient::new(
            config.web_search.clone(),
            components.kv_backend,
        )?);

        let retriever = Arc::new(HybridRetriever::new(
            Arc::clone(&vectors),
            Arc::clone(&text_index),
            Arc::clone(&embeddings),
            config.search.clone(),
        ));

        let ingestion = IngestionPipeline::new(
            Arc::clone(&documents),
            Arc::clone(&vectors),
            Arc::clone(&text_index),
            Arc::clone(&embeddings),
            Arc::clone(&extractor),
            Arc::clone(&crawler),
            config.chunking.clone(),
            config.search.chunks_collection.clone(),
            config.embedding.batch_size,
        );

        let grundsatz_ingestion = IngestionPipeline::new(
            Arc::clone(&documents),
            Arc::clone(&vectors),
            Arc::clone(&text_index),
            Arc::clone(&embeddings),
            Arc::clone(&extractor),
            Arc::clone(&crawler),
            config.chunking.clone(),
            config.search.grundsatz_collection.clone(),
            config.embedding.batch_size,
        )
        .with_kind_override(crate::types::SourceKind::Grundsatz);

        let enricher = RequestEnricher::new(
            Arc::clone(&crawler),
            Arc::clone(&retriever),
            Arc::clone(&documents),
            Arc::clone(&websearch),
            Arc::clone(&llm),
            config.chunking.clone(),
            config.web_search.default_language.clone(),
        );

        let research = ResearchGraph::new(
            Arc::clone(&websearch) as Arc<dyn crate::websearch::SearchProvider>,
            Arc::clone(&crawler) as Arc<dyn crate::crawler::PageFetcher>,
            Arc::clone(&llm),
            Arc::clone(&retriever),
            config.research.clone(),
            config.search.grundsatz_collection.clone(),
            config.web_search.default_language.clone(),
            config.web_search.max_results,
        );

        Ok(Self {
            config,
            vectors,
            text_index,
            documents,
            retriever,
            ingestion,
            grundsatz_ingestion,
            enricher,
            research,
        })
    }

    /// Run a web search or deep research. Cancellation aborts in-flight work
    /// and yields `Error::Cancelled`, never a partial result.
    pub async fn run_web_search(
        &self,
        request: &ResearchRequest,
        cancel: CancellationToken,
    ) -> Result<ResearchOutput> {
        self.research.run(request, cancel).await
    }

    pub async fn ingest(
        &self,
        owner_id: &str,
        source: IngestSource,
        metadata: IngestMetadata,
    ) -> Result<IngestOutcome> {
        self.ingestion.ingest(owner_id, source, metadata).await
    }

    /// Ingest a curated official document into the grundsatz collection.
    pub async fn ingest_grundsatz(
        &self,
        source: IngestSource,
        metadata: IngestMetadata,
    ) -> Result<IngestOutcome> {
        self.grundsatz_ingestion
            .ingest(crate::types::GRUNDSATZ_OWNER, source, metadata)
            .await
    }

    pub async fn reingest(
        &self,
        owner_id: &str,
        id: Uuid,
        source: IngestSource,
    ) -> Result<IngestOutcome> {
        self.ingestion.reingest(owner_id, id, source).await
    }

    pub async fn search_documents(
        &self,
        query: &str,
        owner_id: &str,
        mode: SearchMode,
        limit: usize,
        document_ids: Option<Vec<String>>,
    ) -> Result<SearchOutcome> {
        let options = RetrieveOptions {
            limit: if limit == 0 {
                self.config.search.default_limit
            } else {
                limit
            },
            mode,
            document_ids,
            vector_weight: self.config.search.vector_weight,
            text_weight: self.config.search.text_weight,
            score_threshold: None,
            max_per_document: None,
        };
        self.retriever.search(query, owner_id, &options).await
    }

    pub async fn get_full_text(&self, owner_id: &str, id: Uuid) -> Result<FullTextResult> {
        let record = self.documents.get(owner_id, id).await?;
        let (full_text, chunk_count) = self
            .retriever
            .full_document_text(owner_id, &id.to_string())
            .await?;
        Ok(FullTextResult {
            id,
            title: record.title,
            full_text,
            chunk_count,
            metadata: record.metadata,
        })
    }

    pub async fn get_multiple_full_texts(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> MultipleFullTexts {
        let mut documents = Vec::new();
        let mut errors = Vec::new();
        for &id in ids {
            match self.get_full_text(owner_id, id).await {
                Ok(result) => documents.push(result),
                Err(e) => errors.push(format!("{id}: {e}")),
            }
        }
        MultipleFullTexts { documents, errors }
    }

    pub async fn delete(&self, owner_id: &str, id: Uuid) -> Result<()> {
        self.ingestion.delete(owner_id, id).await
    }

    pub async fn bulk_delete(&self, owner_id: &str, ids: &[Uuid]) -> Vec<(Uuid, Result<()>)> {
        self.ingestion.bulk_delete(owner_id, ids).await
    }

    pub async fn enrich_request(&self, request: &EnrichRequest) -> Result<EnrichedContext> {
        self.enricher.enrich(request).await
    }

    pub async fn get_statistics(&self, owner_id: &str) -> Result<EngineStatistics> {
        let chunk_filter = crate::types::SearchFilter::owner(owner_id);
        let chunk_count = self
            .vectors
            .count(
                &self.config.search.chunks_collection,
                chunk_filter.to_predicate().as_deref(),
            )
            .await?;
        let document_count = self.documents.count_for_owner(owner_id).await?;

        Ok(EngineStatistics {
            document_count,
            chunk_count,
            text_index_count: self.text_index.count(),
            embedding_dimension: self.vectors.dimension(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullTextResult {
    pub id: Uuid,
    pub title: String,
    pub full_text: String,
    pub chunk_count: u32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultipleFullTexts {
    pub documents: Vec<FullTextResult>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub document_count: u64,
    pub chunk_count: usize,
    pub text_index_count: usize,
    pub embedding_dimension: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::HashedEmbeddings;
    use crate::llm::testing::ScriptedModel;
    use tempfile::TempDir;

    async fn test_engine(dir: &TempDir) -> Engine {
        crate::test_logging::init();
        let mut config = EngineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.security.key_file = dir.path().join("master.key");
        config.security.key_backup_file = dir.path().join("master.key.enc");
        config.embedding.dimension = 16;

        let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(HashedEmbeddings::new(16));
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![
            "Zusammenfassung ohne Belege.",
        ]));
        Engine::new(config, embeddings, llm).await.expect("engine")
    }

    #[tokio::test]
    async fn ingest_search_fulltext_delete_lifecycle() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;

        let text = "## Seite 1\n\nDie Stadt Freiburg plant neue Radwege. \
                    Der Gemeinderat berät über die Finanzierung des Radverkehrs.\n\n\
                    ## Seite 2\n\nKlimaschutz bleibt ein Schwerpunkt der Stadtpolitik. \
                    Die Verwaltung legt einen Maßnahmenkatalog vor.";

        let outcome = engine
            .ingest(
                "alice",
                IngestSource::RawText { text: text.into() },
                IngestMetadata {
                    title: "Ratsprotokoll".into(),
                    filename: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, crate::types::DocumentStatus::Completed);
        assert!(outcome.vector_count >= 1);

        // Property: chunk count equals vector_count and ordinals are dense.
        let full = engine.get_full_text("alice", outcome.id).await.unwrap();
        assert_eq!(full.chunk_count, outcome.vector_count);
        assert!(full.full_text.contains("Radwege"));

        // Owner scoping: bob sees nothing.
        assert!(engine.get_full_text("bob", outcome.id).await.is_err());

        let results = engine
            .search_documents("Radverkehr Finanzierung", "alice", SearchMode::Hybrid, 5, None)
            .await
            .unwrap();
        assert!(!results.results.is_empty());
        for result in &results.results {
            assert_eq!(result.document_id, outcome.id.to_string());
        }

        let foreign = engine
            .search_documents("Radverkehr", "bob", SearchMode::Hybrid, 5, None)
            .await
            .unwrap();
        assert!(foreign.results.is_empty());

        engine.delete("alice", outcome.id).await.unwrap();
        let stats = engine.get_statistics("alice").await.unwrap();
        assert_eq!(stats.chunk_count, 0);
    }

    #[tokio::test]
    async fn reingest_keeps_point_count_stable() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;

        let text = "Absatz eins über die Wärmeplanung der Kommune. ".repeat(20);
        let outcome = engine
            .ingest(
                "alice",
                IngestSource::RawText { text: text.clone() },
                IngestMetadata {
                    title: "Wärmeplan".into(),
                    filename: None,
                },
            )
            .await
            .unwrap();

        let stats_before = engine.get_statistics("alice").await.unwrap();

        let second = engine
            .reingest("alice", outcome.id, IngestSource::RawText { text })
            .await
            .unwrap();
        assert_eq!(second.id, outcome.id);
        assert_eq!(second.vector_count, outcome.vector_count);

        let stats_after = engine.get_statistics("alice").await.unwrap();
        assert_eq!(stats_before.chunk_count, stats_after.chunk_count);
    }

    #[tokio::test]
    async fn empty_source_ends_failed_with_reason() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;

        let outcome = engine
            .ingest(
                "alice",
                IngestSource::RawText { text: "   ".into() },
                IngestMetadata {
                    title: "Leer".into(),
                    filename: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, crate::types::DocumentStatus::Failed);
        assert_eq!(outcome.vector_count, 0);

        let record = engine.documents.get("alice", outcome.id).await.unwrap();
        assert!(record.metadata["error"]
            .as_str()
            .unwrap()
            .contains("no text"));
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        let outcome = engine
            .search_documents("  ", "alice", SearchMode::Hybrid, 5, None)
            .await;
        assert!(matches!(outcome, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn scoped_search_only_returns_requested_documents() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let outcome = engine
                .ingest(
                    "alice",
                    IngestSource::RawText {
                        text: format!(
                            "Dokument {i} behandelt den Radverkehr und die Verkehrswende in Kapitel {i}. "
                        )
                        .repeat(10),
                    },
                    IngestMetadata {
                        title: format!("Dokument {i}"),
                        filename: None,
                    },
                )
                .await
                .unwrap();
            ids.push(outcome.id.to_string());
        }

        let scope = vec![ids[0].clone(), ids[1].clone()];
        let outcome = engine
            .search_documents(
                "Radverkehr Verkehrswende",
                "alice",
                SearchMode::Hybrid,
                10,
                Some(scope.clone()),
            )
            .await
            .unwrap();
        assert!(!outcome.results.is_empty());
        for result in &outcome.results {
            assert!(scope.contains(&result.document_id));
        }
    }
}
