//! Document ingestion: extract → chunk → embed → upsert, with a status walk
//! persisted in the relational store and a per-document in-flight guard.

use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::crawler::{CrawlOptions, Crawler};
use crate::embeddings::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::processing::{chunk_text, ChunkOptions, ExtractedText, TextExtractor};
use crate::storage::text_index::TextIndexEntry;
use crate::storage::{DocumentStore, TextIndex, VectorStore};
use crate::types::{ChunkRecord, DocumentRecord, DocumentStatus, SearchFilter, SourceKind};

/// Embedding batches in flight at once.
const EMBED_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub enum IngestSource {
    UploadBytes { bytes: Vec<u8>, filename: String },
    RawText { text: String },
    CrawlUrl { url: String },
}

impl IngestSource {
    fn source_kind(&self) -> SourceKind {
        match self {
            IngestSource::UploadBytes { .. } => SourceKind::Upload,
            IngestSource::RawText { .. } => SourceKind::ManualText,
            IngestSource::CrawlUrl { .. } => SourceKind::UrlCrawl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestMetadata {
    pub title: String,
    pub filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub id: Uuid,
    pub status: DocumentStatus,
    pub vector_count: u32,
    pub source_type: SourceKind,
}

pub struct IngestionPipeline {
    documents: Arc<DocumentStore>,
    vectors: Arc<VectorStore>,
    text_index: Arc<TextIndex>,
    embeddings: Arc<dyn EmbeddingProvider>,
    extractor: Arc<TextExtractor>,
    crawler: Arc<Crawler>,
    chunking: ChunkingConfig,
    collection: String,
    embed_batch_size: usize,
    /// When set, chunks and documents carry this source kind instead of the
    /// one implied by the source (the grundsatz pipeline uses it).
    kind_override: Option<SourceKind>,
    in_flight: DashMap<Uuid, ()>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        documents: Arc<DocumentStore>,
        vectors: Arc<VectorStore>,
        text_index: Arc<TextIndex>,
        embeddings: Arc<dyn EmbeddingProvider>,
        extractor: Arc<TextExtractor>,
        crawler: Arc<Crawler>,
        chunking: ChunkingConfig,
        collection: String,
        embed_batch_size: usize,
    ) -> Self {
        Self {
            documents,
            vectors,
            text_index,
            embeddings,
            extractor,
            crawler,
            chunking,
            collection,
            embed_batch_size: embed_batch_size.max(1),
            kind_override: None,
            in_flight: DashMap::new(),
        }
    }

    /// Pipeline variant whose documents are all tagged with a fixed source
    /// kind regardless of how they arrive.
    pub fn with_kind_override(mut self, kind: SourceKind) -> Self {
        self.kind_override = Some(kind);
        self
    }

    fn effective_kind(&self, source: &IngestSource) -> SourceKind {
        self.kind_override.unwrap_or_else(|| source.source_kind())
    }

    /// Ingest a new document. Terminal status is `Completed` or `Failed`;
    /// a failed run records its reason in the document metadata.
    pub async fn ingest(
        &self,
        owner_id: &str,
        source: IngestSource,
        metadata: IngestMetadata,
    ) -> Result<IngestOutcome> {
        if owner_id.trim().is_empty() {
            return Err(Error::InvalidInput("missing owner".into()));
        }

        let id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let record = DocumentRecord {
            id,
            owner_id: owner_id.to_string(),
            title: metadata.title.clone(),
            filename: metadata.filename.clone(),
            source_type: self.effective_kind(&source),
            status: DocumentStatus::Pending,
            vector_count: 0,
            file_size: match &source {
                IngestSource::UploadBytes { bytes, .. } => bytes.len() as u64,
                IngestSource::RawText { text } => text.len() as u64,
                IngestSource::CrawlUrl { .. } => 0,
            },
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.documents.insert(&record).await?;

        self.run(owner_id, id, source, metadata).await
    }

    /// Re-run ingestion for an existing owned document, replacing its
    /// chunks. Point ids are deterministic in `(doc_id, chunk_index)`, so a
    /// re-ingest of the same source leaves the collection point count stable.
    pub async fn reingest(
        &self,
        owner_id: &str,
        id: Uuid,
        source: IngestSource,
    ) -> Result<IngestOutcome> {
        let existing = self.documents.get(owner_id, id).await?;
        let metadata = IngestMetadata {
            title: existing.title,
            filename: existing.filename,
        };
        self.run(owner_id, id, source, metadata).await
    }

    async fn run(
        &self,
        owner_id: &str,
        id: Uuid,
        source: IngestSource,
        metadata: IngestMetadata,
    ) -> Result<IngestOutcome> {
        let _guard = self.acquire(id)?;
        let source_type = self.effective_kind(&source);

        match self.process(owner_id, id, &source, &metadata).await {
            Ok((vector_count, side_metadata)) => {
                self.documents
                    .finish(id, DocumentStatus::Completed, vector_count, &side_metadata)
                    .await?;
                tracing::info!(doc_id = %id, chunks = vector_count, "document ingested");
                Ok(IngestOutcome {
                    id,
                    status: DocumentStatus::Completed,
                    vector_count,
                    source_type,
                })
            }
            Err(e) => {
                let failure = serde_json::json!({ "error": e.to_string() });
                if let Err(persist_err) = self
                    .documents
                    .finish(id, DocumentStatus::Failed, 0, &failure)
                    .await
                {
                    tracing::error!(doc_id = %id, error = %persist_err, "failed to record ingest failure");
                }
                tracing::warn!(doc_id = %id, error = %e, "ingestion failed");
                Ok(IngestOutcome {
                    id,
                    status: DocumentStatus::Failed,
                    vector_count: 0,
                    source_type,
                })
            }
        }
    }

    async fn process(
        &self,
        owner_id: &str,
        id: Uuid,
        source: &IngestSource,
        metadata: &IngestMetadata,
    ) -> Result<(u32, serde_json::Value)> {
        self.documents.set_status(id, DocumentStatus::Processing).await?;

        let (text, mut side_metadata) = self.obtain_text(source).await?;

        self.documents
            .set_status(id, DocumentStatus::ProcessingEmbeddings)
            .await?;

        let options = ChunkOptions {
            max_tokens: self.chunking.max_tokens,
            overlap_tokens: self.chunking.overlap_tokens,
            preserve_structure: self.chunking.preserve_structure,
        };
        let chunks = chunk_text(&text, &options);
        if chunks.is_empty() {
            return Err(Error::Permanent("no text: nothing to index".into()));
        }

        let vectors = self.embed_chunks(&chunks).await?;

        let now = chrono::Utc::now().timestamp();
        let doc_id = id.to_string();
        let filename = metadata.filename.clone().unwrap_or_default();
        let source_kind = self.effective_kind(source).as_str().to_string();

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(vectors.into_iter())
            .map(|(chunk, vector)| ChunkRecord {
                doc_id: doc_id.clone(),
                chunk_index: chunk.index as u32,
                owner_id: owner_id.to_string(),
                source_type: source_kind.clone(),
                title: metadata.title.clone(),
                filename: filename.clone(),
                text: chunk.text.clone(),
                token_count: chunk.token_count as u32,
                vector,
                created_at: now,
            })
            .collect();

        // Replace any chunks from a previous run of this document before
        // inserting, keeping re-ingestion idempotent even when the new
        // chunking produces fewer chunks than the old one.
        let predicate = SearchFilter::for_doc(&doc_id)
            .to_predicate()
            .expect("doc filter is never empty");
        self.vectors.delete(&self.collection, &predicate).await?;
        self.text_index.delete_by_doc_id(&doc_id)?;

        self.vectors.upsert(&self.collection, &records).await?;

        let entries: Vec<TextIndexEntry<'_>> = records
            .iter()
            .map(|record| TextIndexEntry {
                collection: &self.collection,
                doc_id: &record.doc_id,
                owner_id: &record.owner_id,
                chunk_index: record.chunk_index,
                text: &record.text,
                title: &record.title,
            })
            .collect();
        self.text_index.index_batch(&entries)?;
        self.text_index.commit()?;

        let preview: String = text.chars().take(200).collect();
        side_metadata["word_count"] = serde_json::json!(text.split_whitespace().count());
        side_metadata["content_preview"] = serde_json::json!(preview);

        Ok((records.len() as u32, side_metadata))
    }

    async fn obtain_text(&self, source: &IngestSource) -> Result<(String, serde_json::Value)> {
        match source {
            IngestSource::UploadBytes { bytes, filename } => {
                let extractor = Arc::clone(&self.extractor);
                let bytes = bytes.clone();
                let filename = filename.clone();
                let ExtractedText { text, stats } =
                    tokio::task::spawn_blocking(move || extractor.extract(&bytes, &filename))
                        .await
                        .map_err(|e| Error::Permanent(format!("extraction task: {e}")))??;
                let side = serde_json::json!({
                    "extraction_method": stats.method,
                    "pages_processed": stats.pages_processed,
                    "pages_with_direct_text": stats.pages_with_direct_text,
                    "pages_with_ocr": stats.pages_with_ocr,
                    "extraction_ms": stats.timing_ms,
                });
                Ok((text, side))
            }
            IngestSource::RawText { text } => {
                if text.trim().is_empty() {
                    return Err(Error::Permanent("no text: empty input".into()));
                }
                Ok((text.clone(), serde_json::json!({})))
            }
            IngestSource::CrawlUrl { url } => {
                let result = self.crawler.crawl(url, &CrawlOptions::default()).await;
                if !result.success {
                    return Err(Error::Permanent(format!(
                        "crawl failed: {}",
                        result.error.unwrap_or_else(|| "unknown".into())
                    )));
                }
                let side = serde_json::json!({
                    "original_url": result.final_url,
                    "crawl_title": result.title,
                    "crawl_word_count": result.word_count,
                });
                Ok((result.markdown, side))
            }
        }
    }

    /// Batched embedding with bounded concurrency; batch order is restored
    /// before the vectors are zipped back to their chunks.
    async fn embed_chunks(&self, chunks: &[crate::processing::Chunk]) -> Result<Vec<Vec<f32>>> {
        let batches: Vec<(usize, Vec<String>)> = chunks
            .chunks(self.embed_batch_size)
            .enumerate()
            .map(|(i, batch)| (i, batch.iter().map(|c| c.text.clone()).collect()))
            .collect();

        let mut indexed: Vec<(usize, Vec<Vec<f32>>)> = futures::stream::iter(batches)
            .map(|(i, texts)| {
                let embeddings = Arc::clone(&self.embeddings);
                async move {
                    let vectors = embeddings.embed_batch(&texts, "search_document").await?;
                    Ok::<_, Error>((i, vectors))
                }
            })
            .buffer_unordered(EMBED_CONCURRENCY)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        indexed.sort_by_key(|(i, _)| *i);
        Ok(indexed.into_iter().flat_map(|(_, vectors)| vectors).collect())
    }

    /// Delete a document and cascade to its chunks in both indexes.
    pub async fn delete(&self, owner_id: &str, id: Uuid) -> Result<()> {
        self.documents.delete(owner_id, id).await?;

        let doc_id = id.to_string();
        let predicate = SearchFilter::for_doc(&doc_id)
            .to_predicate()
            .expect("doc filter is never empty");
        let removed = self.vectors.delete(&self.collection, &predicate).await?;
        self.text_index.delete_by_doc_id(&doc_id)?;
        self.text_index.commit()?;

        tracing::info!(doc_id = %id, chunks = removed, "document deleted");
        Ok(())
    }

    /// Bulk delete; per-id failures are collected, not fatal.
    pub async fn bulk_delete(&self, owner_id: &str, ids: &[Uuid]) -> Vec<(Uuid, Result<()>)> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            outcomes.push((id, self.delete(owner_id, id).await));
        }
        outcomes
    }

    fn acquire(&self, id: Uuid) -> Result<InFlightGuard<'_>> {
        if self.in_flight.insert(id, ()).is_some() {
            return Err(Error::InvalidInput(format!(
                "ingestion already in flight for document {id}"
            )));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            id,
        })
    }
}

struct InFlightGuard<'a> {
    set: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}
