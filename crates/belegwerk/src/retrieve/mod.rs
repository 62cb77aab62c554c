//! Hybrid retrieval: dense + lexical fusion with dynamic thresholds and
//! owner-tenanted scoping.

pub mod fusion;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::storage::{ChunkHit, TextIndex, VectorStore};
use crate::types::SearchFilter;
use fusion::{dynamic_threshold, weighted_rrf, Branch, FusedHit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Text,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub limit: usize,
    pub mode: SearchMode,
    pub document_ids: Option<Vec<String>>,
    pub vector_weight: f32,
    pub text_weight: f32,
    pub score_threshold: Option<f32>,
    /// Cap chunks per document after fusion; `None` leaves all in place.
    pub max_per_document: Option<usize>,
}

impl RetrieveOptions {
    pub fn hybrid(limit: usize) -> Self {
        Self {
            limit,
            mode: SearchMode::Hybrid,
            document_ids: None,
            vector_weight: 0.7,
            text_weight: 0.3,
            score_threshold: None,
            max_per_document: None,
        }
    }

    pub fn scoped(limit: usize, document_ids: Vec<String>) -> Self {
        Self {
            document_ids: Some(document_ids),
            ..Self::hybrid(limit)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub chunk_text: String,
    pub chunk_index: u32,
    pub similarity_score: f32,
    pub title: String,
    pub filename: String,
    pub source_type: String,
    /// Which branch(es) produced this chunk.
    pub relevance_info: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub vector_candidates: usize,
    pub text_candidates: usize,
    pub fused: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<RetrievedChunk>,
    pub search_type: String,
    pub stats: SearchStats,
}

pub struct HybridRetriever {
    vectors: Arc<VectorStore>,
    text_index: Arc<TextIndex>,
    embeddings: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
}

impl HybridRetriever {
    pub fn new(
        vectors: Arc<VectorStore>,
        text_index: Arc<TextIndex>,
        embeddings: Arc<dyn EmbeddingProvider>,
        config: SearchConfig,
    ) -> Self {
        Self {
            vectors,
            text_index,
            embeddings,
            config,
        }
    }

    /// Search the primary chunks collection.
    pub async fn search(
        &self,
        query: &str,
        owner_id: &str,
        options: &RetrieveOptions,
    ) -> Result<SearchOutcome> {
        self.search_in(&self.config.chunks_collection.clone(), query, owner_id, options)
            .await
    }

    /// Search a specific collection (grundsatz documents use their own).
    pub async fn search_in(
        &self,
        collection: &str,
        query: &str,
        owner_id: &str,
        options: &RetrieveOptions,
    ) -> Result<SearchOutcome> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("empty query".into()));
        }
        if owner_id.trim().is_empty() {
            return Err(Error::InvalidInput("missing owner".into()));
        }

        let filter = SearchFilter {
            owner_id: Some(owner_id.to_string()),
            doc_ids: options.document_ids.clone(),
            source_type: None,
        };

        match options.mode {
            SearchMode::Vector => {
                let (hits, stats) = self.vector_branch(collection, query, &filter, options).await?;
                Ok(self.assemble(hits, Vec::new(), Vec::new(), options, "vector", stats))
            }
            SearchMode::Text => {
                let (hits, stats) = self.text_branch(collection, query, &filter, options)?;
                let payloads = self.hydrate(collection, &hits, &[]).await;
                Ok(self.assemble(Vec::new(), hits, payloads, options, "text", stats))
            }
            SearchMode::Hybrid => self.hybrid(collection, query, &filter, options).await,
        }
    }

    async fn hybrid(
        &self,
        collection: &str,
        query: &str,
        filter: &SearchFilter,
        options: &RetrieveOptions,
    ) -> Result<SearchOutcome> {
        let text_outcome = self.text_branch(collection, query, filter, options);

        match self.vector_branch(collection, query, filter, options).await {
            Ok((vector_hits, mut stats)) => {
                let (text_hits, text_stats) = text_outcome.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "text branch failed, vector-only fusion");
                    (Vec::new(), SearchStats::default())
                });
                stats.text_candidates = text_stats.text_candidates;
                let payloads = self.hydrate(collection, &text_hits, &vector_hits).await;
                Ok(self.assemble(vector_hits, text_hits, payloads, options, "hybrid", stats))
            }
            Err(vector_err) => {
                // Vector backend down: degrade to lexical-only results.
                tracing::warn!(error = %vector_err, "vector branch failed, text fallback");
                match text_outcome {
                    Ok((text_hits, stats)) if !text_hits.is_empty() => Ok(self.assemble(
                        Vec::new(),
                        text_hits,
                        Vec::new(),
                        options,
                        "text_fallback",
                        stats,
                    )),
                    Ok(_) => Err(vector_err),
                    Err(_) => Err(vector_err),
                }
            }
        }
    }

    /// Fetch payloads for text hits the vector branch did not return, so
    /// lexical-only results still carry title and filename. Best-effort: a
    /// failing lookup degrades to the indexed text alone.
    async fn hydrate(
        &self,
        collection: &str,
        text_hits: &[crate::storage::text_index::TextHit],
        vector_hits: &[ChunkHit],
    ) -> Vec<ChunkHit> {
        let known: std::collections::HashSet<String> = vector_hits
            .iter()
            .map(|h| chunk_key(&h.doc_id, h.chunk_index))
            .collect();
        let missing: Vec<(String, u32)> = text_hits
            .iter()
            .filter(|h| !known.contains(&chunk_key(&h.doc_id, h.chunk_index)))
            .map(|h| (h.doc_id.clone(), h.chunk_index))
            .collect();
        if missing.is_empty() {
            return Vec::new();
        }
        self.vectors
            .get_by_keys(collection, &missing)
            .await
            .unwrap_or_default()
    }

    async fn vector_branch(
        &self,
        collection: &str,
        query: &str,
        filter: &SearchFilter,
        options: &RetrieveOptions,
    ) -> Result<(Vec<ChunkHit>, SearchStats)> {
        let query_vector = self.embeddings.embed(query, "search_query").await?;
        let candidates = options.limit * self.config.candidate_multiplier;

        let hits = self
            .vectors
            .search(
                collection,
                &query_vector,
                filter.to_predicate().as_deref(),
                candidates.max(options.limit),
                None,
            )
            .await?;

        let scores: Vec<f32> = hits.iter().map(|h| h.score).collect();
        let threshold = options.score_threshold.unwrap_or_else(|| {
            dynamic_threshold(&scores, self.config.relative_gap, self.config.score_floor)
        });

        let mut hits = hits;
        hits.retain(|h| h.score >= threshold);

        let stats = SearchStats {
            vector_candidates: hits.len(),
            text_candidates: 0,
            fused: 0,
            threshold,
        };
        Ok((hits, stats))
    }

    fn text_branch(
        &self,
        collection: &str,
        query: &str,
        filter: &SearchFilter,
        options: &RetrieveOptions,
    ) -> Result<(Vec<crate::storage::text_index::TextHit>, SearchStats)> {
        let candidates = options.limit * self.config.candidate_multiplier;
        let hits = self.text_index.search_text(
            collection,
            query,
            filter.owner_id.as_deref(),
            filter.doc_ids.as_deref(),
            candidates.max(options.limit),
        )?;
        let stats = SearchStats {
            vector_candidates: 0,
            text_candidates: hits.len(),
            fused: 0,
            threshold: 0.0,
        };
        Ok((hits, stats))
    }

    fn assemble(
        &self,
        vector_hits: Vec<ChunkHit>,
        text_hits: Vec<crate::storage::text_index::TextHit>,
        extra_payloads: Vec<ChunkHit>,
        options: &RetrieveOptions,
        search_type: &str,
        mut stats: SearchStats,
    ) -> SearchOutcome {
        let vector_ranked: Vec<(String, f32)> = vector_hits
            .iter()
            .map(|h| (chunk_key(&h.doc_id, h.chunk_index), h.score))
            .collect();
        let text_ranked: Vec<(String, f32)> = text_hits
            .iter()
            .map(|h| (chunk_key(&h.doc_id, h.chunk_index), h.score))
            .collect();

        let fused = weighted_rrf(
            &vector_ranked,
            &text_ranked,
            self.config.rrf_k,
            options.vector_weight,
            options.text_weight,
        );
        stats.fused = fused.len();

        let payload_map: HashMap<String, &ChunkHit> = vector_hits
            .iter()
            .chain(extra_payloads.iter())
            .map(|h| (chunk_key(&h.doc_id, h.chunk_index), h))
            .collect();
        let text_map: HashMap<String, &crate::storage::text_index::TextHit> = text_hits
            .iter()
            .map(|h| (chunk_key(&h.doc_id, h.chunk_index), h))
            .collect();

        let mut per_doc: HashMap<String, usize> = HashMap::new();
        let mut results = Vec::with_capacity(options.limit);

        for FusedHit {
            id,
            score,
            branch,
            vector_score: _,
        } in fused
        {
            if results.len() >= options.limit {
                break;
            }

            let chunk = match (payload_map.get(&id), text_map.get(&id)) {
                (Some(hit), _) => RetrievedChunk {
                    document_id: hit.doc_id.clone(),
                    chunk_text: hit.text.clone(),
                    chunk_index: hit.chunk_index,
                    similarity_score: score,
                    title: hit.title.clone(),
                    filename: hit.filename.clone(),
                    source_type: hit.source_type.clone(),
                    relevance_info: branch.label().to_string(),
                },
                (None, Some(hit)) => RetrievedChunk {
                    document_id: hit.doc_id.clone(),
                    chunk_text: hit.text.clone(),
                    chunk_index: hit.chunk_index,
                    similarity_score: score,
                    title: String::new(),
                    filename: String::new(),
                    source_type: String::new(),
                    relevance_info: Branch::Text.label().to_string(),
                },
                (None, None) => continue,
            };

            if let Some(cap) = options.max_per_document {
                let count = per_doc.entry(chunk.document_id.clone()).or_insert(0);
                if *count >= cap {
                    continue;
                }
                *count += 1;
            }

            results.push(chunk);
        }

        SearchOutcome {
            results,
            search_type: search_type.to_string(),
            stats,
        }
    }

    /// Number of stored chunks for one owned document.
    pub async fn chunk_count(&self, owner_id: &str, doc_id: &str) -> Result<usize> {
        let filter = SearchFilter {
            owner_id: Some(owner_id.to_string()),
            doc_ids: Some(vec![doc_id.to_string()]),
            source_type: None,
        };
        self.vectors
            .count(
                &self.config.chunks_collection,
                filter.to_predicate().as_deref(),
            )
            .await
    }

    /// Reconstruct a document's full text by scrolling its chunks and
    /// concatenating in ordinal order. The smart path for small documents.
    pub async fn full_document_text(
        &self,
        owner_id: &str,
        doc_id: &str,
    ) -> Result<(String, u32)> {
        let filter = SearchFilter {
            owner_id: Some(owner_id.to_string()),
            doc_ids: Some(vec![doc_id.to_string()]),
            source_type: None,
        };

        let mut chunks = self
            .vectors
            .scroll(
                &self.config.chunks_collection,
                filter.to_predicate().as_deref(),
                10_000,
                0,
            )
            .await?;

        if chunks.is_empty() {
            return Err(Error::NotFound(format!("document {doc_id}")));
        }

        chunks.sort_by_key(|c| c.chunk_index);
        let count = chunks.len() as u32;
        let text = chunks
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok((text, count))
    }
}

fn chunk_key(doc_id: &str, chunk_index: u32) -> String {
    format!("{doc_id}:{chunk_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builders_carry_scope() {
        let options = RetrieveOptions::scoped(5, vec!["d1".into(), "d2".into()]);
        assert_eq!(options.limit, 5);
        assert_eq!(options.mode, SearchMode::Hybrid);
        assert_eq!(options.document_ids.as_ref().unwrap().len(), 2);
        assert!((options.vector_weight - 0.7).abs() < 1e-6);
        assert!((options.text_weight - 0.3).abs() < 1e-6);
    }
}
