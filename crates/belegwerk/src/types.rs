use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner id of the curated official-documents corpus. Grundsatz documents
/// are shared across tenants under this synthetic owner.
pub const GRUNDSATZ_OWNER: &str = "grundsatz";

/// Where a document's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Upload,
    ManualText,
    UrlCrawl,
    Grundsatz,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Upload => "upload",
            SourceKind::ManualText => "manual_text",
            SourceKind::UrlCrawl => "url_crawl",
            SourceKind::Grundsatz => "grundsatz",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(SourceKind::Upload),
            "manual_text" => Some(SourceKind::ManualText),
            "url_crawl" => Some(SourceKind::UrlCrawl),
            "grundsatz" => Some(SourceKind::Grundsatz),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    ProcessingEmbeddings,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::ProcessingEmbeddings => "processing_embeddings",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "processing_embeddings" => Some(DocumentStatus::ProcessingEmbeddings),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// Document metadata row, persisted in the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub filename: Option<String>,
    pub source_type: SourceKind,
    pub status: DocumentStatus,
    pub vector_count: u32,
    pub file_size: u64,
    /// Opaque side-metadata: extraction method, original URL, word count,
    /// content preview.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk payload as stored in the vector index.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub doc_id: String,
    pub chunk_index: u32,
    pub owner_id: String,
    pub source_type: String,
    pub title: String,
    pub filename: String,
    pub text: String,
    pub token_count: u32,
    pub vector: Vec<f32>,
    pub created_at: i64,
}

impl ChunkRecord {
    /// Deterministic point id: FNV-1a over `doc_id:chunk_index`.
    /// std's DefaultHasher is not stable across releases, so it is not used.
    pub fn point_id(&self) -> u64 {
        point_id(&self.doc_id, self.chunk_index)
    }
}

pub fn point_id(doc_id: &str, chunk_index: u32) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in doc_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= u64::from(b':');
    hash = hash.wrapping_mul(FNV_PRIME);
    for byte in chunk_index.to_string().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Tenant-scoped filter over chunk payloads.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub owner_id: Option<String>,
    pub doc_ids: Option<Vec<String>>,
    pub source_type: Option<String>,
}

impl SearchFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn with_doc_ids(mut self, ids: Vec<String>) -> Self {
        self.doc_ids = Some(ids);
        self
    }

    pub fn for_doc(doc_id: &str) -> Self {
        Self {
            doc_ids: Some(vec![doc_id.to_string()]),
            ..Self::default()
        }
    }

    /// Render as a Lance SQL predicate. Single quotes are doubled so values
    /// cannot break out of the literal.
    pub fn to_predicate(&self) -> Option<String> {
        let mut predicates = Vec::new();

        if let Some(ref owner) = self.owner_id {
            predicates.push(format!("owner_id = '{}'", owner.replace('\'', "''")));
        }
        if let Some(ref ids) = self.doc_ids {
            if ids.is_empty() {
                // An empty scope matches nothing rather than everything.
                predicates.push("doc_id = ''".to_string());
            } else {
                let list = ids
                    .iter()
                    .map(|id| format!("'{}'", id.replace('\'', "''")))
                    .collect::<Vec<_>>()
                    .join(", ");
                predicates.push(format!("doc_id IN ({})", list));
            }
        }
        if let Some(ref kind) = self.source_type {
            predicates.push(format!("source_type = '{}'", kind.replace('\'', "''")));
        }

        if predicates.is_empty() {
            None
        } else {
            Some(predicates.join(" AND "))
        }
    }
}

/// A numbered source handed to the drafting model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: u32,
    pub title: String,
    pub snippets: Vec<String>,
    pub url: Option<String>,
    pub source_kind: String,
    pub similarity_score: Option<f32>,
    pub chunk_index: Option<u32>,
}

/// A `[n]` marker found in a draft, resolved against the reference map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationMarker {
    pub marker_id: u32,
    pub reference_id: u32,
}

/// One normalized hit from the meta-search aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub rank: usize,
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Full page content, present once the crawler has enriched the hit.
    pub content: Option<String>,
    pub domain: String,
    pub engine: String,
    pub score: f32,
    pub published_date: Option<String>,
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedValue {
    High,
    Medium,
    Low,
}

/// One URL the graph decided to crawl, with the model's reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlDecision {
    pub result_index: usize,
    pub url: String,
    pub reason: String,
    pub expected_value: ExpectedValue,
}

/// The one shape downstream consumers see, regardless of where a piece of
/// grounding text came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentRef {
    Chunk {
        doc_id: String,
        chunk_index: u32,
        text: String,
        title: String,
        score: f32,
    },
    FullText {
        doc_id: String,
        title: String,
        text: String,
        chunk_count: u32,
    },
    SearchHit {
        url: String,
        title: String,
        snippet: String,
    },
    CrawledPage {
        url: String,
        title: String,
        markdown: String,
        word_count: usize,
    },
}

impl DocumentRef {
    pub fn title(&self) -> &str {
        match self {
            DocumentRef::Chunk { title, .. } => title,
            DocumentRef::FullText { title, .. } => title,
            DocumentRef::SearchHit { title, .. } => title,
            DocumentRef::CrawledPage { title, .. } => title,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            DocumentRef::Chunk { text, .. } => text,
            DocumentRef::FullText { text, .. } => text,
            DocumentRef::SearchHit { snippet, .. } => snippet,
            DocumentRef::CrawledPage { markdown, .. } => markdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_deterministic_and_distinct() {
        let a = point_id("doc-1", 0);
        let b = point_id("doc-1", 0);
        let c = point_id("doc-1", 1);
        let d = point_id("doc-2", 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn filter_predicate_escapes_quotes() {
        let filter = SearchFilter::owner("o'brien");
        let predicate = filter.to_predicate().unwrap();
        assert!(predicate.contains("o''brien"));
    }

    #[test]
    fn empty_doc_scope_matches_nothing() {
        let filter = SearchFilter::owner("u1").with_doc_ids(vec![]);
        let predicate = filter.to_predicate().unwrap();
        assert!(predicate.contains("doc_id = ''"));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::ProcessingEmbeddings,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
    }
}
