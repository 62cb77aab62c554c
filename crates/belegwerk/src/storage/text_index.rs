//! Tantivy keyword index over chunk payloads.
//!
//! Tokenization: unicode word segmentation via the simple tokenizer, tokens
//! longer than 50 characters dropped, lowercase folding. Tokens shorter than
//! 2 characters are removed when the query string is built, which keeps the
//! rule verifiable without a custom filter on the indexing side.

use anyhow::{Context, Result as AnyResult};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{
    self, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value as TantivyValue,
    STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::error::{Error, Result};

const ANALYZER_NAME: &str = "folded";
const MIN_TOKEN_LEN: usize = 2;
const MAX_TOKEN_LEN: usize = 50;

pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    collection_field: schema::Field,
    doc_id_field: schema::Field,
    owner_field: schema::Field,
    chunk_index_field: schema::Field,
    text_field: schema::Field,
    title_field: schema::Field,
}

struct Fields {
    id: schema::Field,
    collection: schema::Field,
    doc_id: schema::Field,
    owner: schema::Field,
    chunk_index: schema::Field,
    text: schema::Field,
    title: schema::Field,
}

/// One chunk to index: `(collection, doc_id, owner_id, chunk_index, text, title)`.
pub struct TextIndexEntry<'a> {
    pub collection: &'a str,
    pub doc_id: &'a str,
    pub owner_id: &'a str,
    pub chunk_index: u32,
    pub text: &'a str,
    pub title: &'a str,
}

impl TextIndex {
    /// `id` is STRING (indexed, untokenized) so `delete_term` works.
    fn build_schema() -> (Schema, Fields) {
        let text_indexing = TextFieldIndexing::default()
            .set_tokenizer(ANALYZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let body_options = TextOptions::default()
            .set_indexing_options(text_indexing.clone())
            .set_stored();
        let title_options = TextOptions::default().set_indexing_options(text_indexing);

        let mut sb = Schema::builder();
        let id = sb.add_text_field("id", STRING | STORED);
        let collection = sb.add_text_field("collection", STRING | STORED);
        let doc_id = sb.add_text_field("doc_id", STRING | STORED);
        let owner = sb.add_text_field("owner_id", STRING | STORED);
        let chunk_index = sb.add_u64_field("chunk_index", schema::STORED);
        let text = sb.add_text_field("text", body_options);
        let title = sb.add_text_field("title", title_options);
        (
            sb.build(),
            Fields {
                id,
                collection,
                doc_id,
                owner,
                chunk_index,
                text,
                title,
            },
        )
    }

    fn analyzer() -> TextAnalyzer {
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
            .filter(LowerCaser)
            .build()
    }

    pub fn new(data_dir: &str) -> Result<Self> {
        Self::open(data_dir).map_err(|e| Error::Permanent(format!("text index init: {e}")))
    }

    fn open(data_dir: &str) -> AnyResult<Self> {
        let index_path = Path::new(data_dir).join("tantivy_index");
        std::fs::create_dir_all(&index_path).ok();

        let (schema, fields) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(&index_path)?
        } else {
            Index::create_in_dir(&index_path, schema)?
        };
        index.tokenizers().register(ANALYZER_NAME, Self::analyzer());

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("tantivy reader")?;

        let writer = index.writer(50_000_000).context("tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field: fields.id,
            collection_field: fields.collection,
            doc_id_field: fields.doc_id,
            owner_field: fields.owner,
            chunk_index_field: fields.chunk_index,
            text_field: fields.text,
            title_field: fields.title,
        })
    }

    pub fn index_batch(&self, entries: &[TextIndexEntry<'_>]) -> Result<()> {
        let writer = self.writer.lock();
        for entry in entries {
            let id = format!("{}:{}", entry.doc_id, entry.chunk_index);
            writer
                .add_document(doc!(
                    self.id_field => id,
                    self.collection_field => entry.collection,
                    self.doc_id_field => entry.doc_id,
                    self.owner_field => entry.owner_id,
                    self.chunk_index_field => u64::from(entry.chunk_index),
                    self.text_field => entry.text,
                    self.title_field => entry.title,
                ))
                .map_err(|e| Error::Transient(format!("text index add: {e}")))?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .commit()
            .map_err(|e| Error::Transient(format!("text index commit: {e}")))?;
        self.reader
            .reload()
            .map_err(|e| Error::Transient(format!("text index reload: {e}")))?;
        Ok(())
    }

    /// Normalize a raw query to the index's token rules: lowercase, drop
    /// tokens outside the 2..50 length bounds, strip query-parser syntax.
    pub fn normalize_query(query: &str) -> String {
        query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&t.chars().count()))
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Keyword search ordered by textual relevance, post-filtered by
    /// collection, owner, and optional doc-id scope. Over-fetches to keep
    /// filtered result counts balanced with the vector branch.
    pub fn search_text(
        &self,
        collection: &str,
        query: &str,
        owner_id: Option<&str>,
        doc_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let normalized = Self::normalize_query(query);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser =
            QueryParser::for_index(&self.index, vec![self.text_field, self.title_field]);
        let parsed = query_parser
            .parse_query(&normalized)
            .map_err(|e| Error::Permanent(format!("text query parse: {e}")))?;

        let fetch_limit = limit * 3;
        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(fetch_limit.max(limit)))
            .map_err(|e| Error::Transient(format!("text search: {e}")))?;

        let mut results = Vec::with_capacity(limit);
        for (score, addr) in top_docs {
            let Ok(stored) = searcher.doc::<TantivyDocument>(addr) else {
                continue;
            };

            let field_str = |field: schema::Field| {
                stored
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };

            if field_str(self.collection_field) != collection {
                continue;
            }
            let doc_owner = field_str(self.owner_field);
            if let Some(owner) = owner_id {
                if doc_owner != owner {
                    continue;
                }
            }
            let doc_id = field_str(self.doc_id_field);
            if let Some(scope) = doc_ids {
                if !scope.iter().any(|id| id == &doc_id) {
                    continue;
                }
            }

            let chunk_index = stored
                .get_first(self.chunk_index_field)
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;

            results.push(TextHit {
                doc_id,
                chunk_index,
                text: field_str(self.text_field),
                score,
            });
            if results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    pub fn delete_by_doc_id(&self, doc_id: &str) -> Result<()> {
        let writer = self.writer.lock();
        let term = tantivy::Term::from_field_text(self.doc_id_field, doc_id);
        writer.delete_term(term);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}

#[derive(Debug, Clone)]
pub struct TextHit {
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry<'a>(
        collection: &'a str,
        doc_id: &'a str,
        owner: &'a str,
        chunk_index: u32,
        text: &'a str,
    ) -> TextIndexEntry<'a> {
        TextIndexEntry {
            collection,
            doc_id,
            owner_id: owner,
            chunk_index,
            text,
            title: "Testdokument",
        }
    }

    #[test]
    fn normalize_drops_short_and_long_tokens() {
        let long = "x".repeat(60);
        let raw = format!("A Klimaschutz in {} Stadt", long);
        let normalized = TextIndex::normalize_query(&raw);
        assert_eq!(normalized, "klimaschutz in stadt");
    }

    #[test]
    fn search_is_owner_scoped() {
        let dir = TempDir::new().unwrap();
        let index = TextIndex::new(dir.path().to_str().unwrap()).unwrap();

        index
            .index_batch(&[
                entry("chunks", "d1", "alice", 0, "Kommunaler Klimaschutz in Freiburg"),
                entry("chunks", "d2", "bob", 0, "Klimaschutz und Verkehrswende"),
            ])
            .unwrap();
        index.commit().unwrap();

        let hits = index
            .search_text("chunks", "Klimaschutz", Some("alice"), None, 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d1");
    }

    #[test]
    fn search_honors_doc_id_scope() {
        let dir = TempDir::new().unwrap();
        let index = TextIndex::new(dir.path().to_str().unwrap()).unwrap();

        index
            .index_batch(&[
                entry("chunks", "d1", "alice", 0, "Radverkehr Ausbau Konzept"),
                entry("chunks", "d2", "alice", 0, "Radverkehr Finanzierung"),
            ])
            .unwrap();
        index.commit().unwrap();

        let scope = vec!["d2".to_string()];
        let hits = index
            .search_text("chunks", "Radverkehr", Some("alice"), Some(&scope), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d2");
    }

    #[test]
    fn delete_by_doc_id_removes_all_chunks() {
        let dir = TempDir::new().unwrap();
        let index = TextIndex::new(dir.path().to_str().unwrap()).unwrap();

        index
            .index_batch(&[
                entry("chunks", "d1", "alice", 0, "Haushaltsplan Abschnitt eins"),
                entry("chunks", "d1", "alice", 1, "Haushaltsplan Abschnitt zwei"),
            ])
            .unwrap();
        index.commit().unwrap();

        index.delete_by_doc_id("d1").unwrap();
        index.commit().unwrap();

        let hits = index
            .search_text("chunks", "Haushaltsplan", Some("alice"), None, 10)
            .unwrap();
        assert!(hits.is_empty());
    }
}
