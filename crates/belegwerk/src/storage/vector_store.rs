//! LanceDB-backed vector collections with payload filtering.
//!
//! One logical connection is shared process-wide; a periodic health probe
//! reopens it after persistent failures so callers never handle connection
//! state themselves.

use anyhow::{Context, Result as AnyResult};
use arrow_array::{
    Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
    UInt64Array, FixedSizeListArray,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::ChunkRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadIndexKind {
    Keyword,
    Text,
    Tenant,
}

/// Declared payload index. Lance evaluates predicates without per-field
/// index objects, so declarations are recorded for contract parity and the
/// tenant field is simply required in every engine-built predicate.
#[derive(Debug, Clone)]
pub struct PayloadIndex {
    pub field: String,
    pub kind: PayloadIndexKind,
}

impl PayloadIndex {
    pub fn tenant(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: PayloadIndexKind::Tenant,
        }
    }

    pub fn keyword(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: PayloadIndexKind::Keyword,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub doc_id: String,
    pub chunk_index: u32,
    pub owner_id: String,
    pub source_type: String,
    pub title: String,
    pub filename: String,
    pub text: String,
    pub token_count: u32,
    pub score: f32,
}

pub struct VectorStore {
    path: String,
    dimension: usize,
    conn: RwLock<lancedb::Connection>,
}

impl VectorStore {
    pub async fn new(path: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let conn = Self::connect(path).await?;
        Ok(Self {
            path: path.to_string(),
            dimension,
            conn: RwLock::new(conn),
        })
    }

    async fn connect(path: &str) -> Result<lancedb::Connection> {
        lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| Error::Transient(format!("vector store connect: {e}")))
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("point_id", DataType::UInt64, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("owner_id", DataType::Utf8, false),
            Field::new("source_type", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("filename", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("token_count", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Create the collection if missing. Idempotent. Index declarations are
    /// logged; the tenant field is enforced by the predicates the engine
    /// builds rather than by a storage-side object.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        indexes: &[PayloadIndex],
    ) -> Result<()> {
        let conn = self.conn.read().await;
        let names = conn
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::Transient(format!("table listing: {e}")))?;
        if names.iter().any(|n| n == collection) {
            return Ok(());
        }

        self.create_table(&conn, collection)
            .await
            .map_err(|e| Error::Transient(format!("create collection {collection}: {e}")))?;

        for index in indexes {
            tracing::info!(
                collection,
                field = %index.field,
                kind = ?index.kind,
                "declared payload index"
            );
        }
        Ok(())
    }

    async fn create_table(&self, conn: &lancedb::Connection, collection: &str) -> AnyResult<()> {
        // Create with a single seed record, then delete it; LanceDB needs at
        // least one batch to fix the schema.
        let schema = self.schema();
        let seed_vec = vec![0.0f32; self.dimension];
        let values = Float32Array::from(seed_vec);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(UInt64Array::from(vec![0u64])),
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )
        .context("seed RecordBatch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        conn.create_table(collection, Box::new(batches))
            .execute()
            .await
            .context("create table")?;

        let table = conn.open_table(collection).execute().await?;
        table.delete("id = '__seed__'").await.ok();
        Ok(())
    }

    /// Open a table, reconnecting once if the cached connection has gone bad
    /// (persistent-connection errors, TLS renegotiation failures).
    async fn open_table(&self, collection: &str) -> Result<lancedb::Table> {
        {
            let conn = self.conn.read().await;
            if let Ok(table) = conn.open_table(collection).execute().await {
                return Ok(table);
            }
        }

        tracing::warn!(collection, "vector store table open failed, reconnecting");
        self.reconnect().await?;

        let conn = self.conn.read().await;
        conn.open_table(collection)
            .execute()
            .await
            .map_err(|e| Error::Transient(format!("open collection {collection}: {e}")))
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = Self::connect(&self.path).await?;
        *self.conn.write().await = fresh;
        tracing::info!(path = %self.path, "vector store reconnected");
        Ok(())
    }

    /// Liveness check used by the periodic probe.
    pub async fn health_check(&self) -> Result<()> {
        let conn = self.conn.read().await;
        conn.table_names()
            .execute()
            .await
            .map(|_| ())
            .map_err(|e| Error::Transient(format!("health probe: {e}")))
    }

    /// Spawn the background health probe; reconnects on failure. The handle
    /// is detached — the probe lives as long as the process.
    pub fn start_health_probe(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if store.health_check().await.is_err() {
                    if let Err(e) = store.reconnect().await {
                        tracing::error!(error = %e, "vector store reconnect failed");
                    }
                }
            }
        });
    }

    /// Insert chunk points. Existing points with the same `(doc_id,
    /// chunk_index)` are removed first, so re-ingestion replaces instead of
    /// accumulating.
    pub async fn upsert(&self, collection: &str, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let table = self.open_table(collection).await?;

        let id_list = chunks
            .iter()
            .map(|c| format!("'{}'", chunk_point_key(&c.doc_id, c.chunk_index)))
            .collect::<Vec<_>>()
            .join(", ");
        table
            .delete(&format!("id IN ({id_list})"))
            .await
            .map_err(|e| Error::Transient(format!("upsert pre-delete: {e}")))?;

        let batch = self
            .chunks_to_batch(chunks)
            .map_err(|e| Error::Permanent(format!("record batch: {e}")))?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema());
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::Transient(format!("upsert add: {e}")))?;

        tracing::debug!(collection, points = chunks.len(), "upserted chunk points");
        Ok(())
    }

    fn chunks_to_batch(&self, chunks: &[ChunkRecord]) -> AnyResult<RecordBatch> {
        let ids: Vec<String> = chunks
            .iter()
            .map(|c| chunk_point_key(&c.doc_id, c.chunk_index))
            .collect();
        let point_ids: Vec<u64> = chunks.iter().map(|c| c.point_id()).collect();
        let doc_ids: Vec<&str> = chunks.iter().map(|c| c.doc_id.as_str()).collect();
        let chunk_indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let owners: Vec<&str> = chunks.iter().map(|c| c.owner_id.as_str()).collect();
        let source_types: Vec<&str> = chunks.iter().map(|c| c.source_type.as_str()).collect();
        let titles: Vec<&str> = chunks.iter().map(|c| c.title.as_str()).collect();
        let filenames: Vec<&str> = chunks.iter().map(|c| c.filename.as_str()).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let token_counts: Vec<u32> = chunks.iter().map(|c| c.token_count).collect();
        let created_ats: Vec<i64> = chunks.iter().map(|c| c.created_at).collect();

        for chunk in chunks {
            anyhow::ensure!(
                chunk.vector.len() == self.dimension,
                "vector dimension {} does not match collection dimension {}",
                chunk.vector.len(),
                self.dimension
            );
        }

        let flat_vectors: Vec<f32> = chunks.iter().flat_map(|c| c.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(StringArray::from(
                    ids.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )) as Arc<dyn Array>,
                Arc::new(UInt64Array::from(point_ids)),
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(StringArray::from(owners)),
                Arc::new(StringArray::from(source_types)),
                Arc::new(StringArray::from(titles)),
                Arc::new(StringArray::from(filenames)),
                Arc::new(StringArray::from(texts)),
                Arc::new(UInt32Array::from(token_counts)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("chunk batch")
    }

    /// ANN search, cosine distance, descending score, optional payload filter
    /// and score threshold.
    pub async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        filter: Option<&str>,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ChunkHit>> {
        let table = self.open_table(collection).await?;

        let mut query = table
            .query()
            .nearest_to(query_vector)
            .map_err(|e| Error::Permanent(format!("vector query: {e}")))?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(limit);

        if let Some(predicate) = filter {
            query = query.only_if(predicate);
        }

        let results = query
            .execute()
            .await
            .map_err(|e| Error::Transient(format!("vector search: {e}")))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| Error::Transient(format!("vector search stream: {e}")))?;

        let mut hits = extract_hits(&batches);
        if let Some(threshold) = score_threshold {
            hits.retain(|h| h.score >= threshold);
        }
        Ok(hits)
    }

    /// Paged, unordered scan. Offset is applied client-side — Lance scans the
    /// filtered set in storage order, which is stable between writes.
    pub async fn scroll(
        &self,
        collection: &str,
        filter: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChunkHit>> {
        let table = self.open_table(collection).await?;

        let mut query = table.query().limit(limit + offset);
        if let Some(predicate) = filter {
            query = query.only_if(predicate);
        }

        let results = query
            .execute()
            .await
            .map_err(|e| Error::Transient(format!("scroll: {e}")))?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| Error::Transient(format!("scroll stream: {e}")))?;

        let mut hits = extract_hits(&batches);
        if offset > 0 {
            hits.drain(..offset.min(hits.len()));
        }
        Ok(hits)
    }

    /// Fetch specific points by `(doc_id, chunk_index)`; used to hydrate
    /// text-only fusion hits with their payloads.
    pub async fn get_by_keys(
        &self,
        collection: &str,
        keys: &[(String, u32)],
    ) -> Result<Vec<ChunkHit>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.open_table(collection).await?;
        let mut hits = Vec::new();

        // Batched to keep predicates short.
        for batch in keys.chunks(50) {
            let id_list = batch
                .iter()
                .map(|(doc_id, idx)| format!("'{}'", chunk_point_key(doc_id, *idx)))
                .collect::<Vec<_>>()
                .join(", ");
            let results = table
                .query()
                .only_if(format!("id IN ({id_list})"))
                .execute()
                .await
                .map_err(|e| Error::Transient(format!("point lookup: {e}")))?;
            let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
                .await
                .map_err(|e| Error::Transient(format!("point lookup stream: {e}")))?;
            hits.extend(extract_hits(&batches));
        }
        Ok(hits)
    }

    /// Delete every point matching the filter; returns the removed count.
    pub async fn delete(&self, collection: &str, filter: &str) -> Result<usize> {
        let table = self.open_table(collection).await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        table
            .delete(filter)
            .await
            .map_err(|e| Error::Transient(format!("delete: {e}")))?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    pub async fn count(&self, collection: &str, filter: Option<&str>) -> Result<usize> {
        let table = self.open_table(collection).await?;
        table
            .count_rows(filter.map(|f| f.to_string()))
            .await
            .map_err(|e| Error::Transient(format!("count: {e}")))
    }
}

/// Row key stored in the `id` column; pairs with the numeric `point_id`.
fn chunk_point_key(doc_id: &str, chunk_index: u32) -> String {
    format!("{}:{}", doc_id, chunk_index)
}

fn extract_hits(batches: &[RecordBatch]) -> Vec<ChunkHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let doc_ids = column_str(batch, "doc_id");
        let chunk_indices = batch
            .column_by_name("chunk_index")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let owners = column_str(batch, "owner_id");
        let source_types = column_str(batch, "source_type");
        let titles = column_str(batch, "title");
        let filenames = column_str(batch, "filename");
        let texts = column_str(batch, "text");
        let token_counts = batch
            .column_by_name("token_count")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(doc_ids), Some(texts)) = (doc_ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let doc_id = doc_ids.value(i);
            if doc_id == "__seed__" {
                continue;
            }
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            hits.push(ChunkHit {
                doc_id: doc_id.to_string(),
                chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                owner_id: owners.map(|o| o.value(i).to_string()).unwrap_or_default(),
                source_type: source_types
                    .map(|s| s.value(i).to_string())
                    .unwrap_or_default(),
                title: titles.map(|t| t.value(i).to_string()).unwrap_or_default(),
                filename: filenames.map(|f| f.value(i).to_string()).unwrap_or_default(),
                text: texts.value(i).to_string(),
                token_count: token_counts.map(|t| t.value(i)).unwrap_or(0),
                score,
            });
        }
    }
    hits
}

fn column_str<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::point_id;

    #[test]
    fn point_keys_compose_doc_and_ordinal() {
        assert_eq!(chunk_point_key("d1", 3), "d1:3");
        assert_ne!(
            point_id("d1", 3),
            point_id("d1", 30),
            "distinct ordinals must hash differently"
        );
    }
}
