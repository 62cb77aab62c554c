//! Relational store for document metadata (SQLite via sqlx).

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DocumentRecord, DocumentStatus, SourceKind};

pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::Transient(format!("document store connect: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                filename TEXT,
                source_type TEXT NOT NULL,
                status TEXT NOT NULL,
                vector_count INTEGER NOT NULL DEFAULT 0,
                file_size INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Permanent(format!("document store schema: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id)")
            .execute(&pool)
            .await
            .map_err(|e| Error::Permanent(format!("document store index: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn insert(&self, doc: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, owner_id, title, filename, source_type, status, vector_count,
                 file_size, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc.id.to_string())
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(&doc.filename)
        .bind(doc.source_type.as_str())
        .bind(doc.status.as_str())
        .bind(doc.vector_count as i64)
        .bind(doc.file_size as i64)
        .bind(doc.metadata.to_string())
        .bind(doc.created_at.timestamp())
        .bind(doc.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Transient(format!("document insert: {e}")))?;
        Ok(())
    }

    /// Owner-scoped fetch; `NotFound` covers both absence and foreign
    /// ownership so callers cannot probe for other tenants' ids.
    pub async fn get(&self, owner_id: &str, id: Uuid) -> Result<DocumentRecord> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ? AND owner_id = ?")
            .bind(id.to_string())
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Transient(format!("document get: {e}")))?;

        row.map(row_to_record)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<DocumentRecord>> {
        let rows =
            sqlx::query("SELECT * FROM documents WHERE owner_id = ? ORDER BY created_at DESC")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::Transient(format!("document list: {e}")))?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub async fn set_status(&self, id: Uuid, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Transient(format!("document status update: {e}")))?;
        Ok(())
    }

    pub async fn finish(
        &self,
        id: Uuid,
        status: DocumentStatus,
        vector_count: u32,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?, vector_count = ?, metadata_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(vector_count as i64)
        .bind(metadata.to_string())
        .bind(chrono::Utc::now().timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Transient(format!("document finish: {e}")))?;
        Ok(())
    }

    /// Delete an owned document row. Returns `NotFound` when nothing matched.
    pub async fn delete(&self, owner_id: &str, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ? AND owner_id = ?")
            .bind(id.to_string())
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Transient(format!("document delete: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("document {id}")));
        }
        Ok(())
    }

    pub async fn count_for_owner(&self, owner_id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM documents WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Transient(format!("document count: {e}")))?;
        let n: i64 = row.try_get("n").unwrap_or(0);
        Ok(n as u64)
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
    let get_str = |name: &str| -> Result<String> {
        row.try_get::<String, _>(name)
            .map_err(|e| Error::Permanent(format!("document row {name}: {e}")))
    };

    let id = Uuid::from_str(&get_str("id")?)
        .map_err(|e| Error::Permanent(format!("document row id: {e}")))?;
    let source_type = SourceKind::parse(&get_str("source_type")?)
        .ok_or_else(|| Error::Permanent("document row: unknown source_type".into()))?;
    let status = DocumentStatus::parse(&get_str("status")?)
        .ok_or_else(|| Error::Permanent("document row: unknown status".into()))?;
    let metadata: serde_json::Value =
        serde_json::from_str(&get_str("metadata_json")?).unwrap_or(serde_json::Value::Null);

    let created_at: i64 = row.try_get("created_at").unwrap_or(0);
    let updated_at: i64 = row.try_get("updated_at").unwrap_or(0);

    Ok(DocumentRecord {
        id,
        owner_id: get_str("owner_id")?,
        title: get_str("title")?,
        filename: row.try_get::<Option<String>, _>("filename").unwrap_or(None),
        source_type,
        status,
        vector_count: row.try_get::<i64, _>("vector_count").unwrap_or(0) as u32,
        file_size: row.try_get::<i64, _>("file_size").unwrap_or(0) as u64,
        metadata,
        created_at: chrono::DateTime::from_timestamp(created_at, 0)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(owner: &str, title: &str) -> DocumentRecord {
        let now = Utc::now();
        DocumentRecord {
            id: Uuid::new_v4(),
            owner_id: owner.to_string(),
            title: title.to_string(),
            filename: Some("akte.pdf".to_string()),
            source_type: SourceKind::Upload,
            status: DocumentStatus::Pending,
            vector_count: 0,
            file_size: 1234,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_get_is_owner_scoped() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(&dir.path().join("docs.db")).await.unwrap();

        let doc = record("alice", "Haushaltsplan");
        store.insert(&doc).await.unwrap();

        let fetched = store.get("alice", doc.id).await.unwrap();
        assert_eq!(fetched.title, "Haushaltsplan");

        let foreign = store.get("bob", doc.id).await;
        assert!(matches!(foreign, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn status_walk_and_vector_count_persist() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(&dir.path().join("docs.db")).await.unwrap();

        let doc = record("alice", "Satzung");
        store.insert(&doc).await.unwrap();
        store.set_status(doc.id, DocumentStatus::Processing).await.unwrap();
        store
            .finish(
                doc.id,
                DocumentStatus::Completed,
                7,
                &serde_json::json!({"extraction_method": "direct"}),
            )
            .await
            .unwrap();

        let fetched = store.get("alice", doc.id).await.unwrap();
        assert_eq!(fetched.status, DocumentStatus::Completed);
        assert_eq!(fetched.vector_count, 7);
        assert_eq!(fetched.metadata["extraction_method"], "direct");
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(&dir.path().join("docs.db")).await.unwrap();

        let doc = record("alice", "Protokoll");
        store.insert(&doc).await.unwrap();

        assert!(matches!(
            store.delete("bob", doc.id).await,
            Err(Error::NotFound(_))
        ));
        store.delete("alice", doc.id).await.unwrap();
        assert!(store.get("alice", doc.id).await.is_err());
    }
}
