//! SQLite-backed [`DocumentStore`] implementation.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::HarnessError;
use crate::models::{Chunk, Dataset, Document, DocumentUpdate, EmbeddingIdentity, Provenance};

use super::DocumentStore;

/// SQLite implementation of the [`DocumentStore`] trait.
///
/// Wraps a [`SqlitePool`] and maps each operation onto the `documents`,
/// `chunks`, and `datasets` tables created by
/// [`migrate_pool`](crate::migrate::migrate_pool).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: &SqliteRow) -> Document {
    let active: i64 = row.get("active");
    Document {
        id: row.get("id"),
        scope: row.get("scope"),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        body: row.get("body"),
        active: active != 0,
        provenance: Provenance {
            etag: row.get("etag"),
            last_modified: row.get("last_modified"),
        },
        metadata_json: row.get("metadata_json"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_by_path(&self, scope: &str, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, scope, path, content_hash, body, active, etag, last_modified,
                   metadata_json, created_at, updated_at
            FROM documents WHERE scope = ? AND path = ?
            "#,
        )
        .bind(scope)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_document))
    }

    async fn create(&self, doc: &Document) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, scope, path, content_hash, body, active, etag,
                                   last_modified, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.scope)
        .bind(&doc.path)
        .bind(&doc.content_hash)
        .bind(&doc.body)
        .bind(doc.active as i64)
        .bind(&doc.provenance.etag)
        .bind(&doc.provenance.last_modified)
        .bind(&doc.metadata_json)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(HarnessError::PersistenceConflict {
                    scope: doc.scope.clone(),
                    path: doc.path.clone(),
                    reason: db_err.message().to_string(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_fields(&self, scope: &str, path: &str, update: &DocumentUpdate) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = match update {
            DocumentUpdate::Content {
                content_hash,
                body,
                provenance,
                metadata_json,
            } => {
                sqlx::query(
                    r#"
                    UPDATE documents SET
                        content_hash = ?, body = ?, etag = ?, last_modified = ?,
                        metadata_json = ?, active = 1, updated_at = ?
                    WHERE scope = ? AND path = ?
                    "#,
                )
                .bind(content_hash)
                .bind(body)
                .bind(&provenance.etag)
                .bind(&provenance.last_modified)
                .bind(metadata_json)
                .bind(now)
                .bind(scope)
                .bind(path)
                .execute(&self.pool)
                .await?
            }
            DocumentUpdate::Reactivate => {
                sqlx::query(
                    "UPDATE documents SET active = 1, updated_at = ? WHERE scope = ? AND path = ?",
                )
                .bind(now)
                .bind(scope)
                .bind(path)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            anyhow::bail!("document not found: {}:{}", scope, path);
        }
        Ok(())
    }

    async fn soft_delete(&self, scope: &str, path: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET active = 0, updated_at = ? WHERE scope = ? AND path = ? AND active = 1",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(scope)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_paths(&self, scope: &str) -> Result<Vec<String>> {
        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT path FROM documents WHERE scope = ? AND active = 1 ORDER BY path ASC",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn replace_chunks(&self, source_key: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE source_key = ?")
            .bind(source_key)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query("INSERT INTO chunks (id, source_key, seq, text) VALUES (?, ?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.source_key)
                .bind(chunk.seq)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn chunks_for(&self, source_key: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, source_key, seq, text FROM chunks WHERE source_key = ? ORDER BY seq ASC",
        )
        .bind(source_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Chunk {
                id: row.get("id"),
                source_key: row.get("source_key"),
                seq: row.get("seq"),
                text: row.get("text"),
            })
            .collect())
    }

    async fn get_dataset(&self, scope: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query(
            "SELECT scope, embedding_backend, embedding_model, dims, created_at FROM datasets WHERE scope = ?",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let dims: Option<i64> = r.get("dims");
            Dataset {
                scope: r.get("scope"),
                identity: EmbeddingIdentity::new(
                    r.get::<String, _>("embedding_backend"),
                    r.get::<String, _>("embedding_model"),
                ),
                dims: dims.map(|d| d as usize),
                created_at: r.get("created_at"),
            }
        }))
    }

    async fn record_dataset(&self, dataset: &Dataset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO datasets (scope, embedding_backend, embedding_model, dims, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(scope) DO NOTHING
            "#,
        )
        .bind(&dataset.scope)
        .bind(&dataset.identity.backend)
        .bind(&dataset.identity.model)
        .bind(dataset.dims.map(|d| d as i64))
        .bind(dataset.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_dataset_dims(&self, scope: &str, dims: usize) -> Result<()> {
        sqlx::query("UPDATE datasets SET dims = ? WHERE scope = ?")
            .bind(dims as i64)
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
