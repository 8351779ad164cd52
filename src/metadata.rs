//! Metadata persistence layer for cliptube.
//!
//! One `videos` table doubles as the source catalog for timeline exports and
//! as the destination of published exports.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use libsql::params::Params;
use libsql::{Builder, Connection, Row, Value, params};

use crate::error::{ExportError, ExportResult};
use crate::export::{SourceAsset, SourceCatalog, VideoPublisher};
use crate::publish::{PublishedVideo, Visibility};

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            videoid TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT DEFAULT '',
            category TEXT NOT NULL DEFAULT 'general',
            visibility TEXT NOT NULL DEFAULT 'public',
            tags_json TEXT DEFAULT '[]',
            storage_key TEXT,
            thumbnail_key TEXT,
            duration_seconds REAL,
            timeline_name TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_owner ON videos(owner_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection.
#[derive(Debug)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening metadata DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn insert_video(&self, record: &PublishedVideo) -> Result<()> {
        let tags_json = serde_json::to_string(&record.tags).context("serializing tags")?;

        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    videoid, owner_id, title, description, category, visibility,
                    tags_json, storage_key, thumbnail_key, duration_seconds,
                    timeline_name, created_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
                )
                "#,
                params![
                    record.id.as_str(),
                    record.owner_id.as_str(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.category.as_str(),
                    record.visibility.as_str(),
                    tags_json,
                    record.storage_key.as_str(),
                    record.thumbnail_key.as_deref(),
                    record.duration_seconds,
                    record.timeline_name.as_deref(),
                    record.created_at.as_str(),
                ],
            )
            .await
            .with_context(|| format!("inserting video {}", record.id))?;

        Ok(())
    }

    pub async fn get_video(&self, videoid: &str) -> Result<Option<PublishedVideo>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT videoid, owner_id, title, description, category, visibility,
                       tags_json, storage_key, thumbnail_key, duration_seconds,
                       timeline_name, created_at
                FROM videos
                WHERE videoid = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([videoid]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// Returns `(videoid, storage_key)` for every id that exists, in one
    /// query. Ids without a row are simply absent from the result.
    pub async fn find_sources(&self, ids: &[String]) -> Result<Vec<SourceAsset>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=ids.len())
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT videoid, storage_key FROM videos WHERE videoid IN ({placeholders})");
        let values = ids.iter().map(|id| Value::Text(id.clone())).collect();

        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let mut sources = Vec::new();
        while let Some(row) = rows.next().await? {
            sources.push(SourceAsset {
                source_id: row.get(0)?,
                storage_key: row.get(1)?,
            });
        }
        Ok(sources)
    }
}

#[async_trait]
impl SourceCatalog for MetadataStore {
    async fn resolve_sources(&self, ids: &[String]) -> ExportResult<Vec<SourceAsset>> {
        self.find_sources(ids).await.map_err(ExportError::database)
    }
}

#[async_trait]
impl VideoPublisher for MetadataStore {
    async fn publish_video(&self, record: &PublishedVideo) -> ExportResult<()> {
        self.insert_video(record)
            .await
            .map_err(ExportError::database)
    }
}

/// Converts a SQL row into a `PublishedVideo`. Column order must match the
/// SELECT in `get_video`.
fn row_to_video(row: &Row) -> Result<PublishedVideo> {
    let tags_json: Option<String> = row.get(6)?;
    let tags: Vec<String> = match tags_json {
        Some(raw) => serde_json::from_str(&raw).context("parsing stored tags JSON")?,
        None => Vec::new(),
    };
    let visibility: String = row.get(5)?;
    let storage_key: Option<String> = row.get(7)?;
    let description: Option<String> = row.get(3)?;
    let duration: Option<f64> = row.get(9)?;

    Ok(PublishedVideo {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        description: description.unwrap_or_default(),
        category: row.get(4)?,
        visibility: Visibility::from_db(&visibility),
        tags,
        storage_key: storage_key.unwrap_or_default(),
        thumbnail_key: row.get(8)?,
        duration_seconds: duration.unwrap_or(0.0),
        timeline_name: row.get(10)?,
        created_at: row.get(11)?,
    })
}
