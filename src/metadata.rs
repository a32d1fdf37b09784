//! Video metadata persistence for Tubely.
//!
//! A single `videos` table backs every record the API exposes. Timestamps are
//! stored as RFC 3339 strings and identifiers as hyphenated UUID text so the
//! database stays readable with the stock `sqlite3` shell.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row stored in the `videos` table and returned verbatim by the API.
///
/// `thumbnail_url` and `video_url` serialize as `null` while unset; the UI
/// relies on the key always being present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub thumbnail_url: Option<String>,
    pub video_url: Option<String>,
    pub title: String,
    pub description: String,
    pub user_id: Uuid,
}

/// Caller-supplied fields for a new video draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVideoParams {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub user_id: Uuid,
}

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
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            thumbnail_url TEXT,
            video_url TEXT,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            user_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_user_id ON videos(user_id);
        "#,
    )
    .await?;
    Ok(())
}

fn format_timestamp(value: &DateTime<Utc>) -> String {
    // Fixed-width nanoseconds keep lexical order equal to chronological order.
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing stored timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("parsing stored uuid {raw:?}"))
}

/// Handle to the SQLite-compatible database holding video metadata.
///
/// Cloning is cheap; every clone shares the same underlying connection.
#[derive(Clone)]
pub struct VideoStore {
    conn: Connection,
}

impl VideoStore {
    /// Opens (and if necessary creates) the database and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening video DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a new video owned by `params.user_id` and returns the stored row.
    pub async fn create_video(&self, params: CreateVideoParams) -> Result<Video> {
        let now = Utc::now();
        let video = Video {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            thumbnail_url: None,
            video_url: None,
            title: params.title,
            description: params.description,
            user_id: params.user_id,
        };

        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, created_at, updated_at, thumbnail_url, video_url,
                    title, description, user_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    video.id.to_string(),
                    format_timestamp(&video.created_at),
                    format_timestamp(&video.updated_at),
                    video.thumbnail_url.as_deref(),
                    video.video_url.as_deref(),
                    video.title.as_str(),
                    video.description.as_str(),
                    video.user_id.to_string(),
                ],
            )
            .await
            .context("inserting video")?;

        Ok(video)
    }

    pub async fn get_video(&self, id: Uuid) -> Result<Option<Video>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, created_at, updated_at, thumbnail_url, video_url,
                       title, description, user_id
                FROM videos
                WHERE id = ?1
                "#,
                params![id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// Persists every mutable column of `video` and stamps `updated_at`.
    ///
    /// The caller's copy is updated in place so it matches what was written.
    /// Fails when no row carries `video.id`.
    pub async fn update_video(&self, video: &mut Video) -> Result<()> {
        let updated_at = Utc::now();
        let affected = self
            .conn
            .execute(
                r#"
                UPDATE videos SET
                    updated_at = ?2,
                    thumbnail_url = ?3,
                    video_url = ?4,
                    title = ?5,
                    description = ?6
                WHERE id = ?1
                "#,
                params![
                    video.id.to_string(),
                    format_timestamp(&updated_at),
                    video.thumbnail_url.as_deref(),
                    video.video_url.as_deref(),
                    video.title.as_str(),
                    video.description.as_str(),
                ],
            )
            .await
            .with_context(|| format!("updating video {}", video.id))?;

        if affected == 0 {
            bail!("video {} does not exist", video.id);
        }
        video.updated_at = updated_at;
        Ok(())
    }

    /// Lists the videos owned by `user_id`, newest first.
    pub async fn list_videos_for_user(&self, user_id: Uuid) -> Result<Vec<Video>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, created_at, updated_at, thumbnail_url, video_url,
                       title, description, user_id
                FROM videos
                WHERE user_id = ?1
                ORDER BY created_at DESC, rowid DESC
                "#,
                params![user_id.to_string()],
            )
            .await?;

        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }
}

/// Converts a SQL row into a `Video`. Column order must match the SELECT
/// statements above.
fn row_to_video(row: &Row) -> Result<Video> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    let updated_at: String = row.get(2)?;
    let user_id: String = row.get(7)?;

    Ok(Video {
        id: parse_uuid(&id)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        thumbnail_url: row.get(3)?,
        video_url: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        user_id: parse_uuid(&user_id).map_err(|err| anyhow!("video {id}: {err:#}"))?,
    })
}
