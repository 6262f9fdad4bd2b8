use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow, types::Json};

use crate::{
    domain::{
        entities::{
            chapter::{Chapter, ChapterDiff, DownloadStatus},
            work::WorkMetadata,
        },
        repositories::chapter::{ChapterRepository, ChapterRepositoryError},
    },
    infrastructure::database::Pool,
};

#[derive(Clone)]
pub struct ChapterRepositoryImpl {
    pool: Pool,
}

impl ChapterRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

pub(crate) fn chapter_from_row(row: &SqliteRow) -> Result<Chapter, sqlx::Error> {
    let download_status: String = row.try_get("download_status")?;
    let download_status: DownloadStatus =
        download_status
            .parse()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "download_status".to_string(),
                source: Box::new(e),
            })?;

    Ok(Chapter {
        id: row.try_get("id")?,
        work_id: row.try_get("work_id")?,
        source_id: row.try_get("source_id")?,
        path: row.try_get("path")?,
        title: row.try_get("title")?,
        rank: row.try_get("rank")?,
        scanlator: row.try_get("scanlator")?,
        uploaded: row.try_get("uploaded")?,
        read: row.try_get("read")?,
        last_page_read: row.try_get("last_page_read")?,
        download_status,
        download_error: row.try_get("download_error")?,
        date_added: row.try_get("date_added")?,
    })
}

#[async_trait]
impl ChapterRepository for ChapterRepositoryImpl {
    async fn get_chapter_by_id(&self, id: i64) -> Result<Chapter, ChapterRepositoryError> {
        let row = sqlx::query("SELECT * FROM chapter WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool as &SqlitePool)
            .await?;

        Ok(chapter_from_row(&row)?)
    }

    async fn get_chapters_by_work_id(
        &self,
        work_id: i64,
    ) -> Result<Vec<Chapter>, ChapterRepositoryError> {
        let chapters = sqlx::query("SELECT * FROM chapter WHERE work_id = ? ORDER BY rank, id")
            .bind(work_id)
            .fetch_all(&self.pool as &SqlitePool)
            .await?
            .iter()
            .map(chapter_from_row)
            .collect::<Result<_, _>>()?;

        Ok(chapters)
    }

    async fn apply_chapter_diff(
        &self,
        work_id: i64,
        diff: &ChapterDiff,
        metadata: Option<&WorkMetadata>,
    ) -> Result<Vec<i64>, ChapterRepositoryError> {
        let now = chrono::Utc::now().naive_utc();
        let mut tx = self.pool.begin().await?;

        let mut inserted = Vec::with_capacity(diff.added.len());
        for chapter in &diff.added {
            let id: i64 = sqlx::query_scalar(
                r#"INSERT INTO chapter(
                    work_id,
                    source_id,
                    path,
                    title,
                    rank,
                    scanlator,
                    uploaded,
                    date_added
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id"#,
            )
            .bind(work_id)
            .bind(chapter.source_id)
            .bind(&chapter.path)
            .bind(&chapter.title)
            .bind(chapter.rank)
            .bind(&chapter.scanlator)
            .bind(chapter.uploaded)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(id);
        }

        for change in &diff.changed {
            sqlx::query(
                r#"UPDATE chapter SET
                    title = ?,
                    rank = ?,
                    scanlator = ?,
                    uploaded = ?
                WHERE id = ? AND work_id = ?"#,
            )
            .bind(&change.title)
            .bind(change.rank)
            .bind(&change.scanlator)
            .bind(change.uploaded)
            .bind(change.id)
            .bind(work_id)
            .execute(&mut *tx)
            .await?;
        }

        for id in &diff.removed {
            sqlx::query(
                "DELETE FROM chapter WHERE id = ? AND work_id = ? AND download_status = ?",
            )
            .bind(id)
            .bind(work_id)
            .bind(DownloadStatus::NotDownloaded.as_str())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(metadata) = metadata {
            sqlx::query(
                r#"UPDATE work SET
                    title = ?,
                    authors = ?,
                    synopsis = ?,
                    status = ?,
                    cover_url = ?
                WHERE id = ?"#,
            )
            .bind(&metadata.title)
            .bind(Json(&metadata.authors))
            .bind(&metadata.synopsis)
            .bind(metadata.status.as_str())
            .bind(&metadata.cover_url)
            .bind(work_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE work SET last_update = ?, update_error = NULL WHERE id = ?")
            .bind(now)
            .bind(work_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(inserted)
    }

    async fn update_read_progress(
        &self,
        chapter_id: i64,
        last_page_read: i64,
        read: bool,
    ) -> Result<(), ChapterRepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE chapter SET last_page_read = ?, read = ? WHERE id = ?")
            .bind(last_page_read)
            .bind(read)
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE work SET last_read_chapter_id = ? WHERE id = (SELECT work_id FROM chapter WHERE id = ?)",
        )
        .bind(chapter_id)
        .bind(chapter_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
