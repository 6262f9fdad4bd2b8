use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    domain::{
        entities::{
            chapter::{Chapter, DownloadStatus},
            page::Page,
        },
        repositories::download::{DownloadRepository, DownloadRepositoryError},
    },
    infrastructure::{database::Pool, domain::repositories::chapter::chapter_from_row},
};

#[derive(Clone)]
pub struct DownloadRepositoryImpl {
    pool: Pool,
}

impl DownloadRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

fn page_from_row(row: &SqliteRow) -> Result<Page, sqlx::Error> {
    Ok(Page {
        chapter_id: row.try_get("chapter_id")?,
        index: row.try_get("idx")?,
        remote_url: row.try_get("remote_url")?,
        local_path: row.try_get("local_path")?,
        size: row.try_get("size")?,
        checksum: row.try_get("checksum")?,
    })
}

#[async_trait]
impl DownloadRepository for DownloadRepositoryImpl {
    async fn get_chapters_by_download_status(
        &self,
        status: DownloadStatus,
    ) -> Result<Vec<Chapter>, DownloadRepositoryError> {
        let chapters = sqlx::query("SELECT * FROM chapter WHERE download_status = ? ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool as &SqlitePool)
            .await?
            .iter()
            .map(chapter_from_row)
            .collect::<Result<_, _>>()?;

        Ok(chapters)
    }

    async fn set_download_status(
        &self,
        chapter_id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
        error: Option<&str>,
    ) -> Result<bool, DownloadRepositoryError> {
        let res = sqlx::query(
            "UPDATE chapter SET download_status = ?, download_error = ? WHERE id = ? AND download_status = ?",
        )
        .bind(to.as_str())
        .bind(error)
        .bind(chapter_id)
        .bind(from.as_str())
        .execute(&self.pool as &SqlitePool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn complete_download(
        &self,
        chapter_id: i64,
        pages: &[Page],
    ) -> Result<bool, DownloadRepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM page WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;

        for page in pages {
            sqlx::query(
                r#"INSERT INTO page(
                    chapter_id,
                    idx,
                    remote_url,
                    local_path,
                    size,
                    checksum
                ) VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(chapter_id)
            .bind(page.index)
            .bind(&page.remote_url)
            .bind(&page.local_path)
            .bind(page.size)
            .bind(&page.checksum)
            .execute(&mut *tx)
            .await?;
        }

        let res = sqlx::query(
            "UPDATE chapter SET download_status = ?, download_error = NULL WHERE id = ? AND download_status = ?",
        )
        .bind(DownloadStatus::Downloaded.as_str())
        .bind(chapter_id)
        .bind(DownloadStatus::Downloading.as_str())
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;

        Ok(true)
    }

    async fn get_pages(&self, chapter_id: i64) -> Result<Vec<Page>, DownloadRepositoryError> {
        let pages = sqlx::query("SELECT * FROM page WHERE chapter_id = ? ORDER BY idx")
            .bind(chapter_id)
            .fetch_all(&self.pool as &SqlitePool)
            .await?
            .iter()
            .map(page_from_row)
            .collect::<Result<_, _>>()?;

        Ok(pages)
    }

    async fn clear_download(&self, chapter_id: i64) -> Result<(), DownloadRepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM page WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE chapter SET download_status = ?, download_error = NULL WHERE id = ?",
        )
        .bind(DownloadStatus::NotDownloaded.as_str())
        .bind(chapter_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
