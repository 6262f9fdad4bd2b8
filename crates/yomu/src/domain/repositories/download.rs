use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{
    chapter::{Chapter, DownloadStatus},
    page::Page,
};

#[derive(Debug, Error)]
pub enum DownloadRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
}

#[async_trait]
pub trait DownloadRepository: Send + Sync {
    async fn get_chapters_by_download_status(
        &self,
        status: DownloadStatus,
    ) -> Result<Vec<Chapter>, DownloadRepositoryError>;

    /// Moves a chapter from `from` to `to`, returns false when the chapter was not in `from`.
    async fn set_download_status(
        &self,
        chapter_id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
        error: Option<&str>,
    ) -> Result<bool, DownloadRepositoryError>;

    /// Replaces the page rows of a chapter and marks it downloaded in one transaction.
    async fn complete_download(
        &self,
        chapter_id: i64,
        pages: &[Page],
    ) -> Result<bool, DownloadRepositoryError>;

    async fn get_pages(&self, chapter_id: i64) -> Result<Vec<Page>, DownloadRepositoryError>;

    /// Deletes page rows and resets the chapter to `not_downloaded`.
    async fn clear_download(&self, chapter_id: i64) -> Result<(), DownloadRepositoryError>;
}
