use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{
    chapter::{Chapter, ChapterDiff},
    work::WorkMetadata,
};

#[derive(Debug, Error)]
pub enum ChapterRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
}

#[async_trait]
pub trait ChapterRepository: Send + Sync {
    async fn get_chapter_by_id(&self, id: i64) -> Result<Chapter, ChapterRepositoryError>;

    async fn get_chapters_by_work_id(
        &self,
        work_id: i64,
    ) -> Result<Vec<Chapter>, ChapterRepositoryError>;

    /// Applies a diff and optional metadata refresh in one transaction,
    /// stamping `last_update` on the work. Returns ids of inserted chapters.
    async fn apply_chapter_diff(
        &self,
        work_id: i64,
        diff: &ChapterDiff,
        metadata: Option<&WorkMetadata>,
    ) -> Result<Vec<i64>, ChapterRepositoryError>;

    async fn update_read_progress(
        &self,
        chapter_id: i64,
        last_page_read: i64,
        read: bool,
    ) -> Result<(), ChapterRepositoryError>;
}
