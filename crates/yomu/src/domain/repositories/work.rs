use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::work::{Category, NewWork, Work};

#[derive(Debug, Error)]
pub enum WorkRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
}

#[async_trait]
pub trait WorkRepository: Send + Sync {
    /// Inserts a work or merges metadata into the row with the same source and path.
    async fn insert_work(&self, work: &NewWork) -> Result<i64, WorkRepositoryError>;

    async fn get_work_by_id(&self, id: i64) -> Result<Work, WorkRepositoryError>;

    async fn get_library(&self) -> Result<Vec<Work>, WorkRepositoryError>;

    async fn get_works_by_category(
        &self,
        category_id: i64,
    ) -> Result<Vec<Work>, WorkRepositoryError>;

    async fn get_work_categories(&self, work_id: i64)
    -> Result<Vec<Category>, WorkRepositoryError>;

    async fn set_update_error(
        &self,
        work_id: i64,
        error: Option<&str>,
    ) -> Result<(), WorkRepositoryError>;

    async fn create_category(
        &self,
        name: &str,
        auto_download: bool,
    ) -> Result<Category, WorkRepositoryError>;

    async fn set_work_categories(
        &self,
        work_id: i64,
        category_ids: &[i64],
    ) -> Result<(), WorkRepositoryError>;
}
