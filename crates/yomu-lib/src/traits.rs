use async_trait::async_trait;

use crate::{
    error::ProviderError,
    models::{ChapterInfo, PageImage, PageInfo, SourceInfo, WorkInfo},
};

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Contract every content source implements.
///
/// Calls are read only on the remote side and must never touch local state.
#[async_trait]
pub trait Provider: Send + Sync {
    fn source_info(&self) -> SourceInfo;

    fn logged_in(&self) -> bool {
        true
    }

    async fn search_works(&self, query: String, page: i64) -> Result<Vec<WorkInfo>>;

    async fn get_work_detail(&self, path: String) -> Result<WorkInfo>;

    async fn get_chapters(&self, path: String) -> Result<Vec<ChapterInfo>>;

    async fn get_pages(&self, path: String) -> Result<Vec<PageInfo>>;

    async fn get_page_image(&self, page: PageInfo) -> Result<PageImage>;
}
