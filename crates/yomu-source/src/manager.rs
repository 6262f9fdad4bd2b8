use std::sync::Arc;

use fnv::FnvHashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use yomu_lib::prelude::{ChapterInfo, PageImage, PageInfo, Provider, SourceInfo, WorkInfo};

use crate::fetch::{FetchError, Fetched, Fetcher};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {0} already registered")]
    AlreadyRegistered(i64),
    #[error("source {0} is not registered")]
    NotFound(i64),
}

/// Registry of statically linked providers keyed by their source id.
///
/// Providers are registered once at startup, every remote call made through
/// the manager goes through the [`Fetcher`] retry policy.
#[derive(Clone, Default)]
pub struct SourceManager {
    sources: FnvHashMap<i64, Arc<dyn Provider>>,
    fetcher: Fetcher,
}

impl SourceManager {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            sources: FnvHashMap::default(),
            fetcher,
        }
    }

    pub fn register(&mut self, source: Arc<dyn Provider>) -> Result<SourceInfo, SourceError> {
        let info = source.source_info();
        if self.sources.contains_key(&info.id) {
            return Err(SourceError::AlreadyRegistered(info.id));
        }

        info!("registered source {} ({})", info.name, info.id);
        self.sources.insert(info.id, source);

        Ok(info)
    }

    pub fn get(&self, source_id: i64) -> Result<Arc<dyn Provider>, SourceError> {
        self.sources
            .get(&source_id)
            .cloned()
            .ok_or(SourceError::NotFound(source_id))
    }

    pub fn exists(&self, source_id: i64) -> bool {
        self.sources.contains_key(&source_id)
    }

    pub fn get_source_info(&self, source_id: i64) -> Result<SourceInfo, SourceError> {
        Ok(self.get(source_id)?.source_info())
    }

    pub fn list(&self) -> Vec<SourceInfo> {
        let mut sources: Vec<SourceInfo> =
            self.sources.values().map(|s| s.source_info()).collect();
        sources.sort_by_key(|s| s.id);
        sources
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    fn provider(&self, source_id: i64) -> Result<Arc<dyn Provider>, FetchError> {
        self.get(source_id)
            .map_err(|_| FetchError::UnknownSource(source_id))
    }

    pub async fn get_work_detail(
        &self,
        source_id: i64,
        path: String,
        cancel: &CancellationToken,
    ) -> Result<Fetched<WorkInfo>, FetchError> {
        let source = self.provider(source_id)?;
        self.fetcher
            .fetch(cancel, || source.get_work_detail(path.clone()))
            .await
    }

    pub async fn get_chapters(
        &self,
        source_id: i64,
        path: String,
        cancel: &CancellationToken,
    ) -> Result<Fetched<Vec<ChapterInfo>>, FetchError> {
        let source = self.provider(source_id)?;
        self.fetcher
            .fetch(cancel, || source.get_chapters(path.clone()))
            .await
    }

    pub async fn get_pages(
        &self,
        source_id: i64,
        path: String,
        cancel: &CancellationToken,
    ) -> Result<Fetched<Vec<PageInfo>>, FetchError> {
        let source = self.provider(source_id)?;
        self.fetcher
            .fetch(cancel, || source.get_pages(path.clone()))
            .await
    }

    pub async fn get_page_image(
        &self,
        source_id: i64,
        page: PageInfo,
        cancel: &CancellationToken,
    ) -> Result<Fetched<PageImage>, FetchError> {
        let source = self.provider(source_id)?;
        self.fetcher
            .fetch(cancel, || source.get_page_image(page.clone()))
            .await
    }
}
