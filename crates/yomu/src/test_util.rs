use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::watch;
use yomu_source::{
    fetch::{Fetcher, RetryPolicy},
    manager::SourceManager,
    prelude::{
        Capabilities, ChapterInfo, Lang, PageImage, PageInfo, Provider, ProviderError, SourceInfo,
        WorkInfo,
    },
};

use crate::{
    application::{
        SqliteReconciler,
        events::{Event, EventReceiver},
        reconciler,
    },
    domain::{entities::work::Work, services::reconcile::PageFile},
    infrastructure::database::open_library,
};

pub const SOURCE_ID: i64 = 1;

/// Provider serving scripted works, chapters and pages.
pub struct FakeProvider {
    id: i64,
    capabilities: Capabilities,
    logged_in: bool,
    works: Mutex<HashMap<String, WorkInfo>>,
    chapters: Mutex<HashMap<String, Vec<ChapterInfo>>>,
    pages: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, ProviderError>>,
    fetches: Mutex<HashMap<String, usize>>,
    // page indices at or above this value wait until it is raised
    gate: watch::Sender<usize>,
    // chapter lists are answered only while open
    chapters_gate: watch::Sender<bool>,
}

impl FakeProvider {
    pub fn new(id: i64) -> Self {
        Self::with_capabilities(id, Capabilities::default())
    }

    pub fn with_capabilities(id: i64, capabilities: Capabilities) -> Self {
        let (gate, _) = watch::channel(usize::MAX);
        let (chapters_gate, _) = watch::channel(true);
        Self {
            id,
            capabilities,
            logged_in: true,
            works: Mutex::new(HashMap::new()),
            chapters: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            gate,
            chapters_gate,
        }
    }

    pub fn logged_out(mut self) -> Self {
        self.logged_in = false;
        self
    }

    pub fn work_info(&self, path: &str, title: &str) -> WorkInfo {
        WorkInfo {
            source_id: self.id,
            title: title.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn chapter_info(&self, path: &str, number: f64) -> ChapterInfo {
        ChapterInfo {
            source_id: self.id,
            title: format!("Chapter {number}"),
            path: path.to_string(),
            number,
            scanlator: None,
            uploaded: 0,
        }
    }

    pub fn set_work(&self, info: WorkInfo) {
        self.works.lock().unwrap().insert(info.path.clone(), info);
    }

    /// Chapters of `work_path`, each chapter gets `pages` pages.
    pub fn set_chapters(&self, work_path: &str, chapters: &[(&str, f64)], pages: usize) {
        let infos = chapters
            .iter()
            .map(|(path, number)| self.chapter_info(path, *number))
            .collect();
        self.chapters
            .lock()
            .unwrap()
            .insert(work_path.to_string(), infos);

        let mut page_counts = self.pages.lock().unwrap();
        for (path, _) in chapters {
            page_counts.insert(path.to_string(), pages);
        }
    }

    pub fn page_url(chapter_path: &str, index: usize) -> String {
        format!("{chapter_path}/{index}.jpg")
    }

    /// Makes every request for `key` (a work path, chapter path or page url) fail.
    pub fn fail(&self, key: &str, error: ProviderError) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn fetches(&self, key: &str) -> usize {
        self.fetches.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn hold_from(&self, index: usize) {
        self.gate.send_replace(index);
    }

    pub fn release(&self) {
        self.gate.send_replace(usize::MAX);
    }

    /// Chapter list requests are counted, then wait for [`Self::release_chapters`].
    pub fn hold_chapters(&self) {
        self.chapters_gate.send_replace(false);
    }

    pub fn release_chapters(&self) {
        self.chapters_gate.send_replace(true);
    }

    fn request(&self, key: &str) -> Result<(), ProviderError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;

        match self.failures.lock().unwrap().get(key) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn source_info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id,
            name: format!("fake-{}", self.id),
            url: "https://fake.example".to_string(),
            version: "0.1.0".to_string(),
            languages: Lang::Single("en".to_string()),
            capabilities: self.capabilities,
        }
    }

    fn logged_in(&self) -> bool {
        self.logged_in
    }

    async fn search_works(&self, query: String, _page: i64) -> Result<Vec<WorkInfo>, ProviderError> {
        Ok(self
            .works
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.title.contains(&query))
            .cloned()
            .collect())
    }

    async fn get_work_detail(&self, path: String) -> Result<WorkInfo, ProviderError> {
        self.request(&format!("detail:{path}"))?;
        self.works
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| ProviderError::content_missing(&path))
    }

    async fn get_chapters(&self, path: String) -> Result<Vec<ChapterInfo>, ProviderError> {
        self.request(&path)?;
        let mut gate = self.chapters_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.chapters
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| ProviderError::content_missing(&path))
    }

    async fn get_pages(&self, path: String) -> Result<Vec<PageInfo>, ProviderError> {
        self.request(&path)?;
        let count = self
            .pages
            .lock()
            .unwrap()
            .get(&path)
            .copied()
            .ok_or_else(|| ProviderError::content_missing(&path))?;

        Ok(PageInfo::from_urls(
            (0..count).map(|index| Self::page_url(&path, index)),
        ))
    }

    async fn get_page_image(&self, page: PageInfo) -> Result<PageImage, ProviderError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|limit| page.index < *limit).await;

        self.request(&page.url)?;
        Ok(PageImage {
            bytes: Bytes::from(page.url.clone().into_bytes()),
            content_type: "image/jpeg".to_string(),
        })
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_secs(5),
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        rate_limit_multiplier: 2,
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub reconciler: SqliteReconciler,
    pub provider: Arc<FakeProvider>,
    pub sources: SourceManager,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_provider(FakeProvider::new(SOURCE_ID)).await
    }

    pub async fn with_provider(provider: FakeProvider) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("yomu.db");
        let pool = open_library(&db_path.display().to_string(), true)
            .await
            .unwrap();
        let reconciler = reconciler(
            pool,
            &dir.path().join("downloads").display().to_string(),
        );

        let provider = Arc::new(provider);
        let mut sources = SourceManager::new(Fetcher::new(fast_policy()));
        sources.register(provider.clone()).unwrap();

        Self {
            _dir: dir,
            reconciler,
            provider,
            sources,
        }
    }

    /// Adds a work with `chapters` of `pages` pages each to the library and
    /// stores its chapter list.
    pub async fn add_work(&self, path: &str, chapters: &[(&str, f64)], pages: usize) -> Work {
        let info = self.provider.work_info(path, &format!("Work {path}"));
        self.provider.set_work(info.clone());
        self.provider.set_chapters(path, chapters, pages);

        let work = self.reconciler.add_work(info, &[]).await.unwrap();
        let remote = chapters
            .iter()
            .map(|(path, number)| self.provider.chapter_info(path, *number))
            .collect();
        self.reconciler
            .reconcile_work(&work, remote, None, true)
            .await
            .unwrap();

        self.reconciler.get_work(work.id).await.unwrap()
    }

    /// Writes `pages` pages of a chapter and commits it as downloaded.
    pub async fn mark_downloaded(&self, chapter_id: i64, pages: usize) {
        let chapter = self.reconciler.mark_downloading(chapter_id).await.unwrap();
        let mut files = BTreeMap::new();
        for index in 0..pages {
            let image = PageImage {
                bytes: Bytes::from(format!("page {index}").into_bytes()),
                content_type: "image/jpeg".to_string(),
            };
            let written = self
                .reconciler
                .store()
                .write_page(chapter.work_id, chapter.id, index, &image)
                .await
                .unwrap();
            files.insert(
                index,
                PageFile {
                    remote_url: FakeProvider::page_url(&chapter.path, index),
                    path: written.path,
                    size: written.size,
                    checksum: Some(written.checksum),
                },
            );
        }
        self.reconciler
            .complete_download(chapter_id, pages, files)
            .await
            .unwrap();
    }

    pub async fn chapter_id(&self, work_id: i64, path: &str) -> i64 {
        self.reconciler
            .get_chapters(work_id)
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.path == path)
            .map(|c| c.id)
            .unwrap()
    }
}

/// Next event matching `f`, panics after ten seconds.
pub async fn wait_for<F>(rx: &mut EventReceiver, mut f: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if f(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event bus: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
