//! The single writer of work, chapter and page rows.
//!
//! Update passes hand provider results to [`Reconciler::reconcile_work`], the
//! download worker moves chapters through their download states here, and
//! nothing else touches those tables.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
};

use thiserror::Error;
use yomu_lib::prelude::{ChapterInfo, WorkInfo};

use crate::{
    domain::{
        entities::{
            chapter::{Chapter, ChapterChange, ChapterDiff, DownloadStatus, NewChapter},
            page::Page,
            work::{Category, NewWork, Work, WorkMetadata, WorkStatus},
        },
        repositories::{
            chapter::{ChapterRepository, ChapterRepositoryError},
            download::{DownloadRepository, DownloadRepositoryError},
            work::{WorkRepository, WorkRepositoryError},
        },
    },
    infrastructure::storage::{PageStore, StorageError},
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("work repository error: {0}")]
    Work(#[from] WorkRepositoryError),
    #[error("chapter repository error: {0}")]
    Chapter(#[from] ChapterRepositoryError),
    #[error("download repository error: {0}")]
    Download(#[from] DownloadRepositoryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("chapter {chapter_id} cannot go from {from} to {to}")]
    InvalidTransition {
        chapter_id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
    },
    #[error("chapter {chapter_id} is incomplete: {reason}")]
    Incomplete { chapter_id: i64, reason: String },
    #[error("{0} not found")]
    NotFound(String),
}

/// A page file on disk waiting to be committed with its chapter.
#[derive(Debug, Clone)]
pub struct PageFile {
    pub remote_url: String,
    pub path: PathBuf,
    pub size: u64,
    /// computed on commit when the page was written by an earlier run
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub work_id: i64,
    pub added: Vec<i64>,
    pub changed: usize,
    pub removed: usize,
    pub metadata_changed: bool,
}

impl ReconcileOutcome {
    pub fn writes(&self) -> usize {
        self.added.len() + self.changed + self.removed + usize::from(self.metadata_changed)
    }

    pub fn is_unchanged(&self) -> bool {
        self.writes() == 0
    }
}

/// Computes the writes that bring `local` in line with `remote`.
///
/// Chapters are matched on their remote path, the first of duplicate remote
/// paths wins. User fields are never part of a change. Only chapters that were
/// never downloaded are removed, and nothing is removed when the source
/// returned an empty list.
pub fn diff_chapters(local: &[Chapter], remote: Vec<ChapterInfo>, prune: bool) -> ChapterDiff {
    let local_by_path: HashMap<&str, &Chapter> =
        local.iter().map(|ch| (ch.path.as_str(), ch)).collect();

    let mut seen = HashSet::new();
    let mut diff = ChapterDiff::default();

    for chapter in remote {
        if !seen.insert(chapter.path.clone()) {
            continue;
        }

        let chapter = NewChapter::from(chapter);
        match local_by_path.get(chapter.path.as_str()) {
            Some(existing) => {
                if chapter.differs_from(existing) {
                    diff.changed.push(ChapterChange {
                        id: existing.id,
                        title: chapter.title,
                        rank: chapter.rank,
                        scanlator: chapter.scanlator,
                        uploaded: chapter.uploaded,
                    });
                }
            }
            None => diff.added.push(chapter),
        }
    }

    if prune && !seen.is_empty() {
        diff.removed = local
            .iter()
            .filter(|ch| !seen.contains(&ch.path))
            .filter(|ch| ch.download_status == DownloadStatus::NotDownloaded)
            .map(|ch| ch.id)
            .collect();
    }

    diff
}

// source values win, but empty source values never erase what is stored
fn merge_metadata(current: &WorkMetadata, detail: &WorkInfo) -> WorkMetadata {
    let remote = WorkMetadata::from(detail);

    WorkMetadata {
        title: if remote.title.trim().is_empty() {
            current.title.clone()
        } else {
            remote.title
        },
        authors: if remote.authors.is_empty() {
            current.authors.clone()
        } else {
            remote.authors
        },
        synopsis: remote.synopsis.or_else(|| current.synopsis.clone()),
        status: if remote.status == WorkStatus::Unknown {
            current.status
        } else {
            remote.status
        },
        cover_url: remote.cover_url.or_else(|| current.cover_url.clone()),
    }
}

#[derive(Clone)]
pub struct Reconciler<W, C, D>
where
    W: WorkRepository,
    C: ChapterRepository,
    D: DownloadRepository,
{
    work_repo: W,
    chapter_repo: C,
    download_repo: D,
    store: PageStore,
}

impl<W, C, D> Reconciler<W, C, D>
where
    W: WorkRepository,
    C: ChapterRepository,
    D: DownloadRepository,
{
    pub fn new(work_repo: W, chapter_repo: C, download_repo: D, store: PageStore) -> Self {
        Self {
            work_repo,
            chapter_repo,
            download_repo,
            store,
        }
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub async fn get_work(&self, work_id: i64) -> Result<Work, ReconcileError> {
        match self.work_repo.get_work_by_id(work_id).await {
            Err(WorkRepositoryError::DbError(sqlx::Error::RowNotFound)) => {
                Err(ReconcileError::NotFound(format!("work {work_id}")))
            }
            res => Ok(res?),
        }
    }

    pub async fn get_chapter(&self, chapter_id: i64) -> Result<Chapter, ReconcileError> {
        match self.chapter_repo.get_chapter_by_id(chapter_id).await {
            Err(ChapterRepositoryError::DbError(sqlx::Error::RowNotFound)) => {
                Err(ReconcileError::NotFound(format!("chapter {chapter_id}")))
            }
            res => Ok(res?),
        }
    }

    pub async fn get_chapters(&self, work_id: i64) -> Result<Vec<Chapter>, ReconcileError> {
        Ok(self.chapter_repo.get_chapters_by_work_id(work_id).await?)
    }

    pub async fn get_library(&self) -> Result<Vec<Work>, ReconcileError> {
        Ok(self.work_repo.get_library().await?)
    }

    pub async fn get_works_by_category(
        &self,
        category_id: i64,
    ) -> Result<Vec<Work>, ReconcileError> {
        Ok(self.work_repo.get_works_by_category(category_id).await?)
    }

    pub async fn get_work_categories(&self, work_id: i64) -> Result<Vec<Category>, ReconcileError> {
        Ok(self.work_repo.get_work_categories(work_id).await?)
    }

    pub async fn get_pages(&self, chapter_id: i64) -> Result<Vec<Page>, ReconcileError> {
        Ok(self.download_repo.get_pages(chapter_id).await?)
    }

    pub async fn create_category(
        &self,
        name: &str,
        auto_download: bool,
    ) -> Result<Category, ReconcileError> {
        Ok(self.work_repo.create_category(name, auto_download).await?)
    }

    /// Adds a work to the library, merging into an existing row with the same
    /// source and path. Existing categories are kept and `category_ids` added.
    pub async fn add_work(
        &self,
        info: WorkInfo,
        category_ids: &[i64],
    ) -> Result<Work, ReconcileError> {
        let work_id = self.work_repo.insert_work(&NewWork::from(info)).await?;

        if !category_ids.is_empty() {
            let mut ids: Vec<i64> = self
                .work_repo
                .get_work_categories(work_id)
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect();
            ids.extend_from_slice(category_ids);
            ids.sort_unstable();
            ids.dedup();
            self.work_repo.set_work_categories(work_id, &ids).await?;
        }

        let work = self.get_work(work_id).await?;
        if let Err(e) = self.store.save_work_info_if_not_exists(&work).await {
            warn!("failed to write details of work {work_id}: {e}");
        }

        Ok(work)
    }

    /// Applies the remote chapter list and optional detail of a work in one
    /// transaction. An unchanged source results in no write at all.
    pub async fn reconcile_work(
        &self,
        work: &Work,
        remote: Vec<ChapterInfo>,
        detail: Option<&WorkInfo>,
        prune: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let local = self.chapter_repo.get_chapters_by_work_id(work.id).await?;
        let diff = diff_chapters(&local, remote, prune);

        let current = work.metadata();
        let metadata = detail
            .map(|detail| merge_metadata(&current, detail))
            .filter(|metadata| *metadata != current);

        if diff.is_empty() && metadata.is_none() {
            if work.update_error.is_some() {
                self.work_repo.set_update_error(work.id, None).await?;
            }
            return Ok(ReconcileOutcome {
                work_id: work.id,
                ..Default::default()
            });
        }

        let added = self
            .chapter_repo
            .apply_chapter_diff(work.id, &diff, metadata.as_ref())
            .await?;

        Ok(ReconcileOutcome {
            work_id: work.id,
            added,
            changed: diff.changed.len(),
            removed: diff.removed.len(),
            metadata_changed: metadata.is_some(),
        })
    }

    pub async fn record_update_failure(
        &self,
        work_id: i64,
        reason: &str,
    ) -> Result<(), ReconcileError> {
        Ok(self.work_repo.set_update_error(work_id, Some(reason)).await?)
    }

    pub async fn update_read_progress(
        &self,
        chapter_id: i64,
        last_page_read: i64,
        read: bool,
    ) -> Result<(), ReconcileError> {
        self.get_chapter(chapter_id).await?;
        Ok(self
            .chapter_repo
            .update_read_progress(chapter_id, last_page_read, read)
            .await?)
    }

    async fn transition(
        &self,
        chapter: &Chapter,
        to: DownloadStatus,
        error: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let from = chapter.download_status;
        let invalid = ReconcileError::InvalidTransition {
            chapter_id: chapter.id,
            from,
            to,
        };

        if !from.can_transition(to) {
            return Err(invalid);
        }

        if !self
            .download_repo
            .set_download_status(chapter.id, from, to, error)
            .await?
        {
            return Err(invalid);
        }

        debug!("chapter {} {from} -> {to}", chapter.id);

        Ok(())
    }

    /// Moves a chapter to `downloading`, a chapter already there is left as is.
    pub async fn mark_downloading(&self, chapter_id: i64) -> Result<Chapter, ReconcileError> {
        let mut chapter = self.get_chapter(chapter_id).await?;
        if chapter.download_status != DownloadStatus::Downloading {
            self.transition(&chapter, DownloadStatus::Downloading, None)
                .await?;
            chapter.download_status = DownloadStatus::Downloading;
            chapter.download_error = None;
        }

        Ok(chapter)
    }

    pub async fn mark_download_failed(
        &self,
        chapter_id: i64,
        detail: &str,
    ) -> Result<(), ReconcileError> {
        let chapter = self.get_chapter(chapter_id).await?;
        self.transition(&chapter, DownloadStatus::Error, Some(detail))
            .await
    }

    /// Returns a canceled chapter to `not_downloaded`. Finished pages stay on
    /// disk, temp files are removed. A download that committed just before the
    /// cancel loses its page rows but keeps its files.
    pub async fn mark_download_canceled(
        &self,
        chapter_id: i64,
    ) -> Result<(), ReconcileError> {
        let chapter = self.get_chapter(chapter_id).await?;
        self.store
            .discard_partial(chapter.work_id, chapter.id)
            .await?;

        match chapter.download_status {
            DownloadStatus::NotDownloaded => Ok(()),
            DownloadStatus::Downloaded => {
                self.download_repo.clear_download(chapter_id).await?;
                debug!("chapter {chapter_id} downloaded -> not_downloaded");
                Ok(())
            }
            _ => {
                self.transition(&chapter, DownloadStatus::NotDownloaded, None)
                    .await
            }
        }
    }

    /// Commits a finished download after checking every index in `0..total`
    /// has a non-empty file of the recorded size.
    pub async fn complete_download(
        &self,
        chapter_id: i64,
        total: usize,
        files: BTreeMap<usize, PageFile>,
    ) -> Result<Vec<Page>, ReconcileError> {
        let chapter = self.get_chapter(chapter_id).await?;
        let incomplete = |reason: String| ReconcileError::Incomplete { chapter_id, reason };

        if total == 0 {
            return Err(incomplete("no pages".to_string()));
        }

        let mut pages = Vec::with_capacity(total);
        for index in 0..total {
            let Some(file) = files.get(&index) else {
                return Err(incomplete(format!("page {index} missing")));
            };

            let size = match tokio::fs::metadata(&file.path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => return Err(incomplete(format!("page {index} not on disk"))),
            };
            if size == 0 || size != file.size {
                return Err(incomplete(format!(
                    "page {index} has {size} bytes, expected {}",
                    file.size
                )));
            }

            let checksum = match &file.checksum {
                Some(checksum) => checksum.clone(),
                None => self.store.checksum(&file.path).await?,
            };

            pages.push(Page {
                chapter_id,
                index: index as i64,
                remote_url: file.remote_url.clone(),
                local_path: file.path.display().to_string(),
                size: size as i64,
                checksum,
            });
        }

        if files.len() > total {
            return Err(incomplete(format!(
                "{} files for {total} pages",
                files.len()
            )));
        }

        if !self
            .download_repo
            .complete_download(chapter_id, &pages)
            .await?
        {
            return Err(ReconcileError::InvalidTransition {
                chapter_id,
                from: chapter.download_status,
                to: DownloadStatus::Downloaded,
            });
        }

        Ok(pages)
    }

    /// Re-checks the files of a downloaded chapter, demoting it to `error`
    /// when a page is missing or its content changed.
    pub async fn verify_download(&self, chapter_id: i64) -> Result<bool, ReconcileError> {
        let chapter = self.get_chapter(chapter_id).await?;
        if chapter.download_status != DownloadStatus::Downloaded {
            return Err(ReconcileError::InvalidTransition {
                chapter_id,
                from: chapter.download_status,
                to: DownloadStatus::Downloaded,
            });
        }

        let pages = self.download_repo.get_pages(chapter_id).await?;
        let mut failure = pages.is_empty().then(|| "no pages recorded".to_string());

        for (expected, page) in pages.iter().enumerate() {
            if failure.is_some() {
                break;
            }
            if page.index != expected as i64 {
                failure = Some(format!("page {expected} missing"));
                break;
            }

            let size = tokio::fs::metadata(&page.local_path)
                .await
                .map(|meta| meta.len() as i64)
                .unwrap_or(-1);
            if size != page.size || size <= 0 {
                failure = Some(format!("page {}: size mismatch", page.index));
            } else if self.store.checksum(&page.local_path).await? != page.checksum {
                failure = Some(format!("page {}: checksum mismatch", page.index));
            }
        }

        match failure {
            Some(reason) => {
                warn!("chapter {chapter_id} failed integrity check: {reason}");
                self.transition(&chapter, DownloadStatus::Error, Some(&reason))
                    .await?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Deletes the files and page rows of a chapter.
    pub async fn remove_download(&self, chapter_id: i64) -> Result<(), ReconcileError> {
        let chapter = self.get_chapter(chapter_id).await?;
        if chapter.download_status == DownloadStatus::Downloading {
            return Err(ReconcileError::InvalidTransition {
                chapter_id,
                from: chapter.download_status,
                to: DownloadStatus::NotDownloaded,
            });
        }

        self.store.remove_chapter(chapter.work_id, chapter.id).await?;
        self.download_repo.clear_download(chapter_id).await?;

        Ok(())
    }

    /// Chapters left `downloading` by a previous process. Unless they are
    /// resumed they are moved to `error` with detail `interrupted`.
    pub async fn recover_interrupted(&self, resume: bool) -> Result<Vec<Chapter>, ReconcileError> {
        let mut chapters = self
            .download_repo
            .get_chapters_by_download_status(DownloadStatus::Downloading)
            .await?;

        for chapter in chapters.iter_mut() {
            self.store
                .discard_partial(chapter.work_id, chapter.id)
                .await?;

            if !resume {
                self.transition(chapter, DownloadStatus::Error, Some("interrupted"))
                    .await?;
                chapter.download_status = DownloadStatus::Error;
                chapter.download_error = Some("interrupted".to_string());
            }
        }

        Ok(chapters)
    }
}
