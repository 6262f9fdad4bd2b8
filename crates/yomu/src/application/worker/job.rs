use std::{collections::BTreeMap, time::Duration};

use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use yomu_source::{
    fetch::FetchError,
    manager::SourceManager,
    prelude::{PageInfo, ProviderError},
};

use crate::domain::{
    entities::chapter::Chapter,
    repositories::{chapter::ChapterRepository, download::DownloadRepository, work::WorkRepository},
    services::reconcile::{PageFile, Reconciler},
};

/// How a job task ended, reported back to the download worker.
#[derive(Debug)]
pub enum JobExit {
    Finished {
        retries: u32,
    },
    Failed {
        detail: String,
        retries: u32,
    },
    Canceled {
        retries: u32,
    },
    /// Stopped before the next page, the chapter stays `downloading`.
    Paused {
        pages: Vec<PageInfo>,
        completed: usize,
        retries: u32,
    },
}

pub(crate) struct JobContext<W, C, D>
where
    W: WorkRepository,
    C: ChapterRepository,
    D: DownloadRepository,
{
    pub reconciler: Reconciler<W, C, D>,
    pub sources: SourceManager,
    pub page_delay_max: Duration,
    pub paused: watch::Receiver<bool>,
    pub shutdown: CancellationToken,
}

fn describe(error: &FetchError) -> String {
    match error.provider_error() {
        Some(ProviderError::RateLimited { .. }) => "rate limited".to_string(),
        Some(e) => e.to_string(),
        None => error.to_string(),
    }
}

// retries spent on a call that still failed
fn failed_retries(error: &FetchError) -> u32 {
    match error {
        FetchError::Provider { attempts, .. } => attempts.saturating_sub(1),
        _ => 0,
    }
}

// pages sorted by index with positions as indices
fn normalize(mut pages: Vec<PageInfo>) -> Vec<PageInfo> {
    pages.sort_by_key(|page| page.index);
    for (index, page) in pages.iter_mut().enumerate() {
        page.index = index;
    }
    pages
}

pub(crate) struct Job {
    pub chapter: Chapter,
    pub pages: Option<Vec<PageInfo>>,
    pub cancel: CancellationToken,
}

impl Job {
    pub async fn run<W, C, D, F>(self, ctx: &JobContext<W, C, D>, progress: F) -> JobExit
    where
        W: WorkRepository,
        C: ChapterRepository,
        D: DownloadRepository,
        F: Fn(usize, usize) + Send + Sync,
    {
        let chapter_id = self.chapter.id;
        let cancel = self.cancel.clone();
        let exit = match self.download(ctx, progress).await {
            // a cancel that lands while a page is in flight wins over its result
            JobExit::Failed { retries, .. } | JobExit::Paused { retries, .. }
                if cancel.is_cancelled() =>
            {
                JobExit::Canceled { retries }
            }
            exit => exit,
        };

        match &exit {
            JobExit::Failed { detail, .. } => {
                warn!("chapter {chapter_id} failed: {detail}");
                if let Err(e) = ctx.reconciler.mark_download_failed(chapter_id, detail).await {
                    error!("failed to record failure of chapter {chapter_id}: {e}");
                }
            }
            JobExit::Canceled { .. } => {
                info!("chapter {chapter_id} canceled");
                if let Err(e) = ctx.reconciler.mark_download_canceled(chapter_id).await {
                    error!("failed to record cancel of chapter {chapter_id}: {e}");
                }
            }
            JobExit::Finished { .. } => info!("chapter {chapter_id} downloaded"),
            JobExit::Paused { completed, .. } => {
                info!("chapter {chapter_id} paused after {completed} pages")
            }
        }

        exit
    }

    async fn download<W, C, D, F>(self, ctx: &JobContext<W, C, D>, progress: F) -> JobExit
    where
        W: WorkRepository,
        C: ChapterRepository,
        D: DownloadRepository,
        F: Fn(usize, usize) + Send + Sync,
    {
        let Job {
            chapter,
            pages,
            cancel,
        } = self;
        let store = ctx.reconciler.store();
        let mut retries = 0;

        match ctx.reconciler.get_work(chapter.work_id).await {
            Ok(work) => {
                if let Err(e) = store.save_work_info_if_not_exists(&work).await {
                    warn!("failed to save details of work {}: {e}", work.id);
                }
            }
            Err(e) => warn!("failed to get work {}: {e}", chapter.work_id),
        }

        let pages = match pages {
            Some(pages) => pages,
            None => match ctx
                .sources
                .get_pages(chapter.source_id, chapter.path.clone(), &cancel)
                .await
            {
                Ok(fetched) => {
                    retries += fetched.retries;
                    normalize(fetched.value)
                }
                Err(FetchError::Canceled) => return JobExit::Canceled { retries },
                Err(e) => {
                    return JobExit::Failed {
                        detail: format!("page list: {}", describe(&e)),
                        retries: retries + failed_retries(&e),
                    };
                }
            },
        };

        if pages.is_empty() {
            return JobExit::Failed {
                detail: "page list: source returned no pages".to_string(),
                retries,
            };
        }
        let total = pages.len();

        let mut files: BTreeMap<usize, PageFile> = match store.scan(chapter.work_id, chapter.id).await
        {
            Ok(existing) => existing
                .into_iter()
                .filter(|(index, page)| *index < total && page.size > 0)
                .map(|(index, page)| {
                    (
                        index,
                        PageFile {
                            remote_url: pages[index].url.clone(),
                            path: page.path,
                            size: page.size,
                            checksum: None,
                        },
                    )
                })
                .collect(),
            Err(e) => {
                return JobExit::Failed {
                    detail: format!("storage: {e}"),
                    retries,
                };
            }
        };

        if !files.is_empty() {
            debug!(
                "chapter {} has {} of {total} pages on disk",
                chapter.id,
                files.len()
            );
        }
        progress(files.len(), total);

        let mut remaining = pages.iter().filter(|p| !files.contains_key(&p.index)).count();
        for page in pages.iter() {
            if files.contains_key(&page.index) {
                continue;
            }

            if cancel.is_cancelled() {
                return JobExit::Canceled { retries };
            }
            if *ctx.paused.borrow() || ctx.shutdown.is_cancelled() {
                return JobExit::Paused {
                    completed: files.len(),
                    pages: pages.clone(),
                    retries,
                };
            }

            let started = Instant::now();
            let image = match ctx
                .sources
                .get_page_image(chapter.source_id, page.clone(), &cancel)
                .await
            {
                Ok(fetched) => {
                    retries += fetched.retries;
                    fetched.value
                }
                Err(FetchError::Canceled) => return JobExit::Canceled { retries },
                Err(e) => {
                    return JobExit::Failed {
                        detail: format!("page {}: {}", page.index, describe(&e)),
                        retries: retries + failed_retries(&e),
                    };
                }
            };
            let elapsed = started.elapsed();

            if cancel.is_cancelled() {
                return JobExit::Canceled { retries };
            }

            let written = match store
                .write_page(chapter.work_id, chapter.id, page.index, &image)
                .await
            {
                Ok(written) => written,
                Err(e) => {
                    return JobExit::Failed {
                        detail: format!("page {}: {e}", page.index),
                        retries,
                    };
                }
            };

            files.insert(
                page.index,
                PageFile {
                    remote_url: page.url.clone(),
                    path: written.path,
                    size: written.size,
                    checksum: Some(written.checksum),
                },
            );
            progress(files.len(), total);

            remaining -= 1;
            if remaining > 0 {
                let delay = elapsed.saturating_mul(2).min(ctx.page_delay_max);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return JobExit::Canceled { retries },
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return JobExit::Canceled { retries };
        }

        match ctx.reconciler.complete_download(chapter.id, total, files).await {
            Ok(_) => JobExit::Finished { retries },
            Err(e) => JobExit::Failed {
                detail: e.to_string(),
                retries,
            },
        }
    }
}
