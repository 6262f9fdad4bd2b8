//! Long running side of the pipeline: the update scheduler, the download
//! queue and the events they publish.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use yomu_source::manager::SourceManager;

use crate::{
    application::{
        events::{EventBus, EventReceiver},
        worker::{
            downloads::{self, DownloadHandle, DownloadSettings},
            pool::WorkerPool,
            updates::{self, UpdateHandle, UpdateSettings},
        },
    },
    domain::services::reconcile::Reconciler,
    infrastructure::{
        config::Config,
        database::Pool,
        domain::repositories::{
            chapter::ChapterRepositoryImpl, download::DownloadRepositoryImpl,
            work::WorkRepositoryImpl,
        },
        storage::PageStore,
    },
};

pub mod events;
pub mod worker;

pub type SqliteReconciler =
    Reconciler<WorkRepositoryImpl, ChapterRepositoryImpl, DownloadRepositoryImpl>;

impl From<&Config> for DownloadSettings {
    fn from(config: &Config) -> Self {
        Self {
            auto_download_chapters: config.auto_download_chapters,
            resume_interrupted: config.resume_interrupted_downloads,
            page_delay_max: config.page_delay_max(),
        }
    }
}

impl From<&Config> for UpdateSettings {
    fn from(config: &Config) -> Self {
        Self {
            period: config.update_interval,
            at_startup: config.update_at_startup,
            workers: config.workers,
            prune_removed_chapters: config.prune_removed_chapters,
            refresh_metadata: config.refresh_metadata,
            allow_nsfw: config.allow_nsfw,
        }
    }
}

pub fn reconciler(pool: Pool, download_path: &str) -> SqliteReconciler {
    Reconciler::new(
        WorkRepositoryImpl::new(pool.clone()),
        ChapterRepositoryImpl::new(pool.clone()),
        DownloadRepositoryImpl::new(pool),
        PageStore::new(download_path),
    )
}

/// Running workers sharing one event bus and one worker pool.
pub struct Pipeline {
    reconciler: SqliteReconciler,
    sources: SourceManager,
    bus: EventBus,
    downloads: DownloadHandle,
    updates: UpdateHandle,
    shutdown: CancellationToken,
    download_worker: JoinHandle<()>,
    update_worker: JoinHandle<()>,
}

pub fn start(config: &Config, pool: Pool, sources: SourceManager) -> Pipeline {
    let reconciler = reconciler(pool, &config.download_path);
    let workers = WorkerPool::new(config.workers, config.per_source_share);

    let bus = EventBus::default();
    let shutdown = CancellationToken::new();

    let (downloads, download_worker) = downloads::start(
        reconciler.clone(),
        sources.clone(),
        workers.clone(),
        bus.clone(),
        DownloadSettings::from(config),
        shutdown.clone(),
    );

    let (updates, update_worker) = updates::start(
        reconciler.clone(),
        sources.clone(),
        workers,
        bus.clone(),
        UpdateSettings::from(config),
        shutdown.clone(),
    );

    Pipeline {
        reconciler,
        sources,
        bus,
        downloads,
        updates,
        shutdown,
        download_worker,
        update_worker,
    }
}

impl Pipeline {
    pub fn downloads(&self) -> &DownloadHandle {
        &self.downloads
    }

    pub fn updates(&self) -> &UpdateHandle {
        &self.updates
    }

    pub fn reconciler(&self) -> &SqliteReconciler {
        &self.reconciler
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// Resolves when either worker exits on its own.
    pub async fn stopped(&mut self) {
        tokio::select! {
            _ = &mut self.download_worker => info!("download worker quit"),
            _ = &mut self.update_worker => info!("update worker quit"),
        }
    }

    /// Stops both workers. Running jobs stop like a pause and their chapters
    /// are recovered as interrupted on the next start.
    pub async fn shutdown(self, grace: Duration) {
        let Pipeline {
            shutdown,
            download_worker,
            update_worker,
            ..
        } = self;
        shutdown.cancel();

        let workers = async move {
            for worker in [download_worker, update_worker] {
                if !worker.is_finished() {
                    let _ = worker.await;
                }
            }
        };
        if tokio::time::timeout(grace, workers).await.is_err() {
            warn!("workers did not stop within {grace:?}");
        }
    }
}
