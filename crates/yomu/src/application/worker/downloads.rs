use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{
        broadcast::error::RecvError,
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use yomu_source::{manager::SourceManager, prelude::PageInfo};

use crate::{
    application::{
        events::{DownloadOutcome, Event, EventBus, EventReceiver},
        worker::{
            job::{Job, JobContext, JobExit},
            pool::WorkerPool,
        },
    },
    domain::{
        entities::{
            chapter::{Chapter, DownloadStatus},
            download::{DownloadJob, JobOrigin, JobStatus},
        },
        repositories::{
            chapter::ChapterRepository, download::DownloadRepository, work::WorkRepository,
        },
        services::reconcile::{ReconcileError, Reconciler},
    },
    infrastructure::storage::StorageError,
};

pub type DownloadSender = UnboundedSender<Command>;
type DownloadReceiver = UnboundedReceiver<Command>;
type Reply<T> = oneshot::Sender<Result<T, DownloadError>>;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("chapter {chapter_id} can't be downloaded: {reason}")]
    NotDownloadable { chapter_id: i64, reason: String },
    #[error("chapter {0} has an active download")]
    Busy(i64),
    #[error("download worker stopped")]
    WorkerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Requeued,
    AlreadyQueued,
    AlreadyDownloaded,
}

#[derive(Debug)]
pub enum Command {
    Enqueue {
        chapter_id: i64,
        origin: JobOrigin,
        reply: Reply<EnqueueOutcome>,
    },
    Cancel {
        chapter_id: i64,
        reply: Reply<bool>,
    },
    PauseAll(Reply<()>),
    ResumeAll(Reply<()>),
    Jobs(oneshot::Sender<Vec<DownloadJob>>),
    RemoveDownload {
        chapter_id: i64,
        reply: Reply<()>,
    },
    VerifyDownload {
        chapter_id: i64,
        reply: Reply<bool>,
    },
    JobProgress {
        chapter_id: i64,
        completed: usize,
        total: usize,
    },
    JobExited {
        chapter_id: i64,
        exit: JobExit,
    },
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub auto_download_chapters: bool,
    pub resume_interrupted: bool,
    pub page_delay_max: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            auto_download_chapters: false,
            resume_interrupted: false,
            page_delay_max: Duration::from_secs(1),
        }
    }
}

struct Entry {
    seq: u64,
    job: DownloadJob,
    chapter: Chapter,
    pages: Option<Vec<PageInfo>>,
    cancel: Option<CancellationToken>,
    // set once a running job was told to cancel, whatever it exits with
    cancel_requested: bool,
}

// per source, user jobs ahead of auto jobs, both ordered by sequence
#[derive(Default)]
struct SourceQueue {
    user: VecDeque<(u64, i64)>,
    auto: VecDeque<(u64, i64)>,
}

impl SourceQueue {
    fn lane(&mut self, origin: JobOrigin) -> &mut VecDeque<(u64, i64)> {
        match origin {
            JobOrigin::User => &mut self.user,
            JobOrigin::Auto => &mut self.auto,
        }
    }

    fn head(&self) -> Option<(u64, i64)> {
        self.user.front().or_else(|| self.auto.front()).copied()
    }

    fn pop(&mut self) -> Option<(u64, i64)> {
        self.user.pop_front().or_else(|| self.auto.pop_front())
    }

    fn remove(&mut self, chapter_id: i64) {
        self.user.retain(|(_, id)| *id != chapter_id);
        self.auto.retain(|(_, id)| *id != chapter_id);
    }

    fn is_empty(&self) -> bool {
        self.user.is_empty() && self.auto.is_empty()
    }
}

enum Wake {
    Command(Command),
    Event(Event),
    Released,
    Stop,
}

pub struct DownloadWorker<W, C, D>
where
    W: WorkRepository + Clone + 'static,
    C: ChapterRepository + Clone + 'static,
    D: DownloadRepository + Clone + 'static,
{
    reconciler: Reconciler<W, C, D>,
    sources: SourceManager,
    pool: WorkerPool,
    bus: EventBus,
    settings: DownloadSettings,
    tx: DownloadSender,
    rx: DownloadReceiver,
    shutdown: CancellationToken,
    paused: watch::Sender<bool>,
    events: EventReceiver,
    released: watch::Receiver<u64>,
    jobs: HashMap<i64, Entry>,
    queues: HashMap<i64, SourceQueue>,
    seq: u64,
}

impl<W, C, D> DownloadWorker<W, C, D>
where
    W: WorkRepository + Clone + 'static,
    C: ChapterRepository + Clone + 'static,
    D: DownloadRepository + Clone + 'static,
{
    fn new(
        reconciler: Reconciler<W, C, D>,
        sources: SourceManager,
        pool: WorkerPool,
        bus: EventBus,
        settings: DownloadSettings,
        shutdown: CancellationToken,
    ) -> (Self, DownloadSender) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let paused = reconciler.store().is_paused();
        if paused {
            info!("downloads are paused");
        }
        let (paused, _) = watch::channel(paused);
        let events = bus.subscribe();
        let released = pool.subscribe();

        (
            Self {
                reconciler,
                sources,
                pool,
                bus,
                settings,
                tx: tx.clone(),
                rx,
                shutdown,
                paused,
                events,
                released,
                jobs: HashMap::new(),
                queues: HashMap::new(),
                seq: 0,
            },
            tx,
        )
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn recover(&mut self) {
        let chapters = match self
            .reconciler
            .recover_interrupted(self.settings.resume_interrupted)
            .await
        {
            Ok(chapters) => chapters,
            Err(e) => {
                error!("failed to recover interrupted downloads: {e}");
                return;
            }
        };

        for chapter in chapters {
            warn!("chapter {} was interrupted", chapter.id);
            self.bus.publish(Event::DownloadInterrupted {
                chapter_id: chapter.id,
            });

            if self.settings.resume_interrupted {
                if let Err(e) = self.enqueue(chapter.id, JobOrigin::User).await {
                    error!("failed to resume chapter {}: {e}", chapter.id);
                }
            }
        }
    }

    fn push(&mut self, source_id: i64, origin: JobOrigin, seq: u64, chapter_id: i64, front: bool) {
        let lane = self.queues.entry(source_id).or_default().lane(origin);
        if front {
            lane.push_front((seq, chapter_id));
        } else {
            lane.push_back((seq, chapter_id));
        }
    }

    fn unqueue(&mut self, source_id: i64, chapter_id: i64) {
        if let Some(queue) = self.queues.get_mut(&source_id) {
            queue.remove(chapter_id);
            if queue.is_empty() {
                self.queues.remove(&source_id);
            }
        }
    }

    async fn enqueue(
        &mut self,
        chapter_id: i64,
        origin: JobOrigin,
    ) -> Result<EnqueueOutcome, DownloadError> {
        if let Some(entry) = self.jobs.get(&chapter_id) {
            if entry.job.status.is_active() {
                return Ok(EnqueueOutcome::AlreadyQueued);
            }
        }

        let chapter = self.reconciler.get_chapter(chapter_id).await?;
        if chapter.download_status == DownloadStatus::Downloaded {
            return Ok(EnqueueOutcome::AlreadyDownloaded);
        }

        let source = self
            .sources
            .get_source_info(chapter.source_id)
            .map_err(|e| DownloadError::NotDownloadable {
                chapter_id,
                reason: e.to_string(),
            })?;
        if !source.capabilities.downloads {
            return Err(DownloadError::NotDownloadable {
                chapter_id,
                reason: format!("{} does not support downloads", source.name),
            });
        }

        let chapter = self.reconciler.mark_downloading(chapter_id).await?;
        let seq = self.next_seq();

        let outcome = match self.jobs.get_mut(&chapter_id) {
            Some(entry) => {
                entry.seq = seq;
                entry.job.status = JobStatus::Queued;
                entry.job.error = None;
                entry.job.retry_count = 0;
                entry.job.origin = origin;
                entry.job.enqueued_at = chrono::Utc::now().naive_utc();
                entry.chapter = chapter;
                entry.cancel = None;
                entry.cancel_requested = false;
                EnqueueOutcome::Requeued
            }
            None => {
                self.jobs.insert(
                    chapter_id,
                    Entry {
                        seq,
                        job: DownloadJob {
                            chapter_id,
                            work_id: chapter.work_id,
                            source_id: chapter.source_id,
                            status: JobStatus::Queued,
                            error: None,
                            completed: 0,
                            total: 0,
                            retry_count: 0,
                            origin,
                            enqueued_at: chrono::Utc::now().naive_utc(),
                        },
                        chapter,
                        pages: None,
                        cancel: None,
                        cancel_requested: false,
                    },
                );
                EnqueueOutcome::Queued
            }
        };

        let source_id = source.id;
        self.push(source_id, origin, seq, chapter_id, false);
        self.bus.publish(Event::DownloadQueued { chapter_id, origin });
        debug!("chapter {chapter_id} {outcome:?} ({origin:?})");

        Ok(outcome)
    }

    async fn cancel(&mut self, chapter_id: i64) -> Result<bool, DownloadError> {
        let Some(entry) = self.jobs.get(&chapter_id) else {
            // an error left by a previous run has no job
            let chapter = self.reconciler.get_chapter(chapter_id).await?;
            if chapter.download_status == DownloadStatus::Error {
                self.reconciler.mark_download_canceled(chapter_id).await?;
                return Ok(true);
            }
            return Ok(false);
        };

        let status = entry.job.status;
        match status {
            JobStatus::Running => {
                if let Some(entry) = self.jobs.get_mut(&chapter_id) {
                    entry.cancel_requested = true;
                    if let Some(cancel) = &entry.cancel {
                        cancel.cancel();
                    }
                }
                Ok(true)
            }
            JobStatus::Queued | JobStatus::Paused | JobStatus::Error => {
                let source_id = entry.job.source_id;
                self.unqueue(source_id, chapter_id);
                self.jobs.remove(&chapter_id);
                self.reconciler.mark_download_canceled(chapter_id).await?;
                self.bus.publish(Event::DownloadFinished {
                    chapter_id,
                    outcome: DownloadOutcome::Canceled,
                });
                Ok(true)
            }
            JobStatus::Finished | JobStatus::Canceled => Ok(false),
        }
    }

    async fn set_paused(&mut self, paused: bool) -> Result<(), DownloadError> {
        self.reconciler.store().set_paused(paused).await?;
        self.paused.send_replace(paused);
        info!("downloads {}", if paused { "paused" } else { "resumed" });

        Ok(())
    }

    fn snapshot(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<(u64, DownloadJob)> = self
            .jobs
            .values()
            .map(|entry| (entry.seq, entry.job.clone()))
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    async fn remove_download(&mut self, chapter_id: i64) -> Result<(), DownloadError> {
        if self
            .jobs
            .get(&chapter_id)
            .is_some_and(|entry| entry.job.status.is_active())
        {
            return Err(DownloadError::Busy(chapter_id));
        }

        self.jobs.remove(&chapter_id);
        self.reconciler.remove_download(chapter_id).await?;

        Ok(())
    }

    async fn wants_auto_download(&self, work_id: i64) -> Result<bool, ReconcileError> {
        let work = self.reconciler.get_work(work_id).await?;
        if !work.in_library {
            return Ok(false);
        }
        if self.settings.auto_download_chapters {
            return Ok(true);
        }

        let categories = self.reconciler.get_work_categories(work_id).await?;
        Ok(categories.iter().any(|c| c.auto_download))
    }

    async fn auto_download(&mut self, work_id: i64, chapter_id: i64) {
        match self.wants_auto_download(work_id).await {
            Ok(true) => match self.enqueue(chapter_id, JobOrigin::Auto).await {
                Ok(outcome) => debug!("auto download chapter {chapter_id}: {outcome:?}"),
                Err(DownloadError::NotDownloadable { reason, .. }) => {
                    debug!("skip auto download of chapter {chapter_id}: {reason}")
                }
                Err(e) => error!("failed to auto download chapter {chapter_id}: {e}"),
            },
            Ok(false) => {}
            Err(e) => error!("failed to evaluate auto download of chapter {chapter_id}: {e}"),
        }
    }

    async fn job_exited(&mut self, chapter_id: i64, exit: JobExit) {
        let Some(entry) = self.jobs.get_mut(&chapter_id) else {
            return;
        };
        entry.cancel = None;
        let cancel_requested = entry.cancel_requested;

        // the job ended before it saw the cancel
        if cancel_requested && !matches!(exit, JobExit::Canceled { .. }) {
            self.jobs.remove(&chapter_id);
            info!("chapter {chapter_id} canceled after its job ended with {exit:?}");
            if let Err(e) = self.reconciler.mark_download_canceled(chapter_id).await {
                error!("failed to record cancel of chapter {chapter_id}: {e}");
            }
            self.bus.publish(Event::DownloadFinished {
                chapter_id,
                outcome: DownloadOutcome::Canceled,
            });
            return;
        }

        let Some(entry) = self.jobs.get_mut(&chapter_id) else {
            return;
        };

        match exit {
            JobExit::Finished { .. } => {
                self.jobs.remove(&chapter_id);
                self.bus.publish(Event::DownloadFinished {
                    chapter_id,
                    outcome: DownloadOutcome::Downloaded,
                });
            }
            JobExit::Failed { detail, retries } => {
                entry.job.retry_count += retries;
                entry.job.status = JobStatus::Error;
                entry.job.error = Some(detail.clone());
                self.bus.publish(Event::DownloadFinished {
                    chapter_id,
                    outcome: DownloadOutcome::Failed(detail),
                });
            }
            JobExit::Canceled { .. } => {
                self.jobs.remove(&chapter_id);
                self.bus.publish(Event::DownloadFinished {
                    chapter_id,
                    outcome: DownloadOutcome::Canceled,
                });
            }
            JobExit::Paused {
                pages,
                completed,
                retries,
            } => {
                entry.job.retry_count += retries;
                entry.job.status = JobStatus::Paused;
                entry.job.completed = completed;
                entry.job.total = pages.len();
                entry.pages = Some(pages);

                let (source_id, origin, seq) = (entry.job.source_id, entry.job.origin, entry.seq);
                let total = entry.job.total;
                self.push(source_id, origin, seq, chapter_id, true);
                self.bus.publish(Event::DownloadPaused {
                    chapter_id,
                    completed,
                    total,
                });
            }
        }
    }

    /// Starts queued jobs, oldest head first among sources with a free slot.
    fn dispatch(&mut self) {
        if self.is_paused() || self.shutdown.is_cancelled() {
            return;
        }

        loop {
            let next = self
                .queues
                .iter()
                .filter(|(source_id, _)| self.pool.has_capacity(**source_id))
                .filter_map(|(source_id, queue)| queue.head().map(|(seq, _)| (seq, *source_id)))
                .min();

            let Some((_, source_id)) = next else {
                break;
            };
            let Some(slot) = self.pool.try_acquire(source_id) else {
                break;
            };

            let Some(queue) = self.queues.get_mut(&source_id) else {
                break;
            };
            let Some((_, chapter_id)) = queue.pop() else {
                break;
            };
            if queue.is_empty() {
                self.queues.remove(&source_id);
            }

            let Some(entry) = self.jobs.get_mut(&chapter_id) else {
                continue;
            };

            let cancel = CancellationToken::new();
            entry.cancel = Some(cancel.clone());
            entry.job.status = JobStatus::Running;

            let job = Job {
                chapter: entry.chapter.clone(),
                pages: entry.pages.take(),
                cancel,
            };
            let ctx = JobContext {
                reconciler: self.reconciler.clone(),
                sources: self.sources.clone(),
                page_delay_max: self.settings.page_delay_max,
                paused: self.paused.subscribe(),
                shutdown: self.shutdown.clone(),
            };

            info!("start downloading chapter {chapter_id}");
            self.bus.publish(Event::DownloadStarted { chapter_id });

            let tx = self.tx.clone();
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let progress = {
                    let tx = tx.clone();
                    move |completed, total| {
                        let _ = tx.send(Command::JobProgress {
                            chapter_id,
                            completed,
                            total,
                        });
                        bus.publish(Event::DownloadProgress {
                            chapter_id,
                            completed,
                            total,
                        });
                    }
                };

                let exit = job.run(&ctx, progress).await;
                let _ = tx.send(Command::JobExited { chapter_id, exit });
                drop(slot);
            });
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                chapter_id,
                origin,
                reply,
            } => {
                let res = self.enqueue(chapter_id, origin).await;
                let _ = reply.send(res);
            }
            Command::Cancel { chapter_id, reply } => {
                let res = self.cancel(chapter_id).await;
                let _ = reply.send(res);
            }
            Command::PauseAll(reply) => {
                let res = self.set_paused(true).await;
                let _ = reply.send(res);
            }
            Command::ResumeAll(reply) => {
                let res = self.set_paused(false).await;
                let _ = reply.send(res);
            }
            Command::Jobs(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::RemoveDownload { chapter_id, reply } => {
                let res = self.remove_download(chapter_id).await;
                let _ = reply.send(res);
            }
            Command::VerifyDownload { chapter_id, reply } => {
                let res = self
                    .reconciler
                    .verify_download(chapter_id)
                    .await
                    .map_err(DownloadError::from);
                let _ = reply.send(res);
            }
            Command::JobProgress {
                chapter_id,
                completed,
                total,
            } => {
                if let Some(entry) = self.jobs.get_mut(&chapter_id) {
                    entry.job.completed = completed;
                    entry.job.total = total;
                }
            }
            Command::JobExited { chapter_id, exit } => {
                self.job_exited(chapter_id, exit).await
            }
        }
    }

    async fn run(mut self) {
        self.recover().await;

        loop {
            self.dispatch();

            let wake = tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => Wake::Command(cmd),
                    None => Wake::Stop,
                },
                event = self.events.recv() => match event {
                    Ok(event) => Wake::Event(event),
                    Err(RecvError::Lagged(n)) => {
                        warn!("download worker lagged {n} events");
                        continue;
                    }
                    Err(RecvError::Closed) => Wake::Stop,
                },
                _ = self.released.changed() => Wake::Released,
                _ = self.shutdown.cancelled() => Wake::Stop,
            };

            match wake {
                Wake::Command(cmd) => self.handle(cmd).await,
                Wake::Event(Event::ChapterAdded {
                    work_id,
                    chapter_id,
                }) => self.auto_download(work_id, chapter_id).await,
                Wake::Event(_) | Wake::Released => {}
                Wake::Stop => break,
            }
        }

        info!("download worker stopped");
    }
}

/// Public side of the download worker.
#[derive(Clone)]
pub struct DownloadHandle {
    tx: DownloadSender,
}

impl DownloadHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| DownloadError::WorkerGone)?;
        rx.await.map_err(|_| DownloadError::WorkerGone)?
    }

    pub async fn enqueue(&self, chapter_id: i64) -> Result<EnqueueOutcome, DownloadError> {
        self.request(|reply| Command::Enqueue {
            chapter_id,
            origin: JobOrigin::User,
            reply,
        })
        .await
    }

    pub async fn enqueue_many(
        &self,
        chapter_ids: &[i64],
    ) -> Vec<(i64, Result<EnqueueOutcome, DownloadError>)> {
        let mut results = Vec::with_capacity(chapter_ids.len());
        for chapter_id in chapter_ids {
            results.push((*chapter_id, self.enqueue(*chapter_id).await));
        }
        results
    }

    pub async fn cancel(&self, chapter_id: i64) -> Result<bool, DownloadError> {
        self.request(|reply| Command::Cancel { chapter_id, reply })
            .await
    }

    pub async fn pause_all(&self) -> Result<(), DownloadError> {
        self.request(Command::PauseAll).await
    }

    pub async fn resume_all(&self) -> Result<(), DownloadError> {
        self.request(Command::ResumeAll).await
    }

    pub async fn jobs(&self) -> Result<Vec<DownloadJob>, DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Jobs(reply))
            .map_err(|_| DownloadError::WorkerGone)?;
        rx.await.map_err(|_| DownloadError::WorkerGone)
    }

    pub async fn remove_download(&self, chapter_id: i64) -> Result<(), DownloadError> {
        self.request(|reply| Command::RemoveDownload { chapter_id, reply })
            .await
    }

    pub async fn verify_download(&self, chapter_id: i64) -> Result<bool, DownloadError> {
        self.request(|reply| Command::VerifyDownload { chapter_id, reply })
            .await
    }
}

pub fn start<W, C, D>(
    reconciler: Reconciler<W, C, D>,
    sources: SourceManager,
    pool: WorkerPool,
    bus: EventBus,
    settings: DownloadSettings,
    shutdown: CancellationToken,
) -> (DownloadHandle, JoinHandle<()>)
where
    W: WorkRepository + Clone + 'static,
    C: ChapterRepository + Clone + 'static,
    D: DownloadRepository + Clone + 'static,
{
    let (worker, tx) = DownloadWorker::new(reconciler, sources, pool, bus, settings, shutdown);
    let handle = tokio::spawn(worker.run());

    (DownloadHandle { tx }, handle)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use yomu_source::prelude::{Capabilities, ProviderError};

    use super::*;
    use crate::{
        test_util::{FakeProvider, Fixture, SOURCE_ID, wait_for},
    };

    fn settings() -> DownloadSettings {
        DownloadSettings {
            page_delay_max: Duration::ZERO,
            ..Default::default()
        }
    }

    fn start_worker(
        fixture: &Fixture,
        pool: WorkerPool,
        settings: DownloadSettings,
    ) -> (DownloadHandle, EventBus, EventReceiver) {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let (handle, _) = start(
            fixture.reconciler.clone(),
            fixture.sources.clone(),
            pool,
            bus.clone(),
            settings,
            CancellationToken::new(),
        );

        (handle, bus, events)
    }

    async fn finished(events: &mut EventReceiver, chapter_id: i64) -> DownloadOutcome {
        match wait_for(events, |e| {
            matches!(e, Event::DownloadFinished { chapter_id: id, .. } if *id == chapter_id)
        })
        .await
        {
            Event::DownloadFinished { outcome, .. } => outcome,
            _ => unreachable!(),
        }
    }

    async fn progress(events: &mut EventReceiver, chapter_id: i64, completed: usize) {
        wait_for(events, |e| {
            matches!(e, Event::DownloadProgress { chapter_id: id, completed: n, .. }
                if *id == chapter_id && *n == completed)
        })
        .await;
    }

    #[tokio::test]
    async fn test_download_writes_every_page() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        assert_eq!(handle.enqueue(chapter_id).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Downloaded
        );

        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::Downloaded);

        let pages = fixture.reconciler.get_pages(chapter_id).await.unwrap();
        assert_eq!(pages.len(), 5);
        for (index, page) in pages.iter().enumerate() {
            assert_eq!(page.index, index as i64);
            let meta = tokio::fs::metadata(&page.local_path).await.unwrap();
            assert!(meta.len() > 0);
            assert_eq!(meta.len() as i64, page.size);
        }

        assert!(handle.jobs().await.unwrap().is_empty());
        assert_eq!(
            handle.enqueue(chapter_id).await.unwrap(),
            EnqueueOutcome::AlreadyDownloaded
        );
        assert!(
            fixture
                .reconciler
                .store()
                .work_dir(work.id)
                .join("details.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_per_source_ceiling_with_two_sources() {
        let mut fixture = Fixture::new().await;
        let work = fixture
            .add_work(
                "/w/1",
                &[("/w/1/c/1", 1.0), ("/w/1/c/2", 2.0), ("/w/1/c/3", 3.0)],
                2,
            )
            .await;

        let other = Arc::new(FakeProvider::new(2));
        fixture.sources.register(other.clone()).unwrap();
        let info = other.work_info("/o/1", "Other");
        other.set_work(info.clone());
        other.set_chapters("/o/1", &[("/o/1/c/1", 1.0)], 2);
        let other_work = fixture.reconciler.add_work(info, &[]).await.unwrap();
        fixture
            .reconciler
            .reconcile_work(
                &other_work,
                vec![other.chapter_info("/o/1/c/1", 1.0)],
                None,
                true,
            )
            .await
            .unwrap();

        let mut ids = vec![];
        for path in ["/w/1/c/1", "/w/1/c/2", "/w/1/c/3"] {
            ids.push(fixture.chapter_id(work.id, path).await);
        }
        let other_id = fixture.chapter_id(other_work.id, "/o/1/c/1").await;

        fixture.provider.hold_from(0);
        other.hold_from(0);
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());
        for chapter_id in ids.iter().chain([&other_id]) {
            assert_eq!(
                handle.enqueue(*chapter_id).await.unwrap(),
                EnqueueOutcome::Queued
            );
        }

        let jobs = handle.jobs().await.unwrap();
        let count = |source_id: i64, status: JobStatus| {
            jobs.iter()
                .filter(|job| job.source_id == source_id && job.status == status)
                .count()
        };
        assert_eq!(count(SOURCE_ID, JobStatus::Running), 2);
        assert_eq!(count(SOURCE_ID, JobStatus::Queued), 1);
        assert_eq!(count(2, JobStatus::Running), 1);

        fixture.provider.release();
        other.release();
        let mut outcomes = HashMap::new();
        while outcomes.len() < 4 {
            if let Event::DownloadFinished {
                chapter_id,
                outcome,
                ..
            } = wait_for(&mut events, |e| matches!(e, Event::DownloadFinished { .. })).await
            {
                outcomes.insert(chapter_id, outcome);
            }
        }
        for chapter_id in ids.iter().chain([&other_id]) {
            assert_eq!(outcomes[chapter_id], DownloadOutcome::Downloaded);
        }
    }

    #[tokio::test]
    async fn test_double_enqueue_creates_one_job() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 3).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        fixture.provider.hold_from(0);
        assert_eq!(handle.enqueue(chapter_id).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(
            handle.enqueue(chapter_id).await.unwrap(),
            EnqueueOutcome::AlreadyQueued
        );
        assert_eq!(handle.jobs().await.unwrap().len(), 1);

        fixture.provider.release();
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Downloaded
        );
        assert_eq!(
            fixture
                .provider
                .fetches(&FakeProvider::page_url("/w/1/c/1", 0)),
            1
        );
        assert_eq!(fixture.provider.fetches("/w/1/c/1"), 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_finished_pages() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        fixture.provider.hold_from(2);
        handle.enqueue(chapter_id).await.unwrap();
        progress(&mut events, chapter_id, 2).await;

        assert!(handle.cancel(chapter_id).await.unwrap());
        // the page in flight completes and is thrown away
        fixture.provider.release();
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Canceled
        );

        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::NotDownloaded);
        assert!(fixture.reconciler.get_pages(chapter_id).await.unwrap().is_empty());

        let stored = fixture
            .reconciler
            .store()
            .scan(work.id, chapter_id)
            .await
            .unwrap();
        assert_eq!(stored.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(handle.jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_failing_page() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        fixture.provider.hold_from(2);
        handle.enqueue(chapter_id).await.unwrap();
        progress(&mut events, chapter_id, 2).await;

        assert!(handle.cancel(chapter_id).await.unwrap());
        fixture.provider.fail(
            &FakeProvider::page_url("/w/1/c/1", 2),
            ProviderError::content_missing("404"),
        );
        fixture.provider.release();
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Canceled
        );

        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::NotDownloaded);
        assert_eq!(chapter.download_error, None);
        assert!(handle.jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_last_page_is_not_lost() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        handle.enqueue(chapter_id).await.unwrap();
        progress(&mut events, chapter_id, 5).await;

        // the job may or may not have committed when the cancel arrives,
        // an accepted cancel must still win
        let canceled = handle.cancel(chapter_id).await.unwrap();
        let outcome = finished(&mut events, chapter_id).await;
        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();

        if canceled {
            assert_eq!(outcome, DownloadOutcome::Canceled);
            assert_eq!(chapter.download_status, DownloadStatus::NotDownloaded);
            assert!(fixture.reconciler.get_pages(chapter_id).await.unwrap().is_empty());
        } else {
            assert_eq!(outcome, DownloadOutcome::Downloaded);
            assert_eq!(chapter.download_status, DownloadStatus::Downloaded);
        }
        assert!(handle.jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_download() {
        let fixture = Fixture::new().await;
        let work = fixture
            .add_work("/w/1", &[("/w/1/c/1", 1.0), ("/w/1/c/2", 2.0)], 2)
            .await;
        let first = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let second = fixture.chapter_id(work.id, "/w/1/c/2").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(1, 1.0), settings());

        fixture.provider.hold_from(0);
        handle.enqueue(first).await.unwrap();
        handle.enqueue(second).await.unwrap();

        assert!(handle.cancel(second).await.unwrap());
        assert_eq!(finished(&mut events, second).await, DownloadOutcome::Canceled);

        let chapter = fixture.reconciler.get_chapter(second).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::NotDownloaded);

        fixture.provider.release();
        assert_eq!(finished(&mut events, first).await, DownloadOutcome::Downloaded);
        assert_eq!(fixture.provider.fetches("/w/1/c/2"), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_earlier_pages() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        let broken = FakeProvider::page_url("/w/1/c/1", 3);
        fixture
            .provider
            .fail(&broken, ProviderError::content_missing("404"));

        handle.enqueue(chapter_id).await.unwrap();
        let DownloadOutcome::Failed(detail) = finished(&mut events, chapter_id).await else {
            panic!("download should fail");
        };
        assert!(detail.contains("page 3"), "{detail}");
        assert_eq!(fixture.provider.fetches(&broken), 1);

        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::Error);
        assert!(chapter.download_error.unwrap().contains("page 3"));

        let stored = fixture
            .reconciler
            .store()
            .scan(work.id, chapter_id)
            .await
            .unwrap();
        assert_eq!(stored.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

        let jobs = handle.jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_retry_after_error_fetches_only_missing_pages() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        let flaky = FakeProvider::page_url("/w/1/c/1", 3);
        fixture
            .provider
            .fail(&flaky, ProviderError::unavailable("503"));

        handle.enqueue(chapter_id).await.unwrap();
        assert!(matches!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Failed(_)
        ));
        assert_eq!(fixture.provider.fetches(&flaky), 3);
        let jobs = handle.jobs().await.unwrap();
        assert_eq!(jobs[0].retry_count, 2);

        fixture.provider.clear_failures();
        fixture.provider.hold_from(0);
        assert_eq!(
            handle.enqueue(chapter_id).await.unwrap(),
            EnqueueOutcome::Requeued
        );
        let jobs = handle.jobs().await.unwrap();
        assert_eq!(jobs[0].retry_count, 0);
        assert_eq!(jobs[0].error, None);

        fixture.provider.release();
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Downloaded
        );

        for index in 0..3 {
            assert_eq!(
                fixture
                    .provider
                    .fetches(&FakeProvider::page_url("/w/1/c/1", index)),
                1
            );
        }
        assert_eq!(fixture.provider.fetches(&flaky), 4);
        assert_eq!(
            fixture.reconciler.get_pages(chapter_id).await.unwrap().len(),
            5
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_refetches_nothing() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 5).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        fixture.provider.hold_from(2);
        handle.enqueue(chapter_id).await.unwrap();
        progress(&mut events, chapter_id, 2).await;

        handle.pause_all().await.unwrap();
        fixture.provider.release();
        let Event::DownloadPaused {
            completed, total, ..
        } = wait_for(&mut events, |e| matches!(e, Event::DownloadPaused { .. })).await
        else {
            unreachable!();
        };
        assert!(completed < total);
        assert_eq!(total, 5);
        assert!(fixture.reconciler.store().is_paused());

        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::Downloading);
        let jobs = handle.jobs().await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Paused);

        handle.resume_all().await.unwrap();
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Downloaded
        );
        assert!(!fixture.reconciler.store().is_paused());

        for index in 0..5 {
            assert_eq!(
                fixture
                    .provider
                    .fetches(&FakeProvider::page_url("/w/1/c/1", index)),
                1
            );
        }
        assert_eq!(fixture.provider.fetches("/w/1/c/1"), 1);
    }

    #[tokio::test]
    async fn test_restart_marks_interrupted_download_as_error() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 2).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        fixture.reconciler.mark_downloading(chapter_id).await.unwrap();

        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());
        wait_for(&mut events, |e| {
            matches!(e, Event::DownloadInterrupted { chapter_id: id } if *id == chapter_id)
        })
        .await;

        // commands are handled after recovery
        assert!(handle.jobs().await.unwrap().is_empty());
        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::Error);
        assert_eq!(chapter.download_error.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn test_restart_resumes_interrupted_download() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 2).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        fixture.reconciler.mark_downloading(chapter_id).await.unwrap();

        let (_handle, _bus, mut events) = start_worker(
            &fixture,
            WorkerPool::new(4, 0.5),
            DownloadSettings {
                resume_interrupted: true,
                ..settings()
            },
        );

        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Downloaded
        );
    }

    #[tokio::test]
    async fn test_new_chapter_is_downloaded_automatically() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 2).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (_handle, bus, mut events) = start_worker(
            &fixture,
            WorkerPool::new(4, 0.5),
            DownloadSettings {
                auto_download_chapters: true,
                ..settings()
            },
        );

        bus.publish(Event::ChapterAdded {
            work_id: work.id,
            chapter_id,
        });

        let Event::DownloadQueued { origin, .. } =
            wait_for(&mut events, |e| matches!(e, Event::DownloadQueued { .. })).await
        else {
            unreachable!();
        };
        assert_eq!(origin, JobOrigin::Auto);
        assert_eq!(
            finished(&mut events, chapter_id).await,
            DownloadOutcome::Downloaded
        );
    }

    #[tokio::test]
    async fn test_user_downloads_run_before_automatic_ones() {
        let fixture = Fixture::new().await;
        let work = fixture
            .add_work(
                "/w/1",
                &[("/w/1/c/1", 1.0), ("/w/1/c/2", 2.0), ("/w/1/c/3", 3.0)],
                1,
            )
            .await;
        let first = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let auto = fixture.chapter_id(work.id, "/w/1/c/2").await;
        let user = fixture.chapter_id(work.id, "/w/1/c/3").await;
        let (handle, bus, mut events) = start_worker(
            &fixture,
            WorkerPool::new(1, 1.0),
            DownloadSettings {
                auto_download_chapters: true,
                ..settings()
            },
        );
        let mut starts = bus.subscribe();

        fixture.provider.hold_from(0);
        handle.enqueue(first).await.unwrap();
        bus.publish(Event::ChapterAdded {
            work_id: work.id,
            chapter_id: auto,
        });
        wait_for(&mut events, |e| {
            matches!(e, Event::DownloadQueued { chapter_id, .. } if *chapter_id == auto)
        })
        .await;
        handle.enqueue(user).await.unwrap();
        fixture.provider.release();

        let mut started = vec![];
        while started.len() < 3 {
            if let Event::DownloadStarted { chapter_id } =
                wait_for(&mut starts, |e| matches!(e, Event::DownloadStarted { .. })).await
            {
                started.push(chapter_id);
            }
        }

        assert_eq!(started, vec![first, user, auto]);
    }

    #[tokio::test]
    async fn test_source_without_downloads_is_rejected() {
        let fixture = Fixture::with_provider(FakeProvider::with_capabilities(
            SOURCE_ID,
            Capabilities {
                downloads: false,
                ..Default::default()
            },
        ))
        .await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 2).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, _events) = start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        assert!(matches!(
            handle.enqueue(chapter_id).await,
            Err(DownloadError::NotDownloadable { .. })
        ));
        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::NotDownloaded);
    }

    #[tokio::test]
    async fn test_remove_active_download_is_refused() {
        let fixture = Fixture::new().await;
        let work = fixture.add_work("/w/1", &[("/w/1/c/1", 1.0)], 2).await;
        let chapter_id = fixture.chapter_id(work.id, "/w/1/c/1").await;
        let (handle, _bus, mut events) =
            start_worker(&fixture, WorkerPool::new(4, 0.5), settings());

        fixture.provider.hold_from(0);
        handle.enqueue(chapter_id).await.unwrap();
        assert!(matches!(
            handle.remove_download(chapter_id).await,
            Err(DownloadError::Busy(_))
        ));

        fixture.provider.release();
        finished(&mut events, chapter_id).await;
        assert!(handle.verify_download(chapter_id).await.unwrap());

        handle.remove_download(chapter_id).await.unwrap();
        let chapter = fixture.reconciler.get_chapter(chapter_id).await.unwrap();
        assert_eq!(chapter.download_status, DownloadStatus::NotDownloaded);
    }
}
