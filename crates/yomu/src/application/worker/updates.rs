use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{StreamExt, stream};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use yomu_source::{fetch::FetchError, manager::SourceManager};

use crate::{
    application::{
        events::{Event, EventBus},
        worker::pool::WorkerPool,
    },
    domain::{
        entities::work::Work,
        repositories::{
            chapter::ChapterRepository, download::DownloadRepository, work::WorkRepository,
        },
        services::reconcile::{ReconcileError, ReconcileOutcome, Reconciler},
    },
};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
    #[error("update worker stopped")]
    WorkerGone,
}

/// Summary of one update pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReport {
    pub checked: usize,
    pub updated: Vec<i64>,
    pub new_chapters: usize,
    pub skipped: Vec<(i64, String)>,
    pub failed: Vec<(i64, String)>,
    pub canceled: bool,
}

#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Unchanged,
    Updated(ReconcileOutcome),
    Skipped(String),
    Failed(String),
    Canceled,
}

impl UpdateReport {
    fn record(&mut self, work_id: i64, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::Unchanged => self.checked += 1,
            WorkOutcome::Updated(outcome) => {
                self.checked += 1;
                self.new_chapters += outcome.added.len();
                self.updated.push(work_id);
            }
            WorkOutcome::Skipped(reason) => self.skipped.push((work_id, reason)),
            WorkOutcome::Failed(reason) => {
                self.checked += 1;
                self.failed.push((work_id, reason));
            }
            WorkOutcome::Canceled => self.canceled = true,
        }
    }
}

type Reply = oneshot::Sender<Result<UpdateReport, UpdateError>>;

pub enum Command {
    All(Reply),
    Works(Vec<i64>, Reply),
    Category(i64, Reply),
    Cancel,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::All(_) => write!(f, "Command::All"),
            Command::Works(ids, _) => write!(f, "Command::Works({ids:?})"),
            Command::Category(id, _) => write!(f, "Command::Category({id})"),
            Command::Cancel => write!(f, "Command::Cancel"),
        }
    }
}

pub type UpdateCommandReceiver = flume::Receiver<Command>;
pub type UpdateCommandSender = flume::Sender<Command>;

enum Selection {
    All,
    Works(Vec<i64>),
    Category(i64),
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// seconds between periodic passes, 0 disables them
    pub period: u64,
    pub at_startup: bool,
    pub workers: usize,
    pub prune_removed_chapters: bool,
    pub refresh_metadata: bool,
    pub allow_nsfw: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            period: 3600,
            at_startup: false,
            workers: 4,
            prune_removed_chapters: true,
            refresh_metadata: true,
            allow_nsfw: false,
        }
    }
}

#[derive(Default)]
struct WorkLocks(Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>);

impl WorkLocks {
    fn get(&self, work_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(work_id)
            .or_default()
            .clone()
    }
}

struct PassContext<W, C, D>
where
    W: WorkRepository,
    C: ChapterRepository,
    D: DownloadRepository,
{
    reconciler: Reconciler<W, C, D>,
    sources: SourceManager,
    pool: WorkerPool,
    bus: EventBus,
    settings: UpdateSettings,
    locks: WorkLocks,
}

impl<W, C, D> PassContext<W, C, D>
where
    W: WorkRepository + Clone + 'static,
    C: ChapterRepository + Clone + 'static,
    D: DownloadRepository + Clone + 'static,
{
    async fn select(&self, selection: Selection) -> Result<(Vec<Work>, UpdateReport), UpdateError> {
        let mut report = UpdateReport::default();
        let works = match selection {
            Selection::All => self.reconciler.get_library().await?,
            Selection::Category(category_id) => {
                self.reconciler.get_works_by_category(category_id).await?
            }
            Selection::Works(ids) => {
                let mut works = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.reconciler.get_work(id).await {
                        Ok(work) => works.push(work),
                        Err(ReconcileError::NotFound(what)) => {
                            report.failed.push((id, format!("{what} not found")))
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                works
            }
        };

        Ok((works, report))
    }

    fn skip_reason(&self, work: &Work) -> Option<String> {
        let source = match self.sources.get(work.source_id) {
            Ok(source) => source,
            Err(_) => return None,
        };
        let info = source.source_info();

        if !info.capabilities.chapter_updates {
            Some(format!("{} does not support chapter updates", info.name))
        } else if info.capabilities.nsfw && !self.settings.allow_nsfw {
            Some(format!("{} is nsfw", info.name))
        } else if info.capabilities.requires_login && !source.logged_in() {
            Some(format!("{} requires login", info.name))
        } else {
            None
        }
    }

    async fn fail(&self, work: &Work, reason: String) -> WorkOutcome {
        warn!("failed to update {} ({}): {reason}", work.title, work.id);
        if let Err(e) = self.reconciler.record_update_failure(work.id, &reason).await {
            error!("failed to record update failure of work {}: {e}", work.id);
        }
        self.bus.publish(Event::WorkUpdateFailed {
            work_id: work.id,
            reason: reason.clone(),
        });

        WorkOutcome::Failed(reason)
    }

    async fn update_work(&self, work: Work, cancel: &CancellationToken) -> WorkOutcome {
        if cancel.is_cancelled() {
            return WorkOutcome::Canceled;
        }

        let lock = self.locks.get(work.id);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return WorkOutcome::Canceled,
            guard = lock.lock() => guard,
        };

        if let Some(reason) = self.skip_reason(&work) {
            debug!("skip {}: {reason}", work.title);
            return WorkOutcome::Skipped(reason);
        }

        debug!("checking updates: {}", work.title);

        let slot = tokio::select! {
            _ = cancel.cancelled() => return WorkOutcome::Canceled,
            slot = self.pool.acquire(work.source_id) => slot,
        };

        let chapters = match self
            .sources
            .get_chapters(work.source_id, work.path.clone(), cancel)
            .await
        {
            Ok(fetched) => fetched.value,
            Err(FetchError::Canceled) => return WorkOutcome::Canceled,
            Err(e) => return self.fail(&work, e.to_string()).await,
        };

        let detail = if self.settings.refresh_metadata {
            match self
                .sources
                .get_work_detail(work.source_id, work.path.clone(), cancel)
                .await
            {
                Ok(fetched) => Some(fetched.value),
                Err(FetchError::Canceled) => return WorkOutcome::Canceled,
                Err(e) => {
                    warn!("failed to refresh details of {}: {e}", work.title);
                    None
                }
            }
        } else {
            None
        };
        drop(slot);

        let outcome = match self
            .reconciler
            .reconcile_work(
                &work,
                chapters,
                detail.as_ref(),
                self.settings.prune_removed_chapters,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(&work, e.to_string()).await,
        };

        if outcome.is_unchanged() {
            debug!("{} has no changes", work.title);
            return WorkOutcome::Unchanged;
        }

        info!(
            "{} has {} new chapters, {} changed, {} removed",
            work.title,
            outcome.added.len(),
            outcome.changed,
            outcome.removed
        );

        for chapter_id in &outcome.added {
            self.bus.publish(Event::ChapterAdded {
                work_id: work.id,
                chapter_id: *chapter_id,
            });
        }
        self.bus.publish(Event::WorkUpdated {
            work_id: work.id,
            added: outcome.added.len(),
            changed: outcome.changed,
            removed: outcome.removed,
            metadata_changed: outcome.metadata_changed,
        });

        WorkOutcome::Updated(outcome)
    }

    async fn run_pass(
        self: Arc<Self>,
        selection: Selection,
        cancel: CancellationToken,
    ) -> Result<UpdateReport, UpdateError> {
        let started = Instant::now();
        let (works, mut report) = self.select(selection).await?;
        info!("updating {} works", works.len());

        let outcomes: Vec<(i64, WorkOutcome)> = stream::iter(works)
            .map(|work| {
                let ctx = self.clone();
                let cancel = cancel.clone();
                async move {
                    let work_id = work.id;
                    (work_id, ctx.update_work(work, &cancel).await)
                }
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        for (work_id, outcome) in outcomes {
            report.record(work_id, outcome);
        }
        report.updated.sort_unstable();
        report.failed.sort();

        info!(
            "update pass done in {:?}: {} checked, {} updated, {} failed",
            started.elapsed(),
            report.checked,
            report.updated.len(),
            report.failed.len()
        );
        self.bus
            .publish(Event::LibraryUpdateFinished(report.clone()));

        Ok(report)
    }
}

struct UpdatesWorker<W, C, D>
where
    W: WorkRepository,
    C: ChapterRepository,
    D: DownloadRepository,
{
    ctx: Arc<PassContext<W, C, D>>,
    command_rx: UpdateCommandReceiver,
    shutdown: CancellationToken,
    passes: CancellationToken,
}

impl<W, C, D> UpdatesWorker<W, C, D>
where
    W: WorkRepository + Clone + 'static,
    C: ChapterRepository + Clone + 'static,
    D: DownloadRepository + Clone + 'static,
{
    fn spawn_pass(&self, selection: Selection, reply: Option<Reply>) {
        let ctx = self.ctx.clone();
        let cancel = self.passes.child_token();
        tokio::spawn(async move {
            let res = ctx.run_pass(selection, cancel).await;
            match reply {
                Some(reply) => {
                    if reply.send(res).is_err() {
                        debug!("update requester went away");
                    }
                }
                None => {
                    if let Err(e) = res {
                        error!("failed periodic update: {e}");
                    }
                }
            }
        });
    }

    async fn run(mut self) {
        let period = Duration::from_secs(self.ctx.settings.period.max(1));
        let periodic = self.ctx.settings.period > 0;
        let start = if self.ctx.settings.at_startup {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut interval = time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if periodic {
            info!("periodic updates every {} seconds", period.as_secs());
        } else if self.ctx.settings.at_startup {
            self.spawn_pass(Selection::All, None);
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv_async() => {
                    let Ok(cmd) = cmd else {
                        break;
                    };
                    info!("received command: {cmd}");
                    match cmd {
                        Command::All(reply) => self.spawn_pass(Selection::All, Some(reply)),
                        Command::Works(ids, reply) => self.spawn_pass(Selection::Works(ids), Some(reply)),
                        Command::Category(id, reply) => self.spawn_pass(Selection::Category(id), Some(reply)),
                        Command::Cancel => {
                            self.passes.cancel();
                            self.passes = self.shutdown.child_token();
                        }
                    }
                }
                _ = interval.tick(), if periodic => {
                    info!("start periodic updates");
                    self.spawn_pass(Selection::All, None);
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("update worker stopped");
    }
}

/// Public side of the update worker.
#[derive(Clone)]
pub struct UpdateHandle {
    tx: UpdateCommandSender,
}

impl UpdateHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<UpdateReport, UpdateError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_async(make(reply))
            .await
            .map_err(|_| UpdateError::WorkerGone)?;
        rx.await.map_err(|_| UpdateError::WorkerGone)?
    }

    pub async fn update_all(&self) -> Result<UpdateReport, UpdateError> {
        self.request(Command::All).await
    }

    pub async fn update_works(&self, work_ids: Vec<i64>) -> Result<UpdateReport, UpdateError> {
        self.request(|reply| Command::Works(work_ids, reply)).await
    }

    pub async fn update_category(&self, category_id: i64) -> Result<UpdateReport, UpdateError> {
        self.request(|reply| Command::Category(category_id, reply))
            .await
    }

    /// Cancels running passes, works already updated keep their changes.
    pub async fn cancel(&self) -> Result<(), UpdateError> {
        self.tx
            .send_async(Command::Cancel)
            .await
            .map_err(|_| UpdateError::WorkerGone)
    }
}

pub fn start<W, C, D>(
    reconciler: Reconciler<W, C, D>,
    sources: SourceManager,
    pool: WorkerPool,
    bus: EventBus,
    settings: UpdateSettings,
    shutdown: CancellationToken,
) -> (UpdateHandle, JoinHandle<()>)
where
    W: WorkRepository + Clone + 'static,
    C: ChapterRepository + Clone + 'static,
    D: DownloadRepository + Clone + 'static,
{
    let (command_tx, command_rx) = flume::unbounded();
    let worker = UpdatesWorker {
        ctx: Arc::new(PassContext {
            reconciler,
            sources,
            pool,
            bus,
            settings,
            locks: WorkLocks::default(),
        }),
        command_rx,
        passes: shutdown.child_token(),
        shutdown,
    };

    let handle = tokio::spawn(worker.run());

    (UpdateHandle { tx: command_tx }, handle)
}
