#[macro_use]
extern crate log;

use std::{collections::HashSet, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use yomu::{
    application::{
        self, Pipeline,
        events::{DownloadOutcome, Event, EventReceiver},
    },
    domain::entities::chapter::DownloadStatus,
    infrastructure::{
        config::{Config, LocalFolders},
        database,
        local::{LOCAL_SOURCE_ID, LocalProvider},
    },
};
use yomu_source::{fetch::Fetcher, manager::SourceManager};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[clap(version, about = "Keeps a manga library in sync with its sources")]
struct Opts {
    /// Path to config file
    #[clap(long)]
    config: Option<String>,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update scheduler and download queue until interrupted
    Run,
    /// Check works for new chapters once
    Update {
        /// Only these works
        #[clap(long = "work")]
        works: Vec<i64>,
        /// Only works in this category
        #[clap(long, conflicts_with = "works")]
        category: Option<i64>,
    },
    /// Download chapters and wait for them to finish
    Download { chapter_ids: Vec<i64> },
    /// Add a work from a source to the library
    Add {
        source_id: i64,
        path: String,
        #[clap(long)]
        category: Vec<i64>,
    },
    /// List registered sources
    Sources,
    /// Pause all downloads, also across restarts
    Pause,
    /// Resume paused downloads
    Resume,
    /// Check the files of a downloaded chapter
    Verify { chapter_id: i64 },
}

fn register_sources(config: &Config) -> Result<SourceManager, anyhow::Error> {
    let mut sources = SourceManager::new(Fetcher::new(config.retry_policy()));

    match &config.local_path {
        LocalFolders::Single(local_path) => {
            sources.register(Arc::new(LocalProvider::new(
                LOCAL_SOURCE_ID,
                "Local".to_string(),
                local_path,
            )))?;
        }
        LocalFolders::Multiple(local_paths) => {
            for (index, local_path) in local_paths.iter().enumerate() {
                sources.register(Arc::new(LocalProvider::new(
                    LOCAL_SOURCE_ID + index as i64,
                    local_path.name.clone(),
                    &local_path.path,
                )))?;
            }
        }
    }

    Ok(sources)
}

async fn log_events(mut events: EventReceiver, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.cancelled() => break,
        };

        match event {
            Ok(Event::WorkUpdated {
                work_id,
                added,
                changed,
                removed,
                ..
            }) => info!("work {work_id}: {added} new, {changed} changed, {removed} removed"),
            Ok(Event::WorkUpdateFailed { work_id, reason }) => {
                warn!("work {work_id} failed to update: {reason}")
            }
            Ok(Event::DownloadFinished {
                chapter_id,
                outcome,
            }) => info!("chapter {chapter_id}: {outcome:?}"),
            Ok(Event::LibraryUpdateFinished(report)) => info!(
                "library update: {} checked, {} updated, {} new chapters, {} failed",
                report.checked,
                report.updated.len(),
                report.new_chapters,
                report.failed.len()
            ),
            Ok(event) => debug!("{event:?}"),
            Err(RecvError::Lagged(n)) => warn!("missed {n} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run(mut pipeline: Pipeline) -> Result<(), anyhow::Error> {
    let shutdown = CancellationToken::new();
    let logger = tokio::spawn(log_events(pipeline.subscribe(), shutdown.clone()));

    tokio::select! {
        _ = pipeline.stopped() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl+c signal");
        }
    }

    shutdown.cancel();
    let _ = logger.await;
    pipeline.shutdown(SHUTDOWN_GRACE).await;

    Ok(())
}

async fn download(pipeline: &Pipeline, chapter_ids: Vec<i64>) -> Result<(), anyhow::Error> {
    let mut events = pipeline.subscribe();
    let mut pending = HashSet::new();

    for (chapter_id, res) in pipeline.downloads().enqueue_many(&chapter_ids).await {
        match res {
            Ok(outcome) => {
                info!("chapter {chapter_id}: {outcome:?}");
                pending.insert(chapter_id);
            }
            Err(e) => error!("chapter {chapter_id}: {e}"),
        }
    }
    for job in pipeline.downloads().jobs().await? {
        if !pending.contains(&job.chapter_id) {
            continue;
        }
        info!(
            "chapter {} is {:?} ({}/{})",
            job.chapter_id, job.status, job.completed, job.total
        );
    }

    // chapters already on disk never produce an event
    for chapter_id in pending.clone() {
        let chapter = pipeline.reconciler().get_chapter(chapter_id).await?;
        if chapter.download_status == DownloadStatus::Downloaded {
            pending.remove(&chapter_id);
        }
    }

    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl+c signal");
                break;
            }
        };

        match event {
            Ok(Event::DownloadProgress {
                chapter_id,
                completed,
                total,
            }) if pending.contains(&chapter_id) => {
                debug!("chapter {chapter_id}: {completed}/{total}")
            }
            Ok(Event::DownloadFinished {
                chapter_id,
                outcome,
            }) if pending.remove(&chapter_id) => match outcome {
                DownloadOutcome::Downloaded => info!("chapter {chapter_id} downloaded"),
                DownloadOutcome::Failed(detail) => error!("chapter {chapter_id}: {detail}"),
                DownloadOutcome::Canceled => warn!("chapter {chapter_id} canceled"),
            },
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("missed {n} events"),
            Err(RecvError::Closed) => break,
        }
    }

    Ok(())
}

async fn add(
    pipeline: &Pipeline,
    source_id: i64,
    path: String,
    category_ids: &[i64],
) -> Result<(), anyhow::Error> {
    let detail = pipeline
        .sources()
        .get_work_detail(source_id, path, &CancellationToken::new())
        .await?
        .value;

    let work = pipeline.reconciler().add_work(detail, category_ids).await?;
    info!("added {} ({})", work.title, work.id);

    let report = pipeline.updates().update_works(vec![work.id]).await?;
    info!("{} chapters", report.new_chapters);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        info!("rust_log: {rust_log}");
    } else if let Ok(yomu_log) = std::env::var("YOMU_LOG") {
        info!("yomu_log: {yomu_log}");
        // SAFETY: no other thread reads the environment before the logger is set up
        unsafe {
            std::env::set_var(
                "RUST_LOG",
                format!("yomu={yomu_log},yomu_source={yomu_log}"),
            );
        }
    }

    env_logger::init();

    let opts: Opts = Opts::parse();
    let config = Config::open(opts.config)?;

    debug!("config: {config:?}");

    let pool = database::open_library(&config.database_path, config.create_database).await?;
    let sources = register_sources(&config)?;

    let command = opts.command.unwrap_or(Command::Run);
    if let Command::Sources = command {
        for source in sources.list() {
            println!(
                "{}\t{}\t{}\t{}",
                source.id, source.name, source.version, source.url
            );
        }
        return Ok(());
    }

    let pipeline = application::start(&config, pool.clone(), sources);

    if let Command::Run = command {
        let res = run(pipeline).await;
        info!("closing database...");
        pool.close().await;
        return res;
    }

    let res = match command {
        Command::Update { works, category } => {
            let report = match (works.is_empty(), category) {
                (_, Some(category_id)) => pipeline.updates().update_category(category_id).await,
                (true, None) => pipeline.updates().update_all().await,
                (false, None) => pipeline.updates().update_works(works).await,
            };
            report.map(|report| {
                println!(
                    "checked {}, updated {}, new chapters {}",
                    report.checked,
                    report.updated.len(),
                    report.new_chapters
                );
                for (work_id, reason) in report.failed {
                    println!("work {work_id} failed: {reason}");
                }
            })
            .map_err(anyhow::Error::from)
        }
        Command::Download { chapter_ids } => download(&pipeline, chapter_ids).await,
        Command::Add {
            source_id,
            path,
            category,
        } => add(&pipeline, source_id, path, &category).await,
        Command::Pause => pipeline
            .downloads()
            .pause_all()
            .await
            .map_err(anyhow::Error::from),
        Command::Resume => pipeline
            .downloads()
            .resume_all()
            .await
            .map_err(anyhow::Error::from),
        Command::Verify { chapter_id } => pipeline
            .downloads()
            .verify_download(chapter_id)
            .await
            .map(|ok| println!("chapter {chapter_id}: {}", if ok { "ok" } else { "damaged" }))
            .map_err(anyhow::Error::from),
        Command::Run | Command::Sources => Ok(()),
    };

    pipeline.shutdown(SHUTDOWN_GRACE).await;
    info!("closing database...");
    pool.close().await;

    res
}
