use tokio::sync::broadcast;

use crate::{application::worker::updates::UpdateReport, domain::entities::download::JobOrigin};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Downloaded,
    Failed(String),
    Canceled,
}

#[derive(Debug, Clone)]
pub enum Event {
    WorkUpdated {
        work_id: i64,
        added: usize,
        changed: usize,
        removed: usize,
        metadata_changed: bool,
    },
    WorkUpdateFailed {
        work_id: i64,
        reason: String,
    },
    ChapterAdded {
        work_id: i64,
        chapter_id: i64,
    },
    DownloadQueued {
        chapter_id: i64,
        origin: JobOrigin,
    },
    DownloadStarted {
        chapter_id: i64,
    },
    DownloadProgress {
        chapter_id: i64,
        completed: usize,
        total: usize,
    },
    DownloadPaused {
        chapter_id: i64,
        completed: usize,
        total: usize,
    },
    DownloadInterrupted {
        chapter_id: i64,
    },
    DownloadFinished {
        chapter_id: i64,
        outcome: DownloadOutcome,
    },
    LibraryUpdateFinished(UpdateReport),
}

pub type EventReceiver = broadcast::Receiver<Event>;

/// Fan-out of pipeline events to the presentation layer and the workers.
///
/// Slow subscribers lag and lose the oldest events, publishing never blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        trace!("event: {event:?}");
        // no subscriber is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::ChapterAdded {
            work_id: 1,
            chapter_id: 2,
        });

        for rx in [&mut a, &mut b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                Event::ChapterAdded {
                    work_id: 1,
                    chapter_id: 2
                }
            ));
        }
    }

    #[test]
    fn test_publish_without_subscriber() {
        EventBus::default().publish(Event::DownloadStarted { chapter_id: 1 });
    }
}
