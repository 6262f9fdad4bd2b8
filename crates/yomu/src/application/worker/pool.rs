use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;

#[derive(Default)]
struct State {
    running: usize,
    per_source: HashMap<i64, usize>,
}

struct Inner {
    workers: usize,
    per_source: usize,
    state: Mutex<State>,
    released: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Concurrency ceiling shared by downloads and update passes.
///
/// At most `workers` slots are held at once and at most
/// `max(1, ceil(workers * share))` of them for the same source.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

pub fn per_source_limit(workers: usize, share: f64) -> usize {
    let workers = workers.max(1);
    let share = if share.is_finite() { share.clamp(0.0, 1.0) } else { 1.0 };

    ((workers as f64 * share).ceil() as usize).clamp(1, workers)
}

impl WorkerPool {
    pub fn new(workers: usize, per_source_share: f64) -> Self {
        let workers = workers.max(1);
        let per_source = per_source_limit(workers, per_source_share);
        info!("worker pool with {workers} slots, {per_source} per source");

        let (released, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                workers,
                per_source,
                state: Mutex::new(State::default()),
                released,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn per_source(&self) -> usize {
        self.inner.per_source
    }

    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    pub fn has_capacity(&self, source_id: i64) -> bool {
        let state = self.inner.lock();
        state.running < self.inner.workers
            && state.per_source.get(&source_id).copied().unwrap_or(0) < self.inner.per_source
    }

    pub fn try_acquire(&self, source_id: i64) -> Option<Slot> {
        let mut state = self.inner.lock();
        let held = state.per_source.get(&source_id).copied().unwrap_or(0);
        if state.running >= self.inner.workers || held >= self.inner.per_source {
            return None;
        }

        state.running += 1;
        state.per_source.insert(source_id, held + 1);

        Some(Slot {
            inner: self.inner.clone(),
            source_id,
        })
    }

    pub async fn acquire(&self, source_id: i64) -> Slot {
        let mut released = self.inner.released.subscribe();
        loop {
            if let Some(slot) = self.try_acquire(source_id) {
                return slot;
            }
            // the sender lives as long as `self`
            let _ = released.changed().await;
        }
    }

    /// Notified every time a slot is released.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.released.subscribe()
    }
}

pub struct Slot {
    inner: Arc<Inner>,
    source_id: i64,
}

impl Slot {
    pub fn source_id(&self) -> i64 {
        self.source_id
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.running = state.running.saturating_sub(1);
            if let Some(held) = state.per_source.get_mut(&self.source_id) {
                *held = held.saturating_sub(1);
                if *held == 0 {
                    state.per_source.remove(&self.source_id);
                }
            }
        }

        self.inner.released.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }
}
