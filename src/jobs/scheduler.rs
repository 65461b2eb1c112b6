//! The worker pool: one sequential worker and N async workers, each polling
//! its queue with a shared backoff sequence and claim/retire protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::handlers;
use super::{JobRecord, Queue};
use crate::error::Error;
use crate::manager::Engine;

const BACKOFF: [Duration; 11] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(20),
    Duration::from_secs(30),
    Duration::from_secs(40),
    Duration::from_secs(50),
    Duration::from_secs(60),
];

const SEQUENTIAL_BACKOFF_CAP: usize = 3;
const ASYNC_BACKOFF_CAP: usize = BACKOFF.len() - 1;

/// Owns every worker task. Dropping a `Scheduler` without calling
/// [`Scheduler::close`] leaves the workers running detached; always close
/// it during shutdown.
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn one sequential worker and `async_workers` async workers against
    /// `engine`.
    pub fn start(engine: Arc<Engine>, async_workers: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let mut handles = vec![spawn_worker(
            engine.clone(),
            Queue::Sequential,
            SEQUENTIAL_BACKOFF_CAP,
            shutdown.clone(),
            notify.clone(),
        )];

        for _ in 0..async_workers.max(1) {
            handles.push(spawn_worker(
                engine.clone(),
                Queue::Async,
                ASYNC_BACKOFF_CAP,
                shutdown.clone(),
                notify.clone(),
            ));
        }

        Self {
            shutdown,
            notify,
            handles,
        }
    }

    /// Signal every worker to stop and wait for in-flight handlers to
    /// finish. A worker between ticks exits immediately; a worker inside a
    /// handler completes it first. There is no forced cancellation.
    pub async fn close(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// On a successful claim the tick resets to zero; on an empty queue it
/// advances by one, capped at `backoff_cap`.
fn next_tick(tick: usize, backoff_cap: usize, claimed: bool) -> usize {
    if claimed { 0 } else { (tick + 1).min(backoff_cap) }
}

fn spawn_worker(
    engine: Arc<Engine>,
    queue: Queue,
    backoff_cap: usize,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = 0usize;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }

            let claim_engine = engine.clone();
            let claimed = tokio::task::spawn_blocking(move || claim_engine.jobs.claim(queue))
                .await
                .expect("job claim task panicked");

            match claimed {
                Ok((key, record)) => {
                    tick = next_tick(tick, backoff_cap, true);
                    let dispatch_engine = engine.clone();
                    let dispatch_record = record.clone();
                    let result = tokio::task::spawn_blocking(move || handlers::dispatch(&dispatch_engine, &dispatch_record))
                        .await
                        .expect("job handler task panicked");

                    let (failed, error) = match result {
                        Ok(()) => (false, None),
                        Err(err) => {
                            tracing::error!(kind = record.kind.as_str(), %err, "job handler failed");
                            (true, Some(err.to_string()))
                        }
                    };
                    if let Err(err) = engine.jobs.retire(queue, &key, record, failed, error) {
                        tracing::error!(%err, "failed to retire job");
                    }
                }
                Err(Error::EmptyQueue) => {
                    let delay = BACKOFF[tick.min(backoff_cap)];
                    tick = next_tick(tick, backoff_cap, false);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = notify.notified() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "job claim failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}
