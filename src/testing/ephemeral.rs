//! An ephemeral, fully in-process engine instance for integration tests: a
//! temp directory, a real `Scheduler`, and a helper to enqueue a job and
//! block on its retirement.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::jobs::scheduler::Scheduler;
use crate::jobs::{HistoryEntry, JobKind};
use crate::manager::{Engine, Manager};
use crate::testing::mock::MockArchive;

/// Owns the temp directory, the engine, and a running scheduler. The
/// scheduler is stopped in [`Harness::shutdown`]; forgetting to call it just
/// leaves the worker tasks running until the runtime itself shuts down.
pub struct Harness {
    pub manager: Manager,
    scheduler: Option<Scheduler>,
    _dir: TempDir,
}

impl Harness {
    /// Stand up a fresh engine backed by a [`MockArchive`], with one
    /// sequential and one async worker.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let ctx = Context::new(dir.path());
        let engine = Engine::open(ctx, Arc::new(MockArchive::default())).expect("open engine");
        let scheduler = Scheduler::start(engine.clone(), 1);
        Self {
            manager: Manager::new(engine),
            scheduler: Some(scheduler),
            _dir: dir,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.manager.engine
    }

    /// Enqueue `kind`/`params` and block until a matching record leaves its
    /// live queue, returning the history entry it produced. Matches by
    /// kind and params rather than by key, since the queue listing doesn't
    /// expose keys; tests should avoid enqueueing indistinguishable
    /// duplicates of the same job concurrently.
    pub async fn run_to_completion(
        &self,
        kind: JobKind,
        params: Vec<String>,
        timeout: Duration,
    ) -> Result<HistoryEntry> {
        let jobs = self.manager.engine.jobs.clone();
        let queue = kind.queue();
        let description = format!("{}({})", kind.as_str(), params.join(", "));
        jobs.enqueue(kind, params.clone())?;

        let deadline = Instant::now() + timeout;
        loop {
            let still_pending = jobs
                .list_queue(queue)?
                .into_iter()
                .any(|r| r.kind == kind && r.params == params);
            if !still_pending {
                for failed in [false, true] {
                    if let Some(entry) = jobs
                        .list_history(failed)?
                        .into_iter()
                        .rev()
                        .find(|entry| entry.description == description)
                    {
                        return Ok(entry);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Corrupt(format!(
                    "job {description} did not retire within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop the scheduler's workers, waiting for any in-flight handler to
    /// finish. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.close().await;
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
