//! The manager façade: a single entry point mapping high-level operations
//! onto either a direct read or exactly one enqueued job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::archive::Archive;
use crate::context::Context;
use crate::error::Result;
use crate::index::IndexPublisher;
use crate::jobs::{HistoryEntry, JobKind, JobRecord, JobStore, Queue};
use crate::pool::Pool;
use crate::repository::RepositorySet;
use crate::storage::{Connection, Database};

/// Everything a job handler or a `Manager` method needs: storage
/// connections, the pool and repository catalogues, the index publisher,
/// the job store, and the external archive collaborator.
pub struct Engine {
    pub ctx: Context,
    pub conn: Connection,
    pub pool: Pool,
    pub repos: RepositorySet,
    pub index: IndexPublisher,
    pub archive: Arc<dyn Archive>,
    pub jobs: JobStore,
    pub start_time: OffsetDateTime,
}

impl Engine {
    /// Open the engine's two KV stores (`main` and `jobs`) rooted at `ctx`,
    /// create the top-level directory tree, and run queue recovery.
    pub fn open(ctx: Context, archive: Arc<dyn Archive>) -> Result<Arc<Self>> {
        ctx.ensure_dirs()?;

        let main_db = Database::open(ctx.main_db_path())?;
        let conn = main_db.connection();
        let jobs_db = Database::open(ctx.jobs_db_path())?;
        let jobs = JobStore::open(&jobs_db.connection())?;
        jobs.recover()?;

        let pool = Pool::open(&conn, ctx.pool_dir())?;
        let repos = RepositorySet::open(&conn)?;

        Ok(Arc::new(Self {
            ctx,
            conn,
            pool,
            repos,
            index: IndexPublisher::new(),
            archive,
            jobs,
            start_time: OffsetDateTime::now_utc(),
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolItem {
    pub id: String,
    #[serde(rename = "refCount")]
    pub ref_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: i64,
    pub version: &'static str,
    pub active: Vec<JobRecord>,
    pub completed: Vec<HistoryEntry>,
    pub failed: Vec<HistoryEntry>,
}

/// The single entry point used by both the HTTP façade and the CLI. Every
/// method either reads directly or validates arguments and enqueues exactly
/// one job, returning its queue key without waiting for it to run.
#[derive(Clone)]
pub struct Manager {
    pub engine: Arc<Engine>,
}

impl Manager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn list_repos(&self) -> Result<Vec<String>> {
        self.engine.repos.list_ids()
    }

    pub fn list_pool(&self) -> Result<Vec<PoolItem>> {
        Ok(self
            .engine
            .pool
            .get_pool_items()?
            .into_iter()
            .map(|entry| PoolItem {
                id: entry.name,
                ref_count: entry.ref_count,
            })
            .collect())
    }

    pub fn status(&self) -> Result<Status> {
        let uptime_seconds = (OffsetDateTime::now_utc() - self.engine.start_time)
            .whole_seconds()
            .max(0);
        let mut active = self.engine.jobs.list_queue(Queue::Sequential)?;
        active.extend(self.engine.jobs.list_queue(Queue::Async)?);
        Ok(Status {
            uptime_seconds,
            version: env!("CARGO_PKG_VERSION"),
            active,
            completed: self.engine.jobs.list_history(false)?,
            failed: self.engine.jobs.list_history(true)?,
        })
    }

    pub fn create_repo(&self, id: &str) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(JobKind::CreateRepo, vec![id.to_string()])
    }

    pub fn delete_repo(&self, id: &str) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(JobKind::DeleteRepo, vec![id.to_string()])
    }

    pub fn delta_repo(&self, id: &str) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(JobKind::DeltaRepo, vec![id.to_string()])
    }

    pub fn index_repo(&self, id: &str) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(JobKind::IndexRepo, vec![id.to_string()])
    }

    pub fn bulk_add(&self, repo_id: &str, paths: Vec<String>) -> Result<Vec<u8>> {
        let mut params = vec![repo_id.to_string()];
        params.extend(paths);
        self.engine.jobs.enqueue(JobKind::BulkAdd, params)
    }

    pub fn clone_repo(&self, repo_id: &str, clone_name: &str, copy_all: bool) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(
            JobKind::CloneRepo,
            vec![repo_id.to_string(), clone_name.to_string(), copy_all.to_string()],
        )
    }

    pub fn pull_repo(&self, repo_id: &str, source_id: &str) -> Result<Vec<u8>> {
        self.engine
            .jobs
            .enqueue(JobKind::PullRepo, vec![repo_id.to_string(), source_id.to_string()])
    }

    pub fn copy_source(&self, repo_id: &str, target: &str, source: &str, release: u32) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(
            JobKind::CopySource,
            vec![
                repo_id.to_string(),
                target.to_string(),
                source.to_string(),
                release.to_string(),
            ],
        )
    }

    pub fn remove_source(&self, repo_id: &str, source: &str, release: u32) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(
            JobKind::RemoveSource,
            vec![repo_id.to_string(), source.to_string(), release.to_string()],
        )
    }

    pub fn trim_packages(&self, repo_id: &str, max_packages: usize) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(
            JobKind::TrimPackages,
            vec![repo_id.to_string(), max_packages.to_string()],
        )
    }

    pub fn trim_obsolete(&self, repo_id: &str) -> Result<Vec<u8>> {
        self.engine.jobs.enqueue(JobKind::TrimObsolete, vec![repo_id.to_string()])
    }

    pub fn transit_process(&self, manifest_path: &str) -> Result<Vec<u8>> {
        self.engine
            .jobs
            .enqueue(JobKind::TransitProcess, vec![manifest_path.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock::MockArchive;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, Manager) {
        let dir = tempdir().unwrap();
        let engine = Engine::open(Context::new(dir.path()), Arc::new(MockArchive::default())).unwrap();
        (dir, Manager::new(engine))
    }

    #[test]
    fn create_repo_enqueues_exactly_one_job() {
        let (_dir, manager) = manager();
        manager.create_repo("unstable").unwrap();
        let active = manager.engine.jobs.list_queue(Queue::Sequential).unwrap();
        assert_eq!(active.len(), 1);
        assert!(matches!(active[0].kind, JobKind::CreateRepo));
    }

    #[test]
    fn status_reports_zero_jobs_initially() {
        let (_dir, manager) = manager();
        let status = manager.status().unwrap();
        assert!(status.active.is_empty());
        assert!(status.completed.is_empty());
        assert!(status.failed.is_empty());
    }
}
