//! The job store: two persisted queues (sequential, async) plus a
//! completed/failed history, with claim/retire semantics and startup
//! recovery.

pub mod handlers;
pub mod scheduler;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::storage::{Connection, Handle};

pub const SEQUENTIAL_BUCKET: &str = "jobs.queue.sequential";
pub const ASYNC_BUCKET: &str = "jobs.queue.async";
pub const SUCCESS_BUCKET: &str = "jobs.history.success";
pub const FAILURE_BUCKET: &str = "jobs.history.failure";

/// The closed set of job kinds the scheduler knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    BulkAdd,
    CreateRepo,
    DeleteRepo,
    Delta,
    DeltaRepo,
    IndexRepo,
    IncludeDelta,
    TransitProcess,
    CloneRepo,
    PullRepo,
    CopySource,
    RemoveSource,
    TrimPackages,
    TrimObsolete,
}

impl JobKind {
    /// Which queue a job of this kind enters. A property of the kind, not
    /// of its arguments.
    pub fn queue(self) -> Queue {
        match self {
            JobKind::Delta => Queue::Async,
            _ => Queue::Sequential,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::BulkAdd => "BulkAdd",
            JobKind::CreateRepo => "CreateRepo",
            JobKind::DeleteRepo => "DeleteRepo",
            JobKind::Delta => "Delta",
            JobKind::DeltaRepo => "DeltaRepo",
            JobKind::IndexRepo => "IndexRepo",
            JobKind::IncludeDelta => "IncludeDelta",
            JobKind::TransitProcess => "TransitProcess",
            JobKind::CloneRepo => "CloneRepo",
            JobKind::PullRepo => "PullRepo",
            JobKind::CopySource => "CopySource",
            JobKind::RemoveSource => "RemoveSource",
            JobKind::TrimPackages => "TrimPackages",
            JobKind::TrimObsolete => "TrimObsolete",
        }
    }
}

/// Which of the two queues a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Sequential,
    Async,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    pub queued: Option<OffsetDateTime>,
    pub begin: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

/// A persisted job: its kind, arguments (as plain strings; handlers parse
/// them), claim state, and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub kind: JobKind,
    pub claimed: bool,
    pub params: Vec<String>,
    pub timing: Timing,
}

/// One retired job's outcome, appended to a history bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub description: String,
    pub timing: Timing,
    pub failed: bool,
    pub error: Option<String>,
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn describe(record: &JobRecord) -> String {
    format!("{}({})", record.kind.as_str(), record.params.join(", "))
}

/// The job store: owns the four buckets and the connection used to run
/// claim/retire as write transactions.
#[derive(Clone)]
pub struct JobStore {
    conn: Connection,
    sequential: Handle,
    async_queue: Handle,
    success: Handle,
    failure: Handle,
}

impl JobStore {
    pub fn open(conn: &Connection) -> Result<Self> {
        Ok(Self {
            conn: conn.clone(),
            sequential: conn.bucket(SEQUENTIAL_BUCKET)?,
            async_queue: conn.bucket(ASYNC_BUCKET)?,
            success: conn.bucket(SUCCESS_BUCKET)?,
            failure: conn.bucket(FAILURE_BUCKET)?,
        })
    }

    fn queue_handle(&self, queue: Queue) -> &Handle {
        match queue {
            Queue::Sequential => &self.sequential,
            Queue::Async => &self.async_queue,
        }
    }

    /// Append a new job to the queue its kind belongs to. Returns the job's
    /// key (a big-endian encoded sequence number; byte order equals
    /// insertion order).
    pub fn enqueue(&self, kind: JobKind, params: Vec<String>) -> Result<Vec<u8>> {
        let bucket = self.queue_handle(kind.queue());
        let id = bucket.next_sequence()?;
        let key = id.to_be_bytes().to_vec();
        let record = JobRecord {
            kind,
            claimed: false,
            params,
            timing: Timing {
                queued: Some(now()),
                begin: None,
                end: None,
            },
        };
        bucket.put_object(&key, &record)?;
        Ok(key)
    }

    /// Claim the first unclaimed job in `queue`, in key order. Marks it
    /// claimed and stamps `timing.begin` inside one write transaction.
    pub fn claim(&self, queue: Queue) -> Result<(Vec<u8>, JobRecord)> {
        let bucket = self.queue_handle(queue).clone();
        self.conn.update(&[&bucket], |h| {
            let tx = &h[0];
            let mut found: Option<Vec<u8>> = None;
            tx.for_each(|key, raw| {
                let record: JobRecord = crate::codec::decode(raw)?;
                if !record.claimed {
                    found = Some(key.to_vec());
                    return crate::storage::break_loop();
                }
                Ok(())
            })?;

            let Some(key) = found else {
                return Err(Error::EmptyQueue);
            };
            let mut record: JobRecord = tx.get_object(&key)?;
            record.claimed = true;
            record.timing.begin = Some(now());
            tx.put_object(&key, &record)?;
            Ok((key, record))
        })
    }

    /// Delete `key` from `queue` and append a history entry.
    pub fn retire(
        &self,
        queue: Queue,
        key: &[u8],
        mut record: JobRecord,
        failed: bool,
        error: Option<String>,
    ) -> Result<()> {
        record.timing.end = Some(now());
        let queue_bucket = self.queue_handle(queue).clone();
        let history_bucket = if failed { self.failure.clone() } else { self.success.clone() };

        self.conn.update(&[&queue_bucket, &history_bucket], |h| {
            h[0].delete_object(key)?;
            let entry = HistoryEntry {
                description: describe(&record),
                timing: record.timing.clone(),
                failed,
                error: error.clone(),
            };
            let seq = h[1].next_sequence()?;
            h[1].put_object(&seq.to_be_bytes(), &entry)
        })
    }

    /// Clear `claimed` and reset `timing.begin`/`end` for every record in
    /// both live queues. Run once at startup.
    pub fn recover(&self) -> Result<()> {
        for queue in [Queue::Sequential, Queue::Async] {
            let bucket = self.queue_handle(queue).clone();
            self.conn.update(&[&bucket], |h| {
                let tx = &h[0];
                let mut keys = Vec::new();
                tx.for_each(|key, _| {
                    keys.push(key.to_vec());
                    Ok(())
                })?;
                for key in keys {
                    let mut record: JobRecord = tx.get_object(&key)?;
                    record.claimed = false;
                    record.timing.begin = None;
                    record.timing.end = None;
                    tx.put_object(&key, &record)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn list_queue(&self, queue: Queue) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        self.queue_handle(queue).for_each(|_, raw| {
            records.push(crate::codec::decode(raw)?);
            Ok(())
        })?;
        Ok(records)
    }

    pub fn list_history(&self, failed: bool) -> Result<Vec<HistoryEntry>> {
        let bucket = if failed { &self.failure } else { &self.success };
        let mut entries = Vec::new();
        bucket.for_each(|_, raw| {
            entries.push(crate::codec::decode(raw)?);
            Ok(())
        })?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("jobs.db")).unwrap();
        let store = JobStore::open(&db.connection()).unwrap();
        (dir, store)
    }

    #[test]
    fn delta_is_the_only_async_kind() {
        assert_eq!(JobKind::Delta.queue(), Queue::Async);
        for kind in [
            JobKind::BulkAdd,
            JobKind::CreateRepo,
            JobKind::DeleteRepo,
            JobKind::DeltaRepo,
            JobKind::IndexRepo,
            JobKind::IncludeDelta,
            JobKind::TransitProcess,
            JobKind::CloneRepo,
            JobKind::PullRepo,
            JobKind::CopySource,
            JobKind::RemoveSource,
            JobKind::TrimPackages,
            JobKind::TrimObsolete,
        ] {
            assert_eq!(kind.queue(), Queue::Sequential);
        }
    }

    #[test]
    fn claim_returns_empty_queue_when_nothing_pending() {
        let (_dir, store) = store();
        let err = store.claim(Queue::Sequential).unwrap_err();
        assert!(matches!(err, Error::EmptyQueue));
    }

    #[test]
    fn enqueue_claim_retire_round_trip() {
        let (_dir, store) = store();
        let key = store
            .enqueue(JobKind::CreateRepo, vec!["unstable".into()])
            .unwrap();

        let (claimed_key, record) = store.claim(Queue::Sequential).unwrap();
        assert_eq!(claimed_key, key);
        assert!(record.claimed);

        store.retire(Queue::Sequential, &claimed_key, record, false, None).unwrap();

        assert!(store.list_queue(Queue::Sequential).unwrap().is_empty());
        assert_eq!(store.list_history(false).unwrap().len(), 1);
    }

    #[test]
    fn claim_is_fifo_by_insertion_order() {
        let (_dir, store) = store();
        store.enqueue(JobKind::CreateRepo, vec!["a".into()]).unwrap();
        store.enqueue(JobKind::CreateRepo, vec!["b".into()]).unwrap();

        let (_, first) = store.claim(Queue::Sequential).unwrap();
        assert_eq!(first.params, vec!["a".to_string()]);
    }

    #[test]
    fn recover_clears_claimed_flags() {
        let (_dir, store) = store();
        store.enqueue(JobKind::CreateRepo, vec!["a".into()]).unwrap();
        let (key, record) = store.claim(Queue::Sequential).unwrap();
        assert!(record.claimed);

        store.recover().unwrap();

        let records = store.list_queue(Queue::Sequential).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].claimed);
        assert!(records[0].timing.begin.is_none());

        // the job is still claimable after recovery
        let (reclaimed_key, _) = store.claim(Queue::Sequential).unwrap();
        assert_eq!(reclaimed_key, key);
    }

    #[test]
    fn failed_retire_goes_to_failure_history() {
        let (_dir, store) = store();
        store.enqueue(JobKind::CreateRepo, vec!["a".into()]).unwrap();
        let (key, record) = store.claim(Queue::Sequential).unwrap();
        store
            .retire(Queue::Sequential, &key, record, true, Some("boom".into()))
            .unwrap();

        assert_eq!(store.list_history(true).unwrap().len(), 1);
        assert_eq!(store.list_history(false).unwrap().len(), 0);
    }
}
