//! Thin wrapper over `sled`, an ordered embedded KV store.
//!
//! `Database` owns the `sled::Db`. `Connection` is a cheap, reference-counted
//! handle to it (cloning a `sled::Db` is an `Arc` bump). `Handle` wraps a
//! single `sled::Tree` (a "bucket") and is where typed get/put/delete and
//! iteration live.
//!
//! `sled` gives per-tree-set transactions; the engine additionally needs
//! cross-subsystem atomicity (Pool + Repository mutations in one scope), so
//! every write transaction also takes the connection-wide [`Connection::write_lock`]
//! for its duration. That mutex is what makes "only one write transaction
//! exists at a time process-wide" true in practice, not just in the common
//! case.

use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::transaction::{
    ConflictableTransactionError, Transactional, TransactionError, TransactionalTree,
};

use crate::codec;
use crate::error::{Error, Result};

/// Sentinel used by [`Handle::for_each`] to stop iteration early without
/// turning the stop into a propagated error.
pub const ERR_BREAK_LOOP: &str = "__break_loop__";

/// An opened embedded KV store.
#[derive(Clone)]
pub struct Database {
    db: sled::Db,
    write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Obtain a reference-counted connection. Connections are cheap to clone
    /// and share the same underlying store and write lock.
    pub fn connection(&self) -> Connection {
        Connection {
            db: self.db.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

/// A reference-counted connection to a [`Database`].
#[derive(Clone)]
pub struct Connection {
    db: sled::Db,
    write_lock: Arc<Mutex<()>>,
}

impl Connection {
    /// Open (or reopen) a named bucket. Idempotent: opening the same name
    /// twice returns handles to the same underlying tree.
    pub fn bucket(&self, name: &str) -> Result<Handle> {
        let tree = self.db.open_tree(name.as_bytes())?;
        Ok(Handle { tree })
    }

    /// Run `f` with a write transaction across the given buckets. Returning
    /// an `Err` from `f` aborts the transaction: every mutation made through
    /// the transactional handles inside `f` is rolled back.
    ///
    /// Nested `update` calls are not supported and will deadlock; callers
    /// must never hold two write transactions concurrently on the same
    /// connection.
    pub fn update<F, T>(&self, buckets: &[&Handle], f: F) -> Result<T>
    where
        F: Fn(&[TxHandle]) -> Result<T>,
    {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let trees: Vec<sled::Tree> = buckets.iter().map(|h| h.tree.clone()).collect();

        let result = Transactional::transaction(trees.as_slice(), |tx_trees: &[TransactionalTree]| {
            let handles: Vec<TxHandle> = tx_trees.iter().map(TxHandle::new).collect();
            f(&handles).map_err(ConflictableTransactionError::Abort)
        });

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(Error::Storage(err)),
        }
    }
}

/// A read/write (outside a transaction: read+write directly; inside one:
/// only reachable through [`Connection::update`]) handle onto one bucket.
#[derive(Clone)]
pub struct Handle {
    tree: sled::Tree,
}

impl Handle {
    pub fn get_object<T: DeserializeOwned>(&self, key: &[u8]) -> Result<T> {
        match self.tree.get(key)? {
            Some(raw) => codec::decode(&raw),
            None => Err(Error::NotFound(format!(
                "key {} not found in bucket {:?}",
                hex::encode(key),
                self.tree.name()
            ))),
        }
    }

    pub fn has_object(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    pub fn put_object<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = codec::encode(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn delete_object(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    /// Iterate the bucket in key order. Returning `Err(Error::EmptyQueue)`-style
    /// sentinels is not how iteration stops; instead return
    /// `Err(Error::Corrupt(ERR_BREAK_LOOP.to_string()))` (or use
    /// [`break_loop`]) to stop early without propagating an error.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for item in self.tree.iter() {
            let (key, value) = item?;
            match f(&key, &value) {
                Ok(()) => {}
                Err(Error::Corrupt(ref msg)) if msg == ERR_BREAK_LOOP => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// A monotonic unsigned counter scoped to this bucket.
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.tree.generate_id()?)
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Stops [`Handle::for_each`] without surfacing an error to the caller.
pub fn break_loop<T>() -> Result<T> {
    Err(Error::Corrupt(ERR_BREAK_LOOP.to_string()))
}

/// A handle onto one bucket, valid only inside a [`Connection::update`] scope.
pub struct TxHandle<'a> {
    tree: &'a TransactionalTree,
}

impl<'a> TxHandle<'a> {
    fn new(tree: &'a TransactionalTree) -> Self {
        Self { tree }
    }

    pub fn get_object<T: DeserializeOwned>(&self, key: &[u8]) -> Result<T> {
        match self
            .tree
            .get(key)
            .map_err(|err| Error::Storage(sled::Error::from(err)))?
        {
            Some(raw) => codec::decode(&raw),
            None => Err(Error::NotFound(format!("key {} not found", hex::encode(key)))),
        }
    }

    pub fn has_object(&self, key: &[u8]) -> Result<bool> {
        Ok(self
            .tree
            .get(key)
            .map_err(|err| Error::Storage(sled::Error::from(err)))?
            .is_some())
    }

    pub fn put_object<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = codec::encode(value)?;
        self.tree
            .insert(key, bytes)
            .map_err(|err| Error::Storage(sled::Error::from(err)))?;
        Ok(())
    }

    pub fn delete_object(&self, key: &[u8]) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|err| Error::Storage(sled::Error::from(err)))?;
        Ok(())
    }

    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for item in self.tree.iter() {
            let (key, value) = item.map_err(|err| Error::Storage(sled::Error::from(err)))?;
            match f(&key, &value) {
                Ok(()) => {}
                Err(Error::Corrupt(ref msg)) if msg == ERR_BREAK_LOOP => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn next_sequence(&self) -> Result<u64> {
        self.tree
            .generate_id()
            .map_err(|err| Error::Storage(sled::Error::from(err)))
    }
}

impl Deref for Handle {
    type Target = sled::Tree;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}
