//! The pool: the single physical copy of every package file the engine
//! knows about, reference-counted across every repository and delta that
//! holds it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive::{DeltaMapping, OpenedPackage, PackageMeta};
use crate::context::path_component;
use crate::error::Result;
use crate::fsutil;
use crate::storage::{Connection, Handle, TxHandle};

pub const ENTRIES_BUCKET: &str = "pool.entries";
pub const SKIP_BUCKET: &str = "pool.skip";

const SCHEMA_VERSION: &str = "1";

/// One record per distinct package file known to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub schema_version: String,
    pub name: String,
    pub ref_count: u64,
    pub meta: PackageMeta,
    pub delta: Option<DeltaMapping>,
}

/// One record per delta that failed to build; presence is a permanent
/// "do not retry" marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSkipEntry {
    pub schema_version: String,
    pub name: String,
    pub delta: DeltaMapping,
}

/// Read-only + directory-path view over the pool, usable outside a
/// transaction. Mutating operations are free functions that take an
/// explicit [`TxHandle`] so they can be composed into a larger, possibly
/// cross-subsystem, write transaction by the caller (see `manager`).
pub struct Pool {
    pub entries: Handle,
    pub skip: Handle,
    pool_dir: PathBuf,
}

impl Pool {
    pub fn open(conn: &Connection, pool_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            entries: conn.bucket(ENTRIES_BUCKET)?,
            skip: conn.bucket(SKIP_BUCKET)?,
            pool_dir,
        })
    }

    pub fn get_entry(&self, id: &str) -> Result<PoolEntry> {
        self.entries.get_object(id.as_bytes())
    }

    pub fn has_entry(&self, id: &str) -> Result<bool> {
        self.entries.has_object(id.as_bytes())
    }

    pub fn get_pool_items(&self) -> Result<Vec<PoolEntry>> {
        let mut items = Vec::new();
        self.entries.for_each(|_, raw| {
            items.push(crate::codec::decode(raw)?);
            Ok(())
        })?;
        Ok(items)
    }

    pub fn get_delta_failed(&self, delta_name: &str) -> Result<bool> {
        self.skip.has_object(delta_name.as_bytes())
    }

    pub fn file_path(&self, source_name: &str, id: &str) -> PathBuf {
        self.pool_dir.join(path_component(source_name)).join(id)
    }
}

/// `Pool::add_package` run inside a write transaction.
///
/// If an entry with `pkg.id` exists, increments its refcount and returns it.
/// Otherwise hashes the file, places it into the pool (hard link, falling
/// back to copy), and persists a fresh entry with `ref_count = 1`. Any
/// filesystem side effect made before a later failure is reversed before
/// the error is returned.
pub fn add_package_tx(
    entries: &TxHandle,
    pool_dir: &Path,
    pkg: &OpenedPackage,
    force_copy: bool,
) -> Result<PoolEntry> {
    add_package_tx_with_delta(entries, pool_dir, pkg, None, force_copy)
}

/// `Pool::add_delta` run inside a write transaction: validates that both
/// endpoints of `mapping` already have pool entries, fills in their
/// releases, then proceeds exactly as [`add_package_tx`] with a non-null
/// `delta`.
pub fn add_delta_tx(
    entries: &TxHandle,
    pool_dir: &Path,
    pkg: &OpenedPackage,
    mut mapping: DeltaMapping,
    force_copy: bool,
) -> Result<PoolEntry> {
    let from = entries.get_object::<PoolEntry>(mapping.from_id.as_bytes())?;
    let to = entries.get_object::<PoolEntry>(mapping.to_id.as_bytes())?;
    mapping.from_release = from.meta.release;
    mapping.to_release = to.meta.release;
    add_package_tx_with_delta(entries, pool_dir, pkg, Some(mapping), force_copy)
}

fn add_package_tx_with_delta(
    entries: &TxHandle,
    pool_dir: &Path,
    pkg: &OpenedPackage,
    delta: Option<DeltaMapping>,
    force_copy: bool,
) -> Result<PoolEntry> {
    if let Ok(existing) = entries.get_object::<PoolEntry>(pkg.id.as_bytes()) {
        return ref_entry_tx(entries, &pkg.id).map(|()| PoolEntry {
            ref_count: existing.ref_count + 1,
            ..existing
        });
    }

    let dst = pool_dir
        .join(path_component(&pkg.meta.source_name))
        .join(&pkg.id);

    place_in_pool(&pkg.path, &dst, force_copy)?;

    let result = (|| -> Result<PoolEntry> {
        let hash = fsutil::sha1_hex(&dst)?;
        let size = fs_err::metadata(&dst)?.len();
        let mut meta = pkg.meta.clone();
        meta.package_hash = hash;
        meta.package_size = size;
        meta.package_uri = format!("{}/{}", path_component(&pkg.meta.source_name), pkg.id);

        let entry = PoolEntry {
            schema_version: SCHEMA_VERSION.to_string(),
            name: pkg.id.clone(),
            ref_count: 1,
            meta,
            delta,
        };
        entries.put_object(pkg.id.as_bytes(), &entry)?;
        Ok(entry)
    })();

    match result {
        Ok(entry) => Ok(entry),
        Err(err) => {
            // Undo the filesystem side effect before propagating: a
            // transaction abort must leave no orphaned pool file behind.
            let _ = fsutil::remove_file_and_prune_parents(&dst, 2, pool_dir);
            Err(err)
        }
    }
}

fn place_in_pool(src: &Path, dst: &Path, force_copy: bool) -> Result<()> {
    if dst.exists() {
        return Ok(());
    }
    fsutil::link_or_copy(src, dst, force_copy)?;
    Ok(())
}

/// Increment a pool entry's refcount.
pub fn ref_entry_tx(entries: &TxHandle, id: &str) -> Result<()> {
    let mut entry = entries.get_object::<PoolEntry>(id.as_bytes())?;
    entry.ref_count += 1;
    entries.put_object(id.as_bytes(), &entry)
}

/// Decrement a pool entry's refcount; at zero, remove the file (and prune
/// empty parent directories) and delete the record.
pub fn unref_entry_tx(entries: &TxHandle, pool_dir: &Path, id: &str) -> Result<()> {
    let mut entry = entries.get_object::<PoolEntry>(id.as_bytes())?;
    if entry.ref_count <= 1 {
        entries.delete_object(id.as_bytes())?;
        let path = pool_dir
            .join(path_component(&entry.meta.source_name))
            .join(id);
        fsutil::remove_file_and_prune_parents(&path, 2, pool_dir)?;
        return Ok(());
    }
    entry.ref_count -= 1;
    entries.put_object(id.as_bytes(), &entry)
}

/// Idempotent insert into the skip set.
pub fn mark_delta_failed_tx(skip: &TxHandle, delta_name: &str, entry: DeltaSkipEntry) -> Result<()> {
    skip.put_object(delta_name.as_bytes(), &entry)
}

pub fn get_delta_failed_tx(skip: &TxHandle, delta_name: &str) -> Result<bool> {
    skip.has_object(delta_name.as_bytes())
}

pub fn get_entry_tx(entries: &TxHandle, id: &str) -> Result<PoolEntry> {
    entries.get_object(id.as_bytes())
}

pub fn skip_entry(delta_name: &str, mapping: DeltaMapping) -> DeltaSkipEntry {
    DeltaSkipEntry {
        schema_version: SCHEMA_VERSION.to_string(),
        name: delta_name.to_string(),
        delta: mapping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::tempdir;

    fn meta(name: &str, release: u32) -> PackageMeta {
        PackageMeta {
            name: name.to_string(),
            source_name: name.to_string(),
            release,
            version: "1.0".into(),
            distribution_release: "1".into(),
            architecture: "x86_64".into(),
            licenses: vec![],
            runtime_dependencies: vec![],
            install_size: 0,
            package_size: 0,
            package_hash: String::new(),
            package_uri: String::new(),
        }
    }

    fn opened(dir: &Path, name: &str, release: u32) -> OpenedPackage {
        let id = format!("{name}-{release}-1-x86_64.eopkg");
        let path = dir.join(format!("src-{id}"));
        fs_err::write(&path, format!("contents for {id}")).unwrap();
        OpenedPackage {
            id,
            path,
            meta: meta(name, release),
        }
    }

    #[test]
    fn add_package_creates_entry_and_file() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        let conn = db.connection();
        let pool = Pool::open(&conn, dir.path().join("pool")).unwrap();
        let pkg = opened(dir.path(), "nano", 68);

        let entry = conn
            .update(&[&pool.entries], |h| {
                add_package_tx(&h[0], &dir.path().join("pool"), &pkg, false)
            })
            .unwrap();

        assert_eq!(entry.ref_count, 1);
        assert!(pool.file_path("nano", &pkg.id).exists());
        assert_eq!(pool.get_entry(&pkg.id).unwrap().ref_count, 1);
    }

    #[test]
    fn add_package_twice_increments_refcount_idempotently() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        let conn = db.connection();
        let pool = Pool::open(&conn, dir.path().join("pool")).unwrap();
        let pkg = opened(dir.path(), "nano", 68);
        let pool_dir = dir.path().join("pool");

        conn.update(&[&pool.entries], |h| add_package_tx(&h[0], &pool_dir, &pkg, false))
            .unwrap();
        conn.update(&[&pool.entries], |h| add_package_tx(&h[0], &pool_dir, &pkg, false))
            .unwrap();

        assert_eq!(pool.get_entry(&pkg.id).unwrap().ref_count, 2);
    }

    #[test]
    fn ref_unref_is_a_no_op_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        let conn = db.connection();
        let pool = Pool::open(&conn, dir.path().join("pool")).unwrap();
        let pkg = opened(dir.path(), "nano", 68);
        let pool_dir = dir.path().join("pool");

        conn.update(&[&pool.entries], |h| add_package_tx(&h[0], &pool_dir, &pkg, false))
            .unwrap();
        conn.update(&[&pool.entries], |h| ref_entry_tx(&h[0], &pkg.id))
            .unwrap();
        assert_eq!(pool.get_entry(&pkg.id).unwrap().ref_count, 2);

        conn.update(&[&pool.entries], |h| unref_entry_tx(&h[0], &pool_dir, &pkg.id))
            .unwrap();
        assert_eq!(pool.get_entry(&pkg.id).unwrap().ref_count, 1);
        assert!(pool.file_path("nano", &pkg.id).exists());
    }

    #[test]
    fn unref_to_zero_deletes_record_and_file() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        let conn = db.connection();
        let pool = Pool::open(&conn, dir.path().join("pool")).unwrap();
        let pkg = opened(dir.path(), "nano", 68);
        let pool_dir = dir.path().join("pool");

        conn.update(&[&pool.entries], |h| add_package_tx(&h[0], &pool_dir, &pkg, false))
            .unwrap();
        conn.update(&[&pool.entries], |h| unref_entry_tx(&h[0], &pool_dir, &pkg.id))
            .unwrap();

        assert!(pool.get_entry(&pkg.id).is_err());
        assert!(!pool.file_path("nano", &pkg.id).exists());
    }

    #[test]
    fn delta_skip_set_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        let conn = db.connection();
        let pool = Pool::open(&conn, dir.path().join("pool")).unwrap();

        let mapping = DeltaMapping {
            from_id: "a".into(),
            to_id: "b".into(),
            from_release: 1,
            to_release: 2,
        };
        let name = "nano-1-2-1-x86_64.delta.eopkg";
        conn.update(&[&pool.skip], |h| {
            mark_delta_failed_tx(&h[0], name, skip_entry(name, mapping.clone()))
        })
        .unwrap();
        conn.update(&[&pool.skip], |h| {
            mark_delta_failed_tx(&h[0], name, skip_entry(name, mapping.clone()))
        })
        .unwrap();

        assert!(pool.get_delta_failed(name).unwrap());
        assert!(!pool.get_delta_failed("unknown").unwrap());
    }
}
