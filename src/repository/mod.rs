//! The repository set: the catalogue of named repositories and, within
//! each, the per-base-package-name entry database.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::archive::{DeltaMapping, OpenedPackage, PackageMeta};
use crate::context::path_component;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::pool::{self, PoolEntry};
use crate::storage::{Connection, Handle, TxHandle};

pub const REPOS_BUCKET: &str = "repo.meta";

const SCHEMA_VERSION: &str = "1";

/// One record per logical repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub schema_version: String,
    pub id: String,
}

/// One record per base package name within a repository.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    /// Byte-sorted, duplicate-free package IDs belonging to this entry.
    pub available: Vec<String>,
    /// The tip package ID emitted into the index. Empty until the first
    /// package is added.
    pub published: String,
    /// Delta package IDs, sorted by `from_release` ascending.
    pub deltas: Vec<String>,
    /// Set when a package with the same base name and the same release as
    /// `published` but a different ID was added. This ambiguity is surfaced
    /// rather than silently resolved by switching tips.
    pub collision: Option<String>,
}

/// Validate a repository id: ASCII, and none of `.`, `/`, `\`, `;`.
pub fn validate_repo_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.is_ascii() {
        return Err(Error::InvalidArgument(format!(
            "repository id must be non-empty ASCII: {id:?}"
        )));
    }
    if id.contains(['.', '/', '\\', ';']) {
        return Err(Error::InvalidArgument(format!(
            "repository id contains forbidden characters: {id:?}"
        )));
    }
    Ok(())
}

/// The catalogue of repositories plus a cache of per-repository entry
/// buckets, guarded by a single mutex as required by the concurrency model.
pub struct RepositorySet {
    pub repos: Handle,
    conn: Connection,
    cache: Mutex<HashMap<String, Handle>>,
}

impl RepositorySet {
    pub fn open(conn: &Connection) -> Result<Self> {
        Ok(Self {
            repos: conn.bucket(REPOS_BUCKET)?,
            conn: conn.clone(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        self.repos.has_object(id.as_bytes())
    }

    pub fn get(&self, id: &str) -> Result<Repository> {
        self.repos.get_object(id.as_bytes())
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        self.repos.for_each(|key, _| {
            ids.push(String::from_utf8_lossy(key).to_string());
            Ok(())
        })?;
        Ok(ids)
    }

    /// The entries bucket for `repo_id`, opening (and caching) it on first
    /// use. A cached handle is reused for the lifetime of this
    /// `RepositorySet`, guarded by the cache mutex below.
    pub fn entries_handle(&self, repo_id: &str) -> Result<Handle> {
        let mut cache = self.cache.lock().expect("repository cache poisoned");
        if let Some(handle) = cache.get(repo_id) {
            return Ok(handle.clone());
        }
        let handle = self.conn.bucket(&entries_bucket_name(repo_id))?;
        cache.insert(repo_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Evict a cached entries handle, e.g. after deleting the repository it
    /// belongs to.
    pub(crate) fn forget(&self, repo_id: &str) {
        self.cache.lock().expect("repository cache poisoned").remove(repo_id);
    }

    pub fn get_entry(&self, repo_id: &str, base_name: &str) -> Result<RepoEntry> {
        self.entries_handle(repo_id)?.get_object(base_name.as_bytes())
    }

    pub fn get_package_names(&self, repo_id: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.entries_handle(repo_id)?.for_each(|key, _| {
            names.push(String::from_utf8_lossy(key).to_string());
            Ok(())
        })?;
        Ok(names)
    }

    pub fn has_delta(&self, repo_id: &str, base_name: &str, delta_id: &str) -> Result<bool> {
        match self.get_entry(repo_id, base_name) {
            Ok(entry) => Ok(entry.deltas.iter().any(|d| d == delta_id)),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn entries_bucket_name(repo_id: &str) -> String {
    format!("repo.entries.{repo_id}")
}

/// `create_repo` run inside a write transaction. Directory creation is the
/// caller's responsibility (it happens outside the transaction, same as
/// `delete_repo`'s directory removal).
pub fn create_repo_tx(repos: &TxHandle, id: &str) -> Result<Repository> {
    validate_repo_id(id)?;
    if repos.has_object(id.as_bytes())? {
        return Err(Error::AlreadyExists(format!("repository {id:?} already exists")));
    }
    let repo = Repository {
        schema_version: SCHEMA_VERSION.to_string(),
        id: id.to_string(),
    };
    repos.put_object(id.as_bytes(), &repo)?;
    Ok(repo)
}

/// `delete_repo`'s transactional sweep: unref every package and delta this
/// repository held, then delete every `RepoEntry` and the repository
/// record itself. Directory removal happens outside this transaction, via
/// [`crate::context::Context::remove_repo_dirs`].
pub fn delete_repo_tx(
    repos: &TxHandle,
    repo_entries: &TxHandle,
    pool_entries: &TxHandle,
    pool_dir: &Path,
    id: &str,
) -> Result<()> {
    let mut names = Vec::new();
    repo_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    for name in names {
        let entry: RepoEntry = repo_entries.get_object(name.as_bytes())?;
        for pkg_id in entry.available.iter().chain(entry.deltas.iter()) {
            pool::unref_entry_tx(pool_entries, pool_dir, pkg_id)?;
        }
        repo_entries.delete_object(name.as_bytes())?;
    }

    repos.delete_object(id.as_bytes())?;
    Ok(())
}

/// Add (or update) the `RepoEntry` for `pkg`'s base package name, following
/// the tip-promotion rule in §4.3. Idempotent: a package ID already present
/// in `available` is a no-op.
pub fn add_local_package_tx(
    repo_entries: &TxHandle,
    pool_entries: &TxHandle,
    pool_dir: &Path,
    repo_dir: &Path,
    pkg: &OpenedPackage,
    force_copy: bool,
) -> Result<RepoEntry> {
    let mut entry = load_or_default_entry(repo_entries, &pkg.meta.name)?;

    if entry.available.iter().any(|id| id == &pkg.id) {
        return Ok(entry);
    }

    promote_tip(&mut entry, pool_entries, &pkg.id, &pkg.meta)?;

    entry.available.push(pkg.id.clone());
    entry.available.sort();
    entry.available.dedup();

    pool::add_package_tx(pool_entries, pool_dir, pkg, force_copy)?;
    link_into_repo_tree(pool_dir, repo_dir, &pkg.meta.source_name, &pkg.id, force_copy)?;

    repo_entries.put_object(pkg.meta.name.as_bytes(), &entry)?;
    Ok(entry)
}

/// Like [`add_local_package_tx`], but for a delta package: refuses to add a
/// delta whose base package is unknown, and keeps `deltas` sorted by
/// `from_release` ascending (see the resolved Open Question in §9).
pub fn add_local_delta_tx(
    repo_entries: &TxHandle,
    pool_entries: &TxHandle,
    pool_dir: &Path,
    repo_dir: &Path,
    pkg: &OpenedPackage,
    mapping: DeltaMapping,
    force_copy: bool,
) -> Result<RepoEntry> {
    let mut entry: RepoEntry = repo_entries.get_object(pkg.meta.name.as_bytes()).map_err(|err| {
        if matches!(err, Error::NotFound(_)) {
            Error::NotFound(format!(
                "cannot add delta: unknown base package {:?} in this repository",
                pkg.meta.name
            ))
        } else {
            err
        }
    })?;

    if entry.deltas.iter().any(|id| id == &pkg.id) {
        return Ok(entry);
    }

    pool::add_delta_tx(pool_entries, pool_dir, pkg, mapping, force_copy)?;
    link_into_repo_tree(pool_dir, repo_dir, &pkg.meta.source_name, &pkg.id, force_copy)?;

    entry.deltas.push(pkg.id.clone());
    sort_deltas_by_from_release(&mut entry.deltas, pool_entries)?;

    repo_entries.put_object(pkg.meta.name.as_bytes(), &entry)?;
    Ok(entry)
}

/// `is_delta_possible(published, candidate)` plus "is there already a
/// staged/pool file with this name" short-circuit; returns the delta's
/// filename.
pub fn compute_delta_target(old: &PackageMeta, new: &PackageMeta) -> Result<String> {
    if !crate::archive::is_delta_possible(old, new) {
        return Err(Error::MismatchedDelta);
    }
    Ok(crate::archive::compute_delta_name(old, new))
}

fn load_or_default_entry(repo_entries: &TxHandle, name: &str) -> Result<RepoEntry> {
    match repo_entries.get_object::<RepoEntry>(name.as_bytes()) {
        Ok(entry) => Ok(entry),
        Err(Error::NotFound(_)) => Ok(RepoEntry {
            name: name.to_string(),
            ..Default::default()
        }),
        Err(err) => Err(err),
    }
}

/// Implements the tip-promotion rule: higher release wins; equal release
/// with a different ID is recorded as a collision and the existing tip is
/// kept; lower release just joins `available`.
fn promote_tip(
    entry: &mut RepoEntry,
    pool_entries: &TxHandle,
    candidate_id: &str,
    candidate_meta: &PackageMeta,
) -> Result<()> {
    if entry.published.is_empty() {
        entry.published = candidate_id.to_string();
        return Ok(());
    }
    if entry.published == candidate_id {
        return Ok(());
    }
    let published: PoolEntry = pool_entries.get_object(entry.published.as_bytes())?;
    match candidate_meta.release.cmp(&published.meta.release) {
        std::cmp::Ordering::Greater => entry.published = candidate_id.to_string(),
        std::cmp::Ordering::Equal => {
            tracing::warn!(
                base_name = %entry.name,
                existing = %entry.published,
                candidate = %candidate_id,
                release = candidate_meta.release,
                "duplicate release for base package, keeping existing tip"
            );
            entry.collision = Some(candidate_id.to_string());
        }
        std::cmp::Ordering::Less => {}
    }
    Ok(())
}

fn sort_deltas_by_from_release(ids: &mut [String], pool_entries: &TxHandle) -> Result<()> {
    let mut releases = HashMap::with_capacity(ids.len());
    for id in ids.iter() {
        let entry: PoolEntry = pool_entries.get_object(id.as_bytes())?;
        let from_release = entry
            .delta
            .as_ref()
            .ok_or_else(|| Error::Corrupt(format!("pool entry {id:?} in deltas has no delta record")))?
            .from_release;
        releases.insert(id.clone(), from_release);
    }
    ids.sort_by_key(|id| releases[id]);
    Ok(())
}

fn link_into_repo_tree(
    pool_dir: &Path,
    repo_dir: &Path,
    source_name: &str,
    id: &str,
    force_copy: bool,
) -> Result<()> {
    let src = pool_dir.join(path_component(source_name)).join(id);
    let dst = repo_dir.join(path_component(source_name)).join(id);
    fsutil::link_or_copy(&src, &dst, force_copy)?;
    Ok(())
}

/// Copy every `RepoEntry` from `source_id` into `clone_id`'s bucket,
/// ref-counting the pool for each ID copied. When `copy_all` is `false`,
/// only the tip and its applicable deltas are copied.
pub fn clone_entries_tx(
    source_entries: &TxHandle,
    target_entries: &TxHandle,
    pool_entries: &TxHandle,
    copy_all: bool,
) -> Result<usize> {
    let mut names = Vec::new();
    source_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    let mut copied = 0;
    for name in names {
        let source: RepoEntry = source_entries.get_object(name.as_bytes())?;
        let entry = if copy_all {
            source.clone()
        } else {
            RepoEntry {
                name: source.name.clone(),
                available: vec![source.published.clone()],
                published: source.published.clone(),
                deltas: deltas_applicable_to(&source, pool_entries)?,
                collision: None,
            }
        };

        for id in entry.available.iter().chain(entry.deltas.iter()) {
            pool::ref_entry_tx(pool_entries, id)?;
            copied += 1;
        }

        target_entries.put_object(name.as_bytes(), &entry)?;
    }
    Ok(copied)
}

fn deltas_applicable_to(entry: &RepoEntry, pool_entries: &TxHandle) -> Result<Vec<String>> {
    let published: PoolEntry = pool_entries.get_object(entry.published.as_bytes())?;
    let mut applicable = Vec::new();
    for id in &entry.deltas {
        let delta_entry: PoolEntry = pool_entries.get_object(id.as_bytes())?;
        if let Some(delta) = &delta_entry.delta {
            if delta.to_release == published.meta.release {
                applicable.push(id.clone());
            }
        }
    }
    Ok(applicable)
}

/// Pull every `RepoEntry` base name present in `source` but absent in
/// `target`, and for base names present in both, pull in any `available`
/// IDs from `source` that `target` doesn't have yet, re-running tip
/// promotion for each.
pub fn pull_entries_tx(
    source_entries: &TxHandle,
    target_entries: &TxHandle,
    pool_entries: &TxHandle,
) -> Result<usize> {
    let mut names = Vec::new();
    source_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    let mut pulled = 0;
    for name in names {
        let source: RepoEntry = source_entries.get_object(name.as_bytes())?;
        match target_entries.get_object::<RepoEntry>(name.as_bytes()) {
            Ok(mut target) => {
                let existing: HashSet<_> = target.available.iter().cloned().collect();
                for id in &source.available {
                    if existing.contains(id) {
                        continue;
                    }
                    let meta = &pool_entries.get_object::<PoolEntry>(id.as_bytes())?.meta;
                    promote_tip(&mut target, pool_entries, id, meta)?;
                    target.available.push(id.clone());
                    pool::ref_entry_tx(pool_entries, id)?;
                    pulled += 1;
                }
                target.available.sort();
                target.available.dedup();
                for id in &source.deltas {
                    if !target.deltas.contains(id) {
                        target.deltas.push(id.clone());
                        pool::ref_entry_tx(pool_entries, id)?;
                        pulled += 1;
                    }
                }
                sort_deltas_by_from_release(&mut target.deltas, pool_entries)?;
                target_entries.put_object(name.as_bytes(), &target)?;
            }
            Err(Error::NotFound(_)) => {
                for id in source.available.iter().chain(source.deltas.iter()) {
                    pool::ref_entry_tx(pool_entries, id)?;
                    pulled += 1;
                }
                target_entries.put_object(name.as_bytes(), &source)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(pulled)
}

/// Trim every `RepoEntry`'s `available` list down to `max_packages` members
/// (always keeping `published`), unref'ing the dropped, oldest-release IDs
/// and any deltas whose `from_id` no longer exists.
pub fn trim_packages_tx(
    repo_entries: &TxHandle,
    pool_entries: &TxHandle,
    pool_dir: &Path,
    max_packages: usize,
) -> Result<usize> {
    let mut names = Vec::new();
    repo_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    let mut trimmed = 0;
    for name in names {
        let mut entry: RepoEntry = repo_entries.get_object(name.as_bytes())?;
        if entry.available.len() <= max_packages.max(1) {
            continue;
        }

        let mut by_release = Vec::with_capacity(entry.available.len());
        for id in &entry.available {
            let release = pool_entries.get_object::<PoolEntry>(id.as_bytes())?.meta.release;
            by_release.push((release, id.clone()));
        }
        by_release.sort_by_key(|(release, _)| *release);

        while entry.available.len() > max_packages.max(1) {
            let (_, victim) = by_release.remove(0);
            if victim == entry.published {
                // Never trim the tip; stop once only the tip and fewer than
                // max_packages survivors remain.
                continue;
            }
            entry.available.retain(|id| id != &victim);
            pool::unref_entry_tx(pool_entries, pool_dir, &victim)?;
            trimmed += 1;

            let mut orphaned = Vec::new();
            for delta_id in &entry.deltas {
                let delta_entry: PoolEntry = pool_entries.get_object(delta_id.as_bytes())?;
                if delta_entry
                    .delta
                    .as_ref()
                    .is_some_and(|d| d.from_id == victim)
                {
                    orphaned.push(delta_id.clone());
                }
            }
            for delta_id in orphaned {
                entry.deltas.retain(|id| id != &delta_id);
                pool::unref_entry_tx(pool_entries, pool_dir, &delta_id)?;
                trimmed += 1;
            }
        }

        repo_entries.put_object(name.as_bytes(), &entry)?;
    }
    Ok(trimmed)
}

/// `CopySource`'s transactional sweep: for every `RepoEntry` in
/// `source_entries` holding a package whose source name and release match,
/// add that package (refcounted) into the corresponding `RepoEntry` in
/// `target_entries`.
pub fn copy_source_tx(
    source_entries: &TxHandle,
    target_entries: &TxHandle,
    pool_entries: &TxHandle,
    source_name: &str,
    release: u32,
) -> Result<usize> {
    let mut names = Vec::new();
    source_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    let mut copied = 0;
    for name in names {
        let source: RepoEntry = source_entries.get_object(name.as_bytes())?;
        let matches = matching_ids(&source, pool_entries, source_name, release)?;
        if matches.is_empty() {
            continue;
        }

        let mut target = load_or_default_entry(target_entries, &name)?;
        for id in matches {
            if target.available.contains(&id) {
                continue;
            }
            let meta = pool_entries.get_object::<PoolEntry>(id.as_bytes())?.meta;
            promote_tip(&mut target, pool_entries, &id, &meta)?;
            target.available.push(id.clone());
            pool::ref_entry_tx(pool_entries, &id)?;
            copied += 1;
        }
        target.available.sort();
        target.available.dedup();
        target_entries.put_object(name.as_bytes(), &target)?;
    }
    Ok(copied)
}

/// `RemoveSource`'s transactional sweep: unref and drop every package whose
/// source name and release match, across every `RepoEntry` in `repo_entries`.
/// Never drops a matching id that happens to be the entry's published tip.
pub fn remove_source_tx(
    repo_entries: &TxHandle,
    pool_entries: &TxHandle,
    pool_dir: &Path,
    source_name: &str,
    release: u32,
) -> Result<usize> {
    let mut names = Vec::new();
    repo_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    let mut removed = 0;
    for name in names {
        let mut entry: RepoEntry = repo_entries.get_object(name.as_bytes())?;
        let matches = matching_ids(&entry, pool_entries, source_name, release)?;
        if matches.is_empty() {
            continue;
        }

        for id in matches {
            if id == entry.published {
                continue;
            }
            entry.available.retain(|existing| existing != &id);
            pool::unref_entry_tx(pool_entries, pool_dir, &id)?;
            removed += 1;

            let mut orphaned = Vec::new();
            for delta_id in &entry.deltas {
                let delta_entry: PoolEntry = pool_entries.get_object(delta_id.as_bytes())?;
                if delta_entry.delta.as_ref().is_some_and(|d| d.from_id == id) {
                    orphaned.push(delta_id.clone());
                }
            }
            for delta_id in orphaned {
                entry.deltas.retain(|existing| existing != &delta_id);
                pool::unref_entry_tx(pool_entries, pool_dir, &delta_id)?;
                removed += 1;
            }
        }
        repo_entries.put_object(name.as_bytes(), &entry)?;
    }
    Ok(removed)
}

fn matching_ids(
    entry: &RepoEntry,
    pool_entries: &TxHandle,
    source_name: &str,
    release: u32,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for id in &entry.available {
        let meta = &pool_entries.get_object::<PoolEntry>(id.as_bytes())?.meta;
        if meta.source_name == source_name && meta.release == release {
            ids.push(id.clone());
        }
    }
    Ok(ids)
}

/// Remove every `RepoEntry` whose base name is obsolete per `obsolete_set`.
pub fn trim_obsolete_tx(
    repo_entries: &TxHandle,
    pool_entries: &TxHandle,
    pool_dir: &Path,
    obsolete_set: &HashSet<String>,
) -> Result<usize> {
    let mut names = Vec::new();
    repo_entries.for_each(|key, _| {
        names.push(String::from_utf8_lossy(key).to_string());
        Ok(())
    })?;

    let mut removed = 0;
    for name in names {
        if !obsolete_set.contains(&name) {
            continue;
        }
        let entry: RepoEntry = repo_entries.get_object(name.as_bytes())?;
        for id in entry.available.iter().chain(entry.deltas.iter()) {
            pool::unref_entry_tx(pool_entries, pool_dir, id)?;
        }
        repo_entries.delete_object(name.as_bytes())?;
        removed += 1;
    }
    Ok(removed)
}
