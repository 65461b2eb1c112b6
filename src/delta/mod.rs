//! The delta pipeline: for one base package name in one repository, attempts
//! to produce a delta from every non-tip member of `available` to the tip.

use std::path::{Path, PathBuf};

use crate::archive::{Archive, DeltaMapping, OpenedPackage, compute_delta_name, is_delta_possible};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pool::{self, Pool};
use crate::repository::{self, RepositorySet};
use crate::storage::Connection;

/// A delta produced (or already staged) and ready for the `IncludeDelta`
/// step.
pub struct DeltaCandidate {
    pub path: PathBuf,
    pub mapping: DeltaMapping,
    pub delta_name: String,
}

/// Plans and produces every still-missing delta for `base_name` in
/// `repo_id`. Incompatible or pointless attempts are recorded as a
/// permanent skip on the spot and do not appear in the returned list.
pub fn plan_and_produce(
    conn: &Connection,
    pool: &Pool,
    repos: &RepositorySet,
    archive: &dyn Archive,
    staging_dir: &Path,
    repo_id: &str,
    base_name: &str,
) -> Result<Vec<DeltaCandidate>> {
    let entry = repos.get_entry(repo_id, base_name)?;
    if entry.published.is_empty() {
        return Ok(Vec::new());
    }
    let tip = pool.get_entry(&entry.published)?;

    let mut by_release: Vec<(u32, String)> = Vec::with_capacity(entry.available.len());
    for id in &entry.available {
        if *id == entry.published {
            continue;
        }
        let old = pool.get_entry(id)?;
        by_release.push((old.meta.release, id.clone()));
    }
    by_release.sort_by_key(|(release, _)| *release);

    fs_err::create_dir_all(staging_dir)?;

    let mut candidates = Vec::new();
    for (_, id) in by_release {
        let old = pool.get_entry(&id)?;
        let delta_name = compute_delta_name(&old.meta, &tip.meta);

        if pool.get_delta_failed(&delta_name)? {
            continue;
        }

        let mapping = DeltaMapping {
            from_id: id.clone(),
            to_id: entry.published.clone(),
            from_release: old.meta.release,
            to_release: tip.meta.release,
        };

        if !is_delta_possible(&old.meta, &tip.meta) {
            skip(conn, pool, &delta_name, mapping)?;
            continue;
        }

        let staged_path = staging_dir.join(&delta_name);
        if !staged_path.exists() {
            let from_pkg = OpenedPackage {
                id: id.clone(),
                path: pool.file_path(&old.meta.source_name, &id),
                meta: old.meta.clone(),
            };
            let to_pkg = OpenedPackage {
                id: entry.published.clone(),
                path: pool.file_path(&tip.meta.source_name, &entry.published),
                meta: tip.meta.clone(),
            };

            match archive.produce_delta(&from_pkg, &to_pkg, staging_dir) {
                Ok(_) => {}
                Err(Error::DeltaPointless) | Err(Error::MismatchedDelta) => {
                    skip(conn, pool, &delta_name, mapping)?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        candidates.push(DeltaCandidate {
            path: staged_path,
            mapping,
            delta_name,
        });
    }

    Ok(candidates)
}

fn skip(conn: &Connection, pool: &Pool, delta_name: &str, mapping: DeltaMapping) -> Result<()> {
    conn.update(&[&pool.skip], |h| {
        pool::mark_delta_failed_tx(&h[0], delta_name, pool::skip_entry(delta_name, mapping.clone()))
    })
}

/// Folds one produced delta back into the pool and its repository, then
/// removes the staged file. Runs in its own write transaction spanning the
/// pool and the repository's entries bucket.
pub fn include_delta(
    conn: &Connection,
    pool: &Pool,
    repos: &RepositorySet,
    ctx: &Context,
    archive: &dyn Archive,
    repo_id: &str,
    candidate: &DeltaCandidate,
) -> Result<()> {
    let opened = archive.open_package(&candidate.path)?;
    let entries = repos.entries_handle(repo_id)?;
    let repo_dir = ctx.repo_path(repo_id);
    let pool_dir = ctx.pool_dir();

    conn.update(&[&entries, &pool.entries], |h| {
        repository::add_local_delta_tx(&h[0], &h[1], &pool_dir, &repo_dir, &opened, candidate.mapping.clone(), false)
    })?;

    match fs_err::remove_file(&candidate.path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PackageMeta;
    use crate::storage::Database;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MockArchive {
        fail_with: Option<Error>,
        produced: Mutex<Vec<(String, String)>>,
    }

    impl MockArchive {
        fn new() -> Self {
            Self {
                fail_with: None,
                produced: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: Error) -> Self {
            Self {
                fail_with: Some(err),
                produced: Mutex::new(Vec::new()),
            }
        }
    }

    impl Archive for MockArchive {
        fn open_package(&self, path: &Path) -> Result<OpenedPackage> {
            let id = path.file_name().unwrap().to_string_lossy().to_string();
            Ok(OpenedPackage {
                id: id.clone(),
                path: path.to_path_buf(),
                meta: PackageMeta {
                    name: "nano".into(),
                    source_name: "nano".into(),
                    release: 69,
                    version: "2.7.6".into(),
                    distribution_release: "1".into(),
                    architecture: "x86_64".into(),
                    licenses: vec![],
                    runtime_dependencies: vec![],
                    install_size: 0,
                    package_size: 0,
                    package_hash: String::new(),
                    package_uri: String::new(),
                },
            })
        }

        fn produce_delta(&self, from: &OpenedPackage, to: &OpenedPackage, out_dir: &Path) -> Result<PathBuf> {
            if let Some(err) = &self.fail_with {
                return Err(clone_err(err));
            }
            let name = compute_delta_name(&from.meta, &to.meta);
            let path = out_dir.join(&name);
            fs_err::write(&path, b"delta contents").unwrap();
            self.produced.lock().unwrap().push((from.id.clone(), to.id.clone()));
            Ok(path)
        }
    }

    fn clone_err(err: &Error) -> Error {
        match err {
            Error::DeltaPointless => Error::DeltaPointless,
            Error::MismatchedDelta => Error::MismatchedDelta,
            _ => Error::Corrupt("unexpected mock error".into()),
        }
    }

    fn meta(name: &str, release: u32) -> PackageMeta {
        PackageMeta {
            name: name.to_string(),
            source_name: name.to_string(),
            release,
            version: format!("1.{release}"),
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

    struct Fixture {
        _dir: tempfile::TempDir,
        conn: Connection,
        pool: Pool,
        repos: RepositorySet,
        ctx: Context,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let ctx = Context::new(dir.path());
        ctx.ensure_dirs().unwrap();
        ctx.ensure_repo_dirs("unstable").unwrap();
        let db = Database::open(ctx.main_db_path()).unwrap();
        let conn = db.connection();
        let pool = Pool::open(&conn, ctx.pool_dir()).unwrap();
        let repos = RepositorySet::open(&conn).unwrap();
        conn.update(&[&repos.repos], |h| repository::create_repo_tx(&h[0], "unstable"))
            .unwrap();
        Fixture {
            _dir: dir,
            conn,
            pool,
            repos,
            ctx,
        }
    }

    #[test]
    fn produces_one_delta_from_non_tip_to_tip() {
        let fx = fixture();
        let entries = fx.repos.entries_handle("unstable").unwrap();
        let repo_dir = fx.ctx.repo_path("unstable");
        let old = opened(fx._dir.path(), "nano", 68);
        let new = opened(fx._dir.path(), "nano", 69);
        for pkg in [&old, &new] {
            fx.conn
                .update(&[&entries, &fx.pool.entries], |h| {
                    repository::add_local_package_tx(&h[0], &h[1], &fx.ctx.pool_dir(), &repo_dir, pkg, false)
                })
                .unwrap();
        }

        let archive = MockArchive::new();
        let staging = fx.ctx.repo_delta_staging_path("unstable");
        let candidates =
            plan_and_produce(&fx.conn, &fx.pool, &fx.repos, &archive, &staging, "unstable", "nano").unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].mapping.from_release, 68);
        assert_eq!(candidates[0].mapping.to_release, 69);
        assert!(candidates[0].path.exists());
    }

    #[test]
    fn pointless_delta_is_recorded_as_permanent_skip() {
        let fx = fixture();
        let entries = fx.repos.entries_handle("unstable").unwrap();
        let repo_dir = fx.ctx.repo_path("unstable");
        let old = opened(fx._dir.path(), "nano", 68);
        let new = opened(fx._dir.path(), "nano", 69);
        for pkg in [&old, &new] {
            fx.conn
                .update(&[&entries, &fx.pool.entries], |h| {
                    repository::add_local_package_tx(&h[0], &h[1], &fx.ctx.pool_dir(), &repo_dir, pkg, false)
                })
                .unwrap();
        }

        let archive = MockArchive::failing(Error::DeltaPointless);
        let staging = fx.ctx.repo_delta_staging_path("unstable");
        let candidates =
            plan_and_produce(&fx.conn, &fx.pool, &fx.repos, &archive, &staging, "unstable", "nano").unwrap();
        assert!(candidates.is_empty());

        let delta_name = compute_delta_name(&old.meta, &new.meta);
        assert!(fx.pool.get_delta_failed(&delta_name).unwrap());

        // Re-running does not call the producer again for a permanently
        // skipped delta.
        let candidates =
            plan_and_produce(&fx.conn, &fx.pool, &fx.repos, &archive, &staging, "unstable", "nano").unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn include_delta_registers_and_unstages() {
        let fx = fixture();
        let entries = fx.repos.entries_handle("unstable").unwrap();
        let repo_dir = fx.ctx.repo_path("unstable");
        let old = opened(fx._dir.path(), "nano", 68);
        let new = opened(fx._dir.path(), "nano", 69);
        for pkg in [&old, &new] {
            fx.conn
                .update(&[&entries, &fx.pool.entries], |h| {
                    repository::add_local_package_tx(&h[0], &h[1], &fx.ctx.pool_dir(), &repo_dir, pkg, false)
                })
                .unwrap();
        }

        let archive = MockArchive::new();
        let staging = fx.ctx.repo_delta_staging_path("unstable");
        let candidates =
            plan_and_produce(&fx.conn, &fx.pool, &fx.repos, &archive, &staging, "unstable", "nano").unwrap();
        assert_eq!(candidates.len(), 1);

        include_delta(&fx.conn, &fx.pool, &fx.repos, &fx.ctx, &archive, "unstable", &candidates[0]).unwrap();

        assert!(!candidates[0].path.exists());
        let entry = fx.repos.get_entry("unstable", "nano").unwrap();
        assert_eq!(entry.deltas.len(), 1);
    }
}
