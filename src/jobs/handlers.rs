//! Maps a claimed `(kind, params)` job onto the engine operation it names.
//! `JobKind` is a closed Rust enum, so there is no "unknown kind" path here -
//! only per-kind argument shape validation, which fails with
//! `Error::InvalidArgument`.

use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{JobKind, JobRecord, Queue};
use crate::archive::DeltaMapping;
use crate::delta::{self, DeltaCandidate};
use crate::error::{Error, Result};
use crate::index;
use crate::manager::Engine;
use crate::repository;

/// Run the handler body for `record` against `engine`. Called from inside a
/// `spawn_blocking` closure by the scheduler; every body here is synchronous.
pub fn dispatch(engine: &Engine, record: &JobRecord) -> Result<()> {
    let params = record.params.as_slice();
    match record.kind {
        JobKind::CreateRepo => create_repo(engine, params),
        JobKind::DeleteRepo => delete_repo(engine, params),
        JobKind::BulkAdd => bulk_add(engine, params),
        JobKind::Delta => delta_job(engine, params),
        JobKind::DeltaRepo => delta_repo(engine, params),
        JobKind::IncludeDelta => include_delta(engine, params),
        JobKind::IndexRepo => index_repo(engine, params),
        JobKind::TransitProcess => transit_process(engine, params),
        JobKind::CloneRepo => clone_repo(engine, params),
        JobKind::PullRepo => pull_repo(engine, params),
        JobKind::CopySource => copy_source(engine, params),
        JobKind::RemoveSource => remove_source(engine, params),
        JobKind::TrimPackages => trim_packages(engine, params),
        JobKind::TrimObsolete => trim_obsolete(engine, params),
    }
}

fn bad_shape(kind: &str, params: &[String]) -> Error {
    Error::InvalidArgument(format!("{kind}: malformed params {params:?}"))
}

fn parse_u32(kind: &str, params: &[String], value: &str) -> Result<u32> {
    value.parse().map_err(|_| bad_shape(kind, params))
}

fn parse_usize(kind: &str, params: &[String], value: &str) -> Result<usize> {
    value.parse().map_err(|_| bad_shape(kind, params))
}

fn parse_bool(kind: &str, params: &[String], value: &str) -> Result<bool> {
    value.parse().map_err(|_| bad_shape(kind, params))
}

fn create_repo(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id] = params else {
        return Err(bad_shape("CreateRepo", params));
    };
    engine
        .conn
        .update(&[&engine.repos.repos], |h| repository::create_repo_tx(&h[0], repo_id))?;
    engine.ctx.ensure_repo_dirs(repo_id)?;
    Ok(())
}

fn delete_repo(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id] = params else {
        return Err(bad_shape("DeleteRepo", params));
    };
    let entries = engine.repos.entries_handle(repo_id)?;
    engine
        .conn
        .update(&[&engine.repos.repos, &entries, &engine.pool.entries], |h| {
            repository::delete_repo_tx(&h[0], &h[1], &h[2], &engine.ctx.pool_dir(), repo_id)
        })?;
    engine.repos.forget(repo_id);
    engine.ctx.remove_repo_dirs(repo_id)?;
    Ok(())
}

fn bulk_add(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, paths @ ..] = params else {
        return Err(bad_shape("BulkAdd", params));
    };
    import_paths(engine, repo_id, paths)?;
    engine
        .jobs
        .enqueue(JobKind::IndexRepo, vec![repo_id.to_string()])?;
    Ok(())
}

/// Opens and transactionally adds every path in `paths` to `repo_id` in one
/// write transaction. Shared by `BulkAdd` and `TransitProcess`.
fn import_paths(engine: &Engine, repo_id: &str, paths: &[String]) -> Result<Vec<String>> {
    let entries = engine.repos.entries_handle(repo_id)?;
    let repo_dir = engine.ctx.repo_path(repo_id);
    let pool_dir = engine.ctx.pool_dir();

    let opened: Vec<_> = paths
        .iter()
        .map(|path| engine.archive.open_package(Path::new(path)))
        .collect::<Result<_>>()?;

    let base_names = engine.conn.update(&[&entries, &engine.pool.entries], |h| {
        let mut names = Vec::with_capacity(opened.len());
        for pkg in &opened {
            repository::add_local_package_tx(&h[0], &h[1], &pool_dir, &repo_dir, pkg, false)?;
            names.push(pkg.meta.name.clone());
        }
        Ok(names)
    })?;

    Ok(base_names)
}

fn delta_job(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, base_name] = params else {
        return Err(bad_shape("Delta", params));
    };
    let staging = engine.ctx.repo_delta_staging_path(repo_id);
    let candidates = delta::plan_and_produce(
        &engine.conn,
        &engine.pool,
        &engine.repos,
        engine.archive.as_ref(),
        &staging,
        repo_id,
        base_name,
    )?;
    for candidate in candidates {
        engine
            .jobs
            .enqueue(JobKind::IncludeDelta, encode_include_delta(repo_id, &candidate))?;
    }
    Ok(())
}

fn encode_include_delta(repo_id: &str, candidate: &DeltaCandidate) -> Vec<String> {
    vec![
        repo_id.to_string(),
        candidate.path.display().to_string(),
        candidate.mapping.from_id.clone(),
        candidate.mapping.to_id.clone(),
        candidate.mapping.from_release.to_string(),
        candidate.mapping.to_release.to_string(),
    ]
}

fn delta_repo(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id] = params else {
        return Err(bad_shape("DeltaRepo", params));
    };
    for name in engine.repos.get_package_names(repo_id)? {
        engine
            .jobs
            .enqueue(JobKind::Delta, vec![repo_id.to_string(), name])?;
    }
    Ok(())
}

fn include_delta(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, path, from_id, to_id, from_release, to_release] = params else {
        return Err(bad_shape("IncludeDelta", params));
    };
    let mapping = DeltaMapping {
        from_id: from_id.clone(),
        to_id: to_id.clone(),
        from_release: parse_u32("IncludeDelta", params, from_release)?,
        to_release: parse_u32("IncludeDelta", params, to_release)?,
    };
    let candidate = DeltaCandidate {
        path: path.into(),
        mapping,
        delta_name: String::new(),
    };
    delta::include_delta(
        &engine.conn,
        &engine.pool,
        &engine.repos,
        &engine.ctx,
        engine.archive.as_ref(),
        repo_id,
        &candidate,
    )
}

fn index_repo(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id] = params else {
        return Err(bad_shape("IndexRepo", params));
    };
    engine
        .index
        .publish(&engine.conn, &engine.repos, &engine.pool, &engine.ctx, repo_id)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TransitManifest {
    repo_id: String,
    entries: Vec<TransitEntry>,
}

#[derive(Debug, Deserialize)]
struct TransitEntry {
    path: String,
    sha256: String,
}

fn transit_process(engine: &Engine, params: &[String]) -> Result<()> {
    let [manifest_path] = params else {
        return Err(bad_shape("TransitProcess", params));
    };
    let raw = fs_err::read(manifest_path)?;
    let manifest: TransitManifest =
        serde_json::from_slice(&raw).map_err(|err| Error::InvalidArgument(format!("transit manifest: {err}")))?;

    for entry in &manifest.entries {
        let digest = sha256_hex(Path::new(&entry.path))?;
        if !digest.eq_ignore_ascii_case(&entry.sha256) {
            return Err(Error::InvalidArgument(format!(
                "transit manifest: {} sha256 mismatch: expected {}, got {digest}",
                entry.path, entry.sha256
            )));
        }
    }

    let paths: Vec<String> = manifest.entries.iter().map(|e| e.path.clone()).collect();
    let base_names = import_paths(engine, &manifest.repo_id, &paths)?;

    let mut seen = std::collections::HashSet::new();
    for name in base_names {
        if seen.insert(name.clone()) {
            engine
                .jobs
                .enqueue(JobKind::Delta, vec![manifest.repo_id.clone(), name])?;
        }
    }

    for entry in &manifest.entries {
        match fs_err::remove_file(&entry.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn sha256_hex(path: &Path) -> Result<String> {
    let bytes = fs_err::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn clone_repo(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, clone_name, copy_all] = params else {
        return Err(bad_shape("CloneRepo", params));
    };
    let copy_all = parse_bool("CloneRepo", params, copy_all)?;

    engine
        .conn
        .update(&[&engine.repos.repos], |h| repository::create_repo_tx(&h[0], clone_name))?;
    engine.ctx.ensure_repo_dirs(clone_name)?;

    let source_entries = engine.repos.entries_handle(repo_id)?;
    let target_entries = engine.repos.entries_handle(clone_name)?;
    engine.conn.update(
        &[&source_entries, &target_entries, &engine.pool.entries],
        |h| repository::clone_entries_tx(&h[0], &h[1], &h[2], copy_all),
    )?;

    engine
        .jobs
        .enqueue(JobKind::IndexRepo, vec![clone_name.to_string()])?;
    Ok(())
}

fn pull_repo(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, source_id] = params else {
        return Err(bad_shape("PullRepo", params));
    };
    let source_entries = engine.repos.entries_handle(source_id)?;
    let target_entries = engine.repos.entries_handle(repo_id)?;
    engine.conn.update(
        &[&source_entries, &target_entries, &engine.pool.entries],
        |h| repository::pull_entries_tx(&h[0], &h[1], &h[2]),
    )?;

    engine
        .jobs
        .enqueue(JobKind::IndexRepo, vec![repo_id.to_string()])?;
    Ok(())
}

fn copy_source(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, target, source, release] = params else {
        return Err(bad_shape("CopySource", params));
    };
    let release = parse_u32("CopySource", params, release)?;

    let source_entries = engine.repos.entries_handle(repo_id)?;
    let target_entries = engine.repos.entries_handle(target)?;
    engine.conn.update(
        &[&source_entries, &target_entries, &engine.pool.entries],
        |h| repository::copy_source_tx(&h[0], &h[1], &h[2], source, release),
    )?;

    engine.jobs.enqueue(JobKind::IndexRepo, vec![target.to_string()])?;
    Ok(())
}

fn remove_source(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, source, release] = params else {
        return Err(bad_shape("RemoveSource", params));
    };
    let release = parse_u32("RemoveSource", params, release)?;

    let entries = engine.repos.entries_handle(repo_id)?;
    engine.conn.update(&[&entries, &engine.pool.entries], |h| {
        repository::remove_source_tx(&h[0], &h[1], &engine.ctx.pool_dir(), source, release)
    })?;

    engine
        .jobs
        .enqueue(JobKind::IndexRepo, vec![repo_id.to_string()])?;
    Ok(())
}

fn trim_packages(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id, max_packages] = params else {
        return Err(bad_shape("TrimPackages", params));
    };
    let max_packages = parse_usize("TrimPackages", params, max_packages)?;

    let entries = engine.repos.entries_handle(repo_id)?;
    engine.conn.update(&[&entries, &engine.pool.entries], |h| {
        repository::trim_packages_tx(&h[0], &h[1], &engine.ctx.pool_dir(), max_packages)
    })?;

    engine
        .jobs
        .enqueue(JobKind::IndexRepo, vec![repo_id.to_string()])?;
    Ok(())
}

fn trim_obsolete(engine: &Engine, params: &[String]) -> Result<()> {
    let [repo_id] = params else {
        return Err(bad_shape("TrimObsolete", params));
    };
    let assets_dir = engine.ctx.repo_assets_path(repo_id);
    let distribution_raw = index::read_optional_raw(&assets_dir.join("distribution.xml"))?;
    let obsolete_set = index::resolve_obsolete_set(distribution_raw.as_deref())?;

    let entries = engine.repos.entries_handle(repo_id)?;
    engine.conn.update(&[&entries, &engine.pool.entries], |h| {
        repository::trim_obsolete_tx(&h[0], &h[1], &engine.ctx.pool_dir(), &obsolete_set)
    })?;

    engine
        .jobs
        .enqueue(JobKind::IndexRepo, vec![repo_id.to_string()])?;
    Ok(())
}
