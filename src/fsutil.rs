//! Small filesystem helpers shared by the pool and repository set: linking a
//! file into place with a copy fallback, and pruning empty parent
//! directories after a file is removed.

use std::path::Path;

use sha1::{Digest, Sha1};

/// Hard-link `src` to `dst`, falling back to a plain copy when linking fails
/// (e.g. `EXDEV` across filesystems) or when `force_copy` is set. Creates any
/// missing parent directories of `dst` first.
pub fn link_or_copy(src: &Path, dst: &Path, force_copy: bool) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs_err::create_dir_all(parent)?;
    }
    if !force_copy {
        match fs_err::hard_link(src, dst) {
            Ok(()) => return Ok(()),
            Err(_) => { /* fall through to copy */ }
        }
    }
    fs_err::copy(src, dst)?;
    Ok(())
}

/// Compute the hex-encoded SHA-1 of a file's contents.
pub fn sha1_hex(path: &Path) -> std::io::Result<String> {
    let mut file = fs_err::File::open(path)?;
    let mut hasher = Sha1::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Remove `file`, then walk upward from its parent removing empty
/// directories, stopping after `levels` directories or at `stop_at`
/// (exclusive), whichever comes first. Used to prune the two-level pool
/// path component once a package's last reference disappears.
pub fn remove_file_and_prune_parents(
    file: &Path,
    levels: usize,
    stop_at: &Path,
) -> std::io::Result<()> {
    match fs_err::remove_file(file) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut dir = file.parent();
    for _ in 0..levels {
        let Some(d) = dir else { break };
        if d == stop_at {
            break;
        }
        let is_empty = match fs_err::read_dir(d) {
            Ok(mut entries) => entries.next().is_none(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err),
        };
        if !is_empty {
            break;
        }
        match fs_err::remove_dir(d) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        dir = d.parent();
    }
    Ok(())
}
