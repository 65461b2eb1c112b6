//! Process-scoped configuration derived from a base directory.

use std::path::{Path, PathBuf};

/// Paths and filenames the engine derives from a single base directory.
///
/// Constructing a `Context` does not touch the filesystem; call
/// [`Context::ensure_dirs`] once at startup to create the directory tree.
#[derive(Debug, Clone)]
pub struct Context {
    pub base_dir: PathBuf,
}

impl Context {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.base_dir.join("pool")
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.base_dir.join("repo")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.base_dir.join("assets")
    }

    pub fn delta_builds_dir(&self) -> PathBuf {
        self.base_dir.join("deltaBuilds")
    }

    pub fn delta_staging_dir(&self) -> PathBuf {
        self.base_dir.join("deltaStaging")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.base_dir.join("incoming")
    }

    pub fn main_db_path(&self) -> PathBuf {
        self.base_dir.join("silo.db")
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.base_dir.join("silo-jobs.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("silo.lock")
    }

    pub fn repo_path(&self, repo_id: &str) -> PathBuf {
        self.repo_dir().join(repo_id)
    }

    pub fn repo_assets_path(&self, repo_id: &str) -> PathBuf {
        self.assets_dir().join(repo_id)
    }

    pub fn repo_delta_builds_path(&self, repo_id: &str) -> PathBuf {
        self.delta_builds_dir().join(repo_id)
    }

    pub fn repo_delta_staging_path(&self, repo_id: &str) -> PathBuf {
        self.delta_staging_dir().join(repo_id)
    }

    /// Create the top-level directory tree. Idempotent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.pool_dir(),
            self.repo_dir(),
            self.assets_dir(),
            self.delta_builds_dir(),
            self.delta_staging_dir(),
            self.incoming_dir(),
        ] {
            fs_err::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Create the four per-repository directories.
    pub fn ensure_repo_dirs(&self, repo_id: &str) -> std::io::Result<()> {
        for dir in [
            self.repo_path(repo_id),
            self.repo_assets_path(repo_id),
            self.repo_delta_builds_path(repo_id),
            self.repo_delta_staging_path(repo_id),
        ] {
            fs_err::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Remove the four per-repository directories. Never fails if they are
    /// already gone.
    pub fn remove_repo_dirs(&self, repo_id: &str) -> std::io::Result<()> {
        for dir in [
            self.repo_path(repo_id),
            self.repo_assets_path(repo_id),
            self.repo_delta_builds_path(repo_id),
            self.repo_delta_staging_path(repo_id),
        ] {
            match fs_err::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Compute the two-level pool path component for a source package name, per
/// the layout rule in §3: lower-case the name; `lib`-prefixed names (longer
/// than 3 chars) get a 4-char fragment, everything else gets a 1-char one.
pub fn path_component(source_name: &str) -> String {
    let lower = source_name.to_lowercase();
    let fragment_len = if lower.starts_with("lib") && lower.len() > 3 {
        4
    } else {
        1
    };
    let fragment: String = lower.chars().take(fragment_len).collect();
    format!("{fragment}/{lower}")
}

/// Full path to a package file inside the pool.
pub fn pool_file_path(base_dir: &Path, source_name: &str, id: &str) -> PathBuf {
    base_dir
        .join("pool")
        .join(path_component(source_name))
        .join(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_component_short_name() {
        assert_eq!(path_component("Nano"), "n/nano");
    }

    #[test]
    fn path_component_lib_prefixed() {
        assert_eq!(path_component("libpng"), "libp/libpng");
    }

    #[test]
    fn path_component_lib_too_short() {
        // "lib" itself is not longer than 3 chars, so it falls back to the
        // one-char rule.
        assert_eq!(path_component("lib"), "l/lib");
    }
}
