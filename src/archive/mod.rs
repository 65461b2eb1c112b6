//! The external `.eopkg` archive reader/writer, reached only through this
//! trait. A `.eopkg` is a ZIP with an XML metadata member and an
//! xz-compressed tar payload; this crate never parses that format directly,
//! only its interface is described here.

pub mod filename;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use filename::FilenameArchive;

/// The archive's metadata record for one package file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMeta {
    /// Base package name, e.g. `nano`.
    pub name: String,
    /// Upstream source project name, used only for the pool path component.
    pub source_name: String,
    /// Monotonically increasing release number assigned by the distribution.
    pub release: u32,
    pub version: String,
    pub distribution_release: String,
    pub architecture: String,
    pub licenses: Vec<String>,
    pub runtime_dependencies: Vec<String>,
    pub install_size: u64,
    pub package_size: u64,
    /// Hex-encoded SHA-1 of the package file.
    pub package_hash: String,
    /// Relative `<path-component>/<id>`, filled in once the file is placed
    /// in the pool.
    pub package_uri: String,
}

/// Identifies one side of a delta relationship. Embedded in a delta
/// `PoolEntry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMapping {
    pub from_id: String,
    pub to_id: String,
    pub from_release: u32,
    pub to_release: u32,
}

/// A package file that has been opened and had its metadata read.
#[derive(Debug, Clone)]
pub struct OpenedPackage {
    /// The archive filename, e.g. `nano-2.7.5-68-1-x86_64.eopkg`.
    pub id: String,
    pub path: PathBuf,
    pub meta: PackageMeta,
}

/// The interface this crate needs from the `.eopkg` archive library.
pub trait Archive: Send + Sync {
    /// Open a package file on disk and read its id + metadata.
    fn open_package(&self, path: &Path) -> Result<OpenedPackage>;

    /// Read just the metadata, without keeping the file open.
    fn read_metadata(&self, path: &Path) -> Result<PackageMeta> {
        Ok(self.open_package(path)?.meta)
    }

    /// Produce a delta archive from `from` to `to` in `out_dir`, returning
    /// the path to the produced file. Returns `Error::DeltaPointless` if no
    /// file differs, `Error::MismatchedDelta` if the two packages are
    /// incompatible per [`is_delta_possible`].
    fn produce_delta(
        &self,
        from: &OpenedPackage,
        to: &OpenedPackage,
        out_dir: &Path,
    ) -> Result<PathBuf>;
}

/// `a.release < b.release ∧ a.name == b.name ∧ a.distribution_release ==
/// b.distribution_release ∧ a.architecture == b.architecture`.
///
/// The source-repository name is intentionally not compared: a delta only
/// depends on the two packages' own metadata.
pub fn is_delta_possible(a: &PackageMeta, b: &PackageMeta) -> bool {
    a.release < b.release
        && a.name == b.name
        && a.distribution_release == b.distribution_release
        && a.architecture == b.architecture
}

/// `<b.name>-<a.release>-<b.release>-<b.distribution_release>-<b.architecture>.delta.eopkg`
pub fn compute_delta_name(a: &PackageMeta, b: &PackageMeta) -> String {
    format!(
        "{}-{}-{}-{}-{}.delta.eopkg",
        b.name, a.release, b.release, b.distribution_release, b.architecture
    )
}
