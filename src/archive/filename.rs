//! The default `Archive` backend: derives package metadata from the
//! conventional `.eopkg` filename instead of opening the ZIP/XML/tar.xz
//! payload, whose parsing is an out-of-scope external collaborator (see the
//! module doc). Good enough for a package pool that already names every
//! file by convention; a site that needs real metadata extraction swaps in
//! its own `Archive` implementation.

use std::io::Write;
use std::path::{Path, PathBuf};

use xz2::write::XzEncoder;

use crate::archive::{Archive, OpenedPackage, PackageMeta, compute_delta_name, is_delta_possible};
use crate::error::{Error, Result};
use crate::fsutil;

/// Parses `<name>-<version>-<release>-<distributionRelease>-<architecture>.eopkg`,
/// or its delta counterpart `<name>-<fromRelease>-<toRelease>-<distributionRelease>-<architecture>.delta.eopkg`.
pub struct FilenameArchive {
    pub licenses: Vec<String>,
}

impl Default for FilenameArchive {
    fn default() -> Self {
        Self {
            licenses: vec!["GPL-2.0".into()],
        }
    }
}

impl Archive for FilenameArchive {
    fn open_package(&self, path: &Path) -> Result<OpenedPackage> {
        let id = path
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {}", path.display())))?
            .to_string_lossy()
            .to_string();
        let meta = parse_meta(&id, &self.licenses, path)?;
        Ok(OpenedPackage {
            id,
            path: path.to_path_buf(),
            meta,
        })
    }

    fn produce_delta(&self, from: &OpenedPackage, to: &OpenedPackage, out_dir: &Path) -> Result<PathBuf> {
        if !is_delta_possible(&from.meta, &to.meta) {
            return Err(Error::MismatchedDelta);
        }
        let from_hash = fsutil::sha1_hex(&from.path)?;
        let to_hash = fsutil::sha1_hex(&to.path)?;
        if from_hash == to_hash {
            return Err(Error::DeltaPointless);
        }

        fs_err::create_dir_all(out_dir)?;
        let name = compute_delta_name(&from.meta, &to.meta);
        let path = out_dir.join(&name);
        let mut input = fs_err::File::open(&to.path)?;
        let output = fs_err::File::create(&path)?;
        let mut encoder = XzEncoder::new(output, 6);
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(path)
    }
}

fn parse_meta(id: &str, licenses: &[String], path: &Path) -> Result<PackageMeta> {
    let bad = || Error::InvalidArgument(format!("malformed package id: {id}"));

    let (stem, field_count) = if let Some(s) = id.strip_suffix(".delta.eopkg") {
        (s, 5)
    } else if let Some(s) = id.strip_suffix(".eopkg") {
        (s, 5)
    } else {
        return Err(bad());
    };
    let is_delta = id.ends_with(".delta.eopkg");

    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < field_count {
        return Err(bad());
    }

    let architecture = parts[parts.len() - 1].to_string();
    let distribution_release = parts[parts.len() - 2].to_string();
    let release: u32 = parts[parts.len() - 3].parse().map_err(|_| bad())?;
    let name = parts[..parts.len() - 4].join("-");
    let version = if is_delta {
        String::new()
    } else {
        parts[parts.len() - 4].to_string()
    };

    let package_size = path.metadata().map(|m| m.len()).unwrap_or(0);

    Ok(PackageMeta {
        name: name.clone(),
        source_name: name,
        release,
        version,
        distribution_release,
        architecture,
        licenses: licenses.to_vec(),
        runtime_dependencies: vec![],
        install_size: package_size,
        package_size,
        package_hash: String::new(),
        package_uri: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs_err::write(&path, b"payload").unwrap();
        path
    }

    #[test]
    fn parses_plain_package_filename() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "nano-2.7.5-68-1-x86_64.eopkg");
        let opened = FilenameArchive::default().open_package(&path).unwrap();
        assert_eq!(opened.meta.name, "nano");
        assert_eq!(opened.meta.version, "2.7.5");
        assert_eq!(opened.meta.release, 68);
        assert_eq!(opened.meta.distribution_release, "1");
        assert_eq!(opened.meta.architecture, "x86_64");
    }

    #[test]
    fn parses_delta_package_filename() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "nano-68-69-1-x86_64.delta.eopkg");
        let opened = FilenameArchive::default().open_package(&path).unwrap();
        assert_eq!(opened.meta.name, "nano");
        assert_eq!(opened.meta.release, 69);
    }

    #[test]
    fn produce_delta_rejects_identical_payloads() {
        let dir = tempdir().unwrap();
        let a = write(dir.path(), "nano-2.7.5-68-1-x86_64.eopkg");
        let b = write(dir.path(), "nano-2.7.6-69-1-x86_64.eopkg");
        let archive = FilenameArchive::default();
        let from = archive.open_package(&a).unwrap();
        let to = archive.open_package(&b).unwrap();
        let err = archive.produce_delta(&from, &to, dir.path()).unwrap_err();
        assert!(matches!(err, Error::DeltaPointless));
    }
}
