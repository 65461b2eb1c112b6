//! A fake `Archive` that derives package metadata from the conventional
//! fixture filename (`<name>-<release>-<distributionRelease>-<architecture>.eopkg`,
//! or its `.delta.eopkg` counterpart) instead of reading any real archive
//! format.

use std::path::{Path, PathBuf};

use crate::archive::{Archive, OpenedPackage, PackageMeta, compute_delta_name, is_delta_possible};
use crate::error::{Error, Result};

pub struct MockArchive {
    pub licenses: Vec<String>,
}

impl Default for MockArchive {
    fn default() -> Self {
        Self {
            licenses: vec!["GPL-3.0".into()],
        }
    }
}

impl Archive for MockArchive {
    fn open_package(&self, path: &Path) -> Result<OpenedPackage> {
        let id = path
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {}", path.display())))?
            .to_string_lossy()
            .to_string();
        let meta = parse_meta(&id, &self.licenses)?;
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
        if !from.meta.package_hash.is_empty() && from.meta.package_hash == to.meta.package_hash {
            return Err(Error::DeltaPointless);
        }
        fs_err::create_dir_all(out_dir)?;
        let name = compute_delta_name(&from.meta, &to.meta);
        let path = out_dir.join(&name);
        fs_err::write(&path, format!("delta {} -> {}", from.id, to.id))?;
        Ok(path)
    }
}

fn parse_meta(id: &str, licenses: &[String]) -> Result<PackageMeta> {
    let bad = || Error::InvalidArgument(format!("malformed fixture package id: {id}"));

    let (stem, trailing_fixed) = if let Some(s) = id.strip_suffix(".delta.eopkg") {
        (s, 4)
    } else if let Some(s) = id.strip_suffix(".eopkg") {
        (s, 3)
    } else {
        return Err(bad());
    };

    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() <= trailing_fixed {
        return Err(bad());
    }

    let architecture = parts[parts.len() - 1].to_string();
    let distribution_release = parts[parts.len() - 2].to_string();
    let release_field = parts.len() - 3;
    let release: u32 = parts[release_field].parse().map_err(|_| bad())?;
    let name = parts[..parts.len() - trailing_fixed].join("-");

    Ok(PackageMeta {
        name: name.clone(),
        source_name: name,
        release,
        version: format!("1.{release}"),
        distribution_release,
        architecture,
        licenses: licenses.to_vec(),
        runtime_dependencies: vec![],
        install_size: 1024,
        package_size: 512,
        package_hash: String::new(),
        package_uri: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_package_id() {
        let meta = parse_meta("nano-68-1-x86_64.eopkg", &[]).unwrap();
        assert_eq!(meta.name, "nano");
        assert_eq!(meta.release, 68);
        assert_eq!(meta.distribution_release, "1");
        assert_eq!(meta.architecture, "x86_64");
    }

    #[test]
    fn parses_delta_package_id() {
        let meta = parse_meta("nano-68-69-1-x86_64.delta.eopkg", &[]).unwrap();
        assert_eq!(meta.name, "nano");
        assert_eq!(meta.release, 69);
    }
}
