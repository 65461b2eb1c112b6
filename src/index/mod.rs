//! The index publisher: turns a repository's current tip view into the four
//! published artefacts (`eopkg-index.xml` + its sha1sum, and the xz-compressed
//! copy + its sha1sum), written with a streaming XML writer and promoted
//! atomically.

use std::collections::{HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use xz2::write::XzEncoder;

use crate::context::Context;
use crate::error::Result;
use crate::fsutil;
use crate::pool::{Pool, PoolEntry};
use crate::repository::{RepoEntry, RepositorySet};
use crate::storage::Connection;

struct DeltaRecord {
    from_release: u32,
    package_uri: String,
    package_size: u64,
    package_hash: String,
}

/// Serialises index publication per repository: one mutex per repository id,
/// held for the whole publish so two concurrent indexers of the same
/// repository never interleave.
pub struct IndexPublisher {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for IndexPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexPublisher {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn repo_lock(&self, repo_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("index lock map poisoned");
        locks.entry(repo_id.to_string()).or_default().clone()
    }

    /// Publish the four artefacts for `repo_id`. Returns the number of
    /// package records written.
    pub fn publish(
        &self,
        _conn: &Connection,
        repos: &RepositorySet,
        pool: &Pool,
        ctx: &Context,
        repo_id: &str,
    ) -> Result<usize> {
        let repo_lock = self.repo_lock(repo_id);
        let _guard = repo_lock.lock().expect("index lock poisoned");

        let assets_dir = ctx.repo_assets_path(repo_id);
        let distribution_raw = read_optional_raw(&assets_dir.join("distribution.xml"))?;
        let components_raw = read_optional_raw(&assets_dir.join("components.xml"))?;
        let groups_raw = read_optional_raw(&assets_dir.join("groups.xml"))?;
        let obsolete_set = resolve_obsolete_set(distribution_raw.as_deref())?;

        let mut names = repos.get_package_names(repo_id)?;
        names.sort();

        let mut tips = Vec::new();
        for name in &names {
            if obsolete_set.contains(name) {
                continue;
            }
            if let Some(parent) = name.strip_suffix("-dbginfo") {
                if obsolete_set.contains(parent) {
                    tracing::warn!(package = %name, parent, "abandoned dbg-info package: parent is obsolete");
                    continue;
                }
            }

            let entry: RepoEntry = repos.get_entry(repo_id, name)?;
            if entry.published.is_empty() {
                continue;
            }
            let published: PoolEntry = pool.get_entry(&entry.published)?;

            if published
                .meta
                .runtime_dependencies
                .iter()
                .any(|dep| obsolete_set.contains(dep))
            {
                tracing::warn!(package = %name, "package depends on an obsolete package, emitting anyway");
            }

            let deltas = collect_deltas(pool, &entry, published.meta.release)?;
            tips.push((entry.published.clone(), published, deltas));
        }
        tips.sort_by(|a, b| a.0.cmp(&b.0));

        let repo_dir = ctx.repo_path(repo_id);
        fs_err::create_dir_all(&repo_dir)?;

        let xml_tmp = repo_dir.join("eopkg-index.xml.tmp");
        let xml_final = repo_dir.join("eopkg-index.xml");
        let sha1_tmp = repo_dir.join("eopkg-index.xml.sha1sum.tmp");
        let sha1_final = repo_dir.join("eopkg-index.xml.sha1sum");
        let xz_tmp = repo_dir.join("eopkg-index.xml.xz.tmp");
        let xz_final = repo_dir.join("eopkg-index.xml.xz");
        let xz_sha1_tmp = repo_dir.join("eopkg-index.xml.xz.sha1sum.tmp");
        let xz_sha1_final = repo_dir.join("eopkg-index.xml.xz.sha1sum");

        let outcome = (|| -> Result<usize> {
            write_index_xml(
                &xml_tmp,
                distribution_raw.as_deref(),
                components_raw.as_deref(),
                groups_raw.as_deref(),
                &tips,
            )?;

            let xml_sha1 = fsutil::sha1_hex(&xml_tmp)?;
            fs_err::write(&sha1_tmp, format!("{xml_sha1}\n"))?;

            compress_xz(&xml_tmp, &xz_tmp)?;
            let xz_sha1 = fsutil::sha1_hex(&xz_tmp)?;
            fs_err::write(&xz_sha1_tmp, format!("{xz_sha1}\n"))?;

            Ok(tips.len())
        })();

        match outcome {
            Ok(count) => {
                promote(&xml_tmp, &xml_final)?;
                promote(&sha1_tmp, &sha1_final)?;
                promote(&xz_tmp, &xz_final)?;
                promote(&xz_sha1_tmp, &xz_sha1_final)?;
                Ok(count)
            }
            Err(err) => {
                for tmp in [&xml_tmp, &sha1_tmp, &xz_tmp, &xz_sha1_tmp] {
                    let _ = fs_err::remove_file(tmp);
                }
                Err(err)
            }
        }
    }
}

fn collect_deltas(pool: &Pool, entry: &RepoEntry, published_release: u32) -> Result<Vec<DeltaRecord>> {
    let mut records = Vec::new();
    for id in &entry.deltas {
        let delta_entry = pool.get_entry(id)?;
        let Some(mapping) = &delta_entry.delta else {
            continue;
        };
        if mapping.to_release != published_release {
            continue;
        }
        records.push(DeltaRecord {
            from_release: mapping.from_release,
            package_uri: delta_entry.meta.package_uri.clone(),
            package_size: delta_entry.meta.package_size,
            package_hash: delta_entry.meta.package_hash.clone(),
        });
    }
    records.sort_by_key(|d| d.from_release);
    Ok(records)
}

pub(crate) fn read_optional_raw(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs_err::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Drops a leading `<?xml ... ?>` declaration so a fragment can be embedded
/// inside another document's own declaration.
fn strip_xml_declaration(raw: &[u8]) -> &[u8] {
    let trimmed = {
        let mut start = 0;
        while start < raw.len() && raw[start].is_ascii_whitespace() {
            start += 1;
        }
        &raw[start..]
    };
    if trimmed.starts_with(b"<?xml") {
        if let Some(pos) = trimmed.windows(2).position(|w| w == b"?>") {
            let rest = &trimmed[pos + 2..];
            let mut start = 0;
            while start < rest.len() && rest[start].is_ascii_whitespace() {
                start += 1;
            }
            return &rest[start..];
        }
    }
    trimmed
}

/// Scans a `distribution.xml` fragment for `<Obsoletes><Package>` entries
/// without building an in-memory document tree.
pub(crate) fn resolve_obsolete_set(distribution_raw: Option<&[u8]>) -> Result<HashSet<String>> {
    let Some(raw) = distribution_raw else {
        return Ok(HashSet::new());
    };

    let mut reader = Reader::from_reader(raw);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_obsoletes = false;
    let mut in_package = false;
    let mut obsoletes = HashSet::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"Obsoletes" => in_obsoletes = true,
            Event::End(e) if e.name().as_ref() == b"Obsoletes" => in_obsoletes = false,
            Event::Start(e) if in_obsoletes && e.name().as_ref() == b"Package" => in_package = true,
            Event::End(e) if e.name().as_ref() == b"Package" => in_package = false,
            Event::Text(t) if in_package => {
                obsoletes.insert(t.unescape()?.into_owned());
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(obsoletes)
}

type XmlWriter = Writer<BufWriter<fs_err::File>>;

fn write_index_xml(
    path: &Path,
    distribution_raw: Option<&[u8]>,
    components_raw: Option<&[u8]>,
    groups_raw: Option<&[u8]>,
    tips: &[(String, PoolEntry, Vec<DeltaRecord>)],
) -> Result<()> {
    let file = fs_err::File::create(path)?;
    let mut writer: XmlWriter = Writer::new_with_indent(BufWriter::new(file), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("PISI")))?;

    if let Some(raw) = distribution_raw {
        write_raw(&mut writer, raw)?;
    }

    for (id, entry, deltas) in tips {
        write_package(&mut writer, id, entry, deltas)?;
    }

    if let Some(raw) = components_raw {
        write_raw(&mut writer, raw)?;
    }
    if let Some(raw) = groups_raw {
        write_raw(&mut writer, raw)?;
    }

    writer.write_event(Event::End(BytesEnd::new("PISI")))?;
    writer.into_inner().flush()?;
    Ok(())
}

fn write_raw(writer: &mut XmlWriter, raw: &[u8]) -> Result<()> {
    writer.get_mut().write_all(strip_xml_declaration(raw))?;
    Ok(())
}

fn write_package(writer: &mut XmlWriter, id: &str, entry: &PoolEntry, deltas: &[DeltaRecord]) -> Result<()> {
    let meta = &entry.meta;
    writer.write_event(Event::Start(BytesStart::new("Package")))?;
    write_text_elem(writer, "Name", &meta.name)?;
    write_text_elem(writer, "PackageID", id)?;
    write_text_elem(writer, "Version", &meta.version)?;
    write_text_elem(writer, "Release", &meta.release.to_string())?;
    write_text_elem(writer, "DistributionRelease", &meta.distribution_release)?;
    write_text_elem(writer, "Architecture", &meta.architecture)?;
    write_text_elem(writer, "InstalledSize", &meta.install_size.to_string())?;
    write_text_elem(writer, "PackageSize", &meta.package_size.to_string())?;
    write_text_elem(writer, "PackageHash", &meta.package_hash)?;
    write_text_elem(writer, "PackageURI", &meta.package_uri)?;

    if !meta.licenses.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("LicenseList")))?;
        for lic in &meta.licenses {
            write_text_elem(writer, "License", lic)?;
        }
        writer.write_event(Event::End(BytesEnd::new("LicenseList")))?;
    }

    if !meta.runtime_dependencies.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("RuntimeDependencies")))?;
        for dep in &meta.runtime_dependencies {
            write_text_elem(writer, "Dependency", dep)?;
        }
        writer.write_event(Event::End(BytesEnd::new("RuntimeDependencies")))?;
    }

    for delta in deltas {
        writer.write_event(Event::Start(BytesStart::new("Delta")))?;
        write_text_elem(writer, "ReleaseFrom", &delta.from_release.to_string())?;
        write_text_elem(writer, "PackageURI", &delta.package_uri)?;
        write_text_elem(writer, "PackageSize", &delta.package_size.to_string())?;
        write_text_elem(writer, "PackageHash", &delta.package_hash)?;
        writer.write_event(Event::End(BytesEnd::new("Delta")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Package")))?;
    Ok(())
}

fn write_text_elem(writer: &mut XmlWriter, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn compress_xz(src: &Path, dst: &Path) -> Result<()> {
    let mut input = fs_err::File::open(src)?;
    let output = fs_err::File::create(dst)?;
    let mut encoder = XzEncoder::new(output, 6);
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

/// Unlink `dst` if present, then rename `src` into its place. Unlinking
/// first keeps file descriptors held by readers of the previous generation
/// valid after this call.
fn promote(src: &Path, dst: &Path) -> Result<()> {
    match fs_err::remove_file(dst) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs_err::rename(src, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{OpenedPackage, PackageMeta};
    use crate::storage::Database;
    use tempfile::tempdir;

    fn meta(name: &str, release: u32) -> PackageMeta {
        PackageMeta {
            name: name.to_string(),
            source_name: name.to_string(),
            release,
            version: format!("1.{release}"),
            distribution_release: "1".into(),
            architecture: "x86_64".into(),
            licenses: vec!["GPL-3.0".into()],
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
        conn.update(&[&repos.repos], |h| {
            crate::repository::create_repo_tx(&h[0], "unstable")
        })
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
    fn publish_emits_one_package_with_highest_release() {
        let fx = fixture();
        let entries = fx.repos.entries_handle("unstable").unwrap();
        let repo_dir = fx.ctx.repo_path("unstable");
        let old = opened(fx._dir.path(), "nano", 68);
        let new = opened(fx._dir.path(), "nano", 69);

        for pkg in [&old, &new] {
            fx.conn
                .update(&[&entries, &fx.pool.entries], |h| {
                    crate::repository::add_local_package_tx(&h[0], &h[1], &fx.ctx.pool_dir(), &repo_dir, pkg, false)
                })
                .unwrap();
        }

        let publisher = IndexPublisher::new();
        let count = publisher
            .publish(&fx.conn, &fx.repos, &fx.pool, &fx.ctx, "unstable")
            .unwrap();
        assert_eq!(count, 1);

        let xml = fs_err::read_to_string(repo_dir.join("eopkg-index.xml")).unwrap();
        assert!(xml.contains(&new.id));
        assert!(!xml.contains(&old.id));
        assert!(repo_dir.join("eopkg-index.xml.sha1sum").exists());
        assert!(repo_dir.join("eopkg-index.xml.xz").exists());
        assert!(repo_dir.join("eopkg-index.xml.xz.sha1sum").exists());
    }

    #[test]
    fn publish_is_idempotent() {
        let fx = fixture();
        let entries = fx.repos.entries_handle("unstable").unwrap();
        let repo_dir = fx.ctx.repo_path("unstable");
        let pkg = opened(fx._dir.path(), "nano", 68);
        fx.conn
            .update(&[&entries, &fx.pool.entries], |h| {
                crate::repository::add_local_package_tx(&h[0], &h[1], &fx.ctx.pool_dir(), &repo_dir, &pkg, false)
            })
            .unwrap();

        let publisher = IndexPublisher::new();
        publisher
            .publish(&fx.conn, &fx.repos, &fx.pool, &fx.ctx, "unstable")
            .unwrap();
        let first = fs_err::read(repo_dir.join("eopkg-index.xml")).unwrap();
        publisher
            .publish(&fx.conn, &fx.repos, &fx.pool, &fx.ctx, "unstable")
            .unwrap();
        let second = fs_err::read(repo_dir.join("eopkg-index.xml")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn obsolete_base_name_is_excluded() {
        let fx = fixture();
        let entries = fx.repos.entries_handle("unstable").unwrap();
        let repo_dir = fx.ctx.repo_path("unstable");
        let pkg = opened(fx._dir.path(), "nano", 68);
        fx.conn
            .update(&[&entries, &fx.pool.entries], |h| {
                crate::repository::add_local_package_tx(&h[0], &h[1], &fx.ctx.pool_dir(), &repo_dir, &pkg, false)
            })
            .unwrap();

        fs_err::write(
            fx.ctx.repo_assets_path("unstable").join("distribution.xml"),
            "<Distribution><Obsoletes><Package>nano</Package></Obsoletes></Distribution>",
        )
        .unwrap();

        let publisher = IndexPublisher::new();
        let count = publisher
            .publish(&fx.conn, &fx.repos, &fx.pool, &fx.ctx, "unstable")
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn resolve_obsolete_set_parses_package_list() {
        let xml = b"<Distribution><Obsoletes><Package>a</Package><Package>b</Package></Obsoletes></Distribution>";
        let set = resolve_obsolete_set(Some(xml)).unwrap();
        assert!(set.contains("a"));
        assert!(set.contains("b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn strip_xml_declaration_drops_prolog() {
        let raw = b"<?xml version=\"1.0\"?>\n<Distribution/>";
        assert_eq!(strip_xml_declaration(raw), b"<Distribution/>");
    }
}
