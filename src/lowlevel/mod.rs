//! Host filesystem primitives. Everything here speaks logical paths at the edge and
//! host paths inside; no access control happens at this layer.

pub mod host_path;
pub mod xattrs;

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::StorageConfig;
use crate::error::{FsError, FsResult, IoResultExt};
use crate::paths;
use crate::types::{FileRow, FileType};

/// Cheap facts about one entry, from a single `lstat`.
#[derive(Debug, Clone)]
pub struct StatRecord {
    pub row: FileRow,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits (`mode & 0o7777`).
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    /// The primitive refused because source and destination are on different devices.
    CrossDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    CreateNew,
    Truncate,
}

pub struct LowLevelFs {
    root: PathBuf,
    config: Arc<StorageConfig>,
}

impl LowLevelFs {
    pub fn new(config: Arc<StorageConfig>) -> FsResult<Self> {
        let root = host_path::resolve_root(&config.fs_root)?;
        debug!(target: "storage::core", "storage root {}", root.display());
        Ok(Self { root, config })
    }

    pub fn config(&self) -> &StorageConfig { &self.config }

    /// Translate a logical path to its host path. Only the last component may be a link;
    /// a link anywhere above it is refused with `PermissionDenied`.
    pub fn translate(&self, logical: &str) -> FsResult<PathBuf> {
        let normalized = paths::normalize(logical)?;
        let comps = paths::components(&normalized);
        let mut host = self.root.clone();
        for seg in &comps {
            host.push(seg);
        }
        if host.as_os_str().len() > self.config.path_max {
            return Err(FsError::bad_request(format!("path too long: {}", normalized)));
        }

        let mut prefix = self.root.clone();
        for seg in comps.iter().take(comps.len().saturating_sub(1)) {
            prefix.push(seg);
            match fs::symlink_metadata(&prefix) {
                Ok(m) if m.file_type().is_symlink() => {
                    debug!(target: "storage::core", "refusing {}: {} is a link", normalized, prefix.display());
                    return Err(FsError::permission(&normalized));
                }
                Ok(_) => {}
                // nothing below a missing component can exist
                Err(e) if is_dangling(&e) => break,
                Err(e) => return Err(FsError::from_io(&e, &normalized)),
            }
        }
        Ok(host)
    }

    pub fn to_logical(&self, host: &Path) -> Option<String> {
        host_path::to_logical(&self.root, host)
    }

    /// Owner derived from the path: `/home/<user>` and `/projects/<id>`, else the service user.
    pub fn owner_of(&self, logical: &str) -> String {
        let comps = paths::components(logical);
        match comps.as_slice() {
            [prefix, name, ..] if *prefix == self.config.home_prefix || *prefix == self.config.projects_prefix => {
                name.to_string()
            }
            _ => self.config.service_user.clone(),
        }
    }

    /// Home root (`/home/<user>`) if `logical` is exactly one.
    pub fn is_home_root(&self, logical: &str) -> bool {
        let comps = paths::components(logical);
        comps.len() == 2 && comps[0] == self.config.home_prefix
    }

    pub fn stat(&self, logical: &str) -> FsResult<StatRecord> {
        let host = self.translate(logical)?;
        let meta = fs::symlink_metadata(&host).at(logical)?;
        self.record(logical, &host, &meta)
    }

    pub fn stat_or_none(&self, logical: &str) -> FsResult<Option<StatRecord>> {
        match self.stat(logical) {
            Ok(s) => Ok(Some(s)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, logical: &str) -> FsResult<bool> {
        Ok(self.stat_or_none(logical)?.is_some())
    }

    /// Inode of the entry after following every link, `None` if missing or dangling.
    pub fn resolved_id(&self, logical: &str) -> FsResult<Option<String>> {
        let host = self.translate(logical)?;
        match fs::metadata(&host) {
            Ok(m) => Ok(Some(m.ino().to_string())),
            Err(e) if is_dangling(&e) => Ok(None),
            Err(e) => Err(FsError::from_io(&e, logical)),
        }
    }

    /// Fully dereferenced logical path, `None` if dangling or outside the root.
    pub fn canonical_logical(&self, logical: &str) -> FsResult<Option<String>> {
        let host = self.translate(logical)?;
        match fs::canonicalize(&host) {
            Ok(p) => Ok(self.to_logical(&p)),
            Err(e) if is_dangling(&e) => Ok(None),
            Err(e) => Err(FsError::from_io(&e, logical)),
        }
    }

    /// Direct children, sorted by name. Entries that vanish while listing are skipped.
    pub fn list(&self, logical: &str) -> FsResult<Vec<StatRecord>> {
        let host = self.translate(logical)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&host).at(logical)? {
            let entry = entry.at(logical)?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(target: "storage::core", "skipping non UTF-8 entry {:?} in {}", raw, logical),
            }
        }
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let child = paths::join(logical, &name);
            if let Some(rec) = self.stat_or_none(&child)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// `logical` and every descendant, never following links. Parents come before children
    /// unless `contents_first` is set.
    pub fn walk(&self, logical: &str, contents_first: bool) -> FsResult<Vec<StatRecord>> {
        let host = self.translate(logical)?;
        fs::symlink_metadata(&host).at(logical)?;
        let mut out = Vec::new();
        let walker = WalkDir::new(&host)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name()
            .contents_first(contents_first);
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let gone = e.io_error().map(|io| io.kind() == io::ErrorKind::NotFound).unwrap_or(false);
                    if gone {
                        continue;
                    }
                    let at = e.path().and_then(|p| self.to_logical(p)).unwrap_or_else(|| logical.to_string());
                    return Err(match e.into_io_error() {
                        Some(io) => FsError::from_io(&io, &at),
                        None => FsError::critical(format!("{}: filesystem loop", at)),
                    });
                }
            };
            let Some(child) = self.to_logical(entry.path()) else { continue };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            out.push(self.record(&child, entry.path(), &meta)?);
        }
        Ok(out)
    }

    pub fn make_dir(&self, logical: &str) -> FsResult<()> {
        debug!(target: "storage::core", "mkdir {}", logical);
        fs::create_dir(self.translate(logical)?).at(logical)
    }

    /// Open a regular file for writing. A link in the last component is never followed.
    pub fn open_write(&self, logical: &str, mode: WriteMode) -> FsResult<File> {
        let host = self.translate(logical)?;
        let mut opts = OpenOptions::new();
        opts.write(true).custom_flags(libc::O_NOFOLLOW);
        match mode {
            WriteMode::CreateNew => opts.create_new(true),
            WriteMode::Truncate => opts.truncate(true),
        };
        match opts.open(&host) {
            Ok(f) => Ok(f),
            Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
                Err(FsError::bad_request(format!("{} is a link", logical)))
            }
            Err(e) => Err(FsError::from_io(&e, logical)),
        }
    }

    pub fn open_read(&self, logical: &str) -> FsResult<File> {
        File::open(self.translate(logical)?).at(logical)
    }

    pub fn rename(&self, from: &str, to: &str) -> FsResult<RenameOutcome> {
        debug!(target: "storage::core", "rename {} -> {}", from, to);
        match fs::rename(self.translate(from)?, self.translate(to)?) {
            Ok(()) => Ok(RenameOutcome::Renamed),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => Ok(RenameOutcome::CrossDevice),
            Err(e) => Err(FsError::from_io(&e, from)),
        }
    }

    /// Create `link` pointing at the host path of `target`.
    pub fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        debug!(target: "storage::core", "symlink {} -> {}", link, target);
        std::os::unix::fs::symlink(self.translate(target)?, self.translate(link)?).at(link)
    }

    /// Remove one entry (an empty directory, a file or a link).
    pub fn remove(&self, logical: &str) -> FsResult<()> {
        let host = self.translate(logical)?;
        let meta = fs::symlink_metadata(&host).at(logical)?;
        if meta.is_dir() {
            fs::remove_dir(&host).at(logical)
        } else {
            fs::remove_file(&host).at(logical)
        }
    }

    /// Recursively remove without reporting; used for cleanup after cross-device moves.
    pub fn remove_tree(&self, logical: &str) -> FsResult<()> {
        for rec in self.walk(logical, true)? {
            match self.remove(&rec.row.path) {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Duplicate `from` as `to`. Links are recreated with their raw target and never followed.
    /// Returns the created logical paths, root first.
    pub fn copy_tree(&self, from: &str, to: &str) -> FsResult<Vec<String>> {
        let src_root = self.translate(from)?;
        let dst_root = self.translate(to)?;
        fs::symlink_metadata(&src_root).at(from)?;
        let mut created = Vec::new();
        for entry in WalkDir::new(&src_root).follow_links(false).follow_root_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.io_error().map(|io| io.kind() == io::ErrorKind::NotFound).unwrap_or(false) => continue,
                Err(e) => return Err(FsError::critical(format!("{}: {}", from, e))),
            };
            let rel = entry.path().strip_prefix(&src_root).unwrap_or(Path::new(""));
            let dst = if rel.as_os_str().is_empty() { dst_root.clone() } else { dst_root.join(rel) };
            let Some(dst_logical) = self.to_logical(&dst) else { continue };
            if dst.as_os_str().len() > self.config.path_max {
                return Err(FsError::bad_request(format!("path too long: {}", dst_logical)));
            }
            let ft = entry.file_type();
            if ft.is_dir() {
                fs::create_dir(&dst).at(&dst_logical)?;
            } else if ft.is_symlink() {
                let raw = fs::read_link(entry.path()).at(&dst_logical)?;
                std::os::unix::fs::symlink(&raw, &dst).at(&dst_logical)?;
            } else if ft.is_file() {
                match self.copy_file(entry.path(), &dst, &dst_logical) {
                    Ok(()) => {}
                    Err(FsError::NotFound(p)) if p != dst_logical => continue,
                    Err(e) => return Err(e),
                }
            } else {
                debug!(target: "storage::core", "skipping special file {}", entry.path().display());
                continue;
            }
            created.push(dst_logical);
        }
        Ok(created)
    }

    fn copy_file(&self, src: &Path, dst: &Path, dst_logical: &str) -> FsResult<()> {
        let src_logical = self.to_logical(src).unwrap_or_default();
        let input = File::open(src).at(&src_logical)?;
        let perms = input.metadata().at(&src_logical)?.permissions();
        let output = OpenOptions::new().write(true).create(true).truncate(true).open(dst).at(dst_logical)?;
        let mut reader = BufReader::with_capacity(self.config.copy_buffer_bytes, input);
        let mut writer = BufWriter::with_capacity(self.config.copy_buffer_bytes, output);
        io::copy(&mut reader, &mut writer).at(dst_logical)?;
        writer.flush().at(dst_logical)?;
        fs::set_permissions(dst, perms).at(dst_logical)
    }

    pub fn set_mode(&self, logical: &str, mode: u32) -> FsResult<()> {
        let host = self.translate(logical)?;
        fs::set_permissions(&host, fs::Permissions::from_mode(mode & 0o7777)).at(logical)
    }

    pub fn get_xattr(&self, logical: &str, name: &str) -> FsResult<Option<Vec<u8>>> {
        xattrs::get(&self.translate(logical)?, name, logical)
    }

    pub fn set_xattr(&self, logical: &str, name: &str, value: &[u8]) -> FsResult<()> {
        xattrs::set(&self.translate(logical)?, name, value, logical)
    }

    pub fn remove_xattr(&self, logical: &str, name: &str) -> FsResult<()> {
        xattrs::remove(&self.translate(logical)?, name, logical)
    }

    fn record(&self, logical: &str, host: &Path, meta: &Metadata) -> FsResult<StatRecord> {
        let ft = meta.file_type();
        let file_type = if ft.is_symlink() {
            FileType::Link
        } else if ft.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };

        let (link_target, link_dead) = if ft.is_symlink() {
            let raw = fs::read_link(host).at(logical)?;
            let target = host_path::resolve_link_target(host, &raw);
            let dead = fs::metadata(host).is_err();
            (self.to_logical(&target), dead)
        } else {
            (None, false)
        };

        let modified_at = epoch_ms(meta.modified()).unwrap_or(0);
        let created_at = epoch_ms(meta.created()).unwrap_or(modified_at);

        let row = FileRow {
            id: meta.ino().to_string(),
            path: logical.to_string(),
            file_type,
            owner: self.owner_of(logical),
            size: meta.len(),
            created_at,
            modified_at,
            link_target,
            link_dead,
            own_sensitivity_level: None,
            sensitivity_level: None,
            creator: None,
            acl: None,
        };
        Ok(StatRecord { row, uid: meta.uid(), gid: meta.gid(), mode: meta.mode() & 0o7777 })
    }
}

fn is_dangling(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || matches!(err.raw_os_error(), Some(libc::ENOTDIR) | Some(libc::ELOOP))
}

fn epoch_ms(t: io::Result<SystemTime>) -> Option<i64> {
    t.ok().map(|t| DateTime::<Utc>::from(t).timestamp_millis())
}
