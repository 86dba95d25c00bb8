//! Archive import/export. Uploads stream through `CoreFsService` so every created entry
//! is announced like any other write.

use std::io::{self, Read, Write};
use std::path::{Component, Path};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

use crate::core_fs::CoreFsService;
use crate::error::{FsError, FsResult, IoResultExt};
use crate::identity::ExecutionContext;
use crate::paths;
use crate::types::{AccessRight, ArchiveFormat, WriteConflictPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUploadReport {
    /// Logical paths created or replaced, in archive order.
    pub created: Vec<String>,
    /// Archive relative paths that were not extracted.
    pub rejected: Vec<String>,
}

pub struct BulkTransferEngine {
    core: Arc<CoreFsService>,
}

impl BulkTransferEngine {
    pub fn new(core: Arc<CoreFsService>) -> Self {
        Self { core }
    }

    /// Extract `archive` below `target_dir`. Existing directories are reused; the conflict
    /// policy applies to each file entry that collides with an existing entry, exactly as
    /// `write` applies it. Rejected entries are reported and the upload continues.
    pub fn bulk_upload<R: Read>(
        &self,
        ctx: &ExecutionContext,
        target_dir: &str,
        format: ArchiveFormat,
        policy: WriteConflictPolicy,
        archive: R,
    ) -> FsResult<BulkUploadReport> {
        let target = paths::normalize(target_dir)?;
        let fs = self.core.lowlevel();
        let dir = fs.stat(&target)?;
        if !dir.row.is_directory() {
            return Err(FsError::bad_request(format!("{} is not a directory", target)));
        }
        self.core.acl().require_permission(ctx, &target, AccessRight::Write)?;

        let reader: Box<dyn Read + '_> = match format {
            ArchiveFormat::Tgz => Box::new(GzDecoder::new(archive)),
            ArchiveFormat::Tar => Box::new(archive),
        };
        let mut tar = Archive::new(reader);
        let mut report = BulkUploadReport::default();
        let mut rejected_dirs: Vec<String> = Vec::new();

        let entries = tar.entries().map_err(|e| malformed(&e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| malformed(&e))?;
            let raw_path = entry.path().map_err(|e| malformed(&e))?.into_owned();
            let Some(segments) = confined_segments(&raw_path) else {
                debug!(target: "storage::bulk", "skipping entry {:?}", raw_path);
                continue;
            };
            let kind = entry.header().entry_type();
            if !matches!(kind, EntryType::Regular | EntryType::Continuous | EntryType::Directory) {
                debug!(target: "storage::bulk", "skipping {:?} entry {}", kind, segments.join("/"));
                continue;
            }

            let rel = segments.join("/");
            let dest = paths::join(&target, &rel);
            if rejected_dirs.iter().any(|d| paths::is_same_or_descendant(d, &dest)) {
                debug!(target: "storage::bulk", "skipping {} below a rejected directory", rel);
                continue;
            }

            let is_dir = kind == EntryType::Directory;
            let res = if is_dir {
                self.ensure_directory(ctx, &target, &dest).map(|made| made.then(|| dest.clone()))
            } else {
                self.extract_file(ctx, &target, &dest, policy, &mut entry).map(Some)
            };
            match res {
                Ok(Some(created)) => report.created.push(created),
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(target: "storage::bulk", "rejected {}: {} [corr={}]", dest, e, ctx.correlation());
                    if is_dir {
                        rejected_dirs.push(dest);
                    }
                    report.rejected.push(rel);
                }
                Err(e) => return Err(e),
            }
        }

        info!(target: "storage::bulk", "upload into {}: {} created, {} rejected [corr={}]",
            target, report.created.len(), report.rejected.len(), ctx.correlation());
        Ok(report)
    }

    /// Write an archive of `filenames` (relative to `base_dir`) to `out`. Names that do not
    /// exist are skipped. Returns the number of archived entries.
    pub fn download_files<W: Write>(
        &self,
        ctx: &ExecutionContext,
        base_dir: &str,
        filenames: &[String],
        out: W,
        format: ArchiveFormat,
    ) -> FsResult<usize> {
        let base = paths::normalize(base_dir)?;
        let written = match format {
            ArchiveFormat::Tgz => {
                let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
                let n = self.append_all(ctx, &base, filenames, &mut builder)?;
                builder.into_inner().at(&base)?.finish().at(&base)?;
                n
            }
            ArchiveFormat::Tar => {
                let mut builder = Builder::new(out);
                let n = self.append_all(ctx, &base, filenames, &mut builder)?;
                builder.into_inner().at(&base)?;
                n
            }
        };
        info!(target: "storage::bulk", "download from {}: {} entries [corr={}]", base, written, ctx.correlation());
        Ok(written)
    }

    /// Create `dir` and any missing parents below `target`. Existing directories are reused.
    fn ensure_directory(&self, ctx: &ExecutionContext, target: &str, dir: &str) -> FsResult<bool> {
        let fs = self.core.lowlevel();
        if let Some(rec) = fs.stat_or_none(dir)? {
            if rec.row.is_directory() {
                return Ok(false);
            }
            return Err(FsError::already_exists(dir));
        }
        if let Some(parent) = paths::parent(dir) {
            if parent != target && paths::is_same_or_descendant(target, &parent) {
                self.ensure_directory(ctx, target, &parent)?;
            }
        }
        self.core.make_directory(ctx, dir)?;
        Ok(true)
    }

    /// Returns the path actually written, which differs from `dest` under RENAME.
    fn extract_file(
        &self,
        ctx: &ExecutionContext,
        target: &str,
        dest: &str,
        policy: WriteConflictPolicy,
        entry: &mut dyn Read,
    ) -> FsResult<String> {
        if let Some(parent) = paths::parent(dest) {
            if parent != target {
                self.ensure_directory(ctx, target, &parent)?;
            }
        }
        let row = self.core.write(ctx, dest, policy, |w| {
            io::copy(entry, w).at(dest)?;
            Ok(())
        })?;
        Ok(row.path)
    }

    fn append_all<W: Write>(
        &self,
        ctx: &ExecutionContext,
        base: &str,
        filenames: &[String],
        builder: &mut Builder<W>,
    ) -> FsResult<usize> {
        builder.follow_symlinks(false);
        let fs = self.core.lowlevel();
        let mut count = 0;
        for name in filenames {
            let path = paths::normalize(&paths::join(base, name))?;
            if path == base || !paths::is_same_or_descendant(base, &path) {
                debug!(target: "storage::bulk", "skipping {} outside {}", name, base);
                continue;
            }
            if fs.stat_or_none(&path)?.is_none() {
                debug!(target: "storage::bulk", "skipping missing {}", path);
                continue;
            }
            self.core.acl().require_permission(ctx, &path, AccessRight::Read)?;

            for rec in fs.walk(&path, false)? {
                let rel = rec.row.path.strip_prefix(base).unwrap_or(&rec.row.path).trim_start_matches('/').to_string();
                let host = fs.translate(&rec.row.path)?;
                if rec.row.is_link() {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_mtime((rec.row.modified_at / 1000).max(0) as u64);
                    let link_target = rec.row.link_target.clone().unwrap_or_default();
                    builder.append_link(&mut header, &rel, &link_target).at(&rec.row.path)?;
                } else {
                    builder.append_path_with_name(&host, &rel).at(&rec.row.path)?;
                }
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Archive path reduced to plain segments. Leading `/` and `..` can never leave the
/// target directory.
fn confined_segments(raw: &Path) -> Option<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for c in raw.components() {
        match c {
            Component::Normal(s) => out.push(paths::normalize_nfc(s.to_str()?)),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

fn malformed(err: &io::Error) -> FsError {
    FsError::bad_request(format!("malformed archive: {}", err))
}
