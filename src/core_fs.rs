//! The mutation gateway. Every user visible change goes through `CoreFsService`, which
//! checks access, applies the conflict policy, performs the primitive and emits events.

use std::io::{BufWriter, Read, Write};
use std::sync::Arc;

use tracing::{debug, info};

use crate::acl::AclEngine;
use crate::config::StorageConfig;
use crate::error::{FsError, FsResult, IoResultExt};
use crate::events::SharedSink;
use crate::identity::{ExecutionContext, IdentityMapper};
use crate::indexing::TreeSource;
use crate::lowlevel::{LowLevelFs, RenameOutcome, StatRecord, WriteMode};
use crate::paths;
use crate::sensitivity::{SensitivityCache, SensitivityEngine};
use crate::types::{attrs, AccessRight, AttributeSet, FileAttribute, FileRow, StorageEvent, WriteConflictPolicy};

pub struct CoreFsService {
    fs: Arc<LowLevelFs>,
    acl: Arc<AclEngine>,
    sensitivity: Arc<SensitivityEngine>,
    mapper: Arc<dyn IdentityMapper>,
    sink: SharedSink,
    config: Arc<StorageConfig>,
}

impl CoreFsService {
    pub fn new(config: Arc<StorageConfig>, mapper: Arc<dyn IdentityMapper>, sink: SharedSink) -> FsResult<Self> {
        let fs = Arc::new(LowLevelFs::new(config.clone())?);
        let acl = Arc::new(AclEngine::new(fs.clone(), mapper.clone()));
        let sensitivity = Arc::new(SensitivityEngine::new(fs.clone(), acl.clone(), mapper.clone(), sink.clone()));
        Ok(Self { fs, acl, sensitivity, mapper, sink, config })
    }

    pub fn acl(&self) -> &Arc<AclEngine> { &self.acl }

    pub fn sensitivity(&self) -> &Arc<SensitivityEngine> { &self.sensitivity }

    pub fn lowlevel(&self) -> &Arc<LowLevelFs> { &self.fs }

    pub fn config(&self) -> &Arc<StorageConfig> { &self.config }

    /// Create or replace a regular file; `writer` receives the open file.
    pub fn write<F>(&self, ctx: &ExecutionContext, path: &str, policy: WriteConflictPolicy, writer: F) -> FsResult<FileRow>
    where
        F: FnOnce(&mut dyn Write) -> FsResult<()>,
    {
        let path = paths::normalize(path)?;
        let parent = self.existing_parent(&path)?;
        self.acl.require_permission(ctx, &parent, AccessRight::Write)?;

        let (target, mode) = match (self.fs.stat_or_none(&path)?, policy) {
            (None, _) => (path.clone(), WriteMode::CreateNew),
            (Some(_), WriteConflictPolicy::Reject) => return Err(FsError::already_exists(&path)),
            (Some(rec), WriteConflictPolicy::Overwrite) if rec.row.is_directory() => {
                return Err(FsError::bad_request(format!("cannot overwrite directory {}", path)))
            }
            (Some(rec), WriteConflictPolicy::Overwrite) if rec.row.is_link() => {
                return Err(FsError::bad_request(format!("cannot overwrite link {}", path)))
            }
            (Some(_), WriteConflictPolicy::Overwrite) => (path.clone(), WriteMode::Truncate),
            (Some(_), WriteConflictPolicy::Rename) => (self.free_name(&path)?, WriteMode::CreateNew),
        };

        let file = self.fs.open_write(&target, mode)?;
        let mut out = BufWriter::with_capacity(self.config.copy_buffer_bytes, file);
        let written = writer(&mut out).and_then(|_| out.flush().at(&target));
        if let Err(e) = written {
            drop(out);
            if mode == WriteMode::CreateNew {
                let _ = self.fs.remove(&target);
            }
            return Err(e);
        }
        drop(out);

        let row = self.event_row(&target)?;
        info!(target: "storage::core", "write {} ({} bytes, {:?}) [corr={}]", target, row.size, policy, ctx.correlation());
        self.sink.emit(StorageEvent::CreatedOrRefreshed { file: row.clone() });
        Ok(row)
    }

    pub fn read<F, R>(&self, ctx: &ExecutionContext, path: &str, reader: F) -> FsResult<R>
    where
        F: FnOnce(&mut dyn Read) -> FsResult<R>,
    {
        let requested = paths::normalize(path)?;
        let mut rec = self.fs.stat(&requested)?;
        // links are read through their target, with the target's access rules
        let path = if rec.row.is_link() {
            let target = self.fs.canonical_logical(&requested)?.ok_or_else(|| FsError::not_found(&requested))?;
            rec = self.fs.stat(&target)?;
            target
        } else {
            requested
        };
        self.acl.require_permission(ctx, &path, AccessRight::Read)?;
        if rec.row.is_directory() {
            return Err(FsError::bad_request(format!("{} is a directory", path)));
        }
        let mut file = self.fs.open_read(&path)?;
        reader(&mut file)
    }

    pub fn make_directory(&self, ctx: &ExecutionContext, path: &str) -> FsResult<FileRow> {
        let path = paths::normalize(path)?;
        let parent = self.existing_parent(&path)?;
        self.acl.require_permission(ctx, &parent, AccessRight::Write)?;
        if self.fs.exists(&path)? {
            return Err(FsError::already_exists(&path));
        }
        self.fs.make_dir(&path)?;
        let row = self.event_row(&path)?;
        info!(target: "storage::core", "mkdir {} [corr={}]", path, ctx.correlation());
        self.sink.emit(StorageEvent::CreatedOrRefreshed { file: row.clone() });
        Ok(row)
    }

    /// Rename `from` to `to`. The entry keeps its identity; one `Moved` is emitted for the root.
    pub fn move_path(&self, ctx: &ExecutionContext, from: &str, to: &str, policy: WriteConflictPolicy) -> FsResult<FileRow> {
        let from = paths::normalize(from)?;
        let to = paths::normalize(to)?;
        let source = self.fs.stat(&from)?;
        let from_parent = self.existing_parent(&from)?;
        let to_parent = self.existing_parent(&to)?;
        if from == to {
            return Err(FsError::already_exists(&to));
        }
        if source.row.is_directory() && paths::is_same_or_descendant(&from, &to) {
            return Err(FsError::bad_request(format!("cannot move {} into itself", from)));
        }
        self.acl.require_permission(ctx, &from_parent, AccessRight::Write)?;
        self.acl.require_permission(ctx, &to_parent, AccessRight::Write)?;

        let dest = match (self.fs.stat_or_none(&to)?, policy) {
            (None, _) => to.clone(),
            (Some(_), WriteConflictPolicy::Reject) => return Err(FsError::already_exists(&to)),
            (Some(_), WriteConflictPolicy::Rename) => self.free_name(&to)?,
            (Some(existing), WriteConflictPolicy::Overwrite) => {
                if existing.row.file_type != source.row.file_type {
                    return Err(FsError::bad_request(format!("cannot overwrite {} with a different file type", to)));
                }
                if existing.row.is_directory() {
                    return Err(FsError::bad_request(format!("cannot overwrite directory {}", to)));
                }
                to.clone()
            }
        };

        match self.fs.rename(&from, &dest)? {
            RenameOutcome::Renamed => {
                let row = self.event_row(&dest)?;
                self.sink.emit(StorageEvent::Moved { file: row.clone(), old_path: from.clone() });
                info!(target: "storage::core", "move {} -> {} [corr={}]", from, dest, ctx.correlation());
                Ok(row)
            }
            RenameOutcome::CrossDevice => {
                debug!(target: "storage::core", "cross-device move {} -> {}, copying", from, dest);
                if self.fs.exists(&dest)? {
                    self.fs.remove(&dest)?;
                }
                let created = self.fs.copy_tree(&from, &dest)?;
                self.fs.remove_tree(&from)?;
                let row = self.event_row(&dest)?;
                let mut events = vec![StorageEvent::Moved { file: row.clone(), old_path: from.clone() }];
                let mut cache = SensitivityCache::new();
                for p in created.iter().skip(1) {
                    let rec = self.fs.stat(p)?;
                    events.push(StorageEvent::CreatedOrRefreshed { file: self.decorate(rec, &event_attrs(), &mut cache)? });
                }
                self.sink.emit_all(events);
                info!(target: "storage::core", "move {} -> {} via copy ({} entries) [corr={}]", from, dest, created.len(), ctx.correlation());
                Ok(row)
            }
        }
    }

    /// Recursive duplicate. Links are copied as links.
    pub fn copy(&self, ctx: &ExecutionContext, from: &str, to: &str, policy: WriteConflictPolicy) -> FsResult<FileRow> {
        let from = paths::normalize(from)?;
        let to = paths::normalize(to)?;
        let source = self.fs.stat(&from)?;
        let to_parent = self.existing_parent(&to)?;
        if source.row.is_directory() && from != to && paths::is_same_or_descendant(&from, &to) {
            return Err(FsError::bad_request(format!("cannot copy {} into itself", from)));
        }
        self.acl.require_permission(ctx, &from, AccessRight::Read)?;
        self.acl.require_permission(ctx, &to_parent, AccessRight::Write)?;

        let dest = match (self.fs.stat_or_none(&to)?, policy) {
            (None, _) => to.clone(),
            (Some(_), WriteConflictPolicy::Overwrite) if from == to => {
                debug!(target: "storage::core", "copy onto itself {}, nothing to do", from);
                return self.event_row(&to);
            }
            (Some(_), WriteConflictPolicy::Reject) => return Err(FsError::already_exists(&to)),
            (Some(_), WriteConflictPolicy::Rename) => self.free_name(&to)?,
            (Some(existing), WriteConflictPolicy::Overwrite) => {
                if existing.row.is_directory() {
                    return Err(FsError::bad_request(format!("cannot overwrite directory {}", to)));
                }
                self.fs.remove(&to)?;
                to.clone()
            }
        };

        let created = self.fs.copy_tree(&from, &dest)?;
        let mut cache = SensitivityCache::new();
        let mut events = Vec::with_capacity(created.len());
        for p in &created {
            let rec = self.fs.stat(p)?;
            events.push(StorageEvent::CreatedOrRefreshed { file: self.decorate(rec, &event_attrs(), &mut cache)? });
        }
        let root = match events.first() {
            Some(StorageEvent::CreatedOrRefreshed { file }) => file.clone(),
            _ => self.event_row(&dest)?,
        };
        self.sink.emit_all(events);
        info!(target: "storage::core", "copy {} -> {} ({} entries) [corr={}]", from, dest, created.len(), ctx.correlation());
        Ok(root)
    }

    /// Recursive delete, children first. Returns the number of removed entries.
    pub fn delete(&self, ctx: &ExecutionContext, path: &str) -> FsResult<usize> {
        let path = paths::normalize(path)?;
        let home_base = paths::join(paths::ROOT, &self.config.home_prefix);
        if path == paths::ROOT || path == home_base || self.fs.is_home_root(&path) {
            return Err(FsError::bad_request(format!("cannot delete {}", path)));
        }
        let parent = self.existing_parent(&path)?;
        self.fs.stat(&path)?;
        self.acl.require_permission(ctx, &parent, AccessRight::Write)?;

        let mut removed = 0;
        for rec in self.fs.walk(&path, true)? {
            match self.fs.remove(&rec.row.path) {
                Ok(()) => {}
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
            removed += 1;
            self.sink.emit(StorageEvent::Deleted { id: rec.row.id, path: rec.row.path, owner: rec.row.owner });
        }
        info!(target: "storage::core", "delete {} ({} entries) [corr={}]", path, removed, ctx.correlation());
        Ok(removed)
    }

    pub fn create_symbolic_link(&self, ctx: &ExecutionContext, target: &str, link_path: &str) -> FsResult<FileRow> {
        let target = paths::normalize(target)?;
        let link_path = paths::normalize(link_path)?;
        self.fs.stat(&target)?;
        let parent = self.existing_parent(&link_path)?;
        self.acl.require_permission(ctx, &parent, AccessRight::Write)?;
        if self.fs.exists(&link_path)? {
            return Err(FsError::already_exists(&link_path));
        }
        self.fs.symlink(&target, &link_path)?;
        let row = self.event_row(&link_path)?;
        info!(target: "storage::core", "symlink {} -> {} [corr={}]", link_path, target, ctx.correlation());
        self.sink.emit(StorageEvent::CreatedOrRefreshed { file: row.clone() });
        Ok(row)
    }

    /// Link `path` from the user's favorites directory.
    pub fn create_favorite(&self, ctx: &ExecutionContext, path: &str) -> FsResult<FileRow> {
        let path = paths::normalize(path)?;
        self.fs.stat(&path)?;
        let favorites = self.favorites_dir(ctx);
        if !self.fs.exists(&favorites)? {
            self.make_directory(ctx, &favorites)?;
        }
        let name = self.free_name(&paths::join(&favorites, paths::file_name(&path)))?;
        self.create_symbolic_link(ctx, &path, &name)
    }

    /// Remove every favorite pointing at the same entry as `path`. Returns how many were removed.
    pub fn remove_favorite(&self, ctx: &ExecutionContext, path: &str) -> FsResult<usize> {
        let path = paths::normalize(path)?;
        let favorites = self.favorites_dir(ctx);
        let Some(dir) = self.fs.stat_or_none(&favorites)? else { return Ok(0) };
        if !dir.row.is_directory() {
            return Ok(0);
        }
        self.acl.require_permission(ctx, &favorites, AccessRight::Write)?;

        let direct = paths::parent(&path).as_deref() == Some(favorites.as_str())
            && self.fs.stat_or_none(&path)?.map(|r| r.row.is_link()).unwrap_or(false);
        let target_id = if direct { None } else { self.fs.resolved_id(&path)? };
        if !direct && target_id.is_none() {
            return Ok(0);
        }

        let mut removed = 0;
        for rec in self.fs.list(&favorites)? {
            if !rec.row.is_link() {
                continue;
            }
            let matches = if direct {
                rec.row.path == path
            } else {
                self.fs.resolved_id(&rec.row.path)? == target_id
            };
            if !matches {
                continue;
            }
            self.fs.remove(&rec.row.path)?;
            removed += 1;
            self.sink.emit(StorageEvent::Deleted { id: rec.row.id, path: rec.row.path, owner: rec.row.owner });
        }
        debug!(target: "storage::core", "removed {} favorites of {} [corr={}]", removed, path, ctx.correlation());
        Ok(removed)
    }

    pub fn list_directory(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Vec<FileRow>> {
        let path = paths::normalize(path)?;
        let rec = self.fs.stat(&path)?;
        if !rec.row.is_directory() {
            return Err(FsError::bad_request(format!("{} is not a directory", path)));
        }
        self.acl.require_permission(ctx, &path, AccessRight::Read)?;
        let mut cache = SensitivityCache::new();
        self.fs
            .list(&path)?
            .into_iter()
            .map(|rec| self.decorate(rec, attrs, &mut cache))
            .collect()
    }

    pub fn stat(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<FileRow> {
        let path = paths::normalize(path)?;
        self.stat_or_none(ctx, &path, attrs)?.ok_or_else(|| FsError::not_found(&path))
    }

    pub fn stat_or_none(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Option<FileRow>> {
        let path = paths::normalize(path)?;
        let Some(rec) = self.fs.stat_or_none(&path)? else { return Ok(None) };
        self.acl.require_permission(ctx, &path, AccessRight::Read)?;
        self.decorate(rec, attrs, &mut SensitivityCache::new()).map(Some)
    }

    /// `path` and all descendants, parents first, never following links.
    pub fn tree(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Vec<FileRow>> {
        let path = paths::normalize(path)?;
        self.fs.stat(&path)?;
        self.acl.require_permission(ctx, &path, AccessRight::Read)?;
        let mut cache = SensitivityCache::new();
        self.fs
            .walk(&path, false)?
            .into_iter()
            .map(|rec| self.decorate(rec, attrs, &mut cache))
            .collect()
    }

    pub fn home_directory(&self, ctx: &ExecutionContext) -> String {
        ctx.home_directory()
    }

    /// `path` itself when free, otherwise the first free `stem(n).ext`.
    pub fn find_free_name(&self, ctx: &ExecutionContext, path: &str) -> FsResult<String> {
        let path = paths::normalize(path)?;
        let parent = self.existing_parent(&path)?;
        self.acl.require_permission(ctx, &parent, AccessRight::Read)?;
        self.free_name(&path)
    }

    fn free_name(&self, path: &str) -> FsResult<String> {
        if !self.fs.exists(path)? {
            return Ok(path.to_string());
        }
        let mut n = 1;
        loop {
            let candidate = paths::numbered_candidate(path, n);
            if !self.fs.exists(&candidate)? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn favorites_dir(&self, ctx: &ExecutionContext) -> String {
        paths::join(&ctx.home_directory(), &self.config.favorites_dir)
    }

    /// Parent of `path`, which must exist and be a directory.
    fn existing_parent(&self, path: &str) -> FsResult<String> {
        let parent = paths::parent(path).ok_or_else(|| FsError::bad_request("operation not allowed on root"))?;
        match self.fs.stat_or_none(&parent)? {
            None => Err(FsError::not_found(parent)),
            Some(rec) if !rec.row.is_directory() => Err(FsError::bad_request(format!("{} is not a directory", parent))),
            Some(_) => Ok(parent),
        }
    }

    fn event_row(&self, path: &str) -> FsResult<FileRow> {
        let rec = self.fs.stat(path)?;
        self.decorate(rec, &event_attrs(), &mut SensitivityCache::new())
    }

    fn decorate(&self, rec: StatRecord, wanted: &AttributeSet, cache: &mut SensitivityCache) -> FsResult<FileRow> {
        let resolution = if wanted.contains(&FileAttribute::SensitivityLevel) {
            Some(self.sensitivity.resolve_with(&rec, cache)?)
        } else {
            None
        };
        let mut row = rec.row;
        if let Some(r) = resolution {
            row.own_sensitivity_level = r.own;
            row.sensitivity_level = r.effective;
        }
        if wanted.contains(&FileAttribute::Creator) {
            row.creator = self.mapper.reverse_lookup(rec.uid);
        }
        if wanted.contains(&FileAttribute::Acl) {
            row.acl = Some(self.acl.list_entries(&row.path)?);
        }
        Ok(row)
    }
}

/// Attributes carried by rows inside emitted events.
fn event_attrs() -> AttributeSet {
    attrs(&[FileAttribute::SensitivityLevel, FileAttribute::Creator])
}

impl TreeSource for CoreFsService {
    fn stat_or_none(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Option<FileRow>> {
        CoreFsService::stat_or_none(self, ctx, path, attrs)
    }

    fn list_directory(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Vec<FileRow>> {
        CoreFsService::list_directory(self, ctx, path, attrs)
    }

    fn owner_of(&self, path: &str) -> String {
        self.fs.owner_of(path)
    }
}
