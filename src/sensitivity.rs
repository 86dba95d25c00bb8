//! Sensitivity classification stored in the `user.sensitivity` extended attribute.
//! Unclassified entries inherit from their nearest classified ancestor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::acl::AclEngine;
use crate::error::{FsError, FsResult};
use crate::events::SharedSink;
use crate::identity::{ExecutionContext, IdentityMapper};
use crate::lowlevel::{xattrs::SENSITIVITY, LowLevelFs, StatRecord};
use crate::paths;
use crate::types::{AccessRight, FileRow, SensitivityLevel, StorageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensitivityResolution {
    /// Level stored on the entry itself.
    pub own: Option<SensitivityLevel>,
    /// `None` only for dead links.
    pub effective: Option<SensitivityLevel>,
}

/// Effective level per directory, for the duration of one listing, tree walk or diff.
#[derive(Debug, Default)]
pub struct SensitivityCache {
    dirs: HashMap<String, SensitivityLevel>,
}

impl SensitivityCache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.dirs.len() }

    pub fn is_empty(&self) -> bool { self.dirs.is_empty() }
}

pub struct SensitivityEngine {
    fs: Arc<LowLevelFs>,
    acl: Arc<AclEngine>,
    mapper: Arc<dyn IdentityMapper>,
    sink: SharedSink,
}

impl SensitivityEngine {
    pub fn new(fs: Arc<LowLevelFs>, acl: Arc<AclEngine>, mapper: Arc<dyn IdentityMapper>, sink: SharedSink) -> Self {
        Self { fs, acl, mapper, sink }
    }

    pub fn set_sensitivity_level(&self, ctx: &ExecutionContext, path: &str, level: SensitivityLevel) -> FsResult<FileRow> {
        let path = paths::normalize(path)?;
        let rec = self.classifiable(ctx, &path)?;
        self.fs.set_xattr(&path, SENSITIVITY, level.as_str().as_bytes())?;
        info!(target: "storage::sensitivity", "{} classified as {} [corr={}]", path, level, ctx.correlation());
        self.announce(rec, SensitivityResolution { own: Some(level), effective: Some(level) })
    }

    /// Drop the own level so the entry inherits again. Clearing an unclassified entry is fine.
    pub fn clear_sensitivity_level(&self, ctx: &ExecutionContext, path: &str) -> FsResult<FileRow> {
        let path = paths::normalize(path)?;
        let rec = self.classifiable(ctx, &path)?;
        self.fs.remove_xattr(&path, SENSITIVITY)?;
        let resolution = self.resolve_with(&rec, &mut SensitivityCache::new())?;
        info!(target: "storage::sensitivity", "{} classification cleared [corr={}]", path, ctx.correlation());
        self.announce(rec, resolution)
    }

    /// Level stored on `path` itself, without inheritance.
    pub fn own_level(&self, path: &str) -> FsResult<Option<SensitivityLevel>> {
        let Some(raw) = self.fs.get_xattr(path, SENSITIVITY)? else { return Ok(None) };
        let text = String::from_utf8_lossy(&raw);
        match text.parse() {
            Ok(level) => Ok(Some(level)),
            Err(e) => {
                warn!(target: "storage::sensitivity", "ignoring {} on {}: {}", SENSITIVITY, path, e);
                Ok(None)
            }
        }
    }

    pub fn resolve(&self, path: &str) -> FsResult<SensitivityResolution> {
        let path = paths::normalize(path)?;
        let rec = self.fs.stat(&path)?;
        self.resolve_with(&rec, &mut SensitivityCache::new())
    }

    /// Resolve an already stat'ed entry, sharing `cache` with sibling lookups.
    pub fn resolve_with(&self, rec: &StatRecord, cache: &mut SensitivityCache) -> FsResult<SensitivityResolution> {
        if rec.row.is_link() {
            let Some(target) = self.fs.canonical_logical(&rec.row.path)? else {
                return Ok(SensitivityResolution::default());
            };
            let target_rec = self.fs.stat(&target)?;
            let effective = self.resolve_with(&target_rec, cache)?.effective;
            return Ok(SensitivityResolution { own: None, effective });
        }
        let own = self.own_level(&rec.row.path)?;
        let effective = match own {
            Some(level) => level,
            None => self.inherited(&rec.row.path, cache)?,
        };
        if rec.row.is_directory() {
            cache.dirs.entry(rec.row.path.clone()).or_insert(effective);
        }
        Ok(SensitivityResolution { own, effective: Some(effective) })
    }

    /// Effective level `path` would get from its ancestors.
    fn inherited(&self, path: &str, cache: &mut SensitivityCache) -> FsResult<SensitivityLevel> {
        let mut pending = Vec::new();
        let mut cur = paths::parent(path);
        let mut found = SensitivityLevel::DEFAULT;
        while let Some(dir) = cur {
            if let Some(level) = cache.dirs.get(&dir) {
                found = *level;
                break;
            }
            if let Some(level) = self.own_level(&dir)? {
                found = level;
                cache.dirs.insert(dir.clone(), level);
                break;
            }
            cur = paths::parent(&dir);
            pending.push(dir);
        }
        for dir in pending {
            cache.dirs.insert(dir, found);
        }
        Ok(found)
    }

    fn classifiable(&self, ctx: &ExecutionContext, path: &str) -> FsResult<StatRecord> {
        let rec = self.fs.stat(path)?;
        self.acl.require_permission(ctx, path, AccessRight::Write)?;
        if rec.row.is_link() {
            return Err(FsError::bad_request(format!("cannot classify link {}", path)));
        }
        Ok(rec)
    }

    fn announce(&self, rec: StatRecord, resolution: SensitivityResolution) -> FsResult<FileRow> {
        let mut row = rec.row;
        row.own_sensitivity_level = resolution.own;
        row.sensitivity_level = resolution.effective;
        row.creator = self.mapper.reverse_lookup(rec.uid);
        self.sink.emit(StorageEvent::CreatedOrRefreshed { file: row.clone() });
        Ok(row)
    }
}
