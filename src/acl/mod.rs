//! Access rights persisted as native POSIX ACLs, plus the access check every
//! CoreFS operation runs first.

pub mod posix;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::identity::{ExecutionContext, IdentityMapper};
use crate::lowlevel::{LowLevelFs, StatRecord};
use crate::paths;
use crate::types::{AccessRight, AclEntity, AclEntry};

use posix::{PosixAcl, Tag, UNDEFINED_ID, XATTR_ACCESS, XATTR_DEFAULT};

/// Which ACL entry an edit addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Principal {
    Named(Tag, u32),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Set(u16),
    /// Add bits to whatever the entry already grants.
    Union(u16),
    Remove,
}

pub struct AclEngine {
    fs: Arc<LowLevelFs>,
    mapper: Arc<dyn IdentityMapper>,
}

impl AclEngine {
    pub fn new(fs: Arc<LowLevelFs>, mapper: Arc<dyn IdentityMapper>) -> Self {
        Self { fs, mapper }
    }

    /// Add or replace the entry for `entity` on `path`.
    pub fn create_entry(
        &self,
        ctx: &ExecutionContext,
        entity: &AclEntity,
        path: &str,
        rights: &BTreeSet<AccessRight>,
        default_list: bool,
        recursive: bool,
    ) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.require_acl_owner(ctx, &path)?;
        let principal = self.principal(entity)?;
        let bits = AccessRight::to_bits(rights);
        self.transaction(|snap| self.edit(&path, principal, default_list, recursive, Edit::Set(bits), snap))?;
        debug!(target: "storage::acl", "entry {} {:?} on {} default={} recursive={} [corr={}]",
            entity, rights, path, default_list, recursive, ctx.correlation());
        Ok(())
    }

    pub fn remove_entry(
        &self,
        ctx: &ExecutionContext,
        entity: &AclEntity,
        path: &str,
        default_list: bool,
        recursive: bool,
    ) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.require_acl_owner(ctx, &path)?;
        let principal = self.principal(entity)?;
        self.transaction(|snap| self.edit(&path, principal, default_list, recursive, Edit::Remove, snap))?;
        debug!(target: "storage::acl", "removed {} from {} default={} recursive={} [corr={}]",
            entity, path, default_list, recursive, ctx.correlation());
        Ok(())
    }

    /// Share `path` with `entity`: traversal rights on every ancestor below `/home`,
    /// then `rights` on the whole subtree for both the effective and the default list.
    pub fn grant(&self, ctx: &ExecutionContext, entity: &AclEntity, path: &str, rights: &BTreeSet<AccessRight>) -> FsResult<()> {
        let path = paths::normalize(path)?;
        if path == paths::ROOT {
            return Err(FsError::bad_request("cannot grant rights on root"));
        }
        self.require_acl_owner(ctx, &path)?;
        let principal = self.principal(entity)?;
        let bits = AccessRight::to_bits(rights);
        let ancestors = self.share_ancestors(&path);

        self.transaction(|snap| {
            for dir in &ancestors {
                self.edit(dir, principal, false, false, Edit::Union(AccessRight::Execute.bit()), snap)?;
            }
            self.edit(&path, principal, true, true, Edit::Set(bits), snap)?;
            self.edit(&path, principal, false, true, Edit::Set(bits), snap)
        })?;
        info!(target: "storage::acl", "granted {:?} on {} to {} [corr={}]", rights, path, entity, ctx.correlation());
        Ok(())
    }

    /// Undo a grant on `path`. Traversal entries on ancestors are left in place.
    pub fn revoke(&self, ctx: &ExecutionContext, entity: &AclEntity, path: &str) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.require_acl_owner(ctx, &path)?;
        let principal = self.principal(entity)?;
        self.transaction(|snap| {
            self.edit(&path, principal, true, true, Edit::Remove, snap)?;
            self.edit(&path, principal, false, true, Edit::Remove, snap)
        })?;
        info!(target: "storage::acl", "revoked {} on {} [corr={}]", entity, path, ctx.correlation());
        Ok(())
    }

    /// Grant READ to everyone (the POSIX `other` class) on the subtree at `path`.
    pub fn mark_as_open_access(&self, ctx: &ExecutionContext, path: &str) -> FsResult<()> {
        let path = paths::normalize(path)?;
        if path == paths::ROOT {
            return Err(FsError::bad_request("cannot grant rights on root"));
        }
        self.require_acl_owner(ctx, &path)?;
        let ancestors = self.share_ancestors(&path);
        let read = AccessRight::Read.bit();

        self.transaction(|snap| {
            for dir in &ancestors {
                self.edit(dir, Principal::Other, false, false, Edit::Union(AccessRight::Execute.bit()), snap)?;
            }
            self.edit(&path, Principal::Other, true, true, Edit::Union(read), snap)?;
            self.edit(&path, Principal::Other, false, true, Edit::Union(read), snap)
        })?;
        info!(target: "storage::acl", "marked {} as open access [corr={}]", path, ctx.correlation());
        Ok(())
    }

    /// Named entries of the access and default lists, translated back to entities.
    /// Ids without a mapping are left out.
    pub fn list_entries(&self, path: &str) -> FsResult<Vec<AclEntry>> {
        let path = paths::normalize(path)?;
        let rec = self.fs.stat(&path)?;
        if rec.row.is_link() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (name, default) in [(XATTR_ACCESS, false), (XATTR_DEFAULT, true)] {
            let Some(raw) = self.fs.get_xattr(&path, name)? else { continue };
            let acl = PosixAcl::decode(&raw)?;
            for e in acl.entries() {
                let entity = match e.tag {
                    Tag::User => self.mapper.reverse_lookup(e.id).map(AclEntity::user),
                    Tag::Group => self.mapper.reverse_lookup_group(e.id).map(|(p, g)| AclEntity::group(p, g)),
                    _ => continue,
                };
                match entity {
                    Some(entity) => out.push(AclEntry { entity, rights: AccessRight::from_bits(e.perm), default }),
                    None => debug!(target: "storage::acl", "no mapping for {:?} id {} on {}", e.tag, e.id, path),
                }
            }
        }
        Ok(out)
    }

    pub fn require_permission(&self, ctx: &ExecutionContext, path: &str, right: AccessRight) -> FsResult<()> {
        if self.has_permission(ctx, path, right)? {
            Ok(())
        } else {
            debug!(target: "storage::acl", "{} denied {:?} on {} [corr={}]", ctx.user(), right, path, ctx.correlation());
            Err(FsError::permission(path))
        }
    }

    /// Service contexts and a user's own home tree always pass; everything else goes
    /// through the POSIX check on the nearest existing entry.
    pub fn has_permission(&self, ctx: &ExecutionContext, path: &str, right: AccessRight) -> FsResult<bool> {
        if ctx.is_service() {
            return Ok(true);
        }
        let path = paths::normalize(path)?;
        if paths::is_same_or_descendant(&ctx.home_directory(), &path) {
            return Ok(true);
        }
        let rec = self.nearest_existing(&path)?;
        let acl = self.load(&rec, false)?;
        let id = ctx.identity();
        Ok(acl.permits(id.uid, |g| id.in_group(g), rec.uid, rec.gid, right.bit()))
    }

    /// Only the service user or the owner of the tree may change its ACLs.
    fn require_acl_owner(&self, ctx: &ExecutionContext, path: &str) -> FsResult<()> {
        if ctx.is_service() || paths::is_same_or_descendant(&ctx.home_directory(), path) {
            return Ok(());
        }
        let rec = self.nearest_existing(path)?;
        if rec.uid == ctx.identity().uid {
            return Ok(());
        }
        Err(FsError::permission(path))
    }

    fn principal(&self, entity: &AclEntity) -> FsResult<Principal> {
        let resolved = match entity {
            AclEntity::User { username } => self.mapper.lookup(username).map(|id| Principal::Named(Tag::User, id.uid)),
            AclEntity::ProjectGroup { project, group } => {
                self.mapper.lookup_group(project, group).map(|gid| Principal::Named(Tag::Group, gid))
            }
        };
        resolved.ok_or_else(|| FsError::NoIdentityMapping(entity.to_string()))
    }

    fn share_ancestors(&self, path: &str) -> Vec<String> {
        let home = format!("/{}", self.fs.config().home_prefix);
        paths::parents(path).into_iter().filter(|p| p != paths::ROOT && *p != home).collect()
    }

    fn nearest_existing(&self, path: &str) -> FsResult<StatRecord> {
        let mut cur = path.to_string();
        loop {
            if let Some(rec) = self.fs.stat_or_none(&cur)? {
                if !rec.row.is_link() {
                    return Ok(rec);
                }
                if let Some(target) = self.fs.canonical_logical(&cur)? {
                    return self.fs.stat(&target);
                }
            }
            match paths::parent(&cur) {
                Some(p) => cur = p,
                None => return self.fs.stat(paths::ROOT),
            }
        }
    }

    fn load(&self, rec: &StatRecord, default_list: bool) -> FsResult<PosixAcl> {
        let name = if default_list { XATTR_DEFAULT } else { XATTR_ACCESS };
        match self.fs.get_xattr(&rec.row.path, name)? {
            Some(raw) => PosixAcl::decode(&raw),
            None => Ok(PosixAcl::from_mode(rec.mode)),
        }
    }

    fn store(&self, rec: &StatRecord, default_list: bool, mut acl: PosixAcl, drop_plain: bool) -> FsResult<()> {
        acl.recompute_mask();
        let path = &rec.row.path;
        if default_list {
            if !acl.has_named() && drop_plain {
                return self.fs.remove_xattr(path, XATTR_DEFAULT);
            }
            return self.fs.set_xattr(path, XATTR_DEFAULT, &acl.encode());
        }
        if acl.has_named() {
            self.fs.set_xattr(path, XATTR_ACCESS, &acl.encode())
        } else {
            // a plain ACL is just the mode
            self.fs.remove_xattr(path, XATTR_ACCESS)?;
            self.fs.set_mode(path, acl.apply_to_mode(rec.mode))
        }
    }

    fn edit(&self, path: &str, principal: Principal, default_list: bool, recursive: bool, edit: Edit, snap: &mut AclSnapshot) -> FsResult<()> {
        let targets = if recursive { self.fs.walk(path, false)? } else { vec![self.fs.stat(path)?] };
        for rec in targets {
            if rec.row.is_link() || (default_list && !rec.row.is_directory()) {
                continue;
            }
            snap.capture(&self.fs, &rec)?;
            let mut acl = self.load(&rec, default_list)?;
            apply(&mut acl, principal, edit);
            self.store(&rec, default_list, acl, edit == Edit::Remove)?;
        }
        Ok(())
    }

    /// Run `f`; on failure restore every ACL it touched before returning the error.
    fn transaction(&self, f: impl FnOnce(&mut AclSnapshot) -> FsResult<()>) -> FsResult<()> {
        let mut snap = AclSnapshot::default();
        match f(&mut snap) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(target: "storage::acl", "acl change failed, restoring {} entries: {}", snap.len(), e);
                snap.restore(&self.fs);
                Err(e)
            }
        }
    }
}

fn apply(acl: &mut PosixAcl, principal: Principal, edit: Edit) {
    let (tag, id) = match principal {
        Principal::Named(tag, id) => (tag, id),
        Principal::Other => (Tag::Other, UNDEFINED_ID),
    };
    match edit {
        Edit::Set(bits) => acl.set(tag, id, bits),
        Edit::Union(bits) => {
            let cur = acl.get(tag, id).unwrap_or(0);
            acl.set(tag, id, cur | bits);
        }
        Edit::Remove if tag == Tag::Other => acl.set(tag, id, 0),
        Edit::Remove => {
            acl.remove(tag, id);
        }
    }
}

struct SavedAcl {
    path: String,
    access: Option<Vec<u8>>,
    default: Option<Vec<u8>>,
    mode: u32,
}

#[derive(Default)]
struct AclSnapshot {
    saved: Vec<SavedAcl>,
    seen: HashSet<String>,
}

impl AclSnapshot {
    fn len(&self) -> usize { self.saved.len() }

    fn capture(&mut self, fs: &LowLevelFs, rec: &StatRecord) -> FsResult<()> {
        if !self.seen.insert(rec.row.path.clone()) {
            return Ok(());
        }
        self.saved.push(SavedAcl {
            path: rec.row.path.clone(),
            access: fs.get_xattr(&rec.row.path, XATTR_ACCESS)?,
            default: fs.get_xattr(&rec.row.path, XATTR_DEFAULT)?,
            mode: rec.mode,
        });
        Ok(())
    }

    fn restore(self, fs: &LowLevelFs) {
        for s in self.saved.into_iter().rev() {
            let res = restore_one(fs, &s.path, XATTR_ACCESS, s.access.as_deref())
                .and_then(|_| restore_one(fs, &s.path, XATTR_DEFAULT, s.default.as_deref()))
                .and_then(|_| fs.set_mode(&s.path, s.mode));
            if let Err(e) = res {
                warn!(target: "storage::acl", "failed to restore acl on {}: {}", s.path, e);
            }
        }
    }
}

fn restore_one(fs: &LowLevelFs, path: &str, name: &str, value: Option<&[u8]>) -> FsResult<()> {
    match value {
        Some(v) => fs.set_xattr(path, name, v),
        None => fs.remove_xattr(path, name),
    }
}

#[cfg(test)]
mod acl_tests;
