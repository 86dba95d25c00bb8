//! Linux POSIX ACL extended attribute layout (version 2).
//!
//! ```text
//! u32 version (= 2)
//! repeated { u16 tag, u16 perm, u32 id }   little endian, sorted by (tag, id)
//! ```
//! `USER_OBJ`, `GROUP_OBJ` and `OTHER` are always present; `MASK` is present whenever
//! named entries are.

use crate::error::{FsError, FsResult};

pub const XATTR_ACCESS: &str = "system.posix_acl_access";
pub const XATTR_DEFAULT: &str = "system.posix_acl_default";

pub const VERSION: u32 = 2;
/// Id stored for the template entries.
pub const UNDEFINED_ID: u32 = u32::MAX;

const HEADER_LEN: usize = 4;
const ENTRY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Tag {
    UserObj = 0x01,
    User = 0x02,
    GroupObj = 0x04,
    Group = 0x08,
    Mask = 0x10,
    Other = 0x20,
}

impl Tag {
    fn from_u16(v: u16) -> Option<Tag> {
        Some(match v {
            0x01 => Tag::UserObj,
            0x02 => Tag::User,
            0x04 => Tag::GroupObj,
            0x08 => Tag::Group,
            0x10 => Tag::Mask,
            0x20 => Tag::Other,
            _ => return None,
        })
    }

    pub fn is_named(&self) -> bool { matches!(self, Tag::User | Tag::Group) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixAclEntry {
    pub tag: Tag,
    pub perm: u16,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PosixAcl {
    entries: Vec<PosixAclEntry>,
}

impl PosixAcl {
    /// The minimal ACL equivalent to the permission bits of `mode`.
    pub fn from_mode(mode: u32) -> Self {
        let bits = |shift: u32| ((mode >> shift) & 0o7) as u16;
        let mut acl = PosixAcl::default();
        acl.set(Tag::UserObj, UNDEFINED_ID, bits(6));
        acl.set(Tag::GroupObj, UNDEFINED_ID, bits(3));
        acl.set(Tag::Other, UNDEFINED_ID, bits(0));
        acl
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        if bytes.len() < HEADER_LEN || (bytes.len() - HEADER_LEN) % ENTRY_LEN != 0 {
            return Err(FsError::critical(format!("malformed ACL xattr ({} bytes)", bytes.len())));
        }
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != VERSION {
            return Err(FsError::critical(format!("unsupported ACL xattr version {}", version)));
        }
        let mut acl = PosixAcl::default();
        for chunk in bytes[HEADER_LEN..].chunks_exact(ENTRY_LEN) {
            let raw_tag = u16::from_le_bytes([chunk[0], chunk[1]]);
            let perm = u16::from_le_bytes([chunk[2], chunk[3]]);
            let id = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            let tag = Tag::from_u16(raw_tag)
                .ok_or_else(|| FsError::critical(format!("unknown ACL tag 0x{:02x}", raw_tag)))?;
            let id = if tag.is_named() { id } else { UNDEFINED_ID };
            acl.set(tag, id, perm & 0o7);
        }
        Ok(acl)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.entries.len() * ENTRY_LEN);
        out.extend_from_slice(&VERSION.to_le_bytes());
        for e in &self.entries {
            out.extend_from_slice(&(e.tag as u16).to_le_bytes());
            out.extend_from_slice(&e.perm.to_le_bytes());
            out.extend_from_slice(&e.id.to_le_bytes());
        }
        out
    }

    pub fn entries(&self) -> &[PosixAclEntry] { &self.entries }

    pub fn get(&self, tag: Tag, id: u32) -> Option<u16> {
        self.entries.iter().find(|e| e.tag == tag && e.id == id).map(|e| e.perm)
    }

    /// Insert or replace, keeping the (tag, id) order.
    pub fn set(&mut self, tag: Tag, id: u32, perm: u16) {
        let id = if tag.is_named() { id } else { UNDEFINED_ID };
        match self.entries.binary_search_by(|e| (e.tag, e.id).cmp(&(tag, id))) {
            Ok(idx) => self.entries[idx].perm = perm & 0o7,
            Err(idx) => self.entries.insert(idx, PosixAclEntry { tag, perm: perm & 0o7, id }),
        }
    }

    pub fn remove(&mut self, tag: Tag, id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.tag == tag && e.id == id));
        before != self.entries.len()
    }

    pub fn has_named(&self) -> bool { self.entries.iter().any(|e| e.tag.is_named()) }

    /// Set `MASK` to the union of the group class, or drop it when nothing is named.
    pub fn recompute_mask(&mut self) {
        if !self.has_named() {
            self.remove(Tag::Mask, UNDEFINED_ID);
            return;
        }
        let union = self
            .entries
            .iter()
            .filter(|e| matches!(e.tag, Tag::User | Tag::GroupObj | Tag::Group))
            .fold(0, |acc, e| acc | e.perm);
        self.set(Tag::Mask, UNDEFINED_ID, union);
    }

    /// Permission bits of the base entries folded back into a mode, keeping the high bits.
    pub fn apply_to_mode(&self, mode: u32) -> u32 {
        let perm = |tag| self.get(tag, UNDEFINED_ID).unwrap_or(0) as u32;
        let group = if self.has_named() {
            self.get(Tag::Mask, UNDEFINED_ID).map(u32::from).unwrap_or_else(|| perm(Tag::GroupObj))
        } else {
            perm(Tag::GroupObj)
        };
        (mode & !0o777) | (perm(Tag::UserObj) << 6) | (group << 3) | perm(Tag::Other)
    }

    /// POSIX access check for a caller with `uid` and membership predicate `in_group`
    /// against an entry owned by `owner_uid:owner_gid`.
    pub fn permits(
        &self,
        uid: u32,
        in_group: impl Fn(u32) -> bool,
        owner_uid: u32,
        owner_gid: u32,
        wanted: u16,
    ) -> bool {
        let granted = |perm: u16| perm & wanted == wanted;
        if uid == owner_uid {
            return granted(self.get(Tag::UserObj, UNDEFINED_ID).unwrap_or(0));
        }
        let mask = self.get(Tag::Mask, UNDEFINED_ID).unwrap_or(0o7);
        if let Some(perm) = self.get(Tag::User, uid) {
            return granted(perm & mask);
        }

        let mut matched_group = false;
        for e in &self.entries {
            let member = match e.tag {
                Tag::GroupObj => in_group(owner_gid),
                Tag::Group => in_group(e.id),
                _ => false,
            };
            if member {
                matched_group = true;
                if granted(e.perm & mask) {
                    return true;
                }
            }
        }
        if matched_group {
            return false;
        }
        granted(self.get(Tag::Other, UNDEFINED_ID).unwrap_or(0))
    }
}
