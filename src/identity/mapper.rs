use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Local OS identity a cloud username executes as.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalIdentity {
    pub uid: u32,
    pub gid: u32,
    /// Supplementary groups (project groups the user belongs to).
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl LocalIdentity {
    pub fn new(uid: u32, gid: u32) -> Self { Self { uid, gid, groups: Vec::new() } }

    /// Identity of the running process.
    pub fn current_process() -> Self {
        // SAFETY: geteuid/getegid have no preconditions and cannot fail.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self::new(uid, gid)
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Username <-> local identity translation. The real backend (LDAP/DB) lives outside
/// this crate; absence of a mapping is not an error at this level.
pub trait IdentityMapper: Send + Sync {
    fn lookup(&self, username: &str) -> Option<LocalIdentity>;

    fn reverse_lookup(&self, uid: u32) -> Option<String>;

    /// Local gid of a project group.
    fn lookup_group(&self, _project: &str, _group: &str) -> Option<u32> {
        None
    }

    /// Project group owning `gid`, as (project, group).
    fn reverse_lookup_group(&self, _gid: u32) -> Option<(String, String)> {
        None
    }
}

/// In-memory mapper for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticIdentityMapper {
    users: RwLock<HashMap<String, LocalIdentity>>,
    groups: RwLock<HashMap<(String, String), u32>>,
}

impl StaticIdentityMapper {
    pub fn new() -> Self { Self::default() }

    pub fn add_user(&self, username: &str, uid: u32, gid: u32) -> &Self {
        self.users.write().insert(username.to_string(), LocalIdentity::new(uid, gid));
        self
    }

    pub fn add_group(&self, project: &str, group: &str, gid: u32) -> &Self {
        self.groups.write().insert((project.to_string(), group.to_string()), gid);
        self
    }

    /// Record that `username` is a member of the group with `gid`.
    pub fn add_membership(&self, username: &str, gid: u32) -> &Self {
        if let Some(id) = self.users.write().get_mut(username) {
            if !id.groups.contains(&gid) {
                id.groups.push(gid);
            }
        }
        self
    }
}

impl IdentityMapper for StaticIdentityMapper {
    fn lookup(&self, username: &str) -> Option<LocalIdentity> {
        self.users.read().get(username).cloned()
    }

    fn reverse_lookup(&self, uid: u32) -> Option<String> {
        self.users
            .read()
            .iter()
            .find(|(_, id)| id.uid == uid)
            .map(|(name, _)| name.clone())
    }

    fn lookup_group(&self, project: &str, group: &str) -> Option<u32> {
        self.groups.read().get(&(project.to_string(), group.to_string())).copied()
    }

    fn reverse_lookup_group(&self, gid: u32) -> Option<(String, String)> {
        self.groups.read().iter().find(|(_, g)| **g == gid).map(|(k, _)| k.clone())
    }
}
