use super::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use crate::config::StorageConfig;
use crate::identity::{ContextFactory, StaticIdentityMapper};
use crate::types::AccessRight::{Execute, Read, Write};

struct Fixture {
    dir: tempfile::TempDir,
    fs: Arc<LowLevelFs>,
    acl: AclEngine,
    contexts: ContextFactory,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    for d in ["home/alice/share/sub", "projects/p1"] {
        fs::create_dir_all(dir.path().join(d)).unwrap();
    }
    fs::write(dir.path().join("home/alice/share/file.txt"), b"data").unwrap();
    fs::write(dir.path().join("projects/p1/report.txt"), b"r").unwrap();

    let mapper = StaticIdentityMapper::new();
    mapper.add_user("alice", 1001, 1001).add_user("bob", 4242, 4242).add_group("p1", "staff", 5000);
    mapper.add_membership("bob", 5000);
    let mapper: Arc<dyn IdentityMapper> = Arc::new(mapper);
    let config = Arc::new(StorageConfig::with_root(dir.path()));
    let fs = Arc::new(LowLevelFs::new(config.clone()).unwrap());
    Fixture { acl: AclEngine::new(fs.clone(), mapper.clone()), contexts: ContextFactory::new(mapper, config), fs, dir }
}

fn rights(list: &[AccessRight]) -> BTreeSet<AccessRight> { list.iter().copied().collect() }

/// Whether the backing filesystem stores POSIX ACLs.
fn acl_supported(fx: &Fixture) -> bool {
    let mut acl = PosixAcl::from_mode(0o644);
    acl.set(Tag::User, 4242, 0o4);
    acl.recompute_mask();
    let probe = fx.dir.path().join("acl-probe");
    fs::write(&probe, b"").unwrap();
    let ok = xattr::set(&probe, XATTR_ACCESS, &acl.encode()).is_ok();
    fs::remove_file(&probe).unwrap();
    ok
}

#[test]
fn service_and_home_owner_always_pass() {
    let fx = fixture();
    let service = fx.contexts.open_service().unwrap();
    assert!(fx.acl.has_permission(&service, "/projects/p1/report.txt", Write).unwrap());
    let alice = fx.contexts.open("alice").unwrap();
    assert!(fx.acl.has_permission(&alice, "/home/alice/share/missing/deeper", Write).unwrap());
}

#[test]
fn other_users_fall_through_to_mode_bits() {
    let fx = fixture();
    let host = fx.dir.path().join("projects/p1/report.txt");
    fs::set_permissions(&host, fs::Permissions::from_mode(0o600)).unwrap();
    let bob = fx.contexts.open("bob").unwrap();
    let err = fx.acl.require_permission(&bob, "/projects/p1/report.txt", Read).unwrap_err();
    assert_eq!(err, FsError::PermissionDenied("/projects/p1/report.txt".into()));

    fs::set_permissions(&host, fs::Permissions::from_mode(0o604)).unwrap();
    assert!(fx.acl.require_permission(&bob, "/projects/p1/report.txt", Read).is_ok());
    assert!(fx.acl.require_permission(&bob, "/projects/p1/report.txt", Write).is_err());
}

#[test]
fn only_owner_may_change_acls() {
    let fx = fixture();
    let bob = fx.contexts.open("bob").unwrap();
    let err = fx.acl.grant(&bob, &AclEntity::user("bob"), "/home/alice/share", &rights(&[Read])).unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));
}

#[test]
fn unknown_entities_and_root_are_rejected() {
    let fx = fixture();
    let alice = fx.contexts.open("alice").unwrap();
    let err = fx.acl.grant(&alice, &AclEntity::user("nobody"), "/home/alice/share", &rights(&[Read])).unwrap_err();
    assert_eq!(err, FsError::NoIdentityMapping("user:nobody".into()));

    let service = fx.contexts.open_service().unwrap();
    let err = fx.acl.grant(&service, &AclEntity::user("bob"), "/", &rights(&[Read])).unwrap_err();
    assert!(matches!(err, FsError::BadRequest(_)));
}

#[test]
fn open_access_on_a_file_sets_other_bits() {
    let fx = fixture();
    let host = fx.dir.path().join("projects/p1/report.txt");
    fs::set_permissions(&host, fs::Permissions::from_mode(0o600)).unwrap();
    fs::set_permissions(fx.dir.path().join("projects/p1"), fs::Permissions::from_mode(0o700)).unwrap();

    let service = fx.contexts.open_service().unwrap();
    fx.acl.mark_as_open_access(&service, "/projects/p1/report.txt").unwrap();

    assert_eq!(fx.fs.stat("/projects/p1/report.txt").unwrap().mode & 0o7, 0o4);
    assert_eq!(fx.fs.stat("/projects/p1").unwrap().mode & 0o7, 0o1);
}

#[test]
fn grant_and_revoke_round_trip() {
    let fx = fixture();
    if !acl_supported(&fx) {
        return;
    }
    let alice = fx.contexts.open("alice").unwrap();
    let bob_entity = AclEntity::user("bob");
    fx.acl.grant(&alice, &bob_entity, "/home/alice/share", &rights(&[Read, Write])).unwrap();

    let on_dir = fx.acl.list_entries("/home/alice/share").unwrap();
    assert!(on_dir.iter().any(|e| e.entity == bob_entity && !e.default && e.rights == rights(&[Read, Write])));
    assert!(on_dir.iter().any(|e| e.entity == bob_entity && e.default));

    let on_file = fx.acl.list_entries("/home/alice/share/file.txt").unwrap();
    assert_eq!(on_file.len(), 1);
    assert!(!on_file[0].default);

    let on_home = fx.acl.list_entries("/home/alice").unwrap();
    assert_eq!(on_home.len(), 1);
    assert_eq!(on_home[0].rights, rights(&[Execute]));
    assert!(fx.acl.list_entries("/home").unwrap().is_empty());

    let bob = fx.contexts.open("bob").unwrap();
    assert!(fx.acl.has_permission(&bob, "/home/alice/share/file.txt", Write).unwrap());

    fx.acl.revoke(&alice, &bob_entity, "/home/alice/share").unwrap();
    assert!(fx.acl.list_entries("/home/alice/share").unwrap().is_empty());
    assert!(fx.acl.list_entries("/home/alice/share/sub").unwrap().is_empty());
    // traversal entries stay behind
    assert_eq!(fx.acl.list_entries("/home/alice").unwrap().len(), 1);
}

#[test]
fn failed_grant_restores_ancestors() {
    let fx = fixture();
    if !acl_supported(&fx) {
        return;
    }
    let alice = fx.contexts.open("alice").unwrap();
    let err = fx
        .acl
        .grant(&alice, &AclEntity::user("bob"), "/home/alice/share/missing", &rights(&[Read]))
        .unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));
    assert!(fx.acl.list_entries("/home/alice").unwrap().is_empty());
    assert!(fx.acl.list_entries("/home/alice/share").unwrap().is_empty());
}

#[test]
fn group_entries_map_back_to_project_groups() {
    let fx = fixture();
    if !acl_supported(&fx) {
        return;
    }
    fs::set_permissions(fx.dir.path().join("projects/p1/report.txt"), fs::Permissions::from_mode(0o600)).unwrap();
    let service = fx.contexts.open_service().unwrap();
    let bob = fx.contexts.open("bob").unwrap();
    assert!(!fx.acl.has_permission(&bob, "/projects/p1/report.txt", Read).unwrap());

    let staff = AclEntity::group("p1", "staff");
    fx.acl.create_entry(&service, &staff, "/projects/p1/report.txt", &rights(&[Read]), false, false).unwrap();
    let entries = fx.acl.list_entries("/projects/p1/report.txt").unwrap();
    assert_eq!(entries, vec![AclEntry { entity: staff.clone(), rights: rights(&[Read]), default: false }]);
    assert!(fx.acl.has_permission(&bob, "/projects/p1/report.txt", Read).unwrap());
    assert!(!fx.acl.has_permission(&bob, "/projects/p1/report.txt", Write).unwrap());

    fx.acl.remove_entry(&service, &staff, "/projects/p1/report.txt", false, false).unwrap();
    assert!(fx.acl.list_entries("/projects/p1/report.txt").unwrap().is_empty());
}
