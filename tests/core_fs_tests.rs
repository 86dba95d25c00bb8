//! CoreFS gateway: conflict policies, event emission and the link/favorite helpers.

mod common;

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;

use common::harness;
use storage_core::types::{all_attrs, attrs, FileAttribute, FileType, StorageEvent, WriteConflictPolicy};
use storage_core::FsError;

fn read_string(h: &common::Harness, ctx: &storage_core::identity::ExecutionContext, path: &str) -> storage_core::FsResult<String> {
    h.core.read(ctx, path, |r| {
        let mut s = String::new();
        r.read_to_string(&mut s).map_err(|e| FsError::from_io(&e, "<test>"))?;
        Ok(s)
    })
}

fn write_bytes(bytes: &'static [u8]) -> impl FnOnce(&mut dyn Write) -> storage_core::FsResult<()> {
    move |w| {
        w.write_all(bytes).map_err(|e| FsError::from_io(&e, "<test>"))?;
        Ok(())
    }
}

#[test]
fn write_creates_and_announces_a_file() -> Result<()> {
    let h = harness(&["home/alice/"]);
    let alice = h.contexts.open("alice")?;
    let row = h.core.write(&alice, "/home/alice/notes.txt", WriteConflictPolicy::Reject, write_bytes(b"hello"))?;
    assert_eq!(row.path, "/home/alice/notes.txt");
    assert_eq!(row.size, 5);
    assert_eq!(row.owner, "alice");
    assert_eq!(row.creator.as_deref(), Some("alice"));

    let events = h.sink.take();
    assert_eq!(events, vec![StorageEvent::CreatedOrRefreshed { file: row }]);
    Ok(())
}

#[test]
fn write_conflict_policies() -> Result<()> {
    let h = harness(&["home/alice/a.txt", "home/alice/a(1).txt", "home/alice/dir/"]);
    let alice = h.contexts.open("alice")?;

    let err = h.core.write(&alice, "/home/alice/a.txt", WriteConflictPolicy::Reject, write_bytes(b"x")).unwrap_err();
    assert_eq!(err, FsError::AlreadyExists("/home/alice/a.txt".into()));
    assert!(h.sink.is_empty());

    let renamed = h.core.write(&alice, "/home/alice/a.txt", WriteConflictPolicy::Rename, write_bytes(b"x"))?;
    assert_eq!(renamed.path, "/home/alice/a(2).txt");

    let before = h.core.stat(&alice, "/home/alice/a.txt", &attrs(&[]))?;
    let after = h.core.write(&alice, "/home/alice/a.txt", WriteConflictPolicy::Overwrite, write_bytes(b"replaced"))?;
    assert_eq!(before.id, after.id);
    assert_eq!(after.size, 8);

    let err = h.core.write(&alice, "/home/alice/dir", WriteConflictPolicy::Overwrite, write_bytes(b"x")).unwrap_err();
    assert!(matches!(err, FsError::BadRequest(_)));

    let err = h.core.write(&alice, "/home/alice/nope/a.txt", WriteConflictPolicy::Reject, write_bytes(b"x")).unwrap_err();
    assert_eq!(err, FsError::NotFound("/home/alice/nope".into()));
    Ok(())
}

#[test]
fn read_streams_file_content() -> Result<()> {
    let h = harness(&["home/alice/a.txt"]);
    let alice = h.contexts.open("alice")?;
    let content = h.core.read(&alice, "/home/alice/a.txt", |r| {
        let mut s = String::new();
        r.read_to_string(&mut s).map_err(|e| FsError::from_io(&e, "/home/alice/a.txt"))?;
        Ok(s)
    })?;
    assert_eq!(content, "home/alice/a.txt");
    Ok(())
}

#[test]
fn overwrite_keeps_created_at_and_bumps_modified_at() -> Result<()> {
    let h = harness(&["home/alice/"]);
    let alice = h.contexts.open("alice")?;
    let now = chrono::Utc::now().timestamp_millis();
    let first = h.core.write(&alice, "/home/alice/log.txt", WriteConflictPolicy::Reject, write_bytes(b"one"))?;
    assert!((first.created_at - now).abs() < 60_000, "created_at {} vs now {}", first.created_at, now);

    sleep(Duration::from_millis(50));
    let second = h.core.write(&alice, "/home/alice/log.txt", WriteConflictPolicy::Overwrite, write_bytes(b"two"))?;
    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.modified_at > first.modified_at);
    Ok(())
}

#[test]
fn links_do_not_widen_access() -> Result<()> {
    let h = harness(&["home/alice/secret.txt", "home/alice/sub/", "home/bob/"]);
    fs::set_permissions(h.host("/home/alice/secret.txt"), fs::Permissions::from_mode(0o600))?;
    fs::set_permissions(h.host("/home/alice/sub"), fs::Permissions::from_mode(0o700))?;
    let bob = h.contexts.open("bob")?;
    let err = read_string(&h, &bob, "/home/alice/secret.txt").unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));

    // a link to the whole tree cannot be walked through
    h.core.create_symbolic_link(&bob, "/home/alice", "/home/bob/alice")?;
    let err = read_string(&h, &bob, "/home/bob/alice/secret.txt").unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));
    let err = h
        .core
        .write(&bob, "/home/bob/alice/sub/planted.txt", WriteConflictPolicy::Reject, write_bytes(b"x"))
        .unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));
    assert!(!h.host("/home/alice/sub/planted.txt").exists());

    // a link to the file itself is read with the file's rules
    h.core.create_symbolic_link(&bob, "/home/alice/secret.txt", "/home/bob/secret")?;
    let err = read_string(&h, &bob, "/home/bob/secret").unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));

    // and is never truncated through
    let err = h
        .core
        .write(&bob, "/home/bob/secret", WriteConflictPolicy::Overwrite, write_bytes(b"gone"))
        .unwrap_err();
    assert!(matches!(err, FsError::BadRequest(_)));
    assert_eq!(fs::read_to_string(h.host("/home/alice/secret.txt"))?, "home/alice/secret.txt");

    let alice = h.contexts.open("alice")?;
    h.core.create_symbolic_link(&alice, "/home/alice/secret.txt", "/home/alice/own")?;
    assert_eq!(read_string(&h, &alice, "/home/alice/own")?, "home/alice/secret.txt");
    Ok(())
}

#[test]
fn other_users_cannot_write_into_a_home() -> Result<()> {
    let h = harness(&["home/alice/"]);
    let bob = h.contexts.open("bob")?;
    let err = h.core.write(&bob, "/home/alice/x", WriteConflictPolicy::Reject, write_bytes(b"x")).unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));
    assert!(h.sink.is_empty());
    Ok(())
}

#[test]
fn move_keeps_identity_and_emits_one_event() -> Result<()> {
    let h = harness(&["home/alice/dir/a.txt", "home/alice/dir/b.txt", "home/alice/other/"]);
    let alice = h.contexts.open("alice")?;
    let id = h.inode("/home/alice/dir");

    let row = h.core.move_path(&alice, "/home/alice/dir", "/home/alice/other/dir", WriteConflictPolicy::Reject)?;
    assert_eq!(row.id, id);
    let events = h.sink.take();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StorageEvent::Moved { file, old_path } if file.path == "/home/alice/other/dir" && old_path == "/home/alice/dir"));
    Ok(())
}

#[test]
fn move_edge_cases() -> Result<()> {
    let h = harness(&["home/alice/a.txt", "home/alice/b.txt", "home/alice/dir/x"]);
    let alice = h.contexts.open("alice")?;

    for policy in [WriteConflictPolicy::Reject, WriteConflictPolicy::Overwrite, WriteConflictPolicy::Rename] {
        let err = h.core.move_path(&alice, "/home/alice/a.txt", "/home/alice/a.txt", policy).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)), "{:?}", policy);
    }
    let err = h.core.move_path(&alice, "/home/alice/dir", "/home/alice/dir/inner", WriteConflictPolicy::Reject).unwrap_err();
    assert!(matches!(err, FsError::BadRequest(_)));
    let err = h.core.move_path(&alice, "/home/alice/a.txt", "/home/alice/b.txt", WriteConflictPolicy::Reject).unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));
    let err = h.core.move_path(&alice, "/home/alice/a.txt", "/home/alice/dir", WriteConflictPolicy::Overwrite).unwrap_err();
    assert!(matches!(err, FsError::BadRequest(_)));
    let err = h.core.move_path(&alice, "/home/alice/missing", "/home/alice/c.txt", WriteConflictPolicy::Reject).unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));

    let renamed = h.core.move_path(&alice, "/home/alice/a.txt", "/home/alice/b.txt", WriteConflictPolicy::Rename)?;
    assert_eq!(renamed.path, "/home/alice/b(1).txt");

    let b_id = h.inode("/home/alice/b(1).txt");
    let replaced = h.core.move_path(&alice, "/home/alice/b(1).txt", "/home/alice/b.txt", WriteConflictPolicy::Overwrite)?;
    assert_eq!(replaced.id, b_id);
    Ok(())
}

#[test]
fn copy_announces_every_entry() -> Result<()> {
    let h = harness(&["home/alice/src/a.txt", "home/alice/src/sub/b.txt"]);
    let alice = h.contexts.open("alice")?;
    // a link back to the source would recurse forever if followed
    h.core.create_symbolic_link(&alice, "/home/alice/src", "/home/alice/src/sub/loop")?;
    h.sink.take();

    let root = h.core.copy(&alice, "/home/alice/src", "/home/alice/dst", WriteConflictPolicy::Reject)?;
    assert_eq!(root.path, "/home/alice/dst");
    assert_ne!(root.id, h.inode("/home/alice/src"));

    let paths: Vec<String> = h.sink.take().iter().map(|e| e.path().to_string()).collect();
    assert_eq!(
        paths,
        vec!["/home/alice/dst", "/home/alice/dst/a.txt", "/home/alice/dst/sub", "/home/alice/dst/sub/b.txt", "/home/alice/dst/sub/loop"]
    );
    let link = h.core.stat(&alice, "/home/alice/dst/sub/loop", &attrs(&[]))?;
    assert_eq!(link.file_type, FileType::Link);
    Ok(())
}

#[test]
fn copy_edge_cases() -> Result<()> {
    let h = harness(&["home/alice/src/a.txt", "home/alice/file.txt"]);
    let alice = h.contexts.open("alice")?;

    let err = h.core.copy(&alice, "/home/alice/src", "/home/alice/src/inner", WriteConflictPolicy::Reject).unwrap_err();
    assert!(matches!(err, FsError::BadRequest(_)));

    h.core.copy(&alice, "/home/alice/file.txt", "/home/alice/file.txt", WriteConflictPolicy::Overwrite)?;
    assert!(h.sink.is_empty());

    let err = h.core.copy(&alice, "/home/alice/file.txt", "/home/alice/file.txt", WriteConflictPolicy::Reject).unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));

    let dup = h.core.copy(&alice, "/home/alice/file.txt", "/home/alice/file.txt", WriteConflictPolicy::Rename)?;
    assert_eq!(dup.path, "/home/alice/file(1).txt");
    Ok(())
}

#[test]
fn delete_is_children_first() -> Result<()> {
    let h = harness(&["home/alice/d/a.txt", "home/alice/d/sub/b.txt"]);
    let alice = h.contexts.open("alice")?;
    let removed = h.core.delete(&alice, "/home/alice/d")?;
    assert_eq!(removed, 4);

    let paths: Vec<String> = h.sink.take().iter().map(|e| e.path().to_string()).collect();
    assert_eq!(paths, vec!["/home/alice/d/a.txt", "/home/alice/d/sub/b.txt", "/home/alice/d/sub", "/home/alice/d"]);
    assert!(!h.host("/home/alice/d").exists());

    for protected in ["/", "/home", "/home/alice"] {
        let service = h.contexts.open_service()?;
        let err = h.core.delete(&service, protected).unwrap_err();
        assert!(matches!(err, FsError::BadRequest(_)), "{}", protected);
    }
    Ok(())
}

#[test]
fn dead_links_stay_listable() -> Result<()> {
    let h = harness(&["home/alice/target.txt"]);
    let alice = h.contexts.open("alice")?;

    let err = h.core.create_symbolic_link(&alice, "/home/alice/missing", "/home/alice/l").unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));

    let link = h.core.create_symbolic_link(&alice, "/home/alice/target.txt", "/home/alice/l")?;
    assert_eq!(link.file_type, FileType::Link);
    assert_eq!(link.link_target.as_deref(), Some("/home/alice/target.txt"));
    let err = h.core.create_symbolic_link(&alice, "/home/alice/target.txt", "/home/alice/l").unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));

    h.core.delete(&alice, "/home/alice/target.txt")?;
    let wanted = attrs(&[FileAttribute::SensitivityLevel]);
    let dead = h.core.stat(&alice, "/home/alice/l", &wanted)?;
    assert!(dead.link_dead);
    assert_eq!(dead.sensitivity_level, None);

    let listing = h.core.list_directory(&alice, "/home/alice", &wanted)?;
    assert_eq!(listing.iter().filter(|r| r.path == "/home/alice/l").count(), 1);
    Ok(())
}

#[test]
fn favorites_are_links_in_the_home_folder() -> Result<()> {
    let h = harness(&["home/alice/report.pdf", "home/alice/other.txt"]);
    let alice = h.contexts.open("alice")?;

    let first = h.core.create_favorite(&alice, "/home/alice/report.pdf")?;
    assert_eq!(first.path, "/home/alice/Favorites/report.pdf");
    let second = h.core.create_favorite(&alice, "/home/alice/report.pdf")?;
    assert_eq!(second.path, "/home/alice/Favorites/report(1).pdf");
    h.core.create_favorite(&alice, "/home/alice/other.txt")?;

    assert_eq!(h.core.remove_favorite(&alice, "/home/alice/report.pdf")?, 2);
    assert_eq!(h.core.remove_favorite(&alice, "/home/alice/report.pdf")?, 0);
    assert_eq!(h.core.remove_favorite(&alice, "/home/alice/not-a-favorite")?, 0);

    let left = h.core.list_directory(&alice, "/home/alice/Favorites", &attrs(&[]))?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].path, "/home/alice/Favorites/other.txt");
    Ok(())
}

#[test]
fn tree_and_free_names() -> Result<()> {
    let h = harness(&["home/alice/t/a", "home/alice/t/b/c", "home/alice/x.tar.gz"]);
    let alice = h.contexts.open("alice")?;
    let tree: Vec<String> = h.core.tree(&alice, "/home/alice/t", &attrs(&[]))?.into_iter().map(|r| r.path).collect();
    assert_eq!(tree, vec!["/home/alice/t", "/home/alice/t/a", "/home/alice/t/b", "/home/alice/t/b/c"]);

    assert_eq!(h.core.find_free_name(&alice, "/home/alice/x.tar.gz")?, "/home/alice/x(1).tar.gz");
    assert_eq!(h.core.find_free_name(&alice, "/home/alice/fresh")?, "/home/alice/fresh");
    assert_eq!(h.core.home_directory(&alice), "/home/alice");
    Ok(())
}

#[test]
fn contexts_are_closed_after_use() -> Result<()> {
    let h = harness(&["home/alice/"]);
    {
        let alice = h.contexts.open("alice")?;
        h.core.make_directory(&alice, "/home/alice/new")?;
        assert_eq!(h.contexts.open_sessions(), 1);
    }
    assert_eq!(h.contexts.open_sessions(), 0);
    Ok(())
}

#[test]
fn requested_attributes_are_filled() -> Result<()> {
    let h = harness(&["home/alice/a.txt"]);
    let alice = h.contexts.open("alice")?;
    let bare = h.core.stat(&alice, "/home/alice/a.txt", &attrs(&[]))?;
    assert_eq!(bare.sensitivity_level, None);
    assert_eq!(bare.creator, None);
    assert_eq!(bare.acl, None);

    let full = h.core.stat(&alice, "/home/alice/a.txt", &all_attrs())?;
    assert_eq!(full.creator.as_deref(), Some("alice"));
    assert!(full.sensitivity_level.is_some());
    assert_eq!(full.acl, Some(Vec::new()));
    Ok(())
}
