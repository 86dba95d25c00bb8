//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use storage_core::config::StorageConfig;
use storage_core::events::RecordingSink;
use storage_core::identity::{ContextFactory, IdentityMapper, LocalIdentity, StaticIdentityMapper};
use storage_core::types::{FileRow, FileType};
use storage_core::CoreFsService;

pub const BOB_UID: u32 = 4242;

pub struct Harness {
    pub dir: TempDir,
    pub core: Arc<CoreFsService>,
    pub contexts: ContextFactory,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn host(&self, logical: &str) -> std::path::PathBuf {
        self.dir.path().join(logical.trim_start_matches('/'))
    }

    pub fn inode(&self, logical: &str) -> String {
        fs::symlink_metadata(self.host(logical)).unwrap().ino().to_string()
    }
}

/// Build a storage root from `layout`: entries ending in `/` are directories, everything
/// else is a file whose content is its own name. `alice` owns the files on disk.
pub fn harness(layout: &[&str]) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    for entry in layout {
        let host = dir.path().join(entry.trim_start_matches('/'));
        if entry.ends_with('/') {
            fs::create_dir_all(&host).unwrap();
        } else {
            fs::create_dir_all(host.parent().unwrap()).unwrap();
            fs::write(&host, entry.as_bytes()).unwrap();
        }
    }

    let me = LocalIdentity::current_process();
    let mapper = StaticIdentityMapper::new();
    mapper.add_user("alice", me.uid, me.gid).add_user("bob", BOB_UID, BOB_UID);
    let mapper: Arc<dyn IdentityMapper> = Arc::new(mapper);
    let config = Arc::new(StorageConfig::with_root(dir.path()));
    let sink = RecordingSink::new();
    let core = Arc::new(CoreFsService::new(config.clone(), mapper.clone(), sink.clone()).unwrap());
    Harness { dir, core, contexts: ContextFactory::new(mapper, config), sink }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn user_xattrs_supported(dir: &Path) -> bool {
    let probe = dir.join(".xattr-probe");
    fs::write(&probe, b"").unwrap();
    let ok = xattr::set(&probe, "user.probe", b"1").is_ok();
    fs::remove_file(&probe).unwrap();
    ok
}

/// Catalog row the way an out-of-date index would remember it.
pub fn fake_row(id: &str, path: &str, file_type: FileType) -> FileRow {
    FileRow {
        id: id.to_string(),
        path: path.to_string(),
        file_type,
        owner: "user".to_string(),
        size: 0,
        created_at: 0,
        modified_at: 0,
        link_target: None,
        link_dead: false,
        own_sensitivity_level: None,
        sensitivity_level: None,
        creator: Some("user".to_string()),
        acl: None,
    }
}
