//! Core data contracts shared by the engines and the event sink.
//! Keep this module purely about types/serde and light helpers.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    File,
    Directory,
    Link,
}

/// Data classification. Persisted as an opaque tag; the variants carry no ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensitivityLevel {
    Private,
    Confidential,
    Sensitive,
}

impl SensitivityLevel {
    pub const DEFAULT: SensitivityLevel = SensitivityLevel::Private;

    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityLevel::Private => "PRIVATE",
            SensitivityLevel::Confidential => "CONFIDENTIAL",
            SensitivityLevel::Sensitive => "SENSITIVE",
        }
    }
}

impl fmt::Display for SensitivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for SensitivityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PRIVATE" => Ok(SensitivityLevel::Private),
            "CONFIDENTIAL" => Ok(SensitivityLevel::Confidential),
            "SENSITIVE" => Ok(SensitivityLevel::Sensitive),
            other => Err(format!("unknown sensitivity level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessRight {
    Read,
    Write,
    Execute,
}

impl AccessRight {
    /// POSIX permission bit for this right.
    pub fn bit(&self) -> u16 {
        match self {
            AccessRight::Read => 4,
            AccessRight::Write => 2,
            AccessRight::Execute => 1,
        }
    }

    pub fn to_bits(rights: &BTreeSet<AccessRight>) -> u16 {
        rights.iter().fold(0, |acc, r| acc | r.bit())
    }

    pub fn from_bits(bits: u16) -> BTreeSet<AccessRight> {
        [AccessRight::Read, AccessRight::Write, AccessRight::Execute]
            .into_iter()
            .filter(|r| bits & r.bit() != 0)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AclEntity {
    User { username: String },
    ProjectGroup { project: String, group: String },
}

impl AclEntity {
    pub fn user<S: Into<String>>(username: S) -> Self { AclEntity::User { username: username.into() } }
    pub fn group<S: Into<String>>(project: S, group: S) -> Self {
        AclEntity::ProjectGroup { project: project.into(), group: group.into() }
    }
}

impl fmt::Display for AclEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclEntity::User { username } => write!(f, "user:{}", username),
            AclEntity::ProjectGroup { project, group } => write!(f, "group:{}/{}", project, group),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclEntry {
    pub entity: AclEntity,
    pub rights: BTreeSet<AccessRight>,
    /// True for entries of the default (inherited-on-create) list.
    #[serde(default)]
    pub default: bool,
}

/// Optional attributes computed on request; everything else comes from one `lstat`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FileAttribute {
    SensitivityLevel,
    Creator,
    Acl,
}

pub type AttributeSet = BTreeSet<FileAttribute>;

pub fn attrs(list: &[FileAttribute]) -> AttributeSet {
    list.iter().copied().collect()
}

pub fn all_attrs() -> AttributeSet {
    attrs(&[FileAttribute::SensitivityLevel, FileAttribute::Creator, FileAttribute::Acl])
}

/// One stat/list result. Produced fresh on every read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRow {
    /// Filesystem-assigned identity (inode number).
    pub id: String,
    pub path: String,
    pub file_type: FileType,
    pub owner: String,
    pub size: u64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub modified_at: i64,
    #[serde(default)]
    pub link_target: Option<String>,
    #[serde(default)]
    pub link_dead: bool,
    #[serde(default)]
    pub own_sensitivity_level: Option<SensitivityLevel>,
    #[serde(default)]
    pub sensitivity_level: Option<SensitivityLevel>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub acl: Option<Vec<AclEntry>>,
}

impl FileRow {
    pub fn is_directory(&self) -> bool { self.file_type == FileType::Directory }
    pub fn is_link(&self) -> bool { self.file_type == FileType::Link }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageEvent {
    CreatedOrRefreshed { file: FileRow },
    Moved { file: FileRow, old_path: String },
    Invalidated { id: String, path: String, owner: String },
    Deleted { id: String, path: String, owner: String },
}

impl StorageEvent {
    /// Path the event is about (the new path for moves).
    pub fn path(&self) -> &str {
        match self {
            StorageEvent::CreatedOrRefreshed { file } | StorageEvent::Moved { file, .. } => &file.path,
            StorageEvent::Invalidated { path, .. } | StorageEvent::Deleted { path, .. } => path,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            StorageEvent::CreatedOrRefreshed { file } | StorageEvent::Moved { file, .. } => &file.id,
            StorageEvent::Invalidated { id, .. } | StorageEvent::Deleted { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteConflictPolicy {
    Reject,
    Overwrite,
    Rename,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Tgz,
    Tar,
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tgz" | "tar.gz" | "targz" => Ok(ArchiveFormat::Tgz),
            "tar" => Ok(ArchiveFormat::Tar),
            other => Err(format!("unsupported archive format '{}'", other)),
        }
    }
}
