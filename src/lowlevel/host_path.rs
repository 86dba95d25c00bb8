use std::path::{Component, Path, PathBuf};

use path_absolutize::Absolutize;

use crate::error::{FsError, FsResult};

/// Absolutize and canonicalize the directory backing the logical root.
pub fn resolve_root(root: &Path) -> FsResult<PathBuf> {
    let abs = root
        .absolutize()
        .map_err(|e| FsError::critical(format!("{}: {}", root.display(), e)))?
        .to_path_buf();
    let canon = abs
        .canonicalize()
        .map_err(|e| FsError::critical(format!("storage root {}: {}", abs.display(), e)))?;
    if !canon.is_dir() {
        return Err(FsError::critical(format!("storage root {} is not a directory", canon.display())));
    }
    Ok(canon)
}

/// Lexically resolve a link target read from `link_host` without touching the filesystem.
pub fn resolve_link_target(link_host: &Path, raw_target: &Path) -> PathBuf {
    let joined = if raw_target.is_absolute() {
        raw_target.to_path_buf()
    } else {
        link_host.parent().map(|p| p.join(raw_target)).unwrap_or_else(|| raw_target.to_path_buf())
    };
    joined.absolutize().map(|p| p.to_path_buf()).unwrap_or(joined)
}

/// Path of `host` below `root` as a logical path, `None` when it lies outside.
pub fn to_logical(root: &Path, host: &Path) -> Option<String> {
    let rest = host.strip_prefix(root).ok()?;
    let mut segs = Vec::new();
    for c in rest.components() {
        match c {
            Component::Normal(s) => segs.push(s.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if segs.is_empty() {
        return Some("/".to_string());
    }
    Some(format!("/{}", segs.join("/")))
}
