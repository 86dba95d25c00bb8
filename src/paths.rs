//! Logical path rules: absolute, `/`-separated, NFC-normalized, no `.`/`..` segments
//! and no trailing slash except for the root itself.

use unicode_normalization::UnicodeNormalization;

use crate::error::{FsError, FsResult};

pub const ROOT: &str = "/";

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

/// Resolve a caller supplied path into canonical logical form.
/// - NUL is rejected, an empty path is rejected
/// - relative paths are taken from the root
/// - empty and `.` segments are dropped, `..` pops (clamped at root)
pub fn normalize(path: &str) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::bad_request("path cannot be empty"));
    }
    if path.contains('\u{0000}') {
        return Err(FsError::bad_request("path cannot contain NUL characters"));
    }
    let nfc = normalize_nfc(path);
    let mut out: Vec<&str> = Vec::new();
    for seg in nfc.split('/') {
        match seg {
            "" | "." => {}
            ".." => { out.pop(); }
            s => out.push(s),
        }
    }
    if out.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", out.join("/")))
}

/// Segments of a normalized path; the root has none.
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Parent of a normalized path, `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last segment of a normalized path ("" for the root).
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

pub fn join(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if parent == ROOT || parent.is_empty() {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// All proper ancestors, root first.
pub fn parents(path: &str) -> Vec<String> {
    let comps = components(path);
    let mut out = Vec::with_capacity(comps.len());
    out.push(ROOT.to_string());
    for i in 1..comps.len() {
        out.push(format!("/{}", comps[..i].join("/")));
    }
    if comps.is_empty() {
        out.clear();
    }
    out
}

/// True if `candidate` equals `base` or lies underneath it.
pub fn is_same_or_descendant(base: &str, candidate: &str) -> bool {
    if base == ROOT {
        return true;
    }
    candidate == base || candidate.strip_prefix(base).map(|r| r.starts_with('/')).unwrap_or(false)
}

/// Split into (stem, extension). The extension starts at the first dot that is not the
/// leading character, so `a.tar.gz` gives (`a`, `.tar.gz`) and `.bashrc` has none.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.char_indices().skip(1).find(|(_, c)| *c == '.') {
        Some((idx, _)) => (&name[..idx], &name[idx..]),
        None => (name, ""),
    }
}

/// Candidate name used by the RENAME conflict policy: `dir/stem(n).ext`.
pub fn numbered_candidate(path: &str, n: u32) -> String {
    let dir = parent(path).unwrap_or_else(|| ROOT.to_string());
    let (stem, ext) = split_extension(file_name(path));
    join(&dir, &format!("{}({}){}", stem, n, ext))
}
