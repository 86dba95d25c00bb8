//! Reconciles a caller supplied (possibly stale) listing with what is on disk and
//! turns the difference into storage events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::events::SharedSink;
use crate::identity::{ContextFactory, ExecutionContext};
use crate::paths;
use crate::types::{attrs, AttributeSet, FileAttribute, FileRow, StorageEvent};

/// Read side of the filesystem the engine diffs against.
pub trait TreeSource: Send + Sync {
    fn stat_or_none(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Option<FileRow>>;

    fn list_directory(&self, ctx: &ExecutionContext, path: &str, attrs: &AttributeSet) -> FsResult<Vec<FileRow>>;

    /// Owner recorded for events about entries that no longer exist.
    fn owner_of(&self, path: &str) -> String {
        paths::components(path).get(1).map(|s| s.to_string()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub events: Vec<StorageEvent>,
    /// False when the root is gone or is not a directory; the caller should stop descending.
    pub should_continue: bool,
}

pub struct IndexingEngine<S: TreeSource> {
    source: Arc<S>,
    contexts: ContextFactory,
    sink: SharedSink,
}

impl<S: TreeSource + 'static> IndexingEngine<S> {
    pub fn new(source: Arc<S>, contexts: ContextFactory, sink: SharedSink) -> Self {
        Self { source, contexts, sink }
    }

    pub fn calculate_diff(&self, ctx: &ExecutionContext, root: &str, reference: &[FileRow]) -> FsResult<DiffResult> {
        diff_root(self.source.as_ref(), ctx, root, reference)
    }

    /// Decide synchronously which roots still exist, then diff and emit in the background.
    /// Every root gets its own service context, closed on every path.
    pub async fn run_diff_on_roots(
        &self,
        reference_by_root: HashMap<String, Vec<FileRow>>,
    ) -> FsResult<(HashMap<String, bool>, JoinHandle<()>)> {
        let mut should_continue = HashMap::with_capacity(reference_by_root.len());
        for root in reference_by_root.keys() {
            let ctx = self.contexts.open_service()?;
            let verdict = root_is_directory(self.source.as_ref(), &ctx, root);
            ctx.close();
            match verdict {
                Ok(v) => {
                    should_continue.insert(root.clone(), v);
                }
                Err(e @ FsError::Critical(_)) => return Err(e),
                Err(e) => {
                    warn!(target: "storage::indexing", "cannot stat root {}: {}", root, e);
                    should_continue.insert(root.clone(), false);
                }
            }
        }

        let source = self.source.clone();
        let contexts = self.contexts.clone();
        let sink = self.sink.clone();
        let job = tokio::task::spawn_blocking(move || {
            for (root, reference) in reference_by_root {
                let ctx = match contexts.open_service() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(target: "storage::indexing", "no context for diff of {}: {}", root, e);
                        continue;
                    }
                };
                let result = diff_root(source.as_ref(), &ctx, &root, &reference);
                let corr = ctx.correlation().clone();
                ctx.close();
                match result {
                    Ok(diff) => {
                        info!(target: "storage::indexing", "diff of {}: {} events [corr={}]", root, diff.events.len(), corr);
                        sink.emit_all(diff.events);
                    }
                    Err(e) => warn!(target: "storage::indexing", "diff of {} failed: {} [corr={}]", root, e, corr),
                }
            }
        });
        Ok((should_continue, job))
    }
}

fn diff_attrs() -> AttributeSet {
    attrs(&[FileAttribute::SensitivityLevel, FileAttribute::Creator])
}

fn root_is_directory<S: TreeSource + ?Sized>(source: &S, ctx: &ExecutionContext, root: &str) -> FsResult<bool> {
    let root = paths::normalize(root)?;
    Ok(source.stat_or_none(ctx, &root, &diff_attrs())?.map(|r| r.is_directory()).unwrap_or(false))
}

fn diff_root<S: TreeSource + ?Sized>(source: &S, ctx: &ExecutionContext, root: &str, reference: &[FileRow]) -> FsResult<DiffResult> {
    let root = paths::normalize(root)?;
    let wanted = diff_attrs();
    let Some(root_row) = source.stat_or_none(ctx, &root, &wanted)? else {
        debug!(target: "storage::indexing", "root {} is gone", root);
        let event = StorageEvent::Invalidated { id: String::new(), owner: source.owner_of(&root), path: root };
        return Ok(DiffResult { events: vec![event], should_continue: false });
    };
    if !root_row.is_directory() {
        return Ok(DiffResult { events: Vec::new(), should_continue: false });
    }
    let mut events = Vec::new();
    diff_directory(source, ctx, &root, reference, &wanted, &mut events)?;
    Ok(DiffResult { events, should_continue: true })
}

fn diff_directory<S: TreeSource + ?Sized>(
    source: &S,
    ctx: &ExecutionContext,
    dir: &str,
    reference: &[FileRow],
    wanted: &AttributeSet,
    events: &mut Vec<StorageEvent>,
) -> FsResult<()> {
    let live = source.list_directory(ctx, dir, wanted)?;
    let live_by_id: HashMap<&str, &FileRow> = live.iter().map(|r| (r.id.as_str(), r)).collect();
    let live_at: HashSet<(&str, &str)> = live.iter().map(|r| (r.path.as_str(), r.id.as_str())).collect();

    let mut ids_at_path: HashMap<&str, usize> = HashMap::new();
    let mut reference_by_id: HashMap<&str, &FileRow> = HashMap::new();
    for r in reference {
        *ids_at_path.entry(r.path.as_str()).or_default() += 1;
        reference_by_id.entry(r.id.as_str()).or_insert(r);
    }

    for r in reference {
        if live_at.contains(&(r.path.as_str(), r.id.as_str())) {
            continue;
        }
        // a moved file is fully described by its Moved event
        let moved_file = live_by_id.get(r.id.as_str()).map(|l| !l.is_directory()).unwrap_or(false);
        if moved_file {
            continue;
        }
        events.push(StorageEvent::Invalidated { id: r.id.clone(), path: r.path.clone(), owner: r.owner.clone() });
    }

    for row in &live {
        match reference_by_id.get(row.id.as_str()) {
            Some(old) if old.path != row.path => {
                events.push(StorageEvent::Moved { file: row.clone(), old_path: old.path.clone() });
                if row.is_directory() {
                    events.push(StorageEvent::CreatedOrRefreshed { file: row.clone() });
                    diff_directory(source, ctx, &row.path, &[], wanted, events)?;
                }
            }
            Some(old) => {
                let drifted = old.own_sensitivity_level != row.own_sensitivity_level;
                let had_stale_ids = ids_at_path.get(row.path.as_str()).copied().unwrap_or(0) > 1;
                if drifted || had_stale_ids {
                    events.push(StorageEvent::CreatedOrRefreshed { file: row.clone() });
                }
            }
            None => {
                events.push(StorageEvent::CreatedOrRefreshed { file: row.clone() });
                if row.is_directory() {
                    diff_directory(source, ctx, &row.path, &[], wanted, events)?;
                }
            }
        }
    }
    Ok(())
}
