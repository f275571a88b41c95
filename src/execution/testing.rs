//! In-memory backends for tests.
//!
//! [`MemoryData`] stores a directory tree in memory under its own scheme.
//! [`ScriptedExecutor`] launches nothing: each item finishes or fails
//! according to a script, optionally "producing" files in a `MemoryData`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::{DataBackend, ExecBackend, Invocation, ItemStatus, RunRecord, Transfer};
use crate::error::BackendError;
use crate::uri::Uri;
use crate::workflow::model::AppDef;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parent(path: &str) -> Option<String> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/".to_string()),
        Some(idx) if idx > 0 => Some(path[..idx].to_string()),
        _ => None,
    }
}

fn is_below(path: &str, root: &str) -> bool {
    path == root || root == "/" || path.starts_with(&format!("{}/", root))
}

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<String>,
    files: BTreeSet<String>,
}

impl Tree {
    fn add_dir_all(&mut self, path: &str) {
        let mut current = Some(path.to_string());
        while let Some(p) = current {
            current = parent(&p);
            self.dirs.insert(p);
        }
    }

    fn add_file(&mut self, path: &str) {
        if let Some(p) = parent(path) {
            self.add_dir_all(&p);
        }
        self.files.insert(path.to_string());
    }
}

pub struct MemoryData {
    scheme: String,
    tree: Mutex<Tree>,
    list_calls: AtomicUsize,
    failing_lists: AtomicUsize,
}

impl MemoryData {
    pub fn new(scheme: &str) -> Self {
        let mut tree = Tree::default();
        tree.dirs.insert("/".to_string());
        Self {
            scheme: scheme.to_string(),
            tree: Mutex::new(tree),
            list_calls: AtomicUsize::new(0),
            failing_lists: AtomicUsize::new(0),
        }
    }

    /// Creates a file and its parent directories.
    pub fn touch(&self, path: &str) {
        lock(&self.tree).add_file(path);
    }

    pub fn is_file(&self, path: &str) -> bool {
        lock(&self.tree).files.contains(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        lock(&self.tree).dirs.contains(path)
    }

    /// The next `count` list calls fail transiently.
    pub fn fail_next_lists(&self, count: usize) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl DataBackend for MemoryData {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn list(&self, uri: &Uri) -> Result<Vec<String>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_lists.load(Ordering::SeqCst) > 0 {
            self.failing_lists.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::Transient("scripted list failure".into()));
        }

        let tree = lock(&self.tree);
        let path = uri.path();
        if !tree.dirs.contains(path) {
            return Err(BackendError::NotFound(uri.to_string()));
        }
        let names: BTreeSet<String> = tree
            .dirs
            .iter()
            .chain(tree.files.iter())
            .filter(|p| p.as_str() != path && parent(p).as_deref() == Some(path))
            .filter_map(|p| p.rsplit('/').next().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    fn exists(&self, uri: &Uri) -> Result<bool, BackendError> {
        let tree = lock(&self.tree);
        Ok(tree.dirs.contains(uri.path()) || tree.files.contains(uri.path()))
    }

    fn mkdir(&self, uri: &Uri, recursive: bool) -> Result<(), BackendError> {
        let mut tree = lock(&self.tree);
        if !recursive {
            let parent_path = parent(uri.path()).unwrap_or_else(|| "/".to_string());
            if !tree.dirs.contains(&parent_path) {
                return Err(BackendError::NotFound(parent_path));
            }
        }
        tree.add_dir_all(uri.path());
        Ok(())
    }

    fn delete(&self, uri: &Uri) -> Result<(), BackendError> {
        let mut tree = lock(&self.tree);
        let root = uri.path().to_string();
        tree.dirs.retain(|p| !is_below(p, &root) || p == "/");
        tree.files.retain(|p| !is_below(p, &root));
        Ok(())
    }

    fn copy(&self, src: &Uri, dest: &Uri) -> Result<(), BackendError> {
        let mut tree = lock(&self.tree);
        let (from, to) = (src.path().to_string(), dest.path().to_string());

        if tree.files.contains(&from) {
            tree.add_file(&to);
            return Ok(());
        }
        if !tree.dirs.contains(&from) {
            return Err(BackendError::NotFound(src.to_string()));
        }

        let rebase = |p: &String| format!("{}{}", to, &p[from.len()..]);
        let dirs: Vec<String> = tree.dirs.iter().filter(|p| is_below(p, &from)).map(rebase).collect();
        let files: Vec<String> = tree.files.iter().filter(|p| is_below(p, &from)).map(rebase).collect();
        for d in dirs {
            tree.add_dir_all(&d);
        }
        for f in files {
            tree.add_file(&f);
        }
        Ok(())
    }
}

/// Copies between two [`MemoryData`] trees of different schemes.
pub struct MemoryTransfer {
    from: Arc<MemoryData>,
    to: Arc<MemoryData>,
}

impl MemoryTransfer {
    pub fn new(from: Arc<MemoryData>, to: Arc<MemoryData>) -> Self {
        Self { from, to }
    }
}

impl Transfer for MemoryTransfer {
    fn copy(&self, src: &Uri, dest: &Uri) -> Result<(), BackendError> {
        let (from, to) = (src.path().to_string(), dest.path().to_string());
        let (dirs, files) = {
            let tree = lock(&self.from.tree);
            if !tree.dirs.contains(&from) && !tree.files.contains(&from) {
                return Err(BackendError::NotFound(src.to_string()));
            }
            let rebase = |p: &String| format!("{}{}", to, &p[from.len()..]);
            let dirs: Vec<String> = tree.dirs.iter().filter(|p| is_below(p, &from)).map(rebase).collect();
            let files: Vec<String> = tree.files.iter().filter(|p| is_below(p, &from)).map(rebase).collect();
            (dirs, files)
        };

        let mut tree = lock(&self.to.tree);
        for d in dirs {
            tree.add_dir_all(&d);
        }
        for f in files {
            tree.add_file(&f);
        }
        Ok(())
    }
}

/// Remaining script of one launched attempt.
struct ScriptedRun {
    fails: bool,
    poll_errors: usize,
    unknown_polls: usize,
    pending_polls: usize,
}

/// Execution backend driven by a script instead of real processes.
pub struct ScriptedExecutor {
    context: String,
    scheme: String,
    retry_limit: u32,
    initial: ItemStatus,
    pending_polls: usize,
    poll_errors: usize,
    unknown_polls: usize,
    failures: Mutex<BTreeMap<String, u32>>,
    rejected: BTreeSet<String>,
    outputs: BTreeMap<String, Vec<String>>,
    data: Option<Arc<MemoryData>>,
    validate_calls: AtomicUsize,
    launches: Mutex<Vec<(String, String, u32)>>,
}

impl ScriptedExecutor {
    pub fn new(context: &str, scheme: &str) -> Self {
        Self {
            context: context.to_string(),
            scheme: scheme.to_string(),
            retry_limit: 0,
            initial: ItemStatus::Running,
            pending_polls: 0,
            poll_errors: 0,
            unknown_polls: 0,
            failures: Mutex::new(BTreeMap::new()),
            rejected: BTreeSet::new(),
            outputs: BTreeMap::new(),
            data: None,
            validate_calls: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_initial_status(mut self, status: ItemStatus) -> Self {
        self.initial = status;
        self
    }

    /// Polls report RUNNING this many times before the outcome.
    pub fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    /// The first `polls` polls of every attempt return a transient error.
    pub fn with_poll_errors(mut self, polls: usize) -> Self {
        self.poll_errors = polls;
        self
    }

    /// Polls report UNKNOWN this many times, after any poll errors.
    pub fn with_unknown_polls(mut self, polls: usize) -> Self {
        self.unknown_polls = polls;
        self
    }

    /// Item `item` fails its first `times` attempts.
    pub fn failing(self, item: &str, times: u32) -> Self {
        lock(&self.failures).insert(item.to_string(), times);
        self
    }

    /// Launching `item` returns an error.
    pub fn rejecting(mut self, item: &str) -> Self {
        self.rejected.insert(item.to_string());
        self
    }

    /// Launching any item of `step` creates `files` in its output location.
    pub fn producing(mut self, step: &str, files: &[&str], data: Arc<MemoryData>) -> Self {
        self.outputs
            .insert(step.to_string(), files.iter().map(|f| f.to_string()).collect());
        self.data = Some(data);
        self
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    /// `(step, item, attempt)` of every launch, in order.
    pub fn launches(&self) -> Vec<(String, String, u32)> {
        lock(&self.launches).clone()
    }
}

impl ExecBackend for ScriptedExecutor {
    fn context(&self) -> &str {
        &self.context
    }

    fn data_scheme(&self) -> &str {
        &self.scheme
    }

    fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    fn validate(&self, _step: &str, _app: &AppDef) -> Result<(), BackendError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn launch(&self, invocation: &Invocation<'_>) -> Result<RunRecord, BackendError> {
        lock(&self.launches).push((
            invocation.step.to_string(),
            invocation.item.to_string(),
            invocation.attempt,
        ));

        if self.rejected.contains(invocation.item) {
            return Err(BackendError::Rejected(format!(
                "scripted launch failure for {}",
                invocation.item
            )));
        }

        let fails = match lock(&self.failures).get_mut(invocation.item) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };

        if let (Some(files), Some(data)) = (self.outputs.get(invocation.step), &self.data) {
            for file in files {
                data.touch(&format!("{}/{}", invocation.data_uri.path(), file));
            }
        }

        Ok(RunRecord::launched(self.initial)
            .with_field("job_id", format!("{}-{}", invocation.item, invocation.attempt))
            .with_handle(ScriptedRun {
                fails,
                poll_errors: self.poll_errors,
                unknown_polls: self.unknown_polls,
                pending_polls: self.pending_polls,
            }))
    }

    fn poll(&self, run: &mut RunRecord) -> Result<ItemStatus, BackendError> {
        let script = run
            .handle_mut::<ScriptedRun>()
            .ok_or_else(|| BackendError::Rejected("missing scripted handle".into()))?;
        if script.poll_errors > 0 {
            script.poll_errors -= 1;
            return Err(BackendError::Transient("status service timed out".into()));
        }
        if script.unknown_polls > 0 {
            script.unknown_polls -= 1;
            return Ok(ItemStatus::Unknown);
        }
        if script.pending_polls > 0 {
            script.pending_polls -= 1;
            return Ok(ItemStatus::Running);
        }
        Ok(if script.fails {
            ItemStatus::Failed
        } else {
            ItemStatus::Finished
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tree_operations() {
        let mem = MemoryData::new("mem");
        let dir = Uri::parse("mem:/a/b").unwrap();
        mem.mkdir(&dir, true).unwrap();
        mem.touch("/a/b/x.txt");
        mem.touch("/a/b/sub/y.txt");

        assert_eq!(mem.list(&dir).unwrap(), vec!["sub", "x.txt"]);

        let dest = Uri::parse("mem:/c").unwrap();
        mem.copy(&dir, &dest).unwrap();
        assert!(mem.is_file("/c/sub/y.txt"));

        mem.delete(&dir).unwrap();
        assert!(!mem.exists(&dir).unwrap());
        assert!(mem.is_dir("/a"));
    }

    #[test]
    fn test_memory_mkdir_non_recursive_needs_parent() {
        let mem = MemoryData::new("mem");
        assert!(mem.mkdir(&Uri::parse("mem:/x/y").unwrap(), false).is_err());
        assert!(mem.mkdir(&Uri::parse("mem:/x").unwrap(), false).is_ok());
    }
}
