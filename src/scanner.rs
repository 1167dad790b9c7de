//! Recursive dependency scan of executables and directories of executables

use crate::common::{file_name_of, normalized_key, path_to_string, ImageError, ScanError};
use crate::lookup_path::LookupPath;
use crate::models::{DependencyNode, DependencyTree, NodeId};
use crate::pe::{self, ImageInfo};
use crate::query::ScanParameters;
use crate::workqueue::Workqueue;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Extensions of the files picked up by directory scans
const MODULE_EXTENSIONS: &[&str] = &["dll", "exe"];

/// Cooperative cancellation flag, shared between the scanner and whoever wants to stop it
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub current: usize,
    pub total: usize,
    pub file_name: String,
}

pub type ProgressCallback = Arc<dyn Fn(&ScanProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Completed,
    Cancelled,
}

/// Outcome of a scan call
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// One tree per root file that was completely scanned
    pub roots: Vec<DependencyTree>,
    pub state: ScanState,
    /// Modules whose imports were not followed because they sit beyond the depth guard
    pub depth_limited: Vec<PathBuf>,
}

impl ScanReport {
    pub fn is_cancelled(&self) -> bool {
        self.state == ScanState::Cancelled
    }
}

// completed subtree as produced by the recursion; shared between importers while the scan runs
// and turned into independent per-occurrence nodes when flattened into a DependencyTree
#[derive(Debug, Default)]
struct Subtree {
    node: DependencyNode,
    children: Vec<Arc<Subtree>>,
    // keys of the modules expanded in this subtree, its root included
    members: HashSet<String>,
    // keys of cycle markers pointing above the root of this subtree
    open_cycles: HashSet<String>,
    height: usize,
    // some import was dropped by the depth guard
    truncated: bool,
}

impl Subtree {
    fn leaf(node: DependencyNode) -> Arc<Self> {
        Arc::new(Self {
            node,
            ..Self::default()
        })
    }

    fn cycle_marker(path: &Path, key: String) -> Arc<Self> {
        Arc::new(Self {
            node: DependencyNode {
                exists: true,
                cycle_reference: true,
                file_path: path_to_string(path),
                ..DependencyNode::missing(&file_name_of(path))
            },
            open_cycles: HashSet::from([key]),
            ..Self::default()
        })
    }

    fn expanded(
        key: String,
        node: DependencyNode,
        children: Vec<Arc<Subtree>>,
        truncated: bool,
    ) -> Self {
        let mut ret = Self {
            node,
            truncated,
            ..Self::default()
        };
        for child in &children {
            ret.members.extend(child.members.iter().cloned());
            ret.open_cycles.extend(child.open_cycles.iter().cloned());
            ret.height = ret.height.max(child.height + 1);
            ret.truncated |= child.truncated;
        }
        ret.open_cycles.remove(&key);
        ret.members.insert(key);
        ret.children = children;
        ret
    }

    // the same subtree would come out of a fresh scan from anywhere else
    fn is_context_free(&self) -> bool {
        !self.truncated && self.open_cycles.is_empty()
    }
}

enum Visit {
    Done(Arc<Subtree>),
    DepthLimited,
    Cancelled,
}

// cycle detection state for one root; never shared between concurrently scanned roots
#[derive(Default)]
struct ScanContext {
    ancestors: Vec<String>,
    ancestor_set: HashSet<String>,
    depth_limited: Vec<PathBuf>,
}

impl ScanContext {
    fn push(&mut self, key: String) {
        self.ancestor_set.insert(key.clone());
        self.ancestors.push(key);
    }

    fn pop(&mut self) {
        if let Some(key) = self.ancestors.pop() {
            self.ancestor_set.remove(&key);
        }
    }
}

/// Builds dependency trees by parsing modules and resolving their imports recursively
///
/// Completed subtrees are memoized by path for the duration of a scan call, and handed out as
/// independent copies wherever they are imported again.
pub struct DependencyScanner {
    lookup_path: Arc<LookupPath>,
    parameters: ScanParameters,
    cache: RwLock<HashMap<String, Weak<Subtree>>>,
    cancel: CancelHandle,
    progress: Option<ProgressCallback>,
}

impl DependencyScanner {
    pub fn new(lookup_path: Arc<LookupPath>, parameters: ScanParameters) -> Self {
        Self {
            lookup_path,
            parameters,
            cache: RwLock::new(HashMap::new()),
            cancel: CancelHandle::new(),
            progress: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn parameters(&self) -> &ScanParameters {
        &self.parameters
    }

    pub fn lookup_path(&self) -> &LookupPath {
        &self.lookup_path
    }

    /// Handle that stops the running scan from anywhere, including the progress callback
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn report_progress(&self, current: usize, total: usize, file_name: &str) {
        if let Some(callback) = &self.progress {
            callback(&ScanProgress {
                current,
                total,
                file_name: file_name.to_owned(),
            });
        }
    }

    // cache entries whose subtree is no longer referenced by any result are useless
    fn prune_cache(&self) {
        self.cache.write().retain(|_, w| w.strong_count() > 0);
    }

    /// Scan a single executable and everything it imports
    ///
    /// A root that does not exist yields a one-node tree with `exists == false`.
    pub fn scan_file<P: AsRef<Path>>(&self, path: P) -> Result<DependencyTree, ScanError> {
        self.scan_file_report(path)?
            .roots
            .pop()
            .ok_or(ScanError::Cancelled)
    }

    /// Same as `scan_file`, also returning the modules cut by the depth guard
    pub fn scan_file_report<P: AsRef<Path>>(&self, path: P) -> Result<ScanReport, ScanError> {
        self.cancel.reset();
        let path = std::path::absolute(path.as_ref())?;
        let file_name = file_name_of(&path);
        info!("scanning {}", path.display());
        self.report_progress(0, 1, &file_name);

        let mut context = ScanContext::default();
        let visited = self.visit(&path, 0, &mut context);
        let ret = match visited {
            Visit::Done(s) => Ok(ScanReport {
                roots: vec![self.flatten(&s)],
                state: ScanState::Completed,
                depth_limited: context.depth_limited,
            }),
            _ => Err(ScanError::Cancelled),
        };
        self.prune_cache();

        if ret.is_ok() {
            self.report_progress(1, 1, &file_name);
        }
        ret
    }

    /// Scan every executable and library in a directory, one root after the other
    pub fn scan_directory<P: AsRef<Path>>(&self, dir: P) -> Result<ScanReport, ScanError> {
        self.cancel.reset();
        let roots = enumerate_modules(dir.as_ref(), self.parameters.recursive)?;
        let total = roots.len();
        info!("scanning {total} modules in {}", dir.as_ref().display());

        // keeps memoized subtrees alive across roots
        let mut retained = Vec::with_capacity(total);
        let mut report = ScanReport {
            roots: Vec::with_capacity(total),
            state: ScanState::Completed,
            depth_limited: Vec::new(),
        };

        for (i, root) in roots.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.state = ScanState::Cancelled;
                break;
            }
            let mut context = ScanContext::default();
            match self.visit(root, 0, &mut context) {
                Visit::Done(subtree) => {
                    report.roots.push(self.flatten(&subtree));
                    retained.push(subtree);
                }
                _ => {
                    report.state = ScanState::Cancelled;
                    break;
                }
            }
            report.depth_limited.extend(context.depth_limited);
            self.report_progress(i + 1, total, &file_name_of(root));
        }

        drop(retained);
        self.prune_cache();
        info!("scanned {} of {total} modules", report.roots.len());
        Ok(report)
    }

    /// Same as `scan_directory`, with the root files distributed over a pool of worker threads
    ///
    /// The order of the resulting trees is unspecified.
    pub fn scan_directory_parallel<P: AsRef<Path>>(
        &self,
        dir: P,
        workers: usize,
    ) -> Result<ScanReport, ScanError> {
        self.cancel.reset();
        let roots = enumerate_modules(dir.as_ref(), self.parameters.recursive)?;
        let total = roots.len();
        info!(
            "scanning {total} modules in {} with {workers} workers",
            dir.as_ref().display()
        );

        let mut wq = Workqueue::new(workers);
        for root in roots {
            wq.enqueue(root);
        }

        let retained = Mutex::new(Vec::with_capacity(total));
        let depth_limited = Mutex::new(Vec::new());
        let completed = AtomicUsize::new(0);
        let results = wq.run(&self.cancel, |root: PathBuf| {
            let mut context = ScanContext::default();
            let Visit::Done(subtree) = self.visit(&root, 0, &mut context) else {
                return None;
            };
            depth_limited.lock().extend(context.depth_limited);
            let tree = self.flatten(&subtree);
            retained.lock().push(subtree);
            let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
            self.report_progress(current, total, &file_name_of(&root));
            Some(tree)
        })?;

        drop(retained);
        self.prune_cache();

        // roots are only dropped when the scan is cancelled
        let state = if results.len() < total {
            ScanState::Cancelled
        } else {
            ScanState::Completed
        };
        info!("scanned {} of {total} modules", results.len());
        Ok(ScanReport {
            roots: results,
            state,
            depth_limited: depth_limited.into_inner(),
        })
    }

    fn visit(&self, path: &Path, depth: usize, context: &mut ScanContext) -> Visit {
        if self.cancel.is_cancelled() {
            return Visit::Cancelled;
        }

        if depth > self.parameters.max_depth {
            self.depth_limit_reached(path, context);
            return Visit::DepthLimited;
        }

        let key = normalized_key(path);
        if context.ancestor_set.contains(&key) {
            warn!(
                "dependency cycle: {} is imported again by {}",
                path.display(),
                context.ancestors.last().map(String::as_str).unwrap_or_default()
            );
            return Visit::Done(Subtree::cycle_marker(path, key));
        }

        let cached = self.cache.read().get(&key).and_then(Weak::upgrade);
        if let Some(cached) = cached {
            // unless it would reach past the depth guard, or contains one of the current ancestors
            if depth + cached.height <= self.parameters.max_depth
                && cached.members.is_disjoint(&context.ancestor_set)
            {
                debug!("reusing scan of {}", path.display());
                return Visit::Done(cached);
            }
            debug!("scan of {} can't be reused here, scanning again", path.display());
        }

        let image = pe::parse(path);
        let node = node_from_image(path, &image);
        if !node.exists {
            return Visit::Done(Subtree::leaf(node));
        }
        if let Some(e) = &image.error {
            warn!("{e}");
        } else {
            debug!(
                "parsed {} ({}, {} imports)",
                path.display(),
                image.architecture,
                image.dependencies.len()
            );
        }

        context.push(key.clone());
        let children = self.visit_dependencies(path, &image, depth, context);
        context.pop();

        // a cancelled subtree is incomplete, don't let anyone reuse it
        let Some((children, truncated)) = children else {
            return Visit::Cancelled;
        };
        let subtree = Arc::new(Subtree::expanded(key.clone(), node, children, truncated));
        if subtree.is_context_free() {
            self.cache.write().insert(key, Arc::downgrade(&subtree));
        }
        Visit::Done(subtree)
    }

    // None when cancelled; otherwise the children, and whether the depth guard dropped any
    fn visit_dependencies(
        &self,
        path: &Path,
        image: &ImageInfo,
        depth: usize,
        context: &mut ScanContext,
    ) -> Option<(Vec<Arc<Subtree>>, bool)> {
        let origin_dir = path.parent().unwrap_or_else(|| Path::new(""));
        let mut children = Vec::with_capacity(image.dependencies.len());
        let mut truncated = false;

        for dllname in &image.dependencies {
            if self.cancel.is_cancelled() {
                return None;
            }
            if !self.parameters.include_system_modules
                && self.lookup_path.is_system_module(dllname)
            {
                continue;
            }

            let resolved = self.lookup_path.resolve(dllname, origin_dir);
            match resolved.resolved_path {
                Some(dll_path) => match self.visit(&dll_path, depth + 1, context) {
                    Visit::Done(child) => children.push(child),
                    Visit::DepthLimited => truncated = true,
                    Visit::Cancelled => return None,
                },
                None if depth >= self.parameters.max_depth => {
                    self.depth_limit_reached(Path::new(dllname), context);
                    truncated = true;
                }
                None => {
                    debug!(
                        "{dllname} not found, tried {} locations",
                        resolved.attempted_paths.len()
                    );
                    children.push(Subtree::leaf(DependencyNode::missing(dllname)));
                }
            }
        }

        Some((children, truncated))
    }

    fn depth_limit_reached(&self, path: &Path, context: &mut ScanContext) {
        warn!(
            "{}",
            ScanError::DepthLimitExceeded {
                path: path.to_owned(),
                limit: self.parameters.max_depth
            }
        );
        context.depth_limited.push(path.to_owned());
    }

    // every occurrence of a shared subtree becomes a distinct set of nodes with its own parent
    fn flatten(&self, subtree: &Subtree) -> DependencyTree {
        let mut tree = DependencyTree::new(subtree.node.clone());
        let root = tree.root_id();
        self.attach_children(&mut tree, root, subtree);
        tree
    }

    fn attach_children(&self, tree: &mut DependencyTree, parent: NodeId, subtree: &Subtree) {
        let parent_architecture = subtree.node.architecture;
        for child in &subtree.children {
            let mut node = child.node.clone();
            node.arch_mismatch = node.exists && parent_architecture.cannot_load(node.architecture);
            if node.arch_mismatch {
                warn!(
                    "{} is {} but is imported by a {} module",
                    node.file_name, node.architecture, parent_architecture
                );
            }
            let id = tree.add_child(parent, node);
            self.attach_children(tree, id, child);
        }
    }
}

fn node_from_image(path: &Path, image: &ImageInfo) -> DependencyNode {
    let exists = !matches!(image.error, Some(ImageError::FileNotFound { .. }));
    DependencyNode {
        file_path: path_to_string(path),
        file_name: file_name_of(path),
        architecture: image.architecture,
        file_version: image.file_version.clone(),
        product_version: image.product_version.clone(),
        exists,
        arch_mismatch: false,
        cycle_reference: false,
        error: if exists { image.error_message() } else { None },
        children: Vec::new(),
        parent: None,
        depth: 0,
    }
}

fn has_module_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MODULE_EXTENSIONS.iter().any(|m| e.eq_ignore_ascii_case(m)))
        .unwrap_or(false)
}

/// List the executables and libraries in a directory, sorted by name within each directory
pub fn enumerate_modules(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, ScanError> {
    let dir = std::path::absolute(dir)?;
    // the root itself must be listable, problems further down only cost the affected subdirectory
    std::fs::read_dir(&dir).map_err(|source| ScanError::Enumeration {
        path: dir.clone(),
        source,
    })?;

    let mut walker = walkdir::WalkDir::new(&dir).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut ret = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && has_module_extension(entry.path()) {
                    ret.push(entry.into_path());
                }
            }
            Err(e) => warn!("skipping unreadable entry: {e}"),
        }
    }
    Ok(ret)
}
