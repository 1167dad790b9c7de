extern crate thiserror;

mod workqueue;

pub mod common;
pub mod lookup_path;
pub mod models;
pub mod pe;
pub mod query;
pub mod report;
pub mod scanner;
pub mod system;

pub use common::{decanonicalize, path_to_string, readable_canonical_path};
pub use common::{ImageError, ReportError, ScanError};
pub use lookup_path::{LookupPath, LookupPathEntry, ResolveResult, ResolverConfig};
pub use models::{DependencyNode, DependencyTree, NodeId, NodeLocation};
pub use query::ScanParameters;
pub use report::MissingReport;
pub use scanner::{CancelHandle, DependencyScanner, ScanProgress, ScanReport, ScanState};

use std::path::Path;
use std::sync::Arc;

/// Scan a single file with default resolver settings
pub fn scan<P: AsRef<Path>>(path: P, parameters: ScanParameters) -> Result<DependencyTree, ScanError> {
    let scanner = DependencyScanner::new(Arc::new(LookupPath::default()), parameters);
    scanner.scan_file(path)
}
