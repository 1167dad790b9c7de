use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reasons why an executable image could not be read
///
/// These never abort a scan: the scanner records them on the node that failed and moves on.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("file not found or not readable: {}", path.display())]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid executable image {}: {reason}", path.display())]
    InvalidContainer { path: PathBuf, reason: String },

    #[error("unsupported machine type {machine:#06x} in {}", path.display())]
    UnsupportedArchitecture { path: PathBuf, machine: u16 },
}

/// Scan-level failures
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,

    #[error("maximum dependency depth {limit} exceeded at {}", path.display())]
    DepthLimitExceeded { path: PathBuf, limit: usize },

    #[error("could not enumerate directory {}", path.display())]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a worker thread panicked during the parallel scan")]
    WorkerPanicked,

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Failures while persisting or loading a missing-modules report
#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("malformed missing-modules report")]
    JsonError(#[from] serde_json::Error),
}

/// Key under which a path is memoized: absolute, lowercase (the target filesystem is case-insensitive)
pub fn normalized_key<P: AsRef<Path>>(p: P) -> String {
    let p = p.as_ref();
    let absolute = std::path::absolute(p).unwrap_or_else(|_| p.to_owned());
    absolute.to_string_lossy().to_lowercase()
}

/// File name component of a path, or the whole string if there is none (e.g. a bare DLL name)
pub fn file_name_of<P: AsRef<Path>>(p: P) -> String {
    let p = p.as_ref();
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| p.to_string_lossy().into_owned())
}

pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

/// Strip the extended-length prefix that `canonicalize` adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, std::io::Error> {
    Ok(decanonicalize(&path_to_string(fs_err::canonicalize(p)?)))
}
