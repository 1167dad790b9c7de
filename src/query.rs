//! Parameters for a DLL scan

/// Maximum nesting of imports followed before a branch is abandoned
pub const DEFAULT_MAX_DEPTH: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanParameters {
    /// Also descend into DLLs provided by the operating system
    pub include_system_modules: bool,
    /// Descend into subdirectories when scanning a directory
    pub recursive: bool,
    /// Maximum library recursion depth for the search
    pub max_depth: usize,
    /// Worker threads for parallel directory scans
    pub workers: usize,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            include_system_modules: false,
            recursive: false,
            max_depth: DEFAULT_MAX_DEPTH,
            workers: 4,
        }
    }
}
