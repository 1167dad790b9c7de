use crate::common::normalized_key;
use crate::system::{is_well_known_system_module, WinFileSystemCache, WindowsSystem};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory to be searched, and the reason it is on the search path
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum LookupPathEntry {
    /// Directory containing the module whose imports are being resolved
    ExecutableDir(PathBuf),
    /// Windows System directory, or its 32-bit compatibility counterpart
    SystemDir(PathBuf),
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// Entry of the search path environment variable
    SystemPath(PathBuf),
}

impl LookupPathEntry {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::SystemDir(_) | Self::WindowsDir(_))
    }

    pub fn get_path(&self) -> &Path {
        match self {
            Self::ExecutableDir(p)
            | Self::SystemDir(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p) => p,
        }
    }
}

/// Outcome of a DLL lookup
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ResolveResult {
    /// Name as it appears in the import table
    pub module_name: String,
    pub resolved_path: Option<PathBuf>,
    /// Search path entry where the file was found
    pub location: Option<LookupPathEntry>,
    /// Every candidate that was tested, in order, including the match
    pub attempted_paths: Vec<PathBuf>,
}

impl ResolveResult {
    pub fn found(&self) -> bool {
        self.resolved_path.is_some()
    }
}

/// Settings of the (virtual) process whose DLL lookup we are simulating
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// System directories; `None` leaves the system steps out of the search order
    pub system: Option<WindowsSystem>,
    /// Working directory; `None` means the current directory of this process
    pub working_dir: Option<PathBuf>,
    /// Environment variable listing additional search directories
    pub search_path_var: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            system: WindowsSystem::detected().cloned(),
            working_dir: None,
            search_path_var: "PATH".to_owned(),
        }
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Clone)]
struct ResolveKey {
    module_name: String,
    origin_dir: String,
    search_path_hash: u64,
}

/// Reproduces the standard DLL search order for desktop applications
///
/// Safe to share between threads; all caches are internally synchronized.
#[derive(Debug)]
pub struct LookupPath {
    config: ResolverConfig,
    /// System and Windows directories, enumerated once
    system_entries: Vec<LookupPathEntry>,
    fs_cache: WinFileSystemCache,
    resolve_cache: RwLock<HashMap<ResolveKey, ResolveResult>>,
    /// Filtered search path directories, for the last seen value of the variable
    search_path_cache: Mutex<Option<(OsString, Vec<PathBuf>)>>,
    system_module_cache: RwLock<HashMap<String, bool>>,
}

impl Default for LookupPath {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl LookupPath {
    pub fn new(config: ResolverConfig) -> Self {
        let system_entries = config
            .system
            .as_ref()
            .map(|system| {
                let mut entries = vec![LookupPathEntry::SystemDir(system.sys_dir.clone())];
                entries.extend(system.wow64_dir.clone().map(LookupPathEntry::SystemDir));
                entries.push(LookupPathEntry::WindowsDir(system.win_dir.clone()));
                entries
            })
            .unwrap_or_default();

        Self {
            config,
            system_entries,
            fs_cache: WinFileSystemCache::new(),
            resolve_cache: RwLock::new(HashMap::new()),
            search_path_cache: Mutex::new(None),
            system_module_cache: RwLock::new(HashMap::new()),
        }
    }

    fn search_path_value(&self) -> OsString {
        std::env::var_os(&self.config.search_path_var).unwrap_or_default()
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
    }

    /// Directories listed in the search path variable, minus empty, duplicate, missing and network entries
    fn search_path_directories(&self, value: &OsString) -> Vec<PathBuf> {
        let mut cache = self.search_path_cache.lock();
        if let Some((cached_value, dirs)) = cache.as_ref() {
            if cached_value == value {
                return dirs.clone();
            }
        }

        let mut seen = HashSet::new();
        let dirs: Vec<PathBuf> = std::env::split_paths(value)
            .filter_map(|p| {
                let trimmed = p.to_string_lossy().trim().to_owned();
                if trimmed.is_empty() {
                    return None;
                }
                // UNC shares can stall for a long time when the host is unreachable
                if trimmed.starts_with(r"\\") || trimmed.starts_with("//") {
                    debug!("skipping network search path entry {trimmed}");
                    return None;
                }
                let dir = PathBuf::from(trimmed);
                if !dir.is_dir() {
                    return None;
                }
                let dir = std::path::absolute(&dir).unwrap_or(dir);
                seen.insert(normalized_key(&dir)).then_some(dir)
            })
            .collect();

        *cache = Some((value.clone(), dirs.clone()));
        dirs
    }

    /// linearize the search order for a module imported by a file in `origin_dir`
    ///
    /// Directories appearing more than once are only kept at their first position.
    pub fn search_path<P: AsRef<Path>>(&self, origin_dir: P) -> Vec<LookupPathEntry> {
        self.search_path_for(origin_dir.as_ref(), &self.search_path_value())
    }

    fn search_path_for(&self, origin_dir: &Path, search_path_value: &OsString) -> Vec<LookupPathEntry> {
        let mut candidates = Vec::new();
        if !origin_dir.as_os_str().is_empty() {
            candidates.push(LookupPathEntry::ExecutableDir(origin_dir.to_owned()));
        }
        candidates.extend(self.system_entries.iter().cloned());
        if let Some(wd) = self.working_dir() {
            candidates.push(LookupPathEntry::WorkingDir(wd));
        }
        candidates.extend(
            self.search_path_directories(search_path_value)
                .into_iter()
                .map(LookupPathEntry::SystemPath),
        );

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|e| seen.insert(normalized_key(e.get_path())))
            .collect()
    }

    /// looks for a DLL by name, as the loader would for a module located in `origin_dir`
    ///
    /// Results are memoized per module name, origin directory and search path value.
    pub fn resolve<P: AsRef<Path>>(&self, module_name: &str, origin_dir: P) -> ResolveResult {
        let origin_dir = origin_dir.as_ref();
        let search_path_value = self.search_path_value();
        let mut hasher = DefaultHasher::new();
        search_path_value.hash(&mut hasher);
        let key = ResolveKey {
            module_name: module_name.to_lowercase(),
            origin_dir: normalized_key(origin_dir),
            search_path_hash: hasher.finish(),
        };

        if let Some(cached) = self.resolve_cache.read().get(&key) {
            return cached.clone();
        }

        let result = self.resolve_uncached(module_name, origin_dir, &search_path_value);
        self.resolve_cache.write().insert(key, result.clone());
        result
    }

    fn resolve_uncached(
        &self,
        module_name: &str,
        origin_dir: &Path,
        search_path_value: &OsString,
    ) -> ResolveResult {
        let mut result = ResolveResult {
            module_name: module_name.to_owned(),
            resolved_path: None,
            location: None,
            attempted_paths: Vec::new(),
        };

        let as_path = Path::new(module_name);
        if as_path.is_absolute() && as_path.is_file() {
            result.resolved_path = Some(as_path.to_owned());
            return result;
        }

        for entry in self.search_path_for(origin_dir, search_path_value) {
            let dir = entry.get_path();
            result.attempted_paths.push(dir.join(module_name));
            if let Some(found) = self
                .fs_cache
                .test_file_in_folder_case_insensitive(module_name, dir)
            {
                result.resolved_path = Some(found);
                result.location = Some(entry);
                return result;
            }
        }

        result
    }

    /// Whether the DLL is provided by the operating system
    ///
    /// True for well-known system DLL names and prefixes, and for any file present in a system
    /// directory.
    pub fn is_system_module(&self, module_name: &str) -> bool {
        let lowercase = module_name.to_lowercase();
        if let Some(&cached) = self.system_module_cache.read().get(&lowercase) {
            return cached;
        }

        let is_system = is_well_known_system_module(&lowercase)
            || self.system_entries.iter().any(|e| {
                self.fs_cache
                    .test_file_in_folder_case_insensitive(module_name, e.get_path())
                    .is_some()
            });

        self.system_module_cache.write().insert(lowercase, is_system);
        is_system
    }
}
