#[cfg(windows)]
extern crate winapi;
use parking_lot::RwLock;
use std::collections::HashMap;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// DLLs shipped with every Windows installation
pub const KNOWN_SYSTEM_MODULES: &[&str] = &[
    "kernel32.dll",
    "user32.dll",
    "gdi32.dll",
    "advapi32.dll",
    "shell32.dll",
    "ole32.dll",
    "oleaut32.dll",
    "comctl32.dll",
    "comdlg32.dll",
    "ws2_32.dll",
    "msvcrt.dll",
    "ntdll.dll",
    "rpcrt4.dll",
    "secur32.dll",
    "winmm.dll",
    "version.dll",
    "imagehlp.dll",
    "dbghelp.dll",
    "psapi.dll",
    "iphlpapi.dll",
    "netapi32.dll",
    "userenv.dll",
    "winspool.drv",
    "imm32.dll",
    "msimg32.dll",
    "setupapi.dll",
    "wininet.dll",
    "crypt32.dll",
    "wintrust.dll",
    "shlwapi.dll",
    "mpr.dll",
    "credui.dll",
];

/// API set contracts and the universal CRT are always provided by the OS
pub const SYSTEM_MODULE_PREFIXES: &[&str] = &["api-ms-win-", "ext-ms-win-", "ucrtbase"];

/// Whether the (lowercase) name is one of the curated system DLLs or matches a system prefix
pub fn is_well_known_system_module(lowercase_name: &str) -> bool {
    KNOWN_SYSTEM_MODULES.contains(&lowercase_name)
        || SYSTEM_MODULE_PREFIXES
            .iter()
            .any(|prefix| lowercase_name.starts_with(prefix))
}

/// System directories of a Windows installation
///
/// If running from within Windows we ask the Windows API.
/// In another OS we can only guess the directories from a mounted partition root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsSystem {
    /// Windows System directory (typically C:\Windows\System32)
    pub sys_dir: PathBuf,
    /// 32-bit compatibility directory (typically C:\Windows\SysWOW64), absent on 32-bit systems
    pub wow64_dir: Option<PathBuf>,
    /// Windows directory (typically C:\Windows)
    pub win_dir: PathBuf,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, std::io::Error> {
        Ok(Self {
            sys_dir: get_system_directory()?,
            wow64_dir: get_system_wow64_directory().ok(),
            win_dir: get_windows_directory()?,
        })
    }

    /// The host system, detected once per process
    ///
    /// Always `None` outside of Windows: use `from_root` to point at a mounted partition.
    pub fn detected() -> Option<&'static WindowsSystem> {
        static DETECTED: OnceLock<Option<WindowsSystem>> = OnceLock::new();
        DETECTED
            .get_or_init(|| {
                #[cfg(windows)]
                {
                    match Self::current() {
                        Ok(s) => Some(s),
                        Err(e) => {
                            debug!("could not query the system directories: {e}");
                            None
                        }
                    }
                }
                #[cfg(not(windows))]
                {
                    debug!("not running on Windows, no system directories available");
                    None
                }
            })
            .as_ref()
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if sys_dir.is_dir() {
            let wow64_dir = Some(win_dir.join("SysWOW64")).filter(|d| d.is_dir());
            Some(Self {
                sys_dir,
                wow64_dir,
                win_dir,
            })
        } else {
            None
        }
    }

    /// System directories in the order the loader consults them
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut ret = vec![self.sys_dir.clone()];
        ret.extend(self.wow64_dir.clone());
        ret.push(self.win_dir.clone());
        ret
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 || ret as usize > BFR_SIZE {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        Ok(PathBuf::from(OsString::from_wide(valid_bfr)))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the 32-bit System directory on 64-bit Windows (typically C:\Windows\SysWOW64)
#[cfg(windows)]
fn get_system_wow64_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::wow64apiset::GetSystemWow64DirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
///
/// Lookups are case-insensitive, as on the target platform. Shared between scanning threads.
#[derive(Debug, Default)]
pub(crate) struct WinFileSystemCache {
    files_in_dirs: RwLock<HashMap<PathBuf, HashMap<String, PathBuf>>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Full path of the file in the folder whose name matches ignoring case, if any
    pub(crate) fn test_file_in_folder_case_insensitive<Q: AsRef<Path>>(
        &self,
        filename: &str,
        folder: Q,
    ) -> Option<PathBuf> {
        let folder = folder.as_ref();
        let lowercase = filename.to_lowercase();
        if let Some(dir) = self.files_in_dirs.read().get(folder) {
            return dir.get(&lowercase).map(|p| folder.join(p));
        }

        let listing = Self::scan_folder(folder);
        let found = listing.get(&lowercase).map(|p| folder.join(p));
        self.files_in_dirs.write().insert(folder.to_owned(), listing);
        found
    }

    fn scan_folder(folder: &Path) -> HashMap<String, PathBuf> {
        match fs_err::read_dir(folder) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.metadata().map_or_else(|_| false, |m| m.is_file()))
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .map(|s| (s.to_lowercase(), entry.file_name().into()))
                })
                .collect(),
            Err(e) => {
                debug!("skipping unreadable directory: {e}");
                HashMap::new()
            }
        }
    }
}
