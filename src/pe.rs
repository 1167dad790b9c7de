//! Low-level PE file format access through the goblin and pelite libraries

use crate::common::ImageError;
use dataview::DataView;
use fs_err as fs;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
const SIZEOF_DOS_HEADER: usize = 64;
const DOS_PE_POINTER_OFFSET: usize = 0x3C;
const SIZEOF_COFF_HEADER: usize = 20;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

const VS_FIXEDFILEINFO_SIGNATURE: u32 = 0xFEEF_04BD;
const SIZEOF_VS_FIXEDFILEINFO: usize = 52;

const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;
const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
const SIZEOF_RESOURCE_DIRECTORY: usize = 16;
const SIZEOF_RESOURCE_DIRECTORY_ENTRY: usize = 8;
const RESOURCE_DATA_IS_DIRECTORY: u32 = 0x8000_0000;
const RT_VERSION: u32 = 16;

/// Machine the image was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Architecture {
    #[default]
    Unknown,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x64")]
    X64,
}

impl Architecture {
    pub fn from_machine(machine: u16) -> Self {
        match machine {
            IMAGE_FILE_MACHINE_I386 => Architecture::X86,
            IMAGE_FILE_MACHINE_AMD64 => Architecture::X64,
            _ => Architecture::Unknown,
        }
    }

    /// A 64-bit process can't load a 32-bit DLL; the other way round goes through WOW64
    pub fn cannot_load(self, dependency: Architecture) -> bool {
        self == Architecture::X64 && dependency == Architecture::X86
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Unknown => "Unknown",
        })
    }
}

/// Everything we extract from an executable file
#[derive(Debug)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub architecture: Architecture,
    /// Names of the imported DLLs, in import table order
    pub dependencies: Vec<String>,
    /// Empty if the file has no version resource
    pub file_version: String,
    pub product_version: String,
    pub file_size: u64,
    pub modified: Option<SystemTime>,
    pub error: Option<ImageError>,
}

impl ImageInfo {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            architecture: Architecture::Unknown,
            dependencies: Vec::new(),
            file_version: String::new(),
            product_version: String::new(),
            file_size: 0,
            modified: None,
            error: None,
        }
    }

    fn failed(path: &Path, error: ImageError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(path)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Read and validate the executable at the given path
///
/// Never fails: problems are reported through `ImageInfo::error`, and a file that is not a
/// supported PE image comes back with `Architecture::Unknown` and no dependencies.
pub fn parse<P: AsRef<Path>>(path: P) -> ImageInfo {
    let path = path.as_ref();

    let metadata = match fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => {
            let source = std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file");
            return ImageInfo::failed(path, ImageError::FileNotFound { path: path.to_owned(), source });
        }
        Err(source) => {
            return ImageInfo::failed(path, ImageError::FileNotFound { path: path.to_owned(), source })
        }
    };
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(source) => {
            return ImageInfo::failed(path, ImageError::FileNotFound { path: path.to_owned(), source })
        }
    };

    let mut info = ImageInfo::new(path);
    info.file_size = metadata.len();
    info.modified = metadata.modified().ok();

    let machine = match read_machine(&content) {
        Ok(m) => m,
        Err(reason) => {
            info.error = Some(ImageError::InvalidContainer { path: path.to_owned(), reason });
            return info;
        }
    };
    let architecture = Architecture::from_machine(machine);
    if architecture == Architecture::Unknown {
        info.error = Some(ImageError::UnsupportedArchitecture { path: path.to_owned(), machine });
        return info;
    }

    info.architecture = architecture;

    match goblin::pe::PE::parse(&content) {
        Ok(pe) => {
            info.dependencies = read_dependencies(&pe);
            if let Some((file_version, product_version)) = read_version_info(&content, &pe) {
                info.file_version = file_version;
                info.product_version = product_version;
            }
        }
        Err(e) => {
            debug!("goblin could not parse {}: {e}; retrying with pelite", path.display());
            match read_dependencies_pelite(&content) {
                Ok(deps) => info.dependencies = deps,
                Err(e) => debug!("no readable import table in {}: {e}", path.display()),
            }
        }
    }

    info
}

fn read_u16(view: &DataView, offset: usize) -> Option<u16> {
    view.try_read::<u16>(offset).map(u16::from_le)
}

fn read_u32(view: &DataView, offset: usize) -> Option<u32> {
    view.try_read::<u32>(offset).map(u32::from_le)
}

/// Walk the DOS header to the COFF header and return its machine field
fn read_machine(content: &[u8]) -> Result<u16, String> {
    let view = DataView::from(content);

    if content.len() < SIZEOF_DOS_HEADER {
        return Err("truncated DOS header".to_owned());
    }
    if read_u16(view, 0) != Some(IMAGE_DOS_SIGNATURE) {
        return Err("missing MZ signature".to_owned());
    }
    let pe_pointer = read_u32(view, DOS_PE_POINTER_OFFSET)
        .ok_or_else(|| "truncated DOS header".to_owned())? as usize;

    match read_u32(view, pe_pointer) {
        None => return Err("truncated PE signature".to_owned()),
        Some(IMAGE_NT_SIGNATURE) => {}
        Some(_) => return Err("missing PE signature".to_owned()),
    }

    let coff_offset = pe_pointer + 4;
    if content.len() < coff_offset + SIZEOF_COFF_HEADER {
        return Err("truncated COFF header".to_owned());
    }
    read_u16(view, coff_offset).ok_or_else(|| "truncated COFF header".to_owned())
}

/// read the names of the DLLs this executable depends on, in import table order
fn read_dependencies(pe: &goblin::pe::PE) -> Vec<String> {
    // `PE::libraries` is sorted and deduplicated, the import directory keeps the loader's order
    pe.import_data
        .as_ref()
        .map(|id| id.import_data.iter().map(|e| e.name.to_owned()).collect())
        .unwrap_or_default()
}

fn read_dependencies_pelite(content: &[u8]) -> Result<Vec<String>, pelite::Error> {
    let pefile = pelite::PeFile::from_bytes(content)?;
    let imports = pefile.imports()?;

    let names: Vec<&pelite::util::CStr> = imports
        .iter()
        .map(|desc| desc.dll_name())
        .collect::<Result<Vec<&pelite::util::CStr>, pelite::Error>>()?;

    Ok(names
        .iter()
        .filter_map(|s| s.to_str().ok())
        .map(|s| s.to_string())
        .collect::<Vec<String>>())
}

fn rva_to_offset(pe: &goblin::pe::PE, rva: u32) -> Option<usize> {
    pe.sections
        .iter()
        .find(|s| {
            let size = s.virtual_size.max(s.size_of_raw_data);
            rva >= s.virtual_address && rva - s.virtual_address < size
        })
        .map(|s| (rva - s.virtual_address) as usize + s.pointer_to_raw_data as usize)
}

/// RVA of the resource directory, if the image has one
fn resource_directory(view: &DataView) -> Option<u32> {
    let pe_pointer = read_u32(view, DOS_PE_POINTER_OFFSET)? as usize;
    let optional_header = pe_pointer + 4 + SIZEOF_COFF_HEADER;
    let (count, directories) = match read_u16(view, optional_header)? {
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => (optional_header + 92, optional_header + 96),
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => (optional_header + 108, optional_header + 112),
        _ => return None,
    };
    if read_u32(view, count)? as usize <= IMAGE_DIRECTORY_ENTRY_RESOURCE {
        return None;
    }
    let rva = read_u32(view, directories + IMAGE_DIRECTORY_ENTRY_RESOURCE * 8)?;
    (rva != 0).then_some(rva)
}

// OffsetToData of the entry with the given id, or of the first entry
fn resource_entry(view: &DataView, dir: usize, id: Option<u32>) -> Option<u32> {
    let named = read_u16(view, dir + 12)? as usize;
    let ids = read_u16(view, dir + 14)? as usize;
    (0..named + ids)
        .map(|i| dir + SIZEOF_RESOURCE_DIRECTORY + i * SIZEOF_RESOURCE_DIRECTORY_ENTRY)
        .find(|&entry| id.is_none() || read_u32(view, entry) == id)
        .and_then(|entry| read_u32(view, entry + 4))
}

fn resource_subdirectory(
    view: &DataView,
    base: usize,
    dir: usize,
    id: Option<u32>,
) -> Option<usize> {
    let offset = resource_entry(view, dir, id)?;
    if offset & RESOURCE_DATA_IS_DIRECTORY == 0 {
        return None;
    }
    Some(base + (offset & !RESOURCE_DATA_IS_DIRECTORY) as usize)
}

/// Follow the resource tree (type, name, language) to the version resource and decode file and
/// product version from its VS_FIXEDFILEINFO record
fn read_version_info(content: &[u8], pe: &goblin::pe::PE) -> Option<(String, String)> {
    let view = DataView::from(content);
    let base = rva_to_offset(pe, resource_directory(view)?)?;

    let names = resource_subdirectory(view, base, base, Some(RT_VERSION))?;
    let languages = resource_subdirectory(view, base, names, None)?;
    let entry = resource_entry(view, languages, None)?;
    if entry & RESOURCE_DATA_IS_DIRECTORY != 0 {
        return None;
    }

    let data_entry = base + entry as usize;
    let start = rva_to_offset(pe, read_u32(view, data_entry)?)?;
    let size = read_u32(view, data_entry + 4)? as usize;
    let end = start.checked_add(size)?.min(content.len());
    read_fixed_file_info(content.get(start..end)?)
}

/// Decode the fixed record at the start of a VS_VERSIONINFO block
fn read_fixed_file_info(block: &[u8]) -> Option<(String, String)> {
    let view = DataView::from(block);
    if (read_u16(view, 2)? as usize) < SIZEOF_VS_FIXEDFILEINFO {
        return None;
    }
    // the value follows the NUL-terminated UTF-16 key, DWORD-aligned
    let key_end = (6..block.len())
        .step_by(2)
        .find(|&offset| read_u16(view, offset) == Some(0))?
        + 2;
    let offset = (key_end + 3) & !3;
    if read_u32(view, offset)? != VS_FIXEDFILEINFO_SIGNATURE {
        return None;
    }
    Some((
        dotted_version(read_u32(view, offset + 8)?, read_u32(view, offset + 12)?),
        dotted_version(read_u32(view, offset + 16)?, read_u32(view, offset + 20)?),
    ))
}

/// Format a packed (most significant, least significant) version pair as a.b.c.d
pub fn dotted_version(ms: u32, ls: u32) -> String {
    format!("{}.{}.{}.{}", ms >> 16, ms & 0xFFFF, ls >> 16, ls & 0xFFFF)
}
