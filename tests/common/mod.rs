#![allow(dead_code)]

use dependency_scanner::{DependencyScanner, LookupPath, ResolverConfig, ScanParameters};
use fs_err as fs;
use std::path::Path;
use std::sync::Arc;

pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_ARM: u16 = 0x01C4;

const PE_OFFSET: usize = 0x80;
const COFF_OFFSET: usize = PE_OFFSET + 4;
const OPTIONAL_HEADER_OFFSET: usize = COFF_OFFSET + 20;
const SECTION_HEADER_SIZE: usize = 40;
const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;
const IDATA_RVA: usize = 0x1000;
const RT_ICON: u32 = 3;
const RT_VERSION: u32 = 16;

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn align(v: usize, to: usize) -> usize {
    (v + to - 1) / to * to
}

fn fixed_file_info(file: [u16; 4], product: [u16; 4]) -> Vec<u8> {
    let mut record = vec![0u8; 52];
    put_u32(&mut record, 0, 0xFEEF_04BD);
    put_u32(&mut record, 4, 0x0001_0000);
    put_u32(&mut record, 8, (file[0] as u32) << 16 | file[1] as u32);
    put_u32(&mut record, 12, (file[2] as u32) << 16 | file[3] as u32);
    put_u32(&mut record, 16, (product[0] as u32) << 16 | product[1] as u32);
    put_u32(&mut record, 20, (product[2] as u32) << 16 | product[3] as u32);
    record
}

// VS_VERSIONINFO with the fixed record and no string tables
fn version_info(file: [u16; 4], product: [u16; 4]) -> Vec<u8> {
    let fixed = fixed_file_info(file, product);
    let mut block = vec![0u8; 40];
    put_u16(&mut block, 0, (40 + fixed.len()) as u16);
    put_u16(&mut block, 2, fixed.len() as u16);
    for (i, c) in "VS_VERSION_INFO".encode_utf16().enumerate() {
        put_u16(&mut block, 6 + 2 * i, c);
    }
    block.extend(fixed);
    block
}

/// Minimal but well-formed PE image: headers, an import section and optionally version resources
#[derive(Clone, Debug)]
pub struct PeBuilder {
    machine: u16,
    imports: Vec<String>,
    version: Option<([u16; 4], [u16; 4])>,
    icon: Option<Vec<u8>>,
}

impl PeBuilder {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            imports: Vec::new(),
            version: None,
            icon: None,
        }
    }

    pub fn x86() -> Self {
        Self::new(MACHINE_I386)
    }

    pub fn x64() -> Self {
        Self::new(MACHINE_AMD64)
    }

    pub fn import(mut self, name: &str) -> Self {
        self.imports.push(name.to_owned());
        self
    }

    pub fn version(mut self, file: [u16; 4], product: [u16; 4]) -> Self {
        self.version = Some((file, product));
        self
    }

    /// Icon resource stored ahead of the version resource
    pub fn icon(mut self, data: &[u8]) -> Self {
        self.icon = Some(data.to_vec());
        self
    }

    /// Icon resource whose bytes happen to hold a version record
    pub fn icon_with_version_record(self, file: [u16; 4]) -> Self {
        self.icon(&fixed_file_info(file, file))
    }

    fn is_64(&self) -> bool {
        self.machine == MACHINE_AMD64
    }

    fn idata(&self) -> Vec<u8> {
        let n = self.imports.len();
        let descriptors = (n + 1) * 20;
        let thunks = align(descriptors, 8);
        // one zero lookup entry and one zero address entry per import
        let names = thunks + (n + 1) * 16;
        let names_len: usize = self.imports.iter().map(|s| s.len() + 1).sum();
        let mut data = vec![0u8; align(names + names_len + 1, FILE_ALIGNMENT)];

        let mut name_offset = names;
        for (i, name) in self.imports.iter().enumerate() {
            let d = i * 20;
            let ilt = thunks + i * 16;
            put_u32(&mut data, d, (IDATA_RVA + ilt) as u32);
            put_u32(&mut data, d + 12, (IDATA_RVA + name_offset) as u32);
            put_u32(&mut data, d + 16, (IDATA_RVA + ilt + 8) as u32);
            data[name_offset..name_offset + name.len()].copy_from_slice(name.as_bytes());
            name_offset += name.len() + 1;
        }
        data
    }

    // resource tree: type, name 1, language 0x409, then the data entry
    fn rsrc(&self, rsrc_rva: usize) -> Option<Vec<u8>> {
        let mut resources = Vec::new();
        if let Some(icon) = &self.icon {
            resources.push((RT_ICON, icon.clone()));
        }
        if let Some((file, product)) = self.version {
            resources.push((RT_VERSION, version_info(file, product)));
        }
        if resources.is_empty() {
            return None;
        }

        let n = resources.len();
        let mut dir = 16 + n * 8;
        let mut blob = align(dir + n * 64, 16);
        let size = blob + resources.iter().map(|r| r.1.len() + 16).sum::<usize>();
        let mut data = vec![0u8; align(size, FILE_ALIGNMENT)];
        put_u16(&mut data, 14, n as u16);
        for (i, (type_id, content)) in resources.iter().enumerate() {
            put_u32(&mut data, 16 + i * 8, *type_id);
            put_u32(&mut data, 20 + i * 8, 0x8000_0000 | dir as u32);

            put_u16(&mut data, dir + 14, 1);
            put_u32(&mut data, dir + 16, 1);
            put_u32(&mut data, dir + 20, 0x8000_0000 | (dir + 24) as u32);

            put_u16(&mut data, dir + 38, 1);
            put_u32(&mut data, dir + 40, 0x409);
            put_u32(&mut data, dir + 44, (dir + 48) as u32);

            put_u32(&mut data, dir + 48, (rsrc_rva + blob) as u32);
            put_u32(&mut data, dir + 52, content.len() as u32);
            data[blob..blob + content.len()].copy_from_slice(content);

            dir += 64;
            blob = align(blob + content.len(), 16);
        }
        Some(data)
    }

    pub fn build(&self) -> Vec<u8> {
        let idata = self.idata();
        let rsrc_rva = IDATA_RVA + align(idata.len(), SECTION_ALIGNMENT);
        let rsrc = self.rsrc(rsrc_rva);
        let number_of_sections = if rsrc.is_some() { 2 } else { 1 };
        let size_of_optional_header = if self.is_64() { 0xF0 } else { 0xE0 };

        let idata_offset = FILE_ALIGNMENT;
        let rsrc_offset = idata_offset + idata.len();
        let rsrc_len = rsrc.as_ref().map(Vec::len).unwrap_or(0);
        let size_of_image = rsrc_rva + align(rsrc_len, SECTION_ALIGNMENT);

        let mut buf = vec![0u8; rsrc_offset + rsrc_len];

        // DOS header
        put_u16(&mut buf, 0, 0x5A4D);
        put_u32(&mut buf, 0x3C, PE_OFFSET as u32);

        // PE signature and COFF header
        put_u32(&mut buf, PE_OFFSET, 0x0000_4550);
        put_u16(&mut buf, COFF_OFFSET, self.machine);
        put_u16(&mut buf, COFF_OFFSET + 2, number_of_sections);
        put_u16(&mut buf, COFF_OFFSET + 16, size_of_optional_header);
        put_u16(&mut buf, COFF_OFFSET + 18, 0x0102);

        // optional header
        let o = OPTIONAL_HEADER_OFFSET;
        let directories = if self.is_64() {
            put_u16(&mut buf, o, 0x20B);
            put_u64(&mut buf, o + 24, 0x1_4000_0000);
            put_u32(&mut buf, o + 108, 16);
            o + 112
        } else {
            put_u16(&mut buf, o, 0x10B);
            put_u32(&mut buf, o + 28, 0x40_0000);
            put_u32(&mut buf, o + 92, 16);
            o + 96
        };
        put_u32(&mut buf, o + 32, SECTION_ALIGNMENT as u32);
        put_u32(&mut buf, o + 36, FILE_ALIGNMENT as u32);
        put_u16(&mut buf, o + 40, 6);
        put_u16(&mut buf, o + 48, 6);
        put_u32(&mut buf, o + 56, size_of_image as u32);
        put_u32(&mut buf, o + 60, FILE_ALIGNMENT as u32);
        put_u16(&mut buf, o + 68, 3);
        // import directory
        put_u32(&mut buf, directories + 8, IDATA_RVA as u32);
        put_u32(&mut buf, directories + 12, ((self.imports.len() + 1) * 20) as u32);
        // resource directory
        if rsrc.is_some() {
            put_u32(&mut buf, directories + 16, rsrc_rva as u32);
            put_u32(&mut buf, directories + 20, rsrc_len as u32);
        }

        // section table
        let mut s = o + size_of_optional_header as usize;
        let mut sections = vec![(b".idata\0\0", IDATA_RVA, idata_offset, &idata)];
        if let Some(rsrc) = &rsrc {
            sections.push((b".rsrc\0\0\0", rsrc_rva, rsrc_offset, rsrc));
        }
        for (name, rva, offset, data) in sections {
            buf[s..s + 8].copy_from_slice(name);
            put_u32(&mut buf, s + 8, data.len() as u32);
            put_u32(&mut buf, s + 12, rva as u32);
            put_u32(&mut buf, s + 16, data.len() as u32);
            put_u32(&mut buf, s + 20, offset as u32);
            put_u32(&mut buf, s + 36, 0xC000_0040);
            buf[offset..offset + data.len()].copy_from_slice(data);
            s += SECTION_HEADER_SIZE;
        }

        buf
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        fs::write(path, self.build())
    }
}

/// Resolver that only sees the origin directory and the given working directory
///
/// The search path variable name is unique per caller, so concurrently running tests don't
/// see each other's environment.
pub fn isolated_lookup_path(working_dir: &Path, search_path_var: &str) -> Arc<LookupPath> {
    Arc::new(LookupPath::new(ResolverConfig {
        system: None,
        working_dir: Some(working_dir.to_owned()),
        search_path_var: search_path_var.to_owned(),
    }))
}

pub fn isolated_scanner(working_dir: &Path, parameters: ScanParameters) -> DependencyScanner {
    DependencyScanner::new(
        isolated_lookup_path(working_dir, "DEPSCAN_TEST_NEVER_SET"),
        parameters,
    )
}
