//! PE/COFF format layer
//!
//! Constants, on-disk structures, and the pure (allocation-free) parts of
//! image loading: header validation and read-only file views. Everything in
//! this module operates on byte buffers and compiles on every platform; the
//! Windows mapping pipeline lives in `loader::image`.

use std::mem;
use std::ptr;

use crate::error::LoadError;

/// DOS header signature ("MZ")
pub const DOS_SIGNATURE: u16 = 0x5A4D;

/// NT headers signature ("PE\0\0")
pub const NT_SIGNATURE: u32 = 0x0000_4550;

pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_ARM64: u16 = 0xAA64;

/// Machine constant images must carry to load in this process.
#[cfg(target_arch = "x86_64")]
pub const NATIVE_MACHINE: u16 = MACHINE_AMD64;
#[cfg(target_arch = "x86")]
pub const NATIVE_MACHINE: u16 = MACHINE_I386;
#[cfg(target_arch = "aarch64")]
pub const NATIVE_MACHINE: u16 = MACHINE_ARM64;

/// Optional-header magic for the host's image flavor.
#[cfg(target_pointer_width = "64")]
pub const OPTIONAL_HDR_MAGIC: u16 = 0x020B;
#[cfg(target_pointer_width = "32")]
pub const OPTIONAL_HDR_MAGIC: u16 = 0x010B;

/// File characteristics bit marking a DLL image.
pub const FILE_DLL: u16 = 0x2000;

// Data directory indices consulted by the loader.
pub const DIR_EXPORT: usize = 0;
pub const DIR_IMPORT: usize = 1;
pub const DIR_BASERELOC: usize = 5;
pub const DIR_TLS: usize = 9;

pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;

// Section characteristics.
pub const SCN_CNT_CODE: u32 = 0x0000_0020;
pub const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
pub const SCN_MEM_NOT_CACHED: u32 = 0x0400_0000;
pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const SCN_MEM_READ: u32 = 0x4000_0000;
pub const SCN_MEM_WRITE: u32 = 0x8000_0000;

// Base relocation entry types.
pub const REL_BASED_ABSOLUTE: u16 = 0;
pub const REL_BASED_HIGHLOW: u16 = 3;
pub const REL_BASED_DIR64: u16 = 10;

/// High bit of an import thunk marking an ordinal import.
#[cfg(target_pointer_width = "64")]
pub const ORDINAL_FLAG: usize = 1 << 63;
#[cfg(target_pointer_width = "32")]
pub const ORDINAL_FLAG: usize = 1 << 31;

// Reasons passed to DllMain and TLS callbacks.
pub const DLL_PROCESS_ATTACH: u32 = 1;
pub const DLL_PROCESS_DETACH: u32 = 0;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageDosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: i32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Optional header in the host's flavor (PE32+ on 64-bit hosts).
#[cfg(target_pointer_width = "64")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageOptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; NUMBER_OF_DIRECTORY_ENTRIES],
}

/// Optional header in the host's flavor (PE32 on 32-bit hosts).
#[cfg(target_pointer_width = "32")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageOptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; NUMBER_OF_DIRECTORY_ENTRIES],
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageNtHeaders {
    pub signature: u32,
    pub file_header: ImageFileHeader,
    pub optional_header: ImageOptionalHeader,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageSectionHeader {
    pub name: [u8; 8],
    /// The winnt `Misc` union: `VirtualSize` in the file, reused by the
    /// loader as a `PhysicalAddress` scratch slot once the section is placed.
    pub misc: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl ImageSectionHeader {
    pub fn virtual_size(&self) -> u32 {
        self.misc
    }

    pub fn physical_address(&self) -> u32 {
        self.misc
    }

    pub fn set_physical_address(&mut self, value: u32) {
        self.misc = value;
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageBaseRelocation {
    pub virtual_address: u32,
    pub size_of_block: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageImportDescriptor {
    /// RVA of the hint table, or 0 when `first_thunk` doubles as it.
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

#[cfg(target_pointer_width = "64")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageTlsDirectory {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

#[cfg(target_pointer_width = "32")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageTlsDirectory {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_callbacks: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

const _: () = assert!(mem::size_of::<ImageDosHeader>() == 64);
const _: () = assert!(mem::size_of::<ImageFileHeader>() == 20);
const _: () = assert!(mem::size_of::<ImageSectionHeader>() == 40);
const _: () = assert!(mem::size_of::<ImageBaseRelocation>() == 8);
const _: () = assert!(mem::size_of::<ImageImportDescriptor>() == 20);
const _: () = assert!(mem::size_of::<ImageExportDirectory>() == 40);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(mem::size_of::<ImageOptionalHeader>() == 240);
#[cfg(target_pointer_width = "32")]
const _: () = assert!(mem::size_of::<ImageOptionalHeader>() == 224);

/// True if an import thunk encodes an ordinal rather than a name RVA.
pub fn snap_by_ordinal(thunk: usize) -> bool {
    thunk & ORDINAL_FLAG != 0
}

/// Ordinal number carried by an ordinal import thunk.
pub fn ordinal_from_thunk(thunk: usize) -> u16 {
    (thunk & 0xffff) as u16
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// First section header following the NT headers.
///
/// # Safety
///
/// `nt` must point at NT headers inside a mapped image whose section table
/// is in bounds for `file_header.number_of_sections` entries.
pub unsafe fn image_first_section(nt: *mut ImageNtHeaders) -> *mut ImageSectionHeader {
    let optional_offset = 4 + mem::size_of::<ImageFileHeader>();
    (nt as *mut u8)
        .add(optional_offset)
        .add((*nt).file_header.size_of_optional_header as usize)
        .cast::<ImageSectionHeader>()
}

/// Bounds-checked copy of a structure out of a byte buffer.
pub(crate) fn read_struct<T: Copy>(data: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(mem::size_of::<T>())?;
    if end > data.len() {
        return None;
    }
    // SAFETY: the range is in bounds and T is a plain-old-data PE structure
    // with no invalid bit patterns.
    Some(unsafe { ptr::read_unaligned(data.as_ptr().add(offset).cast::<T>()) })
}

/// NUL-terminated byte string starting at `offset`, without the terminator.
pub(crate) fn read_cstr(data: &[u8], offset: usize) -> Option<&[u8]> {
    let rest = data.get(offset..)?;
    let len = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..len])
}

/// Facts about an image established before any allocation happens.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    /// Offset of the NT headers inside the buffer (`e_lfanew`).
    pub nt_offset: usize,
    /// Base address the image was linked for.
    pub preferred_base: usize,
    /// `SizeOfImage` as stated by the header.
    pub image_size: usize,
    /// Reservation size: `SizeOfImage` aligned up to the host page size.
    pub aligned_image_size: usize,
    /// Bytes of headers to copy into the mapping.
    pub size_of_headers: usize,
    pub section_alignment: u32,
    pub is_dll: bool,
}

/// Run every header check that must pass before memory is reserved.
///
/// Checks the DOS and NT signatures, the machine type against the host, the
/// optional-header magic, section alignment, and that the section table's
/// span agrees with `SizeOfImage` once both are aligned to the host page
/// size. Returns the layout facts the mapper needs, or `BadImage` naming the
/// first violated constraint.
pub fn validate_image(data: &[u8], page_size: usize) -> Result<ImageLayout, LoadError> {
    let dos: ImageDosHeader =
        read_struct(data, 0).ok_or_else(|| LoadError::bad_image("truncated IMAGE_DOS_HEADER"))?;
    if dos.e_magic != DOS_SIGNATURE {
        return Err(LoadError::bad_image(format!(
            "not an MS-DOS binary (magic {:#06x})",
            dos.e_magic
        )));
    }

    let nt_offset = usize::try_from(dos.e_lfanew)
        .map_err(|_| LoadError::bad_image("negative IMAGE_NT_HEADERS offset"))?;
    let nt: ImageNtHeaders = read_struct(data, nt_offset)
        .ok_or_else(|| LoadError::bad_image("truncated IMAGE_NT_HEADERS"))?;
    if nt.signature != NT_SIGNATURE {
        return Err(LoadError::bad_image(format!(
            "not an NT binary (signature {:#010x})",
            nt.signature
        )));
    }
    if nt.file_header.machine != NATIVE_MACHINE {
        return Err(LoadError::bad_image(format!(
            "foreign machine type (image {:#06x}, host {:#06x})",
            nt.file_header.machine, NATIVE_MACHINE
        )));
    }
    if nt.optional_header.magic != OPTIONAL_HDR_MAGIC {
        return Err(LoadError::bad_image(format!(
            "unexpected optional header magic {:#06x}",
            nt.optional_header.magic
        )));
    }
    if nt.optional_header.section_alignment & 1 != 0 {
        return Err(LoadError::bad_image("section alignment is not even"));
    }

    // The widest section, padded to the page size, must land exactly on the
    // declared image size; anything else is a truncated or mislinked image.
    let section_table = section_table_offset(nt_offset, &nt.file_header);
    let mut last_section_end = 0usize;
    for i in 0..nt.file_header.number_of_sections as usize {
        let section: ImageSectionHeader =
            read_struct(data, section_table + i * mem::size_of::<ImageSectionHeader>())
                .ok_or_else(|| LoadError::bad_image("truncated section table"))?;
        let span = if section.size_of_raw_data == 0 {
            nt.optional_header.section_alignment as usize
        } else {
            section.size_of_raw_data as usize
        };
        last_section_end = last_section_end.max(section.virtual_address as usize + span);
    }

    let image_size = nt.optional_header.size_of_image as usize;
    let aligned_image_size = align_up(image_size, page_size);
    if aligned_image_size != align_up(last_section_end, page_size) {
        return Err(LoadError::bad_image("section layout disagrees with SizeOfImage"));
    }

    let size_of_headers = nt.optional_header.size_of_headers as usize;
    if data.len() < size_of_headers {
        return Err(LoadError::bad_image("incomplete headers"));
    }

    Ok(ImageLayout {
        nt_offset,
        preferred_base: nt.optional_header.image_base as usize,
        image_size,
        aligned_image_size,
        size_of_headers,
        section_alignment: nt.optional_header.section_alignment,
        is_dll: nt.file_header.characteristics & FILE_DLL != 0,
    })
}

fn section_table_offset(nt_offset: usize, file_header: &ImageFileHeader) -> usize {
    nt_offset + 4 + mem::size_of::<ImageFileHeader>() + file_header.size_of_optional_header as usize
}

/// One row of an image's export table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    /// Biased ordinal (`export base + index`).
    pub ordinal: u32,
    pub rva: u32,
}

/// Read-only view over a validated PE file buffer.
///
/// Works on the file layout (not a mapping), translating RVAs through the
/// section table. Used by the `peinfo` tool and by tests; the live-image
/// equivalents live on `LoadedImage`.
pub struct PeFile<'a> {
    data: &'a [u8],
    nt: ImageNtHeaders,
    sections: Vec<ImageSectionHeader>,
    layout: ImageLayout,
}

impl<'a> PeFile<'a> {
    pub fn parse(data: &'a [u8], page_size: usize) -> Result<Self, LoadError> {
        let layout = validate_image(data, page_size)?;
        let nt: ImageNtHeaders = read_struct(data, layout.nt_offset)
            .ok_or_else(|| LoadError::bad_image("truncated IMAGE_NT_HEADERS"))?;
        let table = section_table_offset(layout.nt_offset, &nt.file_header);
        let sections = (0..nt.file_header.number_of_sections as usize)
            .map(|i| read_struct(data, table + i * mem::size_of::<ImageSectionHeader>()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| LoadError::bad_image("truncated section table"))?;
        Ok(Self {
            data,
            nt,
            sections,
            layout,
        })
    }

    pub fn nt_headers(&self) -> &ImageNtHeaders {
        &self.nt
    }

    pub fn sections(&self) -> &[ImageSectionHeader] {
        &self.sections
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn directory(&self, index: usize) -> ImageDataDirectory {
        self.nt.optional_header.data_directory[index]
    }

    /// Translate an RVA to a file offset through the section table.
    ///
    /// RVAs inside the header region map one-to-one; RVAs past the raw data
    /// of every section (uninitialized space) have no file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if (rva as usize) < self.layout.size_of_headers {
            return Some(rva as usize);
        }
        for section in &self.sections {
            let start = section.virtual_address as u64;
            let end = start + section.size_of_raw_data as u64;
            if (rva as u64) >= start && (rva as u64) < end {
                let offset = section.pointer_to_raw_data as usize + (rva - section.virtual_address) as usize;
                return (offset < self.data.len()).then_some(offset);
            }
        }
        None
    }

    /// Names exported by the image, in name-table order.
    ///
    /// An image without an export directory yields an empty list.
    pub fn exports(&self) -> Result<Vec<ExportEntry>, LoadError> {
        let directory = self.directory(DIR_EXPORT);
        if directory.size == 0 {
            return Ok(Vec::new());
        }
        let offset = self
            .rva_to_offset(directory.virtual_address)
            .ok_or_else(|| LoadError::bad_image("export directory outside mapped sections"))?;
        let exports: ImageExportDirectory = read_struct(self.data, offset)
            .ok_or_else(|| LoadError::bad_image("truncated export directory"))?;

        let mut entries = Vec::with_capacity(exports.number_of_names as usize);
        for i in 0..exports.number_of_names {
            let name_rva = self
                .table_u32(exports.address_of_names, i)
                .ok_or_else(|| LoadError::bad_image("truncated export name table"))?;
            let ordinal_index = self
                .table_u16(exports.address_of_name_ordinals, i)
                .ok_or_else(|| LoadError::bad_image("truncated export ordinal table"))?;
            if ordinal_index as u32 >= exports.number_of_functions {
                return Err(LoadError::bad_image("export ordinal outside address table"));
            }
            let rva = self
                .table_u32(exports.address_of_functions, ordinal_index as u32)
                .ok_or_else(|| LoadError::bad_image("truncated export address table"))?;
            let name_offset = self
                .rva_to_offset(name_rva)
                .ok_or_else(|| LoadError::bad_image("export name outside mapped sections"))?;
            let name = read_cstr(self.data, name_offset)
                .ok_or_else(|| LoadError::bad_image("unterminated export name"))?;
            entries.push(ExportEntry {
                name: String::from_utf8_lossy(name).into_owned(),
                ordinal: exports.base + ordinal_index as u32,
                rva,
            });
        }
        Ok(entries)
    }

    /// Library names from the import descriptor array.
    pub fn import_libraries(&self) -> Result<Vec<String>, LoadError> {
        let directory = self.directory(DIR_IMPORT);
        if directory.size == 0 {
            return Ok(Vec::new());
        }
        let base = self
            .rva_to_offset(directory.virtual_address)
            .ok_or_else(|| LoadError::bad_image("import directory outside mapped sections"))?;
        let count = directory.size as usize / mem::size_of::<ImageImportDescriptor>();

        let mut libraries = Vec::new();
        for i in 0..count {
            let descriptor: ImageImportDescriptor =
                read_struct(self.data, base + i * mem::size_of::<ImageImportDescriptor>())
                    .ok_or_else(|| LoadError::bad_image("truncated import descriptor array"))?;
            if descriptor.name == 0 {
                break;
            }
            let name_offset = self
                .rva_to_offset(descriptor.name)
                .ok_or_else(|| LoadError::bad_image("import name outside mapped sections"))?;
            let name = read_cstr(self.data, name_offset)
                .ok_or_else(|| LoadError::bad_image("unterminated import name"))?;
            libraries.push(String::from_utf8_lossy(name).into_owned());
        }
        Ok(libraries)
    }

    fn table_u32(&self, table_rva: u32, index: u32) -> Option<u32> {
        let offset = self.rva_to_offset(table_rva)? + index as usize * 4;
        read_struct(self.data, offset)
    }

    fn table_u16(&self, table_rva: u32, index: u32) -> Option<u16> {
        let offset = self.rva_to_offset(table_rva)? + index as usize * 2;
        read_struct(self.data, offset)
    }
}
