//! In-memory PE image mapping pipeline
//!
//! Turns a byte buffer holding a DLL into an executable, linked, initialized
//! module inside the calling process, without touching the filesystem or the
//! OS loader for the image itself: reserve, place sections, relocate, resolve
//! imports, finalize page protections, run TLS callbacks, call the entry
//! point, index the exports. Any failure unwinds every resource acquired so
//! far through the same teardown path `free` uses.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::{mem, ptr, slice};

use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Memory::{
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS,
    PAGE_NOCACHE, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};

use crate::error::{LoadError, SymbolError};
use crate::loader::pe::{
    self, image_first_section, ImageBaseRelocation, ImageDataDirectory, ImageExportDirectory,
    ImageImportDescriptor, ImageNtHeaders, ImageSectionHeader, ImageTlsDirectory,
};
use crate::loader::sys;

/// `DllMain` signature; nonzero return means success.
type DllEntryProc = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;

/// TLS callback signature.
type TlsCallback = unsafe extern "system" fn(*mut c_void, u32, *mut c_void);

/// Page protections indexed by section characteristics bits 29..31
/// (execute, read, write).
const PROTECTION_FLAGS: [PAGE_PROTECTION_FLAGS; 8] = [
    PAGE_NOACCESS,          // not writeable, not readable, not executable
    PAGE_EXECUTE,           // not writeable, not readable, executable
    PAGE_READONLY,          // not writeable, readable, not executable
    PAGE_EXECUTE_READ,      // not writeable, readable, executable
    PAGE_WRITECOPY,         // writeable, not readable, not executable
    PAGE_EXECUTE_WRITECOPY, // writeable, not readable, executable
    PAGE_READWRITE,         // writeable, readable, not executable
    PAGE_EXECUTE_READWRITE, // writeable, readable, executable
];

/// Reservations made only to push the image allocation past a 4 GiB
/// boundary; released together with the module.
#[derive(Default)]
struct BlockerList(Vec<*mut u8>);

impl Drop for BlockerList {
    fn drop(&mut self) {
        for &address in self.0.iter().rev() {
            unsafe { sys::release(address) };
        }
    }
}

/// A PE image mapped, linked, and initialized in the calling process.
///
/// Owns the virtual-memory reservation, the dependency library handles, and
/// the export index. Dropping the image (or calling [`free`](Self::free))
/// notifies the entry point with `DLL_PROCESS_DETACH` when initialization
/// ran, releases the dependencies, and unmaps the reservation; function
/// pointers obtained from it are dangling from that point on.
pub struct LoadedImage {
    code_base: *mut u8,
    headers: *mut ImageNtHeaders,
    dependencies: Vec<HMODULE>,
    name_exports: HashMap<Vec<u8>, u16>,
    entry_point: usize,
    page_size: usize,
    is_dll: bool,
    is_relocated: bool,
    initialized: bool,
    blockers: BlockerList,
}

impl LoadedImage {
    /// Map `data` into the process and run the full loading pipeline.
    ///
    /// On success the image's sections carry their final protections, its
    /// imports are resolved against OS-loaded dependencies, TLS callbacks and
    /// (for DLLs with an entry point) `DllMain(DLL_PROCESS_ATTACH)` have run,
    /// and exports are resolvable. On failure every partially acquired
    /// resource has been released.
    pub fn load(data: &[u8]) -> Result<LoadedImage, LoadError> {
        let page_size = sys::page_size();
        let layout = pe::validate_image(data, page_size)?;

        // Reserve at the linked base so no relocation is needed; fall back
        // to any address the VM manager picks.
        let code_base = unsafe {
            sys::reserve_commit(layout.preferred_base, layout.aligned_image_size)
                .or_else(|_| sys::reserve_commit(0, layout.aligned_image_size))
                .map_err(|e| LoadError::AllocFailed {
                    reason: e.to_string(),
                })?
        };

        // From here on `image` owns everything; early returns unwind through
        // its Drop exactly like an explicit free.
        let mut image = LoadedImage {
            code_base,
            headers: ptr::null_mut(),
            dependencies: Vec::new(),
            name_exports: HashMap::new(),
            entry_point: 0,
            page_size,
            is_dll: layout.is_dll,
            is_relocated: false,
            initialized: false,
            blockers: BlockerList::default(),
        };

        unsafe {
            #[cfg(target_pointer_width = "64")]
            image.avoid_4gb_boundary(layout.aligned_image_size)?;

            image.copy_headers(data, &layout)?;
            image.copy_sections(data, layout.section_alignment)?;

            let delta = image.code_base as isize - layout.preferred_base as isize;
            if delta != 0 {
                tracing::debug!(delta, "image placed away from its preferred base");
                if !image.perform_base_relocation(delta) {
                    return Err(LoadError::RelocationRequiredButAbsent);
                }
            }
            image.is_relocated = true;

            image.build_import_table()?;
            image.finalize_sections()?;
            image.execute_tls();
            image.call_entry_point()?;
            image.build_name_exports();
        }

        tracing::debug!(
            code_base = ?image.code_base,
            dependencies = image.dependencies.len(),
            exports = image.name_exports.len(),
            "image loaded"
        );
        Ok(image)
    }

    /// Address of an export by its NUL-free name.
    pub fn proc_by_name(&self, name: &[u8]) -> Result<*const c_void, SymbolError> {
        let exports = self.export_directory().ok_or(SymbolError::NoExports)?;
        // A directory with an unpopulated name table gives by-name lookup
        // nothing to consult; ordinal lookup is unaffected.
        if self.name_exports.is_empty() {
            return Err(SymbolError::NoExports);
        }
        match self.name_exports.get(name) {
            Some(&index) => unsafe { self.export_address(exports, index) },
            None => Err(SymbolError::NotFound {
                name: String::from_utf8_lossy(name).into_owned(),
            }),
        }
    }

    /// Address of an export by its biased ordinal.
    pub fn proc_by_ordinal(&self, ordinal: u16) -> Result<*const c_void, SymbolError> {
        let exports = self.export_directory().ok_or(SymbolError::NoExports)?;
        let exports = unsafe { &*exports };
        if (ordinal as u32) < exports.base {
            return Err(SymbolError::OrdinalTooLow {
                ordinal,
                base: exports.base,
            });
        }
        let index = ordinal - exports.base as u16;
        unsafe { self.export_address(exports, index) }
    }

    /// Unload the image. Equivalent to dropping it; see the type docs.
    pub fn free(self) {
        drop(self);
    }

    pub fn code_base(&self) -> *const u8 {
        self.code_base
    }

    /// Mapped entry point address, 0 when the image declares none.
    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    pub fn is_relocated(&self) -> bool {
        self.is_relocated
    }

    /// True once `DllMain(DLL_PROCESS_ATTACH)` returned success.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of OS library handles held for resolved imports.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Keep re-reserving until the image no longer straddles a 4 GiB
    /// boundary; DIR64 fixups and 32-bit-truncated section bookkeeping both
    /// assume intra-4 GiB offsets. Failed candidates become blockers so the
    /// VM manager hands out a different range next round.
    #[cfg(target_pointer_width = "64")]
    unsafe fn avoid_4gb_boundary(&mut self, aligned_image_size: usize) -> Result<(), LoadError> {
        while (self.code_base as usize) >> 32
            < ((self.code_base as usize) + aligned_image_size) >> 32
        {
            self.blockers.0.push(self.code_base);
            self.code_base = ptr::null_mut();
            self.code_base = sys::reserve_commit(0, aligned_image_size).map_err(|e| {
                LoadError::AllocFailed {
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    unsafe fn copy_headers(&mut self, data: &[u8], layout: &pe::ImageLayout) -> Result<(), LoadError> {
        sys::commit(self.code_base, layout.size_of_headers).map_err(|e| LoadError::AllocFailed {
            reason: e.to_string(),
        })?;
        ptr::copy_nonoverlapping(data.as_ptr(), self.code_base, layout.size_of_headers);
        self.headers = self.code_base.add(layout.nt_offset).cast::<ImageNtHeaders>();
        // The copy now describes the mapping, not the file.
        (*self.headers).optional_header.image_base = self.code_base as usize as _;
        Ok(())
    }

    unsafe fn copy_sections(&mut self, data: &[u8], section_alignment: u32) -> Result<(), LoadError> {
        let count = (*self.headers).file_header.number_of_sections as usize;
        let first = image_first_section(self.headers);
        for i in 0..count {
            let section = &mut *first.add(i);
            let dest = self.code_base.add(section.virtual_address as usize);

            if section.size_of_raw_data == 0 {
                // No data in the file, but the section may still span
                // uninitialized memory worth one alignment unit.
                if section_alignment == 0 {
                    continue;
                }
                sys::commit(dest, section_alignment as usize).map_err(|e| {
                    LoadError::AllocFailed {
                        reason: e.to_string(),
                    }
                })?;
                section.set_physical_address((dest as usize & 0xffff_ffff) as u32);
                ptr::write_bytes(dest, 0, section_alignment as usize);
                continue;
            }

            let raw_start = section.pointer_to_raw_data as usize;
            let raw_size = section.size_of_raw_data as usize;
            if data.len() < raw_start + raw_size {
                return Err(LoadError::bad_image("incomplete section"));
            }
            sys::commit(dest, raw_size).map_err(|e| LoadError::AllocFailed {
                reason: e.to_string(),
            })?;
            ptr::copy_nonoverlapping(data.as_ptr().add(raw_start), dest, raw_size);
            // Keep the low half of the placed address in the header; the
            // upper half is reconstructed from the image offset later.
            section.set_physical_address((dest as usize & 0xffff_ffff) as u32);
        }
        Ok(())
    }

    unsafe fn directory(&self, index: usize) -> ImageDataDirectory {
        (*self.headers).optional_header.data_directory[index]
    }

    /// Apply HIGHLOW/DIR64 fixups. Returns false when relocation was needed
    /// but the image carries no relocation directory.
    unsafe fn perform_base_relocation(&mut self, delta: isize) -> bool {
        let directory = self.directory(pe::DIR_BASERELOC);
        if directory.size == 0 {
            return delta == 0;
        }

        let mut relocation = self
            .code_base
            .add(directory.virtual_address as usize)
            .cast::<ImageBaseRelocation>();
        let directory_end = (relocation as *const u8).add(directory.size as usize);

        while (relocation as *const u8) < directory_end && (*relocation).virtual_address > 0 {
            let dest = self.code_base.add((*relocation).virtual_address as usize);
            let count = ((*relocation).size_of_block as usize
                - mem::size_of::<ImageBaseRelocation>())
                / 2;
            let entries = slice::from_raw_parts(relocation.add(1).cast::<u16>(), count);

            for &entry in entries {
                // Upper 4 bits select the relocation type, lower 12 bits the
                // offset inside the block's page.
                let offset = (entry & 0x0fff) as usize;
                match entry >> 12 {
                    pe::REL_BASED_ABSOLUTE => {}
                    pe::REL_BASED_HIGHLOW => {
                        let patch = dest.add(offset).cast::<u32>();
                        ptr::write_unaligned(
                            patch,
                            ptr::read_unaligned(patch).wrapping_add(delta as u32),
                        );
                    }
                    pe::REL_BASED_DIR64 => {
                        let patch = dest.add(offset).cast::<u64>();
                        ptr::write_unaligned(
                            patch,
                            ptr::read_unaligned(patch).wrapping_add(delta as u64),
                        );
                    }
                    // The toolchains this loader targets emit nothing else.
                    _ => {}
                }
            }

            relocation = (relocation as *const u8)
                .add((*relocation).size_of_block as usize)
                .cast::<ImageBaseRelocation>()
                .cast_mut();
        }
        true
    }

    unsafe fn build_import_table(&mut self) -> Result<(), LoadError> {
        let directory = self.directory(pe::DIR_IMPORT);
        if directory.size == 0 {
            return Ok(());
        }

        let count = directory.size as usize / mem::size_of::<ImageImportDescriptor>();
        let descriptors = slice::from_raw_parts(
            self.code_base
                .add(directory.virtual_address as usize)
                .cast::<ImageImportDescriptor>(),
            count,
        );

        for descriptor in descriptors {
            if descriptor.name == 0 {
                break;
            }
            let name_ptr = self.code_base.add(descriptor.name as usize);
            let library = CStr::from_ptr(name_ptr.cast::<c_char>())
                .to_string_lossy()
                .into_owned();
            let handle =
                sys::load_library(name_ptr).map_err(|e| LoadError::DependencyLoadFailed {
                    library: library.clone(),
                    reason: e.to_string(),
                })?;
            tracing::debug!(library = %library, "loaded dependency");

            if let Err(error) = self.resolve_thunks(descriptor, handle, &library) {
                sys::free_library(handle);
                return Err(error);
            }
            self.dependencies.push(handle);
        }
        Ok(())
    }

    unsafe fn resolve_thunks(
        &self,
        descriptor: &ImageImportDescriptor,
        handle: HMODULE,
        library: &str,
    ) -> Result<(), LoadError> {
        // The hint table drives the lookup when present; otherwise the IAT
        // itself is read and overwritten in place.
        let lookup_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        };
        let mut thunk = self.code_base.add(lookup_rva as usize).cast::<usize>();
        let mut slot = self
            .code_base
            .add(descriptor.first_thunk as usize)
            .cast::<usize>();

        while *thunk != 0 {
            let address = if pe::snap_by_ordinal(*thunk) {
                let ordinal = pe::ordinal_from_thunk(*thunk);
                sys::proc_address_by_ordinal(handle, ordinal).map_err(|e| {
                    LoadError::SymbolResolutionFailed {
                        library: library.to_string(),
                        symbol: format!("#{ordinal}"),
                        reason: e.to_string(),
                    }
                })?
            } else {
                // *thunk addresses an IMAGE_IMPORT_BY_NAME: hint, then name.
                let name_ptr = self.code_base.add(*thunk + 2);
                sys::proc_address(handle, name_ptr).map_err(|e| {
                    LoadError::SymbolResolutionFailed {
                        library: library.to_string(),
                        symbol: CStr::from_ptr(name_ptr.cast::<c_char>())
                            .to_string_lossy()
                            .into_owned(),
                        reason: e.to_string(),
                    }
                })?
            };
            ptr::write(slot, address);
            thunk = thunk.add(1);
            slot = slot.add(1);
        }
        Ok(())
    }

    unsafe fn real_section_size(&self, section: &ImageSectionHeader) -> usize {
        if section.size_of_raw_data != 0 {
            return section.size_of_raw_data as usize;
        }
        let optional = &(*self.headers).optional_header;
        if section.characteristics & pe::SCN_CNT_INITIALIZED_DATA != 0 {
            optional.size_of_initialized_data as usize
        } else if section.characteristics & pe::SCN_CNT_UNINITIALIZED_DATA != 0 {
            optional.size_of_uninitialized_data as usize
        } else {
            0
        }
    }

    /// Apply final protections, merging sections that share a page and
    /// decommitting wholly discardable page runs.
    unsafe fn finalize_sections(&mut self) -> Result<(), LoadError> {
        let count = (*self.headers).file_header.number_of_sections as usize;
        if count == 0 {
            return Ok(());
        }
        let first = image_first_section(self.headers);

        #[cfg(target_pointer_width = "64")]
        let image_offset = self.code_base as usize & 0xffff_ffff_0000_0000;
        #[cfg(target_pointer_width = "32")]
        let image_offset = 0usize;

        let section = &*first;
        let address = section.physical_address() as usize | image_offset;
        let mut group = SectionGroup {
            address,
            aligned_address: pe::align_down(address, self.page_size),
            size: self.real_section_size(section),
            characteristics: section.characteristics,
            last: false,
        };

        for i in 1..count {
            let section = &*first.add(i);
            let address = section.physical_address() as usize | image_offset;
            let aligned_address = pe::align_down(address, self.page_size);
            let size = self.real_section_size(section);

            if group.aligned_address == aligned_address || group.address + group.size > aligned_address
            {
                // Section shares a page with the group: merge access flags,
                // and drop DISCARDABLE unless every member carries it.
                if section.characteristics & pe::SCN_MEM_DISCARDABLE == 0
                    || group.characteristics & pe::SCN_MEM_DISCARDABLE == 0
                {
                    group.characteristics = (group.characteristics | section.characteristics)
                        & !pe::SCN_MEM_DISCARDABLE;
                } else {
                    group.characteristics |= section.characteristics;
                }
                group.size = address + size - group.address;
                continue;
            }

            self.finalize_group(&group)?;
            group = SectionGroup {
                address,
                aligned_address,
                size,
                characteristics: section.characteristics,
                last: false,
            };
        }
        group.last = true;
        self.finalize_group(&group)
    }

    unsafe fn finalize_group(&self, group: &SectionGroup) -> Result<(), LoadError> {
        if group.size == 0 {
            return Ok(());
        }

        if group.characteristics & pe::SCN_MEM_DISCARDABLE != 0 {
            // The group is not needed once loading finishes; give the pages
            // back when the run covers them completely.
            if group.address == group.aligned_address
                && (group.last
                    || (*self.headers).optional_header.section_alignment as usize == self.page_size
                    || group.size % self.page_size == 0)
            {
                let _ = sys::decommit(group.address as *mut u8, group.size);
            }
            return Ok(());
        }

        let mut protection = PROTECTION_FLAGS[(group.characteristics >> 29) as usize];
        if group.characteristics & pe::SCN_MEM_NOT_CACHED != 0 {
            protection |= PAGE_NOCACHE;
        }
        sys::protect(group.address as *mut u8, group.size, protection).map_err(|e| {
            LoadError::AllocFailed {
                reason: format!("protecting section pages: {e}"),
            }
        })?;
        Ok(())
    }

    /// TLS callbacks run before the entry point is notified.
    unsafe fn execute_tls(&self) {
        let directory = self.directory(pe::DIR_TLS);
        if directory.virtual_address == 0 {
            return;
        }
        let tls = &*self
            .code_base
            .add(directory.virtual_address as usize)
            .cast::<ImageTlsDirectory>();
        let mut callback = tls.address_of_callbacks as usize as *const usize;
        if callback.is_null() {
            return;
        }
        while *callback != 0 {
            let function: TlsCallback = mem::transmute(*callback);
            function(
                self.code_base.cast::<c_void>(),
                pe::DLL_PROCESS_ATTACH,
                ptr::null_mut(),
            );
            callback = callback.add(1);
        }
    }

    unsafe fn call_entry_point(&mut self) -> Result<(), LoadError> {
        let entry_rva = (*self.headers).optional_header.address_of_entry_point;
        if entry_rva == 0 {
            return Ok(());
        }
        self.entry_point = self.code_base as usize + entry_rva as usize;
        if !self.is_dll {
            return Ok(());
        }
        let entry: DllEntryProc = mem::transmute(self.entry_point);
        if entry(
            self.code_base.cast::<c_void>(),
            pe::DLL_PROCESS_ATTACH,
            ptr::null_mut(),
        ) == 0
        {
            return Err(LoadError::DllInitFailed);
        }
        self.initialized = true;
        Ok(())
    }

    /// Index exported names to their ordinal indices. A missing export
    /// directory is tolerated; lookups then report `NoExports`.
    unsafe fn build_name_exports(&mut self) {
        let directory = self.directory(pe::DIR_EXPORT);
        if directory.size == 0 {
            tracing::warn!("image has no export directory");
            return;
        }
        let exports = &*self
            .code_base
            .add(directory.virtual_address as usize)
            .cast::<ImageExportDirectory>();
        if exports.number_of_functions == 0 || exports.number_of_names == 0 {
            tracing::warn!("image exports no functions by name");
            return;
        }

        let names = slice::from_raw_parts(
            self.code_base
                .add(exports.address_of_names as usize)
                .cast::<u32>(),
            exports.number_of_names as usize,
        );
        let ordinals = slice::from_raw_parts(
            self.code_base
                .add(exports.address_of_name_ordinals as usize)
                .cast::<u16>(),
            exports.number_of_names as usize,
        );
        self.name_exports.reserve(names.len());
        for (&name_rva, &ordinal) in names.iter().zip(ordinals) {
            let name = CStr::from_ptr(self.code_base.add(name_rva as usize).cast::<c_char>());
            self.name_exports.insert(name.to_bytes().to_vec(), ordinal);
        }
    }

    fn export_directory(&self) -> Option<*const ImageExportDirectory> {
        let directory = unsafe { self.directory(pe::DIR_EXPORT) };
        if directory.size == 0 {
            return None;
        }
        Some(unsafe {
            self.code_base
                .add(directory.virtual_address as usize)
                .cast::<ImageExportDirectory>()
        })
    }

    unsafe fn export_address(
        &self,
        exports: *const ImageExportDirectory,
        index: u16,
    ) -> Result<*const c_void, SymbolError> {
        let exports = &*exports;
        if index as u32 > exports.number_of_functions {
            return Err(SymbolError::OrdinalOutOfRange { ordinal: index });
        }
        // AddressOfFunctions holds the RVAs of the actual functions.
        let rva = ptr::read_unaligned(
            self.code_base
                .add(exports.address_of_functions as usize + index as usize * 4)
                .cast::<u32>(),
        );
        Ok(self.code_base.add(rva as usize).cast::<c_void>())
    }
}

struct SectionGroup {
    address: usize,
    aligned_address: usize,
    size: usize,
    characteristics: u32,
    last: bool,
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        unsafe {
            if self.initialized {
                let entry: DllEntryProc = mem::transmute(self.entry_point);
                entry(
                    self.code_base.cast::<c_void>(),
                    pe::DLL_PROCESS_DETACH,
                    ptr::null_mut(),
                );
                self.initialized = false;
            }
            for handle in self.dependencies.drain(..).rev() {
                sys::free_library(handle);
            }
            if !self.code_base.is_null() {
                sys::release(self.code_base);
                self.code_base = ptr::null_mut();
                self.headers = ptr::null_mut();
            }
            // Blocker reservations release with their list.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testimg::{self, ImageBuilder, SectionSpec, PAGE};

    /// `.text` with `add(i32, i32)` at +0 and a succeeding `DllMain` at +0x10.
    #[cfg(target_arch = "x86_64")]
    fn text_with_add_and_dllmain() -> Vec<u8> {
        let mut text = vec![0xCC; 0x20];
        // lea eax, [rcx + rdx]; ret
        text[..4].copy_from_slice(&[0x8D, 0x04, 0x11, 0xC3]);
        // mov eax, 1; ret
        text[0x10..0x16].copy_from_slice(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        text
    }

    fn empty_reloc_directory() -> (Vec<u8>, u32) {
        // One empty block keeps the directory present so the image stays
        // loadable at any base.
        testimg::reloc_section(&[(PAGE as u32, Vec::new())])
    }

    /// A loadable DLL with no entry point and no imports.
    fn inert_dll() -> Vec<u8> {
        let (reloc, reloc_size) = empty_reloc_directory();
        ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_BASERELOC, 2 * PAGE as u32, reloc_size)
            .build()
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_load_and_call_exported_function() {
        let text_va = PAGE as u32;
        let export_va = 2 * PAGE as u32;
        let reloc_va = 3 * PAGE as u32;
        let (edata, edata_size) =
            testimg::export_section(export_va, "gateguard_test.dll", 1, &[("add", text_va)]);
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .entry_rva(text_va + 0x10)
            .section(SectionSpec::code(b".text", text_with_add_and_dllmain()))
            .section(SectionSpec::data(b".edata", edata))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_EXPORT, export_va, edata_size)
            .directory(pe::DIR_BASERELOC, reloc_va, reloc_size)
            .build();

        let loaded = LoadedImage::load(&image).unwrap();
        assert!(loaded.is_dll());
        assert!(loaded.is_relocated());
        assert!(loaded.is_initialized());
        assert_eq!(loaded.entry_point(), loaded.code_base() as usize + 0x1010);

        let by_name = loaded.proc_by_name(b"add").unwrap();
        let by_ordinal = loaded.proc_by_ordinal(1).unwrap();
        assert_eq!(by_name, by_ordinal);

        let add: extern "system" fn(i32, i32) -> i32 = unsafe { mem::transmute(by_name) };
        assert_eq!(add(2, 3), 5);
        assert_eq!(add(-7, 10), 3);

        match loaded.proc_by_name(b"missing") {
            Err(SymbolError::NotFound { name }) => assert_eq!(name, "missing"),
            other => panic!("unexpected lookup result: {other:?}"),
        }
        assert!(matches!(
            loaded.proc_by_ordinal(0),
            Err(SymbolError::OrdinalTooLow { ordinal: 0, base: 1 })
        ));
        assert!(matches!(
            loaded.proc_by_ordinal(100),
            Err(SymbolError::OrdinalOutOfRange { .. })
        ));

        loaded.free();
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_forced_relocation_applies_dir64_fixups() {
        let data_va = 2 * PAGE as u32;
        let reloc_va = 3 * PAGE as u32;

        // Occupy a range first and link the image for exactly that base, so
        // the loader must fall back and relocate.
        let occupied = unsafe { sys::reserve_commit(0, 4 * PAGE).unwrap() };
        let preferred = occupied as u64;

        // The slot holds a VA computed against the preferred base; DIR64
        // rebases it to wherever the image lands.
        let mut slot = vec![0u8; 16];
        slot[..8].copy_from_slice(&(preferred + data_va as u64).to_le_bytes());
        let (reloc, reloc_size) =
            testimg::reloc_section(&[(data_va, vec![(pe::REL_BASED_DIR64, 0)])]);

        let image = ImageBuilder::new()
            .image_base(preferred)
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::rw_data(b".data", slot))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_BASERELOC, reloc_va, reloc_size)
            .build();

        let loaded = LoadedImage::load(&image).unwrap();
        assert!(loaded.is_relocated());
        assert_ne!(loaded.code_base() as u64, preferred);

        let patched =
            unsafe { ptr::read((loaded.code_base() as usize + data_va as usize) as *const u64) };
        assert_eq!(patched, loaded.code_base() as u64 + data_va as u64);

        loaded.free();
        unsafe { sys::release(occupied) };
    }

    #[test]
    fn test_relocation_required_but_absent() {
        let occupied = unsafe { sys::reserve_commit(0, 4 * PAGE).unwrap() };
        let image = ImageBuilder::new()
            .image_base(occupied as u64)
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .build();

        match LoadedImage::load(&image) {
            Err(LoadError::RelocationRequiredButAbsent) => {}
            other => panic!("unexpected load result: {:?}", other.err()),
        }
        unsafe { sys::release(occupied) };
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_failing_entry_point_unwinds() {
        let (reloc, reloc_size) = empty_reloc_directory();
        // xor eax, eax; ret
        let mut text = vec![0xCC; 16];
        text[..3].copy_from_slice(&[0x31, 0xC0, 0xC3]);
        let image = ImageBuilder::new()
            .entry_rva(PAGE as u32)
            .section(SectionSpec::code(b".text", text))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_BASERELOC, 2 * PAGE as u32, reloc_size)
            .build();

        assert!(matches!(
            LoadedImage::load(&image),
            Err(LoadError::DllInitFailed)
        ));
    }

    #[test]
    fn test_resolves_imports_and_holds_dependency() {
        let import_va = 2 * PAGE as u32;
        let reloc_va = 3 * PAGE as u32;
        let import = testimg::import_section(import_va, "kernel32.dll", &["GetTickCount"]);
        let iat_rva = import.iat_rva;
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::rw_data(b".idata", import.bytes))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_IMPORT, import_va, import.directory_size)
            .directory(pe::DIR_BASERELOC, reloc_va, reloc_size)
            .build();

        let loaded = LoadedImage::load(&image).unwrap();
        assert_eq!(loaded.dependency_count(), 1);
        let resolved = unsafe {
            ptr::read((loaded.code_base() as usize + iat_rva as usize) as *const usize)
        };
        assert_ne!(resolved, 0);
        loaded.free();
    }

    #[test]
    fn test_resolves_imports_without_hint_table() {
        let import_va = 2 * PAGE as u32;
        let reloc_va = 3 * PAGE as u32;
        let import = testimg::import_section_without_hint_table(
            import_va,
            "kernel32.dll",
            &["GetTickCount", "GetCurrentProcessId"],
        );
        let iat_rva = import.iat_rva;
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::rw_data(b".idata", import.bytes))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_IMPORT, import_va, import.directory_size)
            .directory(pe::DIR_BASERELOC, reloc_va, reloc_size)
            .build();

        // With OriginalFirstThunk == 0 the IAT is both lookup table and
        // patch target: each name thunk must be read before its slot is
        // overwritten with the resolved address.
        let loaded = LoadedImage::load(&image).unwrap();
        assert_eq!(loaded.dependency_count(), 1);
        for i in 0..2 {
            let slot = loaded.code_base() as usize
                + iat_rva as usize
                + i * mem::size_of::<usize>();
            let resolved = unsafe { ptr::read(slot as *const usize) };
            // Name thunks are small RVAs inside the image; a resolved slot
            // holds an address in kernel32 instead.
            assert!(resolved > 4 * PAGE, "IAT slot {i} still holds a name thunk");
        }
        loaded.free();
    }

    #[test]
    fn test_ordinal_only_exports() {
        let export_va = 2 * PAGE as u32;
        let reloc_va = 3 * PAGE as u32;
        let (edata, edata_size) = testimg::export_section_ordinal_only(
            export_va,
            "gateguard_test.dll",
            5,
            &[PAGE as u32],
        );
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::data(b".edata", edata))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_EXPORT, export_va, edata_size)
            .directory(pe::DIR_BASERELOC, reloc_va, reloc_size)
            .build();

        // An empty name table means by-name lookup has no exports to offer,
        // while ordinal lookup still resolves.
        let loaded = LoadedImage::load(&image).unwrap();
        assert!(matches!(
            loaded.proc_by_name(b"add"),
            Err(SymbolError::NoExports)
        ));
        let by_ordinal = loaded.proc_by_ordinal(5).unwrap();
        assert_eq!(by_ordinal as usize, loaded.code_base() as usize + PAGE);
        loaded.free();
    }

    #[test]
    fn test_unresolvable_import_fails() {
        let import_va = 2 * PAGE as u32;
        let reloc_va = 3 * PAGE as u32;
        let import = testimg::import_section(
            import_va,
            "kernel32.dll",
            &["GateGuardDefinitelyNotAnExport"],
        );
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::rw_data(b".idata", import.bytes))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_IMPORT, import_va, import.directory_size)
            .directory(pe::DIR_BASERELOC, reloc_va, reloc_size)
            .build();

        match LoadedImage::load(&image) {
            Err(LoadError::SymbolResolutionFailed { library, symbol, .. }) => {
                assert_eq!(library, "kernel32.dll");
                assert_eq!(symbol, "GateGuardDefinitelyNotAnExport");
            }
            other => panic!("unexpected load result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_uninitialized_section_is_zeroed() {
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::uninitialized(b".bss"))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_BASERELOC, 3 * PAGE as u32, reloc_size)
            .build();

        let loaded = LoadedImage::load(&image).unwrap();
        let bss =
            unsafe { slice::from_raw_parts((loaded.code_base() as usize + 2 * PAGE) as *const u8, PAGE) };
        assert!(bss.iter().all(|&b| b == 0));
        loaded.free();
    }

    #[test]
    fn test_discardable_section_is_dropped() {
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::discardable(b".debug", vec![0x42; 32]))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_BASERELOC, 3 * PAGE as u32, reloc_size)
            .build();

        // The discardable pages are decommitted during finalization; loading
        // must still succeed and the rest of the image stays usable.
        let loaded = LoadedImage::load(&image).unwrap();
        let text = unsafe { ptr::read((loaded.code_base() as usize + PAGE) as *const u8) };
        assert_eq!(text, 0xC3);
        loaded.free();
    }

    #[test]
    fn test_lookup_without_exports() {
        let image = inert_dll();
        let loaded = LoadedImage::load(&image).unwrap();
        assert!(matches!(
            loaded.proc_by_name(b"anything"),
            Err(SymbolError::NoExports)
        ));
        assert!(matches!(
            loaded.proc_by_ordinal(1),
            Err(SymbolError::NoExports)
        ));
        loaded.free();
    }

    #[test]
    fn test_executable_image_entry_is_not_invoked() {
        let (reloc, reloc_size) = empty_reloc_directory();
        let image = ImageBuilder::new()
            .executable()
            .entry_rva(PAGE as u32)
            .section(SectionSpec::code(b".text", vec![0xC3; 16]))
            .section(SectionSpec::data(b".reloc", reloc))
            .directory(pe::DIR_BASERELOC, 2 * PAGE as u32, reloc_size)
            .build();

        // Only DLLs get their entry point called during load; for an
        // executable the address is recorded and left alone.
        let loaded = LoadedImage::load(&image).unwrap();
        assert!(!loaded.is_dll());
        assert!(!loaded.is_initialized());
        assert_eq!(loaded.entry_point(), loaded.code_base() as usize + PAGE);
        loaded.free();
    }

    #[test]
    fn test_corrupt_image_rejected_before_mapping() {
        let mut image = inert_dll();
        testimg::patch_u32(&mut image, testimg::NT_OFFSET, 0xDEAD_BEEF);
        assert!(matches!(
            LoadedImage::load(&image),
            Err(LoadError::BadImage { .. })
        ));
    }

    #[test]
    fn test_repeated_load_free_cycles() {
        let image = inert_dll();
        for _ in 0..50 {
            LoadedImage::load(&image).unwrap().free();
        }
    }
}
