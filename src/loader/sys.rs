//! Thin wrappers over the Win32 primitives the loader consumes
//!
//! Virtual memory (reserve/commit/protect/decommit/release), the OS library
//! loader, and system information. Failures surface as `std::io::Error` so
//! call sites can fold the OS message into their own error variants.

use std::ffi::c_void;
use std::io;

use windows::core::PCSTR;
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
};
use windows::Win32::System::SystemInformation::{GetNativeSystemInfo, SYSTEM_INFO};

/// Host page size from `GetNativeSystemInfo`.
pub(crate) fn page_size() -> usize {
    let mut info = SYSTEM_INFO::default();
    unsafe { GetNativeSystemInfo(&mut info) };
    info.dwPageSize as usize
}

/// Reserve and commit `size` bytes of read/write pages, preferably at
/// `hint` (0 for any address).
pub(crate) unsafe fn reserve_commit(hint: usize, size: usize) -> io::Result<*mut u8> {
    let hint = (hint != 0).then_some(hint as *const c_void);
    let base = VirtualAlloc(hint, size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
    if base.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(base.cast())
    }
}

/// Commit pages inside an existing reservation.
pub(crate) unsafe fn commit(address: *mut u8, size: usize) -> io::Result<*mut u8> {
    let base = VirtualAlloc(Some(address.cast_const().cast()), size, MEM_COMMIT, PAGE_READWRITE);
    if base.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(base.cast())
    }
}

/// Change page protection, returning the previous flags.
pub(crate) unsafe fn protect(
    address: *mut u8,
    size: usize,
    flags: PAGE_PROTECTION_FLAGS,
) -> io::Result<PAGE_PROTECTION_FLAGS> {
    let mut old = PAGE_PROTECTION_FLAGS(0);
    VirtualProtect(address.cast_const().cast(), size, flags, &mut old).map_err(win_err)?;
    Ok(old)
}

/// Return committed pages to the reserved state.
pub(crate) unsafe fn decommit(address: *mut u8, size: usize) -> io::Result<()> {
    VirtualFree(address.cast(), size, MEM_DECOMMIT).map_err(win_err)
}

/// Release a whole reservation.
pub(crate) unsafe fn release(address: *mut u8) {
    let _ = VirtualFree(address.cast(), 0, MEM_RELEASE);
}

/// Load a dependency through the OS loader. `name` points at a
/// NUL-terminated ANSI string.
pub(crate) unsafe fn load_library(name: *const u8) -> io::Result<HMODULE> {
    LoadLibraryA(PCSTR(name)).map_err(win_err)
}

pub(crate) unsafe fn free_library(handle: HMODULE) {
    let _ = FreeLibrary(handle);
}

/// Resolve an export. `name` points at a NUL-terminated ANSI string.
pub(crate) unsafe fn proc_address(handle: HMODULE, name: *const u8) -> io::Result<usize> {
    match GetProcAddress(handle, PCSTR(name)) {
        Some(function) => Ok(function as usize),
        None => Err(io::Error::last_os_error()),
    }
}

/// Resolve an export by ordinal, encoded the way `GetProcAddress` expects.
pub(crate) unsafe fn proc_address_by_ordinal(handle: HMODULE, ordinal: u16) -> io::Result<usize> {
    proc_address(handle, ordinal as usize as *const u8)
}

fn win_err(error: windows::core::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}
