//! Windows backend over `VirtualProtect`

use super::{PageProtector, Protection};
use std::ffi::c_void;
use std::io;
use windows_sys::Win32::System::Memory::{
    VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

#[derive(Debug)]
pub struct WindowsProtector {
    page_size: usize,
}

impl WindowsProtector {
    pub fn new() -> Self {
        // SAFETY: GetSystemInfo fills the zeroed struct
        let info: SYSTEM_INFO = unsafe {
            let mut info = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        let page_size = if info.dwPageSize > 0 {
            info.dwPageSize as usize
        } else {
            4096
        };
        Self { page_size }
    }
}

fn to_flags(prot: Protection) -> PAGE_PROTECTION_FLAGS {
    match prot {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::ReadOnly => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ReadExecute => PAGE_EXECUTE_READ,
        Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
    }
}

fn from_flags(flags: PAGE_PROTECTION_FLAGS) -> Protection {
    // Guard and cache modifiers sit above the low byte
    match flags & 0xFF {
        PAGE_READONLY => Protection::ReadOnly,
        PAGE_READWRITE | PAGE_WRITECOPY => Protection::ReadWrite,
        PAGE_EXECUTE_READ => Protection::ReadExecute,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::ReadWriteExecute,
        _ => Protection::NoAccess,
    }
}

/// Refuse ranges whose regions carry different protections; only one is
/// restored on close
///
/// # Safety
/// `addr` must be a valid address in this process.
unsafe fn check_uniform(addr: usize, len: usize) -> io::Result<()> {
    let end = addr.saturating_add(len);
    let mut cursor = addr;
    let mut first: Option<PAGE_PROTECTION_FLAGS> = None;
    while cursor < end {
        let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
        let size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();
        if VirtualQuery(cursor as *const c_void, &mut info, size) == 0 {
            return Err(io::Error::last_os_error());
        }
        let prot = info.Protect & 0xFF;
        match first {
            Some(existing) if existing != prot => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "range {:#x}+{} spans regions with different protections ({} and {})",
                        addr,
                        len,
                        from_flags(existing),
                        from_flags(prot)
                    ),
                ));
            }
            _ => first = Some(prot),
        }
        let next = info.BaseAddress as usize + info.RegionSize;
        if next <= cursor {
            break;
        }
        cursor = next;
    }
    Ok(())
}

impl PageProtector for WindowsProtector {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn protect(&self, addr: usize, len: usize, prot: Protection) -> io::Result<Protection> {
        check_uniform(addr, len)?;
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        // SAFETY: caller guarantees the range is page aligned and mapped
        let ok = VirtualProtect(addr as *const c_void, len, to_flags(prot), &mut old);
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(from_flags(old))
    }
}
