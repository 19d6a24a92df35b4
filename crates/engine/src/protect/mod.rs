//! OS page protection
//!
//! A [`PageProtector`] changes the protection of whole pages and reports what
//! the protection was before. [`WritableWindow`] uses it to make a page-aligned
//! range writable for the duration of a write and put the previous protection
//! back when closed or dropped.
//!
//! Protection changes are process-global. Holding a window only keeps other
//! callers of the same engine out; foreign threads reading the region while a
//! write is in flight may observe partially written bytes.

use patchloop_common::{HotpatchError, ProtectionPhase, Result};
use std::fmt;
use std::io;
use tracing::{error, trace};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

/// Page access rights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl Protection {
    pub fn is_writable(&self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ReadWriteExecute)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protection::NoAccess => "---",
            Protection::ReadOnly => "r--",
            Protection::ReadWrite => "rw-",
            Protection::ReadExecute => "r-x",
            Protection::ReadWriteExecute => "rwx",
        };
        f.write_str(s)
    }
}

/// Capability to change page protection
pub trait PageProtector: Send + Sync + fmt::Debug {
    /// OS page size in bytes (a power of two)
    fn page_size(&self) -> usize;

    /// Set the protection of `[addr, addr + len)` and return the previous one
    ///
    /// # Safety
    /// `addr` must be page aligned and the whole range must be pages mapped
    /// into this process. Lowering the protection of memory that other code is
    /// still writing to is undefined behavior.
    unsafe fn protect(&self, addr: usize, len: usize, prot: Protection) -> io::Result<Protection>;
}

/// Backend for targets without a page protection API
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProtector;

impl PageProtector for UnsupportedProtector {
    fn page_size(&self) -> usize {
        4096
    }

    unsafe fn protect(&self, _addr: usize, _len: usize, _prot: Protection) -> io::Result<Protection> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "page protection is not supported on this target",
        ))
    }
}

/// Protector for the current operating system
pub fn platform_protector() -> Box<dyn PageProtector> {
    #[cfg(unix)]
    {
        Box::new(unix::PosixProtector::new())
    }
    #[cfg(windows)]
    {
        Box::new(windows::WindowsProtector::new())
    }
    #[cfg(not(any(unix, windows)))]
    {
        Box::new(UnsupportedProtector)
    }
}

/// Smallest page-aligned `(start, len)` covering `[addr, addr + len)`
pub fn aligned_window(addr: usize, len: usize, page_size: usize) -> (usize, usize) {
    debug_assert!(page_size.is_power_of_two());
    let mask = page_size - 1;
    let start = addr & !mask;
    let end = (addr + len.max(1) + mask) & !mask;
    (start, end - start)
}

/// Map an OS failure onto the error taxonomy
pub(crate) fn protection_error(
    err: io::Error,
    phase: ProtectionPhase,
    addr: usize,
    len: usize,
) -> HotpatchError {
    if err.kind() == io::ErrorKind::Unsupported {
        return HotpatchError::not_supported(err.to_string());
    }
    HotpatchError::Protection {
        phase,
        addr,
        len,
        os_code: err.raw_os_error().unwrap_or(-1),
    }
}

/// Page-aligned range made temporarily writable
///
/// Not `Clone`: the window owns the obligation to restore the previous
/// protection exactly once, either through [`WritableWindow::close`] or on drop.
#[derive(Debug)]
pub struct WritableWindow<'a> {
    protector: &'a dyn PageProtector,
    start: usize,
    len: usize,
    previous: Protection,
    restored: bool,
}

impl<'a> WritableWindow<'a> {
    /// Make the pages covering `[addr, addr + len)` read-write
    ///
    /// # Safety
    /// The range must lie inside memory mapped into this process for the
    /// lifetime of the window.
    pub unsafe fn open(protector: &'a dyn PageProtector, addr: usize, len: usize) -> Result<Self> {
        let (start, window_len) = aligned_window(addr, len, protector.page_size());
        let previous = protector
            .protect(start, window_len, Protection::ReadWrite)
            .map_err(|e| protection_error(e, ProtectionPhase::MakeWritable, start, window_len))?;

        trace!(
            "Opened writable window {:#x}+{} (previous {})",
            start,
            window_len,
            previous
        );

        Ok(Self {
            protector,
            start,
            len: window_len,
            previous,
            restored: false,
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Protection in force before the window was opened
    pub fn previous(&self) -> Protection {
        self.previous
    }

    /// Restore the previous protection, reporting failure
    pub fn close(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        if self.previous == Protection::ReadWrite {
            return Ok(());
        }
        // SAFETY: the same range was successfully re-protected in `open`.
        unsafe { self.protector.protect(self.start, self.len, self.previous) }
            .map(|_| ())
            .map_err(|e| protection_error(e, ProtectionPhase::Restore, self.start, self.len))
    }
}

impl Drop for WritableWindow<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!("CRITICAL: failed to restore page protection on drop: {}", e);
        }
    }
}
