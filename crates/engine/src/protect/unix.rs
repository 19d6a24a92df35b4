//! POSIX backend over `mprotect`

use super::{PageProtector, Protection};
use std::io;

#[derive(Debug)]
pub struct PosixProtector {
    page_size: usize,
}

impl PosixProtector {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if raw > 0 { raw as usize } else { 4096 };
        Self { page_size }
    }
}

fn to_flags(prot: Protection) -> libc::c_int {
    match prot {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    }
}

fn from_perms(read: bool, write: bool, exec: bool) -> Protection {
    match (read, write, exec) {
        (_, true, true) => Protection::ReadWriteExecute,
        (_, true, false) => Protection::ReadWrite,
        (true, false, true) | (false, false, true) => Protection::ReadExecute,
        (true, false, false) => Protection::ReadOnly,
        (false, false, false) => Protection::NoAccess,
    }
}

/// Protection shared by every mapping overlapping `[addr, addr + len)`,
/// read from `/proc/self/maps`
#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_protection(addr: usize, len: usize) -> io::Result<Option<Protection>> {
    match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => parse_maps(&maps, addr, len),
        Err(_) => Ok(None),
    }
}

/// POSIX has no query call; assume the common heap/anonymous default
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn current_protection(_addr: usize, _len: usize) -> io::Result<Option<Protection>> {
    Ok(None)
}

/// A single protection is restored on close, so a range crossing mappings
/// with different permissions is refused.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn parse_maps(maps: &str, addr: usize, len: usize) -> io::Result<Option<Protection>> {
    let end = addr.saturating_add(len.max(1));
    let mut found: Option<Protection> = None;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
            continue;
        };
        let perms = perms.as_bytes();
        let Some((lo, hi)) = range.split_once('-') else {
            continue;
        };
        let (Ok(lo), Ok(hi)) = (usize::from_str_radix(lo, 16), usize::from_str_radix(hi, 16)) else {
            continue;
        };
        if hi <= addr || lo >= end || perms.len() < 3 {
            continue;
        }
        let prot = from_perms(perms[0] == b'r', perms[1] == b'w', perms[2] == b'x');
        match found {
            Some(existing) if existing != prot => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "range {:#x}+{} spans mappings with different protections ({} and {})",
                        addr, len, existing, prot
                    ),
                ));
            }
            _ => found = Some(prot),
        }
    }
    Ok(found)
}

impl PageProtector for PosixProtector {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn protect(&self, addr: usize, len: usize, prot: Protection) -> io::Result<Protection> {
        let previous = current_protection(addr, len)?.unwrap_or(Protection::ReadWrite);
        // SAFETY: caller guarantees the range is page aligned and mapped
        let rc = libc::mprotect(addr as *mut libc::c_void, len, to_flags(prot));
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps() {
        let maps = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/app
00651000-00652000 r--p 00051000 08:02 173521 /usr/bin/app
7f0000000000-7f0000021000 rw-p 00000000 00:00 0
";
        assert_eq!(parse_maps(maps, 0x0040_1000, 1).unwrap(), Some(Protection::ReadExecute));
        assert_eq!(parse_maps(maps, 0x0065_1000, 1).unwrap(), Some(Protection::ReadOnly));
        assert_eq!(parse_maps(maps, 0x7f00_0000_0010, 1).unwrap(), Some(Protection::ReadWrite));
        assert_eq!(parse_maps(maps, 0x10, 1).unwrap(), None);
    }

    #[test]
    fn test_range_across_mappings() {
        let maps = "\
7f0000000000-7f0000002000 rw-p 00000000 00:00 0
7f0000002000-7f0000004000 r--p 00000000 00:00 0
7f0000004000-7f0000006000 r--p 00000000 00:00 0
";
        assert_eq!(
            parse_maps(maps, 0x7f00_0000_0000, 0x2000).unwrap(),
            Some(Protection::ReadWrite)
        );
        // Adjacent mappings with equal permissions are one window
        assert_eq!(
            parse_maps(maps, 0x7f00_0000_3000, 0x2000).unwrap(),
            Some(Protection::ReadOnly)
        );
        let err = parse_maps(maps, 0x7f00_0000_1000, 0x2000).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(PosixProtector::new().page_size().is_power_of_two());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_protect_round_trip_on_anonymous_mapping() {
        let protector = PosixProtector::new();
        let page = protector.page_size();
        let mut map = memmap2::MmapMut::map_anon(page).unwrap();
        map[0] = 7;
        let map = map.make_read_only().unwrap();
        let addr = map.as_ptr() as usize;

        let previous = unsafe { protector.protect(addr, page, Protection::ReadWrite) }.unwrap();
        assert_eq!(previous, Protection::ReadOnly);
        unsafe { (addr as *mut u8).write(9) };
        let previous = unsafe { protector.protect(addr, page, Protection::ReadOnly) }.unwrap();
        assert_eq!(previous, Protection::ReadWrite);
        assert_eq!(map[0], 9);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_protect_refuses_mixed_window() {
        let protector = PosixProtector::new();
        let page = protector.page_size();
        let map = memmap2::MmapMut::map_anon(page * 2).unwrap();
        let addr = map.as_ptr() as usize;

        unsafe { protector.protect(addr + page, page, Protection::ReadOnly) }.unwrap();
        let err = unsafe { protector.protect(addr, page * 2, Protection::ReadWrite) }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Nothing changed; the first page is still writable
        unsafe { (addr as *mut u8).write(3) };
        unsafe { protector.protect(addr + page, page, Protection::ReadWrite) }.unwrap();
        assert_eq!(map[0], 3);
    }
}
