//! Linux memory primitives over `mmap`/`mprotect` and `/proc/self/maps`

use std::fs;
use std::ptr;
use tracing::{debug, trace};

use super::check_cfg_alignment;
use super::reader::ReadMemory;
use super::system::{
    AddressRange, AllocatedMemory, AllocationRequest, OsKind, PatchTargetKind, System, align_down,
    align_up, check_backup,
};
use crate::abi::Abi;
use crate::arch::ArchitectureKind;
use crate::error::{Error, Result};
use crate::features::SystemFeature;

const MAPS_PATH: &str = "/proc/self/maps";

/// Upper bound for a single allocation (64MB)
const MAX_ALLOCATION_SIZE: usize = 64 * 1024 * 1024;

/// Bounded allocations give up after this many candidate gaps
const MAX_PLACEMENT_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    start: usize,
    end: usize,
    prot: i32,
}

impl Mapping {
    fn readable(&self) -> bool {
        self.prot & libc::PROT_READ != 0
    }
}

fn parse_maps(content: &str) -> Vec<Mapping> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (start, end) = fields.next()?.split_once('-')?;
            let perms = fields.next()?.as_bytes();
            if perms.len() < 3 {
                return None;
            }

            let mut prot = libc::PROT_NONE;
            if perms[0] == b'r' {
                prot |= libc::PROT_READ;
            }
            if perms[1] == b'w' {
                prot |= libc::PROT_WRITE;
            }
            if perms[2] == b'x' {
                prot |= libc::PROT_EXEC;
            }

            Some(Mapping {
                start: usize::from_str_radix(start, 16).ok()?,
                end: usize::from_str_radix(end, 16).ok()?,
                prot,
            })
        })
        .collect()
}

fn read_maps() -> Result<Vec<Mapping>> {
    Ok(parse_maps(&fs::read_to_string(MAPS_PATH)?))
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

fn last_os_error() -> String {
    std::io::Error::last_os_error().to_string()
}

pub struct LinuxSystem {
    page_size: usize,
}

impl LinuxSystem {
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }

    fn map(&self, hint: usize, len: usize, prot: i32, fixed: bool) -> Option<usize> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if fixed {
            flags |= libc::MAP_FIXED_NOREPLACE;
        }

        // SAFETY: anonymous mapping; MAP_FIXED_NOREPLACE never clobbers existing mappings
        let ptr = unsafe { libc::mmap(hint as *mut libc::c_void, len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        let base = ptr as usize;
        if fixed && base != hint {
            // Kernels without MAP_FIXED_NOREPLACE treat it as a hint
            unmap(base, len);
            return None;
        }
        Some(base)
    }

    fn allocate_unbounded(&self, len: usize, alignment: usize, prot: i32) -> Option<usize> {
        if alignment <= self.page_size {
            return self.map(0, len, prot, false);
        }

        let padded = len + alignment;
        let raw = self.map(0, padded, prot, false)?;
        let base = align_up(raw, alignment);
        if base > raw {
            unmap(raw, base - raw);
        }
        let tail = raw + padded - (base + len);
        if tail > 0 {
            unmap(base + len, tail);
        }
        Some(base)
    }

    fn allocate_bounded(&self, request: &AllocationRequest, len: usize, prot: i32) -> Result<Option<usize>> {
        let alignment = request.alignment.max(self.page_size);
        let maps = read_maps()?;
        let center = request.low_bound / 2 + request.high_bound / 2;

        let mut candidates: Vec<usize> = Vec::new();
        let mut gap_start = self.page_size;
        for mapping in maps.iter().chain(std::iter::once(&Mapping {
            start: usize::MAX & !(self.page_size - 1),
            end: usize::MAX,
            prot: 0,
        })) {
            let lo = align_up(gap_start.max(request.low_bound), alignment);
            let hi = mapping.start.min(request.high_bound);
            if lo < hi && hi - lo >= len {
                // Prefer the part of the gap closest to the window center
                let highest = align_down(hi - len, alignment);
                candidates.push(align_down(center, alignment).clamp(lo, highest));
            }
            gap_start = gap_start.max(mapping.end);
        }

        candidates.sort_by_key(|c| c.abs_diff(center));
        for hint in candidates.into_iter().take(MAX_PLACEMENT_ATTEMPTS) {
            if let Some(base) = self.map(hint, len, prot, true) {
                return Ok(Some(base));
            }
        }
        Ok(None)
    }

    fn mappings_covering(&self, start: usize, end: usize) -> Result<Vec<Mapping>> {
        let covering: Vec<Mapping> = read_maps()?
            .into_iter()
            .filter(|m| m.start < end && start < m.end)
            .map(|m| Mapping {
                start: m.start.max(start),
                end: m.end.min(end),
                prot: m.prot,
            })
            .collect();

        let contiguous = covering.first().is_some_and(|m| m.start == start)
            && covering.last().is_some_and(|m| m.end == end)
            && covering.windows(2).all(|w| w[0].end == w[1].start);
        if !contiguous {
            return Err(Error::MemoryProtectFailed {
                address: start,
                message: "range is not fully mapped".to_string(),
            });
        }
        Ok(covering)
    }
}

impl Default for LinuxSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn unmap(base: usize, len: usize) {
    // SAFETY: callers only pass ranges this module mapped
    let rc = unsafe { libc::munmap(base as *mut libc::c_void, len) };
    if rc != 0 {
        debug!("munmap(0x{:X}, {}) failed: {}", base, len, last_os_error());
    }
}

fn protect(address: usize, len: usize, prot: i32) -> Result<()> {
    // SAFETY: the range was checked against /proc/self/maps
    let rc = unsafe { libc::mprotect(address as *mut libc::c_void, len, prot) };
    if rc != 0 {
        return Err(Error::MemoryProtectFailed {
            address,
            message: last_os_error(),
        });
    }
    Ok(())
}

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

impl ReadMemory for LinuxSystem {
    fn read_into(&self, address: usize, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let local = libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
            iov_len: buffer.len(),
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: buffer.len(),
        };

        // SAFETY: the kernel validates the remote range and fails with EFAULT instead of faulting
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read < 0 || read as usize != buffer.len() {
            return Err(Error::MemoryReadFailed {
                address,
                message: if read < 0 {
                    last_os_error()
                } else {
                    format!("short read of {} bytes", read)
                },
            });
        }
        Ok(())
    }
}

impl System for LinuxSystem {
    fn target(&self) -> OsKind {
        OsKind::Linux
    }

    fn features(&self) -> SystemFeature {
        SystemFeature::RWX_PAGES | SystemFeature::RX_PAGES
    }

    fn default_abi(&self) -> Option<Abi> {
        Abi::for_platform(OsKind::Linux, ArchitectureKind::current())
    }

    fn max_allocation_size(&self) -> usize {
        MAX_ALLOCATION_SIZE
    }

    fn try_allocate(&self, request: &AllocationRequest) -> Result<AllocatedMemory> {
        check_cfg_alignment(self, request)?;
        request.validate()?;
        if request.size > MAX_ALLOCATION_SIZE {
            return Err(Error::AllocationFailed {
                size: request.size,
                alignment: request.alignment,
                message: "larger than the maximum allocation size".to_string(),
            });
        }

        let len = align_up(request.size, self.page_size);
        let prot = if request.executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };

        let base = if request.is_bounded() {
            self.allocate_bounded(request, len, prot)?
        } else {
            self.allocate_unbounded(len, request.alignment, prot)
        };

        let Some(base) = base else {
            return Err(Error::AllocationFailed {
                size: request.size,
                alignment: request.alignment,
                message: last_os_error(),
            });
        };

        debug!(
            "Allocated {} bytes at 0x{:X} (executable: {})",
            len, base, request.executable
        );
        Ok(AllocatedMemory::new(
            AddressRange::new(base, request.size),
            move |range| unmap(range.base, len),
        ))
    }

    fn patch_data(
        &self,
        kind: PatchTargetKind,
        address: usize,
        data: &[u8],
        backup: Option<&mut [u8]>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        check_backup(&backup, data.len())?;

        let start = align_down(address, self.page_size);
        let end = align_up(address + data.len(), self.page_size);
        let original = self.mappings_covering(start, end)?;

        if let Some(backup) = backup {
            self.read_into(address, &mut backup[..data.len()])?;
        }

        let writable = match kind {
            PatchTargetKind::Executable => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            PatchTargetKind::ReadOnly => libc::PROT_READ | libc::PROT_WRITE,
        };
        protect(start, end - start, writable)?;

        // SAFETY: the whole range is mapped and was just made writable
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }
        #[cfg(target_arch = "aarch64")]
        if kind == PatchTargetKind::Executable {
            // SAFETY: the range was just written and is still mapped
            unsafe {
                __clear_cache(
                    address as *mut libc::c_char,
                    (address + data.len()) as *mut libc::c_char,
                );
            }
        }

        for mapping in &original {
            protect(mapping.start, mapping.end - mapping.start, mapping.prot)?;
        }

        trace!("Patched {} bytes at 0x{:X} ({})", data.len(), address, kind);
        Ok(())
    }

    fn size_of_readable_memory(&self, address: usize, max_probe: usize) -> usize {
        let maps = match read_maps() {
            Ok(maps) => maps,
            Err(e) => {
                debug!("Failed to read {}: {}", MAPS_PATH, e);
                return 0;
            }
        };

        let Some(first) = maps.iter().position(|m| m.start <= address && address < m.end) else {
            return 0;
        };

        if !maps[first].readable() {
            return 0;
        }

        let mut end = maps[first].end;
        for mapping in &maps[first + 1..] {
            if end - address >= max_probe || mapping.start != end || !mapping.readable() {
                break;
            }
            end = mapping.end;
        }
        (end - address).min(max_probe)
    }
}
