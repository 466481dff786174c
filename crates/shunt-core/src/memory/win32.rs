//! Windows memory primitives and Control Flow Guard registration

use std::ffi::c_void;
use std::ptr;
use tracing::{debug, trace, warn};
use windows::Win32::System::Diagnostics::Debug::{FlushInstructionCache, ReadProcessMemory};
use windows::Win32::System::Memory::{
    CFG_CALL_TARGET_INFO, MEM_COMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE,
    MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_GUARD,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READWRITE, SetProcessValidCallTargets,
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::SystemServices::PROCESS_MITIGATION_CONTROL_FLOW_GUARD_POLICY;
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetProcessMitigationPolicy, ProcessControlFlowGuardPolicy,
};

use super::check_cfg_alignment;
use super::reader::ReadMemory;
use super::system::{
    AddressRange, AllocatedMemory, AllocationRequest, ControlFlowGuard, OsKind, PatchTargetKind,
    System, align_up, check_backup,
};
use crate::abi::Abi;
use crate::arch::ArchitectureKind;
use crate::error::{Error, Result};
use crate::features::SystemFeature;

/// Upper bound for a single allocation (64MB)
const MAX_ALLOCATION_SIZE: usize = 64 * 1024 * 1024;

/// CFG validates call targets at 16-byte granularity
const CFG_TARGET_ALIGNMENT: usize = 16;

const CFG_CALL_TARGET_VALID: usize = 0x1;

/// Bit 0 of the CFG mitigation policy flags (`EnableControlFlowGuard`)
const CFG_ENABLED_FLAG: u32 = 0x1;

struct WindowsCfg;

impl ControlFlowGuard for WindowsCfg {
    fn target_alignment_requirement(&self) -> usize {
        CFG_TARGET_ALIGNMENT
    }

    fn register_valid_indirect_call_targets(
        &self,
        base: usize,
        len: usize,
        offsets: &[usize],
    ) -> Result<()> {
        let mut infos: Vec<CFG_CALL_TARGET_INFO> = offsets
            .iter()
            .map(|&offset| CFG_CALL_TARGET_INFO {
                Offset: offset,
                Flags: CFG_CALL_TARGET_VALID,
            })
            .collect();

        // SAFETY: base..base+len is a live allocation owned by the caller
        let ok = unsafe {
            SetProcessValidCallTargets(GetCurrentProcess(), base as *const c_void, len, &mut infos)
        };
        if !ok.as_bool() {
            return Err(Error::MemoryProtectFailed {
                address: base,
                message: format!(
                    "SetProcessValidCallTargets failed: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        trace!("Registered {} call targets at 0x{:X}", offsets.len(), base);
        Ok(())
    }
}

fn cfg_enabled() -> bool {
    let mut policy = PROCESS_MITIGATION_CONTROL_FLOW_GUARD_POLICY::default();
    // SAFETY: the buffer is a correctly sized policy struct
    let result = unsafe {
        GetProcessMitigationPolicy(
            GetCurrentProcess(),
            ProcessControlFlowGuardPolicy,
            &mut policy as *mut _ as *mut c_void,
            size_of::<PROCESS_MITIGATION_CONTROL_FLOW_GUARD_POLICY>(),
        )
    };

    match result {
        // SAFETY: every bit pattern of the flags union is a valid u32
        Ok(()) => unsafe { policy.Anonymous.Flags } & CFG_ENABLED_FLAG != 0,
        Err(e) => {
            debug!("GetProcessMitigationPolicy failed: {}", e);
            false
        }
    }
}

fn query(address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut info = MEMORY_BASIC_INFORMATION::default();
    // SAFETY: VirtualQuery only writes into `info`
    let written = unsafe {
        VirtualQuery(
            Some(address as *const c_void),
            &mut info,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    (written != 0).then_some(info)
}

fn is_readable(info: &MEMORY_BASIC_INFORMATION) -> bool {
    info.State == MEM_COMMIT
        && (info.Protect & PAGE_GUARD).0 == 0
        && info.Protect != PAGE_NOACCESS
        && info.Protect.0 != 0
}

fn release(base: usize) {
    // SAFETY: base is the start of a region returned by VirtualAlloc
    if let Err(e) = unsafe { VirtualFree(base as *mut c_void, 0, MEM_RELEASE) } {
        debug!("VirtualFree(0x{:X}) failed: {}", base, e);
    }
}

pub struct WindowsSystem {
    granularity: usize,
    cfg: Option<WindowsCfg>,
}

impl WindowsSystem {
    pub fn new() -> Self {
        let mut info = SYSTEM_INFO::default();
        // SAFETY: GetSystemInfo only writes into `info`
        unsafe { GetSystemInfo(&mut info) };
        let granularity = (info.dwAllocationGranularity as usize).max(0x1000);

        let cfg = cfg_enabled().then_some(WindowsCfg);
        if cfg.is_some() {
            debug!("Control Flow Guard is enabled for this process");
        }

        Self { granularity, cfg }
    }

    fn alloc_at(&self, address: Option<usize>, size: usize, executable: bool) -> Option<usize> {
        let protect = if executable {
            PAGE_EXECUTE_READ
        } else {
            PAGE_READWRITE
        };
        // SAFETY: reserving fresh pages has no preconditions
        let ptr = unsafe {
            VirtualAlloc(
                address.map(|a| a as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                protect,
            )
        };
        (!ptr.is_null()).then_some(ptr as usize)
    }

    fn alloc_bounded(&self, request: &AllocationRequest) -> Option<usize> {
        let alignment = request.alignment.max(self.granularity);
        let mut cursor = align_up(request.low_bound.max(self.granularity), alignment);

        while cursor.checked_add(request.size)? <= request.high_bound {
            let info = query(cursor)?;
            let region_end = info.BaseAddress as usize + info.RegionSize;
            if info.State == MEM_FREE && region_end >= cursor + request.size {
                if let Some(base) = self.alloc_at(Some(cursor), request.size, request.executable) {
                    return Some(base);
                }
            }
            cursor = align_up(region_end.max(cursor + 1), alignment);
        }
        None
    }
}

impl Default for WindowsSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadMemory for WindowsSystem {
    fn read_into(&self, address: usize, buffer: &mut [u8]) -> Result<()> {
        let mut read = 0usize;
        // SAFETY: ReadProcessMemory validates the source range itself
        unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
                Some(&mut read as *mut usize),
            )
        }
        .map_err(|e| Error::MemoryReadFailed {
            address,
            message: e.to_string(),
        })?;

        if read != buffer.len() {
            return Err(Error::MemoryReadFailed {
                address,
                message: format!("short read of {} bytes", read),
            });
        }
        Ok(())
    }
}

impl System for WindowsSystem {
    fn target(&self) -> OsKind {
        OsKind::Windows
    }

    fn features(&self) -> SystemFeature {
        let mut features = SystemFeature::RWX_PAGES | SystemFeature::RX_PAGES;
        if self.cfg.is_some() {
            features |= SystemFeature::CONTROL_FLOW_GUARD;
        }
        features
    }

    fn default_abi(&self) -> Option<Abi> {
        Abi::for_platform(OsKind::Windows, ArchitectureKind::current())
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

        // VirtualAlloc bases are always granularity-aligned
        let base = if request.is_bounded() || request.alignment > self.granularity {
            self.alloc_bounded(request)
        } else {
            self.alloc_at(None, request.size, request.executable)
        };

        let Some(base) = base else {
            return Err(Error::AllocationFailed {
                size: request.size,
                alignment: request.alignment,
                message: std::io::Error::last_os_error().to_string(),
            });
        };

        debug!(
            "Allocated {} bytes at 0x{:X} (executable: {})",
            request.size, base, request.executable
        );
        Ok(AllocatedMemory::new(
            AddressRange::new(base, request.size),
            |range| release(range.base),
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

        if let Some(backup) = backup {
            self.read_into(address, &mut backup[..data.len()])?;
        }

        let writable = match kind {
            PatchTargetKind::Executable => PAGE_EXECUTE_READWRITE,
            PatchTargetKind::ReadOnly => PAGE_READWRITE,
        };
        let mut old = PAGE_PROTECTION_FLAGS::default();

        // SAFETY: VirtualProtect fails cleanly on unmapped ranges
        unsafe { VirtualProtect(address as *const c_void, data.len(), writable, &mut old) }
            .map_err(|e| Error::MemoryProtectFailed {
                address,
                message: e.to_string(),
            })?;

        // SAFETY: the range is mapped and was just made writable
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }

        let mut ignored = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: restores the protection read back above
        if let Err(e) =
            unsafe { VirtualProtect(address as *const c_void, data.len(), old, &mut ignored) }
        {
            warn!("Failed to restore protection at 0x{:X}: {}", address, e);
        }

        if kind == PatchTargetKind::Executable {
            // SAFETY: flushing the instruction cache has no memory-safety preconditions
            if let Err(e) = unsafe {
                FlushInstructionCache(
                    GetCurrentProcess(),
                    Some(address as *const c_void),
                    data.len(),
                )
            } {
                warn!("Failed to flush instruction cache at 0x{:X}: {}", address, e);
            }
        }

        trace!("Patched {} bytes at 0x{:X} ({})", data.len(), address, kind);
        Ok(())
    }

    fn size_of_readable_memory(&self, address: usize, max_probe: usize) -> usize {
        let mut end = address;
        while end - address < max_probe {
            let Some(info) = query(end) else {
                break;
            };
            if !is_readable(&info) {
                break;
            }
            end = info.BaseAddress as usize + info.RegionSize;
        }
        (end - address).min(max_probe)
    }

    fn control_flow_guard(&self) -> Option<&dyn ControlFlowGuard> {
        self.cfg.as_ref().map(|cfg| cfg as &dyn ControlFlowGuard)
    }
}
