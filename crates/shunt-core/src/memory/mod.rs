mod reader;
mod scratch;
mod system;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "windows")]
mod win32;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

pub use reader::ReadMemory;
pub use scratch::ScratchBuffer;
pub use system::{
    AddressRange, AllocatedMemory, AllocationRequest, ControlFlowGuard, OsKind, PatchTargetKind,
    System,
};
pub(crate) use system::{align_down, align_up};

#[cfg(target_os = "linux")]
pub use linux::LinuxSystem;
#[cfg(target_os = "windows")]
pub use win32::WindowsSystem;

#[cfg(test)]
pub use mock::{MockEvent, MockSystem, MockSystemBuilder};

use crate::error::{Error, Result};

/// Create the [`System`] implementation for the host OS
pub fn create_current_system() -> Result<Arc<dyn System>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxSystem::new()))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Arc::new(WindowsSystem::new()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Err(Error::PlatformNotSupported(format!(
            "no memory backend for {}",
            OsKind::current()
        )))
    }
}

/// Reject an executable request whose alignment is weaker than Control Flow Guard needs
pub fn check_cfg_alignment(system: &dyn System, request: &AllocationRequest) -> Result<()> {
    if !request.executable {
        return Ok(());
    }
    if let Some(cfg) = system.control_flow_guard() {
        let required = cfg.target_alignment_requirement();
        if request.alignment < required {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is below the CFG requirement of {}",
                request.alignment, required
            )));
        }
    }
    Ok(())
}
