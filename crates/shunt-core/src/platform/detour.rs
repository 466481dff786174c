use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::arch::{Architecture, DetourInfo, MAX_DETOUR_SIZE};
use crate::error::{Error, Result};
use crate::memory::{AllocatedMemory, PatchTargetKind, System};

/// An applied redirection of one address to another
///
/// Dropping an applied detour restores the original bytes.
pub struct SimpleNativeDetour {
    system: Arc<dyn System>,
    arch: Arc<dyn Architecture>,
    info: DetourInfo,
    /// Where the bytes were written; differs from `info.from` for writable aliases
    write_address: usize,
    backup: Vec<u8>,
    allocation: Option<AllocatedMemory>,
    applied: bool,
}

impl SimpleNativeDetour {
    /// Encode and write a detour from `from` to `to`.
    ///
    /// The original bytes are saved before anything is written.
    pub(crate) fn apply(
        system: Arc<dyn System>,
        arch: Arc<dyn Architecture>,
        info: DetourInfo,
        write_address: usize,
    ) -> Result<Self> {
        let mut bytes = [0u8; MAX_DETOUR_SIZE];
        let (size, allocation) = arch.get_detour_bytes(&info, &mut bytes)?;
        debug_assert_eq!(size, info.size);

        let mut backup = vec![0u8; size];
        system.patch_data(
            PatchTargetKind::Executable,
            write_address,
            &bytes[..size],
            Some(&mut backup),
        )?;

        trace!(
            "Applied {} byte detour 0x{:X} -> 0x{:X}",
            size, info.from, info.to
        );
        Ok(Self {
            system,
            arch,
            info,
            write_address,
            backup,
            allocation,
            applied: true,
        })
    }

    pub fn from(&self) -> usize {
        self.info.from
    }

    pub fn to(&self) -> usize {
        self.info.to
    }

    pub fn info(&self) -> &DetourInfo {
        &self.info
    }

    /// Bytes the detour overwrote
    pub fn backup(&self) -> &[u8] {
        &self.backup
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Restore the original bytes and release auxiliary memory
    pub fn undo(&mut self) -> Result<()> {
        if !self.applied {
            return Ok(());
        }

        self.system.patch_data(
            PatchTargetKind::Executable,
            self.write_address,
            &self.backup,
            None,
        )?;
        self.applied = false;
        self.allocation = None;

        debug!("Removed detour at 0x{:X}", self.info.from);
        Ok(())
    }

    /// Point an applied detour somewhere else without exceeding its original size
    pub fn change_target(&mut self, to: usize) -> Result<()> {
        if !self.applied {
            return Err(Error::InvalidArgument(format!(
                "detour at 0x{:X} is not applied",
                self.info.from
            )));
        }
        if to == self.info.from {
            return Err(Error::SelfDetour { address: to });
        }

        let info = self
            .arch
            .compute_detour_info(self.info.from, to, Some(self.backup.len()))?;
        let mut bytes = [0u8; MAX_DETOUR_SIZE];
        let (size, allocation) = self.arch.get_detour_bytes(&info, &mut bytes)?;

        self.system.patch_data(
            PatchTargetKind::Executable,
            self.write_address,
            &bytes[..size],
            None,
        )?;

        trace!(
            "Retargeted detour at 0x{:X}: 0x{:X} -> 0x{:X}",
            info.from, self.info.to, to
        );
        self.info = info;
        self.allocation = allocation;
        Ok(())
    }
}

impl Drop for SimpleNativeDetour {
    fn drop(&mut self) {
        if let Err(e) = self.undo() {
            error!("Failed to remove detour at 0x{:X}: {}", self.info.from, e);
        }
    }
}

/// A [`SimpleNativeDetour`] plus, when one could be made, an entry point that
/// still runs the original code
pub struct NativeDetour {
    simple: SimpleNativeDetour,
    alt_entry: Option<usize>,
    alt_memory: Option<AllocatedMemory>,
}

impl NativeDetour {
    pub(crate) fn new(simple: SimpleNativeDetour, alt: Option<(usize, AllocatedMemory)>) -> Self {
        let (alt_entry, alt_memory) = match alt {
            Some((entry, memory)) => (Some(entry), Some(memory)),
            None => (None, None),
        };
        Self {
            simple,
            alt_entry,
            alt_memory,
        }
    }

    pub fn simple(&self) -> &SimpleNativeDetour {
        &self.simple
    }

    pub fn simple_mut(&mut self) -> &mut SimpleNativeDetour {
        &mut self.simple
    }

    pub fn has_alt_entry(&self) -> bool {
        self.alt_entry.is_some()
    }

    pub fn alt_entry(&self) -> Option<usize> {
        self.alt_entry
    }

    /// Remove the detour and free the alternate entry point
    pub fn undo(&mut self) -> Result<()> {
        self.simple.undo()?;
        self.alt_entry = None;
        self.alt_memory = None;
        Ok(())
    }
}
