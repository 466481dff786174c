use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString, IntoStaticStr};

use super::reader::ReadMemory;
use crate::abi::Abi;
use crate::error::{Error, Result};
use crate::features::SystemFeature;

/// Operating system a [`System`] implementation targets
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OsKind {
    Linux,
    Windows,
    MacOs,
    FreeBsd,
    Unknown,
}

impl OsKind {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            OsKind::Linux
        } else if cfg!(target_os = "windows") {
            OsKind::Windows
        } else if cfg!(target_os = "macos") {
            OsKind::MacOs
        } else if cfg!(target_os = "freebsd") {
            OsKind::FreeBsd
        } else {
            OsKind::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub base: usize,
    pub len: usize,
}

impl AddressRange {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}..0x{:X}", self.base, self.end())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub size: usize,
    pub alignment: usize,
    pub executable: bool,
    /// Lowest acceptable base address
    pub low_bound: usize,
    /// One past the highest acceptable end address
    pub high_bound: usize,
}

impl AllocationRequest {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            alignment: size_of::<usize>(),
            executable: false,
            low_bound: 0,
            high_bound: usize::MAX,
        }
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    /// Restrict placement to within `reach` bytes of `address` in either direction
    pub fn near(mut self, address: usize, reach: usize) -> Self {
        self.low_bound = address.saturating_sub(reach);
        self.high_bound = address.saturating_add(reach);
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.low_bound != 0 || self.high_bound != usize::MAX
    }

    /// Whether `range` satisfies this request's placement window
    pub fn accepts(&self, range: &AddressRange) -> bool {
        range.base >= self.low_bound
            && range.base % self.alignment == 0
            && range.base.checked_add(range.len).is_some_and(|end| end <= self.high_bound)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "allocation alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.low_bound >= self.high_bound {
            return Err(Error::InvalidArgument(format!(
                "empty placement window 0x{:X}..0x{:X}",
                self.low_bound, self.high_bound
            )));
        }
        Ok(())
    }
}

type Release = Box<dyn FnOnce(AddressRange) + Send + Sync>;

/// Owned handle over an allocated region; dropping it releases the region
pub struct AllocatedMemory {
    range: AddressRange,
    release: Option<Release>,
}

impl AllocatedMemory {
    pub fn new(
        range: AddressRange,
        release: impl FnOnce(AddressRange) + Send + Sync + 'static,
    ) -> Self {
        Self {
            range,
            release: Some(Box::new(release)),
        }
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn base(&self) -> usize {
        self.range.base
    }

    pub fn size(&self) -> usize {
        self.range.len
    }
}

impl fmt::Debug for AllocatedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedMemory")
            .field("range", &self.range)
            .finish()
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.range);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PatchTargetKind {
    /// Code pages; stay executable while patched
    Executable,
    ReadOnly,
}

/// Registration of valid indirect call targets (Control Flow Guard)
pub trait ControlFlowGuard: Send + Sync {
    /// Alignment every registered target must have
    fn target_alignment_requirement(&self) -> usize;

    /// Mark `base + offset` as a valid indirect call target for each offset.
    fn register_valid_indirect_call_targets(
        &self,
        base: usize,
        len: usize,
        offsets: &[usize],
    ) -> Result<()>;
}

/// Operating-system memory primitives
pub trait System: ReadMemory + Send + Sync {
    fn target(&self) -> OsKind;

    fn features(&self) -> SystemFeature;

    /// Native calling convention of this OS on the host architecture
    fn default_abi(&self) -> Option<Abi>;

    /// Largest single allocation [`System::try_allocate`] can satisfy
    fn max_allocation_size(&self) -> usize;

    fn try_allocate(&self, request: &AllocationRequest) -> Result<AllocatedMemory>;

    /// Overwrite `data.len()` bytes at `address`, saving the previous bytes into `backup`.
    ///
    /// The backup is taken before anything is written.
    fn patch_data(
        &self,
        kind: PatchTargetKind,
        address: usize,
        data: &[u8],
        backup: Option<&mut [u8]>,
    ) -> Result<()>;

    /// Number of contiguous readable bytes at `address`, capped at `max_probe`
    fn size_of_readable_memory(&self, address: usize, max_probe: usize) -> usize;

    fn control_flow_guard(&self) -> Option<&dyn ControlFlowGuard> {
        None
    }
}

pub(crate) fn check_backup(backup: &Option<&mut [u8]>, len: usize) -> Result<()> {
    match backup {
        Some(buf) if buf.len() < len => Err(Error::InvalidArgument(format!(
            "backup buffer holds {} bytes, patch writes {}",
            buf.len(),
            len
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}
