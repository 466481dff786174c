//! Capability bits reported by each half of a platform triple

use bitflags::bitflags;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArchitectureFeature: u32 {
        /// Every instruction has the same width
        const FIXED_INSTRUCTION_SIZE = 1 << 0;
        /// A single detour can reach any 64-bit address without auxiliary memory
        const ABSOLUTE_64BIT_JUMP = 1 << 1;
        /// The architecture can relocate a clobbered prologue into an alternate entry
        const CREATE_ALT_ENTRY_POINT = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SystemFeature: u32 {
        const RWX_PAGES = 1 << 0;
        const RX_PAGES = 1 << 1;
        /// Indirect call targets must be registered before they are called
        const CONTROL_FLOW_GUARD = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RuntimeFeature: u32 {
        /// Entry points may be thunks that have to be walked to reach the body
        const REQUIRES_BODY_THUNK_WALKING = 1 << 0;
        /// The runtime must be asked to compile methods itself
        const REQUIRES_CUSTOM_METHOD_COMPILE = 1 << 1;
        const REQUIRES_METHOD_PINNING = 1 << 2;
        /// Method references must be canonicalized before comparison
        const REQUIRES_METHOD_IDENTIFICATION = 1 << 3;
        const DISABLE_INLINING = 1 << 4;
        /// Shared generic code receives an implicit generic context argument
        const GENERIC_SHARING = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags {
    pub architecture: ArchitectureFeature,
    pub system: SystemFeature,
    pub runtime: RuntimeFeature,
}

impl FeatureFlags {
    pub fn new(
        architecture: ArchitectureFeature,
        system: SystemFeature,
        runtime: RuntimeFeature,
    ) -> Self {
        Self {
            architecture,
            system,
            runtime,
        }
    }

    pub fn has_architecture(&self, feature: ArchitectureFeature) -> bool {
        self.architecture.contains(feature)
    }

    pub fn has_system(&self, feature: SystemFeature) -> bool {
        self.system.contains(feature)
    }

    pub fn has_runtime(&self, feature: RuntimeFeature) -> bool {
        self.runtime.contains(feature)
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .architecture
            .iter_names()
            .map(|(name, _)| name)
            .chain(self.system.iter_names().map(|(name, _)| name))
            .chain(self.runtime.iter_names().map(|(name, _)| name))
            .collect();

        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join(" | "))
        }
    }
}
