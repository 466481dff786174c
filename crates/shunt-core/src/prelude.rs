//! Prelude module for convenient imports
//!
//! ```ignore
//! use shunt_core::prelude::*;
//! ```
//!
//! This brings the following into scope:
//!
//! - Entry point: `PlatformTriple`, `EngineConfig`
//! - Detours: `SimpleNativeDetour`, `NativeDetour`, `VtableProxy`
//! - Collaborator traits: `Architecture`, `System`, `Runtime`, `ReadMemory`
//! - Method descriptions: `MethodRef`, `MethodDesc`, `TypeRef`
//! - Error handling: `Error`, `Result`

// Entry point
pub use crate::config::{EngineConfig, EngineConfigBuilder};
pub use crate::platform::PlatformTriple;

// Error handling
pub use crate::error::{Error, Result};

// Detours
pub use crate::platform::{NativeDetour, SimpleNativeDetour, VtableProxy};

// Collaborators
pub use crate::arch::Architecture;
pub use crate::memory::{ReadMemory, System};
pub use crate::runtime::{Runtime, RuntimeKind};

// Method descriptions
pub use crate::runtime::{MethodDesc, MethodRef, TypeRef};
