//! # shunt-core
//!
//! Core library for redirecting native and managed code at runtime.
//!
//! This crate provides:
//! - Detour encoding for x86, x86_64 and aarch64
//! - Executable memory allocation and patching for Linux and Windows
//! - Thunk recognition via byte patterns, used to find a method's real body
//! - Calling convention fixup planning for detours between mismatched methods
//! - Executable stub pages backing vtable proxies
//!
//! Everything is reached through a [`PlatformTriple`]: one architecture, one
//! operating system and one runtime.
//!
//! ```ignore
//! use shunt_core::prelude::*;
//!
//! let triple = PlatformTriple::current()?;
//! let detour = triple.create_native_detour(from, to, None, None)?;
//! ```

pub mod abi;
pub mod arch;
pub mod config;
pub mod error;
pub mod features;
pub mod memory;
pub mod pattern;
pub mod platform;
pub mod prelude;
pub mod runtime;

pub use abi::{Abi, SpecialArgumentKind, TypeClassification};
pub use arch::{
    Architecture, ArchitectureKind, DetourInfo, DetourKind, create_architecture,
    create_current_architecture,
};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{Error, Result};
pub use features::{ArchitectureFeature, FeatureFlags, RuntimeFeature, SystemFeature};
pub use memory::{
    AllocatedMemory, AllocationRequest, OsKind, PatchTargetKind, ReadMemory, System,
    create_current_system,
};
pub use pattern::{BytePattern, BytePatternCollection, ThunkSignatureSet};
pub use platform::{
    FixupPlan, GlueMethod, NativeDetour, PlatformTriple, SimpleNativeDetour, VtableProxy,
    plan_abi_fixup,
};
pub use runtime::{
    MethodDesc, MethodPin, MethodRef, NativeRuntime, Runtime, RuntimeKind, TypeRef, VtableLayout,
};
