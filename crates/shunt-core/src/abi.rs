//! Calling convention metadata
//!
//! An [`Abi`] records where the special arguments (this pointer, return
//! buffer, generic context) sit relative to the user arguments, and which
//! return types are returned through a hidden buffer instead of registers.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::arch::ArchitectureKind;
use crate::memory::OsKind;
use crate::runtime::TypeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum SpecialArgumentKind {
    ThisPointer,
    ReturnBuffer,
    GenericContext,
    UserArguments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TypeClassification {
    InRegister,
    ByReference,
    OnStack,
}

/// Rule deciding how values are passed under one convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Classifier {
    /// System V AMD64: aggregates up to 16 bytes travel in registers
    SystemV64,
    /// Microsoft x64: only 1, 2, 4 and 8 byte aggregates travel in registers
    Win64,
    /// AArch64 procedure call standard
    Aapcs64,
    /// 32-bit x86 cdecl: up to 8 bytes in EDX:EAX
    Cdecl,
}

impl Classifier {
    pub fn classify(&self, ty: &TypeRef, is_return: bool) -> TypeClassification {
        let size = match ty {
            TypeRef::Struct { size, .. } => *size,
            TypeRef::Primitive { size, .. } if *size > 8 => *size,
            _ => return TypeClassification::InRegister,
        };

        let in_registers = match self {
            Classifier::SystemV64 | Classifier::Aapcs64 => size <= 16,
            Classifier::Win64 => matches!(size, 1 | 2 | 4 | 8),
            Classifier::Cdecl => is_return && size <= 8,
        };

        if in_registers {
            TypeClassification::InRegister
        } else if is_return {
            TypeClassification::ByReference
        } else if matches!(self, Classifier::Win64) {
            TypeClassification::ByReference
        } else {
            TypeClassification::OnStack
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abi {
    pub argument_order: Vec<SpecialArgumentKind>,
    pub classifier: Classifier,
    /// The callee hands the return buffer pointer back in the return register
    pub returns_return_buffer: bool,
}

impl Abi {
    pub fn system_v_x86_64() -> Self {
        Self {
            argument_order: vec![
                SpecialArgumentKind::ThisPointer,
                SpecialArgumentKind::ReturnBuffer,
                SpecialArgumentKind::GenericContext,
                SpecialArgumentKind::UserArguments,
            ],
            classifier: Classifier::SystemV64,
            returns_return_buffer: true,
        }
    }

    pub fn win64() -> Self {
        Self {
            argument_order: vec![
                SpecialArgumentKind::ThisPointer,
                SpecialArgumentKind::ReturnBuffer,
                SpecialArgumentKind::GenericContext,
                SpecialArgumentKind::UserArguments,
            ],
            classifier: Classifier::Win64,
            returns_return_buffer: true,
        }
    }

    /// The return buffer travels in x8, outside the argument registers
    pub fn aapcs64() -> Self {
        Self {
            argument_order: vec![
                SpecialArgumentKind::ThisPointer,
                SpecialArgumentKind::GenericContext,
                SpecialArgumentKind::UserArguments,
            ],
            classifier: Classifier::Aapcs64,
            returns_return_buffer: false,
        }
    }

    pub fn cdecl_x86() -> Self {
        Self {
            argument_order: vec![
                SpecialArgumentKind::ThisPointer,
                SpecialArgumentKind::ReturnBuffer,
                SpecialArgumentKind::UserArguments,
                SpecialArgumentKind::GenericContext,
            ],
            classifier: Classifier::Cdecl,
            returns_return_buffer: true,
        }
    }

    /// Convention used by native code for an OS and architecture pair
    pub fn for_platform(os: OsKind, arch: ArchitectureKind) -> Option<Self> {
        match (arch, os) {
            (ArchitectureKind::X86_64, OsKind::Windows) => Some(Self::win64()),
            (ArchitectureKind::X86_64, OsKind::Unknown) => None,
            (ArchitectureKind::X86_64, _) => Some(Self::system_v_x86_64()),
            (ArchitectureKind::X86, _) => Some(Self::cdecl_x86()),
            (ArchitectureKind::Aarch64, _) => Some(Self::aapcs64()),
            (ArchitectureKind::Arm, _) => None,
        }
    }

    pub fn classify(&self, ty: &TypeRef, is_return: bool) -> TypeClassification {
        self.classifier.classify(ty, is_return)
    }

    pub fn position_of(&self, kind: SpecialArgumentKind) -> Option<usize> {
        self.argument_order.iter().position(|k| *k == kind)
    }

    pub fn has_slot(&self, kind: SpecialArgumentKind) -> bool {
        self.position_of(kind).is_some()
    }

    /// Whether the generic context comes before the user arguments
    pub fn generic_context_precedes_arguments(&self) -> bool {
        match (
            self.position_of(SpecialArgumentKind::GenericContext),
            self.position_of(SpecialArgumentKind::UserArguments),
        ) {
            (Some(ctx), Some(args)) => ctx < args,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_win64() {
        let abi = Abi::win64();
        assert_eq!(abi.classify(&TypeRef::i64(), true), TypeClassification::InRegister);
        assert_eq!(
            abi.classify(&TypeRef::structure("Pair", 8), true),
            TypeClassification::InRegister
        );
        assert_eq!(
            abi.classify(&TypeRef::structure("Triple", 12), true),
            TypeClassification::ByReference
        );
        assert_eq!(
            abi.classify(&TypeRef::object("string"), true),
            TypeClassification::InRegister
        );
    }

    #[test]
    fn test_classify_system_v() {
        let abi = Abi::system_v_x86_64();
        assert_eq!(
            abi.classify(&TypeRef::structure("Vec2", 16), true),
            TypeClassification::InRegister
        );
        assert_eq!(
            abi.classify(&TypeRef::structure("Vec3", 24), true),
            TypeClassification::ByReference
        );
        assert_eq!(
            abi.classify(&TypeRef::structure("Vec3", 24), false),
            TypeClassification::OnStack
        );
    }

    #[test]
    fn test_generic_context_position() {
        assert!(Abi::system_v_x86_64().generic_context_precedes_arguments());
        assert!(!Abi::cdecl_x86().generic_context_precedes_arguments());
        assert!(!Abi::aapcs64().has_slot(SpecialArgumentKind::ReturnBuffer));
    }

    #[test]
    fn test_for_platform() {
        assert_eq!(
            Abi::for_platform(OsKind::Windows, ArchitectureKind::X86_64),
            Some(Abi::win64())
        );
        assert_eq!(
            Abi::for_platform(OsKind::Linux, ArchitectureKind::X86_64),
            Some(Abi::system_v_x86_64())
        );
        assert_eq!(Abi::for_platform(OsKind::Linux, ArchitectureKind::Arm), None);
    }
}
