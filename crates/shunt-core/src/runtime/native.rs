use std::sync::Arc;
use tracing::debug;

use super::{MethodRef, Runtime, RuntimeKind};
use crate::abi::Abi;
use crate::error::{Error, Result};
use crate::features::RuntimeFeature;
use crate::memory::System;

/// Runtime for plain native functions, whose handle is their entry address
pub struct NativeRuntime {
    abi: Abi,
}

impl NativeRuntime {
    pub fn new(system: Arc<dyn System>) -> Result<Self> {
        let abi = system.default_abi().ok_or_else(|| {
            Error::PlatformNotSupported(format!("no native ABI known for {}", system.target()))
        })?;
        debug!("Native runtime using {:?} classification", abi.classifier);
        Ok(Self { abi })
    }
}

impl Runtime for NativeRuntime {
    fn target(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn features(&self) -> RuntimeFeature {
        RuntimeFeature::empty()
    }

    fn abi(&self) -> &Abi {
        &self.abi
    }

    fn method_entry_point(&self, method: &MethodRef) -> Result<usize> {
        if method.handle == 0 {
            return Err(Error::InvalidArgument(format!(
                "{} has no native address",
                method.full_name()
            )));
        }
        Ok(method.handle)
    }

    fn compile(&self, _method: &MethodRef) -> Result<()> {
        Ok(())
    }

    fn requires_generic_context(&self, _method: &MethodRef) -> bool {
        false
    }
}
