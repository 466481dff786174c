//! Scriptable runtime for tests

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{MethodDesc, MethodRef, Runtime, RuntimeKind, VtableLayout};
use crate::abi::Abi;
use crate::error::Result;
use crate::features::RuntimeFeature;
use crate::platform::GlueMethod;

#[derive(Default)]
struct MockRuntimeState {
    /// Entry point reported per method handle
    entries: HashMap<usize, usize>,
    /// Entry point a method handle switches to once compiled
    compiled_entries: HashMap<usize, usize>,
    compile_count: usize,
    emitted: Vec<GlueMethod>,
}

pub struct MockRuntime {
    kind: RuntimeKind,
    features: RuntimeFeature,
    abi: Abi,
    generic_context: HashSet<usize>,
    canonical: HashMap<usize, MethodRef>,
    probe_candidates: Vec<MethodRef>,
    vtable_layout: Option<VtableLayout>,
    emits_glue: bool,
    state: Mutex<MockRuntimeState>,
}

impl MockRuntime {
    pub fn new(features: RuntimeFeature, abi: Abi) -> Self {
        Self {
            kind: RuntimeKind::CoreClr,
            features,
            abi,
            generic_context: HashSet::new(),
            canonical: HashMap::new(),
            probe_candidates: Vec::new(),
            vtable_layout: None,
            emits_glue: false,
            state: Mutex::new(MockRuntimeState::default()),
        }
    }

    pub fn with_entry(self, handle: usize, entry: usize) -> Self {
        self.state.lock().entries.insert(handle, entry);
        self
    }

    /// After `compile`, the method's entry point becomes `entry`
    pub fn with_compiled_entry(self, handle: usize, entry: usize) -> Self {
        self.state.lock().compiled_entries.insert(handle, entry);
        self
    }

    pub fn with_generic_context(mut self, handle: usize) -> Self {
        self.generic_context.insert(handle);
        self
    }

    pub fn with_canonical(mut self, handle: usize, method: MethodRef) -> Self {
        self.canonical.insert(handle, method);
        self
    }

    pub fn with_probe_candidates(mut self, candidates: Vec<MethodRef>) -> Self {
        self.probe_candidates = candidates;
        self
    }

    pub fn with_vtable_layout(mut self, layout: VtableLayout) -> Self {
        self.vtable_layout = Some(layout);
        self
    }

    pub fn emitting_glue(mut self) -> Self {
        self.emits_glue = true;
        self
    }

    pub fn set_entry(&self, handle: usize, entry: usize) {
        self.state.lock().entries.insert(handle, entry);
    }

    pub fn compile_count(&self) -> usize {
        self.state.lock().compile_count
    }

    pub fn emitted(&self) -> Vec<GlueMethod> {
        self.state.lock().emitted.clone()
    }
}

impl Runtime for MockRuntime {
    fn target(&self) -> RuntimeKind {
        self.kind
    }

    fn features(&self) -> RuntimeFeature {
        self.features
    }

    fn abi(&self) -> &Abi {
        &self.abi
    }

    fn method_entry_point(&self, method: &MethodRef) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .entries
            .get(&method.handle)
            .copied()
            .unwrap_or(method.handle))
    }

    fn compile(&self, method: &MethodRef) -> Result<()> {
        let mut state = self.state.lock();
        state.compile_count += 1;
        if let Some(entry) = state.compiled_entries.get(&method.handle).copied() {
            state.entries.insert(method.handle, entry);
        }
        Ok(())
    }

    fn identifiable(&self, method: &MethodRef) -> MethodRef {
        self.canonical
            .get(&method.handle)
            .cloned()
            .unwrap_or_else(|| method.clone())
    }

    fn requires_generic_context(&self, method: &MethodRef) -> bool {
        self.generic_context.contains(&method.handle)
    }

    fn emit_glue(&self, glue: &GlueMethod) -> Result<MethodRef> {
        if !self.emits_glue {
            return Err(crate::error::Error::GlueUnsupported(glue.name.clone()));
        }
        let mut state = self.state.lock();
        state.emitted.push(glue.clone());
        let handle = 0xF000_0000 + state.emitted.len() * 0x100;
        Ok(MethodDesc::new(glue.name.clone(), handle)
            .returning(glue.return_type.clone())
            .into_ref())
    }

    fn prestub_probe_candidates(&self) -> Vec<MethodRef> {
        self.probe_candidates.clone()
    }

    fn jit_vtable_layout(&self) -> Option<VtableLayout> {
        self.vtable_layout
    }
}
