use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::backend::{Backend, BackendStorage, KernelInput, KernelOutput};
use crate::config::EngineConfig;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::gradient::{GradientDescriptor, GradientRegistry};
use crate::kernel::Kernel;
use crate::scope::{Scope, ScopeId, ScopeStack, ScopeState};
use crate::shape::Shape;
use crate::tape::Tape;
use crate::tensor::{DataId, Tensor, TensorContainer, TensorId};
use crate::variable::Variable;

// Engine: the runtime context
//
// One Engine owns everything a computation needs:
//
//   backend    executes kernels and owns buffers
//   tensors    TensorId → which buffer, which scope, kept or not
//   data       DataId   → buffer + ref count
//   scopes     the tidy/keep stack
//   variables  named, scope-exempt tensors
//   registry   kernel → backward rule
//   tape       records made while gradients are being taken
//
// There is no global state: callers pass `&mut Engine<B>` around, and
// closures given to `tidy`, `gradients` and friends receive it back.
//
// LIFECYCLE OF A TENSOR
//
//   created by run_kernel / a creation helper
//     → registered in the innermost scope's arena (if a scope is open)
//   scope ends
//     → released, unless it was returned from the scope or kept
//   dispose()
//     → released now; any later use of the handle is DisposedTensor
//
// Releasing a tensor drops one reference to its buffer; the buffer goes
// back to the backend when the last reference is gone.

/// Counts reported by `Engine::memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    /// Live tensor handles, including variables and tape-saved clones.
    pub num_tensors: usize,
    /// Live backend buffers. Less than `num_tensors` when buffers are shared.
    pub num_data_buffers: usize,
    /// Bytes held by live buffers.
    pub num_bytes: usize,
}

#[derive(Debug)]
pub(crate) struct TensorEntry {
    pub(crate) data: DataId,
    pub(crate) scope: Option<ScopeId>,
    pub(crate) kept: bool,
    pub(crate) variable: Option<String>,
}

#[derive(Debug)]
struct DataEntry<S> {
    storage: S,
    refs: usize,
    bytes: usize,
}

/// The tensor runtime: memory lifecycle, kernel dispatch and autodiff.
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,
    registry: GradientRegistry<B>,
    scopes: ScopeStack,
    tensors: HashMap<TensorId, TensorEntry>,
    data: HashMap<DataId, DataEntry<B::Storage>>,
    variables: BTreeMap<String, Variable>,
    next_tensor_id: u64,
    next_data_id: u64,
    next_variable_id: u64,
    num_bytes: usize,
    pub(crate) tape: Tape<B>,
    /// Number of gradient computations whose forward function is running.
    pub(crate) gradient_depth: usize,
    /// Number of composite kernels (custom_grad forwards) currently running.
    pub(crate) kernel_depth: usize,
}

impl<B: Backend> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("memory", &self.memory())
            .field("scope_depth", &self.scopes.depth())
            .field("variables", &self.variables.len())
            .finish()
    }
}

fn lookup_storage<'a, S>(
    tensors: &HashMap<TensorId, TensorEntry>,
    data: &'a HashMap<DataId, DataEntry<S>>,
    t: &Tensor,
) -> Result<&'a S> {
    let entry = tensors
        .get(&t.id)
        .ok_or(Error::DisposedTensor { id: t.id })?;
    data.get(&entry.data)
        .map(|d| &d.storage)
        .ok_or(Error::DisposedTensor { id: t.id })
}

impl<B: Backend> Engine<B> {
    /// Create an engine with the default config and the built-in gradients.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        debug!(backend = backend.name(), ?config, "engine created");
        Engine {
            backend,
            config,
            registry: GradientRegistry::with_defaults(),
            scopes: ScopeStack::new(),
            tensors: HashMap::new(),
            data: HashMap::new(),
            variables: BTreeMap::new(),
            next_tensor_id: 0,
            next_data_id: 0,
            next_variable_id: 0,
            num_bytes: 0,
            tape: Tape::default(),
            gradient_depth: 0,
            kernel_depth: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &GradientRegistry<B> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut GradientRegistry<B> {
        &mut self.registry
    }

    /// Records made by the gradient computation in progress. Empty between
    /// gradient calls.
    pub fn tape(&self) -> &Tape<B> {
        &self.tape
    }

    /// Register (or replace) the backward rule for a kernel.
    pub fn register_gradient(&mut self, descriptor: GradientDescriptor<B>) {
        self.registry.register(descriptor);
    }

    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.tensors.len(),
            num_data_buffers: self.data.len(),
            num_bytes: self.num_bytes,
        }
    }

    // Tensor table

    pub(crate) fn entry(&self, id: TensorId) -> Result<&TensorEntry> {
        self.tensors.get(&id).ok_or(Error::DisposedTensor { id })
    }

    pub fn is_disposed(&self, t: &Tensor) -> bool {
        !self.tensors.contains_key(&t.id)
    }

    /// Whether `t` is exempt from scope cleanup (kept, a variable, or saved
    /// by the tape).
    pub fn is_kept(&self, t: &Tensor) -> Result<bool> {
        Ok(self.entry(t.id)?.kept)
    }

    pub(crate) fn storage(&self, t: &Tensor) -> Result<&B::Storage> {
        lookup_storage(&self.tensors, &self.data, t)
    }

    fn add_data(&mut self, storage: B::Storage) -> DataId {
        let id = DataId(self.next_data_id);
        self.next_data_id += 1;
        let bytes = storage.size_in_bytes();
        self.num_bytes += bytes;
        self.data.insert(
            id,
            DataEntry {
                storage,
                refs: 0,
                bytes,
            },
        );
        id
    }

    fn retain_data(&mut self, id: DataId) {
        if let Some(d) = self.data.get_mut(&id) {
            d.refs += 1;
        }
    }

    fn release_data(&mut self, id: DataId) {
        let Some(d) = self.data.get_mut(&id) else {
            return;
        };
        d.refs = d.refs.saturating_sub(1);
        if d.refs == 0 {
            if let Some(d) = self.data.remove(&id) {
                self.num_bytes -= d.bytes;
                self.backend.release(d.storage);
            }
        }
    }

    /// New tensor entry over an existing buffer. Tracked tensors go into the
    /// innermost scope; untracked ones are exempt from scope cleanup.
    fn new_entry(
        &mut self,
        data: DataId,
        shape: Shape,
        dtype: DType,
        tracked: bool,
        variable: Option<String>,
    ) -> Tensor {
        let id = TensorId(self.next_tensor_id);
        self.next_tensor_id += 1;
        self.retain_data(data);
        let scope = if tracked { self.scopes.track(id) } else { None };
        self.tensors.insert(
            id,
            TensorEntry {
                data,
                scope,
                kept: !tracked,
                variable,
            },
        );
        Tensor::new(id, shape, dtype)
    }

    /// Wrap freshly produced storage in a tracked tensor.
    pub(crate) fn make_tensor(
        &mut self,
        storage: B::Storage,
        shape: Shape,
        dtype: DType,
    ) -> Result<Tensor> {
        if storage.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: storage.len(),
                shape,
            });
        }
        let data = self.add_data(storage);
        Ok(self.new_entry(data, shape, dtype, true, None))
    }

    /// A second handle on `t`'s buffer that no scope will release. Used for
    /// tensors saved by the tape.
    pub(crate) fn share_untracked(&mut self, t: &Tensor) -> Result<Tensor> {
        let data = self.entry(t.id)?.data;
        Ok(self.new_entry(data, t.shape.clone(), t.dtype, false, None))
    }

    /// Drop a tensor now. Fails with `DisposedTensor` if it is already gone.
    pub(crate) fn release_tensor(&mut self, id: TensorId) -> Result<()> {
        let entry = self
            .tensors
            .remove(&id)
            .ok_or(Error::DisposedTensor { id })?;
        if let Some(name) = entry.variable {
            self.variables.remove(&name);
        }
        self.release_data(entry.data);
        Ok(())
    }

    /// Copy a tensor's values out as f64, row-major.
    pub fn read(&self, t: &Tensor) -> Result<Vec<f64>> {
        let storage = self.storage(t)?;
        self.backend.to_f64_vec(storage)
    }

    /// Read a single-element tensor.
    pub fn read_scalar(&self, t: &Tensor) -> Result<f64> {
        let values = self.read(t)?;
        match values.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::ElementCountMismatch {
                shape: t.shape.clone(),
                expected: 1,
                got: values.len(),
            }),
        }
    }

    // Scopes

    /// Open a scope. Every tensor created until the matching `end_scope` is
    /// registered in it.
    pub fn start_scope(&mut self, name: &str) -> ScopeId {
        let id = self.scopes.push(name);
        debug!(scope = name, %id, depth = self.scopes.depth(), "start scope");
        id
    }

    /// Number of open scopes.
    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    pub(crate) fn current_scope(&self) -> Option<ScopeId> {
        self.scopes.current().map(|s| s.id())
    }

    /// Close the innermost scope. Tensors in `result` and kept tensors move
    /// to the parent scope; every other tensor the scope registered is
    /// released. Returns the closed scope with an empty arena.
    pub fn end_scope<R: TensorContainer + ?Sized>(&mut self, result: &R) -> Result<Scope> {
        let mut scope = match self.scopes.pop() {
            Ok(scope) => scope,
            Err(e) => {
                warn!("end_scope called with no open scope");
                return Err(e);
            }
        };
        let preserve: HashSet<TensorId> = result.tensor_ids().into_iter().collect();
        let mut released = 0usize;
        let mut moved = 0usize;
        for id in std::mem::take(&mut scope.arena) {
            let Some(entry) = self.tensors.get(&id) else {
                continue;
            };
            if entry.kept || preserve.contains(&id) {
                let parent = self.scopes.track(id);
                if let Some(entry) = self.tensors.get_mut(&id) {
                    entry.scope = parent;
                }
                moved += 1;
            } else {
                self.release_tensor(id)?;
                released += 1;
            }
        }
        scope.state = ScopeState::Closed;
        debug!(scope = %scope.name(), id = %scope.id(), released, moved, "end scope");
        Ok(scope)
    }

    /// Run `f` in a fresh scope. Tensors created inside are released when
    /// `f` returns, except those in its result and those kept. Cleanup also
    /// runs when `f` fails; the error is then returned unchanged.
    pub fn tidy<R, F>(&mut self, f: F) -> Result<R>
    where
        R: TensorContainer,
        F: FnOnce(&mut Self) -> Result<R>,
    {
        self.tidy_named("tidy", f)
    }

    /// `tidy` with a scope name for logs.
    pub fn tidy_named<R, F>(&mut self, name: &str, f: F) -> Result<R>
    where
        R: TensorContainer,
        F: FnOnce(&mut Self) -> Result<R>,
    {
        let id = self.start_scope(name);
        let result = f(self);
        if self.scopes.current().map(|s| s.id()) != Some(id) {
            warn!(scope = name, %id, "scope stack unbalanced inside tidy");
        }
        match result {
            Ok(value) => {
                self.end_scope(&value)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(end_err) = self.end_scope(&()) {
                    warn!(scope = name, error = %end_err, "cleanup after failed tidy");
                }
                Err(err)
            }
        }
    }

    /// Exempt `t` from every enclosing scope's cleanup.
    pub fn keep(&mut self, t: &Tensor) -> Result<Tensor> {
        let entry = self
            .tensors
            .get_mut(&t.id)
            .ok_or(Error::DisposedTensor { id: t.id })?;
        entry.kept = true;
        Ok(t.clone())
    }

    /// Release every tensor in `container` now. A handle that was already
    /// released fails with `DisposedTensor`; tensors before it in visit
    /// order have been released by then.
    pub fn dispose<C: TensorContainer + ?Sized>(&mut self, container: &C) -> Result<()> {
        let mut seen = HashSet::new();
        for id in container.tensor_ids() {
            if seen.insert(id) {
                self.release_tensor(id)?;
            }
        }
        Ok(())
    }

    // Kernel dispatch

    /// Execute a kernel on the backend and wrap its outputs as tensors in
    /// the current scope. Records the call on the tape while gradients are
    /// being taken.
    pub fn run_kernel(
        &mut self,
        kernel: Kernel,
        inputs: &[(&'static str, &Tensor)],
    ) -> Result<Vec<Tensor>> {
        let start = self.config.debug.then(Instant::now);
        let outputs: Vec<KernelOutput<B::Storage>> = {
            let mut kernel_inputs = Vec::with_capacity(inputs.len());
            for (_, t) in inputs {
                kernel_inputs.push(KernelInput {
                    storage: lookup_storage(&self.tensors, &self.data, t)?,
                    shape: &t.shape,
                    dtype: t.dtype,
                });
            }
            self.backend.execute(&kernel, &kernel_inputs)?
        };

        let mut tensors = Vec::with_capacity(outputs.len());
        for out in outputs {
            tensors.push(self.make_tensor(out.storage, out.shape, out.dtype)?);
        }

        trace!(kernel = %kernel.id(), inputs = inputs.len(), outputs = tensors.len(), "kernel");
        if let Some(start) = start {
            self.profile_kernel(&kernel, &tensors, start)?;
        }

        if self.is_recording() {
            self.record_kernel(&kernel, inputs, &tensors)?;
        }
        Ok(tensors)
    }

    /// `run_kernel` for kernels with exactly one output.
    pub fn run_kernel1(&mut self, kernel: Kernel, inputs: &[(&'static str, &Tensor)]) -> Result<Tensor> {
        let id = kernel.id();
        let mut outputs = self.run_kernel(kernel, inputs)?;
        match outputs.len() {
            1 => Ok(outputs.remove(0)),
            n => {
                self.dispose(&outputs)?;
                Err(Error::msg(format!("kernel '{id}' returned {n} outputs, expected 1")))
            }
        }
    }

    fn profile_kernel(&self, kernel: &Kernel, outputs: &[Tensor], start: Instant) -> Result<()> {
        let shapes: Vec<String> = outputs.iter().map(|t| t.shape.to_string()).collect();
        debug!(
            kernel = %kernel.id(),
            outputs = ?shapes,
            elapsed_us = start.elapsed().as_micros() as u64,
            "kernel profile"
        );
        for t in outputs.iter().filter(|t| t.dtype.is_float()) {
            if self.read(t)?.iter().any(|v| v.is_nan()) {
                warn!(kernel = %kernel.id(), tensor = %t.id, "kernel produced NaN");
            }
        }
        Ok(())
    }

    // Variables

    /// Register a variable holding `initial`'s value. The variable shares
    /// the buffer; disposing `initial` afterwards does not affect it.
    ///
    /// Without a name, one is generated. A duplicate name fails with
    /// `VariableExists`.
    pub fn variable(&mut self, initial: &Tensor, trainable: bool, name: Option<&str>) -> Result<Variable> {
        let name = match name {
            Some(name) => name.to_string(),
            None => loop {
                let candidate = format!("variable{}", self.next_variable_id);
                self.next_variable_id += 1;
                if !self.variables.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        if self.variables.contains_key(&name) {
            return Err(Error::VariableExists(name));
        }
        let data = self.entry(initial.id)?.data;
        let tensor = self.new_entry(
            data,
            initial.shape.clone(),
            initial.dtype,
            false,
            Some(name.clone()),
        );
        let variable = Variable {
            name: name.clone(),
            tensor,
            trainable,
        };
        debug!(variable = %name, shape = %initial.shape, trainable, "variable registered");
        self.variables.insert(name, variable.clone());
        Ok(variable)
    }

    /// Look up a registered variable by name.
    pub fn get_variable(&self, name: &str) -> Result<Variable> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))
    }

    /// All registered variables, ordered by name.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn trainable_variables(&self) -> Vec<Variable> {
        self.variables
            .values()
            .filter(|v| v.trainable)
            .cloned()
            .collect()
    }

    /// Replace the variable's value with `value`'s buffer. The variable keeps
    /// its id and name; shape and dtype must match.
    pub fn assign(&mut self, variable: &Variable, value: &Tensor) -> Result<()> {
        match self.variables.get(&variable.name) {
            Some(v) if v.tensor.id == variable.tensor.id => {}
            _ => return Err(Error::UnknownVariable(variable.name.clone())),
        }
        if value.shape != variable.tensor.shape {
            return Err(Error::ShapeMismatch {
                lhs: variable.tensor.shape.clone(),
                rhs: value.shape.clone(),
            });
        }
        if value.dtype != variable.tensor.dtype {
            return Err(Error::DTypeMismatch {
                expected: variable.tensor.dtype,
                got: value.dtype,
            });
        }
        let new_data = self.entry(value.id)?.data;
        self.retain_data(new_data);
        let entry = self
            .tensors
            .get_mut(&variable.tensor.id)
            .ok_or(Error::DisposedTensor {
                id: variable.tensor.id,
            })?;
        let old_data = std::mem::replace(&mut entry.data, new_data);
        self.release_data(old_data);
        Ok(())
    }

    pub fn dispose_variable(&mut self, variable: &Variable) -> Result<()> {
        if !self.variables.contains_key(&variable.name) {
            return Err(Error::UnknownVariable(variable.name.clone()));
        }
        self.release_tensor(variable.tensor.id)
    }

    /// Dispose every registered variable.
    pub fn dispose_variables(&mut self) -> Result<()> {
        let ids: Vec<TensorId> = self.variables.values().map(|v| v.tensor.id).collect();
        for id in ids {
            self.release_tensor(id)?;
        }
        Ok(())
    }
}
