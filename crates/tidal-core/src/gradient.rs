use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelId};
use crate::tensor::Tensor;

// GradientRegistry: per-kernel backward functions
//
// For every kernel that can appear on the tape, the registry holds a
// GradientDescriptor:
//
//   kernel            which KernelId it differentiates
//   inputs_to_save    input slots whose values the backward needs ("a", "x")
//   outputs_to_save   per output, whether its value is needed (Exp, Sigmoid)
//   backward          maps upstream gradients to one thunk per input slot
//
// At record time the engine keeps only the tensors the descriptor names
// (as kept clones that share the buffer). At backward time it calls
// `backward` and then runs each returned thunk inside its own tidy, so the
// intermediates a gradient rule creates are released straight away.
//
// Thunks are lazy: a slot that is not on the path to a watched tensor is
// never evaluated.

/// Name of a kernel input slot ("a", "b", "x", or "x0".."xN" for custom
/// gradients).
pub type Slot = Cow<'static, str>;

/// A deferred gradient computation for one input slot.
pub type GradThunk<B> = Box<dyn FnOnce(&mut Engine<B>) -> Result<Tensor>>;

/// Input slot → gradient thunk.
pub type GradientMap<B> = BTreeMap<Slot, GradThunk<B>>;

/// Wrap a closure as a `GradThunk`.
pub fn thunk<B, F>(f: F) -> GradThunk<B>
where
    B: Backend,
    F: FnOnce(&mut Engine<B>) -> Result<Tensor> + 'static,
{
    Box::new(f)
}

/// Everything a backward function may look at for one tape record.
#[derive(Debug)]
pub struct BackwardArgs<'a> {
    /// The forward kernel with its parameters.
    pub kernel: &'a Kernel,
    /// Forward inputs. Only shape and dtype may be relied on; values must
    /// come from `saved`.
    pub inputs: &'a [(Slot, Tensor)],
    /// Upstream gradients, one per forward output.
    pub dys: &'a [Tensor],
    /// Saved tensors: the inputs named in `inputs_to_save`, in that order,
    /// followed by the outputs flagged in `outputs_to_save`.
    pub saved: &'a [Tensor],
}

impl<'a> BackwardArgs<'a> {
    /// Gradient of the first (usually only) output.
    pub fn dy(&self) -> Result<&'a Tensor> {
        self.dys
            .first()
            .ok_or_else(|| Error::msg(format!("kernel '{}' received no upstream gradient", self.kernel.id())))
    }

    /// Forward input in `slot`.
    pub fn input(&self, slot: &str) -> Result<&'a Tensor> {
        self.inputs
            .iter()
            .find(|(s, _)| s == slot)
            .map(|(_, t)| t)
            .ok_or_else(|| {
                Error::msg(format!("kernel '{}' has no input slot '{slot}'", self.kernel.id()))
            })
    }

    /// Saved tensor at `index`.
    pub fn saved(&self, index: usize) -> Result<&'a Tensor> {
        self.saved.get(index).ok_or_else(|| {
            Error::msg(format!(
                "kernel '{}' saved {} tensors, backward asked for #{index}",
                self.kernel.id(),
                self.saved.len()
            ))
        })
    }
}

/// A backward rule. Returns one thunk per differentiable input slot.
pub trait GradientFn<B: Backend> {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>>;
}

impl<B, F> GradientFn<B> for F
where
    B: Backend,
    F: Fn(&BackwardArgs<'_>) -> Result<GradientMap<B>>,
{
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        self(args)
    }
}

/// Backward descriptor for one kernel.
pub struct GradientDescriptor<B: Backend> {
    pub kernel: KernelId,
    pub inputs_to_save: Vec<&'static str>,
    pub outputs_to_save: Vec<bool>,
    pub backward: Arc<dyn GradientFn<B>>,
}

impl<B: Backend> GradientDescriptor<B> {
    pub fn new(kernel: impl Into<KernelId>, backward: impl GradientFn<B> + 'static) -> Self {
        GradientDescriptor {
            kernel: kernel.into(),
            inputs_to_save: Vec::new(),
            outputs_to_save: Vec::new(),
            backward: Arc::new(backward),
        }
    }

    pub fn save_inputs(mut self, slots: &[&'static str]) -> Self {
        self.inputs_to_save = slots.to_vec();
        self
    }

    pub fn save_outputs(mut self, outputs: &[bool]) -> Self {
        self.outputs_to_save = outputs.to_vec();
        self
    }
}

impl<B: Backend> fmt::Debug for GradientDescriptor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientDescriptor")
            .field("kernel", &self.kernel)
            .field("inputs_to_save", &self.inputs_to_save)
            .field("outputs_to_save", &self.outputs_to_save)
            .finish_non_exhaustive()
    }
}

/// Kernel name → backward descriptor.
pub struct GradientRegistry<B: Backend> {
    descriptors: HashMap<KernelId, Arc<GradientDescriptor<B>>>,
}

impl<B: Backend> Default for GradientRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradientRegistry<B> {
    /// An empty registry.
    pub fn new() -> Self {
        GradientRegistry {
            descriptors: HashMap::new(),
        }
    }

    /// A registry holding the built-in rules for every non-custom kernel.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for descriptor in crate::grads::default_descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    /// Register a descriptor. A later registration for the same kernel
    /// replaces the earlier one.
    pub fn register(&mut self, descriptor: GradientDescriptor<B>) {
        let kernel = descriptor.kernel.clone();
        if self
            .descriptors
            .insert(kernel.clone(), Arc::new(descriptor))
            .is_some()
        {
            tracing::debug!(%kernel, "overwriting gradient descriptor");
        }
    }

    pub fn lookup(&self, kernel: &KernelId) -> Result<Arc<GradientDescriptor<B>>> {
        self.get(kernel).ok_or_else(|| Error::UnregisteredGradient {
            kernel: kernel.clone(),
        })
    }

    pub fn get(&self, kernel: &KernelId) -> Option<Arc<GradientDescriptor<B>>> {
        self.descriptors.get(kernel).cloned()
    }

    pub fn contains(&self, kernel: &KernelId) -> bool {
        self.descriptors.contains_key(kernel)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl<B: Backend> fmt::Debug for GradientRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kernels: Vec<_> = self.descriptors.keys().map(|k| k.as_str()).collect();
        kernels.sort_unstable();
        f.debug_struct("GradientRegistry")
            .field("kernels", &kernels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullBackend;

    fn empty_rule(_args: &BackwardArgs<'_>) -> Result<GradientMap<NullBackend>> {
        Ok(GradientMap::new())
    }

    #[test]
    fn test_lookup_unregistered_names_kernel() {
        let registry = GradientRegistry::<NullBackend>::new();
        let err = registry.lookup(&KernelId::new("Erf")).unwrap_err();
        assert!(matches!(err, Error::UnregisteredGradient { .. }));
        assert!(err.to_string().contains("Erf"));
    }

    #[test]
    fn test_register_overwrites() {
        let mut registry = GradientRegistry::<NullBackend>::new();
        registry.register(GradientDescriptor::new("Erf", empty_rule).save_inputs(&["x"]));
        registry.register(GradientDescriptor::new("Erf", empty_rule).save_outputs(&[true]));
        assert_eq!(registry.len(), 1);
        let d = registry.lookup(&KernelId::new("Erf")).unwrap();
        assert!(d.inputs_to_save.is_empty());
        assert_eq!(d.outputs_to_save, vec![true]);
    }

    #[test]
    fn test_defaults_cover_builtin_kernels() {
        let registry = GradientRegistry::<NullBackend>::with_defaults();
        for kernel in [
            KernelId::ADD,
            KernelId::DIV,
            KernelId::EXP,
            KernelId::IS_NAN,
            KernelId::SUM,
            KernelId::MEAN,
            KernelId::RESHAPE,
            KernelId::BROADCAST_TO,
            KernelId::CAST,
            KernelId::IDENTITY,
        ] {
            assert!(registry.contains(&kernel), "missing {kernel}");
        }
        assert!(!registry.contains(&KernelId::CUSTOM_GRADIENT));
    }

    #[test]
    fn test_backward_args_accessors() {
        let kernel = Kernel::Identity;
        let x = crate::testing::handle(0, &[2]);
        let inputs = [(Slot::Borrowed("x"), x.clone())];
        let args = BackwardArgs {
            kernel: &kernel,
            inputs: &inputs,
            dys: &[],
            saved: &[],
        };
        assert_eq!(args.input("x").unwrap(), &x);
        assert!(args.input("y").is_err());
        assert!(args.dy().is_err());
        assert!(args.saved(0).is_err());
    }
}
