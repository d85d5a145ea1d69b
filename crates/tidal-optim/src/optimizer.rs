use std::collections::BTreeMap;

use tracing::debug;

use tidal_core::autodiff::VariableGrads;
use tidal_core::backend::Backend;
use tidal_core::dtype::DType;
use tidal_core::engine::Engine;
use tidal_core::error::{Error, Result};
use tidal_core::tensor::Tensor;
use tidal_core::variable::{NamedTensor, Variable};

/// Variable name → gradient, as produced by `Engine::variable_grads`.
/// `None` entries are skipped by every optimizer.
pub type NamedGradients = BTreeMap<String, Option<Tensor>>;

/// Name of the iteration counter in `get_weights` / `set_weights`.
pub const ITERATIONS_WEIGHT: &str = "iter";

/// Trait that all optimizers implement.
///
/// An optimizer updates registered variables in place from their gradients:
/// it looks each variable up by name, computes the new value inside a
/// `tidy`, and writes it back with `Engine::assign`. Auxiliary state (Adagrad
/// accumulators, Adam moments) lives in non-trainable variables created
/// lazily the first time a variable receives a gradient.
pub trait Optimizer<B: Backend> {
    /// Short class name ("SGD", "Adagrad", "Adam").
    fn name(&self) -> &'static str;

    /// Apply one update. Variables whose gradient is `None` are left alone.
    /// The iteration counter increases once per call.
    fn apply_gradients(&mut self, engine: &mut Engine<B>, grads: &NamedGradients) -> Result<()>;

    /// Number of `apply_gradients` calls so far.
    fn iterations(&self) -> u64;

    /// State for checkpointing: the iteration counter as `"iter"`, followed
    /// by the optimizer's state variables in creation order.
    fn get_weights(&self, engine: &mut Engine<B>) -> Result<Vec<NamedTensor>>;

    /// Restore state saved by `get_weights`. The first entry is the
    /// iteration counter.
    fn set_weights(&mut self, engine: &mut Engine<B>, weights: &[NamedTensor]) -> Result<()>;

    /// Release every variable the optimizer owns.
    fn dispose(&mut self, engine: &mut Engine<B>) -> Result<()>;

    /// Hyper-parameters by name.
    fn config(&self) -> Vec<(&'static str, f64)>;

    /// Run `f` and compute the gradient of its scalar result with respect to
    /// `var_list` (all trainable variables when `None`).
    fn compute_gradients(
        &mut self,
        engine: &mut Engine<B>,
        f: &mut dyn FnMut(&mut Engine<B>) -> Result<Tensor>,
        var_list: Option<&[Variable]>,
    ) -> Result<VariableGrads> {
        engine.variable_grads(|e| f(e), var_list)
    }

    /// Compute gradients, apply them, and dispose them. Returns the loss when
    /// `return_cost` is set; the caller then owns it.
    fn minimize(
        &mut self,
        engine: &mut Engine<B>,
        f: &mut dyn FnMut(&mut Engine<B>) -> Result<Tensor>,
        return_cost: bool,
        var_list: Option<&[Variable]>,
    ) -> Result<Option<Tensor>> {
        let VariableGrads { value, grads } = self.compute_gradients(engine, f, var_list)?;
        let applied = self.apply_gradients(engine, &grads);
        engine.dispose(&grads)?;
        if let Err(e) = applied {
            engine.dispose(&value)?;
            return Err(e);
        }
        if return_cost {
            Ok(Some(value))
        } else {
            engine.dispose(&value)?;
            Ok(None)
        }
    }
}

/// The `"iter"` entry of `get_weights`.
pub(crate) fn save_iterations<B: Backend>(engine: &mut Engine<B>, iterations: u64) -> Result<NamedTensor> {
    let tensor = engine.tensor_with_dtype(&[iterations as f64], (), DType::I64)?;
    Ok(NamedTensor::new(ITERATIONS_WEIGHT, tensor))
}

/// Read the iteration counter from the first weight; returns the rest.
pub(crate) fn extract_iterations<'a, B: Backend>(
    engine: &Engine<B>,
    weights: &'a [NamedTensor],
) -> Result<(u64, &'a [NamedTensor])> {
    let (first, rest) = weights
        .split_first()
        .ok_or_else(|| Error::msg("set_weights expects at least the iteration counter"))?;
    let iterations = engine.read_scalar(&first.tensor)?;
    if iterations < 0.0 || iterations.fract() != 0.0 {
        return Err(Error::msg(format!(
            "iteration counter must be a non-negative integer, got {iterations}"
        )));
    }
    Ok((iterations as u64, rest))
}

/// Auxiliary per-variable state, named `"<variable>/<slot>"` and kept in
/// creation order.
#[derive(Debug, Default)]
pub struct OptimizerState {
    slots: Vec<(String, Variable)>,
}

impl OptimizerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.slots.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// The state variable `"<variable>/<slot>"`, created filled with `init`
    /// (in the variable's shape and dtype) the first time it is asked for.
    pub fn get_or_create<B: Backend>(
        &mut self,
        engine: &mut Engine<B>,
        variable: &Variable,
        slot: &str,
        init: f64,
    ) -> Result<Variable> {
        let name = format!("{}/{slot}", variable.name());
        if let Some(v) = self.get(&name) {
            return Ok(v.clone());
        }
        let shape = variable.shape().clone();
        let dtype = variable.dtype();
        let state = engine.tidy(|e| {
            let initial = e.fill(shape, init, dtype)?;
            e.variable(&initial, false, None)
        })?;
        debug!(state = %name, "optimizer state created");
        self.slots.push((name, state.clone()));
        Ok(state)
    }

    /// The state variables as named tensors, in creation order.
    pub fn weights(&self) -> Vec<NamedTensor> {
        self.slots
            .iter()
            .map(|(name, v)| NamedTensor::new(name.clone(), v.tensor().clone()))
            .collect()
    }

    /// Replace all state with variables holding the given values.
    /// The new variables are made before the old ones are released, so the
    /// weights may come from this optimizer's own `get_weights`.
    pub fn restore<B: Backend>(&mut self, engine: &mut Engine<B>, weights: &[NamedTensor]) -> Result<()> {
        let mut slots = Vec::with_capacity(weights.len());
        for w in weights {
            let v = engine.variable(&w.tensor, false, None)?;
            slots.push((w.name.clone(), v));
        }
        self.dispose(engine)?;
        self.slots = slots;
        Ok(())
    }

    pub fn dispose<B: Backend>(&mut self, engine: &mut Engine<B>) -> Result<()> {
        for (_, v) in self.slots.drain(..) {
            if !engine.is_disposed(v.tensor()) {
                engine.dispose_variable(&v)?;
            }
        }
        Ok(())
    }
}
