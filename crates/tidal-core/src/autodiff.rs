use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, debug_span, warn};

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gradient::{thunk, BackwardArgs, GradientMap, Slot};
use crate::kernel::{Kernel, KernelId};
use crate::shape::Shape;
use crate::tape::{filter_tape, CustomGradFn, FilteredRecord};
use crate::tensor::{Tensor, TensorContainer, TensorId};
use crate::variable::Variable;

// Reverse-mode differentiation over the tape
//
// gradients(f, xs):
//
//   1. forward   run f with recording on (gradient_depth > 0); every kernel
//                appends a TapeRecord with its saved tensors
//   2. filter    keep only records on a path from some x to y
//   3. backward  seed dy = ones(y), then walk the filtered records in strict
//                reverse order:
//                  dys   = accumulated grads of the record's outputs
//                          (zeros for outputs that never received one)
//                  thunks = descriptor.backward(dys, saved)
//                  for each pruned input: dx = tidy(thunk), checked and
//                  reduced to the input's shape, then accumulated with add
//   4. cleanup   everything the walk created except the returned gradients
//                is released by the "backward" scope; saved tensors are
//                released once the outermost gradient call finishes
//
// NESTING: calling gradients inside another gradients' f shares the tape.
// The inner call only sees the records on its own x → y path, and the
// saved tensors survive until the outer call is done with them.

/// Result of `Engine::gradients`.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// The value of f.
    pub value: Tensor,
    /// dvalue/dx for each x, in the order given.
    pub grads: Vec<Tensor>,
}

impl TensorContainer for Gradients {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.value);
        self.grads.visit_tensors(f);
    }
}

/// Result of `Engine::variable_grads`.
#[derive(Debug, Clone)]
pub struct VariableGrads {
    /// The value of f.
    pub value: Tensor,
    /// Variable name → gradient. `None` for variables that are not trainable
    /// or that the loss does not depend on.
    pub grads: BTreeMap<String, Option<Tensor>>,
}

impl TensorContainer for VariableGrads {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.value);
        self.grads.visit_tensors(f);
    }
}

impl<B: Backend> Engine<B> {
    /// Whether kernels executed now are recorded on the tape.
    pub fn is_recording(&self) -> bool {
        self.gradient_depth > 0 && self.kernel_depth == 0
    }

    /// Append a record for a kernel that just ran, saving what its
    /// gradient descriptor asks for.
    pub(crate) fn record_kernel(
        &mut self,
        kernel: &Kernel,
        inputs: &[(&'static str, &Tensor)],
        outputs: &[Tensor],
    ) -> Result<()> {
        let descriptor = self.registry().get(&kernel.id());
        let mut saved = Vec::new();
        if let Some(desc) = &descriptor {
            for slot in &desc.inputs_to_save {
                let (_, t) = inputs.iter().find(|(s, _)| s == slot).ok_or_else(|| {
                    Error::msg(format!(
                        "gradient of '{}' saves input '{slot}', but the kernel has no such input",
                        kernel.id()
                    ))
                })?;
                saved.push(self.share_untracked(t)?);
            }
            for (out, keep) in outputs.iter().zip(&desc.outputs_to_save) {
                if *keep {
                    saved.push(self.share_untracked(out)?);
                }
            }
        }
        let inputs = inputs
            .iter()
            .map(|(slot, t)| (Cow::Borrowed(*slot), (*t).clone()))
            .collect();
        self.tape
            .push(kernel.clone(), inputs, outputs.to_vec(), saved, descriptor, None);
        Ok(())
    }

    /// Compute `f()` and its gradient with respect to each of `xs`.
    ///
    /// `f` must return a scalar (`NonScalarLoss` otherwise). Every x must be
    /// reachable from the value through recorded kernels, or the call fails
    /// with `MissingGradient`. The value and the gradients end up in the
    /// caller's scope; everything else created here is released.
    pub fn gradients<F>(&mut self, f: F, xs: &[&Tensor]) -> Result<Gradients>
    where
        F: FnOnce(&mut Self) -> Result<Tensor>,
    {
        if xs.is_empty() {
            return Err(Error::msg("gradients() received an empty list of xs"));
        }
        let ids: Vec<TensorId> = xs.iter().map(|x| x.id).collect();
        let result = self.tidy_named("gradients", |engine| {
            let (value, grads) = engine.value_and_grads(f, &ids)?;
            let grads = grads
                .into_iter()
                .zip(&ids)
                .map(|(g, id)| g.ok_or(Error::MissingGradient { id: *id }))
                .collect::<Result<Vec<_>>>()?;
            Ok(Gradients { value, grads })
        });
        self.release_tape_if_idle()?;
        result
    }

    /// Compute `f()` and its gradient with respect to variables.
    ///
    /// With `Some(list)`, every trainable variable in the list must receive
    /// a gradient (`MissingGradient` otherwise); non-trainable ones map to
    /// `None`. With `None`, all registered trainable variables are watched,
    /// and the ones the loss does not touch map to `None`; it is an error
    /// only when none of them is reached.
    pub fn variable_grads<F>(&mut self, f: F, var_list: Option<&[Variable]>) -> Result<VariableGrads>
    where
        F: FnOnce(&mut Self) -> Result<Tensor>,
    {
        let strict = var_list.is_some();
        let vars: Vec<Variable> = match var_list {
            Some(list) => list.to_vec(),
            None => self.trainable_variables(),
        };
        for v in &vars {
            self.entry(v.id())?;
        }
        let watched: Vec<&Variable> = vars.iter().filter(|v| v.trainable).collect();
        if watched.is_empty() {
            return Err(Error::msg(format!(
                "variable_grads() expects at least one trainable variable, \
                 but none of the {} variables is trainable",
                vars.len()
            )));
        }
        let ids: Vec<TensorId> = watched.iter().map(|v| v.id()).collect();

        let result = self.tidy_named("variable_grads", |engine| {
            let (value, grads) = engine.value_and_grads(f, &ids)?;
            if strict {
                if let Some(pos) = grads.iter().position(|g| g.is_none()) {
                    return Err(Error::MissingGradient { id: ids[pos] });
                }
            } else if grads.iter().all(|g| g.is_none()) {
                return Err(Error::MissingGradient { id: ids[0] });
            }
            let mut by_id: HashMap<TensorId, Option<Tensor>> = ids.iter().copied().zip(grads).collect();
            let grads = vars
                .iter()
                .map(|v| (v.name.clone(), by_id.remove(&v.id()).flatten()))
                .collect();
            Ok(VariableGrads { value, grads })
        });
        self.release_tape_if_idle()?;
        result
    }

    /// Run `forward` as a single differentiable step whose gradient is
    /// given by `backward` instead of the registry.
    ///
    /// Kernels inside `forward` are not recorded. `backward` receives the
    /// upstream gradient and the saved tensors (the inputs followed by the
    /// output) and must return one gradient per input.
    pub fn custom_grad<F, G>(&mut self, inputs: &[&Tensor], forward: F, backward: G) -> Result<Tensor>
    where
        F: FnOnce(&mut Self, &[Tensor]) -> Result<Tensor>,
        G: Fn(&mut Self, &Tensor, &[Tensor]) -> Result<Vec<Tensor>> + 'static,
    {
        for t in inputs {
            self.entry(t.id)?;
        }
        let owned: Vec<Tensor> = inputs.iter().map(|t| (*t).clone()).collect();
        self.kernel_depth += 1;
        let out = forward(self, &owned);
        self.kernel_depth -= 1;
        let out = out?;

        if self.is_recording() {
            let mut saved = Vec::with_capacity(owned.len() + 1);
            for t in owned.iter().chain(std::iter::once(&out)) {
                saved.push(self.share_untracked(t)?);
            }
            let slots = owned
                .into_iter()
                .enumerate()
                .map(|(i, t)| (Cow::Owned(format!("x{i}")), t))
                .collect();
            let backward: Arc<CustomGradFn<B>> = Arc::new(backward);
            self.tape.push(
                Kernel::custom(KernelId::CUSTOM_GRADIENT),
                slots,
                vec![out.clone()],
                saved,
                None,
                Some(backward),
            );
        }
        Ok(out)
    }

    /// Sum `grad` over its broadcast axes so it has shape `target`.
    pub fn reduce_to_shape(&mut self, grad: &Tensor, target: &Shape) -> Result<Tensor> {
        if grad.shape() == target {
            return Ok(grad.clone());
        }
        let axes = Shape::reduction_axes(target, grad.shape());
        let summed = if axes.is_empty() {
            grad.clone()
        } else {
            self.sum(grad, &axes, false)?
        };
        if summed.shape() == target {
            return Ok(summed);
        }
        self.reshape(&summed, target.clone())
    }

    // Forward with recording, then the backward walk. Runs inside the
    // caller's tidy.
    fn value_and_grads<F>(&mut self, f: F, xs: &[TensorId]) -> Result<(Tensor, Vec<Option<Tensor>>)>
    where
        F: FnOnce(&mut Self) -> Result<Tensor>,
    {
        self.gradient_depth += 1;
        let y = self.tidy_named("forward", f);
        self.gradient_depth -= 1;
        let y = y?;
        self.entry(y.id)?;
        if !y.is_scalar() {
            warn!(shape = %y.shape(), "loss is not a scalar");
            return Err(Error::NonScalarLoss {
                shape: y.shape().clone(),
            });
        }

        let filtered = filter_tape(self.tape.records(), xs, y.id);
        let grads = self.tidy_named("backward", |engine| engine.backpropagate(&y, xs, &filtered))?;
        Ok((y, grads))
    }

    fn backpropagate(
        &mut self,
        y: &Tensor,
        xs: &[TensorId],
        filtered: &[FilteredRecord],
    ) -> Result<Vec<Option<Tensor>>> {
        let span = debug_span!("backward", records = filtered.len(), watched = xs.len());
        let _enter = span.enter();

        let mut accumulated: HashMap<TensorId, Tensor> = HashMap::new();
        let seed = self.ones_like(y)?;
        accumulated.insert(y.id, seed);

        for record in filtered.iter().rev() {
            let (kernel, all_inputs, outputs, saved, descriptor, custom) = {
                let r = &self.tape.records()[record.index];
                (
                    r.kernel.clone(),
                    r.inputs.clone(),
                    r.outputs.clone(),
                    r.saved.clone(),
                    r.descriptor.clone(),
                    r.gradient_override.clone(),
                )
            };

            let mut dys = Vec::with_capacity(outputs.len());
            for out in &outputs {
                match accumulated.get(&out.id) {
                    Some(dy) => dys.push(dy.clone()),
                    None => dys.push(self.zeros_like(out)?),
                }
            }

            let mut thunks: GradientMap<B> = match custom {
                Some(custom) => {
                    let dy = dys.first().ok_or_else(|| Error::msg("custom gradient without output"))?;
                    let grads = custom(self, dy, &saved)?;
                    if grads.len() != all_inputs.len() {
                        return Err(Error::msg(format!(
                            "custom gradient returned {} gradients for {} inputs",
                            grads.len(),
                            all_inputs.len()
                        )));
                    }
                    all_inputs
                        .iter()
                        .zip(grads)
                        .map(|((slot, _), g)| (slot.clone(), thunk(move |_: &mut Engine<B>| Ok(g))))
                        .collect()
                }
                None => {
                    let descriptor = descriptor.ok_or_else(|| Error::UnregisteredGradient { kernel: kernel.id() })?;
                    let args = BackwardArgs {
                        kernel: &kernel,
                        inputs: &all_inputs,
                        dys: &dys,
                        saved: &saved,
                    };
                    descriptor.backward.backward(&args)?
                }
            };

            for (slot, x) in &record.inputs {
                let grad_fn = thunks.remove(slot).ok_or_else(|| Error::MissingInputGradient {
                    kernel: kernel.id(),
                    input: slot.to_string(),
                })?;
                let dx = self.tidy(grad_fn)?;
                let dx = self.check_input_gradient(&kernel, slot, x, dx)?;
                let dx = self.own_gradient(&accumulated, &dys, dx)?;
                self.accumulate(&mut accumulated, x.id, dx)?;
            }
        }

        Ok(xs.iter().map(|id| accumulated.get(id).cloned()).collect())
    }

    // Gradients must be float and match the input's shape; a gradient in
    // the broadcast shape is summed down first.
    fn check_input_gradient(&mut self, kernel: &Kernel, slot: &Slot, x: &Tensor, dx: Tensor) -> Result<Tensor> {
        if !dx.dtype().is_float() {
            return Err(Error::GradientDType {
                kernel: kernel.id(),
                input: slot.to_string(),
                dtype: dx.dtype(),
            });
        }
        if dx.shape() == x.shape() {
            return Ok(dx);
        }
        let broadcastable = Shape::broadcast_shape(x.shape(), dx.shape())
            .map(|s| &s == dx.shape())
            .unwrap_or(false);
        if !broadcastable {
            return Err(Error::GradientShapeMismatch {
                kernel: kernel.id(),
                input: slot.to_string(),
                expected: x.shape().clone(),
                got: dx.shape().clone(),
            });
        }
        self.reduce_to_shape(&dx, x.shape())
    }

    // Every accumulated gradient is a distinct tensor registered in the
    // backward scope. A rule that passes dy through, or hands back a saved
    // or caller-owned tensor, gets a copy instead.
    fn own_gradient(
        &mut self,
        accumulated: &HashMap<TensorId, Tensor>,
        dys: &[Tensor],
        dx: Tensor,
    ) -> Result<Tensor> {
        let entry = self.entry(dx.id)?;
        let foreign = entry.kept || entry.scope != self.current_scope();
        let shared = dys.iter().chain(accumulated.values()).any(|t| t.id == dx.id);
        if foreign || shared {
            return self.identity(&dx);
        }
        Ok(dx)
    }

    fn accumulate(&mut self, accumulated: &mut HashMap<TensorId, Tensor>, id: TensorId, dx: Tensor) -> Result<()> {
        let Some(current) = accumulated.remove(&id) else {
            accumulated.insert(id, dx);
            return Ok(());
        };
        let sum = self.add(&current, &dx)?;
        accumulated.insert(id, sum);
        self.release_tensor(current.id)
    }

    // Saved tensors outlive nested gradient calls; drop them once no
    // gradient computation is running.
    fn release_tape_if_idle(&mut self) -> Result<()> {
        if self.gradient_depth > 0 {
            return Ok(());
        }
        let saved = self.tape.drain_saved();
        if !saved.is_empty() {
            debug!(saved = saved.len(), "releasing tape");
        }
        for t in saved {
            if !self.is_disposed(&t) {
                self.release_tensor(t.id)?;
            }
        }
        Ok(())
    }
}
