use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::Result;
use crate::gradient::{GradientDescriptor, Slot};
use crate::kernel::Kernel;
use crate::tensor::{Tensor, TensorId};

// Tape: the record of kernels executed while gradients are being taken
//
// While `Engine::gradients` (or `variable_grads`) runs the user's function,
// every kernel appends one TapeRecord:
//
//   record 0: Multiply  inputs {a: #1, b: #2}  outputs [#3]  saved [#7, #8]
//   record 1: Sum       inputs {x: #3}         outputs [#4]  saved []
//
// The backward walk does not visit the whole tape. `filter_tape` keeps only
// records that both depend on a watched tensor x and lead to the loss y,
// and drops input slots that are not functions of x (their gradients are
// never requested, so their thunks never run).
//
//   forward pass: mark every tensor reachable from xs
//   reverse pass: mark every tensor the loss depends on
//   keep records marked by both, with inputs pruned to the x-reachable ones
//
// Saved tensors are kept clones that share the forward buffers. They belong
// to the tape, not to any scope, and are released when the outermost
// gradient computation finishes.

/// Caller-supplied backward for a `custom_grad` record: receives dy and the
/// saved tensors (inputs, then the output) and returns one gradient per input.
pub type CustomGradFn<B> = dyn Fn(&mut Engine<B>, &Tensor, &[Tensor]) -> Result<Vec<Tensor>>;

/// One kernel execution recorded for differentiation.
pub struct TapeRecord<B: Backend> {
    pub id: usize,
    pub kernel: Kernel,
    pub inputs: Vec<(Slot, Tensor)>,
    pub outputs: Vec<Tensor>,
    pub saved: Vec<Tensor>,
    /// Registry descriptor found when the record was made, if any.
    pub(crate) descriptor: Option<Arc<GradientDescriptor<B>>>,
    /// Set by `custom_grad`; takes precedence over the descriptor.
    pub(crate) gradient_override: Option<Arc<CustomGradFn<B>>>,
}

impl<B: Backend> fmt::Debug for TapeRecord<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeRecord")
            .field("id", &self.id)
            .field("kernel", &self.kernel.id())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("saved", &self.saved.len())
            .finish()
    }
}

/// The ordered list of records made during the current gradient computation.
pub struct Tape<B: Backend> {
    records: Vec<TapeRecord<B>>,
    next_id: usize,
}

impl<B: Backend> Default for Tape<B> {
    fn default() -> Self {
        Tape {
            records: Vec::new(),
            next_id: 0,
        }
    }
}

impl<B: Backend> Tape<B> {
    pub fn records(&self) -> &[TapeRecord<B>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        kernel: Kernel,
        inputs: Vec<(Slot, Tensor)>,
        outputs: Vec<Tensor>,
        saved: Vec<Tensor>,
        descriptor: Option<Arc<GradientDescriptor<B>>>,
        gradient_override: Option<Arc<CustomGradFn<B>>>,
    ) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push(TapeRecord {
            id,
            kernel,
            inputs,
            outputs,
            saved,
            descriptor,
            gradient_override,
        });
        id
    }

    /// Empty the tape, returning the saved tensors for the caller to release.
    pub(crate) fn drain_saved(&mut self) -> Vec<Tensor> {
        self.next_id = 0;
        self.records
            .drain(..)
            .flat_map(|record| record.saved)
            .collect()
    }
}

/// A record that lies on a path from a watched tensor to the loss.
#[derive(Debug, Clone)]
pub struct FilteredRecord {
    /// Position of the record on the tape.
    pub index: usize,
    /// The record's inputs that are functions of a watched tensor.
    pub inputs: Vec<(Slot, Tensor)>,
}

/// Select the records between `xs` and `y`, in tape order.
pub fn filter_tape<B: Backend>(
    records: &[TapeRecord<B>],
    xs: &[TensorId],
    y: TensorId,
) -> Vec<FilteredRecord> {
    // Forward: tensors (and records) reachable from any x.
    let mut from_x: HashSet<TensorId> = xs.iter().copied().collect();
    let mut record_from_x = vec![false; records.len()];
    for (i, record) in records.iter().enumerate() {
        if record.inputs.iter().any(|(_, t)| from_x.contains(&t.id())) {
            from_x.extend(record.outputs.iter().map(|t| t.id()));
            record_from_x[i] = true;
        }
    }

    // Reverse: tensors (and records) the loss depends on.
    let mut leads_to_y: HashSet<TensorId> = HashSet::from([y]);
    let mut record_to_y = vec![false; records.len()];
    for (i, record) in records.iter().enumerate().rev() {
        if record.outputs.iter().any(|t| leads_to_y.contains(&t.id())) {
            leads_to_y.extend(record.inputs.iter().map(|(_, t)| t.id()));
            record_to_y[i] = true;
        }
    }

    records
        .iter()
        .enumerate()
        .filter(|(i, _)| record_from_x[*i] && record_to_y[*i])
        .map(|(index, record)| FilteredRecord {
            index,
            inputs: record
                .inputs
                .iter()
                .filter(|(_, t)| from_x.contains(&t.id()))
                .cloned()
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BinaryOp, UnaryOp};
    use crate::testing::{handle, NullBackend};

    fn push(
        tape: &mut Tape<NullBackend>,
        kernel: Kernel,
        inputs: &[(&'static str, u64)],
        output: u64,
    ) {
        tape.push(
            kernel,
            inputs
                .iter()
                .map(|(slot, id)| (Slot::Borrowed(*slot), handle(*id, &[2])))
                .collect(),
            vec![handle(output, &[2])],
            Vec::new(),
            None,
            None,
        );
    }

    // x=#0, w=#1, c=#2 (constant)
    //   #3 = x * w
    //   #4 = #3 + c
    //   #5 = exp(c)        (not from x)
    //   #6 = neg(#3)       (does not lead to y)
    //   y = #7 = sum(#4)
    fn sample_tape() -> Tape<NullBackend> {
        let mut tape = Tape::default();
        push(&mut tape, Kernel::Binary(BinaryOp::Mul), &[("a", 0), ("b", 1)], 3);
        push(&mut tape, Kernel::Binary(BinaryOp::Add), &[("a", 3), ("b", 2)], 4);
        push(&mut tape, Kernel::Unary(UnaryOp::Exp), &[("x", 2)], 5);
        push(&mut tape, Kernel::Unary(UnaryOp::Neg), &[("x", 3)], 6);
        push(
            &mut tape,
            Kernel::Sum {
                axes: vec![],
                keep_dims: false,
            },
            &[("x", 4)],
            7,
        );
        tape
    }

    #[test]
    fn test_filter_keeps_only_x_to_y_path() {
        let tape = sample_tape();
        let filtered = filter_tape(tape.records(), &[TensorId(0)], TensorId(7));
        let indices: Vec<usize> = filtered.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 4]);
    }

    #[test]
    fn test_filter_prunes_constant_inputs() {
        let tape = sample_tape();
        let filtered = filter_tape(tape.records(), &[TensorId(0)], TensorId(7));
        // Mul keeps only "a" (x); "b" (w) is not watched.
        let slots: Vec<&str> = filtered[0].inputs.iter().map(|(s, _)| s.as_ref()).collect();
        assert_eq!(slots, vec!["a"]);
        // Add keeps "a" (#3, from x) and drops the constant "b".
        let slots: Vec<&str> = filtered[1].inputs.iter().map(|(s, _)| s.as_ref()).collect();
        assert_eq!(slots, vec!["a"]);
    }

    #[test]
    fn test_filter_unconnected_x_is_empty() {
        let tape = sample_tape();
        let filtered = filter_tape(tape.records(), &[TensorId(42)], TensorId(7));
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_drain_saved_resets_tape() {
        let mut tape = sample_tape();
        tape.push(
            Kernel::Identity,
            vec![(Slot::Borrowed("x"), handle(7, &[]))],
            vec![handle(8, &[])],
            vec![handle(9, &[]), handle(10, &[])],
            None,
            None,
        );
        let saved = tape.drain_saved();
        assert_eq!(saved.len(), 2);
        assert!(tape.is_empty());
    }
}
