use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::shape::Shape;

// Backend: the kernel-execution boundary
//
// The engine owns all bookkeeping (ids, scopes, the tape, ref counts) and
// never looks inside a buffer. A backend owns the buffers and the math:
//
//   engine ──execute(kernel, inputs)──▶ backend ──▶ [KernelOutput]
//
// Buffers are opaque `Storage` values handed back to the engine, which
// stores them by DataId and gives them back through `release` when the last
// tensor referencing them is disposed.
//
// A backend that does not implement a kernel (built-in or custom) returns
// `Error::KernelNotFound`; the engine never falls back to another backend.

/// A buffer that holds tensor data on a specific device.
pub trait BackendStorage: fmt::Debug + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Number of elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by this buffer, as reported by `Engine::memory`.
    fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }
}

/// One input of a kernel invocation.
#[derive(Debug)]
pub struct KernelInput<'a, S> {
    pub storage: &'a S,
    pub shape: &'a Shape,
    pub dtype: DType,
}

/// One output of a kernel invocation. The engine wraps it in a new tensor.
#[derive(Debug)]
pub struct KernelOutput<S> {
    pub storage: S,
    pub shape: Shape,
    pub dtype: DType,
}

impl<S: BackendStorage> KernelOutput<S> {
    pub fn new(storage: S, shape: Shape) -> Self {
        let dtype = storage.dtype();
        KernelOutput {
            storage,
            shape,
            dtype,
        }
    }
}

/// A compute backend. Implementing this for a struct (e.g. `CpuBackend`)
/// makes it usable as `Engine<CpuBackend>`.
///
/// Kernels never mutate their inputs; every call returns fresh storage.
pub trait Backend: fmt::Debug + 'static {
    /// The storage type for this backend.
    type Storage: BackendStorage;

    /// Name used in error messages and logs (e.g. "cpu").
    fn name(&self) -> &str;

    /// Run a kernel. Broadcasting, reductions and custom kernels all go
    /// through here.
    fn execute(
        &mut self,
        kernel: &Kernel,
        inputs: &[KernelInput<'_, Self::Storage>],
    ) -> Result<Vec<KernelOutput<Self::Storage>>>;

    //  Creation

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(&mut self, data: &[f64], dtype: DType) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn fill(&mut self, shape: &Shape, value: f64, dtype: DType) -> Result<Self::Storage>;

    /// Storage with values drawn uniformly from `[low, high)`.
    fn random_uniform(
        &mut self,
        shape: &Shape,
        low: f64,
        high: f64,
        dtype: DType,
    ) -> Result<Self::Storage>;

    /// Storage with values drawn from a normal distribution.
    fn random_normal(
        &mut self,
        shape: &Shape,
        mean: f64,
        std_dev: f64,
        dtype: DType,
    ) -> Result<Self::Storage>;

    //  Readback and release

    /// Copy the buffer out as f64 values, in row-major order.
    fn to_f64_vec(&self, storage: &Self::Storage) -> Result<Vec<f64>>;

    /// Called when the last tensor referencing a buffer is disposed.
    fn release(&mut self, storage: Self::Storage) {
        drop(storage);
    }
}
