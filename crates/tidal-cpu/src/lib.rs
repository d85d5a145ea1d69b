// CPU Backend: reference kernel execution on host memory
//
// Implements the tidal Backend trait with plain Rust loops. It exists so the
// engine can be exercised end to end; it makes no attempt at speed.
//
// ARCHITECTURE:
// - CpuStorage is an enum over Vec<T> for each supported dtype
// - Element-wise math and reductions run on f64 and are converted back to
//   the output dtype
// - Binary kernels require both operands to have the same dtype
// - Kernels the backend does not know (Kernel::Custom) are looked up in a
//   table of plugin kernels registered by id; missing ones fail with
//   Error::KernelNotFound
// - Random numbers come from a per-backend StdRng, seedable for tests
//
// USAGE:
//   let mut engine = Engine::new(CpuBackend::new());
//   let x = engine.tensor(&[1.0, 2.0, 3.0], 3)?;

mod kernels;
mod storage;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand::distributions::Uniform;
use rand_distr::Normal;
use tracing::debug;

use tidal_core::backend::{Backend, BackendStorage, KernelInput, KernelOutput};
use tidal_core::dtype::DType;
use tidal_core::error::{Error, Result};
use tidal_core::kernel::{Attrs, Kernel, KernelId};
use tidal_core::shape::Shape;

pub use storage::CpuStorage;

/// A plugin kernel: receives the inputs and the kernel's attributes.
pub type CpuKernelFn =
    dyn Fn(&[KernelInput<'_, CpuStorage>], &Attrs) -> Result<Vec<KernelOutput<CpuStorage>>>;

/// The reference CPU backend.
pub struct CpuBackend {
    rng: StdRng,
    kernels: HashMap<KernelId, Arc<CpuKernelFn>>,
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.kernels.keys().map(|k| k.as_str()).collect();
        ids.sort_unstable();
        f.debug_struct("CpuBackend").field("kernels", &ids).finish()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend {
            rng: StdRng::from_entropy(),
            kernels: HashMap::new(),
        }
    }

    /// A backend whose random kernels are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        CpuBackend {
            rng: StdRng::seed_from_u64(seed),
            kernels: HashMap::new(),
        }
    }

    /// Builder form of `register_kernel`.
    pub fn with_kernel<F>(mut self, id: impl Into<KernelId>, f: F) -> Self
    where
        F: Fn(&[KernelInput<'_, CpuStorage>], &Attrs) -> Result<Vec<KernelOutput<CpuStorage>>>
            + 'static,
    {
        self.register_kernel(id, f);
        self
    }

    /// Register (or replace) a plugin kernel, run for `Kernel::Custom` with
    /// this id.
    pub fn register_kernel<F>(&mut self, id: impl Into<KernelId>, f: F)
    where
        F: Fn(&[KernelInput<'_, CpuStorage>], &Attrs) -> Result<Vec<KernelOutput<CpuStorage>>>
            + 'static,
    {
        let id = id.into();
        debug!(kernel = %id, "cpu kernel registered");
        self.kernels.insert(id, Arc::new(f));
    }

    pub fn has_kernel(&self, id: &KernelId) -> bool {
        self.kernels.contains_key(id)
    }
}

fn arity_error(kernel: &Kernel, expected: usize, got: usize) -> Error {
    Error::msg(format!(
        "kernel '{}' expects {expected} inputs, got {got}",
        kernel.id()
    ))
}

fn one_input<'a, 'b>(
    kernel: &Kernel,
    inputs: &'a [KernelInput<'b, CpuStorage>],
) -> Result<&'a KernelInput<'b, CpuStorage>> {
    match inputs {
        [x] => Ok(x),
        _ => Err(arity_error(kernel, 1, inputs.len())),
    }
}

fn two_inputs<'a, 'b>(
    kernel: &Kernel,
    inputs: &'a [KernelInput<'b, CpuStorage>],
) -> Result<(&'a KernelInput<'b, CpuStorage>, &'a KernelInput<'b, CpuStorage>)> {
    match inputs {
        [a, b] => Ok((a, b)),
        _ => Err(arity_error(kernel, 2, inputs.len())),
    }
}

fn output(values: &[f64], shape: Shape, dtype: DType) -> KernelOutput<CpuStorage> {
    KernelOutput::new(CpuStorage::from_f64(values, dtype), shape)
}

impl Backend for CpuBackend {
    type Storage = CpuStorage;

    fn name(&self) -> &str {
        "cpu"
    }

    fn execute(
        &mut self,
        kernel: &Kernel,
        inputs: &[KernelInput<'_, CpuStorage>],
    ) -> Result<Vec<KernelOutput<CpuStorage>>> {
        let out = match kernel {
            Kernel::Binary(op) => {
                let (a, b) = two_inputs(kernel, inputs)?;
                if a.dtype != b.dtype {
                    return Err(Error::DTypeMismatch {
                        expected: a.dtype,
                        got: b.dtype,
                    });
                }
                let shape = Shape::broadcast_shape(a.shape, b.shape)?;
                let values = kernels::binary(
                    *op,
                    &a.storage.to_f64_vec(),
                    a.shape,
                    &b.storage.to_f64_vec(),
                    b.shape,
                    &shape,
                );
                output(&values, shape, a.dtype)
            }
            Kernel::Unary(op) => {
                let x = one_input(kernel, inputs)?;
                let values = kernels::unary(*op, &x.storage.to_f64_vec());
                output(&values, x.shape.clone(), op.output_dtype(x.dtype))
            }
            Kernel::Sum { axes, keep_dims } | Kernel::Mean { axes, keep_dims } => {
                let x = one_input(kernel, inputs)?;
                let axes = x.shape.normalize_axes(axes)?;
                let mean = matches!(kernel, Kernel::Mean { .. });
                let values = kernels::reduce(&x.storage.to_f64_vec(), x.shape, &axes, mean);
                output(&values, x.shape.reduce_shape(&axes, *keep_dims), x.dtype)
            }
            Kernel::Reshape { shape } => {
                let x = one_input(kernel, inputs)?;
                if shape.elem_count() != x.storage.len() {
                    return Err(Error::ElementCountMismatch {
                        shape: shape.clone(),
                        expected: shape.elem_count(),
                        got: x.storage.len(),
                    });
                }
                KernelOutput::new(x.storage.clone(), shape.clone())
            }
            Kernel::BroadcastTo { shape } => {
                let x = one_input(kernel, inputs)?;
                if &Shape::broadcast_shape(x.shape, shape)? != shape {
                    return Err(Error::ShapeMismatch {
                        lhs: x.shape.clone(),
                        rhs: shape.clone(),
                    });
                }
                let values = kernels::broadcast_to(&x.storage.to_f64_vec(), x.shape, shape);
                output(&values, shape.clone(), x.dtype)
            }
            Kernel::Cast { dtype } => {
                let x = one_input(kernel, inputs)?;
                output(&x.storage.to_f64_vec(), x.shape.clone(), *dtype)
            }
            Kernel::Identity => {
                let x = one_input(kernel, inputs)?;
                KernelOutput::new(x.storage.clone(), x.shape.clone())
            }
            Kernel::Custom { id, attrs } => {
                let f = self.kernels.get(id).cloned().ok_or_else(|| Error::KernelNotFound {
                    kernel: id.clone(),
                    backend: self.name().to_string(),
                })?;
                return f(inputs, attrs);
            }
        };
        Ok(vec![out])
    }

    fn from_f64_slice(&mut self, data: &[f64], dtype: DType) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn fill(&mut self, shape: &Shape, value: f64, dtype: DType) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(&vec![value; shape.elem_count()], dtype))
    }

    fn random_uniform(
        &mut self,
        shape: &Shape,
        low: f64,
        high: f64,
        dtype: DType,
    ) -> Result<CpuStorage> {
        if low.is_nan() || high.is_nan() || low >= high || !(high - low).is_finite() {
            return Err(Error::msg(format!(
                "random_uniform needs finite bounds with low < high, got [{low}, {high})"
            )));
        }
        let dist = Uniform::new(low, high);
        let values: Vec<f64> = (0..shape.elem_count())
            .map(|_| self.rng.sample(&dist))
            .collect();
        Ok(CpuStorage::from_f64(&values, dtype))
    }

    fn random_normal(
        &mut self,
        shape: &Shape,
        mean: f64,
        std_dev: f64,
        dtype: DType,
    ) -> Result<CpuStorage> {
        let dist = Normal::new(mean, std_dev)
            .map_err(|e| Error::msg(format!("random_normal: {e}")))?;
        let values: Vec<f64> = (0..shape.elem_count())
            .map(|_| self.rng.sample(&dist))
            .collect();
        Ok(CpuStorage::from_f64(&values, dtype))
    }

    fn to_f64_vec(&self, storage: &CpuStorage) -> Result<Vec<f64>> {
        Ok(storage.to_f64_vec())
    }
}
