// Test doubles for unit tests that need a `Backend` type but never run a
// kernel (registry, tape filtering).

use crate::backend::{Backend, BackendStorage, KernelInput, KernelOutput};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorId};

#[derive(Debug)]
pub(crate) struct NullStorage;

impl BackendStorage for NullStorage {
    fn dtype(&self) -> DType {
        DType::F32
    }

    fn len(&self) -> usize {
        0
    }
}

#[derive(Debug, Default)]
pub(crate) struct NullBackend;

impl Backend for NullBackend {
    type Storage = NullStorage;

    fn name(&self) -> &str {
        "null"
    }

    fn execute(
        &mut self,
        kernel: &Kernel,
        _inputs: &[KernelInput<'_, NullStorage>],
    ) -> Result<Vec<KernelOutput<NullStorage>>> {
        Err(Error::KernelNotFound {
            kernel: kernel.id(),
            backend: self.name().to_string(),
        })
    }

    fn from_f64_slice(&mut self, _data: &[f64], _dtype: DType) -> Result<NullStorage> {
        Ok(NullStorage)
    }

    fn fill(&mut self, _shape: &Shape, _value: f64, _dtype: DType) -> Result<NullStorage> {
        Ok(NullStorage)
    }

    fn random_uniform(
        &mut self,
        _shape: &Shape,
        _low: f64,
        _high: f64,
        _dtype: DType,
    ) -> Result<NullStorage> {
        Ok(NullStorage)
    }

    fn random_normal(
        &mut self,
        _shape: &Shape,
        _mean: f64,
        _std_dev: f64,
        _dtype: DType,
    ) -> Result<NullStorage> {
        Ok(NullStorage)
    }

    fn to_f64_vec(&self, _storage: &NullStorage) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

/// A bare handle with the given id, for tests that only inspect metadata.
pub(crate) fn handle(id: u64, dims: &[usize]) -> Tensor {
    Tensor::new(TensorId(id), Shape::from(dims), DType::F32)
}
