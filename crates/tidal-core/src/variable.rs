use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorContainer, TensorId};

/// A named, mutable tensor registered with the engine.
///
/// Variables are never tracked by a scope; they live until disposed through
/// `Engine::dispose_variable` (or `dispose` on their tensor). `Engine::assign`
/// swaps the buffer behind the variable while keeping its id and name, so a
/// `Variable` handle stays valid across updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) tensor: Tensor,
    pub(crate) trainable: bool,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tensor handle that reads this variable's current value.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn id(&self) -> TensorId {
        self.tensor.id
    }

    pub fn shape(&self) -> &Shape {
        &self.tensor.shape
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype
    }

    /// Whether optimizers update this variable.
    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

impl AsRef<Tensor> for Variable {
    fn as_ref(&self) -> &Tensor {
        &self.tensor
    }
}

impl TensorContainer for Variable {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.tensor)
    }
}

/// A tensor paired with a name, as used by optimizer weight export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Tensor,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        NamedTensor {
            name: name.into(),
            tensor,
        }
    }
}

impl TensorContainer for NamedTensor {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.tensor)
    }
}
