use crate::kernel::KernelId;
use crate::shape::Shape;
use crate::tensor::TensorId;

/// All errors that can occur within tidal.
///
/// One enum covers the whole runtime: broadcasting, lifecycle, autodiff and
/// the backend boundary. Every variant is raised synchronously where it is
/// detected; the scope stack still unwinds before it reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes are incompatible: they cannot be broadcast together
    /// (e.g. [2,3] against [4,5]), or a value does not fit a variable.
    #[error("shape mismatch: incompatible shapes {lhs} and {rhs}")]
    ShapeMismatch { lhs: Shape, rhs: Shape },

    /// DType mismatch, e.g. assigning an f64 value into an f32 variable.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Axis index out of range (or repeated) for the tensor's rank.
    #[error("axis {axis} is out of range or repeated for a tensor of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Element count mismatch when creating from a slice or reshaping.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// A kernel on the tape has no registered backward descriptor.
    #[error("cannot compute gradient: gradient function not found for kernel '{kernel}'")]
    UnregisteredGradient { kernel: KernelId },

    /// The function being differentiated returned a non-scalar.
    #[error("the loss must be a scalar (rank 0), but it has shape {shape}")]
    NonScalarLoss { shape: Shape },

    /// A watched tensor was never reached by the backward walk.
    #[error("no gradient reached tensor {id}: it is not connected to the loss")]
    MissingGradient { id: TensorId },

    /// A handle was used after its buffer was released.
    #[error("tensor {id} is disposed")]
    DisposedTensor { id: TensorId },

    /// `end_scope` was called with no open scope.
    #[error("end_scope called with an empty scope stack")]
    ScopeUnderflow,

    /// The backend does not implement this kernel.
    #[error("kernel '{kernel}' is not registered for backend '{backend}'")]
    KernelNotFound { kernel: KernelId, backend: String },

    /// A backward function did not provide a gradient for a recorded input.
    #[error("cannot backprop through input '{input}' of kernel '{kernel}'")]
    MissingInputGradient { kernel: KernelId, input: String },

    /// A gradient could not be brought back to the shape of its input.
    #[error(
        "gradient of input '{input}' of kernel '{kernel}' has shape {got}, \
         which does not match the input shape {expected}"
    )]
    GradientShapeMismatch {
        kernel: KernelId,
        input: String,
        expected: Shape,
        got: Shape,
    },

    /// Gradients must be floating point.
    #[error("gradient of input '{input}' of kernel '{kernel}' must be a float, but has dtype {dtype}")]
    GradientDType {
        kernel: KernelId,
        input: String,
        dtype: crate::DType,
    },

    /// A variable with this name is already registered.
    #[error("variable with name '{0}' was already registered")]
    VariableExists(String),

    /// No variable with this name is registered.
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    /// Malformed or unsupported einsum equation.
    #[error("einsum: {0}")]
    Einsum(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout tidal.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
