//! # Tidal
//!
//! A tensor runtime with scoped memory management and tape-based
//! reverse-mode differentiation.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use tidal::prelude::*;
//!
//! # fn main() -> tidal::Result<()> {
//! let mut engine = Engine::new(CpuBackend::new());
//! let x = engine.tensor(&[1.0, 2.0, 3.0], 3)?;
//! let y = engine.tidy(|e| {
//!     let sq = e.square(&x)?;
//!     e.sum(&sq, &[], false)
//! })?;
//! assert_eq!(engine.read_scalar(&y)?, 14.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `tidal-core` | Engine, Tensor, Shape, DType, scopes, gradient registry, tape, autodiff |
//! | `tidal-cpu` | Reference CPU backend |
//! | `tidal-optim` | Optimizers (SGD, Adagrad, Adam) |

/// Re-export core types.
pub use tidal_core::{
    einsum, thunk, AttrValue, Attrs, Backend, BackendStorage, BackwardArgs, BinaryOp,
    CustomGradFn, DType, Engine, EngineConfig, Error, GradThunk, GradientDescriptor, GradientFn,
    GradientMap, GradientRegistry, Gradients, Kernel, KernelId, KernelInput, KernelOutput,
    MemoryInfo, NamedTensor, Result, Scope, ScopeId, ScopeStack, ScopeState, Shape, Slot, Tape,
    TapeRecord, Tensor, TensorContainer, TensorId, UnaryOp, Variable, VariableGrads, WithDType,
};

/// Re-export CPU backend.
pub use tidal_cpu::{CpuBackend, CpuStorage};

/// Re-export optimizers.
pub mod optim {
    pub use tidal_optim::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::optim::{Adagrad, Adam, NamedGradients, Optimizer, Sgd};
    pub use crate::{
        CpuBackend, DType, Engine, EngineConfig, Error, Gradients, Result, Shape, Tensor,
        TensorContainer, Variable, VariableGrads,
    };
}
