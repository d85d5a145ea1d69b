//! # tidal-core
//!
//! Tensor lifecycle and reverse-mode autodiff for tidal.
//!
//! This crate provides:
//! - [`Engine`]: tensor table, tidy/keep/dispose scopes, kernel dispatch,
//!   variables and gradients
//! - [`Shape`]: shapes and broadcasting rules
//! - [`DType`]: data types (F32, F64, U8, U32, I64)
//! - [`Backend`] trait: the boundary to a compute backend
//! - [`GradientRegistry`]: per-kernel backward rules
//! - [`Tape`]: kernels recorded while gradients are being taken
// - Tensor: an id plus shape and dtype; data lives in the engine
// - Scope: arena of tensors released together at end_scope
// - Kernel: unit of work dispatched to the backend
// - einsum: standalone equation decoding; no backend here runs einsum yet

pub mod autodiff;
pub mod backend;
pub mod config;
pub mod dtype;
pub mod einsum;
pub mod engine;
pub mod error;
pub mod gradient;
pub mod grads;
pub mod kernel;
pub mod ops;
pub mod scope;
pub mod shape;
pub mod tape;
pub mod tensor;
pub mod variable;

#[cfg(test)]
mod testing;

pub use autodiff::{Gradients, VariableGrads};
pub use backend::{Backend, BackendStorage, KernelInput, KernelOutput};
pub use config::EngineConfig;
pub use dtype::{DType, WithDType};
pub use engine::{Engine, MemoryInfo};
pub use error::{Error, Result};
pub use gradient::{thunk, BackwardArgs, GradThunk, GradientDescriptor, GradientFn, GradientMap, GradientRegistry, Slot};
pub use kernel::{AttrValue, Attrs, BinaryOp, Kernel, KernelId, UnaryOp};
pub use scope::{Scope, ScopeId, ScopeStack, ScopeState};
pub use shape::Shape;
pub use tape::{CustomGradFn, Tape, TapeRecord};
pub use tensor::{Tensor, TensorContainer, TensorId};
pub use variable::{NamedTensor, Variable};
