//! # tidal-optim
//!
//! Optimizers that update engine variables from their gradients.
//!
//! Every optimizer implements [`Optimizer`]: `minimize` runs a loss closure
//! under `variable_grads`, applies the gradients, and disposes them.
//! Auxiliary state (accumulators, moments) is held in non-trainable
//! variables named `"<variable>/<slot>"` and created lazily.
//!
//! - [`Sgd`]: θ ← θ - lr * g
//! - [`Adagrad`]: per-element rates from accumulated squared gradients
//! - [`Adam`]: bias-corrected first and second moments

pub mod adagrad;
pub mod adam;
pub mod optimizer;
pub mod sgd;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use optimizer::{NamedGradients, Optimizer, OptimizerState, ITERATIONS_WEIGHT};
pub use sgd::Sgd;
