use tracing::debug;

use tidal_core::backend::Backend;
use tidal_core::engine::Engine;
use tidal_core::error::{Error, Result};
use tidal_core::variable::NamedTensor;

use crate::optimizer::{extract_iterations, save_iterations, NamedGradients, Optimizer};

/// Stochastic Gradient Descent.
///
/// Update rule: θ ← θ - lr * ∇θ
///
/// Keeps no per-variable state.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
    iterations: u64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Sgd {
            learning_rate,
            iterations: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }
}

impl<B: Backend> Optimizer<B> for Sgd {
    fn name(&self) -> &'static str {
        "SGD"
    }

    fn apply_gradients(&mut self, engine: &mut Engine<B>, grads: &NamedGradients) -> Result<()> {
        let mut updated = 0usize;
        for (name, grad) in grads {
            let Some(grad) = grad else {
                continue;
            };
            let variable = engine.get_variable(name)?;
            let lr = self.learning_rate;
            engine.tidy(|e| {
                let step = e.mul_scalar(grad, -lr)?;
                let new_value = e.add(&step, variable.tensor())?;
                e.assign(&variable, &new_value)
            })?;
            updated += 1;
        }
        self.iterations += 1;
        debug!(optimizer = "SGD", iteration = self.iterations, updated, "applied gradients");
        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }

    fn get_weights(&self, engine: &mut Engine<B>) -> Result<Vec<NamedTensor>> {
        Ok(vec![save_iterations(engine, self.iterations)?])
    }

    fn set_weights(&mut self, engine: &mut Engine<B>, weights: &[NamedTensor]) -> Result<()> {
        let (iterations, rest) = extract_iterations(engine, weights)?;
        if !rest.is_empty() {
            return Err(Error::msg("SGD optimizer does not have settable weights."));
        }
        self.iterations = iterations;
        Ok(())
    }

    fn dispose(&mut self, _engine: &mut Engine<B>) -> Result<()> {
        Ok(())
    }

    fn config(&self) -> Vec<(&'static str, f64)> {
        vec![("learning_rate", self.learning_rate)]
    }
}
