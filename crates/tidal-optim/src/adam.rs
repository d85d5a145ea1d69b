use tracing::debug;

use tidal_core::backend::Backend;
use tidal_core::engine::Engine;
use tidal_core::error::Result;
use tidal_core::variable::NamedTensor;

use crate::optimizer::{
    extract_iterations, save_iterations, NamedGradients, Optimizer, OptimizerState,
};

/// Adam optimizer (Kingma & Ba, 2014).
///
///   m ← β1 m + (1 - β1) g
///   v ← β2 v + (1 - β2) g²
///   θ ← θ - lr * m̂ / (√v̂ + ε)
///
/// with the bias corrections m̂ = m / (1 - β1ᵗ) and v̂ = v / (1 - β2ᵗ), where
/// t is the 1-based step number. Moments live in the state variables
/// `"<var>/m"` and `"<var>/v"`, starting at zero.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    /// Falls back to the engine's epsilon when `None`.
    epsilon: Option<f64>,
    iterations: u64,
    state: OptimizerState,
}

impl Adam {
    /// Adam with β1 = 0.9, β2 = 0.999.
    pub fn new(learning_rate: f64) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: None,
            iterations: 0,
            state: OptimizerState::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }
}

impl<B: Backend> Optimizer<B> for Adam {
    fn name(&self) -> &'static str {
        "Adam"
    }

    fn apply_gradients(&mut self, engine: &mut Engine<B>, grads: &NamedGradients) -> Result<()> {
        let (lr, beta1, beta2) = (self.learning_rate, self.beta1, self.beta2);
        let eps = self.epsilon.unwrap_or(engine.config().epsilon);
        let t = (self.iterations + 1) as f64;
        let correction1 = 1.0 - beta1.powf(t);
        let correction2 = 1.0 - beta2.powf(t);

        let mut updated = 0usize;
        for (name, grad) in grads {
            let Some(grad) = grad else {
                continue;
            };
            let variable = engine.get_variable(name)?;
            let m = self.state.get_or_create(engine, &variable, "m", 0.0)?;
            let v = self.state.get_or_create(engine, &variable, "v", 0.0)?;
            engine.tidy(|e| {
                let m_decay = e.mul_scalar(m.tensor(), beta1)?;
                let m_grad = e.mul_scalar(grad, 1.0 - beta1)?;
                let new_m = e.add(&m_decay, &m_grad)?;

                let g2 = e.square(grad)?;
                let v_decay = e.mul_scalar(v.tensor(), beta2)?;
                let v_grad = e.mul_scalar(&g2, 1.0 - beta2)?;
                let new_v = e.add(&v_decay, &v_grad)?;

                let m_hat = e.mul_scalar(&new_m, 1.0 / correction1)?;
                let v_hat = e.mul_scalar(&new_v, 1.0 / correction2)?;
                let root = e.sqrt(&v_hat)?;
                let denom = e.add_scalar(&root, eps)?;
                let ratio = e.div(&m_hat, &denom)?;
                let step = e.mul_scalar(&ratio, -lr)?;
                let new_value = e.add(&step, variable.tensor())?;

                e.assign(&m, &new_m)?;
                e.assign(&v, &new_v)?;
                e.assign(&variable, &new_value)
            })?;
            updated += 1;
        }
        self.iterations += 1;
        debug!(optimizer = "Adam", iteration = self.iterations, updated, "applied gradients");
        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }

    fn get_weights(&self, engine: &mut Engine<B>) -> Result<Vec<NamedTensor>> {
        let mut weights = vec![save_iterations(engine, self.iterations)?];
        weights.extend(self.state.weights());
        Ok(weights)
    }

    fn set_weights(&mut self, engine: &mut Engine<B>, weights: &[NamedTensor]) -> Result<()> {
        let (iterations, rest) = extract_iterations(engine, weights)?;
        self.state.restore(engine, rest)?;
        self.iterations = iterations;
        Ok(())
    }

    fn dispose(&mut self, engine: &mut Engine<B>) -> Result<()> {
        self.state.dispose(engine)
    }

    fn config(&self) -> Vec<(&'static str, f64)> {
        let mut config = vec![
            ("learning_rate", self.learning_rate),
            ("beta1", self.beta1),
            ("beta2", self.beta2),
        ];
        if let Some(eps) = self.epsilon {
            config.push(("epsilon", eps));
        }
        config
    }
}
