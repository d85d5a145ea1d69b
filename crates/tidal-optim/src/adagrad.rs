use tracing::debug;

use tidal_core::backend::Backend;
use tidal_core::engine::Engine;
use tidal_core::error::Result;
use tidal_core::variable::NamedTensor;

use crate::optimizer::{
    extract_iterations, save_iterations, NamedGradients, Optimizer, OptimizerState,
};

/// Adagrad: per-element learning rates scaled by accumulated squared
/// gradients.
///
///   acc ← acc + g²
///   θ   ← θ - lr * g / √(acc + ε)
///
/// The accumulator of variable `w` is the state variable `"w/accumulator"`,
/// filled with `initial_accumulator_value` when `w` first gets a gradient.
/// ε is the engine's configured epsilon.
#[derive(Debug)]
pub struct Adagrad {
    learning_rate: f64,
    initial_accumulator_value: f64,
    iterations: u64,
    state: OptimizerState,
}

impl Adagrad {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_initial_accumulator(learning_rate, 0.1)
    }

    pub fn with_initial_accumulator(learning_rate: f64, initial_accumulator_value: f64) -> Self {
        Adagrad {
            learning_rate,
            initial_accumulator_value,
            iterations: 0,
            state: OptimizerState::new(),
        }
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }
}

impl<B: Backend> Optimizer<B> for Adagrad {
    fn name(&self) -> &'static str {
        "Adagrad"
    }

    fn apply_gradients(&mut self, engine: &mut Engine<B>, grads: &NamedGradients) -> Result<()> {
        let lr = self.learning_rate;
        let eps = engine.config().epsilon;
        let mut updated = 0usize;
        for (name, grad) in grads {
            let Some(grad) = grad else {
                continue;
            };
            let variable = engine.get_variable(name)?;
            let acc = self.state.get_or_create(
                engine,
                &variable,
                "accumulator",
                self.initial_accumulator_value,
            )?;
            engine.tidy(|e| {
                let g2 = e.square(grad)?;
                let new_acc = e.add(acc.tensor(), &g2)?;
                e.assign(&acc, &new_acc)?;

                let shifted = e.add_scalar(&new_acc, eps)?;
                let denom = e.sqrt(&shifted)?;
                let scaled = e.div(grad, &denom)?;
                let step = e.mul_scalar(&scaled, -lr)?;
                let new_value = e.add(&step, variable.tensor())?;
                e.assign(&variable, &new_value)
            })?;
            updated += 1;
        }
        self.iterations += 1;
        debug!(optimizer = "Adagrad", iteration = self.iterations, updated, "applied gradients");
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
        vec![
            ("learning_rate", self.learning_rate),
            ("initial_accumulator_value", self.initial_accumulator_value),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_cpu::CpuBackend;

    fn setup() -> Result<(Engine<CpuBackend>, NamedGradients)> {
        let mut engine = Engine::new(CpuBackend::new());
        let init = engine.tensor(&[1.0, -1.0], 2)?;
        engine.variable(&init, true, Some("w"))?;
        engine.dispose(&init)?;
        let g = engine.tensor(&[2.0, 0.5], 2)?;
        let mut grads = NamedGradients::new();
        grads.insert("w".to_string(), Some(g));
        Ok((engine, grads))
    }

    #[test]
    fn test_accumulator_created_lazily() -> Result<()> {
        let (mut engine, grads) = setup()?;
        let mut opt = Adagrad::new(0.1);
        assert!(opt.state().is_empty());
        opt.apply_gradients(&mut engine, &grads)?;
        let acc = opt.state().get("w/accumulator").cloned();
        let acc = acc.ok_or_else(|| tidal_core::Error::msg("missing accumulator"))?;
        // 0.1 + g²
        let got = engine.read(acc.tensor())?;
        assert!((got[0] - 4.1).abs() < 1e-5);
        assert!((got[1] - 0.35).abs() < 1e-5);
        assert!(!acc.trainable());

        // Second step reuses the same accumulator.
        opt.apply_gradients(&mut engine, &grads)?;
        assert_eq!(opt.state().len(), 1);
        assert_eq!(Optimizer::<CpuBackend>::iterations(&opt), 2);
        Ok(())
    }

    #[test]
    fn test_update_rule() -> Result<()> {
        let (mut engine, grads) = setup()?;
        let mut opt = Adagrad::new(0.1);
        opt.apply_gradients(&mut engine, &grads)?;
        let w = engine.get_variable("w")?;
        let got = engine.read(w.tensor())?;
        let expected = [
            1.0 - 0.1 * 2.0 / (4.1f64 + 1e-7).sqrt(),
            -1.0 - 0.1 * 0.5 / (0.35f64 + 1e-7).sqrt(),
        ];
        assert!((got[0] - expected[0]).abs() < 1e-5);
        assert!((got[1] - expected[1]).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_weights_round_trip() -> Result<()> {
        let (mut engine, grads) = setup()?;
        let mut opt = Adagrad::new(0.1);
        opt.apply_gradients(&mut engine, &grads)?;
        let weights = opt.get_weights(&mut engine)?;
        let names: Vec<&str> = weights.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["iter", "w/accumulator"]);
        let saved_acc = engine.read(&weights[1].tensor)?;

        let mut restored = Adagrad::new(0.1);
        restored.set_weights(&mut engine, &weights)?;
        assert_eq!(Optimizer::<CpuBackend>::iterations(&restored), 1);
        let acc = restored.state().get("w/accumulator").cloned();
        let acc = acc.ok_or_else(|| tidal_core::Error::msg("missing accumulator"))?;
        assert_eq!(engine.read(acc.tensor())?, saved_acc);

        opt.dispose(&mut engine)?;
        assert!(opt.state().is_empty());
        // The restored copy owns its own variable.
        assert_eq!(engine.read(acc.tensor())?, saved_acc);
        Ok(())
    }
}
