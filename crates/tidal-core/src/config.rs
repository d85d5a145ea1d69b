use crate::dtype::DType;

/// Environment variable that turns on per-kernel debug logging.
pub const ENV_DEBUG: &str = "TIDAL_DEBUG";
/// Environment variable overriding the numeric epsilon.
pub const ENV_EPSILON: &str = "TIDAL_EPSILON";

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Dtype used by creation helpers that take no explicit dtype (default: F32).
    pub default_dtype: DType,
    /// Log every kernel with its output shapes and elapsed time, and check
    /// float outputs for NaN.
    pub debug: bool,
    /// Small constant used by optimizers that need one (default: 1e-7).
    pub epsilon: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_dtype: DType::F32,
            debug: false,
            epsilon: 1e-7,
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `TIDAL_DEBUG` and `TIDAL_EPSILON` when set.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var(ENV_DEBUG) {
            config.debug = matches!(v.trim(), "1" | "true" | "TRUE" | "on" | "yes");
        }
        if let Ok(v) = std::env::var(ENV_EPSILON) {
            match v.trim().parse::<f64>() {
                Ok(eps) if eps > 0.0 => config.epsilon = eps,
                _ => tracing::warn!(value = %v, "ignoring invalid {}", ENV_EPSILON),
            }
        }
        config
    }

    /// Set default dtype.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.default_dtype = dtype;
        self
    }

    /// Set debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set epsilon.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let c = EngineConfig::default()
            .with_dtype(DType::F64)
            .with_debug(true)
            .with_epsilon(1e-3);
        assert_eq!(c.default_dtype, DType::F64);
        assert!(c.debug);
        assert_eq!(c.epsilon, 1e-3);
    }

    // The only test in this crate that touches these variables.
    #[test]
    fn test_from_env() {
        std::env::set_var(ENV_DEBUG, "1");
        std::env::set_var(ENV_EPSILON, "0.001");
        let c = EngineConfig::from_env();
        assert!(c.debug);
        assert_eq!(c.epsilon, 1e-3);
        assert_eq!(c.default_dtype, DType::F32);

        std::env::set_var(ENV_DEBUG, "off");
        std::env::set_var(ENV_EPSILON, "-5");
        let c = EngineConfig::from_env();
        assert!(!c.debug);
        assert_eq!(c.epsilon, 1e-7);

        std::env::remove_var(ENV_DEBUG);
        std::env::remove_var(ENV_EPSILON);
        assert_eq!(EngineConfig::from_env(), EngineConfig::default());
    }

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.default_dtype, DType::F32);
        assert!(!c.debug);
    }
}
