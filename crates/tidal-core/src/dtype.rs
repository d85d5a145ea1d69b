use std::fmt;

// DType: element types a tensor can hold
//
//   F32    32-bit float, the default
//   F64    64-bit float, for high-precision work and tests
//   U8     unsigned byte, used for boolean masks (e.g. the output of IsNan)
//   U32    unsigned 32-bit int, for indices
//   I64    signed 64-bit int, for labels and counters
//
// Only float tensors can carry gradients; the backward walk rejects any
// gradient whose dtype is not float.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F32,
    F64,
    U8,
    U32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::U32 => 4,
            DType::I64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type (needed for gradient tracking).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Parse a dtype from its lowercase name (`"f32"`, `"i64"`, ...).
    pub fn from_name(name: &str) -> Option<DType> {
        match name {
            "f32" | "float32" => Some(DType::F32),
            "f64" | "float64" => Some(DType::F64),
            "u8" | "bool" => Some(DType::U8),
            "u32" => Some(DType::U32),
            "i64" | "int64" => Some(DType::I64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

// WithDType: connects Rust element types to the DType enum
//
// Backends store typed buffers; WithDType lets generic code go from a Rust
// type to its runtime tag and through f64 for conversions:
//
//   fn cast_slice<T: WithDType>(data: &[f64]) -> Vec<T> { ... }

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64. Out-of-range values saturate.
    fn from_f64(v: f64) -> Self;

    /// The zero value.
    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    /// The one value.
    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

macro_rules! impl_with_dtype {
    ($ty:ty, $dtype:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = $dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

impl_with_dtype!(f32, DType::F32);
impl_with_dtype!(f64, DType::F64);
impl_with_dtype!(u8, DType::U8);
impl_with_dtype!(u32, DType::U32);
impl_with_dtype!(i64, DType::I64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_only_floats_carry_gradients() {
        assert!(DType::F32.is_float());
        assert!(DType::F64.is_float());
        assert!(!DType::U8.is_float());
        assert!(!DType::I64.is_float());
    }

    #[test]
    fn test_with_dtype_f32() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(f32::from_f64(3.14).to_f64(), 3.140000104904175); // f32 precision
    }

    #[test]
    fn test_with_dtype_roundtrip() {
        let v: f64 = 42.0;
        assert_eq!(f64::from_f64(v).to_f64(), v);
        assert_eq!(i64::from_f64(v).to_f64(), v);
        assert_eq!(u32::from_f64(v).to_f64(), v);
        // Float-to-int `as` casts saturate.
        assert_eq!(u8::from_f64(300.0), 255);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(DType::from_name("f32"), Some(DType::F32));
        assert_eq!(DType::from_name("int64"), Some(DType::I64));
        assert_eq!(DType::from_name("complex64"), None);
        assert_eq!(DType::from_name(&DType::U32.to_string()), Some(DType::U32));
    }
}
