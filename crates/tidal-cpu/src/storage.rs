use tidal_core::backend::BackendStorage;
use tidal_core::dtype::DType;

/// Host memory for one tensor buffer, one variant per dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

impl CpuStorage {
    /// Convert f64 values into storage of `dtype`. Integer dtypes truncate
    /// toward zero and saturate at their bounds.
    pub fn from_f64(values: &[f64], dtype: DType) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(values.iter().map(|&v| v as f32).collect()),
            DType::F64 => CpuStorage::F64(values.to_vec()),
            DType::U8 => CpuStorage::U8(values.iter().map(|&v| v as u8).collect()),
            DType::U32 => CpuStorage::U32(values.iter().map(|&v| v as u32).collect()),
            DType::I64 => CpuStorage::I64(values.iter().map(|&v| v as i64).collect()),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            CpuStorage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::F64(v) => v.clone(),
            CpuStorage::U8(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::U32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::I64(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// The f32 values, if this is an f32 buffer.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            CpuStorage::F32(v) => Some(v),
            _ => None,
        }
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::U32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_per_dtype() {
        let s = CpuStorage::from_f64(&[1.5, -2.0, 300.0], DType::U8);
        assert_eq!(s, CpuStorage::U8(vec![1, 0, 255]));
        let s = CpuStorage::from_f64(&[1.5, -2.0], DType::I64);
        assert_eq!(s.to_f64_vec(), vec![1.0, -2.0]);
        let s = CpuStorage::from_f64(&[0.25], DType::F32);
        assert_eq!(s.as_f32(), Some(&[0.25f32][..]));
        assert_eq!(s.size_in_bytes(), 4);
    }
}
