use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;

// Tensor: a lightweight handle into the engine's tensor table
//
// A Tensor does not own its data. It is an id plus the metadata every caller
// needs without asking the engine (shape and dtype):
//
//   Tensor { id: 7, shape: [2, 3], dtype: f32 }
//        │
//        ▼  engine tensor table
//   TensorId(7) → { data: DataId(4), scope: Some(2), kept: false }
//        │
//        ▼  engine data table (ref-counted)
//   DataId(4)   → { storage: <backend buffer>, refs: 2, bytes: 24 }
//
// Cloning a handle is cheap and never allocates on the backend. Two tensors
// (for example a Variable and the value it was created from) can share one
// buffer; the buffer is released when its last tensor is disposed.
//
// Disposal is explicit (`Engine::dispose`) or automatic at scope end
// (`Engine::tidy`). A handle that outlives its tensor is detected by the
// engine and reported as `Error::DisposedTensor`.

/// Unique identifier for a tensor. Assigned from a per-engine counter and
/// never reused, so a stale handle can always be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl TensorId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a backend buffer in the engine's data table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub(crate) u64);

/// Handle to a tensor owned by an `Engine`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    pub(crate) id: TensorId,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
}

impl Tensor {
    pub(crate) fn new(id: TensorId, shape: Shape, dtype: DType) -> Self {
        Tensor { id, shape, dtype }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={}, shape={}, dtype={})",
            self.id, self.shape, self.dtype
        )
    }
}

impl AsRef<Tensor> for Tensor {
    fn as_ref(&self) -> &Tensor {
        self
    }
}

// TensorContainer: anything that holds tensor handles
//
// `tidy` preserves whatever its closure returns and `dispose` releases
// whatever it is given. Both walk the value through this trait, so results
// can be a single tensor, a tuple, a Vec, a map, or a struct of gradients.

/// A value that (transitively) holds tensor handles.
pub trait TensorContainer {
    /// Call `f` on every tensor handle in this value.
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor));

    /// Ids of every tensor in this value, in visit order.
    fn tensor_ids(&self) -> Vec<TensorId> {
        let mut ids = Vec::new();
        self.visit_tensors(&mut |t| ids.push(t.id()));
        ids
    }
}

impl TensorContainer for Tensor {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(self)
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for &T {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        (**self).visit_tensors(f)
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for Box<T> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        (**self).visit_tensors(f)
    }
}

impl<T: TensorContainer> TensorContainer for [T] {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        for item in self {
            item.visit_tensors(f);
        }
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        self.as_slice().visit_tensors(f)
    }
}

impl<T: TensorContainer, const N: usize> TensorContainer for [T; N] {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        self.as_slice().visit_tensors(f)
    }
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        if let Some(item) = self {
            item.visit_tensors(f);
        }
    }
}

impl<K, V: TensorContainer> TensorContainer for BTreeMap<K, V> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        for v in self.values() {
            v.visit_tensors(f);
        }
    }
}

impl<K, V: TensorContainer, S> TensorContainer for HashMap<K, V, S> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        for v in self.values() {
            v.visit_tensors(f);
        }
    }
}

macro_rules! impl_container_tuple {
    ($($name:ident),+) => {
        impl<$($name: TensorContainer),+> TensorContainer for ($($name,)+) {
            #[allow(non_snake_case)]
            fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
                let ($($name,)+) = self;
                $($name.visit_tensors(f);)+
            }
        }
    };
}

impl_container_tuple!(A);
impl_container_tuple!(A, B);
impl_container_tuple!(A, B, C);
impl_container_tuple!(A, B, C, D);

// Plain values hold no tensors, so `tidy` can return them directly.
macro_rules! impl_container_empty {
    ($($ty:ty),+) => {
        $(impl TensorContainer for $ty {
            fn visit_tensors(&self, _f: &mut dyn FnMut(&Tensor)) {}
        })+
    };
}

impl_container_empty!((), bool, f32, f64, usize, u64, i64, String);

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> Tensor {
        Tensor::new(TensorId(id), Shape::from(2), DType::F32)
    }

    #[test]
    fn test_container_visits_nested_values() {
        let mut map = BTreeMap::new();
        map.insert("w", t(3));
        let value = (t(1), vec![Some(t(2)), None], map);
        assert_eq!(value.tensor_ids(), vec![TensorId(1), TensorId(2), TensorId(3)]);
    }

    #[test]
    fn test_plain_values_hold_nothing() {
        assert!(1.5f64.tensor_ids().is_empty());
        assert!(().tensor_ids().is_empty());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", t(5)), "Tensor(id=#5, shape=[2], dtype=f32)");
    }
}
