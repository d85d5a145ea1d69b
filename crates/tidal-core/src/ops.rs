use crate::backend::Backend;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel::{BinaryOp, Kernel, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

// Tensor operations on the engine
//
// Creation helpers allocate storage directly on the backend. They are not
// kernels, so they are never recorded: a tensor made by `tensor`, `zeros`
// or `random_normal` is a constant as far as the tape is concerned.
//
// Every other operation validates its arguments, then goes through
// `run_kernel`, which dispatches to the backend, tracks the result in the
// current scope and records it while gradients are being taken.
//
// Slot names used by the built-in gradient rules:
//
//   binary ops   "a", "b"
//   everything else   "x"

impl<B: Backend> Engine<B> {
    //  Creation

    /// A tensor from row-major values in the default dtype.
    pub fn tensor(&mut self, values: &[f64], shape: impl Into<Shape>) -> Result<Tensor> {
        let dtype = self.config().default_dtype;
        self.tensor_with_dtype(values, shape, dtype)
    }

    pub fn tensor_with_dtype(
        &mut self,
        values: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
    ) -> Result<Tensor> {
        let shape = shape.into();
        if values.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: values.len(),
                shape,
            });
        }
        let storage = self.backend_mut().from_f64_slice(values, dtype)?;
        self.make_tensor(storage, shape, dtype)
    }

    /// A rank-0 tensor in the default dtype.
    pub fn scalar(&mut self, value: f64) -> Result<Tensor> {
        self.tensor(&[value], ())
    }

    pub fn fill(&mut self, shape: impl Into<Shape>, value: f64, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let storage = self.backend_mut().fill(&shape, value, dtype)?;
        self.make_tensor(storage, shape, dtype)
    }

    pub fn zeros(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.fill(shape, 0.0, dtype)
    }

    pub fn ones(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.fill(shape, 1.0, dtype)
    }

    pub fn zeros_like(&mut self, t: &Tensor) -> Result<Tensor> {
        self.fill(t.shape().clone(), 0.0, t.dtype())
    }

    pub fn ones_like(&mut self, t: &Tensor) -> Result<Tensor> {
        self.fill(t.shape().clone(), 1.0, t.dtype())
    }

    /// A scalar with `t`'s dtype, for mixing constants into binary ops.
    pub fn scalar_like(&mut self, value: f64, t: &Tensor) -> Result<Tensor> {
        self.fill((), value, t.dtype())
    }

    /// Values drawn uniformly from `[low, high)`, in the default dtype.
    pub fn random_uniform(&mut self, shape: impl Into<Shape>, low: f64, high: f64) -> Result<Tensor> {
        // Uniform sampling needs a finite, non-empty range.
        if low.is_nan() || high.is_nan() || low >= high || !(high - low).is_finite() {
            return Err(Error::msg(format!(
                "random_uniform needs finite bounds with low < high, got [{low}, {high})"
            )));
        }
        let shape = shape.into();
        let dtype = self.config().default_dtype;
        let storage = self.backend_mut().random_uniform(&shape, low, high, dtype)?;
        self.make_tensor(storage, shape, dtype)
    }

    /// Values drawn from N(mean, std_dev²), in the default dtype.
    pub fn random_normal(&mut self, shape: impl Into<Shape>, mean: f64, std_dev: f64) -> Result<Tensor> {
        if std_dev < 0.0 {
            return Err(Error::msg(format!(
                "random_normal needs a non-negative std_dev, got {std_dev}"
            )));
        }
        let shape = shape.into();
        let dtype = self.config().default_dtype;
        let storage = self.backend_mut().random_normal(&shape, mean, std_dev, dtype)?;
        self.make_tensor(storage, shape, dtype)
    }

    //  Element-wise binary (broadcasting)

    fn binary(&mut self, op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            });
        }
        Shape::broadcast_shape(a.shape(), b.shape())?;
        self.run_kernel1(Kernel::Binary(op), &[("a", a), ("b", b)])
    }

    pub fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Div, a, b)
    }

    /// `t * value`, with `value` in `t`'s dtype.
    pub fn mul_scalar(&mut self, t: &Tensor, value: f64) -> Result<Tensor> {
        let s = self.scalar_like(value, t)?;
        self.mul(t, &s)
    }

    /// `t + value`, with `value` in `t`'s dtype.
    pub fn add_scalar(&mut self, t: &Tensor, value: f64) -> Result<Tensor> {
        let s = self.scalar_like(value, t)?;
        self.add(t, &s)
    }

    //  Element-wise unary

    fn unary(&mut self, op: UnaryOp, x: &Tensor) -> Result<Tensor> {
        self.run_kernel1(Kernel::Unary(op), &[("x", x)])
    }

    pub fn neg(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Neg, x)
    }

    pub fn square(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Square, x)
    }

    pub fn sqrt(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Sqrt, x)
    }

    pub fn exp(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn log(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Log, x)
    }

    pub fn abs(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Abs, x)
    }

    pub fn relu(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Relu, x)
    }

    pub fn sigmoid(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Sigmoid, x)
    }

    /// 1 where `x` is NaN, 0 elsewhere, as U8.
    pub fn is_nan(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::IsNan, x)
    }

    pub fn floor(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Floor, x)
    }

    pub fn sign(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Sign, x)
    }

    pub fn step(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(UnaryOp::Step, x)
    }

    //  Reductions

    /// Sum over `axes` (all axes when empty).
    pub fn sum(&mut self, x: &Tensor, axes: &[usize], keep_dims: bool) -> Result<Tensor> {
        let axes = x.shape().normalize_axes(axes)?;
        self.run_kernel1(Kernel::Sum { axes, keep_dims }, &[("x", x)])
    }

    /// Mean over `axes` (all axes when empty).
    pub fn mean(&mut self, x: &Tensor, axes: &[usize], keep_dims: bool) -> Result<Tensor> {
        let axes = x.shape().normalize_axes(axes)?;
        self.run_kernel1(Kernel::Mean { axes, keep_dims }, &[("x", x)])
    }

    //  Shape and dtype

    pub fn reshape(&mut self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elem_count() != x.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: x.elem_count(),
                shape,
            });
        }
        self.run_kernel1(Kernel::Reshape { shape }, &[("x", x)])
    }

    /// Replicate `x` along broadcast axes to `shape`.
    pub fn broadcast_to(&mut self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let out = Shape::broadcast_shape(x.shape(), &shape)?;
        if out != shape {
            return Err(Error::ShapeMismatch {
                lhs: x.shape().clone(),
                rhs: shape,
            });
        }
        self.run_kernel1(Kernel::BroadcastTo { shape }, &[("x", x)])
    }

    pub fn cast(&mut self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        self.run_kernel1(Kernel::Cast { dtype }, &[("x", x)])
    }

    /// A new tensor with `x`'s values.
    pub fn identity(&mut self, x: &Tensor) -> Result<Tensor> {
        self.run_kernel1(Kernel::Identity, &[("x", x)])
    }
}
