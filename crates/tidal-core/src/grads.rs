// Built-in gradient rules
//
// One rule per kernel family rather than one per kernel:
//
//   BinaryGrad(op)   Add, Sub, Mul, Div
//   UnaryGrad(op)    Neg, Square, Sqrt, Exp, Log, Abs, Relu, Sigmoid
//   ZeroGrad         IsNan, Floor, Sign, Step (piecewise constant)
//   SumGrad          Sum
//   MeanGrad         Mean
//   ReshapeGrad      Reshape
//   BroadcastToGrad  BroadcastTo
//   CastGrad         Cast
//   IdentityGrad     Identity
//
// GRADIENT RULES:
//
//   Add:  da = dy,       db = dy
//   Sub:  da = dy,       db = -dy
//   Mul:  da = dy * b,   db = dy * a
//   Div:  da = dy / b,   db = -dy * a / b²
//   Square: dx = dy * 2x          Sqrt: dx = dy / (2 √x)
//   Exp:    dx = dy * y           Log:  dx = dy / x
//   Abs:    dx = dy * sign(x)     Relu: dx = dy * step(x)
//   Sigmoid: dx = dy * y * (1 - y)
//   Sum/Mean: dy broadcast back over the reduced axes (Mean divides by N)
//
// Binary rules return gradients in the broadcast output shape; the engine
// sums them back down to each input's shape.

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gradient::{thunk, BackwardArgs, GradientDescriptor, GradientFn, GradientMap};
use crate::kernel::{BinaryOp, Kernel, KernelId, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

pub(crate) fn default_descriptors<B: Backend>() -> Vec<GradientDescriptor<B>> {
    let mut descriptors = Vec::new();
    for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div] {
        descriptors.push(BinaryGrad(op).descriptor());
    }
    for op in [
        UnaryOp::Neg,
        UnaryOp::Square,
        UnaryOp::Sqrt,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Abs,
        UnaryOp::Relu,
        UnaryOp::Sigmoid,
    ] {
        descriptors.push(UnaryGrad(op).descriptor());
    }
    for op in [UnaryOp::IsNan, UnaryOp::Floor, UnaryOp::Sign, UnaryOp::Step] {
        descriptors.push(GradientDescriptor::new(op.id(), ZeroGrad));
    }
    descriptors.push(GradientDescriptor::new(KernelId::SUM, SumGrad));
    descriptors.push(GradientDescriptor::new(KernelId::MEAN, MeanGrad));
    descriptors.push(GradientDescriptor::new(KernelId::RESHAPE, ReshapeGrad));
    descriptors.push(GradientDescriptor::new(KernelId::BROADCAST_TO, BroadcastToGrad));
    descriptors.push(GradientDescriptor::new(KernelId::CAST, CastGrad));
    descriptors.push(GradientDescriptor::new(KernelId::IDENTITY, IdentityGrad));
    descriptors
}

/// Gradients of the element-wise binary kernels.
#[derive(Debug, Clone, Copy)]
pub struct BinaryGrad(pub BinaryOp);

impl BinaryGrad {
    pub fn descriptor<B: Backend>(self) -> GradientDescriptor<B> {
        let desc = GradientDescriptor::new(self.0.id(), self);
        match self.0 {
            BinaryOp::Add | BinaryOp::Sub => desc,
            BinaryOp::Mul | BinaryOp::Div => desc.save_inputs(&["a", "b"]),
        }
    }
}

impl<B: Backend> GradientFn<B> for BinaryGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let mut grads = GradientMap::new();
        match self.0 {
            BinaryOp::Add => {
                let db = dy.clone();
                grads.insert("a".into(), thunk(move |_: &mut Engine<B>| Ok(dy)));
                grads.insert("b".into(), thunk(move |_: &mut Engine<B>| Ok(db)));
            }
            BinaryOp::Sub => {
                let db = dy.clone();
                grads.insert("a".into(), thunk(move |_: &mut Engine<B>| Ok(dy)));
                grads.insert("b".into(), thunk(move |e: &mut Engine<B>| e.neg(&db)));
            }
            BinaryOp::Mul => {
                let a = args.saved(0)?.clone();
                let b = args.saved(1)?.clone();
                let dy_b = dy.clone();
                grads.insert("a".into(), thunk(move |e: &mut Engine<B>| e.mul(&dy, &b)));
                grads.insert("b".into(), thunk(move |e: &mut Engine<B>| e.mul(&dy_b, &a)));
            }
            BinaryOp::Div => {
                let a = args.saved(0)?.clone();
                let b = args.saved(1)?.clone();
                let dy_b = dy.clone();
                let b_b = b.clone();
                grads.insert("a".into(), thunk(move |e: &mut Engine<B>| e.div(&dy, &b)));
                grads.insert(
                    "b".into(),
                    thunk(move |e: &mut Engine<B>| {
                        let num = e.mul(&dy_b, &a)?;
                        let den = e.square(&b_b)?;
                        let q = e.div(&num, &den)?;
                        e.neg(&q)
                    }),
                );
            }
        }
        Ok(grads)
    }
}

/// Gradients of the differentiable element-wise unary kernels.
#[derive(Debug, Clone, Copy)]
pub struct UnaryGrad(pub UnaryOp);

impl UnaryGrad {
    pub fn descriptor<B: Backend>(self) -> GradientDescriptor<B> {
        let desc = GradientDescriptor::new(self.0.id(), self);
        match self.0 {
            UnaryOp::Neg => desc,
            UnaryOp::Exp | UnaryOp::Sigmoid => desc.save_outputs(&[true]),
            _ => desc.save_inputs(&["x"]),
        }
    }
}

impl<B: Backend> GradientFn<B> for UnaryGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let op = self.0;
        let saved = match op {
            UnaryOp::Neg => None,
            _ => Some(args.saved(0)?.clone()),
        };
        let rule = move |e: &mut Engine<B>| -> Result<Tensor> {
            let Some(s) = saved else {
                return e.neg(&dy);
            };
            match op {
                UnaryOp::Square => {
                    let two_x = e.mul_scalar(&s, 2.0)?;
                    e.mul(&dy, &two_x)
                }
                UnaryOp::Sqrt => {
                    let root = e.sqrt(&s)?;
                    let two_root = e.mul_scalar(&root, 2.0)?;
                    e.div(&dy, &two_root)
                }
                UnaryOp::Exp => e.mul(&dy, &s),
                UnaryOp::Log => e.div(&dy, &s),
                UnaryOp::Abs => {
                    let sign = e.sign(&s)?;
                    e.mul(&dy, &sign)
                }
                UnaryOp::Relu => {
                    let mask = e.step(&s)?;
                    e.mul(&dy, &mask)
                }
                UnaryOp::Sigmoid => {
                    let one = e.scalar_like(1.0, &s)?;
                    let one_minus = e.sub(&one, &s)?;
                    let local = e.mul(&s, &one_minus)?;
                    e.mul(&dy, &local)
                }
                other => Err(Error::msg(format!("no unary gradient rule for {:?}", other))),
            }
        };
        let mut grads = GradientMap::new();
        grads.insert("x".into(), thunk(rule));
        Ok(grads)
    }
}

/// Piecewise-constant kernels: the gradient is zero everywhere.
#[derive(Debug, Clone, Copy)]
pub struct ZeroGrad;

impl<B: Backend> GradientFn<B> for ZeroGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let x = args.input("x")?.clone();
        let mut grads = GradientMap::new();
        grads.insert(
            "x".into(),
            thunk(move |e: &mut Engine<B>| {
                let dtype = if x.dtype().is_float() {
                    x.dtype()
                } else {
                    e.config().default_dtype
                };
                e.zeros(x.shape().clone(), dtype)
            }),
        );
        Ok(grads)
    }
}

/// Axes of a Sum/Mean kernel, normalized against the input shape.
fn reduced_axes(kernel: &Kernel, input: &Shape) -> Result<Vec<usize>> {
    match kernel {
        Kernel::Sum { axes, .. } | Kernel::Mean { axes, .. } => input.normalize_axes(axes),
        other => Err(Error::msg(format!(
            "expected a reduction kernel, got '{}'",
            other.id()
        ))),
    }
}

/// Broadcast `dy` from the reduced shape back to `input`.
fn expand_reduced<B: Backend>(
    e: &mut Engine<B>,
    dy: &Tensor,
    input: &Shape,
    axes: &[usize],
) -> Result<Tensor> {
    let keep_shape = input.reduce_shape(axes, true);
    if dy.shape() == &keep_shape {
        return e.broadcast_to(dy, input.clone());
    }
    let kept = e.reshape(dy, keep_shape)?;
    e.broadcast_to(&kept, input.clone())
}

/// Sum: every input element contributed once.
#[derive(Debug, Clone, Copy)]
pub struct SumGrad;

impl<B: Backend> GradientFn<B> for SumGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let input = args.input("x")?.shape().clone();
        let axes = reduced_axes(args.kernel, &input)?;
        let mut grads = GradientMap::new();
        grads.insert(
            "x".into(),
            thunk(move |e: &mut Engine<B>| expand_reduced(e, &dy, &input, &axes)),
        );
        Ok(grads)
    }
}

/// Mean: like Sum, scaled by 1/N where N is the number of reduced elements.
#[derive(Debug, Clone, Copy)]
pub struct MeanGrad;

impl<B: Backend> GradientFn<B> for MeanGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let input = args.input("x")?.shape().clone();
        let axes = reduced_axes(args.kernel, &input)?;
        let count: usize = axes.iter().map(|&a| input.dims()[a]).product();
        let mut grads = GradientMap::new();
        grads.insert(
            "x".into(),
            thunk(move |e: &mut Engine<B>| {
                let expanded = expand_reduced(e, &dy, &input, &axes)?;
                e.mul_scalar(&expanded, 1.0 / count.max(1) as f64)
            }),
        );
        Ok(grads)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReshapeGrad;

impl<B: Backend> GradientFn<B> for ReshapeGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let input = args.input("x")?.shape().clone();
        let mut grads = GradientMap::new();
        grads.insert(
            "x".into(),
            thunk(move |e: &mut Engine<B>| e.reshape(&dy, input)),
        );
        Ok(grads)
    }
}

/// BroadcastTo: sum over the replicated axes.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastToGrad;

impl<B: Backend> GradientFn<B> for BroadcastToGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let input = args.input("x")?.shape().clone();
        let mut grads = GradientMap::new();
        grads.insert(
            "x".into(),
            thunk(move |e: &mut Engine<B>| e.reduce_to_shape(&dy, &input)),
        );
        Ok(grads)
    }
}

/// Cast: pass the gradient through, back in the input's float dtype.
#[derive(Debug, Clone, Copy)]
pub struct CastGrad;

impl<B: Backend> GradientFn<B> for CastGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let in_dtype = args.input("x")?.dtype();
        let mut grads = GradientMap::new();
        grads.insert(
            "x".into(),
            thunk(move |e: &mut Engine<B>| {
                if in_dtype.is_float() && in_dtype != dy.dtype() {
                    e.cast(&dy, in_dtype)
                } else {
                    e.identity(&dy)
                }
            }),
        );
        Ok(grads)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityGrad;

impl<B: Backend> GradientFn<B> for IdentityGrad {
    fn backward(&self, args: &BackwardArgs<'_>) -> Result<GradientMap<B>> {
        let dy = args.dy()?.clone();
        let mut grads = GradientMap::new();
        grads.insert("x".into(), thunk(move |_: &mut Engine<B>| Ok(dy)));
        Ok(grads)
    }
}
