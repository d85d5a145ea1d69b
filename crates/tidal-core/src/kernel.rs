use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;

// Kernel: the unit of work the engine hands to a backend
//
// Every tensor-producing operation goes through `Engine::run_kernel` with a
// `Kernel` value. The enum names the built-in kernel families and carries
// their parameters; `Custom` carries any kernel a plugin backend provides,
// identified only by name plus a bag of attributes.
//
// KernelId is the name used for dispatch and for the gradient registry:
//
//   Kernel::Binary(BinaryOp::Add).id()        == KernelId::ADD  ("Add")
//   Kernel::Sum { .. }.id()                   == KernelId::SUM  ("Sum")
//   Kernel::Custom { id: "Erf".into(), .. }   == "Erf"
//
// The tape stores the full Kernel so that backward functions can read the
// forward parameters (axes, target shape, cast dtype).

/// Interned kernel name used for backend dispatch and gradient lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(Cow<'static, str>);

impl KernelId {
    pub const ADD: KernelId = KernelId::from_static("Add");
    pub const SUB: KernelId = KernelId::from_static("Sub");
    pub const MUL: KernelId = KernelId::from_static("Multiply");
    pub const DIV: KernelId = KernelId::from_static("RealDiv");
    pub const NEG: KernelId = KernelId::from_static("Neg");
    pub const SQUARE: KernelId = KernelId::from_static("Square");
    pub const SQRT: KernelId = KernelId::from_static("Sqrt");
    pub const EXP: KernelId = KernelId::from_static("Exp");
    pub const LOG: KernelId = KernelId::from_static("Log");
    pub const ABS: KernelId = KernelId::from_static("Abs");
    pub const RELU: KernelId = KernelId::from_static("Relu");
    pub const SIGMOID: KernelId = KernelId::from_static("Sigmoid");
    pub const IS_NAN: KernelId = KernelId::from_static("IsNan");
    pub const FLOOR: KernelId = KernelId::from_static("Floor");
    pub const SIGN: KernelId = KernelId::from_static("Sign");
    pub const STEP: KernelId = KernelId::from_static("Step");
    pub const SUM: KernelId = KernelId::from_static("Sum");
    pub const MEAN: KernelId = KernelId::from_static("Mean");
    pub const RESHAPE: KernelId = KernelId::from_static("Reshape");
    pub const BROADCAST_TO: KernelId = KernelId::from_static("BroadcastTo");
    pub const CAST: KernelId = KernelId::from_static("Cast");
    pub const IDENTITY: KernelId = KernelId::from_static("Identity");
    /// Tape nodes recorded by `Engine::custom_grad`.
    pub const CUSTOM_GRADIENT: KernelId = KernelId::from_static("CustomGradient");

    pub const fn from_static(name: &'static str) -> Self {
        KernelId(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        KernelId(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for KernelId {
    fn from(name: &'static str) -> Self {
        KernelId::from_static(name)
    }
}

impl From<String> for KernelId {
    fn from(name: String) -> Self {
        KernelId::new(name)
    }
}

/// Element-wise binary operations. Operands broadcast against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn id(&self) -> KernelId {
        match self {
            BinaryOp::Add => KernelId::ADD,
            BinaryOp::Sub => KernelId::SUB,
            BinaryOp::Mul => KernelId::MUL,
            BinaryOp::Div => KernelId::DIV,
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Square,
    Sqrt,
    Exp,
    Log,
    Abs,
    Relu,
    Sigmoid,
    /// 1 where the input is NaN, 0 elsewhere. Output dtype is U8.
    IsNan,
    Floor,
    /// -1, 0 or 1.
    Sign,
    /// 1 where the input is positive, 0 elsewhere.
    Step,
}

impl UnaryOp {
    pub fn id(&self) -> KernelId {
        match self {
            UnaryOp::Neg => KernelId::NEG,
            UnaryOp::Square => KernelId::SQUARE,
            UnaryOp::Sqrt => KernelId::SQRT,
            UnaryOp::Exp => KernelId::EXP,
            UnaryOp::Log => KernelId::LOG,
            UnaryOp::Abs => KernelId::ABS,
            UnaryOp::Relu => KernelId::RELU,
            UnaryOp::Sigmoid => KernelId::SIGMOID,
            UnaryOp::IsNan => KernelId::IS_NAN,
            UnaryOp::Floor => KernelId::FLOOR,
            UnaryOp::Sign => KernelId::SIGN,
            UnaryOp::Step => KernelId::STEP,
        }
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Square => x * x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::IsNan => {
                if x.is_nan() {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Floor => x.floor(),
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Step => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Output dtype for an input of `dtype`.
    pub fn output_dtype(&self, dtype: DType) -> DType {
        match self {
            UnaryOp::IsNan => DType::U8,
            _ => dtype,
        }
    }
}

/// A single attribute value on a custom kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Shape(Shape),
    DType(DType),
}

/// Named attributes of a custom kernel, in deterministic order.
pub type Attrs = BTreeMap<String, AttrValue>;

/// A kernel invocation: which computation to run and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Binary(BinaryOp),
    Unary(UnaryOp),
    /// Sum over `axes` (empty means all axes).
    Sum { axes: Vec<usize>, keep_dims: bool },
    /// Mean over `axes` (empty means all axes).
    Mean { axes: Vec<usize>, keep_dims: bool },
    Reshape { shape: Shape },
    BroadcastTo { shape: Shape },
    Cast { dtype: DType },
    Identity,
    /// A kernel provided by a backend plugin.
    Custom { id: KernelId, attrs: Attrs },
}

impl Kernel {
    /// The kernel's dispatch name.
    pub fn id(&self) -> KernelId {
        match self {
            Kernel::Binary(op) => op.id(),
            Kernel::Unary(op) => op.id(),
            Kernel::Sum { .. } => KernelId::SUM,
            Kernel::Mean { .. } => KernelId::MEAN,
            Kernel::Reshape { .. } => KernelId::RESHAPE,
            Kernel::BroadcastTo { .. } => KernelId::BROADCAST_TO,
            Kernel::Cast { .. } => KernelId::CAST,
            Kernel::Identity => KernelId::IDENTITY,
            Kernel::Custom { id, .. } => id.clone(),
        }
    }

    /// Build a custom kernel with no attributes.
    pub fn custom(id: impl Into<KernelId>) -> Self {
        Kernel::Custom {
            id: id.into(),
            attrs: Attrs::new(),
        }
    }

    /// Add an attribute to a custom kernel. No-op for built-in kernels.
    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        if let Kernel::Custom { attrs, .. } = &mut self {
            attrs.insert(name.into(), value);
        }
        self
    }

    /// Attributes of a custom kernel, if any.
    pub fn attrs(&self) -> Option<&Attrs> {
        match self {
            Kernel::Custom { attrs, .. } => Some(attrs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids() {
        assert_eq!(Kernel::Binary(BinaryOp::Add).id(), KernelId::ADD);
        assert_eq!(Kernel::Unary(UnaryOp::IsNan).id().as_str(), "IsNan");
        assert_eq!(
            Kernel::Sum {
                axes: vec![],
                keep_dims: false
            }
            .id(),
            KernelId::SUM
        );
    }

    #[test]
    fn test_custom_id_and_attrs() {
        let k = Kernel::custom("Erf").with_attr("approx", AttrValue::Bool(true));
        assert_eq!(k.id(), KernelId::new("Erf"));
        assert_eq!(k.id().to_string(), "Erf");
        assert_eq!(
            k.attrs().and_then(|a| a.get("approx")),
            Some(&AttrValue::Bool(true))
        );
        // Attributes are ignored for built-ins.
        let b = Kernel::Identity.with_attr("x", AttrValue::Int(1));
        assert!(b.attrs().is_none());
    }

    #[test]
    fn test_borrowed_and_owned_ids_compare_equal() {
        assert_eq!(KernelId::from_static("Sum"), KernelId::new(String::from("Sum")));
    }

    #[test]
    fn test_unary_apply() {
        assert_eq!(UnaryOp::Relu.apply(-2.0), 0.0);
        assert_eq!(UnaryOp::Sign.apply(-2.0), -1.0);
        assert_eq!(UnaryOp::Step.apply(0.0), 0.0);
        assert_eq!(UnaryOp::IsNan.apply(f64::NAN), 1.0);
        assert_eq!(UnaryOp::IsNan.output_dtype(DType::F32), DType::U8);
        assert!((UnaryOp::Sigmoid.apply(0.0) - 0.5).abs() < 1e-12);
    }
}
