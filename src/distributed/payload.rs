//! Step payloads and results
//!
//! A step receives positional and named arguments built from [`Value`], a
//! small sum type over tensors, autograd variables, nested containers and
//! plain literals. Results come back as a `Value` too, so the same type flows
//! through sharding, merging and the reachable-tensor walk.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use numr::autograd::Var;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// Non-batched leaf value. Replicated on scatter, collapsed on gather.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A node in a step payload or step result.
pub enum Value<R: Runtime> {
    /// Batched tensor, split along the scatter dim.
    Tensor(Tensor<R>),
    /// Autograd variable, split along the scatter dim.
    Var(Var<R>),
    /// Ordered container, scattered element-wise.
    Seq(Vec<Value<R>>),
    /// Keyed container, scattered per key.
    Map(BTreeMap<String, Value<R>>),
    /// Data already split by the caller: element `i` belongs to device `i`.
    Partitioned(Vec<Value<R>>),
    Opaque(Literal),
}

/// Callbacks for [`Value::accept`]. Every method defaults to a no-op.
pub trait ValueVisitor<R: Runtime> {
    fn visit_tensor(&mut self, _tensor: &Tensor<R>) {}
    fn visit_var(&mut self, _var: &Var<R>) {}
    fn visit_literal(&mut self, _literal: &Literal) {}
}

impl<R: Runtime> Value<R> {
    /// Walk the value depth-first, in container order, calling `visitor` on each leaf.
    pub fn accept<V: ValueVisitor<R> + ?Sized>(&self, visitor: &mut V) {
        match self {
            Self::Tensor(t) => visitor.visit_tensor(t),
            Self::Var(v) => visitor.visit_var(v),
            Self::Opaque(l) => visitor.visit_literal(l),
            Self::Seq(items) | Self::Partitioned(items) => {
                for item in items {
                    item.accept(visitor);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.accept(visitor);
                }
            }
        }
    }

    /// Ids of every tensor and variable reachable from this value,
    /// deduplicated, in visitation order.
    pub fn find_tensors(&self) -> Vec<TensorId> {
        let mut collector = TensorCollector::default();
        self.accept(&mut collector);
        collector.ids
    }

    pub fn as_tensor(&self) -> Option<&Tensor<R>> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Var(v) => Some(v.tensor()),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var<R>> {
        match self {
            Self::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value<R>]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value<R>>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Opaque(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Value<R>> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl<R: Runtime> Clone for Value<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(t.clone()),
            Self::Var(v) => Self::Var(v.clone()),
            Self::Seq(items) => Self::Seq(items.clone()),
            Self::Map(map) => Self::Map(map.clone()),
            Self::Partitioned(items) => Self::Partitioned(items.clone()),
            Self::Opaque(l) => Self::Opaque(l.clone()),
        }
    }
}

impl<R: Runtime> fmt::Debug for Value<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(t) => write!(f, "Tensor{:?}", t.shape()),
            Self::Var(v) => write!(f, "Var{:?}", v.tensor().shape()),
            Self::Seq(items) => f.debug_list().entries(items).finish(),
            Self::Map(map) => f.debug_map().entries(map).finish(),
            Self::Partitioned(items) => {
                write!(f, "Partitioned")?;
                f.debug_list().entries(items).finish()
            }
            Self::Opaque(l) => write!(f, "{l:?}"),
        }
    }
}

impl<R: Runtime> From<Tensor<R>> for Value<R> {
    fn from(t: Tensor<R>) -> Self {
        Self::Tensor(t)
    }
}

impl<R: Runtime> From<Var<R>> for Value<R> {
    fn from(v: Var<R>) -> Self {
        Self::Var(v)
    }
}

impl<R: Runtime> From<Literal> for Value<R> {
    fn from(l: Literal) -> Self {
        Self::Opaque(l)
    }
}

impl<R: Runtime> From<bool> for Value<R> {
    fn from(b: bool) -> Self {
        Self::Opaque(Literal::Bool(b))
    }
}

impl<R: Runtime> From<i64> for Value<R> {
    fn from(i: i64) -> Self {
        Self::Opaque(Literal::Int(i))
    }
}

impl<R: Runtime> From<f64> for Value<R> {
    fn from(x: f64) -> Self {
        Self::Opaque(Literal::Float(x))
    }
}

impl<R: Runtime> From<&str> for Value<R> {
    fn from(s: &str) -> Self {
        Self::Opaque(Literal::Str(s.to_string()))
    }
}

impl<R: Runtime> From<String> for Value<R> {
    fn from(s: String) -> Self {
        Self::Opaque(Literal::Str(s))
    }
}

impl<R: Runtime> From<Vec<Value<R>>> for Value<R> {
    fn from(items: Vec<Value<R>>) -> Self {
        Self::Seq(items)
    }
}

impl<R: Runtime> From<BTreeMap<String, Value<R>>> for Value<R> {
    fn from(map: BTreeMap<String, Value<R>>) -> Self {
        Self::Map(map)
    }
}

#[derive(Default)]
struct TensorCollector {
    seen: HashSet<TensorId>,
    ids: Vec<TensorId>,
}

impl TensorCollector {
    fn push(&mut self, id: TensorId) {
        if self.seen.insert(id) {
            self.ids.push(id);
        }
    }
}

impl<R: Runtime> ValueVisitor<R> for TensorCollector {
    fn visit_tensor(&mut self, tensor: &Tensor<R>) {
        self.push(tensor.id());
    }

    fn visit_var(&mut self, var: &Var<R>) {
        self.push(var.id());
    }
}

/// Step result: a single (possibly nested) value.
pub type StepResult<R> = Value<R>;

/// One logical call's input: positional plus named arguments.
pub struct StepPayload<R: Runtime> {
    pub args: Vec<Value<R>>,
    pub kwargs: BTreeMap<String, Value<R>>,
}

impl<R: Runtime> StepPayload<R> {
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn from_parts(args: Vec<Value<R>>, kwargs: BTreeMap<String, Value<R>>) -> Self {
        Self { args, kwargs }
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value<R>>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Add a named argument.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value<R>>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn arg(&self, index: usize) -> Option<&Value<R>> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value<R>> {
        self.kwargs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Pack the payload into one `Map` value with `args` and `kwargs` keys.
    ///
    /// Handy for identity steps that echo their input back.
    pub fn into_value(self) -> Value<R> {
        let mut map = BTreeMap::new();
        map.insert("args".to_string(), Value::Seq(self.args));
        map.insert("kwargs".to_string(), Value::Map(self.kwargs));
        Value::Map(map)
    }
}

impl<R: Runtime> Default for StepPayload<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> Clone for StepPayload<R> {
    fn clone(&self) -> Self {
        Self {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

impl<R: Runtime> fmt::Debug for StepPayload<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepPayload")
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}
