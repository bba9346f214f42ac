//!
//! # gradgen-graph
//!
//! A static forward graph of tensor operators.
//!
//! Nodes live in a single arena and are addressed by a stable `NodeId`; a
//! `Value` names one output slot of one node. The graph is append-only: nodes
//! are never mutated or removed once added, so ids handed out stay valid for
//! the lifetime of the graph...
//!
//! Nothing here executes; a node only carries its operator, its operands and
//! the types of its results.
//!

use std::fmt;
use std::ops::{Index, Range};

use rustc_hash::{FxHashMap, FxHashSet};

use smallvec::{smallvec, SmallVec};

use thiserror::Error;

/// Tensor extents, outermost first
pub type Dims = SmallVec<[usize; 4]>;

/// Axis permutation; destination axis `i` sources from axis `shuffle[i]`
pub type Shuffle = SmallVec<[usize; 6]>;

/// Index of a node in its graph's arena. A graph holds at most `u32::MAX + 1`
/// nodes; going past that is a bug in the caller, and panics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
  #[inline(always)]
  pub fn new(index: usize) -> Self {
    match u32::try_from(index) {
      Ok(index) => Self(index),
      Err(_) => panic!("node index {index} does not fit in a NodeId"),
    }
  }

  #[inline(always)]
  pub fn index(&self) -> usize {
    self.0 as usize
  }

  /// The first (and usually only) output of this node
  #[inline(always)]
  pub fn result(&self) -> Value {
    Value::new(*self, 0)
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Identity of a tensor flowing through the graph: the node producing it and
/// the output slot it occupies on that node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value {
  node: NodeId,
  slot: u32,
}

impl Value {
  /// Panics when `slot` does not fit in 32 bits, like [`NodeId::new`]
  #[inline(always)]
  pub fn new(node: NodeId, slot: usize) -> Self {
    match u32::try_from(slot) {
      Ok(slot) => Self { node, slot },
      Err(_) => panic!("output slot {slot} of {node} does not fit in a Value"),
    }
  }

  #[inline(always)]
  pub fn node(&self) -> NodeId {
    self.node
  }

  #[inline(always)]
  pub fn slot(&self) -> usize {
    self.slot as usize
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "%{}:{}", self.node.0, self.slot)
  }
}

/// The type of a value; `Void` is a zero-footprint placeholder
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
  Void,
  Tensor(Dims),
}

impl Type {
  pub fn tensor(dims: &[usize]) -> Self {
    Type::Tensor(Dims::from_slice(dims))
  }

  #[inline]
  pub fn dims(&self) -> &[usize] {
    match self {
      Type::Void => &[],
      Type::Tensor(dims) => dims,
    }
  }

  #[inline]
  pub fn rank(&self) -> usize {
    self.dims().len()
  }

  /// Number of elements; zero for `Void`
  #[inline]
  pub fn size(&self) -> usize {
    match self {
      Type::Void => 0,
      Type::Tensor(dims) => dims.iter().product(),
    }
  }

  #[inline]
  pub fn is_void(&self) -> bool {
    matches!(self, Type::Void)
  }
}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Type::Void => f.write_str("void"),
      Type::Tensor(dims) => {
        f.write_str("<")?;
        for (i, d) in dims.iter().enumerate() {
          if i > 0 {
            f.write_str(" x ")?;
          }
          write!(f, "{d}")?;
        }
        f.write_str(">")
      }
    }
  }
}

/// How the execution layer fills a variable before the first run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitKind {
  /// Supplied by the caller (inputs, outputs, labels)
  Extern,
  /// Every element set to the payload
  Broadcast(f32),
  /// Xavier initialization with the payload as fan-in
  Xavier(f32),
}

/// A graph leaf holding a tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Variable {
  pub trainable: bool,
  pub init: InitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticMode {
  Add,
  Sub,
  Mul,
  Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
  Max,
  Avg,
}

/// Dense kernels; each one ships a closed-form adjoint in the execution layer,
/// so the backward graph only needs to wire a matching `Op::KernelGrad`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
  /// inputs: [input (NHWC), filter, bias]
  Convolution {
    kernel: usize,
    stride: usize,
    pad: usize,
    depth: usize,
  },
  /// inputs: [input (NHWC)]
  Pool {
    mode: PoolMode,
    kernel: usize,
    stride: usize,
    pad: usize,
  },
  /// inputs: [input, weights, bias]
  FullyConnected { depth: usize },
  /// inputs: [input, scale, bias, mean, variance]
  BatchNormalization {
    channel: usize,
    epsilon: f32,
    momentum: f32,
  },
  /// inputs: [input]
  LocalResponseNormalization {
    half_window: usize,
    alpha: f32,
    beta: f32,
    k: f32,
  },
  /// inputs: [input, selected]
  SoftMax,
  /// inputs: [input, expected]
  Regression,
  /// inputs: [lhs, rhs]
  Arithmetic(ArithmeticMode),
  Relu,
  Sigmoid,
  Tanh,
}

impl Kernel {
  pub fn name(&self) -> &'static str {
    match self {
      Kernel::Convolution { .. } => "Convolution",
      Kernel::Pool { .. } => "Pool",
      Kernel::FullyConnected { .. } => "FullyConnected",
      Kernel::BatchNormalization { .. } => "BatchNormalization",
      Kernel::LocalResponseNormalization { .. } => "LocalResponseNormalization",
      Kernel::SoftMax => "SoftMax",
      Kernel::Regression => "Regression",
      Kernel::Arithmetic(_) => "Arithmetic",
      Kernel::Relu => "Relu",
      Kernel::Sigmoid => "Sigmoid",
      Kernel::Tanh => "Tanh",
    }
  }

  pub fn grad_name(&self) -> &'static str {
    match self {
      Kernel::Convolution { .. } => "ConvolutionGrad",
      Kernel::Pool { .. } => "PoolGrad",
      Kernel::FullyConnected { .. } => "FullyConnectedGrad",
      Kernel::BatchNormalization { .. } => "BatchNormalizationGrad",
      Kernel::LocalResponseNormalization { .. } => "LocalResponseNormalizationGrad",
      Kernel::SoftMax => "SoftMaxGrad",
      Kernel::Regression => "RegressionGrad",
      Kernel::Arithmetic(_) => "ArithmeticGrad",
      Kernel::Relu => "ReluGrad",
      Kernel::Sigmoid => "SigmoidGrad",
      Kernel::Tanh => "TanhGrad",
    }
  }
}

/// Hyperparameters baked into an update node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdParams {
  pub l1_decay: f32,
  pub l2_decay: f32,
  pub learning_rate: f32,
  pub momentum: f32,
  pub batch_size: usize,
}

/// Operator kinds, with their kind-specific attributes
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
  Variable(Variable),
  Kernel(Kernel),
  /// inputs: [input, output variable]; terminal, no results
  Save,
  /// target extents are the node's result type
  Reshape,
  Transpose {
    shuffle: Shuffle,
  },
  /// extract a sub-tensor shaped like the result at `start`
  Slice {
    start: Dims,
  },
  /// stack the inputs along `dim`
  Concat {
    dim: usize,
  },

  // kinds below only ever appear in generated backward graphs...
  Zero,
  Splat {
    value: f32,
  },
  /// inputs: [big, small]; adds `small` into `big` at `start`
  InsertTensor {
    start: Dims,
  },
  /// inputs: forward inputs ++ forward results ++ result gradients; one
  /// result per forward input
  KernelGrad(Kernel),
  /// inputs: [gradient, parameter, accumulator]; updates the parameter in place
  Sgd(SgdParams),
}

impl Op {
  pub fn kind(&self) -> &'static str {
    match self {
      Op::Variable(_) => "Variable",
      Op::Kernel(kernel) => kernel.name(),
      Op::Save => "Save",
      Op::Reshape => "Reshape",
      Op::Transpose { .. } => "Transpose",
      Op::Slice { .. } => "Slice",
      Op::Concat { .. } => "Concat",
      Op::Zero => "Zero",
      Op::Splat { .. } => "Splat",
      Op::InsertTensor { .. } => "InsertTensor",
      Op::KernelGrad(kernel) => kernel.grad_name(),
      Op::Sgd(_) => "Sgd",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  name: String,
  op: Op,
  inputs: SmallVec<[Value; 4]>,
  outputs: SmallVec<[Type; 1]>,
}

impl Node {
  pub fn new<I, O>(name: impl Into<String>, op: Op, inputs: I, outputs: O) -> Self
  where
    I: IntoIterator<Item = Value>,
    O: IntoIterator<Item = Type>,
  {
    Self {
      name: name.into(),
      op,
      inputs: inputs.into_iter().collect(),
      outputs: outputs.into_iter().collect(),
    }
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[inline]
  pub fn op(&self) -> &Op {
    &self.op
  }

  #[inline]
  pub fn kind(&self) -> &'static str {
    self.op.kind()
  }

  #[inline]
  pub fn inputs(&self) -> &[Value] {
    &self.inputs
  }

  #[inline]
  pub fn outputs(&self) -> &[Type] {
    &self.outputs
  }

  #[inline]
  pub fn is_variable(&self) -> bool {
    matches!(self.op, Op::Variable(_))
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
  #[error("node `{node}`: expected {expected}, found {found}")]
  ShapeMismatch {
    node: String,
    expected: Type,
    found: Type,
  },

  #[error("node `{node}`: expected a rank {expected} operand, found rank {found}")]
  RankMismatch {
    node: String,
    expected: usize,
    found: usize,
  },

  #[error("node `{node}`: {shuffle:?} is not a permutation of {rank} axes")]
  InvalidPermutation {
    node: String,
    shuffle: Vec<usize>,
    rank: usize,
  },

  #[error("node `{node}`: a {dims:?} slice at {start:?} does not fit in {input}")]
  SliceOutOfBounds {
    node: String,
    start: Vec<usize>,
    dims: Vec<usize>,
    input: Type,
  },

  #[error("node `{node}`: dimension {dim} is out of range for rank {rank}")]
  InvalidDimension {
    node: String,
    dim: usize,
    rank: usize,
  },

  #[error("node `{node}`: cannot reshape {from} elements into {to}")]
  ElementCount {
    node: String,
    from: usize,
    to: usize,
  },

  #[error("node `{node}`: window {kernel} (stride {stride}, pad {pad}) does not fit {extent}")]
  InvalidWindow {
    node: String,
    kernel: usize,
    stride: usize,
    pad: usize,
    extent: usize,
  },

  #[error("node `{node}`: expected {expected} operands, found {found}")]
  Arity {
    node: String,
    expected: usize,
    found: usize,
  },

  #[error("{value} does not name an output of this graph")]
  UnknownValue { value: Value },
}

pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Check that `shuffle` is a permutation of `0..rank`
pub fn check_permutation(node: &str, shuffle: &[usize], rank: usize) -> Result<()> {
  let invalid = || GraphError::InvalidPermutation {
    node: node.to_owned(),
    shuffle: shuffle.to_vec(),
    rank,
  };
  if shuffle.len() != rank {
    return Err(invalid());
  }
  let mut seen: SmallVec<[bool; 6]> = smallvec![false; rank];
  for &axis in shuffle {
    if axis >= rank || seen[axis] {
      return Err(invalid());
    }
    seen[axis] = true;
  }
  Ok(())
}

fn check_arity(node: &Node, expected: usize) -> Result<()> {
  if node.inputs.len() != expected {
    return Err(GraphError::Arity {
      node: node.name.clone(),
      expected,
      found: node.inputs.len(),
    });
  }
  Ok(())
}

fn check_rank(node: &str, ty: &Type, expected: usize) -> Result<()> {
  if ty.rank() != expected {
    return Err(GraphError::RankMismatch {
      node: node.to_owned(),
      expected,
      found: ty.rank(),
    });
  }
  Ok(())
}

fn check_same(node: &str, expected: &Type, found: &Type) -> Result<()> {
  if expected != found {
    return Err(GraphError::ShapeMismatch {
      node: node.to_owned(),
      expected: expected.clone(),
      found: found.clone(),
    });
  }
  Ok(())
}

fn check_slice(node: &str, input: &Type, start: &[usize], dims: &[usize]) -> Result<()> {
  let fits = start.len() == input.rank()
    && dims.len() == input.rank()
    && input
      .dims()
      .iter()
      .zip(start.iter().zip(dims))
      .all(|(&extent, (&s, &d))| s + d <= extent);
  if !fits {
    return Err(GraphError::SliceOutOfBounds {
      node: node.to_owned(),
      start: start.to_vec(),
      dims: dims.to_vec(),
      input: input.clone(),
    });
  }
  Ok(())
}

fn transposed(input: &Type, shuffle: &[usize]) -> Type {
  let dims = input.dims();
  Type::Tensor(shuffle.iter().map(|&axis| dims[axis]).collect())
}

fn concatenated(node: &str, inputs: &[&Type], dim: usize) -> Result<Type> {
  let first = match inputs.first() {
    Some(first) => *first,
    None => {
      return Err(GraphError::Arity {
        node: node.to_owned(),
        expected: 1,
        found: 0,
      })
    }
  };
  if dim >= first.rank() {
    return Err(GraphError::InvalidDimension {
      node: node.to_owned(),
      dim,
      rank: first.rank(),
    });
  }
  let mut dims = Dims::from_slice(first.dims());
  for ty in &inputs[1..] {
    // every extent but the stacked one must line up with the first operand...
    let mut expected = dims.clone();
    expected[dim] = ty.dims().get(dim).copied().unwrap_or(0);
    check_same(node, &Type::Tensor(expected), ty)?;
    dims[dim] += ty.dims()[dim];
  }
  Ok(Type::Tensor(dims))
}

fn window(node: &str, extent: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
  if stride == 0 || kernel == 0 || extent + 2 * pad < kernel {
    return Err(GraphError::InvalidWindow {
      node: node.to_owned(),
      kernel,
      stride,
      pad,
      extent,
    });
  }
  Ok((extent + 2 * pad - kernel) / stride + 1)
}

/// A static, append-only graph of tensor operators
#[derive(Debug, Clone, Default)]
pub struct Graph {
  nodes: Vec<Node>,
  variables: Vec<NodeId>,
  saves: Vec<NodeId>,
  gradient_vars: FxHashMap<NodeId, NodeId>,
  gradient_holders: FxHashSet<NodeId>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  #[inline]
  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
    self
      .nodes
      .iter()
      .enumerate()
      .map(|(i, node)| (NodeId::new(i), node))
  }

  #[inline]
  pub fn node(&self, id: NodeId) -> Option<&Node> {
    self.nodes.get(id.index())
  }

  /// Every variable, in the order they were added
  #[inline]
  pub fn variables(&self) -> &[NodeId] {
    &self.variables
  }

  /// Every save node, in the order they were added
  #[inline]
  pub fn saves(&self) -> &[NodeId] {
    &self.saves
  }

  /// The id the next added node will receive
  #[inline]
  pub fn next_id(&self) -> NodeId {
    NodeId::new(self.nodes.len())
  }

  pub fn ty(&self, value: Value) -> Result<&Type> {
    self
      .node(value.node())
      .and_then(|node| node.outputs.get(value.slot()))
      .ok_or(GraphError::UnknownValue { value })
  }

  /// The variable a save node writes into
  pub fn save_output(&self, save: NodeId) -> Option<Value> {
    match self.node(save) {
      Some(node) if matches!(node.op, Op::Save) => node.inputs.get(1).copied(),
      _ => None,
    }
  }

  /// Append a node as is; builders below validate before calling this
  pub fn add_node(&mut self, node: Node) -> NodeId {
    let id = self.next_id();
    match node.op {
      Op::Variable(_) => self.variables.push(id),
      Op::Save => self.saves.push(id),
      _ => {}
    }
    self.nodes.push(node);
    id
  }

  /// Append nodes in order, returning the index range they occupy
  pub fn append<I>(&mut self, nodes: I) -> Range<usize>
  where
    I: IntoIterator<Item = Node>,
  {
    let start = self.nodes.len();
    for node in nodes {
      self.add_node(node);
    }
    start..self.nodes.len()
  }

  /// The variable holding the last gradient of `var`, if one was recorded
  pub fn gradient_variable(&self, var: NodeId) -> Option<NodeId> {
    self.gradient_vars.get(&var).copied()
  }

  /// Record `grad` as the variable holding the gradient of `var`; earlier
  /// holders of `var` keep being reported by `is_gradient_variable`
  pub fn add_gradient_variable(&mut self, var: NodeId, grad: NodeId) {
    self.gradient_vars.insert(var, grad);
    self.gradient_holders.insert(grad);
  }

  /// Whether `id` was ever recorded as a gradient holder
  #[inline]
  pub fn is_gradient_variable(&self, id: NodeId) -> bool {
    self.gradient_holders.contains(&id)
  }

  /// Check the shape attributes of a reshape/transpose/slice/concat/save node
  /// against its operands; other kinds are trusted to their builders
  pub fn verify_node(&self, id: NodeId) -> Result<()> {
    let node = self.node(id).ok_or(GraphError::UnknownValue { value: id.result() })?;
    let name = node.name();
    let output = || {
      node.outputs.first().ok_or(GraphError::Arity {
        node: node.name.clone(),
        expected: 1,
        found: 0,
      })
    };

    match &node.op {
      Op::Save => check_arity(node, 2),
      Op::Reshape => {
        check_arity(node, 1)?;
        let input = self.ty(node.inputs[0])?;
        let output = output()?;
        if input.size() != output.size() {
          return Err(GraphError::ElementCount {
            node: name.to_owned(),
            from: input.size(),
            to: output.size(),
          });
        }
        Ok(())
      }
      Op::Transpose { shuffle } => {
        check_arity(node, 1)?;
        let input = self.ty(node.inputs[0])?;
        check_permutation(name, shuffle, input.rank())?;
        check_same(name, &transposed(input, shuffle), output()?)
      }
      Op::Slice { start } => {
        check_arity(node, 1)?;
        let input = self.ty(node.inputs[0])?;
        check_slice(name, input, start, output()?.dims())
      }
      Op::Concat { dim } => {
        let inputs = node
          .inputs
          .iter()
          .map(|&v| self.ty(v))
          .collect::<Result<SmallVec<[&Type; 4]>>>()?;
        let expected = concatenated(name, &inputs, *dim)?;
        check_same(name, &expected, output()?)
      }
      _ => Ok(()),
    }
  }

  pub fn create_variable(
    &mut self,
    name: impl Into<String>,
    dims: &[usize],
    init: InitKind,
    trainable: bool,
  ) -> Value {
    let node = Node::new(
      name,
      Op::Variable(Variable { trainable, init }),
      [],
      [Type::tensor(dims)],
    );
    self.add_node(node).result()
  }

  /// Save `input` into a fresh extern variable of the same name
  pub fn create_save(&mut self, name: &str, input: Value) -> Result<NodeId> {
    let ty = self.ty(input)?.clone();
    let output = self.add_node(Node::new(
      name,
      Op::Variable(Variable {
        trainable: false,
        init: InitKind::Extern,
      }),
      [],
      [ty],
    ));
    Ok(self.add_node(Node::new(name, Op::Save, [input, output.result()], [])))
  }

  pub fn create_reshape(&mut self, name: &str, input: Value, dims: &[usize]) -> Result<Value> {
    let from = self.ty(input)?.size();
    let to = dims.iter().product::<usize>();
    if from != to {
      return Err(GraphError::ElementCount {
        node: name.to_owned(),
        from,
        to,
      });
    }
    let node = Node::new(name, Op::Reshape, [input], [Type::tensor(dims)]);
    Ok(self.add_node(node).result())
  }

  pub fn create_transpose(&mut self, name: &str, input: Value, shuffle: &[usize]) -> Result<Value> {
    let ty = self.ty(input)?;
    check_permutation(name, shuffle, ty.rank())?;
    let output = transposed(ty, shuffle);
    let op = Op::Transpose {
      shuffle: Shuffle::from_slice(shuffle),
    };
    Ok(self.add_node(Node::new(name, op, [input], [output])).result())
  }

  pub fn create_slice(
    &mut self,
    name: &str,
    input: Value,
    start: &[usize],
    dims: &[usize],
  ) -> Result<Value> {
    check_slice(name, self.ty(input)?, start, dims)?;
    let op = Op::Slice {
      start: Dims::from_slice(start),
    };
    let node = Node::new(name, op, [input], [Type::tensor(dims)]);
    Ok(self.add_node(node).result())
  }

  pub fn create_concat(&mut self, name: &str, inputs: &[Value], dim: usize) -> Result<Value> {
    let output = {
      let types = inputs
        .iter()
        .map(|&v| self.ty(v))
        .collect::<Result<SmallVec<[&Type; 4]>>>()?;
      concatenated(name, &types, dim)?
    };
    let node = Node::new(name, Op::Concat { dim }, inputs.iter().copied(), [output]);
    Ok(self.add_node(node).result())
  }

  pub fn create_arithmetic(
    &mut self,
    name: &str,
    lhs: Value,
    rhs: Value,
    mode: ArithmeticMode,
  ) -> Result<Value> {
    let ty = self.ty(lhs)?.clone();
    check_same(name, &ty, self.ty(rhs)?)?;
    let op = Op::Kernel(Kernel::Arithmetic(mode));
    Ok(self.add_node(Node::new(name, op, [lhs, rhs], [ty])).result())
  }

  pub fn create_relu(&mut self, name: &str, input: Value) -> Result<Value> {
    self.elementwise(name, input, Kernel::Relu)
  }

  pub fn create_sigmoid(&mut self, name: &str, input: Value) -> Result<Value> {
    self.elementwise(name, input, Kernel::Sigmoid)
  }

  pub fn create_tanh(&mut self, name: &str, input: Value) -> Result<Value> {
    self.elementwise(name, input, Kernel::Tanh)
  }

  pub fn create_local_response_normalization(
    &mut self,
    name: &str,
    input: Value,
    half_window: usize,
    alpha: f32,
    beta: f32,
    k: f32,
  ) -> Result<Value> {
    let kernel = Kernel::LocalResponseNormalization {
      half_window,
      alpha,
      beta,
      k,
    };
    self.elementwise(name, input, kernel)
  }

  fn elementwise(&mut self, name: &str, input: Value, kernel: Kernel) -> Result<Value> {
    let ty = self.ty(input)?.clone();
    let node = Node::new(name, Op::Kernel(kernel), [input], [ty]);
    Ok(self.add_node(node).result())
  }

  /// `input` is flattened to `[batch, rest]`; creates trainable weights and bias
  pub fn create_fully_connected(
    &mut self,
    name: &str,
    input: Value,
    depth: usize,
  ) -> Result<Value> {
    let ty = self.ty(input)?;
    if ty.rank() < 2 {
      return Err(GraphError::RankMismatch {
        node: name.to_owned(),
        expected: 2,
        found: ty.rank(),
      });
    }
    let batch = ty.dims()[0];
    let fan_in = ty.size() / batch.max(1);

    let weights = self.create_variable(
      format!("{name}.weights"),
      &[fan_in, depth],
      InitKind::Xavier(fan_in as f32),
      true,
    );
    let bias_init = InitKind::Broadcast(0.1);
    let bias = self.create_variable(format!("{name}.bias"), &[depth], bias_init, true);

    let node = Node::new(
      name,
      Op::Kernel(Kernel::FullyConnected { depth }),
      [input, weights, bias],
      [Type::tensor(&[batch, depth])],
    );
    Ok(self.add_node(node).result())
  }

  /// NHWC convolution; creates a trainable filter and bias
  pub fn create_convolution(
    &mut self,
    name: &str,
    input: Value,
    depth: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
  ) -> Result<Value> {
    let ty = self.ty(input)?;
    check_rank(name, ty, 4)?;
    let &[n, h, w, c] = ty.dims() else {
      unreachable!("rank checked above");
    };
    let oh = window(name, h, kernel, stride, pad)?;
    let ow = window(name, w, kernel, stride, pad)?;

    let fan_in = (kernel * kernel * c) as f32;
    let filter = self.create_variable(
      format!("{name}.filter"),
      &[depth, kernel, kernel, c],
      InitKind::Xavier(fan_in),
      true,
    );
    let bias_init = InitKind::Broadcast(0.1);
    let bias = self.create_variable(format!("{name}.bias"), &[depth], bias_init, true);

    let op = Op::Kernel(Kernel::Convolution {
      kernel,
      stride,
      pad,
      depth,
    });
    let node = Node::new(name, op, [input, filter, bias], [Type::tensor(&[n, oh, ow, depth])]);
    Ok(self.add_node(node).result())
  }

  /// NHWC pooling
  pub fn create_pool(
    &mut self,
    name: &str,
    input: Value,
    mode: PoolMode,
    kernel: usize,
    stride: usize,
    pad: usize,
  ) -> Result<Value> {
    let ty = self.ty(input)?;
    check_rank(name, ty, 4)?;
    let &[n, h, w, c] = ty.dims() else {
      unreachable!("rank checked above");
    };
    let oh = window(name, h, kernel, stride, pad)?;
    let ow = window(name, w, kernel, stride, pad)?;

    let op = Op::Kernel(Kernel::Pool {
      mode,
      kernel,
      stride,
      pad,
    });
    let node = Node::new(name, op, [input], [Type::tensor(&[n, oh, ow, c])]);
    Ok(self.add_node(node).result())
  }

  /// Creates trainable scale/bias and non-trainable running mean/variance,
  /// all sized by the extent of `channel`
  pub fn create_batch_normalization(
    &mut self,
    name: &str,
    input: Value,
    channel: usize,
    epsilon: f32,
    momentum: f32,
  ) -> Result<Value> {
    let ty = self.ty(input)?.clone();
    let channels = match ty.dims().get(channel) {
      Some(&c) => c,
      None => {
        return Err(GraphError::InvalidDimension {
          node: name.to_owned(),
          dim: channel,
          rank: ty.rank(),
        })
      }
    };

    let (one, zero) = (InitKind::Broadcast(1.0), InitKind::Broadcast(0.0));
    let scale = self.create_variable(format!("{name}.scale"), &[channels], one, true);
    let bias = self.create_variable(format!("{name}.bias"), &[channels], zero, true);
    // running statistics are updated by the kernel itself, not by SGD
    let mean = self.create_variable(format!("{name}.mean"), &[channels], zero, false);
    let var = self.create_variable(format!("{name}.var"), &[channels], zero, false);

    let op = Op::Kernel(Kernel::BatchNormalization {
      channel,
      epsilon,
      momentum,
    });
    let node = Node::new(name, op, [input, scale, bias, mean, var], [ty]);
    Ok(self.add_node(node).result())
  }

  /// `input` is `[batch, classes]`, `selected` is `[batch, 1]`
  pub fn create_softmax(&mut self, name: &str, input: Value, selected: Value) -> Result<Value> {
    let ty = self.ty(input)?.clone();
    check_rank(name, &ty, 2)?;
    check_same(name, &Type::tensor(&[ty.dims()[0], 1]), self.ty(selected)?)?;
    let node = Node::new(name, Op::Kernel(Kernel::SoftMax), [input, selected], [ty]);
    Ok(self.add_node(node).result())
  }

  pub fn create_regression(&mut self, name: &str, input: Value, expected: Value) -> Result<Value> {
    let ty = self.ty(input)?.clone();
    check_same(name, &ty, self.ty(expected)?)?;
    let node = Node::new(name, Op::Kernel(Kernel::Regression), [input, expected], [ty]);
    Ok(self.add_node(node).result())
  }
}

impl Index<NodeId> for Graph {
  type Output = Node;

  #[inline]
  fn index(&self, id: NodeId) -> &Self::Output {
    &self.nodes[id.index()]
  }
}

impl fmt::Display for Graph {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (id, node) in self.iter() {
      write!(f, "{id} {} = {}(", node.name, node.kind())?;
      for (i, input) in node.inputs.iter().enumerate() {
        if i > 0 {
          f.write_str(", ")?;
        }
        write!(f, "{input}")?;
      }
      f.write_str(")")?;
      for (i, ty) in node.outputs.iter().enumerate() {
        f.write_str(if i == 0 { " : " } else { ", " })?;
        write!(f, "{ty}")?;
      }
      writeln!(f)?;
    }
    Ok(())
  }
}
