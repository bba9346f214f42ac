//!
//! # gradgen-core
//!
//! Reverse-mode differentiation of a static forward graph.
//!
//! Given a finished forward graph, [`generate`] synthesizes its backward graph:
//! one adjoint rule per forward node, gradient accumulation across fan-out, and
//! one SGD update node per trainable variable...
//!
//! ## Invariants
//!
//! 1. Nodes are differentiated in reverse post-order, so every consumer of a
//!    value has contributed its gradient before the producer's rule reads it
//! 2. A value holds at most one gradient; further contributions are summed into
//!    a fresh node that replaces the entry
//! 3. The forward graph is append-only, and nothing is appended unless the whole
//!    pass succeeds
//!

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::ops::Range;

use bit_set::BitSet;

use rustc_hash::FxHashMap;

use smallvec::{smallvec, SmallVec};

use thiserror::Error;

use lib_gradgen_graph::{
  ArithmeticMode, Dims, Graph, GraphError, InitKind, Kernel, Node, NodeId, Op, SgdParams,
  Shuffle, Type, Value, Variable,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GradError {
  /// The node kind has no adjoint rule; the forward builder produced
  /// something it should not have
  #[error("node `{name}` ({kind}) at {node} has no adjoint rule")]
  UnsupportedOperator {
    node: NodeId,
    name: String,
    kind: &'static str,
  },

  /// A rule asked for the gradient of a value nobody contributed to
  #[error("no gradient was accumulated for {value}")]
  MissingGradient { value: Value },

  #[error("node `{name}` at {node} is malformed")]
  Malformed {
    node: NodeId,
    name: String,
    #[source]
    source: GraphError,
  },

  #[error("invalid training configuration: {0}")]
  InvalidConfig(String),

  #[error(transparent)]
  Graph(#[from] GraphError),
}

fn malformed(id: NodeId, node: &Node) -> impl FnOnce(GraphError) -> GradError + '_ {
  move |source| GradError::Malformed {
    node: id,
    name: node.name().to_owned(),
    source,
  }
}

/// Hyperparameters for one generation call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingConfig {
  pub learning_rate: f32,
  /// Velocity decay, in [0, 1); zero disables the velocity buffer
  pub momentum: f32,
  pub l1_decay: f32,
  pub l2_decay: f32,
  /// Gradients are divided by this before the step
  pub batch_size: usize,
}

impl Default for TrainingConfig {
  fn default() -> Self {
    Self {
      learning_rate: 0.01,
      momentum: 0.0,
      l1_decay: 0.0,
      l2_decay: 0.0,
      batch_size: 1,
    }
  }
}

impl TrainingConfig {
  pub fn validate(&self) -> Result<(), GradError> {
    let invalid = |msg: String| Err(GradError::InvalidConfig(msg));
    // a zero step freezes every parameter
    if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
      return invalid(format!(
        "learning rate must be non-negative, got {}",
        self.learning_rate
      ));
    }
    if !(0.0..1.0).contains(&self.momentum) {
      return invalid(format!("momentum must lie in [0, 1), got {}", self.momentum));
    }
    for (name, decay) in [("L1", self.l1_decay), ("L2", self.l2_decay)] {
      if !decay.is_finite() || decay < 0.0 {
        return invalid(format!("{name} decay must be non-negative, got {decay}"));
      }
    }
    if self.batch_size == 0 {
      return invalid("batch size must be at least 1".to_owned());
    }
    Ok(())
  }

  fn sgd_params(&self) -> SgdParams {
    SgdParams {
      l1_decay: self.l1_decay,
      l2_decay: self.l2_decay,
      learning_rate: self.learning_rate,
      momentum: self.momentum,
      batch_size: self.batch_size,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
  #[default]
  Train,
  /// Train, and also save every variable's accumulated gradient
  TrainDebug,
}

/// What a save node feeds back as the gradient of its input
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Seed {
  /// A zero tensor; a non-zero seed must then be injected upstream
  #[default]
  Zero,
  /// Every element set to the payload, e.g. 1.0 for a scalar loss
  Splat(f32),
}

/// We know how big of a hashmap we want to store our gradients in, but we cant
/// create a map with a given capacity since we need to supply the hasher too...
trait HashMapExt {
  fn with_capacity(x: usize) -> Self;
}

/// Just specialize with_capacity for those maps who have a default hasher...
impl<K, V, S> HashMapExt for HashMap<K, V, S>
where
  K: Hash + Eq,
  S: BuildHasher + Default,
{
  fn with_capacity(capacity: usize) -> Self {
    HashMap::with_capacity_and_hasher(capacity, S::default())
  }
}

/// Nodes staged by one pass, in creation order.
///
/// Staged ids continue where the graph's own ids stop, so committing is just
/// an in-order append and every staged `Value` stays valid afterwards
#[derive(Debug)]
pub struct Scratch<'g> {
  graph: &'g Graph,
  nodes: Vec<Node>,
}

impl<'g> Scratch<'g> {
  pub fn new(graph: &'g Graph) -> Self {
    Self {
      graph,
      nodes: Vec::new(),
    }
  }

  #[inline]
  pub fn push(&mut self, node: Node) -> NodeId {
    let id = NodeId::new(self.graph.len() + self.nodes.len());
    self.nodes.push(node);
    id
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

  /// Look up a node in the graph or, failing that, among the staged ones
  pub fn node(&self, id: NodeId) -> Option<&Node> {
    match id.index().checked_sub(self.graph.len()) {
      None => self.graph.node(id),
      Some(staged) => self.nodes.get(staged),
    }
  }

  pub fn ty(&self, value: Value) -> Result<&Type, GraphError> {
    self
      .node(value.node())
      .and_then(|node| node.outputs().get(value.slot()))
      .ok_or(GraphError::UnknownValue { value })
  }

  fn into_nodes(self) -> Vec<Node> {
    self.nodes
  }
}

/// Forward value -> its currently accumulated gradient
#[derive(Debug, Clone, Default)]
pub struct GradMap {
  grads: FxHashMap<Value, Value>,
}

impl GradMap {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_capacity(capacity: usize) -> Self {
    Self {
      grads: FxHashMap::with_capacity(capacity),
    }
  }

  /// Register `grad` as a contribution to the gradient of `value`.
  ///
  /// The first contribution is registered as is; later ones stage an
  /// elementwise sum of the current entry and `grad` and point the entry at
  /// the sum. The previous entry is kept alive as the sum's operand
  pub fn add_gradient(
    &mut self,
    scratch: &mut Scratch<'_>,
    value: Value,
    grad: Value,
  ) -> Result<(), GradError> {
    let current = match self.grads.get(&value) {
      Some(&current) => current,
      None => {
        log::trace!("{value} <- {grad}");
        self.grads.insert(value, grad);
        return Ok(());
      }
    };

    let ty = scratch.ty(value)?.clone();
    let sum = scratch.push(Node::new(
      "updateGrad",
      Op::Kernel(Kernel::Arithmetic(ArithmeticMode::Add)),
      [current, grad],
      [ty],
    ));
    log::trace!("{value} <- {current} + {grad}");
    self.grads.insert(value, sum.result());
    Ok(())
  }

  #[inline]
  pub fn has_gradient(&self, value: Value) -> bool {
    self.grads.contains_key(&value)
  }

  /// The fully accumulated gradient of `value`; asking for one that was never
  /// contributed is an error, never an implicit zero
  #[inline]
  pub fn gradient(&self, value: Value) -> Result<Value, GradError> {
    self
      .grads
      .get(&value)
      .copied()
      .ok_or(GradError::MissingGradient { value })
  }

  #[inline]
  pub fn get(&self, value: Value) -> Option<Value> {
    self.grads.get(&value).copied()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.grads.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.grads.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
    self.grads.iter().map(|(&value, &grad)| (value, grad))
  }
}

/// Post-order over everything reachable from the graph's roots: every
/// variable, then every save node that is not a recorded gradient save
pub fn post_order(graph: &Graph) -> Vec<NodeId> {
  // gradient saves read backward values, they are not forward outputs
  let saves = graph.saves().iter().copied().filter(|&save| {
    !graph
      .save_output(save)
      .is_some_and(|output| graph.is_gradient_variable(output.node()))
  });
  let roots = graph.variables().iter().copied().chain(saves);
  post_order_from(graph, roots)
}

/// Post-order over everything reachable from `roots`; each node appears once,
/// after all of its inputs
pub fn post_order_from<I>(graph: &Graph, roots: I) -> Vec<NodeId>
where
  I: IntoIterator<Item = NodeId>,
{
  let mut stack = Vec::with_capacity(64);
  let mut result = Vec::with_capacity(graph.len());
  // a NodeId is just an index, so we can use a bitset...
  let mut visited = BitSet::with_capacity(graph.len());

  for root in roots {
    stack.push((root, false));

    // linear dfs, the recursive version blows the stack on deep nets...
    while let Some((id, children_processed)) = stack.pop() {
      if children_processed {
        result.push(id);
      } else if visited.insert(id.index()) {
        let node = match graph.node(id) {
          Some(node) => node,
          None => continue,
        };
        // marker to add node after children
        stack.push((id, true));
        // pushed in reverse, so inputs are explored in operand order
        for input in node.inputs().iter().rev() {
          if !visited.contains(input.node().index()) {
            stack.push((input.node(), false));
          }
        }
      }
    }
  }

  result
}

/// Inverse of an axis permutation, `reverse[shuffle[i]] == i`; `None` when
/// `shuffle` is not a permutation
pub fn inverse_permutation(shuffle: &[usize]) -> Option<Shuffle> {
  let mut reverse: Shuffle = smallvec![usize::MAX; shuffle.len()];
  for (i, &axis) in shuffle.iter().enumerate() {
    let slot = reverse.get_mut(axis)?;
    if *slot != usize::MAX {
      return None;
    }
    *slot = i;
  }
  Some(reverse)
}

/// Everything one pass staged, detached from the graph borrow
struct Staged {
  nodes: Vec<Node>,
  updates: Vec<NodeId>,
  accumulators: Vec<NodeId>,
  gradient_vars: Vec<(NodeId, NodeId)>,
  gradients: GradMap,
}

struct Pass<'g> {
  graph: &'g Graph,
  seed: Seed,
  grads: GradMap,
  scratch: Scratch<'g>,
  updates: Vec<NodeId>,
  accumulators: Vec<NodeId>,
  gradient_vars: Vec<(NodeId, NodeId)>,
}

impl<'g> Pass<'g> {
  fn new(graph: &'g Graph, seed: Seed) -> Self {
    Self {
      graph,
      seed,
      grads: GradMap::with_capacity(graph.len()),
      scratch: Scratch::new(graph),
      updates: Vec::new(),
      accumulators: Vec::new(),
      gradient_vars: Vec::new(),
    }
  }

  #[inline]
  fn accumulate(&mut self, value: Value, grad: Value) -> Result<(), GradError> {
    self.grads.add_gradient(&mut self.scratch, value, grad)
  }

  /// Apply the adjoint rule of `id`; its results must already hold their
  /// final gradients
  fn differentiate(&mut self, id: NodeId) -> Result<(), GradError> {
    let graph = self.graph;
    let node = &graph[id];
    log::debug!("differentiating `{}` ({}) at {id}", node.name(), node.kind());

    match node.op() {
      // leaves only ever receive gradients
      Op::Variable(_) => Ok(()),
      Op::Kernel(kernel) => self.kernel(id, node, *kernel),
      Op::Save => self.save(id, node),
      Op::Reshape => self.reshape(id, node),
      Op::Transpose { shuffle } => self.transpose(id, node, shuffle),
      Op::Slice { start } => self.slice(id, node, start),
      Op::Concat { dim } => self.concat(id, node, *dim),
      Op::Zero | Op::Splat { .. } | Op::InsertTensor { .. } | Op::KernelGrad(_) | Op::Sgd(_) => {
        Err(GradError::UnsupportedOperator {
          node: id,
          name: node.name().to_owned(),
          kind: node.kind(),
        })
      }
    }
  }

  /// Dense kernels carry their own adjoint; wire up a `KernelGrad` that sees
  /// the forward operands, the forward results and the result gradients, and
  /// yields one gradient per operand
  fn kernel(&mut self, id: NodeId, node: &'g Node, kernel: Kernel) -> Result<(), GradError> {
    let graph = self.graph;
    let results: SmallVec<[Value; 2]> = (0..node.outputs().len())
      .map(|slot| Value::new(id, slot))
      .collect();

    let mut inputs: SmallVec<[Value; 8]> = node.inputs().iter().copied().collect();
    inputs.extend(results.iter().copied());
    for &result in &results {
      inputs.push(self.grads.gradient(result)?);
    }

    let outputs = node
      .inputs()
      .iter()
      .map(|&operand| graph.ty(operand).cloned())
      .collect::<Result<SmallVec<[Type; 4]>, _>>()
      .map_err(malformed(id, node))?;

    let grad = self.scratch.push(Node::new(
      format!("{}.grad", node.name()),
      Op::KernelGrad(kernel),
      inputs,
      outputs,
    ));
    for (slot, &operand) in node.inputs().iter().enumerate() {
      self.accumulate(operand, Value::new(grad, slot))?;
    }
    Ok(())
  }

  /// Backprop starts here: the seed becomes the gradient of both the saved
  /// value and the variable it is saved into
  fn save(&mut self, id: NodeId, node: &'g Node) -> Result<(), GradError> {
    let graph = self.graph;
    graph.verify_node(id).map_err(malformed(id, node))?;
    let (input, output) = (node.inputs()[0], node.inputs()[1]);
    let ty = graph.ty(input).map_err(malformed(id, node))?.clone();

    let op = match self.seed {
      Seed::Zero => Op::Zero,
      Seed::Splat(value) => Op::Splat { value },
    };
    let seed = self.scratch.push(Node::new(node.name(), op, [], [ty])).result();
    self.accumulate(input, seed)?;
    self.accumulate(output, seed)
  }

  fn reshape(&mut self, id: NodeId, node: &'g Node) -> Result<(), GradError> {
    let graph = self.graph;
    graph.verify_node(id).map_err(malformed(id, node))?;
    let input = node.inputs()[0];
    let ty = graph.ty(input).map_err(malformed(id, node))?.clone();
    let upstream = self.grads.gradient(id.result())?;

    let grad = self.scratch.push(Node::new(node.name(), Op::Reshape, [upstream], [ty]));
    self.accumulate(input, grad.result())
  }

  fn transpose(&mut self, id: NodeId, node: &'g Node, shuffle: &[usize]) -> Result<(), GradError> {
    let graph = self.graph;
    graph.verify_node(id).map_err(malformed(id, node))?;
    let input = node.inputs()[0];
    let ty = graph.ty(input).map_err(malformed(id, node))?.clone();
    let upstream = self.grads.gradient(id.result())?;

    // verified above, so this is always a permutation
    let shuffle = inverse_permutation(shuffle).unwrap_or_default();
    let grad = self.scratch.push(Node::new(
      node.name(),
      Op::Transpose { shuffle },
      [upstream],
      [ty],
    ));
    self.accumulate(input, grad.result())
  }

  /// Scatter the result gradient back into a zero tensor shaped like the
  /// operand, at the offset it was extracted from
  fn slice(&mut self, id: NodeId, node: &'g Node, start: &Dims) -> Result<(), GradError> {
    let graph = self.graph;
    graph.verify_node(id).map_err(malformed(id, node))?;
    let input = node.inputs()[0];
    let ty = graph.ty(input).map_err(malformed(id, node))?.clone();
    let upstream = self.grads.gradient(id.result())?;

    let zero = self.scratch.push(Node::new(
      format!("{}.expand", node.name()),
      Op::Zero,
      [],
      [ty.clone()],
    ));
    let grad = self.scratch.push(Node::new(
      format!("{}.grad", node.name()),
      Op::InsertTensor {
        start: start.clone(),
      },
      [zero.result(), upstream],
      [ty],
    ));
    self.accumulate(input, grad.result())
  }

  /// Split the result gradient: operand `j` gets the slice starting where the
  /// operands before it end along `dim`, shaped like operand `j`
  fn concat(&mut self, id: NodeId, node: &'g Node, dim: usize) -> Result<(), GradError> {
    let graph = self.graph;
    graph.verify_node(id).map_err(malformed(id, node))?;
    let rank = graph.ty(id.result()).map_err(malformed(id, node))?.rank();
    let upstream = self.grads.gradient(id.result())?;

    let mut offsets: Dims = smallvec![0; rank];
    for (j, &operand) in node.inputs().iter().enumerate() {
      let ty = graph.ty(operand).map_err(malformed(id, node))?.clone();
      let extent = ty.dims()[dim];
      let grad = self.scratch.push(Node::new(
        format!("{}.extract{j}", node.name()),
        Op::Slice {
          start: offsets.clone(),
        },
        [upstream],
        [ty],
      ));
      // operands are stacked, so the next one starts after this one...
      offsets[dim] += extent;
      self.accumulate(operand, grad.result())?;
    }
    Ok(())
  }

  /// One SGD node per trainable variable, plus gradient saves in debug mode
  fn updates(&mut self, config: &TrainingConfig, mode: Mode) -> Result<(), GradError> {
    let graph = self.graph;
    let params = config.sgd_params();

    for &var in graph.variables() {
      let node = &graph[var];
      let variable = match node.op() {
        Op::Variable(variable) => variable,
        _ => continue,
      };
      let param = var.result();

      if mode == Mode::TrainDebug && self.grads.has_gradient(param) {
        let grad = self.grads.gradient(param)?;
        let ty = graph.ty(param).map_err(malformed(var, node))?.clone();
        let name = format!("_grad_{}", node.name());
        let holder = self.scratch.push(Node::new(
          name.as_str(),
          Op::Variable(Variable {
            trainable: false,
            init: InitKind::Extern,
          }),
          [],
          [ty],
        ));
        self.scratch.push(Node::new(name, Op::Save, [grad, holder.result()], []));
        self.gradient_vars.push((var, holder));
      }

      if !variable.trainable {
        log::debug!("`{}` is not trainable, skipping its update", node.name());
        continue;
      }

      let grad = self.grads.gradient(param)?;
      let ty = if config.momentum > 0.0 {
        graph.ty(param).map_err(malformed(var, node))?.clone()
      } else {
        Type::Void
      };
      let gsum = self.scratch.push(Node::new(
        format!("{}.gsum", node.name()),
        Op::Variable(Variable {
          trainable: false,
          init: InitKind::Broadcast(0.0),
        }),
        [],
        [ty],
      ));
      let update = self.scratch.push(Node::new(
        node.name(),
        Op::Sgd(params),
        [grad, param, gsum.result()],
        [],
      ));
      self.accumulators.push(gsum);
      self.updates.push(update);
    }
    Ok(())
  }

  fn finish(self) -> Staged {
    Staged {
      nodes: self.scratch.into_nodes(),
      updates: self.updates,
      accumulators: self.accumulators,
      gradient_vars: self.gradient_vars,
      gradients: self.grads,
    }
  }
}

/// What a successful pass appended to the graph
#[derive(Debug, Clone)]
pub struct Generated {
  /// Index range of every appended node
  pub nodes: Range<usize>,
  /// One SGD node per trainable variable, in variable order
  pub updates: Vec<NodeId>,
  /// The velocity buffer of each update, parallel to `updates`
  pub accumulators: Vec<NodeId>,
  /// (variable, variable holding its gradient), debug mode only
  pub gradient_vars: Vec<(NodeId, NodeId)>,
  /// Final gradient of every forward value that received one
  pub gradients: GradMap,
}

impl Generated {
  #[inline]
  pub fn gradient_of(&self, value: Value) -> Option<Value> {
    self.gradients.get(value)
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
    self.nodes.clone().map(NodeId::new)
  }
}

/// Builds the backward graph of a forward graph
#[derive(Debug, Clone, Copy)]
pub struct Generator<'c> {
  config: &'c TrainingConfig,
  mode: Mode,
  seed: Seed,
}

impl<'c> Generator<'c> {
  pub fn new(config: &'c TrainingConfig, mode: Mode) -> Self {
    Self {
      config,
      mode,
      seed: Seed::default(),
    }
  }

  pub fn with_seed(mut self, seed: Seed) -> Self {
    self.seed = seed;
    self
  }

  /// Differentiate `graph` and append the backward graph and update nodes.
  ///
  /// All-or-nothing: on error the graph is left exactly as it was. Calling
  /// this twice appends two independent backward graphs
  pub fn generate(&self, graph: &mut Graph) -> Result<Generated, GradError> {
    self.config.validate()?;

    let base = graph.len();
    let staged = {
      let graph: &Graph = graph;
      let mut pass = Pass::new(graph, self.seed);
      for id in post_order(graph).into_iter().rev() {
        if graph[id].is_variable() {
          continue;
        }
        pass.differentiate(id)?;
      }
      pass.updates(self.config, self.mode)?;
      pass.finish()
    };

    // nothing above touched the graph, commit everything in one go...
    let nodes = graph.append(staged.nodes);
    debug_assert_eq!(nodes.start, base);
    for &(var, grad) in &staged.gradient_vars {
      graph.add_gradient_variable(var, grad);
    }

    log::info!(
      "appended {} backward nodes, {} updates ({:?})",
      nodes.len(),
      staged.updates.len(),
      self.mode
    );

    Ok(Generated {
      nodes,
      updates: staged.updates,
      accumulators: staged.accumulators,
      gradient_vars: staged.gradient_vars,
      gradients: staged.gradients,
    })
  }
}

/// Differentiate `graph` with a zero seed, see [`Generator::generate`]
pub fn generate(
  graph: &mut Graph,
  config: &TrainingConfig,
  mode: Mode,
) -> Result<Generated, GradError> {
  Generator::new(config, mode).generate(graph)
}
