//! A small dataflow IR: nodes live in an arena owned by a [Computation] and are
//! addressed by stable [NodeId]s.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::ops::Index;

use crate::common::{DimSize, Shape};
use crate::literal::Literal;
use crate::shape_inference::{self, ShapeError};
use crate::utils::join_into_string;
use crate::window::{ConvDimensionNumbers, PaddingConfig, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOp {
    Negate,
    Abs,
    Exp,
    Tanh,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ComparisonDirection {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

/// The combiner of a reduction or a scatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Reducer {
    Add,
    Multiply,
    Maximum,
    Minimum,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionParams {
    pub dimension_numbers: ConvDimensionNumbers,
    pub window: Window,
    pub feature_group_count: DimSize,
    pub batch_group_count: DimSize,
}

/// An opcode together with its opcode-specific parameters.
///
/// Operand conventions:
///  - `Select`: `[predicate, on_true, on_false]`.
///  - `Pad`: `[operand, padding_value]`.
///  - `Convolution`: `[activations, kernel]`.
///  - `Reduce` and `ReduceWindow`: `[operand, init_value]`.
///  - `SelectAndScatter`: `[operand, source, init_value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Op {
    Parameter(usize),
    Constant(Literal),
    Unary(UnaryOp),
    Copy,
    /// Converts to the element type of the node's shape.
    Convert,
    Binary(BinaryOp),
    Compare(ComparisonDirection),
    Select,
    /// Operand axis `i` maps to output axis `dimensions[i]`.
    Broadcast {
        dimensions: Vec<usize>,
    },
    Reshape,
    /// Output axis `i` is operand axis `permutation[i]`.
    Transpose {
        permutation: Vec<usize>,
    },
    Pad(PaddingConfig),
    Slice {
        starts: Vec<DimSize>,
        limits: Vec<DimSize>,
        strides: Vec<DimSize>,
    },
    Concatenate {
        dimension: usize,
    },
    Convolution(ConvolutionParams),
    Reduce {
        dimensions: Vec<usize>,
        reducer: Reducer,
    },
    ReduceWindow {
        window: Window,
        reducer: Reducer,
    },
    SelectAndScatter {
        window: Window,
        select: ComparisonDirection,
        scatter: Reducer,
    },
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Unary(op) => write!(f, "{op}"),
            Op::Binary(op) => write!(f, "{op}"),
            Op::Compare(direction) => write!(f, "compare-{direction}"),
            Op::Reduce { reducer, .. } => write!(f, "reduce-{reducer}"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

impl Op {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Op::Unary(_) | Op::Copy | Op::Convert | Op::Binary(_) | Op::Compare(_) | Op::Select
        )
    }

    pub fn is_elementwise_binary(&self) -> bool {
        matches!(self, Op::Binary(_) | Op::Compare(_))
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    op: Op,
    operands: Vec<NodeId>,
    shape: Shape,
    users: Vec<NodeId>,
}

impl Node {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }

    pub fn operand(&self, i: usize) -> NodeId {
        self.operands[i]
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Distinct consumers of this node, in the order they were attached.
    pub fn users(&self) -> &[NodeId] {
        &self.users
    }
}

#[derive(thiserror::Error, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub enum GraphError {
    #[error("Cannot replace {old} ({old_shape}) with {new} ({new_shape}): shapes differ")]
    ShapeMismatch {
        old: NodeId,
        old_shape: Shape,
        new: NodeId,
        new_shape: Shape,
    },
    #[error("{0} is not a live node")]
    Removed(NodeId),
    #[error("{node} has no operand {index}")]
    OperandIndex { node: NodeId, index: usize },
    #[error("Computation has no root")]
    NoRoot,
    #[error("{node} records shape {recorded} but its operands imply {inferred}")]
    InconsistentShape {
        node: NodeId,
        recorded: Shape,
        inferred: Shape,
    },
    #[error("Shape inference failed for {node}: {source}")]
    Inference { node: NodeId, source: ShapeError },
    #[error("User list of {0} is out of sync with its consumers")]
    UserList(NodeId),
}

/// A dataflow graph with a single root.
#[derive(Debug, Clone)]
pub struct Computation {
    name: String,
    nodes: Vec<Option<Node>>,
    parameters: Vec<NodeId>,
    root: Option<NodeId>,
}

impl Index<NodeId> for Computation {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Self::Output {
        self.nodes[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("{id} was removed from {}", self.name))
    }
}

impl Computation {
    pub fn new(name: impl Into<String>) -> Self {
        Computation {
            name: name.into(),
            nodes: vec![],
            parameters: vec![],
            root: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_parameter(&mut self, shape: Shape) -> NodeId {
        let id = self.add_node(Op::Parameter(self.parameters.len()), vec![], shape);
        self.parameters.push(id);
        id
    }

    /// Appends a node without checking `shape` against its operands. Prefer the
    /// helpers in [crate::builders], which infer the shape.
    pub fn add_node(&mut self, op: Op, operands: Vec<NodeId>, shape: Shape) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("node count fits in u32"));
        for &operand in &operands {
            let users = &mut self.node_mut(operand).users;
            if !users.contains(&id) {
                users.push(id);
            }
        }
        self.nodes.push(Some(Node {
            op,
            operands,
            shape,
            users: vec![],
        }));
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    pub fn shape(&self, id: NodeId) -> &Shape {
        &self[id].shape
    }

    pub fn op(&self, id: NodeId) -> &Op {
        &self[id].op
    }

    pub fn operands(&self, id: NodeId) -> &[NodeId] {
        &self[id].operands
    }

    pub fn operand(&self, id: NodeId, i: usize) -> NodeId {
        self[id].operands[i]
    }

    pub fn users(&self, id: NodeId) -> &[NodeId] {
        &self[id].users
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.root == Some(id)
    }

    /// Live nodes in creation order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    pub fn instruction_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        let name = &self.name;
        self.nodes[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("{id} was removed from {name}"))
    }

    /// Every live node, each after all of its operands.
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.instruction_count());
        let mut visited = HashSet::new();
        for start in self.node_ids() {
            if visited.contains(&start) {
                continue;
            }
            // Iterative DFS; the flag marks a node whose operands are done.
            let mut stack = vec![(start, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    order.push(id);
                    continue;
                }
                if !visited.insert(id) {
                    continue;
                }
                stack.push((id, true));
                for &operand in self[id].operands.iter().rev() {
                    if !visited.contains(&operand) {
                        stack.push((operand, false));
                    }
                }
            }
        }
        order
    }

    /// Rewires operand `index` of `user` to `new_operand`. The new operand must
    /// have the same shape as the one it replaces.
    pub fn replace_operand_with(
        &mut self,
        user: NodeId,
        index: usize,
        new_operand: NodeId,
    ) -> Result<(), GraphError> {
        let old_operand = *self
            .operands(user)
            .get(index)
            .ok_or(GraphError::OperandIndex { node: user, index })?;
        if self.shape(old_operand) != self.shape(new_operand) {
            return Err(GraphError::ShapeMismatch {
                old: old_operand,
                old_shape: self.shape(old_operand).clone(),
                new: new_operand,
                new_shape: self.shape(new_operand).clone(),
            });
        }
        self.replace_operand_unchecked(user, index, new_operand);
        Ok(())
    }

    fn replace_operand_unchecked(&mut self, user: NodeId, index: usize, new_operand: NodeId) {
        let old_operand = self[user].operands[index];
        if old_operand == new_operand {
            return;
        }
        self.node_mut(user).operands[index] = new_operand;
        if !self[user].operands.contains(&old_operand) {
            self.node_mut(old_operand).users.retain(|&u| u != user);
        }
        let new_users = &mut self.node_mut(new_operand).users;
        if !new_users.contains(&user) {
            new_users.push(user);
        }
    }

    /// Points every consumer of `old` (and the root, if `old` is the root) at
    /// `new`.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) -> Result<(), GraphError> {
        if self.shape(old) != self.shape(new) {
            return Err(GraphError::ShapeMismatch {
                old,
                old_shape: self.shape(old).clone(),
                new,
                new_shape: self.shape(new).clone(),
            });
        }
        let users = self.users(old).to_vec();
        for user in users {
            let positions = self
                .operands(user)
                .iter()
                .enumerate()
                .filter(|(_, &o)| o == old)
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            for i in positions {
                self.replace_operand_unchecked(user, i, new);
            }
        }
        if self.root == Some(old) {
            self.root = Some(new);
        }
        Ok(())
    }

    /// Replaces `old` with `new` everywhere, then removes `old` and any of its
    /// transitive operands left without users.
    pub fn replace_instruction(&mut self, old: NodeId, new: NodeId) -> Result<(), GraphError> {
        if !self.contains(old) {
            return Err(GraphError::Removed(old));
        }
        self.replace_all_uses_with(old, new)?;
        self.remove_if_dead(old);
        Ok(())
    }

    fn is_dead(&self, id: NodeId) -> bool {
        self.contains(id)
            && self[id].users.is_empty()
            && self.root != Some(id)
            && !matches!(self[id].op, Op::Parameter(_))
    }

    fn remove_if_dead(&mut self, id: NodeId) -> usize {
        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if !self.is_dead(id) {
                continue;
            }
            let node = self.nodes[id.index()].take().expect("checked by is_dead");
            removed += 1;
            for operand in node.operands {
                if let Some(Some(o)) = self.nodes.get_mut(operand.index()) {
                    o.users.retain(|&u| u != id);
                }
                stack.push(operand);
            }
        }
        removed
    }

    /// Removes every node that has no users and is neither the root nor a
    /// parameter. Returns how many nodes were removed.
    pub fn remove_dead_code(&mut self) -> usize {
        let candidates = self.node_ids().collect::<Vec<_>>();
        candidates
            .into_iter()
            .rev()
            .map(|id| self.remove_if_dead(id))
            .sum()
    }

    /// Checks that every live node's recorded shape agrees with what its
    /// operands imply, and that user lists mirror operand lists.
    pub fn verify(&self) -> Result<(), GraphError> {
        let root = self.root.ok_or(GraphError::NoRoot)?;
        if !self.contains(root) {
            return Err(GraphError::Removed(root));
        }
        for id in self.node_ids() {
            let node = &self[id];
            let operand_shapes = node
                .operands
                .iter()
                .map(|&o| {
                    if self.contains(o) {
                        Ok(self.shape(o))
                    } else {
                        Err(GraphError::Removed(o))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            let inferred = shape_inference::infer_node_shape(&node.op, &operand_shapes, &node.shape)
                .map_err(|source| GraphError::Inference { node: id, source })?;
            if inferred != node.shape {
                return Err(GraphError::InconsistentShape {
                    node: id,
                    recorded: node.shape.clone(),
                    inferred,
                });
            }
            for &operand in &node.operands {
                if !self[operand].users.contains(&id) {
                    return Err(GraphError::UserList(operand));
                }
            }
            for &user in &node.users {
                if !self.contains(user) || !self[user].operands.contains(&id) {
                    return Err(GraphError::UserList(id));
                }
            }
        }
        Ok(())
    }

    /// A one-line rendering such as `%4 = f32[4,7,2] pad(%3, %1)`.
    pub fn node_to_string(&self, id: NodeId) -> String {
        let node = &self[id];
        format!(
            "{id} = {} {}({})",
            node.shape,
            node.op,
            join_into_string(&node.operands, ", ")
        )
    }
}

/// A collection of computations, rewritten by passes one computation at a time.
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    computations: Vec<Computation>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            computations: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_computation(&mut self, computation: Computation) -> usize {
        self.computations.push(computation);
        self.computations.len() - 1
    }

    pub fn computations(&self) -> &[Computation] {
        &self.computations
    }

    pub fn computation(&self, index: usize) -> &Computation {
        &self.computations[index]
    }

    /// Swaps in a rewritten computation, returning the one it replaces.
    pub fn replace_computation(&mut self, index: usize, computation: Computation) -> Computation {
        std::mem::replace(&mut self.computations[index], computation)
    }
}
