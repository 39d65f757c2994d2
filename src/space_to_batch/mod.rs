//! Rewrites convolutions with a small batch so that they run on a larger,
//! synthetic batch carved out of one spatial dimension.
//!
//! A rewritten convolution's output lives in a "space-to-batched" layout: its
//! batch axis is `num_splits` times larger and its split spatial axis is
//! correspondingly shorter. Consumers which can operate on that layout are
//! rewritten too; wherever the walk stops, the original layout is restored
//! with [ConvolutionVisitor::batch_to_space].

mod geometry;
mod legality;
mod propagation;
mod reconcile;
mod relayout;
mod rewrite;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::common::DimSize;
use crate::hlo::{Computation, GraphError, Module, NodeId, Op};
use crate::pass::HloPass;
use crate::shape_inference::ShapeError;

pub use geometry::ConvGeometry;
pub use legality::is_eligible_for_rewrite;
pub use relayout::{bring_space_next_to_batch, halo_duplicate_with_slice, select_valid_portion};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Convolutions whose input batch is larger than this are left alone.
    pub limit_on_batch_size: DimSize,
    /// The batch size rewritten convolutions run with.
    pub new_batch_size: DimSize,
    /// How many consumer hops to look through when searching for a
    /// reduce-window whose stride the split size should respect.
    pub reduce_window_search_depth: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        ConverterConfig {
            limit_on_batch_size: 1,
            new_batch_size: 8,
            reduce_window_search_depth: 10,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Batch size limit must be positive, but was {0}")]
    NonPositiveLimit(DimSize),
    #[error("New batch size must be positive, but was {0}")]
    NonPositiveNewBatchSize(DimSize),
}

impl ConverterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_on_batch_size < 1 {
            return Err(ConfigError::NonPositiveLimit(self.limit_on_batch_size));
        }
        if self.new_batch_size < 1 {
            return Err(ConfigError::NonPositiveNewBatchSize(self.new_batch_size));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SpaceToBatchError {
    #[error("Failed to infer a shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Graph edit failed: {0}")]
    Graph(#[from] GraphError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("No space-to-batched replacement recorded for {0}")]
    MissingTransform(NodeId),
    #[error("Replacement for {0} carries no axis permutation")]
    MissingPermutation(NodeId),
    #[error("{0} is both blocked and transformed")]
    BlockedAndTransformed(NodeId),
    #[error("{0} cannot be rewritten: {1}")]
    Unsupported(NodeId, &'static str),
    #[error("Inconsistent space-to-batch state: {0}")]
    Inconsistent(String),
}

/// A (batch axis, split spatial axis) pair, given in a node's original layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DimPair {
    pub batch: usize,
    pub space: usize,
}

/// What an original node was rewritten into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRecord {
    pub new: NodeId,
    pub dims: DimPair,
    /// `permutation[a]` is the axis of `new` holding original axis `a`. Absent
    /// for replacements which already have the original shape.
    pub permutation: Option<Vec<usize>>,
}

impl TransformRecord {
    /// Axes of the batch and split dimensions in the replacement.
    pub fn new_dims(&self) -> Option<DimPair> {
        self.permutation.as_ref().map(|p| DimPair {
            batch: p[self.dims.batch],
            space: p[self.dims.space],
        })
    }
}

/// Where a node stands after a visitor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unseen,
    /// Rewritten into the space-to-batched layout.
    Transformed,
    /// Rewritten, but its replacement already has the original shape, so
    /// nothing downstream needs the split layout.
    Terminal,
    Blocked,
}

/// Per-computation state of the rewrite.
pub struct ConvolutionVisitor<'a> {
    c: &'a mut Computation,
    config: &'a ConverterConfig,
    /// Eligible convolutions in post order.
    conv_visitor_list: Vec<NodeId>,
    /// Convolutions still to be rewritten. Convolutions reached by propagation
    /// are removed from here.
    convs_to_visit: HashSet<NodeId>,
    transformed: HashMap<NodeId, TransformRecord>,
    blocked: IndexSet<NodeId>,
    batch_to_space_map: HashMap<NodeId, NodeId>,
    changed: bool,
}

impl<'a> ConvolutionVisitor<'a> {
    pub fn new(c: &'a mut Computation, config: &'a ConverterConfig) -> Self {
        let mut conv_visitor_list = vec![];
        for id in c.post_order() {
            if !matches!(c.op(id), Op::Convolution(_)) {
                continue;
            }
            if !is_eligible_for_rewrite(c, id, config) {
                log::debug!("Conv not suitable for space-to-batch {}", c.node_to_string(id));
                continue;
            }
            log::debug!("Conv added to space-to-batch worklist {}", c.node_to_string(id));
            conv_visitor_list.push(id);
        }
        let convs_to_visit = conv_visitor_list.iter().copied().collect();
        ConvolutionVisitor {
            c,
            config,
            conv_visitor_list,
            convs_to_visit,
            transformed: HashMap::new(),
            blocked: IndexSet::new(),
            batch_to_space_map: HashMap::new(),
            changed: false,
        }
    }

    /// Rewrites every eligible convolution, propagates, and finally restores
    /// the original layout on the operands of nodes the walk got stuck on.
    pub fn run(mut self) -> Result<bool, SpaceToBatchError> {
        for conv in std::mem::take(&mut self.conv_visitor_list) {
            if !self.c.contains(conv)
                || self.transformed.contains_key(&conv)
                || !self.convs_to_visit.contains(&conv)
            {
                continue;
            }
            self.rewrite_convolution(conv)?;
        }
        self.convs_to_visit.clear();

        for node in std::mem::take(&mut self.blocked) {
            if self.transformed.contains_key(&node) {
                return Err(SpaceToBatchError::BlockedAndTransformed(node));
            }
            if !self.c.contains(node) {
                continue;
            }
            log::debug!(
                "Could not eventually propagate through {}",
                self.c.node_to_string(node)
            );
            let operands = self.c.operands(node).to_vec();
            let mut replacements = vec![];
            for (i, operand) in operands.into_iter().enumerate() {
                if self.transformed.contains_key(&operand) {
                    replacements.push((i, self.batch_to_space(operand)?));
                }
            }
            for (i, replacement) in replacements {
                self.c.replace_operand_with(node, i, replacement)?;
            }
        }

        if self.changed {
            let removed = self.c.remove_dead_code();
            log::trace!("Removed {removed} dead nodes from {}", self.c.name());
        }
        Ok(self.changed)
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        if let Some(record) = self.transformed.get(&id) {
            if record.permutation.is_none() {
                NodeState::Terminal
            } else {
                NodeState::Transformed
            }
        } else if self.blocked.contains(&id) {
            NodeState::Blocked
        } else {
            NodeState::Unseen
        }
    }

    fn record(&self, old: NodeId) -> Result<&TransformRecord, SpaceToBatchError> {
        self.transformed
            .get(&old)
            .ok_or(SpaceToBatchError::MissingTransform(old))
    }

    fn permutation(&self, old: NodeId) -> Result<&[usize], SpaceToBatchError> {
        self.record(old)?
            .permutation
            .as_deref()
            .ok_or(SpaceToBatchError::MissingPermutation(old))
    }

    /// The record of `old`, if it was transformed and can be propagated
    /// further.
    fn propagatable_record(&self, old: NodeId) -> Option<&TransformRecord> {
        self.transformed
            .get(&old)
            .filter(|record| record.permutation.is_some())
    }

    fn insert_record(&mut self, old: NodeId, record: TransformRecord) {
        log::trace!(
            "{} space-to-batched into {}",
            old,
            self.c.node_to_string(record.new)
        );
        self.transformed.insert(old, record);
    }
}

/// Applies [ConvolutionVisitor] to every computation of a module. Each
/// computation is rewritten on a copy which replaces the original only once
/// the rewrite has succeeded.
#[derive(Debug, Clone, Default)]
pub struct ConvolutionSpaceToBatchConverter {
    config: ConverterConfig,
}

impl ConvolutionSpaceToBatchConverter {
    pub fn new(config: ConverterConfig) -> Self {
        ConvolutionSpaceToBatchConverter { config }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }
}

impl HloPass for ConvolutionSpaceToBatchConverter {
    type Error = SpaceToBatchError;

    fn name(&self) -> &'static str {
        "convolution-space-to-batch-converter"
    }

    fn run(&self, module: &mut Module) -> Result<bool, Self::Error> {
        self.config.validate()?;
        let mut changed = false;
        for index in 0..module.computations().len() {
            let mut computation = module.computation(index).clone();
            let computation_changed =
                ConvolutionVisitor::new(&mut computation, &self.config).run()?;
            log::debug!(
                "Done operating on computation {} (changed: {})",
                computation.name(),
                computation_changed
            );
            if computation_changed {
                module.replace_computation(index, computation);
                changed = true;
            }
        }
        Ok(changed)
    }
}


#[cfg(test)]
mod tests {
    use super::test_graphs::*;
    use super::*;
    use crate::builders::{make_binary, make_reduce, make_unary, make_zero};
    use crate::common::Dtype;
    use crate::hlo::{BinaryOp, Reducer, UnaryOp};

    fn module_with(c: Computation) -> Module {
        let mut module = Module::new("m");
        module.add_computation(c);
        module
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(ConverterConfig::default().validate(), Ok(()));
        let config = ConverterConfig {
            new_batch_size: 0,
            ..ConverterConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositiveNewBatchSize(0))
        );
    }

    #[test]
    fn test_invalid_config_is_rejected_before_any_rewrite() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        c.set_root(conv);
        let mut module = module_with(c);
        let converter = ConvolutionSpaceToBatchConverter::new(ConverterConfig {
            limit_on_batch_size: 0,
            ..ConverterConfig::default()
        });
        assert!(matches!(
            converter.run(&mut module),
            Err(SpaceToBatchError::Config(ConfigError::NonPositiveLimit(0)))
        ));
        assert_eq!(module.computation(0).root(), Some(conv));
    }

    #[test]
    fn test_root_shape_is_preserved_and_graph_verifies() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let relu_zero = make_zero(&mut c, Dtype::Float32);
        let zeros = crate::builders::make_broadcast(&mut c, relu_zero, &[], &[1, 1, 16, 2])
            .unwrap();
        let relu = make_binary(&mut c, BinaryOp::Maximum, conv, zeros).unwrap();
        c.set_root(relu);
        let root_shape = c.shape(relu).clone();

        let mut module = module_with(c);
        let converter = ConvolutionSpaceToBatchConverter::default();
        assert!(converter.run(&mut module).unwrap());
        let c = module.computation(0);
        c.verify().unwrap();
        let root = c.root().unwrap();
        assert_eq!(c.shape(root), &root_shape);
        assert!(!c.contains(conv));
    }

    #[test]
    fn test_second_run_reports_no_change() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let neg = make_unary(&mut c, UnaryOp::Negate, conv).unwrap();
        c.set_root(neg);
        let mut module = module_with(c);
        let converter = ConvolutionSpaceToBatchConverter::default();
        assert!(converter.run(&mut module).unwrap());
        let after_first = module.computation(0).instruction_count();
        assert!(!converter.run(&mut module).unwrap());
        assert_eq!(module.computation(0).instruction_count(), after_first);
    }

    #[test]
    fn test_ineligible_module_is_untouched() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 2, 16, 2, 3, 1, (1, 1));
        c.set_root(conv);
        let before = c.instruction_count();
        let mut module = module_with(c);
        assert!(!ConvolutionSpaceToBatchConverter::default()
            .run(&mut module)
            .unwrap());
        assert_eq!(module.computation(0).instruction_count(), before);
        assert_eq!(module.computation(0).root(), Some(conv));
    }

    #[test]
    fn test_wide_fan_out_into_unsupported_reduce_terminates() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let mut sum = None;
        for _ in 0..50 {
            let neg = make_unary(&mut c, UnaryOp::Negate, conv).unwrap();
            sum = Some(match sum {
                None => neg,
                Some(acc) => make_binary(&mut c, BinaryOp::Add, acc, neg).unwrap(),
            });
        }
        // Reducing only the feature axis keeps the batch and split axes, so
        // this reduce cannot consume the space-to-batched layout.
        let zero = make_zero(&mut c, Dtype::Float32);
        let reduce = make_reduce(&mut c, sum.unwrap(), zero, &[3], Reducer::Add).unwrap();
        c.set_root(reduce);

        let mut module = module_with(c);
        let converter = ConvolutionSpaceToBatchConverter::new(ConverterConfig {
            reduce_window_search_depth: 3,
            ..ConverterConfig::default()
        });
        assert!(converter.run(&mut module).unwrap());
        let c = module.computation(0);
        c.verify().unwrap();
        let root = c.root().unwrap();
        assert_eq!(c.shape(root), &f32_shape(&[1, 1, 16]));
        assert!(matches!(c.op(root), Op::Reduce { .. }));
    }

    #[test]
    fn test_every_fan_out_consumer_ends_transformed() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let mut negs = vec![];
        let mut adds = vec![];
        let mut sum = None;
        for _ in 0..20 {
            let neg = make_unary(&mut c, UnaryOp::Negate, conv).unwrap();
            negs.push(neg);
            sum = Some(match sum {
                None => neg,
                Some(acc) => {
                    let add = make_binary(&mut c, BinaryOp::Add, acc, neg).unwrap();
                    adds.push(add);
                    add
                }
            });
        }
        let zero = make_zero(&mut c, Dtype::Float32);
        let reduce = make_reduce(&mut c, sum.unwrap(), zero, &[3], Reducer::Add).unwrap();
        c.set_root(reduce);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        for &id in negs.iter().chain(&adds) {
            assert_eq!(visitor.state(id), NodeState::Transformed);
        }
        assert_eq!(visitor.state(reduce), NodeState::Unseen);
        assert!(visitor.blocked.is_empty());
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
    }

    #[test]
    fn test_node_states_after_run() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let neg = make_unary(&mut c, UnaryOp::Negate, conv).unwrap();
        let zero = make_zero(&mut c, Dtype::Float32);
        let reduce = make_reduce(&mut c, neg, zero, &[3], Reducer::Add).unwrap();
        c.set_root(reduce);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        assert_eq!(visitor.state(conv), NodeState::Transformed);
        assert_eq!(visitor.state(neg), NodeState::Transformed);
        assert_eq!(visitor.state(reduce), NodeState::Unseen);
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
    }
}
