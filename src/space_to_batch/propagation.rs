//! Walking the consumers of a rewritten convolution and carrying the
//! space-to-batched layout through them.

use std::collections::VecDeque;

use itertools::Itertools;

use super::legality::{is_eligible_for_rewrite, is_trivial_elementwise};
use super::relayout::{halo_duplicate_with_slice, select_valid_portion};
use super::{ConvolutionVisitor, SpaceToBatchError, TransformRecord};
use crate::builders::{
    clone_with_new_operands, make_binary, make_broadcast, make_compare, make_constant, make_pad,
    make_reduce, make_reduce_window, make_reshape, make_select, make_select_and_scatter,
    make_slice, make_transpose, make_zero,
};
use crate::common::{DimSize, Shape};
use crate::hlo::{BinaryOp, ComparisonDirection, NodeId, Op, Reducer};
use crate::literal::Literal;
use crate::window::{PaddingConfig, Window};

/// How far a window of `size` and `stride` reaches past the end of a split
/// of `new_space_size` elements when every output of the split is kept.
pub(super) fn windowed_halo_size(
    new_space_size: DimSize,
    stride: DimSize,
    size: DimSize,
) -> DimSize {
    let stride = stride.max(1);
    (((new_space_size - 1) / stride) * stride + size - new_space_size).max(0)
}

impl ConvolutionVisitor<'_> {
    /// Breadth-first walk over the consumers of a freshly rewritten
    /// convolution. Consumers that are ready get rewritten and walked in
    /// turn; unready ones are blocked until a later producer unblocks them;
    /// unsupported ones get the original layout back.
    pub(super) fn propagate_on_users(
        &mut self,
        convolution: NodeId,
    ) -> Result<(), SpaceToBatchError> {
        if self.c.users(convolution).is_empty() {
            let restored = self.batch_to_space(convolution)?;
            self.c.replace_instruction(convolution, restored)?;
            return Ok(());
        }

        let mut queue = VecDeque::from([(convolution, convolution)]);
        let mut first = true;
        while let Some((node, producer)) = queue.pop_front() {
            if !self.c.contains(node) {
                continue;
            }
            let mut needs_further = true;
            if !first {
                if self.transformed.contains_key(&node) {
                    continue;
                }
                needs_further = self.propagate(node, producer)?;
            }
            first = false;

            if self.c.is_root(node) {
                let replacement = if needs_further {
                    self.batch_to_space(node)?
                } else {
                    self.record(node)?.new
                };
                log::debug!("Replacing root {node} with {replacement}");
                self.c.replace_instruction(node, replacement)?;
                continue;
            }
            if !needs_further {
                let replacement = self.record(node)?.new;
                self.c.replace_instruction(node, replacement)?;
                continue;
            }

            let mut unsupported = vec![];
            for user in self.c.users(node).to_vec() {
                if self.transformed.contains_key(&user) {
                    continue;
                }
                if !self.is_supported_for_propagation(user, node) {
                    log::trace!("Unsupported consumer {}", self.c.node_to_string(user));
                    unsupported.push(user);
                } else if self.can_propagate(user, node) {
                    self.blocked.shift_remove(&user);
                    queue.push_back((user, node));
                } else {
                    log::trace!("Blocked on {}", self.c.node_to_string(user));
                    self.blocked.insert(user);
                }
            }
            for user in unsupported {
                let restored = self.batch_to_space(node)?;
                let slots = self
                    .c
                    .operands(user)
                    .iter()
                    .positions(|&operand| operand == node)
                    .collect_vec();
                for slot in slots {
                    self.c.replace_operand_with(user, slot, restored)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites `consumer` onto the replacements of its operands. Returns
    /// whether the replacement is still space-to-batched, so that its own
    /// consumers may follow.
    pub(super) fn propagate(
        &mut self,
        consumer: NodeId,
        producer: NodeId,
    ) -> Result<bool, SpaceToBatchError> {
        log::trace!("Propagating on {}", self.c.node_to_string(consumer));
        let op = self.c.op(consumer).clone();
        if is_trivial_elementwise(&op) {
            return self.propagate_on_elementwise(consumer, producer);
        }
        match op {
            Op::Convolution(_) => {
                if is_eligible_for_rewrite(self.c, consumer, self.config) {
                    self.propagate_on_conv(consumer)
                } else {
                    self.propagate_on_backprop_filter_conv(consumer)
                }
            }
            Op::Reduce {
                dimensions,
                reducer,
            } => self.propagate_on_reduce(consumer, &dimensions, reducer),
            Op::ReduceWindow { window, reducer } => {
                self.propagate_on_reduce_window(consumer, &window, reducer)
            }
            Op::SelectAndScatter {
                window,
                select,
                scatter,
            } => self.propagate_on_select_and_scatter(consumer, &window, select, scatter),
            _ => Err(SpaceToBatchError::Unsupported(
                consumer,
                "no propagation rule for opcode",
            )),
        }
    }

    fn propagate_on_elementwise(
        &mut self,
        consumer: NodeId,
        producer: NodeId,
    ) -> Result<bool, SpaceToBatchError> {
        let operands = self.c.operands(consumer).to_vec();
        // The transformed operand with the largest replacement; ties go to
        // the later operand.
        let pivot = operands
            .iter()
            .copied()
            .filter(|operand| self.transformed.contains_key(operand))
            .max_by(|a, b| {
                let a = &self.c.shape(self.transformed[a].new).dims;
                let b = &self.c.shape(self.transformed[b].new).dims;
                a.cmp(b)
            })
            .ok_or(SpaceToBatchError::MissingTransform(consumer))?;
        let pivot_record = self.record(pivot)?.clone();
        let permutation = self.permutation(pivot)?.to_vec();
        let pivot_new_dims = pivot_record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(pivot))?;
        let pivot_dims = self.c.shape(pivot_record.new).dims.to_vec();

        let mut new_operands = Vec::with_capacity(operands.len());
        for operand in operands {
            if let Some(record) = self.transformed.get(&operand).cloned() {
                let mut new = record.new;
                let new_dims = self.c.shape(new).dims.to_vec();
                if new_dims != pivot_dims {
                    new = self.resplit_like(operand, &record, &pivot_dims, pivot_new_dims)?;
                }
                new_operands.push(new);
                continue;
            }
            let new = match self.c.op(operand).clone() {
                Op::Broadcast { dimensions } if self.is_layout_free_operand(operand, producer) => {
                    let source = self.c.operand(operand, 0);
                    let mapped = dimensions.iter().map(|&d| permutation[d]).collect_vec();
                    make_broadcast(self.c, source, &mapped, &pivot_dims)?
                }
                Op::Constant(literal) if literal.is_splat() => {
                    let scalar = literal
                        .first_element()
                        .ok_or(SpaceToBatchError::Unsupported(operand, "empty constant"))?;
                    let scalar = make_constant(self.c, scalar);
                    make_broadcast(self.c, scalar, &[], &pivot_dims)?
                }
                _ => {
                    return Err(SpaceToBatchError::Unsupported(
                        operand,
                        "operand is neither transformed nor layout-free",
                    ))
                }
            };
            new_operands.push(new);
        }

        let dtype = self.c.shape(consumer).dtype;
        let new = clone_with_new_operands(
            self.c,
            consumer,
            Shape::new(dtype, pivot_dims),
            new_operands,
        )?;
        self.insert_record(
            consumer,
            TransformRecord {
                new,
                dims: pivot_record.dims,
                permutation: Some(permutation),
            },
        );
        Ok(true)
    }

    /// Re-splits `operand`'s replacement, whose splits are shorter than the
    /// pivot's, to the pivot's split size.
    fn resplit_like(
        &mut self,
        operand: NodeId,
        record: &TransformRecord,
        pivot_dims: &[DimSize],
        pivot_new_dims: super::DimPair,
    ) -> Result<NodeId, SpaceToBatchError> {
        let old_batch_size = self.c.shape(operand).dim(record.dims.batch);
        let (batch_axis, space_axis) = (pivot_new_dims.batch, pivot_new_dims.space);
        let num_splits = pivot_dims[batch_axis] / old_batch_size;
        let mut dims = self.c.shape(record.new).dims.to_vec();
        let split_size = dims[space_axis];
        dims[batch_axis] = old_batch_size;
        dims[space_axis] = split_size * num_splits;
        let reshaped = make_reshape(self.c, &dims, record.new)?;
        let dtype = self.c.shape(operand).dtype;
        let zero = make_zero(self.c, dtype);
        let config = PaddingConfig::zero(dims.len()).with_edge(
            space_axis,
            0,
            (pivot_dims[space_axis] - split_size) * num_splits,
        );
        let padded = make_pad(self.c, reshaped, zero, &config)?;
        Ok(make_reshape(self.c, pivot_dims, padded)?)
    }

    fn propagate_on_reduce(
        &mut self,
        reduce: NodeId,
        dimensions: &[usize],
        reducer: Reducer,
    ) -> Result<bool, SpaceToBatchError> {
        let operand = self.c.operand(reduce, 0);
        let init = self.c.operand(reduce, 1);
        let record = self.record(operand)?.clone();
        let permutation = self.permutation(operand)?.to_vec();
        let new_dims = record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(operand))?;
        let old_shape = self.c.shape(operand).clone();
        let masked = select_valid_portion(
            self.c,
            record.new,
            &old_shape,
            init,
            new_dims.batch,
            new_dims.space,
            record.dims.batch,
            record.dims.space,
        )?;

        let new_dimensions = dimensions.iter().map(|&d| permutation[d]).collect_vec();
        let reduced = make_reduce(self.c, masked, init, &new_dimensions, reducer)?;

        // Kept axes come out in the order of their new positions.
        let kept_new_positions = (0..old_shape.rank())
            .filter(|axis| !dimensions.contains(axis))
            .map(|axis| permutation[axis])
            .collect_vec();
        let sorted = kept_new_positions.iter().copied().sorted().collect_vec();
        let order = kept_new_positions
            .iter()
            .map(|p| sorted.iter().position(|q| q == p).unwrap_or_default())
            .collect_vec();
        let result = make_transpose(self.c, reduced, &order)?;
        if self.c.shape(result) != self.c.shape(reduce) {
            return Err(SpaceToBatchError::Inconsistent(format!(
                "reduce {} came out as {}",
                reduce,
                self.c.shape(result)
            )));
        }
        self.insert_record(
            reduce,
            TransformRecord {
                new: result,
                dims: record.dims,
                permutation: None,
            },
        );
        Ok(false)
    }

    /// Maps a window over `operand`'s original axes onto its replacement's
    /// axes, dropping the padding along the split axis.
    fn remap_window(
        &self,
        window: &Window,
        record: &TransformRecord,
        permutation: &[usize],
    ) -> Window {
        let mut new_window = window.clone();
        for (axis, dim) in window.dimensions.iter().enumerate() {
            new_window.dimensions[permutation[axis]] = dim.clone();
        }
        let space = &mut new_window.dimensions[permutation[record.dims.space]];
        space.padding_low = 0;
        space.padding_high = 0;
        new_window
    }

    fn propagate_on_reduce_window(
        &mut self,
        reduce_window: NodeId,
        window: &Window,
        reducer: Reducer,
    ) -> Result<bool, SpaceToBatchError> {
        let operand = self.c.operand(reduce_window, 0);
        let init = self.c.operand(reduce_window, 1);
        let record = self.record(operand)?.clone();
        let permutation = self.permutation(operand)?.to_vec();
        let new_dims = record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(operand))?;
        let old_shape = self.c.shape(operand).clone();
        let masked = select_valid_portion(
            self.c,
            record.new,
            &old_shape,
            init,
            new_dims.batch,
            new_dims.space,
            record.dims.batch,
            record.dims.space,
        )?;

        let space_window = &window.dimensions[record.dims.space];
        let new_space_size = self.c.shape(masked).dim(new_dims.space);
        let halo = windowed_halo_size(new_space_size, space_window.stride, space_window.size);
        let mut act = masked;
        if halo > 0 {
            act = halo_duplicate_with_slice(
                self.c,
                act,
                new_dims.space,
                new_dims.batch,
                old_shape.dim(record.dims.batch),
                0,
                halo,
                init,
            )?;
        }
        let new_window = self.remap_window(window, &record, &permutation);
        let new = make_reduce_window(self.c, act, init, new_window, reducer)?;
        self.insert_record(
            reduce_window,
            TransformRecord {
                new,
                dims: record.dims,
                permutation: Some(permutation),
            },
        );
        Ok(true)
    }

    /// Select-and-scatter over halo-widened splits. Each split scatters into
    /// its own elements and into the halo it borrowed from the next split;
    /// the latter contributions are then folded back into the next split.
    fn propagate_on_select_and_scatter(
        &mut self,
        select_and_scatter: NodeId,
        window: &Window,
        select: ComparisonDirection,
        scatter: Reducer,
    ) -> Result<bool, SpaceToBatchError> {
        let operand = self.c.operand(select_and_scatter, 0);
        let source = self.c.operand(select_and_scatter, 1);
        let init = self.c.operand(select_and_scatter, 2);
        let record = self.record(operand)?.clone();
        let source_record = self.record(source)?.clone();
        let permutation = self.permutation(operand)?.to_vec();
        let new_dims = record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(operand))?;
        let source_new_dims = source_record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(source))?;

        let old_shape = self.c.shape(operand).clone();
        let dtype = old_shape.dtype;
        // Padding must never win the selection.
        let never_selected = match select {
            ComparisonDirection::Ge | ComparisonDirection::Gt => Literal::min_value(dtype),
            ComparisonDirection::Le | ComparisonDirection::Lt => Literal::max_value(dtype),
            _ => {
                return Err(SpaceToBatchError::Unsupported(
                    select_and_scatter,
                    "selection is not an ordering",
                ))
            }
        };
        let never_selected = make_constant(self.c, never_selected);
        let zero = make_zero(self.c, dtype);
        let masked_operand = select_valid_portion(
            self.c,
            record.new,
            &old_shape,
            never_selected,
            new_dims.batch,
            new_dims.space,
            record.dims.batch,
            record.dims.space,
        )?;
        let source_shape = self.c.shape(source).clone();
        let masked_source = select_valid_portion(
            self.c,
            source_record.new,
            &source_shape,
            zero,
            source_new_dims.batch,
            source_new_dims.space,
            source_record.dims.batch,
            source_record.dims.space,
        )?;

        let operand_dims = self.c.shape(masked_operand).dims.to_vec();
        let (batch_axis, space_axis) = (new_dims.batch, new_dims.space);
        let new_batch_size = operand_dims[batch_axis];
        let new_space_size = operand_dims[space_axis];
        let old_batch_size = old_shape.dim(record.dims.batch);
        let num_splits = new_batch_size / old_batch_size;
        let space_window = &window.dimensions[record.dims.space];
        let halo = windowed_halo_size(new_space_size, space_window.stride, space_window.size);

        let mut widened = masked_operand;
        if halo > 0 {
            widened = halo_duplicate_with_slice(
                self.c,
                widened,
                space_axis,
                batch_axis,
                old_batch_size,
                0,
                halo,
                never_selected,
            )?;
        }
        let new_window = self.remap_window(window, &record, &permutation);
        let mut result = make_select_and_scatter(
            self.c,
            widened,
            masked_source,
            init,
            new_window,
            select,
            scatter,
        )?;

        if halo > 0 {
            result = self.fold_back_halo(
                result,
                init,
                batch_axis,
                space_axis,
                new_space_size,
                halo,
                num_splits,
            )?;
            let rank = operand_dims.len();
            result = make_slice(
                self.c,
                result,
                &vec![0; rank],
                &operand_dims,
                &vec![1; rank],
            )?;
        }

        self.insert_record(
            select_and_scatter,
            TransformRecord {
                new: result,
                dims: record.dims,
                permutation: Some(permutation),
            },
        );
        Ok(true)
    }

    /// Adds what each split scattered into its borrowed halo onto the first
    /// `halo` elements of the next split.
    #[allow(clippy::too_many_arguments)]
    fn fold_back_halo(
        &mut self,
        scattered: NodeId,
        init: NodeId,
        batch_axis: usize,
        space_axis: usize,
        split_size: DimSize,
        halo: DimSize,
        num_splits: DimSize,
    ) -> Result<NodeId, SpaceToBatchError> {
        let dims = self.c.shape(scattered).dims.to_vec();
        let rank = dims.len();
        let batch_size = dims[batch_axis];
        let strides = vec![1; rank];

        let mut starts = vec![0; rank];
        let mut limits = dims.clone();
        starts[space_axis] = split_size;
        limits[batch_axis] = batch_size - 1;
        let bottom = make_slice(self.c, scattered, &starts, &limits, &strides)?;

        let mut starts = vec![0; rank];
        let mut limits = dims.clone();
        starts[batch_axis] = 1;
        limits[space_axis] = halo;
        let top = make_slice(self.c, scattered, &starts, &limits, &strides)?;

        let part_dims = self.c.shape(bottom).dims.to_vec();
        let default = make_broadcast(self.c, init, &[], &part_dims)?;
        let bottom_touched = make_compare(self.c, ComparisonDirection::Ne, bottom, default)?;
        let top_touched = make_compare(self.c, ComparisonDirection::Ne, top, default)?;
        let both_touched = make_binary(self.c, BinaryOp::And, bottom_touched, top_touched)?;
        // Both sides already include the initial value once.
        let sum = make_binary(self.c, BinaryOp::Add, bottom, top)?;
        let sum = make_binary(self.c, BinaryOp::Subtract, sum, default)?;
        let either = make_select(self.c, bottom_touched, bottom, top)?;
        let folded = make_select(self.c, both_touched, sum, either)?;

        let dtype = self.c.shape(scattered).dtype;
        let zero = make_zero(self.c, dtype);
        let config = PaddingConfig::zero(rank)
            .with_edge(batch_axis, 1, 0)
            .with_edge(space_axis, 0, dims[space_axis] - halo);
        let folded = make_pad(self.c, folded, zero, &config)?;

        // The first split of every batch element has no previous split, and
        // only the first `halo` elements receive anything.
        let keep = (0..batch_size)
            .cartesian_product(0..dims[space_axis])
            .map(|(row, col)| row % num_splits == 0 || col >= halo)
            .collect_vec();
        let mask = make_constant(self.c, Literal::r1_pred(keep));
        let mask = make_reshape(self.c, &[batch_size, dims[space_axis]], mask)?;
        let mask = make_broadcast(self.c, mask, &[batch_axis, space_axis], &dims)?;
        Ok(make_select(self.c, mask, scattered, folded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{make_unary, make_zero};
    use crate::common::Dtype;
    use crate::hlo::{Computation, UnaryOp};
    use crate::space_to_batch::test_graphs::{conv_1xw, f32_shape};
    use crate::space_to_batch::{ConverterConfig, NodeState};
    use crate::window::WindowDimension;

    #[test]
    fn test_windowed_halo_size() {
        assert_eq!(windowed_halo_size(4, 2, 2), 0);
        assert_eq!(windowed_halo_size(4, 2, 3), 1);
        assert_eq!(windowed_halo_size(4, 1, 3), 2);
        assert_eq!(windowed_halo_size(4, 2, 1), 0);
    }

    #[test]
    fn test_splat_constant_and_broadcast_follow_the_layout() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let bias = c.add_parameter(f32_shape(&[2]));
        let bias = make_broadcast(&mut c, bias, &[3], &[1, 1, 16, 2]).unwrap();
        let biased = make_binary(&mut c, BinaryOp::Add, conv, bias).unwrap();
        let half = make_constant(
            &mut c,
            Literal::new(
                f32_shape(&[1, 1, 16, 2]),
                crate::literal::LiteralData::Float32(vec![0.5; 32]),
            )
            .unwrap(),
        );
        let scaled = make_binary(&mut c, BinaryOp::Multiply, biased, half).unwrap();
        c.set_root(scaled);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        assert_eq!(visitor.state(biased), NodeState::Transformed);
        assert_eq!(visitor.state(scaled), NodeState::Transformed);
        let new_bias = visitor.c.operand(visitor.transformed[&biased].new, 1);
        assert!(matches!(
            visitor.c.op(new_bias),
            Op::Broadcast { dimensions } if dimensions == &[3]
        ));
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
        assert_eq!(c.shape(c.root().unwrap()), &f32_shape(&[1, 1, 16, 2]));
    }

    #[test]
    fn test_unready_consumer_is_blocked_then_restored() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let other = c.add_parameter(f32_shape(&[1, 1, 16, 2]));
        let sum = make_binary(&mut c, BinaryOp::Add, conv, other).unwrap();
        c.set_root(sum);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        assert_eq!(visitor.state(sum), NodeState::Blocked);
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
        let root = c.root().unwrap();
        assert_eq!(root, sum);
        assert_ne!(c.operand(sum, 0), conv);
        assert_eq!(c.operand(sum, 1), other);
    }

    #[test]
    fn test_convert_propagates_but_copy_does_not() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let converted = crate::builders::make_convert(&mut c, conv, Dtype::Sint32);
        let copy_shape = c.shape(converted).clone();
        let copy = c.add_node(Op::Copy, vec![converted], copy_shape.clone());
        c.set_root(copy);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        assert_eq!(visitor.state(converted), NodeState::Transformed);
        assert_eq!(visitor.state(copy), NodeState::Unseen);
        let new = visitor.transformed[&converted].new;
        assert_eq!(visitor.c.shape(new).dtype, Dtype::Sint32);
        assert_ne!(visitor.c.operand(copy, 0), converted);
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
        assert_eq!(c.root(), Some(copy));
        assert_eq!(c.shape(copy), &copy_shape);
    }

    #[test]
    fn test_reduce_over_batch_and_space_leaves_the_layout() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let neg = make_unary(&mut c, UnaryOp::Negate, conv).unwrap();
        let zero = make_zero(&mut c, Dtype::Float32);
        let reduce = make_reduce(&mut c, neg, zero, &[0, 2], Reducer::Add).unwrap();
        c.set_root(reduce);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        let record = visitor.transformed[&reduce].clone();
        assert_eq!(record.permutation, None);
        assert_eq!(visitor.state(reduce), NodeState::Terminal);
        assert_eq!(visitor.c.shape(record.new), &f32_shape(&[1, 2]));
        assert_eq!(visitor.c.root(), Some(record.new));
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
    }

    #[test]
    fn test_reduce_window_keeps_the_layout() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let init = make_zero(&mut c, Dtype::Float32);
        let window = Window::new([
            WindowDimension::new(1),
            WindowDimension::new(1),
            WindowDimension::new(3).with_stride(2).with_padding(0, 1),
            WindowDimension::new(1),
        ]);
        let pool = make_reduce_window(&mut c, conv, init, window, Reducer::Maximum).unwrap();
        c.set_root(pool);

        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        let record = visitor.transformed[&pool].clone();
        // The lookahead rounds splits up to 4 so each yields 2 outputs.
        assert_eq!(visitor.c.shape(record.new), &f32_shape(&[1, 8, 2, 2]));
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
        assert_eq!(c.shape(c.root().unwrap()), &f32_shape(&[1, 1, 8, 2]));
    }
}
