//! Rewriting convolutions: eligible ones from their original layout, and
//! convolutions whose operands were already space-to-batched.

use std::collections::{HashSet, VecDeque};

use itertools::Itertools;

use super::geometry::ConvGeometry;
use super::legality::propagated_split_size;
use super::relayout::{bring_space_next_to_batch, halo_duplicate_with_slice, select_valid_portion};
use super::{ConvolutionVisitor, DimPair, SpaceToBatchError, TransformRecord};
use crate::builders::{make_concat, make_convolve, make_pad, make_reshape, make_zero};
use crate::common::DimSize;
use crate::hlo::{Computation, ConvolutionParams, NodeId, Op};
use crate::window::{ConvDimensionNumbers, PaddingConfig, WindowDimension};

/// Assigns the output roles of a space-to-batched convolution: spatial roles
/// in order, the batch axis directly before the split one, the feature axis
/// last. Returns where each axis of `original`'s output ends up.
fn batched_output_roles(
    dnums: &mut ConvDimensionNumbers,
    original: &ConvDimensionNumbers,
    chosen_spatial: usize,
) -> Vec<usize> {
    let mut count = 0;
    for j in 0..original.output_spatial_dimensions.len() {
        if j == chosen_spatial {
            dnums.output_batch_dimension = count;
            count += 1;
        }
        dnums.output_spatial_dimensions[j] = count;
        count += 1;
    }
    dnums.output_feature_dimension = count;

    let mut permutation = vec![0; count + 1];
    permutation[original.output_batch_dimension] = dnums.output_batch_dimension;
    permutation[original.output_feature_dimension] = dnums.output_feature_dimension;
    for (j, &axis) in original.output_spatial_dimensions.iter().enumerate() {
        permutation[axis] = dnums.output_spatial_dimensions[j];
    }
    permutation
}

fn convolution_params(
    c: &Computation,
    convolution: NodeId,
) -> Result<ConvolutionParams, SpaceToBatchError> {
    match c.op(convolution) {
        Op::Convolution(params) => Ok(params.clone()),
        _ => Err(SpaceToBatchError::Unsupported(convolution, "not a convolution")),
    }
}

impl ConvolutionVisitor<'_> {
    /// Space-to-batches an eligible convolution from its original layout and
    /// then walks its consumers.
    pub(super) fn rewrite_convolution(
        &mut self,
        convolution: NodeId,
    ) -> Result<(), SpaceToBatchError> {
        log::debug!("Rewriting {}", self.c.node_to_string(convolution));
        let params = convolution_params(self.c, convolution)?;
        let g = ConvGeometry::compute(self.c, convolution)?;
        let original = &params.dimension_numbers;
        let mut dnums = original.clone();

        let activations = self.c.operand(convolution, 0);
        let kernel = self.c.operand(convolution, 1);
        let old_batch_size = self.c.shape(activations).dim(original.input_batch_dimension);
        let num_splits = self.config.new_batch_size / old_batch_size;
        let reduce_window_stride = self.find_reduce_window_stride(convolution, &params, &g);
        let split_size = g.split_size_for_rewrite(num_splits, reduce_window_stride);
        log::trace!(
            "Splitting {} into {} splits of {} (reduce-window stride {:?})",
            convolution,
            num_splits,
            split_size,
            reduce_window_stride
        );

        let adjacent = bring_space_next_to_batch(
            self.c,
            activations,
            &mut dnums,
            original.input_batch_dimension,
            g.split_axis,
        )?;
        let (batch_axis, space_axis) = (adjacent.batch_axis, adjacent.space_axis);
        let mut act = adjacent.activations;
        let dtype = self.c.shape(act).dtype;
        let zero = make_zero(self.c, dtype);

        // Materialize the inherent padding, and enough trailing zeros to fill
        // every split.
        let pad_size = split_size * num_splits - g.spatial_size;
        if pad_size != 0 || g.low_padding != 0 || g.high_padding != 0 {
            let low = if g.base_dilation == 1 { g.low_padding } else { 0 };
            let config = PaddingConfig::zero(self.c.shape(act).rank()).with_edge(
                space_axis,
                low,
                g.high_padding + pad_size,
            );
            act = make_pad(self.c, act, zero, &config)?;
        }

        let mut dims = self.c.shape(act).dims.to_vec();
        dims[batch_axis] *= num_splits;
        dims[space_axis] = split_size;
        act = make_reshape(self.c, &dims, act)?;
        act = halo_duplicate_with_slice(
            self.c,
            act,
            space_axis,
            batch_axis,
            old_batch_size,
            0,
            g.halo_size,
            zero,
        )?;

        let permutation = batched_output_roles(&mut dnums, original, g.chosen_spatial);
        let mut window = params.window.clone();
        window.dimensions[g.chosen_spatial].padding_low = g.low_padding_for_conv;
        window.dimensions[g.chosen_spatial].padding_high = g.high_padding_for_conv;
        let new_conv = make_convolve(
            self.c,
            act,
            kernel,
            params.feature_group_count,
            params.batch_group_count,
            window,
            dnums.clone(),
        )?;

        let old_shape = self.c.shape(convolution).clone();
        let chosen_output = original.output_spatial_dimensions[g.chosen_spatial];
        let masked = select_valid_portion(
            self.c,
            new_conv,
            &old_shape,
            zero,
            dnums.output_batch_dimension,
            dnums.output_spatial_dimensions[g.chosen_spatial],
            original.output_batch_dimension,
            chosen_output,
        )?;

        self.insert_record(
            convolution,
            TransformRecord {
                new: masked,
                dims: DimPair {
                    batch: original.output_batch_dimension,
                    space: chosen_output,
                },
                permutation: Some(permutation),
            },
        );
        self.convs_to_visit.remove(&convolution);
        // An earlier walk may have stopped here; the rewrite settles that.
        self.blocked.shift_remove(&convolution);
        self.changed = true;
        self.propagate_on_users(convolution)
    }

    /// The stride, along the split dimension, of a reduce-window fed by
    /// `convolution` through at most `reduce_window_search_depth` consumers.
    fn find_reduce_window_stride(
        &self,
        convolution: NodeId,
        params: &ConvolutionParams,
        g: &ConvGeometry,
    ) -> Option<DimSize> {
        let output_dims = &self.c.shape(convolution).dims;
        let split_output =
            params.dimension_numbers.output_spatial_dimensions[g.chosen_spatial];
        let mut visited = HashSet::from([convolution]);
        let mut queue = VecDeque::from([(convolution, 0)]);
        while let Some((node, depth)) = queue.pop_front() {
            for &user in self.c.users(node) {
                if !visited.insert(user) {
                    continue;
                }
                match self.c.op(user) {
                    Op::ReduceWindow { window, .. } => {
                        let operand = self.c.operand(user, 0);
                        if &self.c.shape(operand).dims == output_dims {
                            return Some(window.dimensions[split_output].stride);
                        }
                    }
                    Op::Convolution(_) | Op::Pad(_) | Op::Transpose { .. } => {}
                    _ if depth + 1 < self.config.reduce_window_search_depth => {
                        queue.push_back((user, depth + 1));
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// Rewrites an eligible convolution whose activations were already
    /// space-to-batched. The result stays space-to-batched.
    pub(super) fn propagate_on_conv(
        &mut self,
        convolution: NodeId,
    ) -> Result<bool, SpaceToBatchError> {
        let params = convolution_params(self.c, convolution)?;
        let g = ConvGeometry::compute(self.c, convolution)?;
        let original = &params.dimension_numbers;
        let activations_old = self.c.operand(convolution, 0);
        let kernel = self.c.operand(convolution, 1);
        let record = self.record(activations_old)?.clone();
        let permutation = self.permutation(activations_old)?.to_vec();
        let new_dims = record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(activations_old))?;

        let old_shape = self.c.shape(activations_old).clone();
        let zero = make_zero(self.c, old_shape.dtype);
        let masked = select_valid_portion(
            self.c,
            record.new,
            &old_shape,
            zero,
            new_dims.batch,
            new_dims.space,
            original.input_batch_dimension,
            g.split_axis,
        )?;

        let mut dnums = original.clone();
        dnums.input_batch_dimension = permutation[original.input_batch_dimension];
        dnums.input_feature_dimension = permutation[original.input_feature_dimension];
        for axis in dnums.input_spatial_dimensions.iter_mut() {
            *axis = permutation[*axis];
        }
        let adjacent = bring_space_next_to_batch(
            self.c,
            masked,
            &mut dnums,
            new_dims.batch,
            new_dims.space,
        )?;
        let (batch_axis, space_axis) = (adjacent.batch_axis, adjacent.space_axis);
        let mut act = adjacent.activations;

        let old_batch_size = old_shape.dim(original.input_batch_dimension);
        let new_batch_size = self.c.shape(act).dim(batch_axis);
        let num_splits = new_batch_size / old_batch_size;
        let incoming_split_size = self.c.shape(act).dim(space_axis);
        let split_size = propagated_split_size(&g, num_splits, incoming_split_size);
        if split_size > incoming_split_size {
            log::trace!("Growing splits of {convolution} from {incoming_split_size} to {split_size}");
            let mut dims = self.c.shape(act).dims.to_vec();
            dims[batch_axis] = old_batch_size;
            dims[space_axis] = incoming_split_size * num_splits;
            act = make_reshape(self.c, &dims, act)?;
            let config = PaddingConfig::zero(dims.len()).with_edge(
                space_axis,
                0,
                (split_size - incoming_split_size) * num_splits,
            );
            act = make_pad(self.c, act, zero, &config)?;
            dims[batch_axis] = new_batch_size;
            dims[space_axis] = split_size;
            act = make_reshape(self.c, &dims, act)?;
        }
        act = halo_duplicate_with_slice(
            self.c,
            act,
            space_axis,
            batch_axis,
            old_batch_size,
            g.low_padding,
            g.halo_size,
            zero,
        )?;

        let output_permutation = batched_output_roles(&mut dnums, original, g.chosen_spatial);
        let mut window = params.window.clone();
        window.dimensions[g.chosen_spatial].padding_low = g.low_padding_for_conv;
        window.dimensions[g.chosen_spatial].padding_high = g.high_padding_for_conv;
        let new_conv = make_convolve(
            self.c,
            act,
            kernel,
            params.feature_group_count,
            params.batch_group_count,
            window,
            dnums,
        )?;

        self.insert_record(
            convolution,
            TransformRecord {
                new: new_conv,
                dims: DimPair {
                    batch: original.output_batch_dimension,
                    space: original.output_spatial_dimensions[g.chosen_spatial],
                },
                permutation: Some(output_permutation),
            },
        );
        self.convs_to_visit.remove(&convolution);
        Ok(true)
    }

    /// Rewrites a convolution that reduces over the (space-to-batched) batch
    /// of both its operands, as in a filter gradient. Each output position
    /// along the split dimension gets its own copy of the activations,
    /// shifted by that position; a new spatial axis stacks the copies. The
    /// result has the original layout.
    pub(super) fn propagate_on_backprop_filter_conv(
        &mut self,
        convolution: NodeId,
    ) -> Result<bool, SpaceToBatchError> {
        let params = convolution_params(self.c, convolution)?;
        let original = &params.dimension_numbers;
        let chosen = super::geometry::chosen_spatial_dim(&params)
            .ok_or(SpaceToBatchError::Unsupported(convolution, "no spatial dimensions"))?;
        let activations_old = self.c.operand(convolution, 0);
        let kernel_old = self.c.operand(convolution, 1);
        let act_record = self.record(activations_old)?.clone();
        let kernel_record = self.record(kernel_old)?.clone();
        let permutation = self.permutation(activations_old)?.to_vec();
        let act_dims = act_record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(activations_old))?;
        let kernel_dims = kernel_record
            .new_dims()
            .ok_or(SpaceToBatchError::MissingPermutation(kernel_old))?;

        let act_shape = self.c.shape(activations_old).clone();
        let kernel_shape = self.c.shape(kernel_old).clone();
        let zero = make_zero(self.c, act_shape.dtype);
        let act = select_valid_portion(
            self.c,
            act_record.new,
            &act_shape,
            zero,
            act_dims.batch,
            act_dims.space,
            original.input_feature_dimension,
            original.input_spatial_dimensions[chosen],
        )?;
        let kernel = select_valid_portion(
            self.c,
            kernel_record.new,
            &kernel_shape,
            zero,
            kernel_dims.batch,
            kernel_dims.space,
            original.kernel_input_feature_dimension,
            original.kernel_spatial_dimensions[chosen],
        )?;

        let rank = act_shape.rank();
        let new_spatial = rank;
        let mut dnums = original.clone();
        dnums.input_batch_dimension = permutation[original.input_batch_dimension];
        dnums.input_feature_dimension = permutation[original.input_feature_dimension];
        for axis in dnums.input_spatial_dimensions.iter_mut() {
            *axis = permutation[*axis];
        }
        dnums.input_spatial_dimensions.push(new_spatial);
        dnums.kernel_input_feature_dimension =
            permutation[original.kernel_input_feature_dimension];
        dnums.kernel_output_feature_dimension =
            permutation[original.kernel_output_feature_dimension];
        for axis in dnums.kernel_spatial_dimensions.iter_mut() {
            *axis = permutation[*axis];
        }
        dnums.kernel_spatial_dimensions.push(new_spatial);
        // The stacked copies produce the split dimension's output; the
        // original split role collapses to a single element.
        let chosen_output = original.output_spatial_dimensions[chosen];
        dnums.output_spatial_dimensions[chosen] = new_spatial;
        dnums.output_spatial_dimensions.push(chosen_output);

        let window_dim = &params.window.dimensions[chosen];
        let dilation = window_dim.window_dilation;
        let low_padding = window_dim.padding_low;
        let old_batch_size = act_shape.dim(original.input_feature_dimension);
        let output_size = self.c.shape(convolution).dim(chosen_output);
        let (batch_axis, space_axis) = (act_dims.batch, act_dims.space);

        // Copy number `i` reads the activations shifted by `i - low_padding`.
        let shift = |c: &mut Computation, node: NodeId, toward_end: bool| {
            halo_duplicate_with_slice(
                c,
                node,
                space_axis,
                batch_axis,
                old_batch_size,
                if toward_end { -1 } else { 1 },
                0,
                zero,
            )
        };
        let mut chunks = vec![];
        let mut previous = act;
        for _ in 0..low_padding.max(0) {
            previous = shift(self.c, previous, false)?;
            chunks.push(previous);
        }
        chunks.reverse();
        let mut next = act;
        for _ in 0..(-low_padding).max(0) {
            next = shift(self.c, next, true)?;
        }
        let output_len = usize::try_from(output_size).unwrap_or(0);
        if chunks.len() < output_len {
            chunks.push(next);
        }
        while chunks.len() < output_len {
            next = shift(self.c, next, true)?;
            chunks.push(next);
        }
        chunks.truncate(output_len);

        let stacked = chunks
            .into_iter()
            .map(|chunk| {
                let dims = self.c.shape(chunk).dims.iter().copied().chain([1]).collect_vec();
                make_reshape(self.c, &dims, chunk)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let stacked = make_concat(self.c, &stacked, new_spatial)?;
        let kernel_dims_with_one = self
            .c
            .shape(kernel)
            .dims
            .iter()
            .copied()
            .chain([1])
            .collect_vec();
        let kernel = make_reshape(self.c, &kernel_dims_with_one, kernel)?;

        let kernel_split_size = self.c.shape(kernel).dim(kernel_dims.space);
        let mut window = params.window.clone();
        window.dimensions[chosen] = WindowDimension::new(kernel_split_size)
            .with_window_dilation(dilation)
            .with_padding(0, -(dilation - 1));
        window.dimensions.push(WindowDimension::new(1));
        let new_conv = make_convolve(
            self.c,
            stacked,
            kernel,
            params.feature_group_count,
            params.batch_group_count,
            window,
            dnums,
        )?;
        let old_dims = self.c.shape(convolution).dims.to_vec();
        let result = make_reshape(self.c, &old_dims, new_conv)?;

        self.insert_record(
            convolution,
            TransformRecord {
                new: result,
                dims: DimPair {
                    batch: original.output_batch_dimension,
                    space: chosen_output,
                },
                permutation: None,
            },
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{make_reduce_window, make_unary};
    use crate::common::Dtype;
    use crate::hlo::{Reducer, UnaryOp};
    use crate::space_to_batch::test_graphs::{conv_1xw, conv_1xw_on, f32_shape};
    use crate::space_to_batch::{ConverterConfig, NodeState};
    use crate::window::Window;

    #[test]
    fn test_output_roles_put_batch_before_split() {
        let original = ConvDimensionNumbers::channels_last(2);
        let mut dnums = original.clone();
        let permutation = batched_output_roles(&mut dnums, &original, 1);
        assert_eq!(dnums.output_spatial_dimensions.as_slice(), &[0, 2]);
        assert_eq!(dnums.output_batch_dimension, 1);
        assert_eq!(dnums.output_feature_dimension, 3);
        assert_eq!(permutation, vec![1, 0, 2, 3]);
    }

    #[test]
    fn test_rewritten_conv_is_space_to_batched() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        c.set_root(conv);
        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(conv).unwrap();
        let record = visitor.transformed[&conv].clone();
        // Eight splits of 3 elements; the output layout is
        // [height, batch, width, feature].
        assert_eq!(visitor.c.shape(record.new), &f32_shape(&[1, 8, 3, 2]));
        assert_eq!(record.dims, DimPair { batch: 0, space: 2 });
        assert_eq!(record.permutation, Some(vec![1, 0, 2, 3]));
        let root = visitor.c.root().unwrap();
        assert_eq!(visitor.c.shape(root), &f32_shape(&[1, 1, 16, 2]));
        visitor.c.verify().unwrap();
    }

    #[test]
    fn test_lookahead_finds_reduce_window_stride() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let neg = make_unary(&mut c, UnaryOp::Negate, conv).unwrap();
        let init = make_zero(&mut c, Dtype::Float32);
        let window = Window::new([
            WindowDimension::new(1),
            WindowDimension::new(1),
            WindowDimension::new(2).with_stride(2),
            WindowDimension::new(1),
        ]);
        let pool = make_reduce_window(&mut c, neg, init, window, Reducer::Maximum).unwrap();
        c.set_root(pool);
        let config = ConverterConfig::default();
        let visitor = ConvolutionVisitor::new(&mut c, &config);
        let params = convolution_params(visitor.c, conv).unwrap();
        let g = ConvGeometry::compute(visitor.c, conv).unwrap();
        assert_eq!(visitor.find_reduce_window_stride(conv, &params, &g), Some(2));

        let shallow = ConverterConfig {
            reduce_window_search_depth: 1,
            ..ConverterConfig::default()
        };
        let visitor = ConvolutionVisitor::new(&mut c, &shallow);
        assert_eq!(visitor.find_reduce_window_stride(conv, &params, &g), None);
    }

    #[test]
    fn test_chained_conv_is_propagated_into() {
        let mut c = Computation::new("c");
        let first = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let second = conv_1xw_on(&mut c, first, 2, 3, 1, (1, 1));
        c.set_root(second);
        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        assert_eq!(visitor.conv_visitor_list, vec![first, second]);
        visitor.rewrite_convolution(first).unwrap();
        assert_eq!(visitor.state(second), NodeState::Transformed);
        assert!(!visitor.convs_to_visit.contains(&second));
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
        let root = c.root().unwrap();
        assert_eq!(c.shape(root), &f32_shape(&[1, 1, 16, 2]));
    }

    #[test]
    fn test_blocked_strided_conv_is_rewritten_from_its_own_layout() {
        let mut c = Computation::new("c");
        let first = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        // Splits of 3 cannot feed a stride of 2.
        let second = conv_1xw_on(&mut c, first, 2, 2, 2, (0, 0));
        c.set_root(second);
        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.rewrite_convolution(first).unwrap();
        assert_eq!(visitor.state(second), NodeState::Blocked);
        visitor.rewrite_convolution(second).unwrap();
        assert_eq!(visitor.state(second), NodeState::Transformed);
        assert!(visitor.run().unwrap());
        c.verify().unwrap();
        assert_eq!(c.shape(c.root().unwrap()), &f32_shape(&[1, 1, 8, 2]));
    }
}
