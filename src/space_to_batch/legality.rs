//! Which convolutions may be rewritten, and which consumers the rewritten
//! layout may flow into.

use super::geometry::ConvGeometry;
use super::propagation::windowed_halo_size;
use super::{ConverterConfig, ConvolutionVisitor, DimPair, TransformRecord};
use crate::common::DimSize;
use crate::hlo::{ComparisonDirection, Computation, NodeId, Op, Reducer};
use crate::window::WindowDimension;

/// Whether `convolution` can be space-to-batched from its original layout.
pub fn is_eligible_for_rewrite(
    c: &Computation,
    convolution: NodeId,
    config: &ConverterConfig,
) -> bool {
    let Op::Convolution(params) = c.op(convolution) else {
        return false;
    };
    let input = c.shape(c.operand(convolution, 0));
    let kernel = c.shape(c.operand(convolution, 1));
    let Some(g) = ConvGeometry::from_parts(params, input, kernel, c.shape(convolution)) else {
        return false;
    };

    // Batch groups give the batch dimension a meaning other than batch.
    if params.batch_group_count != 1 {
        return false;
    }
    if params.window.dimensions[g.chosen_spatial].window_dilation != 1 {
        return false;
    }
    if g.base_dilation != 1 {
        if g.stride != 1 {
            return false;
        }
        // Only dilations whose padding and kernel the halo duplication can
        // reproduce.
        if g.low_padding == 0 {
            if g.kernel_size != 1 {
                return false;
            }
        } else if g.kernel_size != g.base_dilation + 1 || g.low_padding != g.base_dilation - 1 {
            return false;
        }
    }

    let old_batch_size = input.dim(params.dimension_numbers.input_batch_dimension);
    if old_batch_size < 1 || old_batch_size > config.limit_on_batch_size {
        return false;
    }
    if config.new_batch_size % old_batch_size != 0 {
        return false;
    }
    let num_splits = config.new_batch_size / old_batch_size;
    // A split can only borrow its halo from its immediate neighbor.
    if g.halo_size > divrem::DivCeil::div_ceil(g.spatial_size, num_splits) {
        log::trace!(
            "Halo of {} exceeds a split of {} for {}",
            g.halo_size,
            g.spatial_size,
            convolution
        );
        return false;
    }
    true
}

/// Elementwise ops which may run unchanged on the space-to-batched layout.
/// Copies are left alone.
pub(super) fn is_trivial_elementwise(op: &Op) -> bool {
    op.is_elementwise() && !matches!(op, Op::Copy)
}

impl ConvolutionVisitor<'_> {
    fn is_broadcast_propagatable(&self, broadcast: NodeId, producer: NodeId) -> bool {
        let (Op::Broadcast { dimensions }, Some(record)) =
            (self.c.op(broadcast), self.transformed.get(&producer))
        else {
            return false;
        };
        !dimensions.contains(&record.dims.batch) && !dimensions.contains(&record.dims.space)
    }

    /// Operands an elementwise consumer can rebuild in the new layout without
    /// them being transformed.
    pub(super) fn is_layout_free_operand(&self, operand: NodeId, producer: NodeId) -> bool {
        match self.c.op(operand) {
            Op::Broadcast { .. } => self.is_broadcast_propagatable(operand, producer),
            Op::Constant(literal) => literal.is_splat(),
            _ => false,
        }
    }

    /// Whether `consumer`'s opcode can accept `producer` in the
    /// space-to-batched layout at all. Unsupported consumers get the original
    /// layout back straight away.
    pub(super) fn is_supported_for_propagation(&self, consumer: NodeId, producer: NodeId) -> bool {
        let op = self.c.op(consumer);
        if is_trivial_elementwise(op) {
            return self.c.operands(consumer).iter().all(|&operand| {
                !matches!(self.c.op(operand), Op::Broadcast { .. })
                    || self.is_broadcast_propagatable(operand, producer)
            });
        }
        match op {
            Op::Convolution(_) => true,
            Op::Reduce { dimensions, .. } => {
                let Some(record) = self.propagatable_record(self.c.operand(consumer, 0)) else {
                    return false;
                };
                dimensions.contains(&record.dims.batch) && dimensions.contains(&record.dims.space)
            }
            Op::ReduceWindow { window, .. } | Op::SelectAndScatter { window, .. } => {
                let Some(record) = self.propagatable_record(self.c.operand(consumer, 0)) else {
                    log::trace!("Windowed operand of {consumer} is not space-to-batched");
                    return false;
                };
                let Some(new_dims) = record.new_dims() else {
                    return false;
                };
                if window.dimensions[record.dims.batch].size != 1 {
                    return false;
                }
                let space = &window.dimensions[record.dims.space];
                if space.padding_low != 0 || space.padding_high > space.size {
                    return false;
                }
                let new_space_size = self.c.shape(record.new).dim(new_dims.space);
                space.stride <= 1 || new_space_size % space.stride == 0
            }
            _ => false,
        }
    }

    /// Whether every operand `consumer` needs is ready, so that it can be
    /// rewritten now. Only called for supported consumers.
    pub(super) fn can_propagate(&self, consumer: NodeId, producer: NodeId) -> bool {
        let op = self.c.op(consumer);
        if is_trivial_elementwise(op) {
            return self.can_propagate_elementwise(consumer, producer);
        }
        match op {
            Op::Convolution(_) => {
                if is_eligible_for_rewrite(self.c, consumer, self.config) {
                    self.can_propagate_on_conv(consumer)
                } else {
                    self.can_propagate_on_backprop_filter_conv(consumer)
                }
            }
            Op::Reduce { .. } => self
                .propagatable_record(self.c.operand(consumer, 0))
                .is_some(),
            Op::ReduceWindow { window, .. } => {
                let operand = self.c.operand(consumer, 0);
                self.windowed_operand_fits(operand, window.dimensions.as_slice())
            }
            Op::SelectAndScatter {
                window,
                select,
                scatter,
            } => {
                if *scatter != Reducer::Add {
                    return false;
                }
                if !matches!(
                    select,
                    ComparisonDirection::Ge
                        | ComparisonDirection::Gt
                        | ComparisonDirection::Le
                        | ComparisonDirection::Lt
                ) {
                    return false;
                }
                let operand = self.c.operand(consumer, 0);
                let source = self.c.operand(consumer, 1);
                if !self.windowed_operand_fits(operand, window.dimensions.as_slice()) {
                    return false;
                }
                let (Some(first), Some(second)) = (
                    self.propagatable_record(operand),
                    self.propagatable_record(source),
                ) else {
                    return false;
                };
                if first.dims != second.dims || first.permutation != second.permutation {
                    return false;
                }
                let (Some(first_dims), Some(second_dims)) = (first.new_dims(), second.new_dims())
                else {
                    return false;
                };
                let first_shape = self.c.shape(first.new);
                let second_shape = self.c.shape(second.new);
                if first_shape.dim(first_dims.batch) != second_shape.dim(second_dims.batch) {
                    return false;
                }
                let space = &window.dimensions[first.dims.space];
                let operand_space = first_shape.dim(first_dims.space);
                let source_space = second_shape.dim(second_dims.space);
                (operand_space + space.padding_high + space.padding_low) / space.stride
                    == source_space
                    && (operand_space - 1) / space.stride + 1 == source_space
            }
            _ => false,
        }
    }

    fn can_propagate_elementwise(&self, consumer: NodeId, producer: NodeId) -> bool {
        let binary = self.c.op(consumer).is_elementwise_binary();
        let mut pivot: Option<&TransformRecord> = None;
        for &operand in self.c.operands(consumer) {
            if self.is_layout_free_operand(operand, producer) {
                continue;
            }
            let Some(record) = self.propagatable_record(operand) else {
                log::trace!("Cannot yet propagate on elementwise op {consumer}");
                return false;
            };
            let Some(pivot_record) = pivot else {
                pivot = Some(record);
                continue;
            };
            if pivot_record.dims != record.dims || pivot_record.permutation != record.permutation
            {
                log::trace!("Operands of {consumer} disagree on their batch/space ordering");
                return false;
            }
            let Some(new_dims) = record.new_dims() else {
                return false;
            };
            let pivot_shape = self.c.shape(pivot_record.new);
            let shape = self.c.shape(record.new);
            if pivot_shape.rank() != shape.rank() {
                return false;
            }
            for j in 0..shape.rank() {
                if pivot_shape.dim(j) == shape.dim(j) {
                    continue;
                }
                // Binary operands may differ along the split axis only; the
                // shorter one gets padded out, which needs batch and split to
                // be adjacent.
                if !(binary && j == new_dims.space && new_dims.batch + 1 == new_dims.space) {
                    log::trace!("Operands of {consumer} differ in size along axis {j}");
                    return false;
                }
            }
        }
        pivot.is_some()
    }

    fn can_propagate_on_conv(&self, convolution: NodeId) -> bool {
        let Op::Convolution(params) = self.c.op(convolution) else {
            return false;
        };
        let activations = self.c.operand(convolution, 0);
        let Some(record) = self.propagatable_record(activations) else {
            return false;
        };
        let Ok(g) = ConvGeometry::compute(self.c, convolution) else {
            return false;
        };
        let dnums = &params.dimension_numbers;
        let expected = DimPair {
            batch: dnums.input_batch_dimension,
            space: g.split_axis,
        };
        if record.dims != expected {
            return false;
        }
        let Some(new_dims) = record.new_dims() else {
            return false;
        };
        let new_shape = self.c.shape(record.new);
        if new_shape.dim(new_dims.batch) != self.config.new_batch_size {
            return false;
        }
        if g.base_dilation != 1 || g.low_padding < 0 || g.low_padding > g.halo_size {
            return false;
        }
        let old_batch_size = self.c.shape(activations).dim(expected.batch);
        let num_splits = self.config.new_batch_size / old_batch_size;
        let split_size = propagated_split_size(&g, num_splits, new_shape.dim(new_dims.space));
        split_size % g.stride == 0
    }

    fn can_propagate_on_backprop_filter_conv(&self, convolution: NodeId) -> bool {
        let Op::Convolution(params) = self.c.op(convolution) else {
            return false;
        };
        let Some(chosen) = super::geometry::chosen_spatial_dim(params) else {
            return false;
        };
        let window = &params.window.dimensions[chosen];
        if window.stride != 1 || window.base_dilation != 1 {
            return false;
        }
        if params.feature_group_count != 1 || params.batch_group_count != 1 {
            return false;
        }
        let (Some(activations), Some(kernel)) = (
            self.propagatable_record(self.c.operand(convolution, 0)),
            self.propagatable_record(self.c.operand(convolution, 1)),
        ) else {
            return false;
        };
        if activations.permutation != kernel.permutation {
            return false;
        }
        let dnums = &params.dimension_numbers;
        // Activations are batched along their feature role, the output
        // gradient along the kernel's input feature role.
        let activation_dims = DimPair {
            batch: dnums.input_feature_dimension,
            space: dnums.input_spatial_dimensions[chosen],
        };
        let kernel_dims = DimPair {
            batch: dnums.kernel_input_feature_dimension,
            space: dnums.kernel_spatial_dimensions[chosen],
        };
        if activations.dims != activation_dims || kernel.dims != kernel_dims {
            return false;
        }
        let (Some(act_new), Some(ker_new)) = (activations.new_dims(), kernel.new_dims()) else {
            return false;
        };
        if act_new.batch + 1 != act_new.space {
            return false;
        }
        let act_shape = self.c.shape(activations.new);
        let ker_shape = self.c.shape(kernel.new);
        if act_shape.dim(act_new.batch) != ker_shape.dim(ker_new.batch) {
            return false;
        }
        act_shape.dim(act_new.space) == window.window_dilation * ker_shape.dim(ker_new.space)
    }

    /// Whether a windowed consumer's operand is transformed and its splits
    /// are wide enough for the window.
    fn windowed_operand_fits(&self, operand: NodeId, window: &[WindowDimension]) -> bool {
        let Some(record) = self.propagatable_record(operand) else {
            return false;
        };
        let Some(new_dims) = record.new_dims() else {
            return false;
        };
        let space = &window[record.dims.space];
        let new_shape = self.c.shape(record.new);
        let new_space_size = new_shape.dim(new_dims.space);
        let new_batch_size = new_shape.dim(new_dims.batch);
        let old_shape = self.c.shape(operand);
        let old_batch_size = old_shape.dim(record.dims.batch);
        if old_batch_size < 1 || new_batch_size % old_batch_size != 0 {
            return false;
        }
        if space.stride > 1 && new_space_size % space.stride != 0 {
            return false;
        }
        if windowed_halo_size(new_space_size, space.stride, space.size) > new_space_size {
            return false;
        }
        let num_splits = new_batch_size / old_batch_size;
        let old_output_size = crate::shape_inference::windowed_output_size(
            old_shape.dim(record.dims.space),
            space,
        );
        num_splits * (new_space_size / space.stride.max(1)) >= old_output_size
    }
}

/// The split size a propagated convolution ends up using: the ideal one if
/// the incoming splits are too short for it, or the incoming split size.
pub(super) fn propagated_split_size(
    g: &ConvGeometry,
    num_splits: DimSize,
    incoming_split_size: DimSize,
) -> DimSize {
    g.split_size_for_propagation(num_splits)
        .max(incoming_split_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::make_convolve;
    use crate::common::{Dtype, Shape};
    use crate::space_to_batch::test_graphs::{conv_1xw, f32_shape, iota_constant};
    use crate::window::{ConvDimensionNumbers, Window};

    #[test]
    fn test_small_batch_padded_conv_is_eligible() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        assert!(is_eligible_for_rewrite(&c, conv, &ConverterConfig::default()));
    }

    #[test]
    fn test_batch_over_limit_is_not_eligible() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 2, 16, 2, 3, 1, (1, 1));
        assert!(!is_eligible_for_rewrite(&c, conv, &ConverterConfig::default()));
        let config = ConverterConfig {
            limit_on_batch_size: 2,
            ..ConverterConfig::default()
        };
        assert!(is_eligible_for_rewrite(&c, conv, &config));
        let config = ConverterConfig {
            limit_on_batch_size: 3,
            new_batch_size: 9,
            ..ConverterConfig::default()
        };
        assert!(!is_eligible_for_rewrite(&c, conv, &config));
    }

    #[test]
    fn test_batch_group_count_of_two_is_not_eligible() {
        let mut c = Computation::new("c");
        let input = c.add_parameter(f32_shape(&[2, 1, 16, 2]));
        let kernel = iota_constant(&mut c, &[1, 3, 2, 4]);
        let window = Window::new([WindowDimension::new(1), WindowDimension::new(3)]);
        let conv = make_convolve(
            &mut c,
            input,
            kernel,
            1,
            2,
            window,
            ConvDimensionNumbers::channels_last(2),
        )
        .unwrap();
        let config = ConverterConfig {
            limit_on_batch_size: 2,
            ..ConverterConfig::default()
        };
        assert!(!is_eligible_for_rewrite(&c, conv, &config));
    }

    #[test]
    fn test_halo_larger_than_a_split_is_not_eligible() {
        let mut c = Computation::new("c");
        // Eight splits of 8 elements give ceil(8 / 8) = 1, but a kernel of 4
        // needs a halo of 3.
        let conv = conv_1xw(&mut c, 1, 8, 1, 4, 1, (0, 0));
        assert!(!is_eligible_for_rewrite(&c, conv, &ConverterConfig::default()));
        // With two splits of 4, the halo of 3 fits.
        let config = ConverterConfig {
            new_batch_size: 2,
            ..ConverterConfig::default()
        };
        assert!(is_eligible_for_rewrite(&c, conv, &config));
    }

    #[test]
    fn test_window_dilation_is_not_eligible() {
        let mut c = Computation::new("c");
        let input = c.add_parameter(f32_shape(&[1, 1, 16, 1]));
        let kernel = iota_constant(&mut c, &[1, 2, 1, 1]);
        let window = Window::new([
            WindowDimension::new(1),
            WindowDimension::new(2).with_window_dilation(2),
        ]);
        let conv = make_convolve(
            &mut c,
            input,
            kernel,
            1,
            1,
            window,
            ConvDimensionNumbers::channels_last(2),
        )
        .unwrap();
        assert!(!is_eligible_for_rewrite(&c, conv, &ConverterConfig::default()));
    }

    #[test]
    fn test_base_dilation_needs_matching_kernel_and_padding() {
        let mut c = Computation::new("c");
        let input = c.add_parameter(f32_shape(&[1, 1, 8, 1]));
        let dilated = |c: &mut Computation, kernel_size: i64, low: i64| {
            let kernel = iota_constant(c, &[1, kernel_size, 1, 1]);
            let window = Window::new([
                WindowDimension::new(1),
                WindowDimension::new(kernel_size)
                    .with_base_dilation(2)
                    .with_padding(low, 0),
            ]);
            make_convolve(
                c,
                input,
                kernel,
                1,
                1,
                window,
                ConvDimensionNumbers::channels_last(2),
            )
            .unwrap()
        };
        let pointwise = dilated(&mut c, 1, 0);
        let matched = dilated(&mut c, 3, 1);
        let mismatched = dilated(&mut c, 2, 1);
        let config = ConverterConfig::default();
        assert!(is_eligible_for_rewrite(&c, pointwise, &config));
        assert!(is_eligible_for_rewrite(&c, matched, &config));
        assert!(!is_eligible_for_rewrite(&c, mismatched, &config));
    }

    #[test]
    fn test_no_spatial_dimensions_is_not_eligible() {
        let mut c = Computation::new("c");
        let input = c.add_parameter(Shape::new(Dtype::Float32, [1, 3]));
        let kernel = iota_constant(&mut c, &[3, 4]);
        let dnums = ConvDimensionNumbers {
            input_batch_dimension: 0,
            input_feature_dimension: 1,
            input_spatial_dimensions: Default::default(),
            kernel_input_feature_dimension: 0,
            kernel_output_feature_dimension: 1,
            kernel_spatial_dimensions: Default::default(),
            output_batch_dimension: 0,
            output_feature_dimension: 1,
            output_spatial_dimensions: Default::default(),
        };
        let conv = make_convolve(&mut c, input, kernel, 1, 1, Window::trivial(0), dnums).unwrap();
        assert!(!is_eligible_for_rewrite(&c, conv, &ConverterConfig::default()));
    }

    #[test]
    fn test_propagated_split_size_never_shrinks_incoming_splits() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let g = ConvGeometry::compute(&c, conv).unwrap();
        assert_eq!(propagated_split_size(&g, 8, 1), 2);
        assert_eq!(propagated_split_size(&g, 8, 3), 3);
    }
}
