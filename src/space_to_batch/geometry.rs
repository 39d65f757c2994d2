use super::SpaceToBatchError;
use crate::common::{DimSize, Shape};
use crate::hlo::{Computation, ConvolutionParams, NodeId, Op};
use crate::utils::round_up_to_multiple;

/// Sizes along the spatial dimension a convolution is split on.
///
/// Always computed from the convolution's own dimension numbers and operand
/// shapes, never from a re-laid-out copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Index of the split dimension among the spatial roles.
    pub chosen_spatial: usize,
    /// Activation axis of the split dimension.
    pub split_axis: usize,
    pub low_padding: DimSize,
    pub high_padding: DimSize,
    pub stride: DimSize,
    pub base_dilation: DimSize,
    pub kernel_size: DimSize,
    /// Activation extent along the split axis.
    pub input_size: DimSize,
    /// Extent once the inherent padding is materialized.
    pub spatial_size: DimSize,
    /// How far each split's window reaches into the next split.
    pub halo_size: DimSize,
    pub low_padding_for_conv: DimSize,
    pub high_padding_for_conv: DimSize,
    /// Output extent along the split dimension.
    pub output_size: DimSize,
}

/// The spatial role a convolution is split along: the last one.
pub fn chosen_spatial_dim(params: &ConvolutionParams) -> Option<usize> {
    params
        .dimension_numbers
        .input_spatial_dimensions
        .len()
        .checked_sub(1)
}

impl ConvGeometry {
    pub fn compute(c: &Computation, convolution: NodeId) -> Result<Self, SpaceToBatchError> {
        let Op::Convolution(params) = c.op(convolution) else {
            return Err(SpaceToBatchError::Unsupported(convolution, "not a convolution"));
        };
        let input = c.shape(c.operand(convolution, 0));
        let kernel = c.shape(c.operand(convolution, 1));
        Self::from_parts(params, input, kernel, c.shape(convolution))
            .ok_or(SpaceToBatchError::Unsupported(convolution, "no spatial dimensions"))
    }

    /// Returns `None` if the convolution has no spatial dimensions.
    pub fn from_parts(
        params: &ConvolutionParams,
        input: &Shape,
        kernel: &Shape,
        output: &Shape,
    ) -> Option<Self> {
        let chosen_spatial = chosen_spatial_dim(params)?;
        let dnums = &params.dimension_numbers;
        let window = &params.window.dimensions[chosen_spatial];
        let split_axis = dnums.input_spatial_dimensions[chosen_spatial];
        let kernel_size = kernel.dim(dnums.kernel_spatial_dimensions[chosen_spatial]);
        let input_size = input.dim(split_axis);
        let base_dilation = window.base_dilation;
        let low_padding = window.padding_low;
        let high_padding = window.padding_high;

        let spatial_size =
            input_size + if base_dilation > 1 { 0 } else { low_padding } + high_padding;
        let halo_size = (kernel_size - window.stride - (base_dilation - 1)).max(0);
        let high_padding_for_conv = if base_dilation == 1 || low_padding != 0 {
            0
        } else {
            base_dilation - 1
        };
        let low_padding_for_conv = if base_dilation == 1 { 0 } else { low_padding };

        Some(ConvGeometry {
            chosen_spatial,
            split_axis,
            low_padding,
            high_padding,
            stride: window.stride,
            base_dilation,
            kernel_size,
            input_size,
            spatial_size,
            halo_size,
            low_padding_for_conv,
            high_padding_for_conv,
            output_size: output.dim(dnums.output_spatial_dimensions[chosen_spatial]),
        })
    }

    /// The smallest split size producing a `1 / num_splits` share of the
    /// output, before any growth.
    fn initial_split_size(&self, num_splits: DimSize) -> DimSize {
        let outputs_per_split = divrem::DivCeil::div_ceil(self.output_size, num_splits);
        divrem::DivCeil::div_ceil(outputs_per_split, self.base_dilation) * self.stride
    }

    /// Per-split extent of the activations for a convolution rewritten from
    /// its original layout. The splits must jointly cover the padded input;
    /// `reduce_window_stride`, when given, is the stride of a downstream
    /// reduce-window the per-split output must be divisible by.
    pub fn split_size_for_rewrite(
        &self,
        num_splits: DimSize,
        reduce_window_stride: Option<DimSize>,
    ) -> DimSize {
        let mut split_size = self.initial_split_size(num_splits);
        while split_size * num_splits < self.spatial_size {
            split_size += self.stride;
        }
        if let Some(window_stride) = reduce_window_stride.filter(|&s| s > 1) {
            split_size =
                round_up_to_multiple(split_size / self.stride, window_stride) * self.stride;
        }
        split_size
    }

    /// Per-split extent for a convolution whose activations are already
    /// space-to-batched. The last split's halo may stand in for input, since
    /// it is read from the masked tail.
    pub fn split_size_for_propagation(&self, num_splits: DimSize) -> DimSize {
        let mut split_size = self.initial_split_size(num_splits);
        while split_size * num_splits + self.halo_size < self.spatial_size {
            split_size += self.stride;
        }
        split_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_to_batch::test_graphs::conv_1xw;
    use proptest::prelude::*;

    #[test]
    fn test_geometry_of_padded_stride_one_conv() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 16, 2, 3, 1, (1, 1));
        let g = ConvGeometry::compute(&c, conv).unwrap();
        assert_eq!(g.chosen_spatial, 1);
        assert_eq!(g.split_axis, 2);
        assert_eq!(g.spatial_size, 18);
        assert_eq!(g.halo_size, 2);
        assert_eq!(g.output_size, 16);
        assert_eq!(g.low_padding_for_conv, 0);
        assert_eq!(g.high_padding_for_conv, 0);
        // ceil(16 / 8) = 2 grows to 3 so that 8 splits cover 18 elements.
        assert_eq!(g.split_size_for_rewrite(8, None), 3);
        assert_eq!(g.split_size_for_rewrite(4, None), 5);
        // A window of stride 2 downstream needs an even output per split.
        assert_eq!(g.split_size_for_rewrite(8, Some(2)), 4);
        assert_eq!(g.split_size_for_propagation(8), 2);
    }

    #[test]
    fn test_geometry_of_strided_conv() {
        let mut c = Computation::new("c");
        let conv = conv_1xw(&mut c, 1, 17, 1, 3, 2, (0, 0));
        let g = ConvGeometry::compute(&c, conv).unwrap();
        assert_eq!(g.halo_size, 1);
        assert_eq!(g.output_size, 8);
        let split = g.split_size_for_rewrite(4, None);
        assert_eq!(split % g.stride, 0);
        assert!(split * 4 >= g.spatial_size);
    }

    #[test]
    fn test_non_convolution_is_rejected() {
        let mut c = Computation::new("c");
        let p = c.add_parameter(Shape::new(crate::common::Dtype::Float32, [2]));
        assert!(matches!(
            ConvGeometry::compute(&c, p),
            Err(SpaceToBatchError::Unsupported(..))
        ));
    }

    proptest! {
        #[test]
        fn test_rewrite_splits_cover_the_padded_input(
            width in 4..40i64,
            kernel in 1..5i64,
            stride in 1..3i64,
            num_splits in 1..9i64,
        ) {
            prop_assume!(width >= kernel);
            let mut c = Computation::new("c");
            let conv = conv_1xw(&mut c, 1, width, 1, kernel, stride, (0, 0));
            let g = ConvGeometry::compute(&c, conv).unwrap();
            let split = g.split_size_for_rewrite(num_splits, None);
            prop_assert_eq!(split % stride, 0);
            prop_assert!(split * num_splits >= g.spatial_size);
            prop_assert!((split / stride) * num_splits >= g.output_size);
        }
    }
}
