//! Descriptors for windowed operations: convolution windows, padding
//! configurations, and the axis-role assignment of a convolution.

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::common::DimSize;

/// Window parameters along one spatial axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowDimension {
    pub size: DimSize,
    pub stride: DimSize,
    pub padding_low: DimSize,
    pub padding_high: DimSize,
    pub window_dilation: DimSize,
    pub base_dilation: DimSize,
    pub window_reversal: bool,
}

impl WindowDimension {
    pub fn new(size: DimSize) -> Self {
        WindowDimension {
            size,
            stride: 1,
            padding_low: 0,
            padding_high: 0,
            window_dilation: 1,
            base_dilation: 1,
            window_reversal: false,
        }
    }

    pub fn with_stride(mut self, stride: DimSize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, low: DimSize, high: DimSize) -> Self {
        self.padding_low = low;
        self.padding_high = high;
        self
    }

    pub fn with_base_dilation(mut self, base_dilation: DimSize) -> Self {
        self.base_dilation = base_dilation;
        self
    }

    pub fn with_window_dilation(mut self, window_dilation: DimSize) -> Self {
        self.window_dilation = window_dilation;
        self
    }

    /// Extent of the window once window dilation is applied.
    pub fn dilated_size(&self) -> DimSize {
        if self.size == 0 {
            0
        } else {
            (self.size - 1) * self.window_dilation + 1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub dimensions: SmallVec<[WindowDimension; 4]>,
}

impl Window {
    pub fn new(dimensions: impl IntoIterator<Item = WindowDimension>) -> Self {
        Window {
            dimensions: dimensions.into_iter().collect(),
        }
    }

    /// A window of size 1 and stride 1 along every axis.
    pub fn trivial(rank: usize) -> Self {
        Window {
            dimensions: (0..rank).map(|_| WindowDimension::new(1)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PaddingDimension {
    pub low: DimSize,
    pub high: DimSize,
    pub interior: DimSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaddingConfig {
    pub dimensions: SmallVec<[PaddingDimension; 6]>,
}

impl PaddingConfig {
    /// No padding along any of `rank` axes.
    pub fn zero(rank: usize) -> Self {
        PaddingConfig {
            dimensions: smallvec![PaddingDimension::default(); rank],
        }
    }

    /// A copy of `self` with edge padding set on `axis`.
    pub fn with_edge(mut self, axis: usize, low: DimSize, high: DimSize) -> Self {
        self.dimensions[axis].low = low;
        self.dimensions[axis].high = high;
        self
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }
}

/// Assigns the roles batch, feature, and spatial axes to the physical axes of a
/// convolution's input, kernel, and output.
///
/// Spatial roles are ordered; `input_spatial_dimensions[i]`,
/// `kernel_spatial_dimensions[i]`, `output_spatial_dimensions[i]`, and the
/// convolution window's `dimensions[i]` all describe spatial role `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvDimensionNumbers {
    pub input_batch_dimension: usize,
    pub input_feature_dimension: usize,
    pub input_spatial_dimensions: SmallVec<[usize; 4]>,
    pub kernel_input_feature_dimension: usize,
    pub kernel_output_feature_dimension: usize,
    pub kernel_spatial_dimensions: SmallVec<[usize; 4]>,
    pub output_batch_dimension: usize,
    pub output_feature_dimension: usize,
    pub output_spatial_dimensions: SmallVec<[usize; 4]>,
}

impl ConvDimensionNumbers {
    /// Channels-last roles: activations and outputs laid out as
    /// `[batch, spatial.., feature]`, kernels as `[spatial.., in, out]`.
    pub fn channels_last(spatial_rank: usize) -> Self {
        let spatial: SmallVec<[usize; 4]> = (1..=spatial_rank).collect();
        ConvDimensionNumbers {
            input_batch_dimension: 0,
            input_feature_dimension: spatial_rank + 1,
            input_spatial_dimensions: spatial.clone(),
            kernel_input_feature_dimension: spatial_rank,
            kernel_output_feature_dimension: spatial_rank + 1,
            kernel_spatial_dimensions: (0..spatial_rank).collect(),
            output_batch_dimension: 0,
            output_feature_dimension: spatial_rank + 1,
            output_spatial_dimensions: spatial,
        }
    }

    pub fn spatial_rank(&self) -> usize {
        self.input_spatial_dimensions.len()
    }

    /// Rank of the input, kernel, and output tensors.
    pub fn tensor_rank(&self) -> usize {
        self.spatial_rank() + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_last_roles_cover_every_axis() {
        let dnums = ConvDimensionNumbers::channels_last(2);
        let mut input = vec![dnums.input_batch_dimension, dnums.input_feature_dimension];
        input.extend(dnums.input_spatial_dimensions.iter().copied());
        input.sort_unstable();
        assert_eq!(input, vec![0, 1, 2, 3]);

        let mut kernel = vec![
            dnums.kernel_input_feature_dimension,
            dnums.kernel_output_feature_dimension,
        ];
        kernel.extend(dnums.kernel_spatial_dimensions.iter().copied());
        kernel.sort_unstable();
        assert_eq!(kernel, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dilated_size() {
        assert_eq!(WindowDimension::new(3).dilated_size(), 3);
        assert_eq!(
            WindowDimension::new(3).with_window_dilation(2).dilated_size(),
            5
        );
        assert_eq!(WindowDimension::new(0).dilated_size(), 0);
    }
}
