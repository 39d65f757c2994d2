//! Output-shape rules for every opcode.

use itertools::Itertools;

use crate::common::{DimSize, Dims, Dtype, Shape};
use crate::hlo::{BinaryOp, ConvolutionParams, Op};
use crate::utils::is_permutation;
use crate::window::{PaddingConfig, Window, WindowDimension};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("Expected {expected} operands for {op} but got {actual}")]
    OperandCount {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Shapes {0} and {1} are incompatible")]
    IncompatibleShapes(Shape, Shape),
    #[error("Expected element type {expected} but got {actual}")]
    DtypeMismatch { expected: Dtype, actual: Dtype },
    #[error("Expected rank {expected} but got {actual}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("Axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },
    #[error("{0:?} is not a permutation")]
    InvalidPermutation(Vec<usize>),
    #[error("Cannot reshape {from} into {to:?}")]
    ElementCountMismatch { from: Shape, to: Vec<DimSize> },
    #[error("Cannot broadcast {operand} into {output:?} with dimensions {dimensions:?}")]
    InvalidBroadcast {
        operand: Shape,
        output: Vec<DimSize>,
        dimensions: Vec<usize>,
    },
    #[error("Invalid slice [{start}:{limit}:{stride}] of axis {axis} with size {size}")]
    InvalidSlice {
        axis: usize,
        start: DimSize,
        limit: DimSize,
        stride: DimSize,
        size: DimSize,
    },
    #[error("Padding axis {axis} of size {size} yields negative size {padded}")]
    NegativePaddedSize {
        axis: usize,
        size: DimSize,
        padded: DimSize,
    },
    #[error("Invalid window dimension {0:?}")]
    InvalidWindow(WindowDimension),
    #[error("Dimension role {0} is assigned twice or out of range")]
    InvalidDimensionNumbers(usize),
    #[error(
        "Input feature size {input_features} is incompatible with kernel input feature size \
         {kernel_input_features} and feature group count {feature_group_count}"
    )]
    FeatureMismatch {
        input_features: DimSize,
        kernel_input_features: DimSize,
        feature_group_count: DimSize,
    },
    #[error("Group count {count} does not divide size {size}")]
    InvalidGroupCount { count: DimSize, size: DimSize },
    #[error("Window size {window} does not match kernel size {kernel} on spatial dimension {index}")]
    KernelWindowMismatch {
        index: usize,
        window: DimSize,
        kernel: DimSize,
    },
    #[error("Expected a scalar but got {0}")]
    ExpectedScalar(Shape),
}

/// Number of window placements along one axis.
pub fn windowed_output_size(input: DimSize, dim: &WindowDimension) -> DimSize {
    let dilated_base = if input == 0 {
        0
    } else {
        (input - 1) * dim.base_dilation + 1
    };
    let padded = dilated_base + dim.padding_low + dim.padding_high;
    let dilated_window = dim.dilated_size();
    if dilated_window > padded {
        0
    } else {
        (padded - dilated_window) / dim.stride + 1
    }
}

fn check_operand_count(op: &Op, shapes: &[&Shape], expected: usize) -> Result<(), ShapeError> {
    if shapes.len() != expected {
        return Err(ShapeError::OperandCount {
            op: op.name(),
            expected,
            actual: shapes.len(),
        });
    }
    Ok(())
}

fn check_same_dims(lhs: &Shape, rhs: &Shape) -> Result<(), ShapeError> {
    if lhs.dims != rhs.dims {
        return Err(ShapeError::IncompatibleShapes(lhs.clone(), rhs.clone()));
    }
    Ok(())
}

fn check_dtype(shape: &Shape, expected: Dtype) -> Result<(), ShapeError> {
    if shape.dtype != expected {
        return Err(ShapeError::DtypeMismatch {
            expected,
            actual: shape.dtype,
        });
    }
    Ok(())
}

fn check_scalar_of(shape: &Shape, dtype: Dtype) -> Result<(), ShapeError> {
    if shape.rank() != 0 {
        return Err(ShapeError::ExpectedScalar(shape.clone()));
    }
    check_dtype(shape, dtype)
}

fn check_rank(shape: &Shape, expected: usize) -> Result<(), ShapeError> {
    if shape.rank() != expected {
        return Err(ShapeError::RankMismatch {
            expected,
            actual: shape.rank(),
        });
    }
    Ok(())
}

fn check_window(window: &Window, rank: usize) -> Result<(), ShapeError> {
    if window.rank() != rank {
        return Err(ShapeError::RankMismatch {
            expected: rank,
            actual: window.rank(),
        });
    }
    for dim in &window.dimensions {
        if dim.size < 0 || dim.stride < 1 || dim.base_dilation < 1 || dim.window_dilation < 1 {
            return Err(ShapeError::InvalidWindow(dim.clone()));
        }
    }
    Ok(())
}

pub fn infer_binary(op: BinaryOp, lhs: &Shape, rhs: &Shape) -> Result<Shape, ShapeError> {
    check_same_dims(lhs, rhs)?;
    check_dtype(rhs, lhs.dtype)?;
    if matches!(op, BinaryOp::And | BinaryOp::Or) && lhs.dtype.is_floating() {
        return Err(ShapeError::DtypeMismatch {
            expected: Dtype::Pred,
            actual: lhs.dtype,
        });
    }
    Ok(lhs.clone())
}

pub fn infer_compare(lhs: &Shape, rhs: &Shape) -> Result<Shape, ShapeError> {
    check_same_dims(lhs, rhs)?;
    check_dtype(rhs, lhs.dtype)?;
    Ok(lhs.with_dtype(Dtype::Pred))
}

pub fn infer_select(pred: &Shape, on_true: &Shape, on_false: &Shape) -> Result<Shape, ShapeError> {
    check_dtype(pred, Dtype::Pred)?;
    check_same_dims(pred, on_true)?;
    check_same_dims(on_true, on_false)?;
    check_dtype(on_false, on_true.dtype)?;
    Ok(on_true.clone())
}

pub fn infer_broadcast(
    operand: &Shape,
    output_dims: &[DimSize],
    dimensions: &[usize],
) -> Result<Shape, ShapeError> {
    let invalid = || ShapeError::InvalidBroadcast {
        operand: operand.clone(),
        output: output_dims.to_vec(),
        dimensions: dimensions.to_vec(),
    };
    if dimensions.len() != operand.rank() || !dimensions.iter().all_unique() {
        return Err(invalid());
    }
    for (i, &d) in dimensions.iter().enumerate() {
        if output_dims.get(d) != Some(&operand.dim(i)) {
            return Err(invalid());
        }
    }
    Ok(operand.with_dims(output_dims.iter().copied()))
}

pub fn infer_reshape(operand: &Shape, dims: &[DimSize]) -> Result<Shape, ShapeError> {
    if dims.iter().any(|&d| d < 0) || dims.iter().product::<DimSize>() != operand.element_count() {
        return Err(ShapeError::ElementCountMismatch {
            from: operand.clone(),
            to: dims.to_vec(),
        });
    }
    Ok(operand.with_dims(dims.iter().copied()))
}

pub fn infer_transpose(operand: &Shape, permutation: &[usize]) -> Result<Shape, ShapeError> {
    if permutation.len() != operand.rank() || !is_permutation(permutation) {
        return Err(ShapeError::InvalidPermutation(permutation.to_vec()));
    }
    Ok(operand.with_dims(permutation.iter().map(|&p| operand.dim(p))))
}

pub fn infer_pad(
    operand: &Shape,
    pad_value: &Shape,
    config: &PaddingConfig,
) -> Result<Shape, ShapeError> {
    check_rank(operand, config.rank())?;
    check_scalar_of(pad_value, operand.dtype)?;
    let mut dims = Dims::new();
    for (axis, (&size, pad)) in operand.dims.iter().zip(&config.dimensions).enumerate() {
        if pad.interior < 0 {
            return Err(ShapeError::NegativePaddedSize {
                axis,
                size,
                padded: pad.interior,
            });
        }
        let interior = if size > 0 { (size - 1) * pad.interior } else { 0 };
        let padded = pad.low + size + interior + pad.high;
        if padded < 0 {
            return Err(ShapeError::NegativePaddedSize { axis, size, padded });
        }
        dims.push(padded);
    }
    Ok(Shape {
        dtype: operand.dtype,
        dims,
    })
}

pub fn infer_slice(
    operand: &Shape,
    starts: &[DimSize],
    limits: &[DimSize],
    strides: &[DimSize],
) -> Result<Shape, ShapeError> {
    check_rank(operand, starts.len())?;
    check_rank(operand, limits.len())?;
    check_rank(operand, strides.len())?;
    let mut dims = Dims::new();
    for axis in 0..operand.rank() {
        let (start, limit, stride, size) =
            (starts[axis], limits[axis], strides[axis], operand.dim(axis));
        if start < 0 || limit < start || limit > size || stride < 1 {
            return Err(ShapeError::InvalidSlice {
                axis,
                start,
                limit,
                stride,
                size,
            });
        }
        dims.push(divrem::DivCeil::div_ceil(limit - start, stride));
    }
    Ok(Shape {
        dtype: operand.dtype,
        dims,
    })
}

pub fn infer_concatenate(operands: &[&Shape], dimension: usize) -> Result<Shape, ShapeError> {
    let Some((first, rest)) = operands.split_first() else {
        return Err(ShapeError::OperandCount {
            op: "concatenate",
            expected: 1,
            actual: 0,
        });
    };
    if dimension >= first.rank() {
        return Err(ShapeError::AxisOutOfRange {
            axis: dimension,
            rank: first.rank(),
        });
    }
    let mut dims = first.dims.clone();
    for other in rest {
        check_rank(other, first.rank())?;
        check_dtype(other, first.dtype)?;
        for axis in 0..first.rank() {
            if axis != dimension && other.dim(axis) != first.dim(axis) {
                return Err(ShapeError::IncompatibleShapes(
                    (*first).clone(),
                    (*other).clone(),
                ));
            }
        }
        dims[dimension] += other.dim(dimension);
    }
    Ok(Shape {
        dtype: first.dtype,
        dims,
    })
}

fn check_roles(rank: usize, roles: impl IntoIterator<Item = usize>) -> Result<(), ShapeError> {
    let mut seen = vec![false; rank];
    for role in roles {
        if role >= rank || seen[role] {
            return Err(ShapeError::InvalidDimensionNumbers(role));
        }
        seen[role] = true;
    }
    Ok(())
}

pub fn infer_convolution(
    lhs: &Shape,
    rhs: &Shape,
    params: &ConvolutionParams,
) -> Result<Shape, ShapeError> {
    let dnums = &params.dimension_numbers;
    let rank = dnums.tensor_rank();
    check_rank(lhs, rank)?;
    check_rank(rhs, rank)?;
    check_dtype(rhs, lhs.dtype)?;
    check_window(&params.window, dnums.spatial_rank())?;
    check_roles(
        rank,
        [dnums.input_batch_dimension, dnums.input_feature_dimension]
            .into_iter()
            .chain(dnums.input_spatial_dimensions.iter().copied()),
    )?;
    check_roles(
        rank,
        [
            dnums.kernel_input_feature_dimension,
            dnums.kernel_output_feature_dimension,
        ]
        .into_iter()
        .chain(dnums.kernel_spatial_dimensions.iter().copied()),
    )?;
    check_roles(
        rank,
        [dnums.output_batch_dimension, dnums.output_feature_dimension]
            .into_iter()
            .chain(dnums.output_spatial_dimensions.iter().copied()),
    )?;

    let input_batch = lhs.dim(dnums.input_batch_dimension);
    let input_features = lhs.dim(dnums.input_feature_dimension);
    let kernel_input_features = rhs.dim(dnums.kernel_input_feature_dimension);
    let kernel_output_features = rhs.dim(dnums.kernel_output_feature_dimension);
    let fgc = params.feature_group_count;
    let bgc = params.batch_group_count;
    if fgc < 1 || input_features % fgc != 0 || input_features / fgc != kernel_input_features {
        return Err(ShapeError::FeatureMismatch {
            input_features,
            kernel_input_features,
            feature_group_count: fgc,
        });
    }
    for (count, size) in [
        (fgc, kernel_output_features),
        (bgc, input_batch),
        (bgc, kernel_output_features),
    ] {
        if count < 1 || size % count != 0 {
            return Err(ShapeError::InvalidGroupCount { count, size });
        }
    }

    let mut dims: Dims = std::iter::repeat(0).take(rank).collect();
    dims[dnums.output_batch_dimension] = input_batch / bgc;
    dims[dnums.output_feature_dimension] = kernel_output_features;
    for (i, window_dim) in params.window.dimensions.iter().enumerate() {
        let kernel = rhs.dim(dnums.kernel_spatial_dimensions[i]);
        if kernel != window_dim.size {
            return Err(ShapeError::KernelWindowMismatch {
                index: i,
                window: window_dim.size,
                kernel,
            });
        }
        let input = lhs.dim(dnums.input_spatial_dimensions[i]);
        dims[dnums.output_spatial_dimensions[i]] = windowed_output_size(input, window_dim);
    }
    Ok(Shape {
        dtype: lhs.dtype,
        dims,
    })
}

pub fn infer_reduce(
    operand: &Shape,
    init: &Shape,
    dimensions: &[usize],
) -> Result<Shape, ShapeError> {
    check_scalar_of(init, operand.dtype)?;
    if let Some(&axis) = dimensions.iter().find(|&&d| d >= operand.rank()) {
        return Err(ShapeError::AxisOutOfRange {
            axis,
            rank: operand.rank(),
        });
    }
    if !dimensions.iter().all_unique() {
        return Err(ShapeError::InvalidPermutation(dimensions.to_vec()));
    }
    Ok(operand.with_dims(
        (0..operand.rank())
            .filter(|d| !dimensions.contains(d))
            .map(|d| operand.dim(d)),
    ))
}

pub fn infer_reduce_window(
    operand: &Shape,
    init: &Shape,
    window: &Window,
) -> Result<Shape, ShapeError> {
    check_scalar_of(init, operand.dtype)?;
    check_window(window, operand.rank())?;
    Ok(operand.with_dims(
        operand
            .dims
            .iter()
            .zip(&window.dimensions)
            .map(|(&size, dim)| windowed_output_size(size, dim)),
    ))
}

pub fn infer_select_and_scatter(
    operand: &Shape,
    source: &Shape,
    init: &Shape,
    window: &Window,
) -> Result<Shape, ShapeError> {
    check_scalar_of(init, source.dtype)?;
    let windowed = infer_reduce_window(operand, &Shape::scalar(operand.dtype), window)?;
    check_same_dims(&windowed, source)?;
    Ok(operand.with_dtype(source.dtype))
}

/// Infers the shape `op` produces from `operands`. Opcodes whose output
/// cannot be derived from operands alone (parameters, reshapes, broadcasts,
/// converts) are checked against `recorded` instead.
pub fn infer_node_shape(op: &Op, operands: &[&Shape], recorded: &Shape) -> Result<Shape, ShapeError> {
    match op {
        Op::Parameter(_) => {
            check_operand_count(op, operands, 0)?;
            Ok(recorded.clone())
        }
        Op::Constant(literal) => {
            check_operand_count(op, operands, 0)?;
            Ok(literal.shape().clone())
        }
        Op::Unary(_) | Op::Copy => {
            check_operand_count(op, operands, 1)?;
            Ok(operands[0].clone())
        }
        Op::Convert => {
            check_operand_count(op, operands, 1)?;
            check_same_dims(operands[0], recorded)?;
            Ok(recorded.clone())
        }
        Op::Binary(binary) => {
            check_operand_count(op, operands, 2)?;
            infer_binary(*binary, operands[0], operands[1])
        }
        Op::Compare(_) => {
            check_operand_count(op, operands, 2)?;
            infer_compare(operands[0], operands[1])
        }
        Op::Select => {
            check_operand_count(op, operands, 3)?;
            infer_select(operands[0], operands[1], operands[2])
        }
        Op::Broadcast { dimensions } => {
            check_operand_count(op, operands, 1)?;
            infer_broadcast(operands[0], &recorded.dims, dimensions)
        }
        Op::Reshape => {
            check_operand_count(op, operands, 1)?;
            infer_reshape(operands[0], &recorded.dims)
        }
        Op::Transpose { permutation } => {
            check_operand_count(op, operands, 1)?;
            infer_transpose(operands[0], permutation)
        }
        Op::Pad(config) => {
            check_operand_count(op, operands, 2)?;
            infer_pad(operands[0], operands[1], config)
        }
        Op::Slice {
            starts,
            limits,
            strides,
        } => {
            check_operand_count(op, operands, 1)?;
            infer_slice(operands[0], starts, limits, strides)
        }
        Op::Concatenate { dimension } => infer_concatenate(operands, *dimension),
        Op::Convolution(params) => {
            check_operand_count(op, operands, 2)?;
            infer_convolution(operands[0], operands[1], params)
        }
        Op::Reduce { dimensions, .. } => {
            check_operand_count(op, operands, 2)?;
            infer_reduce(operands[0], operands[1], dimensions)
        }
        Op::ReduceWindow { window, .. } => {
            check_operand_count(op, operands, 2)?;
            infer_reduce_window(operands[0], operands[1], window)
        }
        Op::SelectAndScatter { window, .. } => {
            check_operand_count(op, operands, 3)?;
            infer_select_and_scatter(operands[0], operands[1], operands[2], window)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::ConvDimensionNumbers;
    use proptest::prelude::*;

    fn f32_shape(dims: &[DimSize]) -> Shape {
        Shape::new(Dtype::Float32, dims.iter().copied())
    }

    #[test]
    fn test_convolution_channels_last() {
        let params = ConvolutionParams {
            dimension_numbers: ConvDimensionNumbers::channels_last(1),
            window: Window::new([WindowDimension::new(3).with_padding(1, 1)]),
            feature_group_count: 1,
            batch_group_count: 1,
        };
        let out = infer_convolution(&f32_shape(&[1, 16, 2]), &f32_shape(&[3, 2, 5]), &params)
            .unwrap();
        assert_eq!(out, f32_shape(&[1, 16, 5]));
    }

    #[test]
    fn test_convolution_rejects_kernel_window_mismatch() {
        let params = ConvolutionParams {
            dimension_numbers: ConvDimensionNumbers::channels_last(1),
            window: Window::new([WindowDimension::new(2)]),
            feature_group_count: 1,
            batch_group_count: 1,
        };
        let err = infer_convolution(&f32_shape(&[1, 16, 2]), &f32_shape(&[3, 2, 5]), &params)
            .unwrap_err();
        assert!(matches!(err, ShapeError::KernelWindowMismatch { .. }));
    }

    #[test]
    fn test_convolution_with_batch_groups() {
        let params = ConvolutionParams {
            dimension_numbers: ConvDimensionNumbers::channels_last(1),
            window: Window::new([WindowDimension::new(1)]),
            feature_group_count: 1,
            batch_group_count: 2,
        };
        let out =
            infer_convolution(&f32_shape(&[2, 4, 3]), &f32_shape(&[1, 3, 4]), &params).unwrap();
        assert_eq!(out, f32_shape(&[1, 4, 4]));
    }

    #[test]
    fn test_pad_with_negative_edge() {
        let config = PaddingConfig::zero(2).with_edge(1, -2, 3);
        let out = infer_pad(&f32_shape(&[4, 6]), &Shape::scalar(Dtype::Float32), &config).unwrap();
        assert_eq!(out, f32_shape(&[4, 7]));
    }

    #[test]
    fn test_pad_rejects_non_scalar_value() {
        let config = PaddingConfig::zero(1);
        let err = infer_pad(&f32_shape(&[4]), &f32_shape(&[1]), &config).unwrap_err();
        assert!(matches!(err, ShapeError::ExpectedScalar(_)));
    }

    #[test]
    fn test_slice_with_stride() {
        let out = infer_slice(&f32_shape(&[10]), &[1], &[8], &[3]).unwrap();
        assert_eq!(out, f32_shape(&[3]));
    }

    #[test]
    fn test_broadcast_allows_reordered_dimensions() {
        let out = infer_broadcast(&f32_shape(&[3, 2]), &[2, 5, 3], &[2, 0]).unwrap();
        assert_eq!(out, f32_shape(&[2, 5, 3]));
    }

    #[test]
    fn test_reduce_keeps_unreduced_axes_in_order() {
        let out = infer_reduce(&f32_shape(&[2, 3, 4, 5]), &Shape::scalar(Dtype::Float32), &[2, 0])
            .unwrap();
        assert_eq!(out, f32_shape(&[3, 5]));
    }

    #[test]
    fn test_select_and_scatter_checks_source() {
        let window = Window::new([WindowDimension::new(1), WindowDimension::new(2).with_stride(2)]);
        let scalar = Shape::scalar(Dtype::Float32);
        assert!(infer_select_and_scatter(&f32_shape(&[1, 8]), &f32_shape(&[1, 4]), &scalar, &window)
            .is_ok());
        assert!(infer_select_and_scatter(&f32_shape(&[1, 8]), &f32_shape(&[1, 3]), &scalar, &window)
            .is_err());
    }

    proptest! {
        #[test]
        fn test_windowed_output_size_matches_placement_count(
            input in 0i64..20,
            size in 1i64..5,
            stride in 1i64..4,
            low in 0i64..3,
            high in 0i64..3,
        ) {
            let dim = WindowDimension::new(size).with_stride(stride).with_padding(low, high);
            let padded = input + low + high;
            let expected = (0..padded).step_by(stride as usize).filter(|&s| s + size <= padded).count();
            prop_assert_eq!(windowed_output_size(input, &dim), expected as DimSize);
        }
    }
}
