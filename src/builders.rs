//! Helpers that append a node to a [Computation], inferring its shape.

use crate::common::{DimSize, Dtype, Shape};
use crate::hlo::{
    BinaryOp, ComparisonDirection, Computation, ConvolutionParams, NodeId, Op, Reducer, UnaryOp,
};
use crate::literal::Literal;
use crate::shape_inference::{self, ShapeError};
use crate::window::{ConvDimensionNumbers, PaddingConfig, Window};

pub fn make_constant(c: &mut Computation, literal: Literal) -> NodeId {
    let shape = literal.shape().clone();
    c.add_node(Op::Constant(literal), vec![], shape)
}

/// A scalar zero of `dtype`.
pub fn make_zero(c: &mut Computation, dtype: Dtype) -> NodeId {
    make_constant(c, Literal::zero(dtype))
}

pub fn make_unary(c: &mut Computation, op: UnaryOp, operand: NodeId) -> Result<NodeId, ShapeError> {
    let shape = c.shape(operand).clone();
    Ok(c.add_node(Op::Unary(op), vec![operand], shape))
}

pub fn make_convert(c: &mut Computation, operand: NodeId, dtype: Dtype) -> NodeId {
    let shape = c.shape(operand).with_dtype(dtype);
    c.add_node(Op::Convert, vec![operand], shape)
}

pub fn make_binary(
    c: &mut Computation,
    op: BinaryOp,
    lhs: NodeId,
    rhs: NodeId,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_binary(op, c.shape(lhs), c.shape(rhs))?;
    Ok(c.add_node(Op::Binary(op), vec![lhs, rhs], shape))
}

pub fn make_compare(
    c: &mut Computation,
    direction: ComparisonDirection,
    lhs: NodeId,
    rhs: NodeId,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_compare(c.shape(lhs), c.shape(rhs))?;
    Ok(c.add_node(Op::Compare(direction), vec![lhs, rhs], shape))
}

pub fn make_select(
    c: &mut Computation,
    pred: NodeId,
    on_true: NodeId,
    on_false: NodeId,
) -> Result<NodeId, ShapeError> {
    let shape =
        shape_inference::infer_select(c.shape(pred), c.shape(on_true), c.shape(on_false))?;
    Ok(c.add_node(Op::Select, vec![pred, on_true, on_false], shape))
}

/// Broadcasts `operand` into `output_dims`, mapping operand axis `i` to output
/// axis `dimensions[i]`.
pub fn make_broadcast(
    c: &mut Computation,
    operand: NodeId,
    dimensions: &[usize],
    output_dims: &[DimSize],
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_broadcast(c.shape(operand), output_dims, dimensions)?;
    Ok(c.add_node(
        Op::Broadcast {
            dimensions: dimensions.to_vec(),
        },
        vec![operand],
        shape,
    ))
}

pub fn make_reshape(
    c: &mut Computation,
    dims: &[DimSize],
    operand: NodeId,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_reshape(c.shape(operand), dims)?;
    Ok(c.add_node(Op::Reshape, vec![operand], shape))
}

/// Transposes `operand`; output axis `i` is operand axis `permutation[i]`.
/// Identity permutations return `operand` unchanged.
pub fn make_transpose(
    c: &mut Computation,
    operand: NodeId,
    permutation: &[usize],
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_transpose(c.shape(operand), permutation)?;
    if permutation.iter().enumerate().all(|(i, &p)| i == p) {
        return Ok(operand);
    }
    Ok(c.add_node(
        Op::Transpose {
            permutation: permutation.to_vec(),
        },
        vec![operand],
        shape,
    ))
}

pub fn make_pad(
    c: &mut Computation,
    operand: NodeId,
    pad_value: NodeId,
    config: &PaddingConfig,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_pad(c.shape(operand), c.shape(pad_value), config)?;
    Ok(c.add_node(Op::Pad(config.clone()), vec![operand, pad_value], shape))
}

pub fn make_slice(
    c: &mut Computation,
    operand: NodeId,
    starts: &[DimSize],
    limits: &[DimSize],
    strides: &[DimSize],
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_slice(c.shape(operand), starts, limits, strides)?;
    Ok(c.add_node(
        Op::Slice {
            starts: starts.to_vec(),
            limits: limits.to_vec(),
            strides: strides.to_vec(),
        },
        vec![operand],
        shape,
    ))
}

pub fn make_concat(
    c: &mut Computation,
    operands: &[NodeId],
    dimension: usize,
) -> Result<NodeId, ShapeError> {
    let shapes = operands.iter().map(|&o| c.shape(o)).collect::<Vec<_>>();
    let shape = shape_inference::infer_concatenate(&shapes, dimension)?;
    Ok(c.add_node(Op::Concatenate { dimension }, operands.to_vec(), shape))
}

pub fn make_convolve(
    c: &mut Computation,
    lhs: NodeId,
    rhs: NodeId,
    feature_group_count: DimSize,
    batch_group_count: DimSize,
    window: Window,
    dimension_numbers: ConvDimensionNumbers,
) -> Result<NodeId, ShapeError> {
    let params = ConvolutionParams {
        dimension_numbers,
        window,
        feature_group_count,
        batch_group_count,
    };
    let shape = shape_inference::infer_convolution(c.shape(lhs), c.shape(rhs), &params)?;
    Ok(c.add_node(Op::Convolution(params), vec![lhs, rhs], shape))
}

pub fn make_reduce(
    c: &mut Computation,
    operand: NodeId,
    init: NodeId,
    dimensions: &[usize],
    reducer: Reducer,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_reduce(c.shape(operand), c.shape(init), dimensions)?;
    Ok(c.add_node(
        Op::Reduce {
            dimensions: dimensions.to_vec(),
            reducer,
        },
        vec![operand, init],
        shape,
    ))
}

pub fn make_reduce_window(
    c: &mut Computation,
    operand: NodeId,
    init: NodeId,
    window: Window,
    reducer: Reducer,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_reduce_window(c.shape(operand), c.shape(init), &window)?;
    Ok(c.add_node(
        Op::ReduceWindow { window, reducer },
        vec![operand, init],
        shape,
    ))
}

pub fn make_select_and_scatter(
    c: &mut Computation,
    operand: NodeId,
    source: NodeId,
    init: NodeId,
    window: Window,
    select: ComparisonDirection,
    scatter: Reducer,
) -> Result<NodeId, ShapeError> {
    let shape = shape_inference::infer_select_and_scatter(
        c.shape(operand),
        c.shape(source),
        c.shape(init),
        &window,
    )?;
    Ok(c.add_node(
        Op::SelectAndScatter {
            window,
            select,
            scatter,
        },
        vec![operand, source, init],
        shape,
    ))
}

/// Clones `node` onto new operands. `shape` is the shape of the clone.
pub fn clone_with_new_operands(
    c: &mut Computation,
    node: NodeId,
    shape: Shape,
    operands: Vec<NodeId>,
) -> Result<NodeId, ShapeError> {
    let op = c.op(node).clone();
    let operand_shapes = operands.iter().map(|&o| c.shape(o)).collect::<Vec<_>>();
    let inferred = shape_inference::infer_node_shape(&op, &operand_shapes, &shape)?;
    Ok(c.add_node(op, operands, inferred))
}
