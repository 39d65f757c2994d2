//! A reference evaluator for [Computation]s, used to check that a rewrite
//! preserves the computed values.
//!
//! Every element type is evaluated in `f32`; predicates are 0 or 1.

use itertools::Itertools;
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::common::{DimSize, Dtype, Shape};
use crate::hlo::{
    BinaryOp, ComparisonDirection, Computation, ConvolutionParams, NodeId, Op, Reducer, UnaryOp,
};
use crate::window::{PaddingConfig, Window, WindowDimension};

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("Computation takes {expected} arguments but {actual} were given")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("Argument {index} has shape {actual:?} but its parameter is {expected}")]
    ArgumentShape {
        index: usize,
        expected: Shape,
        actual: Vec<usize>,
    },
    #[error("Computation has no root")]
    NoRoot,
    #[error("{0} has a negative dimension")]
    NegativeDimension(NodeId),
    #[error("Array error: {0}")]
    Array(#[from] ndarray::ShapeError),
}

fn udims(shape: &Shape, node: NodeId) -> Result<Vec<usize>, EvalError> {
    shape
        .dims
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| EvalError::NegativeDimension(node)))
        .collect()
}

/// Evaluates the root of `c` on `arguments`, one per parameter.
pub fn evaluate(c: &Computation, arguments: &[ArrayD<f32>]) -> Result<ArrayD<f32>, EvalError> {
    let root = c.root().ok_or(EvalError::NoRoot)?;
    if arguments.len() != c.parameters().len() {
        return Err(EvalError::ArgumentCount {
            expected: c.parameters().len(),
            actual: arguments.len(),
        });
    }
    let mut values: HashMap<NodeId, ArrayD<f32>> = HashMap::new();
    for id in c.post_order() {
        let operands = c
            .operands(id)
            .iter()
            .map(|o| &values[o])
            .collect::<Vec<_>>();
        let dims = udims(c.shape(id), id)?;
        let value = evaluate_op(c, id, &operands, &dims, arguments)?;
        debug_assert_eq!(value.shape(), dims.as_slice(), "{}", c.node_to_string(id));
        values.insert(id, value);
    }
    values.remove(&root).ok_or(EvalError::NoRoot)
}

fn evaluate_op(
    c: &Computation,
    id: NodeId,
    operands: &[&ArrayD<f32>],
    dims: &[usize],
    arguments: &[ArrayD<f32>],
) -> Result<ArrayD<f32>, EvalError> {
    let dtype = c.shape(id).dtype;
    Ok(match c.op(id) {
        Op::Parameter(index) => {
            let argument = &arguments[*index];
            if argument.shape() != dims {
                return Err(EvalError::ArgumentShape {
                    index: *index,
                    expected: c.shape(id).clone(),
                    actual: argument.shape().to_vec(),
                });
            }
            argument.clone()
        }
        Op::Constant(literal) => ArrayD::from_shape_vec(IxDyn(dims), literal.to_f32_vec())?,
        Op::Unary(op) => operands[0].mapv(|x| match op {
            UnaryOp::Negate => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sqrt => x.sqrt(),
        }),
        Op::Copy => operands[0].clone(),
        Op::Convert => operands[0].mapv(|x| convert(x, dtype)),
        Op::Binary(op) => ndarray::Zip::from(operands[0])
            .and(operands[1])
            .map_collect(|&a, &b| binary(*op, a, b, dtype)),
        Op::Compare(direction) => ndarray::Zip::from(operands[0])
            .and(operands[1])
            .map_collect(|&a, &b| bool_value(compare(*direction, a, b))),
        Op::Select => ndarray::Zip::from(operands[0])
            .and(operands[1])
            .and(operands[2])
            .map_collect(|&p, &t, &f| if p != 0.0 { t } else { f }),
        Op::Broadcast { dimensions } => {
            let source = operands[0];
            ArrayD::from_shape_fn(IxDyn(dims), |idx| {
                let source_index = dimensions.iter().map(|&d| idx[d]).collect_vec();
                source[IxDyn(&source_index)]
            })
        }
        Op::Reshape => {
            ArrayD::from_shape_vec(IxDyn(dims), operands[0].iter().copied().collect())?
        }
        Op::Transpose { permutation } => operands[0]
            .view()
            .permuted_axes(IxDyn(permutation))
            .to_owned(),
        Op::Pad(config) => pad(operands[0], operands[1].sum(), config, dims),
        Op::Slice { starts, strides, .. } => {
            let source = operands[0];
            ArrayD::from_shape_fn(IxDyn(dims), |idx| {
                let source_index = (0..dims.len())
                    .map(|a| (starts[a] + idx[a] as DimSize * strides[a]) as usize)
                    .collect_vec();
                source[IxDyn(&source_index)]
            })
        }
        Op::Concatenate { dimension } => {
            let views = operands.iter().map(|o| o.view()).collect_vec();
            ndarray::concatenate(Axis(*dimension), &views)?
        }
        Op::Convolution(params) => convolution(operands[0], operands[1], params, dims),
        Op::Reduce {
            dimensions,
            reducer,
        } => reduce(operands[0], operands[1].sum(), dimensions, *reducer, dims),
        Op::ReduceWindow { window, reducer } => {
            reduce_window(operands[0], operands[1].sum(), window, *reducer, dims)
        }
        Op::SelectAndScatter {
            window,
            select,
            scatter,
        } => select_and_scatter(
            operands[0],
            operands[1],
            operands[2].sum(),
            window,
            *select,
            *scatter,
        ),
    })
}

fn bool_value(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn convert(x: f32, dtype: Dtype) -> f32 {
    match dtype {
        Dtype::Pred => bool_value(x != 0.0),
        Dtype::Sint32 => x.trunc(),
        Dtype::Float32 => x,
    }
}

fn binary(op: BinaryOp, a: f32, b: f32, dtype: Dtype) -> f32 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide if dtype == Dtype::Sint32 => (a / b).trunc(),
        BinaryOp::Divide => a / b,
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
        BinaryOp::And => bool_value(a != 0.0 && b != 0.0),
        BinaryOp::Or => bool_value(a != 0.0 || b != 0.0),
    }
}

fn compare(direction: ComparisonDirection, a: f32, b: f32) -> bool {
    match direction {
        ComparisonDirection::Eq => a == b,
        ComparisonDirection::Ne => a != b,
        ComparisonDirection::Ge => a >= b,
        ComparisonDirection::Gt => a > b,
        ComparisonDirection::Le => a <= b,
        ComparisonDirection::Lt => a < b,
    }
}

fn combine(reducer: Reducer, a: f32, b: f32) -> f32 {
    match reducer {
        Reducer::Add => a + b,
        Reducer::Multiply => a * b,
        Reducer::Maximum => a.max(b),
        Reducer::Minimum => a.min(b),
        Reducer::And => bool_value(a != 0.0 && b != 0.0),
        Reducer::Or => bool_value(a != 0.0 || b != 0.0),
    }
}

fn pad(operand: &ArrayD<f32>, value: f32, config: &PaddingConfig, dims: &[usize]) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(dims), |idx| {
        let mut source_index = Vec::with_capacity(dims.len());
        for (axis, p) in config.dimensions.iter().enumerate() {
            let shifted = idx[axis] as DimSize - p.low;
            if shifted < 0 || shifted % (p.interior + 1) != 0 {
                return value;
            }
            let source = shifted / (p.interior + 1);
            if source >= operand.shape()[axis] as DimSize {
                return value;
            }
            source_index.push(source as usize);
        }
        operand[IxDyn(&source_index)]
    })
}

/// Position in the operand read by window element `offset` of output
/// element `output`, or `None` if it falls on padding or a dilation hole.
fn window_source(
    output: usize,
    offset: usize,
    dim: &WindowDimension,
    operand_size: usize,
) -> Option<usize> {
    let dilated = output as DimSize * dim.stride - dim.padding_low
        + offset as DimSize * dim.window_dilation;
    if dilated < 0 || dilated % dim.base_dilation != 0 {
        return None;
    }
    let position = dilated / dim.base_dilation;
    if position >= operand_size as DimSize {
        return None;
    }
    Some(position as usize)
}

fn window_offsets(window: &Window) -> Vec<IxDyn> {
    let sizes = window
        .dimensions
        .iter()
        .map(|d| d.size.max(0) as usize)
        .collect_vec();
    ndarray::indices(IxDyn(&sizes)).into_iter().collect()
}

fn convolution(
    lhs: &ArrayD<f32>,
    rhs: &ArrayD<f32>,
    params: &ConvolutionParams,
    dims: &[usize],
) -> ArrayD<f32> {
    let d = &params.dimension_numbers;
    let in_features = rhs.shape()[d.kernel_input_feature_dimension];
    let out_features = dims[d.output_feature_dimension];
    let batch_per_group = lhs.shape()[d.input_batch_dimension] / params.batch_group_count as usize;
    let features_per_group = out_features / params.feature_group_count as usize;
    let features_per_batch_group = out_features / params.batch_group_count as usize;
    let offsets = window_offsets(&params.window);

    ArrayD::from_shape_fn(IxDyn(dims), |idx| {
        let out_feature = idx[d.output_feature_dimension];
        let feature_group = out_feature / features_per_group;
        let batch_group = out_feature / features_per_batch_group;
        let mut lhs_index = vec![0; lhs.ndim()];
        let mut rhs_index = vec![0; rhs.ndim()];
        lhs_index[d.input_batch_dimension] =
            batch_group * batch_per_group + idx[d.output_batch_dimension];
        rhs_index[d.kernel_output_feature_dimension] = out_feature;

        let mut acc = 0.0;
        'taps: for offset in &offsets {
            for (i, dim) in params.window.dimensions.iter().enumerate() {
                let input_axis = d.input_spatial_dimensions[i];
                let Some(position) = window_source(
                    idx[d.output_spatial_dimensions[i]],
                    offset[i],
                    dim,
                    lhs.shape()[input_axis],
                ) else {
                    continue 'taps;
                };
                lhs_index[input_axis] = position;
                rhs_index[d.kernel_spatial_dimensions[i]] = if dim.window_reversal {
                    dim.size as usize - 1 - offset[i]
                } else {
                    offset[i]
                };
            }
            for feature in 0..in_features {
                lhs_index[d.input_feature_dimension] = feature_group * in_features + feature;
                rhs_index[d.kernel_input_feature_dimension] = feature;
                acc += lhs[IxDyn(&lhs_index)] * rhs[IxDyn(&rhs_index)];
            }
        }
        acc
    })
}

fn reduce(
    operand: &ArrayD<f32>,
    init: f32,
    dimensions: &[usize],
    reducer: Reducer,
    dims: &[usize],
) -> ArrayD<f32> {
    let kept = (0..operand.ndim())
        .filter(|a| !dimensions.contains(a))
        .collect_vec();
    let mut out = ArrayD::from_elem(IxDyn(dims), init);
    for (idx, &value) in operand.indexed_iter() {
        let out_index = kept.iter().map(|&a| idx[a]).collect_vec();
        let slot = &mut out[IxDyn(&out_index)];
        *slot = combine(reducer, *slot, value);
    }
    out
}

fn reduce_window(
    operand: &ArrayD<f32>,
    init: f32,
    window: &Window,
    reducer: Reducer,
    dims: &[usize],
) -> ArrayD<f32> {
    let offsets = window_offsets(window);
    ArrayD::from_shape_fn(IxDyn(dims), |idx| {
        let mut acc = init;
        let mut source_index = vec![0; operand.ndim()];
        'taps: for offset in &offsets {
            for (axis, dim) in window.dimensions.iter().enumerate() {
                match window_source(idx[axis], offset[axis], dim, operand.shape()[axis]) {
                    Some(position) => source_index[axis] = position,
                    None => {
                        acc = combine(reducer, acc, init);
                        continue 'taps;
                    }
                }
            }
            acc = combine(reducer, acc, operand[IxDyn(&source_index)]);
        }
        acc
    })
}

/// Padding is never selected.
fn select_and_scatter(
    operand: &ArrayD<f32>,
    source: &ArrayD<f32>,
    init: f32,
    window: &Window,
    select: ComparisonDirection,
    scatter: Reducer,
) -> ArrayD<f32> {
    let offsets = window_offsets(window);
    let mut out = ArrayD::from_elem(operand.raw_dim(), init);
    for (idx, &value) in source.indexed_iter() {
        let mut selected: Option<Vec<usize>> = None;
        'taps: for offset in &offsets {
            let mut candidate = vec![0; operand.ndim()];
            for (axis, dim) in window.dimensions.iter().enumerate() {
                match window_source(idx[axis], offset[axis], dim, operand.shape()[axis]) {
                    Some(position) => candidate[axis] = position,
                    None => continue 'taps,
                }
            }
            let keep_current = selected.as_ref().is_some_and(|current| {
                compare(
                    select,
                    operand[IxDyn(current)],
                    operand[IxDyn(&candidate)],
                )
            });
            if !keep_current {
                selected = Some(candidate);
            }
        }
        if let Some(selected) = selected {
            let slot = &mut out[IxDyn(&selected)];
            *slot = combine(scatter, *slot, value);
        }
    }
    out
}

/// Arguments for every parameter of `c`: uniform in `[-1, 1)` for floats,
/// small integers, or coin flips.
pub fn random_arguments(c: &Computation, rng: &mut impl Rng) -> Vec<ArrayD<f32>> {
    c.parameters()
        .iter()
        .map(|&p| {
            let shape = c.shape(p);
            let dims = shape.dims.iter().map(|&d| d.max(0) as usize).collect_vec();
            ArrayD::from_shape_simple_fn(IxDyn(&dims), || match shape.dtype {
                Dtype::Pred => bool_value(rng.gen_bool(0.5)),
                Dtype::Sint32 => rng.gen_range(-4..4) as f32,
                Dtype::Float32 => rng.gen_range(-1.0f32..1.0),
            })
        })
        .collect()
}

/// Evaluates `before` and `after` on the same random arguments and returns
/// the largest absolute difference between their results. A NaN on only one
/// side counts as an infinite difference.
pub fn max_abs_difference(
    before: &Computation,
    after: &Computation,
    seed: u64,
) -> Result<f32, EvalError> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let arguments = random_arguments(before, &mut rng);
    let expected = evaluate(before, &arguments)?;
    let actual = evaluate(after, &arguments)?;
    if expected.shape() != actual.shape() {
        return Ok(f32::INFINITY);
    }
    Ok(ndarray::Zip::from(&expected)
        .and(&actual)
        .fold(0.0f32, |acc, &a, &b| {
            if a.is_nan() != b.is_nan() {
                return f32::INFINITY;
            }
            if a.is_nan() || a == b {
                return acc;
            }
            acc.max((a - b).abs())
        }))
}

/// Whether `before` and `after` agree within `tolerance` on random
/// arguments.
pub fn check_equivalence(
    before: &Computation,
    after: &Computation,
    seed: u64,
    tolerance: f32,
) -> Result<bool, EvalError> {
    let difference = max_abs_difference(before, after, seed)?;
    log::debug!("Largest difference after rewrite: {difference}");
    Ok(difference <= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{
        make_broadcast, make_convolve, make_pad, make_reduce_window, make_select_and_scatter,
        make_zero,
    };
    use crate::literal::{Literal, LiteralData};
    use crate::window::ConvDimensionNumbers;

    fn f32_shape(dims: &[DimSize]) -> Shape {
        Shape::new(Dtype::Float32, dims.iter().copied())
    }

    fn r1(c: &mut Computation, values: &[f32]) -> NodeId {
        let literal = Literal::new(
            f32_shape(&[values.len() as DimSize]),
            LiteralData::Float32(values.to_vec()),
        )
        .unwrap();
        crate::builders::make_constant(c, literal)
    }

    fn values(c: &Computation) -> Vec<f32> {
        evaluate(c, &[]).unwrap().iter().copied().collect()
    }

    #[test]
    fn test_pad_with_negative_and_interior_padding() {
        let mut c = Computation::new("c");
        let x = r1(&mut c, &[1., 2., 3.]);
        let nine = crate::builders::make_constant(&mut c, Literal::scalar_f32(9.));
        let config = PaddingConfig::zero(1);
        let mut config = config.with_edge(0, -1, 2);
        config.dimensions[0].interior = 1;
        let padded = make_pad(&mut c, x, nine, &config).unwrap();
        c.set_root(padded);
        assert_eq!(values(&c), vec![9., 2., 9., 3., 9., 9.]);
    }

    #[test]
    fn test_one_dimensional_convolution() {
        let mut c = Computation::new("c");
        let x = r1(&mut c, &[1., 2., 3., 4.]);
        let x = crate::builders::make_reshape(&mut c, &[1, 4, 1], x).unwrap();
        let k = r1(&mut c, &[1., 10.]);
        let k = crate::builders::make_reshape(&mut c, &[2, 1, 1], k).unwrap();
        let window = Window::new([WindowDimension::new(2).with_padding(1, 0)]);
        let conv = make_convolve(&mut c, x, k, 1, 1, window, ConvDimensionNumbers::channels_last(1))
            .unwrap();
        c.set_root(conv);
        assert_eq!(values(&c), vec![10., 21., 32., 43.]);
    }

    #[test]
    fn test_reduce_window_pads_with_init() {
        let mut c = Computation::new("c");
        let x = r1(&mut c, &[1., 5., 2., 4.]);
        let init = make_zero(&mut c, Dtype::Float32);
        let window = Window::new([WindowDimension::new(3).with_stride(2).with_padding(0, 1)]);
        let pooled = make_reduce_window(&mut c, x, init, window, Reducer::Add).unwrap();
        c.set_root(pooled);
        assert_eq!(values(&c), vec![8., 6.]);
    }

    #[test]
    fn test_select_and_scatter_routes_to_the_maximum() {
        let mut c = Computation::new("c");
        let x = r1(&mut c, &[1., 5., 2., 4., 3.]);
        let source = r1(&mut c, &[10., 20.]);
        let init = make_zero(&mut c, Dtype::Float32);
        let window = Window::new([WindowDimension::new(3).with_stride(2)]);
        let scattered = make_select_and_scatter(
            &mut c,
            x,
            source,
            init,
            window,
            ComparisonDirection::Ge,
            Reducer::Add,
        )
        .unwrap();
        c.set_root(scattered);
        assert_eq!(values(&c), vec![0., 10., 0., 20., 0.]);
    }

    #[test]
    fn test_broadcast_and_transpose() {
        let mut c = Computation::new("c");
        let x = r1(&mut c, &[1., 2.]);
        let b = make_broadcast(&mut c, x, &[0], &[2, 3]).unwrap();
        let t = crate::builders::make_transpose(&mut c, b, &[1, 0]).unwrap();
        c.set_root(t);
        assert_eq!(values(&c), vec![1., 2., 1., 2., 1., 2.]);
    }

    #[test]
    fn test_identical_computations_are_equivalent() {
        let mut c = Computation::new("c");
        let p = c.add_parameter(f32_shape(&[3, 4]));
        let neg = crate::builders::make_unary(&mut c, UnaryOp::Negate, p).unwrap();
        c.set_root(neg);
        assert!(check_equivalence(&c, &c.clone(), 7, 0.0).unwrap());
        assert!(matches!(
            evaluate(&c, &[]),
            Err(EvalError::ArgumentCount {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn test_nan_on_one_side_is_an_infinite_difference() {
        let mut before = Computation::new("before");
        let nan = r1(&mut before, &[1., f32::NAN, 3.]);
        let root = crate::builders::make_unary(&mut before, UnaryOp::Sqrt, nan).unwrap();
        before.set_root(root);

        let mut after = Computation::new("after");
        let root = r1(&mut after, &[1., 0., 3f32.sqrt()]);
        after.set_root(root);

        assert_eq!(max_abs_difference(&before, &after, 0).unwrap(), f32::INFINITY);
        assert!(!check_equivalence(&before, &after, 0, 1e-3).unwrap());
        assert_eq!(max_abs_difference(&before, &before.clone(), 0).unwrap(), 0.0);
    }
}
