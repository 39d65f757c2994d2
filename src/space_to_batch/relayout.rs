//! Tensor re-layout primitives: moving the split axis next to batch, copying
//! halos between neighboring splits, and masking out padding.

use itertools::Itertools;

use super::SpaceToBatchError;
use crate::builders::{
    make_broadcast, make_concat, make_constant, make_pad, make_reshape, make_select, make_slice,
    make_transpose,
};
use crate::common::{DimSize, Shape};
use crate::hlo::{Computation, NodeId};
use crate::literal::Literal;
use crate::shape_inference::ShapeError;
use crate::utils::inverse_permutation;
use crate::window::{ConvDimensionNumbers, PaddingConfig};

/// Activations whose split axis directly follows their batch axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjacentLayout {
    pub activations: NodeId,
    pub batch_axis: usize,
    pub space_axis: usize,
}

/// Transposes `activations` so that `space_axis` immediately follows
/// `batch_axis`, keeping every other axis in order. The input roles of
/// `dnums` are updated to the transposed layout.
pub fn bring_space_next_to_batch(
    c: &mut Computation,
    activations: NodeId,
    dnums: &mut ConvDimensionNumbers,
    batch_axis: usize,
    space_axis: usize,
) -> Result<AdjacentLayout, ShapeError> {
    if space_axis == batch_axis + 1 {
        return Ok(AdjacentLayout {
            activations,
            batch_axis,
            space_axis,
        });
    }
    let rank = c.shape(activations).rank();
    let mut order = Vec::with_capacity(rank);
    for axis in 0..rank {
        if axis == batch_axis {
            continue;
        }
        if axis == space_axis {
            order.push(batch_axis);
        }
        order.push(axis);
    }
    let position = inverse_permutation(&order);
    dnums.input_batch_dimension = position[dnums.input_batch_dimension];
    dnums.input_feature_dimension = position[dnums.input_feature_dimension];
    for axis in dnums.input_spatial_dimensions.iter_mut() {
        *axis = position[*axis];
    }
    let transposed = make_transpose(c, activations, &order)?;
    log::trace!("Brought space next to batch: {}", c.node_to_string(transposed));
    Ok(AdjacentLayout {
        activations: transposed,
        batch_axis: position[batch_axis],
        space_axis: position[space_axis],
    })
}

/// Widens every split of `activations` with data from its neighbors.
///
/// Each row along `batch_axis` is one split. The result prepends the last
/// `low_padding` elements of the previous split and appends the first
/// `halo_size - low_padding` elements of the next one. With no halo, a
/// nonzero `low_padding` instead shifts every split by that amount (right if
/// positive, left if negative), again moving elements across split
/// boundaries. Splits with no neighbor in the same batch element of the
/// original `old_batch_size` see `pad_value` instead.
#[allow(clippy::too_many_arguments)]
pub fn halo_duplicate_with_slice(
    c: &mut Computation,
    activations: NodeId,
    space_axis: usize,
    batch_axis: usize,
    old_batch_size: DimSize,
    low_padding: DimSize,
    halo_size: DimSize,
    pad_value: NodeId,
) -> Result<NodeId, SpaceToBatchError> {
    let shape = c.shape(activations).clone();
    let rank = shape.rank();
    let split_size = shape.dim(space_axis);
    let batch_size = shape.dim(batch_axis);
    if (halo_size - low_padding).abs() > split_size || low_padding.abs() > split_size {
        return Err(SpaceToBatchError::Inconsistent(format!(
            "halo of {halo_size} with low padding {low_padding} does not fit a split of {split_size}"
        )));
    }
    if old_batch_size < 1 || batch_size % old_batch_size != 0 {
        return Err(SpaceToBatchError::Inconsistent(format!(
            "batch of {batch_size} is not a multiple of {old_batch_size}"
        )));
    }
    let num_splits = batch_size / old_batch_size;
    let full = shape.dims.to_vec();
    let strides = vec![1; rank];

    let mut first_slice = None;
    if low_padding > 0 {
        let mut starts = vec![0; rank];
        let mut limits = full.clone();
        starts[space_axis] = split_size - low_padding;
        limits[batch_axis] = batch_size - 1;
        let slice = make_slice(c, activations, &starts, &limits, &strides)?;
        let config = PaddingConfig::zero(rank).with_edge(batch_axis, 1, 0);
        let shifted = make_pad(c, slice, pad_value, &config)?;
        first_slice = Some(fill_rows_without_neighbor(
            c,
            shifted,
            batch_axis,
            old_batch_size,
            pad_value,
            |row| row % num_splits == 0,
        )?);
    }

    let mut halo_region = None;
    if halo_size - low_padding > 0 {
        let mut starts = vec![0; rank];
        let mut limits = full.clone();
        starts[batch_axis] = 1;
        limits[space_axis] = halo_size - low_padding;
        let slice = make_slice(c, activations, &starts, &limits, &strides)?;
        let config = PaddingConfig::zero(rank).with_edge(batch_axis, 0, 1);
        let shifted = make_pad(c, slice, pad_value, &config)?;
        halo_region = Some(fill_rows_without_neighbor(
            c,
            shifted,
            batch_axis,
            old_batch_size,
            pad_value,
            |row| row % num_splits == num_splits - 1,
        )?);
    }

    let mut body = activations;
    if halo_size == 0 && low_padding != 0 {
        let mut starts = vec![0; rank];
        let mut limits = full;
        if low_padding > 0 {
            limits[space_axis] = split_size - low_padding;
        } else {
            starts[space_axis] = -low_padding;
        }
        body = make_slice(c, activations, &starts, &limits, &strides)?;
    }

    let pieces = first_slice
        .into_iter()
        .chain([body])
        .chain(halo_region)
        .collect_vec();
    if pieces.len() == 1 {
        return Ok(body);
    }
    let result = make_concat(c, &pieces, space_axis)?;
    log::trace!("Halo duplicated: {}", c.node_to_string(result));
    Ok(result)
}

/// Replaces the rows of `node` selected by `without_neighbor` with
/// `pad_value`. Only needed when several original batch elements share the
/// batch axis; the edge padding already covers the outermost rows.
fn fill_rows_without_neighbor(
    c: &mut Computation,
    node: NodeId,
    batch_axis: usize,
    old_batch_size: DimSize,
    pad_value: NodeId,
    without_neighbor: impl Fn(DimSize) -> bool,
) -> Result<NodeId, SpaceToBatchError> {
    if old_batch_size == 1 {
        return Ok(node);
    }
    let dims = c.shape(node).dims.to_vec();
    let keep = (0..dims[batch_axis])
        .map(|row| !without_neighbor(row))
        .collect_vec();
    let mask = make_constant(c, Literal::r1_pred(keep));
    let mask = make_broadcast(c, mask, &[batch_axis], &dims)?;
    let fill = make_broadcast(c, pad_value, &[], &dims)?;
    Ok(make_select(c, mask, node, fill)?)
}

/// Replaces the elements of `new` which do not correspond to an element of
/// the original tensor (of shape `old_shape`) with `fill`.
///
/// Row `r` of `new`'s batch axis is split `r % num_splits` of its batch
/// element, so its element `j` along the split axis is original element
/// `(r % num_splits) * new_space_size + j`.
#[allow(clippy::too_many_arguments)]
pub fn select_valid_portion(
    c: &mut Computation,
    new: NodeId,
    old_shape: &Shape,
    fill: NodeId,
    new_batch_axis: usize,
    new_space_axis: usize,
    old_batch_axis: usize,
    old_space_axis: usize,
) -> Result<NodeId, SpaceToBatchError> {
    let new_dims = c.shape(new).dims.to_vec();
    let new_batch_size = new_dims[new_batch_axis];
    let new_space_size = new_dims[new_space_axis];
    let old_batch_size = old_shape.dim(old_batch_axis);
    let old_space_size = old_shape.dim(old_space_axis);
    if old_batch_size < 1 || new_batch_size % old_batch_size != 0 {
        return Err(SpaceToBatchError::Inconsistent(format!(
            "batch of {new_batch_size} is not a multiple of {old_batch_size}"
        )));
    }
    let num_splits = new_batch_size / old_batch_size;

    let bits = (0..new_batch_size * new_space_size)
        .map(|k| {
            let space_index = k % new_space_size;
            let split_index = (k / new_space_size) % num_splits;
            split_index * new_space_size + space_index < old_space_size
        })
        .collect_vec();
    let mask = make_constant(c, Literal::r1_pred(bits));
    let mask = make_reshape(c, &[new_batch_size, new_space_size], mask)?;
    let mask = make_broadcast(c, mask, &[new_batch_axis, new_space_axis], &new_dims)?;
    let fill = make_broadcast(c, fill, &[], &new_dims)?;
    Ok(make_select(c, mask, new, fill)?)
}
