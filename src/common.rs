use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

use crate::utils::join_into_string;

/// Size of one tensor dimension.
///
/// Signed so that padding and window arithmetic can pass through negative
/// intermediates (negative padding trims).
pub type DimSize = i64;
pub type Dims = SmallVec<[DimSize; 6]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Pred,
    Sint32,
    Float32,
}

impl Dtype {
    pub fn is_floating(&self) -> bool {
        matches!(self, Dtype::Float32)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Pred => write!(f, "pred"),
            Dtype::Sint32 => write!(f, "s32"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

/// The type of a tensor value: an element type and a row-major sequence of
/// dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Shape {
    pub dtype: Dtype,
    pub dims: Dims,
}

impl Shape {
    pub fn new(dtype: Dtype, dims: impl IntoIterator<Item = DimSize>) -> Self {
        Shape {
            dtype,
            dims: dims.into_iter().collect(),
        }
    }

    pub fn scalar(dtype: Dtype) -> Self {
        Shape {
            dtype,
            dims: Dims::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, axis: usize) -> DimSize {
        self.dims[axis]
    }

    pub fn element_count(&self) -> DimSize {
        self.dims.iter().product()
    }

    /// Returns a shape with the same element type and the given dimensions.
    pub fn with_dims(&self, dims: impl IntoIterator<Item = DimSize>) -> Shape {
        Shape::new(self.dtype, dims)
    }

    pub fn with_dtype(&self, dtype: Dtype) -> Shape {
        Shape {
            dtype,
            dims: self.dims.clone(),
        }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.dtype, join_into_string(&self.dims, ","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_display() {
        let shape = Shape::new(Dtype::Float32, [1, 16, 8]);
        assert_eq!(shape.to_string(), "f32[1,16,8]");
        assert_eq!(Shape::scalar(Dtype::Pred).to_string(), "pred[]");
    }

    #[test]
    fn test_scalar_element_count_is_one() {
        assert_eq!(Shape::scalar(Dtype::Sint32).element_count(), 1);
        assert_eq!(Shape::new(Dtype::Sint32, [3, 0, 2]).element_count(), 0);
    }
}
