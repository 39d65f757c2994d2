use serde::{Deserialize, Serialize};

use crate::common::{DimSize, Dtype, Shape};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralData {
    Pred(Vec<bool>),
    Sint32(Vec<i32>),
    Float32(Vec<f32>),
}

/// A constant tensor value, stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    shape: Shape,
    data: LiteralData,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LiteralError {
    #[error("Literal of shape {shape} needs {expected} elements but {actual} were given")]
    ElementCount {
        shape: Shape,
        expected: DimSize,
        actual: usize,
    },
    #[error("Literal data is {actual} but the shape is {expected}")]
    DtypeMismatch { expected: Dtype, actual: Dtype },
}

impl LiteralData {
    pub fn dtype(&self) -> Dtype {
        match self {
            LiteralData::Pred(_) => Dtype::Pred,
            LiteralData::Sint32(_) => Dtype::Sint32,
            LiteralData::Float32(_) => Dtype::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LiteralData::Pred(v) => v.len(),
            LiteralData::Sint32(v) => v.len(),
            LiteralData::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Literal {
    pub fn new(shape: Shape, data: LiteralData) -> Result<Self, LiteralError> {
        if shape.dtype != data.dtype() {
            return Err(LiteralError::DtypeMismatch {
                expected: shape.dtype,
                actual: data.dtype(),
            });
        }
        if usize::try_from(shape.element_count()).ok() != Some(data.len()) {
            return Err(LiteralError::ElementCount {
                expected: shape.element_count(),
                actual: data.len(),
                shape,
            });
        }
        Ok(Literal { shape, data })
    }

    pub fn scalar_f32(value: f32) -> Self {
        Literal {
            shape: Shape::scalar(Dtype::Float32),
            data: LiteralData::Float32(vec![value]),
        }
    }

    pub fn scalar_s32(value: i32) -> Self {
        Literal {
            shape: Shape::scalar(Dtype::Sint32),
            data: LiteralData::Sint32(vec![value]),
        }
    }

    pub fn scalar_pred(value: bool) -> Self {
        Literal {
            shape: Shape::scalar(Dtype::Pred),
            data: LiteralData::Pred(vec![value]),
        }
    }

    /// A rank-1 boolean literal.
    pub fn r1_pred(values: Vec<bool>) -> Self {
        Literal {
            shape: Shape::new(Dtype::Pred, [values.len() as DimSize]),
            data: LiteralData::Pred(values),
        }
    }

    pub fn zero(dtype: Dtype) -> Self {
        match dtype {
            Dtype::Pred => Literal::scalar_pred(false),
            Dtype::Sint32 => Literal::scalar_s32(0),
            Dtype::Float32 => Literal::scalar_f32(0.0),
        }
    }

    /// The value no element of `dtype` compares below.
    pub fn min_value(dtype: Dtype) -> Self {
        match dtype {
            Dtype::Pred => Literal::scalar_pred(false),
            Dtype::Sint32 => Literal::scalar_s32(i32::MIN),
            Dtype::Float32 => Literal::scalar_f32(f32::NEG_INFINITY),
        }
    }

    /// The value no element of `dtype` compares above.
    pub fn max_value(dtype: Dtype) -> Self {
        match dtype {
            Dtype::Pred => Literal::scalar_pred(true),
            Dtype::Sint32 => Literal::scalar_s32(i32::MAX),
            Dtype::Float32 => Literal::scalar_f32(f32::INFINITY),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &LiteralData {
        &self.data
    }

    /// Whether every element holds the same value. Empty literals are not splats.
    pub fn is_splat(&self) -> bool {
        fn all_equal<T: PartialEq>(v: &[T]) -> bool {
            match v.split_first() {
                Some((first, rest)) => rest.iter().all(|x| x == first),
                None => false,
            }
        }
        match &self.data {
            LiteralData::Pred(v) => all_equal(v),
            LiteralData::Sint32(v) => all_equal(v),
            LiteralData::Float32(v) => all_equal(v),
        }
    }

    /// The first element as a scalar literal.
    pub fn first_element(&self) -> Option<Literal> {
        match &self.data {
            LiteralData::Pred(v) => v.first().map(|&x| Literal::scalar_pred(x)),
            LiteralData::Sint32(v) => v.first().map(|&x| Literal::scalar_s32(x)),
            LiteralData::Float32(v) => v.first().map(|&x| Literal::scalar_f32(x)),
        }
    }

    /// All elements widened to `f32`; predicates become 0 or 1.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            LiteralData::Pred(v) => v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
            LiteralData::Sint32(v) => v.iter().map(|&x| x as f32).collect(),
            LiteralData::Float32(v) => v.clone(),
        }
    }
}
