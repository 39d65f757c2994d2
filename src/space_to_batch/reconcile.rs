use super::{ConvolutionVisitor, SpaceToBatchError};
use crate::builders::{make_reshape, make_slice, make_transpose};
use crate::hlo::NodeId;

impl ConvolutionVisitor<'_> {
    /// Returns a node computing `old`'s value in `old`'s own layout, built
    /// from its space-to-batched replacement. Memoized, so every consumer of
    /// `old` shares one conversion.
    pub fn batch_to_space(&mut self, old: NodeId) -> Result<NodeId, SpaceToBatchError> {
        if let Some(&restored) = self.batch_to_space_map.get(&old) {
            return Ok(restored);
        }
        let record = self.record(old)?.clone();
        let (Some(permutation), Some(new_dims)) = (&record.permutation, record.new_dims()) else {
            return Ok(record.new);
        };
        if new_dims.batch + 1 != new_dims.space {
            return Err(SpaceToBatchError::Inconsistent(format!(
                "batch axis {} of {} does not precede its split axis {}",
                new_dims.batch, record.new, new_dims.space
            )));
        }

        let old_shape = self.c.shape(old).clone();
        let new_shape = self.c.shape(record.new).clone();
        let old_batch_size = old_shape.dim(record.dims.batch);
        let old_space_size = old_shape.dim(record.dims.space);
        let new_batch_size = new_shape.dim(new_dims.batch);
        if old_batch_size < 1 || new_batch_size % old_batch_size != 0 {
            return Err(SpaceToBatchError::Inconsistent(format!(
                "batch of {new_batch_size} is not a multiple of {old_batch_size}"
            )));
        }
        let num_splits = new_batch_size / old_batch_size;

        let mut dims = new_shape.dims.to_vec();
        dims[new_dims.batch] = old_batch_size;
        dims[new_dims.space] *= num_splits;
        if dims[new_dims.space] < old_space_size {
            return Err(SpaceToBatchError::Inconsistent(format!(
                "{} splits of {} cannot hold {} elements",
                num_splits,
                new_shape.dim(new_dims.space),
                old_space_size
            )));
        }
        let reshaped = make_reshape(self.c, &dims, record.new)?;

        let mut restored = reshaped;
        if dims[new_dims.space] > old_space_size {
            let starts = vec![0; dims.len()];
            let mut limits = dims.clone();
            limits[new_dims.space] = old_space_size;
            let strides = vec![1; dims.len()];
            restored = make_slice(self.c, reshaped, &starts, &limits, &strides)?;
        }
        let restored = make_transpose(self.c, restored, permutation)?;
        if self.c.shape(restored) != &old_shape {
            return Err(SpaceToBatchError::Inconsistent(format!(
                "restored {} as {} instead of {}",
                old,
                self.c.shape(restored),
                old_shape
            )));
        }
        log::trace!("Batch-to-space {old}: {}", self.c.node_to_string(restored));
        self.batch_to_space_map.insert(old, restored);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use crate::hlo::{Computation, Op};
    use crate::space_to_batch::test_graphs::f32_shape;
    use crate::space_to_batch::{
        ConverterConfig, ConvolutionVisitor, DimPair, SpaceToBatchError, TransformRecord,
    };

    #[test]
    fn test_restores_original_layout() {
        let mut c = Computation::new("c");
        // Original [batch, feature, width]; replacement [batch', width', feature].
        let old = c.add_parameter(f32_shape(&[1, 3, 10]));
        let new = c.add_parameter(f32_shape(&[4, 3, 3]));
        let config = ConverterConfig {
            new_batch_size: 4,
            ..ConverterConfig::default()
        };
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.insert_record(
            old,
            TransformRecord {
                new,
                dims: DimPair { batch: 0, space: 2 },
                permutation: Some(vec![0, 2, 1]),
            },
        );
        let restored = visitor.batch_to_space(old).unwrap();
        assert_eq!(visitor.batch_to_space(old).unwrap(), restored);
        assert_eq!(visitor.c.shape(restored), &f32_shape(&[1, 3, 10]));
        assert!(matches!(
            visitor.c.op(restored),
            Op::Transpose { permutation } if permutation == &[0, 2, 1]
        ));
        let slice = visitor.c.operand(restored, 0);
        assert_eq!(visitor.c.shape(slice), &f32_shape(&[1, 10, 3]));
        visitor.c.set_root(restored);
        visitor.c.verify().unwrap();
    }

    #[test]
    fn test_replacement_without_permutation_is_returned_as_is() {
        let mut c = Computation::new("c");
        let old = c.add_parameter(f32_shape(&[1, 5]));
        let new = c.add_parameter(f32_shape(&[1, 5]));
        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.insert_record(
            old,
            TransformRecord {
                new,
                dims: DimPair { batch: 0, space: 1 },
                permutation: None,
            },
        );
        assert_eq!(visitor.batch_to_space(old).unwrap(), new);
    }

    #[test]
    fn test_non_adjacent_batch_and_space_is_inconsistent() {
        let mut c = Computation::new("c");
        let old = c.add_parameter(f32_shape(&[1, 3, 8]));
        let new = c.add_parameter(f32_shape(&[4, 3, 2]));
        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.insert_record(
            old,
            TransformRecord {
                new,
                dims: DimPair { batch: 0, space: 2 },
                permutation: Some(vec![0, 1, 2]),
            },
        );
        assert!(matches!(
            visitor.batch_to_space(old),
            Err(SpaceToBatchError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_missing_record_is_reported() {
        let mut c = Computation::new("c");
        let old = c.add_parameter(f32_shape(&[1, 5]));
        let config = ConverterConfig::default();
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        assert!(matches!(
            visitor.batch_to_space(old),
            Err(SpaceToBatchError::MissingTransform(id)) if id == old
        ));
    }

    #[cfg(feature = "verification")]
    #[test]
    fn test_restored_values_drop_the_padding() {
        use crate::space_to_batch::test_graphs::iota_constant;
        use crate::verification::evaluate;

        let mut c = Computation::new("c");
        let old = c.add_parameter(f32_shape(&[1, 5]));
        let new = iota_constant(&mut c, &[2, 3]);
        let config = ConverterConfig {
            new_batch_size: 2,
            ..ConverterConfig::default()
        };
        let mut visitor = ConvolutionVisitor::new(&mut c, &config);
        visitor.insert_record(
            old,
            TransformRecord {
                new,
                dims: DimPair { batch: 0, space: 1 },
                permutation: Some(vec![0, 1]),
            },
        );
        let restored = visitor.batch_to_space(old).unwrap();
        c.set_root(restored);
        let value = evaluate(&c, &[ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 5]))]).unwrap();
        assert_eq!(value.iter().copied().collect::<Vec<_>>(), vec![1., 2., 3., 4., 5.]);
    }
}
