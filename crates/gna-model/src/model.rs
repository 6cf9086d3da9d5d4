// SPDX-License-Identifier: AGPL-3.0-only

//! Model: an ordered list of operations

use crate::{ModelError, OperandKind, Operation, Result};

/// Validated, immutable model description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    operations: Vec<Operation>,
}

impl Model {
    /// Validate and wrap a list of operations
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Empty`] for an empty list, or the first invalid
    /// operation wrapped in [`ModelError::Operation`].
    pub fn new(operations: Vec<Operation>) -> Result<Self> {
        if operations.is_empty() {
            return Err(ModelError::Empty);
        }
        for (index, op) in operations.iter().enumerate() {
            op.validate().map_err(|e| e.at_operation(index))?;
        }
        Ok(Self { operations })
    }

    /// Operations in execution order
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of operations
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Every data address referenced by the model, in operation order
    pub fn data_addresses(&self) -> impl Iterator<Item = (usize, OperandKind, u64)> + '_ {
        self.operations.iter().enumerate().flat_map(|(index, op)| {
            op.operands
                .iter()
                .filter_map(move |(kind, tensor)| tensor.data.map(|a| (index, *kind, a)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataType, Tensor};

    fn copy() -> Operation {
        Operation::copy(
            Tensor::new(&[2, 32], DataType::Int16).with_data(0x1000),
            Tensor::new(&[2, 16], DataType::Int16),
            2,
            16,
        )
    }

    #[test]
    fn test_empty_model_rejected() {
        assert_eq!(Model::new(vec![]), Err(ModelError::Empty));
    }

    #[test]
    fn test_error_carries_operation_index() {
        let bad = Operation::copy(
            Tensor::new(&[2, 32], DataType::Int16),
            Tensor::new(&[2, 16], DataType::Int16),
            2,
            17,
        );
        match Model::new(vec![copy(), bad]) {
            Err(ModelError::Operation { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_data_addresses() {
        let model = Model::new(vec![copy()]).unwrap();
        let addresses: Vec<_> = model.data_addresses().collect();
        assert_eq!(addresses, vec![(0, OperandKind::Input, 0x1000)]);
    }
}
