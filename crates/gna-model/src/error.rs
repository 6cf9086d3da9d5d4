// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for model description and validation

use thiserror::Error;

use crate::{DataType, OperandKind, OperationType};

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while describing or validating a model
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Model has no operations
    #[error("Model has no operations")]
    Empty,

    /// Required operand missing
    #[error("{operation:?} requires a {operand:?} operand")]
    MissingOperand {
        /// Operation type
        operation: OperationType,
        /// Missing operand
        operand: OperandKind,
    },

    /// Operand not used by this operation type
    #[error("{operation:?} does not take a {operand:?} operand")]
    UnexpectedOperand {
        /// Operation type
        operation: OperationType,
        /// Extra operand
        operand: OperandKind,
    },

    /// Operand shape is invalid
    #[error("Invalid {operand:?} shape: {reason}")]
    InvalidShape {
        /// Offending operand
        operand: OperandKind,
        /// Reason for failure
        reason: String,
    },

    /// Operand data type is not allowed here
    #[error("{operand:?} cannot be {data_type:?}")]
    InvalidDataType {
        /// Offending operand
        operand: OperandKind,
        /// Rejected type
        data_type: DataType,
    },

    /// Parameters do not match the operation
    #[error("Invalid parameters: {reason}")]
    InvalidParameters {
        /// Reason for failure
        reason: String,
    },

    /// A specific operation of a model is invalid
    #[error("Operation {index}: {source}")]
    Operation {
        /// Index of the operation in the model
        index: usize,
        /// Underlying error
        #[source]
        source: Box<ModelError>,
    },
}

impl ModelError {
    /// Create an invalid shape error
    pub fn invalid_shape(operand: OperandKind, reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            operand,
            reason: reason.into(),
        }
    }

    /// Create an invalid parameters error
    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Attach the index of the failing operation
    #[must_use]
    pub fn at_operation(self, index: usize) -> Self {
        Self::Operation {
            index,
            source: Box::new(self),
        }
    }
}
