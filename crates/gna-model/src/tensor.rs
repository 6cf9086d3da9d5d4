// SPDX-License-Identifier: AGPL-3.0-only

//! Operand tensors

use crate::{DataType, Shape};

/// Shape, element type and optional data address of one operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Dimensions
    pub shape: Shape,
    /// Element type
    pub data_type: DataType,
    /// Address inside a device allocation; `None` when bound per request
    pub data: Option<u64>,
}

impl Tensor {
    /// Tensor without data
    pub fn new(dims: &[u32], data_type: DataType) -> Self {
        Self {
            shape: Shape::new(dims),
            data_type,
            data: None,
        }
    }

    /// Attach a data address
    #[must_use]
    pub fn with_data(mut self, address: u64) -> Self {
        self.data = Some(address);
        self
    }

    /// Number of elements
    pub fn element_count(&self) -> u64 {
        self.shape.element_count()
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.element_count() * u64::from(self.data_type.size())
    }
}
