// SPDX-License-Identifier: AGPL-3.0-only

#![deny(unsafe_code)]

//! Declarative neural-network model description for the GNA runtime.
//!
//! A [`Model`] is an ordered list of [`Operation`]s. Each operation names its
//! operands ([`OperandKind`] → [`Tensor`]) and carries type-specific
//! [`Parameters`]. Tensors describe shape and element type and optionally
//! point at device memory by address; the runtime resolves those addresses
//! against its allocations when the model is compiled.
//!
//! # Example
//!
//! ```
//! use gna_model::{DataType, Model, Operation, Tensor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let affine = Operation::fully_connected_affine(
//!     Tensor::new(&[1, 16], DataType::Int16),
//!     Tensor::new(&[1, 8], DataType::Int32),
//!     Tensor::new(&[8, 16], DataType::Int16),
//!     Tensor::new(&[8], DataType::Int32),
//! );
//! let model = Model::new(vec![affine])?;
//! assert_eq!(model.operation_count(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod data_type;
mod error;
mod model;
mod operation;
mod shape;
mod tensor;

pub use data_type::DataType;
pub use error::{ModelError, Result};
pub use model::Model;
pub use operation::{
    ConvolutionParameters, OperandKind, Operation, OperationType, Parameters, Pooling,
    PoolingMode,
};
pub use shape::{Shape, MAX_RANK};
pub use tensor::Tensor;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{DataType, Model, OperandKind, Operation, OperationType, Result, Tensor};
}
