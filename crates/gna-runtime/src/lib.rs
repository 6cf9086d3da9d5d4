// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime core for GNA accelerators.
//!
//! Compiles [`gna_model::Model`]s for a device, partitions them into runs of
//! hardware and software layers, encodes hardware layers into 128-byte
//! descriptors and scores requests on a worker pool, submitting hardware
//! runs through a [`DriverInterface`] and executing the rest on the CPU.
//!
//! # Scoring path
//!
//! ```text
//! Device::enqueue
//!   └─ WorkerPool job
//!        └─ CompiledModel::score_range
//!             ├─ Software sub-model       -> kernels (CPU)
//!             └─ Hardware sub-model       -> HardwareRequest patches
//!                                            -> DriverInterface::submit
//!                                            -> (contention + fallback) -> kernels
//! ```
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`registry`] | Reference-counted open devices |
//! | [`device`] | Allocations, models, configurations, requests of one device |
//! | [`compiled_model`] | Execution strategy and hybrid scoring |
//! | [`submodel`] | Partition of layers into hardware / software runs |
//! | [`capabilities`] | Per-version support decisions |
//! | [`hardware_model`] | Descriptor memory and address translation |
//! | [`descriptor`] | Per-generation descriptor encoders |
//! | [`address`] | MMU, flat and bar-relative translation |
//! | [`hardware_request`] | Per-configuration descriptor patches |
//! | [`kernels`] | CPU kernels, generic and bit-exact |
//! | [`export`] | MMU-less and legacy single-shot export |
//! | [`backends`] | Driver implementations |
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use gna_model::{DataType, Model, Operation, Tensor};
//! use gna_runtime::{DeviceRegistry, RequestStatus, RuntimeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DeviceRegistry::new(RuntimeConfig::from_env()?, None);
//! let device = registry.open(0)?;
//!
//! let input = device.allocate_memory(64)?;
//! let output = device.allocate_memory(64)?;
//! let model = Model::new(vec![Operation::copy(
//!     Tensor::new(&[1, 8], DataType::Int16).with_data(input.address()),
//!     Tensor::new(&[1, 8], DataType::Int16).with_data(output.address()),
//!     1,
//!     8,
//! )])?;
//!
//! let config = device.create_config(device.create_model(&model)?)?;
//! let request = device.enqueue(config)?;
//! if let RequestStatus::Completed(report) = device.wait(request, Duration::from_secs(1))? {
//!     println!("{} saturations", report.saturation_count);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod address;
pub mod backends;
pub mod capabilities;
pub mod compiled_model;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod driver;
mod error;
pub mod export;
pub mod hardware_model;
pub mod hardware_request;
pub mod kernels;
pub mod layer;
pub mod memory;
pub mod pool;
pub mod profiler;
pub mod registry;
pub mod request;
pub mod request_config;
pub mod software_model;
pub mod submodel;

pub use backends::EmulatedDriver;
pub use capabilities::HardwareCapabilities;
pub use compiled_model::{CompiledModel, ExecutionStrategy, ScoreReport};
pub use config::RuntimeConfig;
pub use device::Device;
pub use driver::{DriverCapabilities, DriverError, DriverInterface, MappingId, SubmitResult};
pub use error::{ErrorKind, GnaError, Result};
pub use export::{LegacyExport, LegacyExportHeader, MmuLessExport};
pub use memory::{Memory, MemoryContainer};
pub use profiler::{InstrumentationPoint, InstrumentationUnit, ProfilerConfiguration};
pub use registry::DeviceRegistry;
pub use request::{RequestState, RequestStatus};
pub use request_config::{AccelerationMode, RequestConfiguration};
pub use submodel::{SubModel, SubModelKind};
