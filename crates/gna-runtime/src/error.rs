// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for GNA runtime operations

use gna_chip::HardwareFault;
use gna_model::{ModelError, OperandKind};
use thiserror::Error;

/// Result type alias for GNA runtime operations
pub type Result<T> = std::result::Result<T, GnaError>;

/// Broad class of a [`GnaError`], used to decide retry and reporting policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad identifier, buffer, device version or mode; never retried
    Configuration,
    /// Model or submission exceeds device limits
    Capacity,
    /// Device queue contention; retried in software when fallback is enabled
    Transient,
    /// Fault reported in the hardware status register
    HardwareStatus,
    /// Model failed validation
    ModelInvalid,
    /// Allocation failure
    Resource,
    /// Unrecoverable driver or runtime failure
    Fatal,
}

/// Errors that can occur during GNA runtime operations
#[derive(Debug, Error)]
pub enum GnaError {
    /// Unknown identifier of a device, model, configuration or request
    #[error("Invalid {what} identifier {id}")]
    IdentifierInvalid {
        /// Kind of object looked up
        what: &'static str,
        /// Identifier that was not found
        id: u32,
    },

    /// Device version not known or not usable for the operation
    #[error("Invalid device version 0x{version:X}")]
    DeviceVersionInvalid {
        /// Raw version code
        version: u32,
    },

    /// Device could not be opened
    #[error("Device {index} not available: {reason}")]
    DeviceNotAvailable {
        /// Device index
        index: u32,
        /// Reason for failure
        reason: String,
    },

    /// Buffer is not inside a registered allocation, or otherwise unusable
    #[error("Invalid memory buffer 0x{address:X}: {reason}")]
    MemoryBufferInvalid {
        /// Buffer address
        address: u64,
        /// Reason for failure
        reason: String,
    },

    /// Buffer or offset violates an alignment requirement
    #[error("Buffer 0x{address:X} is not aligned to {alignment} bytes")]
    MemoryAlignmentInvalid {
        /// Buffer address or offset
        address: u64,
        /// Required alignment
        alignment: u32,
    },

    /// Allocation size not allowed
    #[error("Invalid memory size {size}")]
    MemorySizeInvalid {
        /// Requested size
        size: u64,
    },

    /// Total memory exceeds the device address space
    #[error("Total memory size {size} exceeds device limit {limit}")]
    MemoryTotalSizeExceeded {
        /// Required size
        size: u64,
        /// Device limit
        limit: u64,
    },

    /// Host allocation failed
    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size
        size: u64,
    },

    /// Acceleration mode cannot be honoured
    #[error("Acceleration mode not supported: {reason}")]
    AccelerationModeNotSupported {
        /// Reason for failure
        reason: String,
    },

    /// Model description rejected
    #[error("Invalid model: {source}")]
    Model {
        /// Underlying validation error
        #[from]
        source: ModelError,
    },

    /// Model is well formed but cannot be compiled or executed
    #[error("Invalid model: {reason}")]
    ModelInvalid {
        /// Reason for failure
        reason: String,
    },

    /// Operand slot not valid for the layer
    #[error("Invalid operand {operand:?}: {reason}")]
    OperandInvalid {
        /// Operand slot
        operand: OperandKind,
        /// Reason for failure
        reason: String,
    },

    /// Error localized to one layer
    #[error("Layer {index}: {source}")]
    Layer {
        /// Index of the failing layer
        index: u32,
        /// Underlying error
        #[source]
        source: Box<GnaError>,
    },

    /// Descriptor field value does not fit the field
    #[error("Descriptor value {value} does not fit {field}")]
    ParameterOutOfRange {
        /// Field name
        field: String,
        /// Rejected value
        value: u64,
    },

    /// No descriptor encoder exists for a generation
    #[error("Hardware module unavailable: {reason}")]
    HardwareModuleUnavailable {
        /// Reason for failure
        reason: String,
    },

    /// Layer count exceeds what one submission can hold
    #[error("Layer count {count} exceeds limit {limit}")]
    LayerCountExceeded {
        /// Requested layers
        count: u32,
        /// Device limit
        limit: u32,
    },

    /// Request queue is full
    #[error("Request queue full ({limit} pending)")]
    RequestQueueFull {
        /// Queue capacity
        limit: usize,
    },

    /// Thread count outside the supported range
    #[error("Invalid thread count {count}")]
    ThreadCountInvalid {
        /// Requested count
        count: usize,
    },

    /// Operation refused while requests are in flight
    #[error("Requests pending: {reason}")]
    RequestsPending {
        /// Reason for failure
        reason: String,
    },

    /// Device queue contention
    #[error("Device queue contention")]
    QueueContention,

    /// Device busy
    #[error("Device busy")]
    DeviceBusy,

    /// Driver reported a critical failure
    #[error("Critical device failure: {reason}")]
    DeviceCriticalFailure {
        /// Reason for failure
        reason: String,
    },

    /// Fault reported by the hardware status register
    #[error("Hardware fault: {fault}")]
    Hardware {
        /// Decoded fault
        fault: HardwareFault,
    },

    /// Configuration value could not be parsed
    #[error("Invalid configuration {key}: {reason}")]
    Config {
        /// Setting name
        key: String,
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl GnaError {
    /// Create an identifier error
    pub fn identifier(what: &'static str, id: u32) -> Self {
        Self::IdentifierInvalid { what, id }
    }

    /// Create a buffer error
    pub fn buffer_invalid(address: u64, reason: impl Into<String>) -> Self {
        Self::MemoryBufferInvalid {
            address,
            reason: reason.into(),
        }
    }

    /// Create a model error
    pub fn model_invalid(reason: impl Into<String>) -> Self {
        Self::ModelInvalid {
            reason: reason.into(),
        }
    }

    /// Create an operand error
    pub fn operand_invalid(operand: OperandKind, reason: impl Into<String>) -> Self {
        Self::OperandInvalid {
            operand,
            reason: reason.into(),
        }
    }

    /// Create an acceleration mode error
    pub fn mode_not_supported(reason: impl Into<String>) -> Self {
        Self::AccelerationModeNotSupported {
            reason: reason.into(),
        }
    }

    /// Attach a layer index. Hardware-module failures are not layer specific
    /// and pass through unchanged, as do errors already carrying an index.
    #[must_use]
    pub fn at_layer(self, index: u32) -> Self {
        match self {
            Self::HardwareModuleUnavailable { .. } | Self::Layer { .. } => self,
            other => Self::Layer {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Index of the layer the error is localized to
    pub fn layer_index(&self) -> Option<u32> {
        match self {
            Self::Layer { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Error without layer annotation
    pub fn root(&self) -> &GnaError {
        match self {
            Self::Layer { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentifierInvalid { .. }
            | Self::DeviceVersionInvalid { .. }
            | Self::MemoryBufferInvalid { .. }
            | Self::MemoryAlignmentInvalid { .. }
            | Self::MemorySizeInvalid { .. }
            | Self::AccelerationModeNotSupported { .. }
            | Self::OperandInvalid { .. }
            | Self::ThreadCountInvalid { .. }
            | Self::RequestsPending { .. }
            | Self::Config { .. } => ErrorKind::Configuration,
            Self::MemoryTotalSizeExceeded { .. }
            | Self::LayerCountExceeded { .. }
            | Self::RequestQueueFull { .. } => ErrorKind::Capacity,
            Self::QueueContention => ErrorKind::Transient,
            Self::Hardware { .. } => ErrorKind::HardwareStatus,
            Self::Model { .. } | Self::ModelInvalid { .. } | Self::ParameterOutOfRange { .. } => {
                ErrorKind::ModelInvalid
            }
            Self::Layer { source, .. } => match source.kind() {
                ErrorKind::Configuration => ErrorKind::ModelInvalid,
                other => other,
            },
            Self::OutOfMemory { .. } => ErrorKind::Resource,
            Self::DeviceNotAvailable { .. }
            | Self::HardwareModuleUnavailable { .. }
            | Self::DeviceBusy
            | Self::DeviceCriticalFailure { .. }
            | Self::Io { .. } => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_annotation() {
        let err = GnaError::buffer_invalid(0x40, "not registered").at_layer(3);
        assert_eq!(err.layer_index(), Some(3));
        assert!(matches!(err.root(), GnaError::MemoryBufferInvalid { .. }));
        assert_eq!(err.kind(), ErrorKind::ModelInvalid);
        // A second annotation keeps the innermost index.
        assert_eq!(err.at_layer(7).layer_index(), Some(3));
    }

    #[test]
    fn test_module_failure_not_annotated() {
        let err = GnaError::HardwareModuleUnavailable {
            reason: "no encoder".into(),
        }
        .at_layer(1);
        assert_eq!(err.layer_index(), None);
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(GnaError::QueueContention.kind(), ErrorKind::Transient);
        assert_eq!(GnaError::OutOfMemory { size: 1 }.kind(), ErrorKind::Resource);
        assert_eq!(
            GnaError::Hardware { fault: HardwareFault::Dma }.kind(),
            ErrorKind::HardwareStatus
        );
        assert_eq!(GnaError::RequestQueueFull { limit: 4 }.kind(), ErrorKind::Capacity);
    }
}
