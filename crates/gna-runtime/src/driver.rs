// SPDX-License-Identifier: AGPL-3.0-only

//! Driver boundary
//!
//! The runtime never talks to the device directly. Everything below memory
//! mapping and request submission sits behind [`DriverInterface`]: the OS
//! transport, request timeouts and recovery belong to the driver.

use std::fmt::Debug;
use std::time::Duration;

use gna_chip::HardwareFault;
use thiserror::Error;

use crate::error::{GnaError, Result};
use crate::hardware_request::HardwareRequest;
use crate::memory::Memory;
use crate::profiler::{DriverPerf, HardwarePerf, RequestProfiler};

/// What the driver reports about an opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Largest request buffer the driver accepts, in bytes
    pub buffer_size: u32,
    /// Time the driver waits before resetting a hung device
    pub recovery_timeout: Duration,
    /// Raw device version code
    pub device_version: u32,
    /// Performance counter frequency in Hz
    pub perf_counter_frequency: u64,
    /// True when requests may fall back to software on contention
    pub software_fallback_supported: bool,
}

/// Driver handle of a mapped allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(pub u64);

/// Outcome of a completed submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitResult {
    /// Raw hardware status word
    pub status: u32,
    /// Driver time counters
    pub driver_perf: DriverPerf,
    /// Device cycle counters
    pub hardware_perf: HardwarePerf,
}

/// Submission failures reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Device queue is contended; the request was not executed
    #[error("Device queue contention")]
    QueueContention,

    /// Unrecoverable driver failure
    #[error("Critical driver failure: {reason}")]
    CriticalFailure {
        /// Reason for failure
        reason: String,
    },

    /// Device busy
    #[error("Device busy")]
    Busy,

    /// Device reported a fault
    #[error("Hardware status: {0}")]
    HardwareStatus(HardwareFault),
}

impl From<DriverError> for GnaError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::QueueContention => Self::QueueContention,
            DriverError::CriticalFailure { reason } => Self::DeviceCriticalFailure { reason },
            DriverError::Busy => Self::DeviceBusy,
            DriverError::HardwareStatus(fault) => Self::Hardware { fault },
        }
    }
}

/// Operations a device driver provides
pub trait DriverInterface: Debug + Send + Sync {
    /// Open device `index` and report its capabilities
    ///
    /// # Errors
    ///
    /// Returns [`GnaError::DeviceNotAvailable`] when no such device exists.
    fn open_device(&self, index: u32) -> Result<DriverCapabilities>;

    /// Make an allocation visible to the device
    ///
    /// # Errors
    ///
    /// Returns an error when the driver cannot map the memory.
    fn map_memory(&self, memory: &Memory) -> Result<MappingId>;

    /// Release a mapping; `false` when the id was unknown
    fn unmap_memory(&self, mapping: MappingId) -> bool;

    /// Execute a patched descriptor list and wait for completion
    ///
    /// # Errors
    ///
    /// Returns the driver's [`DriverError`].
    fn submit(
        &self,
        request: &HardwareRequest,
        profiler: &mut RequestProfiler,
    ) -> std::result::Result<SubmitResult, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_driver_errors_map_to_runtime_errors() {
        assert_eq!(GnaError::from(DriverError::QueueContention).kind(), ErrorKind::Transient);
        assert!(matches!(GnaError::from(DriverError::Busy), GnaError::DeviceBusy));
        assert!(matches!(
            GnaError::from(DriverError::HardwareStatus(HardwareFault::Mmu)),
            GnaError::Hardware {
                fault: HardwareFault::Mmu
            }
        ));
        assert_eq!(
            GnaError::from(DriverError::CriticalFailure {
                reason: "reset".into()
            })
            .kind(),
            ErrorKind::Fatal
        );
    }
}
