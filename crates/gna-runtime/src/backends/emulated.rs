// SPDX-License-Identifier: AGPL-3.0-only

//! Emulated device driver
//!
//! Implements [`DriverInterface`] without hardware. Mapping hands out
//! sequential ids; submission applies the request's patches to a copy of
//! descriptor memory and records the result instead of scoring, so tests can
//! inspect exactly what a device would have received.
//!
//! Failures are scripted: [`EmulatedDriver::fail_next`] queues driver errors
//! returned by the next submissions, and [`EmulatedDriver::set_status`]
//! chooses the status word of successful ones.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use gna_chip::{status, DeviceVersion};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::driver::{DriverCapabilities, DriverError, DriverInterface, MappingId, SubmitResult};
use crate::error::{GnaError, Result};
use crate::hardware_request::{HardwareRequest, OperationMode};
use crate::memory::Memory;
use crate::profiler::{DriverPerf, HardwarePerf, RequestProfiler};

/// Device cycles the emulation charges per submitted layer
const CYCLES_PER_LAYER: u64 = 1000;

/// One recorded submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Request configuration
    pub config_id: u32,
    /// First layer
    pub layer_index: u32,
    /// Layers submitted
    pub layer_count: u32,
    /// Operating mode
    pub mode: OperationMode,
    /// Descriptor offset the device would start at
    pub descriptor_base: u32,
    /// Descriptor memory with the request patches applied
    pub descriptors: Vec<u8>,
}

/// In-memory device
#[derive(Debug)]
pub struct EmulatedDriver {
    version: DeviceVersion,
    fallback_supported: bool,
    next_mapping: AtomicU64,
    mappings: Mutex<HashSet<u64>>,
    failures: Mutex<VecDeque<DriverError>>,
    status: AtomicU32,
    submissions: Mutex<Vec<Submission>>,
}

impl EmulatedDriver {
    /// Emulate a device of `version`
    pub fn new(version: DeviceVersion) -> Self {
        Self {
            version,
            fallback_supported: true,
            next_mapping: AtomicU64::new(1),
            mappings: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            status: AtomicU32::new(status::COMPLETED),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Report no software fallback support
    #[must_use]
    pub fn without_fallback(mut self) -> Self {
        self.fallback_supported = false;
        self
    }

    /// Emulated version
    pub fn version(&self) -> DeviceVersion {
        self.version
    }

    /// Fail the next submission with `error`; queued errors are used in order
    pub fn fail_next(&self, error: DriverError) {
        self.failures.lock().push_back(error);
    }

    /// Status word of successful submissions
    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::Relaxed);
    }

    /// Submissions recorded so far
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    /// Allocations currently mapped
    pub fn mapped_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

impl DriverInterface for EmulatedDriver {
    fn open_device(&self, index: u32) -> Result<DriverCapabilities> {
        if index != 0 {
            return Err(GnaError::DeviceNotAvailable {
                index,
                reason: "emulation provides device 0 only".into(),
            });
        }
        info!("Opened emulated {} device", self.version);
        Ok(DriverCapabilities {
            buffer_size: u32::MAX,
            recovery_timeout: Duration::from_secs(60),
            device_version: self.version.raw(),
            perf_counter_frequency: 1_000_000,
            software_fallback_supported: self.fallback_supported,
        })
    }

    fn map_memory(&self, memory: &Memory) -> Result<MappingId> {
        let id = self.next_mapping.fetch_add(1, Ordering::Relaxed);
        self.mappings.lock().insert(id);
        debug!("Mapped {} bytes at 0x{:X} as {id}", memory.size(), memory.address());
        Ok(MappingId(id))
    }

    fn unmap_memory(&self, mapping: MappingId) -> bool {
        self.mappings.lock().remove(&mapping.0)
    }

    fn submit(
        &self,
        request: &HardwareRequest,
        _profiler: &mut RequestProfiler,
    ) -> std::result::Result<SubmitResult, DriverError> {
        let start = Instant::now();
        if let Some(error) = self.failures.lock().pop_front() {
            debug!("Emulated submission failed: {error}");
            return Err(error);
        }
        let descriptors = request
            .patched_descriptors()
            .map_err(|e| DriverError::CriticalFailure { reason: e.to_string() })?;
        self.submissions.lock().push(Submission {
            config_id: request.config_id(),
            layer_index: request.layer_index(),
            layer_count: request.layer_count(),
            mode: request.mode(),
            descriptor_base: request.descriptor_base(),
            descriptors,
        });
        let elapsed = start.elapsed().as_micros() as u64;
        Ok(SubmitResult {
            status: self.status.load(Ordering::Relaxed),
            driver_perf: DriverPerf {
                preprocessing: elapsed,
                processing: elapsed,
                device_completed: elapsed,
                completion: elapsed,
            },
            hardware_perf: HardwarePerf {
                total: u64::from(request.layer_count()) * CYCLES_PER_LAYER,
                stall: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_reports_version() {
        let driver = EmulatedDriver::new(DeviceVersion::Gna3_0);
        let caps = driver.open_device(0).unwrap();
        assert_eq!(caps.device_version, DeviceVersion::Gna3_0.raw());
        assert!(caps.software_fallback_supported);
        assert!(matches!(
            driver.open_device(1),
            Err(GnaError::DeviceNotAvailable { index: 1, .. })
        ));
        let caps = EmulatedDriver::new(DeviceVersion::Gna3_0)
            .without_fallback()
            .open_device(0)
            .unwrap();
        assert!(!caps.software_fallback_supported);
    }

    #[test]
    fn test_mappings_are_tracked() {
        let driver = EmulatedDriver::new(DeviceVersion::Gna2_0);
        let memory = Memory::allocate(64).unwrap();
        let a = driver.map_memory(&memory).unwrap();
        let b = driver.map_memory(&memory).unwrap();
        assert_ne!(a, b);
        assert_eq!(driver.mapped_count(), 2);
        assert!(driver.unmap_memory(a));
        assert!(!driver.unmap_memory(a));
        assert_eq!(driver.mapped_count(), 1);
    }
}
