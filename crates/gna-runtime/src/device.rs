// SPDX-License-Identifier: AGPL-3.0-only

//! Device facade
//!
//! A [`Device`] owns everything a caller creates on one accelerator:
//! allocations, compiled models, request configurations and scoring
//! requests. Requests are scored on the device's worker pool and retrieved
//! with [`Device::wait`].
//!
//! A device opened without a driver is software-only: models compile for
//! CPU scoring and hardware acceleration is refused.
//!
//! Lock order is configurations, then models, then memory. No method holds
//! two of them except in that order.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gna_chip::{DeviceVersion, MemoryTag};
use gna_model::{Model, OperandKind};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capabilities::HardwareCapabilities;
use crate::compiled_model::CompiledModel;
use crate::config::RuntimeConfig;
use crate::driver::{DriverCapabilities, DriverInterface};
use crate::error::{GnaError, Result};
use crate::export::{self, LegacyExport, MmuLessExport};
use crate::memory::{Memory, MemoryContainer};
use crate::pool::WorkerPool;
use crate::profiler::ProfilerConfiguration;
use crate::request::{RequestHandler, RequestStatus};
use crate::request_config::{AccelerationMode, RequestConfiguration};

/// Opened device
pub struct Device {
    index: u32,
    driver: Option<Arc<dyn DriverInterface>>,
    capabilities: Option<HardwareCapabilities>,
    driver_capabilities: Option<DriverCapabilities>,
    config: RuntimeConfig,
    memory: Mutex<BTreeMap<u64, Arc<Memory>>>,
    models: Mutex<HashMap<u32, Arc<CompiledModel>>>,
    configs: Mutex<HashMap<u32, RequestConfiguration>>,
    next_model_id: AtomicU32,
    next_config_id: AtomicU32,
    requests: RequestHandler,
    pool: Mutex<WorkerPool>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("version", &self.version())
            .field("allocations", &self.memory.lock().len())
            .field("models", &self.models.lock().len())
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Open device `index`
    ///
    /// With `driver` set, the driver opens the device and its reported
    /// version selects the hardware capabilities. Without one the device
    /// scores in software only.
    ///
    /// # Errors
    ///
    /// Invalid `config`, driver open failures and unknown device versions.
    pub fn open(index: u32, driver: Option<Arc<dyn DriverInterface>>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let (capabilities, driver_capabilities) = match &driver {
            Some(driver) => {
                let caps = driver.open_device(index)?;
                let hardware = HardwareCapabilities::from_raw(caps.device_version)?;
                info!(
                    "Device {index}: {} with {} compute engines, software fallback {}",
                    hardware.version(),
                    hardware.compute_engine_count(),
                    if caps.software_fallback_supported { "supported" } else { "unsupported" }
                );
                (Some(hardware), Some(caps))
            }
            None => {
                info!("Device {index}: no driver, software scoring only");
                (None, None)
            }
        };
        let pool = WorkerPool::new(config.thread_count)?;
        Ok(Self {
            index,
            driver,
            capabilities,
            driver_capabilities,
            requests: RequestHandler::new(config.max_queued_requests),
            config,
            memory: Mutex::new(BTreeMap::new()),
            models: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
            next_model_id: AtomicU32::new(0),
            next_config_id: AtomicU32::new(0),
            pool: Mutex::new(pool),
        })
    }

    /// Device index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Hardware version; `None` for a software-only device
    pub fn version(&self) -> Option<DeviceVersion> {
        self.capabilities.map(|c| c.version())
    }

    /// Hardware capabilities; `None` for a software-only device
    pub fn capabilities(&self) -> Option<&HardwareCapabilities> {
        self.capabilities.as_ref()
    }

    /// What the driver reported at open
    pub fn driver_capabilities(&self) -> Option<&DriverCapabilities> {
        self.driver_capabilities.as_ref()
    }

    /// Runtime configuration the device was opened with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Allocate `size` bytes the device can address
    ///
    /// The allocation is mapped and pinned when a driver is present.
    ///
    /// # Errors
    ///
    /// [`GnaError::MemorySizeInvalid`], [`GnaError::OutOfMemory`] and
    /// driver mapping failures.
    pub fn allocate_memory(&self, size: u32) -> Result<Arc<Memory>> {
        let memory = Memory::allocate(size)?;
        if let Some(driver) = &self.driver {
            memory.set_mapping(Some(driver.map_memory(&memory)?));
            memory.pin();
        }
        self.memory.lock().insert(memory.address(), Arc::clone(&memory));
        debug!("Device {}: allocated {size} bytes at 0x{:X}", self.index, memory.address());
        Ok(memory)
    }

    /// Release the allocation starting at `address`
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when no allocation starts at
    /// `address` or a model or configuration still uses it.
    pub fn free_memory(&self, address: u64) -> Result<()> {
        let users = self
            .configs
            .lock()
            .values()
            .filter(|c| c.memory().contains(address, 0))
            .count()
            + self
                .models
                .lock()
                .values()
                .filter(|m| m.memory().contains(address, 0))
                .count();
        if users > 0 {
            return Err(GnaError::buffer_invalid(
                address,
                format!("in use by {users} models or configurations"),
            ));
        }
        let memory = self
            .memory
            .lock()
            .remove(&address)
            .ok_or_else(|| GnaError::buffer_invalid(address, "not an allocation of this device"))?;
        self.unmap(&memory);
        debug!("Device {}: freed memory at 0x{address:X}", self.index);
        Ok(())
    }

    /// Tag the allocation starting at `address`
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when no allocation starts at
    /// `address`.
    pub fn tag_memory(&self, address: u64, tag: MemoryTag) -> Result<()> {
        let memory = self.memory.lock();
        let memory = memory
            .get(&address)
            .ok_or_else(|| GnaError::buffer_invalid(address, "not an allocation of this device"))?;
        memory.set_tag(tag);
        Ok(())
    }

    /// Allocation containing `address`
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when no allocation contains it.
    pub fn find_memory(&self, address: u64) -> Result<Arc<Memory>> {
        self.memory
            .lock()
            .range(..=address)
            .next_back()
            .filter(|(_, m)| m.contains(address, 0))
            .map(|(_, m)| Arc::clone(m))
            .ok_or_else(|| GnaError::buffer_invalid(address, "not inside a device allocation"))
    }

    fn unmap(&self, memory: &Memory) {
        if let (Some(driver), Some(mapping)) = (&self.driver, memory.set_mapping(None)) {
            if !driver.unmap_memory(mapping) {
                warn!("Device {}: driver did not know mapping {}", self.index, mapping.0);
            }
        }
    }

    fn model_memory(&self, model: &Model) -> MemoryContainer {
        let mut container = MemoryContainer::new();
        for (_, _, address) in model.data_addresses() {
            if let Ok(memory) = self.find_memory(address) {
                // Duplicates are reported as `false`, never as errors.
                let _ = container.append(memory);
            }
        }
        container
    }

    /// Compile `model` for this device and return its id
    ///
    /// Every tensor address must lie inside an allocation of this device.
    ///
    /// # Errors
    ///
    /// Layer conversion errors, tensors outside device memory and hardware
    /// model build errors.
    pub fn create_model(&self, model: &Model) -> Result<u32> {
        let id = self.next_model_id.fetch_add(1, Ordering::Relaxed);
        let memory = self.model_memory(model);
        let compiled = match (&self.driver, self.capabilities) {
            (Some(driver), Some(capabilities)) => {
                let mapper = Arc::clone(driver);
                let mut mapped = Vec::new();
                let mut allocator = |size: u32| -> Result<Arc<Memory>> {
                    let memory = Memory::allocate(size)?;
                    memory.set_mapping(Some(mapper.map_memory(&memory)?));
                    memory.pin();
                    mapped.push(Arc::clone(&memory));
                    Ok(memory)
                };
                let compiled = CompiledModel::hybrid(id, model, memory, Arc::clone(driver), capabilities, &mut allocator);
                match compiled {
                    Ok(compiled) => compiled,
                    Err(e) => {
                        for descriptors in &mapped {
                            self.unmap(descriptors);
                        }
                        warn!("Device {}: model {id} failed to compile: {e}", self.index);
                        return Err(e);
                    }
                }
            }
            _ => CompiledModel::software_only(id, model, memory)?,
        };
        self.models.lock().insert(id, Arc::new(compiled));
        Ok(id)
    }

    /// Compile `model` for export to `target` and return its id
    ///
    /// Export models score in software with the target's numerics.
    ///
    /// # Errors
    ///
    /// Layer conversion errors and tensors outside device memory.
    pub fn create_export_model(&self, model: &Model, target: DeviceVersion) -> Result<u32> {
        let id = self.next_model_id.fetch_add(1, Ordering::Relaxed);
        let compiled = CompiledModel::for_export(id, model, self.model_memory(model), target)?;
        self.models.lock().insert(id, Arc::new(compiled));
        Ok(id)
    }

    /// Compiled model `id`
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown id.
    pub fn model(&self, id: u32) -> Result<Arc<CompiledModel>> {
        self.models
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| GnaError::identifier("model", id))
    }

    /// Release model `id` and every configuration created for it
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown id and
    /// [`GnaError::RequestsPending`] while one of its configurations has
    /// requests in flight.
    pub fn release_model(&self, id: u32) -> Result<()> {
        let mut configs = self.configs.lock();
        let owned: Vec<u32> = configs
            .values()
            .filter(|c| c.model_id() == id)
            .map(RequestConfiguration::id)
            .collect();
        if let Some(busy) = owned.iter().find(|c| self.requests.uses_config(**c)) {
            return Err(GnaError::RequestsPending {
                reason: format!("configuration {busy} of model {id} is scoring"),
            });
        }
        let model = self
            .models
            .lock()
            .remove(&id)
            .ok_or_else(|| GnaError::identifier("model", id))?;
        for config in &owned {
            configs.remove(config);
        }
        drop(configs);
        if let Some(hardware) = model.hardware() {
            self.unmap(hardware.descriptor_memory());
        }
        info!(
            "Device {}: released model {id} and {} configurations",
            self.index,
            owned.len()
        );
        Ok(())
    }

    /// New configuration for model `model_id`
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown model.
    pub fn create_config(&self, model_id: u32) -> Result<u32> {
        self.model(model_id)?;
        let id = self.next_config_id.fetch_add(1, Ordering::Relaxed);
        self.configs
            .lock()
            .insert(id, RequestConfiguration::new(id, model_id));
        debug!("Device {}: config {id} for model {model_id}", self.index);
        Ok(id)
    }

    /// Snapshot of configuration `id`
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown id.
    pub fn config_snapshot(&self, id: u32) -> Result<RequestConfiguration> {
        self.configs
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| GnaError::identifier("configuration", id))
    }

    /// Release configuration `id`
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown id and
    /// [`GnaError::RequestsPending`] while it has requests in flight.
    pub fn release_config(&self, id: u32) -> Result<()> {
        if self.requests.uses_config(id) {
            return Err(GnaError::RequestsPending {
                reason: format!("configuration {id} is scoring"),
            });
        }
        let config = self
            .configs
            .lock()
            .remove(&id)
            .ok_or_else(|| GnaError::identifier("configuration", id))?;
        if let Ok(model) = self.model(config.model_id()) {
            model.invalidate_config(id);
        }
        Ok(())
    }

    fn with_config<T>(
        &self,
        id: u32,
        f: impl FnOnce(&mut RequestConfiguration, &CompiledModel) -> Result<T>,
    ) -> Result<T> {
        let mut configs = self.configs.lock();
        let config = configs
            .get_mut(&id)
            .ok_or_else(|| GnaError::identifier("configuration", id))?;
        let model = self.model(config.model_id())?;
        f(config, &model)
    }

    /// Bind `address` to an operand of one layer
    ///
    /// # Errors
    ///
    /// Unknown ids or layer, addresses outside device memory and the
    /// checks of [`RequestConfiguration::set_buffer`].
    pub fn bind_buffer(&self, config_id: u32, layer_index: u32, operand: OperandKind, address: u64) -> Result<()> {
        let memory = self.find_memory(address)?;
        self.with_config(config_id, |config, model| {
            let layer = model.software().layer(layer_index)?;
            config.set_buffer(layer, operand, address, memory)
        })
    }

    /// Select an active list of `count` indices at `address`
    ///
    /// # Errors
    ///
    /// Unknown ids or layer, addresses outside device memory and the
    /// checks of [`RequestConfiguration::set_active_list`].
    pub fn set_active_list(&self, config_id: u32, layer_index: u32, address: u64, count: u32) -> Result<()> {
        let memory = self.find_memory(address)?;
        self.with_config(config_id, |config, model| {
            let layer = model.software().layer(layer_index)?;
            config.set_active_list(layer, address, count, memory)
        })
    }

    /// Remove the active list of a layer
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown configuration.
    pub fn clear_active_list(&self, config_id: u32, layer_index: u32) -> Result<()> {
        self.with_config(config_id, |config, _| {
            config.clear_active_list(layer_index);
            Ok(())
        })
    }

    /// Choose where scoring runs
    ///
    /// # Errors
    ///
    /// [`GnaError::AccelerationModeNotSupported`] for hardware acceleration
    /// on a software-only device.
    pub fn set_acceleration(&self, config_id: u32, mode: AccelerationMode) -> Result<()> {
        if mode == AccelerationMode::Hardware && self.driver.is_none() {
            return Err(GnaError::mode_not_supported(format!(
                "device {} has no hardware",
                self.index
            )));
        }
        self.with_config(config_id, |config, _| {
            config.set_acceleration(mode);
            Ok(())
        })
    }

    /// Retry contended hardware runs on the CPU
    ///
    /// # Errors
    ///
    /// [`GnaError::AccelerationModeNotSupported`] when the driver reported
    /// no fallback support.
    pub fn set_software_fallback(&self, config_id: u32, enabled: bool) -> Result<()> {
        if enabled
            && self
                .driver_capabilities
                .as_ref()
                .is_some_and(|c| !c.software_fallback_supported)
        {
            return Err(GnaError::mode_not_supported(format!(
                "device {} does not support software fallback",
                self.index
            )));
        }
        self.with_config(config_id, |config, _| {
            config.set_software_fallback(enabled);
            Ok(())
        })
    }

    /// Reproduce the numerics of `version` when scoring in software
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown configuration.
    pub fn set_hardware_consistency(&self, config_id: u32, version: Option<DeviceVersion>) -> Result<()> {
        self.with_config(config_id, |config, _| {
            config.set_hardware_consistency(version);
            Ok(())
        })
    }

    /// Select profiler points
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown configuration.
    pub fn set_profiler(&self, config_id: u32, profiler: ProfilerConfiguration) -> Result<()> {
        self.with_config(config_id, |config, _| {
            config.set_profiler(profiler);
            Ok(())
        })
    }

    /// Score every layer with configuration `config_id`
    ///
    /// Returns the request id to wait on.
    ///
    /// # Errors
    ///
    /// See [`Device::enqueue_range`].
    pub fn enqueue(&self, config_id: u32) -> Result<u32> {
        let layers = {
            let config = self.config_snapshot(config_id)?;
            self.model(config.model_id())?.layer_count()
        };
        self.enqueue_range(config_id, 0..layers)
    }

    /// Score layers `range` with configuration `config_id`
    ///
    /// The configuration is captured now; later changes do not affect the
    /// request.
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown configuration,
    /// [`GnaError::LayerCountExceeded`] for a range outside the model and
    /// [`GnaError::RequestQueueFull`].
    pub fn enqueue_range(&self, config_id: u32, range: Range<u32>) -> Result<u32> {
        let config = self.config_snapshot(config_id)?;
        let model = self.model(config.model_id())?;
        if range.start >= range.end || range.end > model.layer_count() {
            return Err(GnaError::LayerCountExceeded {
                count: range.end,
                limit: model.layer_count(),
            });
        }
        let request = self.requests.enqueue(config_id)?;
        let id = request.id();
        let device = self.index;
        self.pool.lock().execute(move || {
            request.start();
            let result = panic::catch_unwind(AssertUnwindSafe(|| model.score_range(range, &config)))
                .unwrap_or_else(|payload| {
                    Err(GnaError::DeviceCriticalFailure {
                        reason: format!("scoring panicked: {}", panic_message(payload.as_ref())),
                    })
                });
            if let Err(e) = &result {
                warn!("Device {device}: request {} failed: {e}", request.id());
            }
            request.complete(result);
        });
        Ok(id)
    }

    /// Wait up to `timeout` for request `id`
    ///
    /// [`RequestStatus::Busy`] means the request is still in flight; it
    /// stays queryable.
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown or already retrieved
    /// request, or the request's scoring error.
    pub fn wait(&self, id: u32, timeout: Duration) -> Result<RequestStatus> {
        self.requests.wait(id, timeout)
    }

    /// [`Device::wait`] with the configured default timeout
    ///
    /// # Errors
    ///
    /// See [`Device::wait`].
    pub fn wait_default(&self, id: u32) -> Result<RequestStatus> {
        self.wait(id, self.config.wait_timeout)
    }

    /// Requests not yet completed
    pub fn pending_requests(&self) -> usize {
        self.requests.pending()
    }

    /// Replace the worker pool with `count` threads
    ///
    /// # Errors
    ///
    /// [`GnaError::ThreadCountInvalid`] and [`GnaError::RequestsPending`]
    /// while requests are in flight.
    pub fn set_thread_count(&self, count: usize) -> Result<()> {
        let pending = self.requests.pending();
        if pending > 0 {
            return Err(GnaError::RequestsPending {
                reason: format!("{pending} requests in flight on device {}", self.index),
            });
        }
        self.pool.lock().set_thread_count(count)
    }

    /// Worker threads
    pub fn thread_count(&self) -> usize {
        self.pool.lock().thread_count()
    }

    /// Export model `model_id` for an MMU-less target
    ///
    /// # Errors
    ///
    /// Unknown model and the errors of [`export::export_mmu_less`].
    pub fn export_mmu_less(&self, model_id: u32, target: DeviceVersion) -> Result<MmuLessExport> {
        let model = self.model(model_id)?;
        export::export_mmu_less(&model, target, &mut |size| Memory::allocate(size))
    }

    /// Export model `model_id` as a legacy single-shot image
    ///
    /// # Errors
    ///
    /// Unknown model and the errors of [`export::export_legacy`].
    pub fn export_legacy(&self, model_id: u32) -> Result<LegacyExport> {
        let model = self.model(model_id)?;
        export::export_legacy(&model, &mut |size| Memory::allocate(size))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

impl Drop for Device {
    fn drop(&mut self) {
        let memory = std::mem::take(&mut *self.memory.lock());
        for allocation in memory.values() {
            self.unmap(allocation);
        }
        for model in self.models.lock().values() {
            if let Some(hardware) = model.hardware() {
                self.unmap(hardware.descriptor_memory());
            }
        }
        debug!("Device {} closed", self.index);
    }
}
