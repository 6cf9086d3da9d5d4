// SPDX-License-Identifier: AGPL-3.0-only

//! Compiled models and hybrid scoring
//!
//! A [`CompiledModel`] owns the software representation of a model, the
//! allocations the model refers to and, depending on its
//! [`ExecutionStrategy`], a hardware model built for the device. Scoring
//! walks the sub-model partition of the requested layer range:
//!
//! ```text
//! Software       -> CPU kernels
//! HardwareNative -> HardwareRequest (layer range, NN mode)   -> driver
//! HardwareLegacy -> HardwareRequest (one layer, GMM mode)    -> driver
//! ```
//!
//! Queue contention on a hardware run is retried on the CPU when the
//! configuration enables software fallback; every other driver failure
//! aborts the request.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use gna_chip::{status, DeviceVersion};
use gna_model::Model;
use parking_lot::Mutex;

use crate::capabilities::HardwareCapabilities;
use crate::driver::{DriverError, DriverInterface};
use crate::error::{GnaError, Result};
use crate::hardware_model::{DescriptorAllocator, HardwareModel, HardwareModelKind};
use crate::hardware_request::{HardwareRequest, OperationMode};
use crate::kernels::{ConsistencyMode, MemoryView};
use crate::memory::MemoryContainer;
use crate::profiler::{InstrumentationPoint, ProfileReport, RequestProfiler};
use crate::request_config::{AccelerationMode, RequestConfiguration};
use crate::software_model::SoftwareModel;
use crate::submodel::{is_fully_hardware_compatible, partition, SubModel};

/// How a compiled model executes
#[derive(Debug)]
pub enum ExecutionStrategy {
    /// No device; everything runs on the CPU
    SoftwareOnly,
    /// Device present; hardware runs go through the driver
    Hybrid {
        /// Driver of the device
        driver: Arc<dyn DriverInterface>,
        /// Capabilities of the device
        capabilities: HardwareCapabilities,
        /// Descriptors; `None` when no layer runs on the device
        hardware: Option<HardwareModel>,
    },
    /// Compiled for an export target; scoring runs on the CPU with the
    /// target's numerics
    Export {
        /// Export target
        target: DeviceVersion,
    },
}

/// Result of a completed scoring
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScoreReport {
    /// Saturated outputs (software) plus saturated hardware submissions
    pub saturation_count: u32,
    /// Configured profiler points
    pub profile: ProfileReport,
}

type RequestCache = HashMap<u32, Arc<Mutex<HardwareRequest>>>;

/// A model ready for scoring
#[derive(Debug)]
pub struct CompiledModel {
    id: u32,
    software: SoftwareModel,
    memory: MemoryContainer,
    strategy: ExecutionStrategy,
    submodels: Mutex<HashMap<DeviceVersion, Arc<[SubModel]>>>,
    requests: Mutex<RequestCache>,
}

impl CompiledModel {
    fn new(id: u32, model: &Model, memory: MemoryContainer, strategy: ExecutionStrategy) -> Result<Self> {
        let software = SoftwareModel::new(model)?;
        for (index, operand, address) in model.data_addresses() {
            if memory.offset_of(address, 1).is_none() {
                return Err(GnaError::buffer_invalid(
                    address,
                    format!("{operand:?} is not in device memory"),
                )
                .at_layer(index as u32));
            }
        }
        Ok(Self {
            id,
            software,
            memory,
            strategy,
            submodels: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
        })
    }

    /// Compile for CPU-only scoring
    ///
    /// `memory` holds every allocation the model's tensors point into.
    ///
    /// # Errors
    ///
    /// Layer conversion errors and tensors outside `memory`.
    pub fn software_only(id: u32, model: &Model, memory: MemoryContainer) -> Result<Self> {
        let compiled = Self::new(id, model, memory, ExecutionStrategy::SoftwareOnly)?;
        tracing::info!(
            "Compiled model {id}: {} layers, software only",
            compiled.layer_count()
        );
        Ok(compiled)
    }

    /// Compile for a device
    ///
    /// The hardware model is built only when at least one layer runs on
    /// the device; `allocator` supplies its descriptor memory.
    ///
    /// # Errors
    ///
    /// Layer conversion errors, tensors outside `memory` and hardware model
    /// build errors.
    pub fn hybrid(
        id: u32,
        model: &Model,
        memory: MemoryContainer,
        driver: Arc<dyn DriverInterface>,
        capabilities: HardwareCapabilities,
        allocator: &mut dyn DescriptorAllocator,
    ) -> Result<Self> {
        let mut compiled = Self::new(id, model, memory, ExecutionStrategy::SoftwareOnly)?;
        let submodels = compiled.partition_for(&capabilities);
        let hardware = if submodels.iter().any(|s| s.kind.is_hardware()) {
            Some(HardwareModel::build(
                compiled.software.layers(),
                &submodels,
                capabilities,
                HardwareModelKind::Scoring,
                &compiled.memory,
                allocator,
            )?)
        } else {
            tracing::info!(
                "Model {id} has no layer supported by {}, scoring in software",
                capabilities.version()
            );
            None
        };
        tracing::info!(
            "Compiled model {id}: {} layers in {} sub-models for {}",
            compiled.layer_count(),
            submodels.len(),
            capabilities.version()
        );
        compiled.strategy = ExecutionStrategy::Hybrid {
            driver,
            capabilities,
            hardware,
        };
        Ok(compiled)
    }

    /// Compile for an export target
    ///
    /// # Errors
    ///
    /// Layer conversion errors and tensors outside `memory`.
    pub fn for_export(id: u32, model: &Model, memory: MemoryContainer, target: DeviceVersion) -> Result<Self> {
        let compiled = Self::new(id, model, memory, ExecutionStrategy::Export { target })?;
        tracing::info!(
            "Compiled model {id} for export to {target}: fully hardware compatible: {}",
            compiled.is_fully_hardware_compatible(target)
        );
        Ok(compiled)
    }

    /// Model id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of layers
    pub fn layer_count(&self) -> u32 {
        self.software.layer_count()
    }

    /// CPU representation
    pub fn software(&self) -> &SoftwareModel {
        &self.software
    }

    /// Allocations referenced by the model
    pub fn memory(&self) -> &MemoryContainer {
        &self.memory
    }

    /// Execution strategy
    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    /// Hardware model of a hybrid compilation
    pub fn hardware(&self) -> Option<&HardwareModel> {
        match &self.strategy {
            ExecutionStrategy::Hybrid { hardware, .. } => hardware.as_ref(),
            _ => None,
        }
    }

    /// Version whose numerics hardware-consistent scoring follows by default
    pub fn target(&self) -> Option<DeviceVersion> {
        match &self.strategy {
            ExecutionStrategy::SoftwareOnly => None,
            ExecutionStrategy::Hybrid { capabilities, .. } => Some(capabilities.version()),
            ExecutionStrategy::Export { target } => Some(*target),
        }
    }

    /// Sub-model partition for `version`, computed once per version
    pub fn submodels(&self, version: DeviceVersion) -> Arc<[SubModel]> {
        match &self.strategy {
            ExecutionStrategy::Hybrid { capabilities, .. } if capabilities.version() == version => {
                self.partition_for(capabilities)
            }
            _ => self.partition_for(&HardwareCapabilities::for_version(version)),
        }
    }

    /// Partition under `capabilities`, cached by their version
    fn partition_for(&self, capabilities: &HardwareCapabilities) -> Arc<[SubModel]> {
        let mut cache = self.submodels.lock();
        Arc::clone(
            cache
                .entry(capabilities.version())
                .or_insert_with(|| partition(self.software.layers(), capabilities).into()),
        )
    }

    /// True when every layer runs on `version`
    pub fn is_fully_hardware_compatible(&self, version: DeviceVersion) -> bool {
        is_fully_hardware_compatible(&self.submodels(version))
    }

    /// Numerics of a CPU-only scoring
    pub fn consistency_mode(&self, config: &RequestConfiguration) -> ConsistencyMode {
        if let Some(version) = config.hardware_consistency() {
            if self.is_fully_hardware_compatible(version) {
                return ConsistencyMode::Hardware(version);
            }
            tracing::warn!(
                "Model {} is not fully compatible with {version}, using generic consistency",
                self.id
            );
            return ConsistencyMode::Generic;
        }
        match self.target() {
            Some(version) if self.is_fully_hardware_compatible(version) => {
                ConsistencyMode::Hardware(version)
            }
            _ => ConsistencyMode::Generic,
        }
    }

    /// Drop the cached hardware request of a configuration
    pub fn invalidate_config(&self, config_id: u32) {
        if self.requests.lock().remove(&config_id).is_some() {
            tracing::debug!("Model {}: dropped hardware request of config {config_id}", self.id);
        }
    }

    /// Configurations with a cached hardware request
    pub fn cached_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Score every layer
    ///
    /// # Errors
    ///
    /// See [`CompiledModel::score_range`].
    pub fn score(&self, config: &RequestConfiguration) -> Result<ScoreReport> {
        self.score_range(0..self.layer_count(), config)
    }

    /// Score layers `range`
    ///
    /// # Errors
    ///
    /// [`GnaError::AccelerationModeNotSupported`] for hardware acceleration
    /// without a hardware model, [`GnaError::LayerCountExceeded`] for a range
    /// past the model, driver and hardware status errors, and kernel errors
    /// wrapped in [`GnaError::Layer`].
    pub fn score_range(&self, range: Range<u32>, config: &RequestConfiguration) -> Result<ScoreReport> {
        if range.end > self.layer_count() || range.start >= range.end {
            return Err(GnaError::LayerCountExceeded {
                count: range.end,
                limit: self.layer_count(),
            });
        }
        let mut profiler = RequestProfiler::new(config.profiler().clone());
        profiler.mark(InstrumentationPoint::LibPreprocessing);

        let acceleration = config.acceleration();
        let hybrid = match &self.strategy {
            ExecutionStrategy::Hybrid {
                driver,
                capabilities,
                hardware: Some(hardware),
            } if acceleration != AccelerationMode::Software => Some((driver, capabilities, hardware)),
            _ => None,
        };
        let saturation_count = match hybrid {
            Some((driver, capabilities, hardware)) => self.score_hybrid(
                driver.as_ref(),
                capabilities.version(),
                hardware,
                range,
                config,
                &mut profiler,
            )?,
            None if acceleration == AccelerationMode::Hardware => {
                return Err(GnaError::mode_not_supported(format!(
                    "model {} has no hardware layers on this device",
                    self.id
                )));
            }
            None => {
                let mode = self.consistency_mode(config);
                tracing::debug!("Model {}: scoring {range:?} in software ({mode:?})", self.id);
                self.software.score(range, config, self.view(config), mode)?
            }
        };

        profiler.mark(InstrumentationPoint::LibProcessing);
        profiler.mark(InstrumentationPoint::LibCompletion);
        Ok(ScoreReport {
            saturation_count,
            profile: profiler.report(),
        })
    }

    fn view<'a>(&'a self, config: &'a RequestConfiguration) -> MemoryView<'a> {
        MemoryView::new(&self.memory, Some(config.memory()))
    }

    fn score_hybrid(
        &self,
        driver: &dyn DriverInterface,
        version: DeviceVersion,
        hardware: &HardwareModel,
        range: Range<u32>,
        config: &RequestConfiguration,
        profiler: &mut RequestProfiler,
    ) -> Result<u32> {
        let consistency = ConsistencyMode::Hardware(version);
        let mut saturations = 0;
        for submodel in self.submodels(version).iter() {
            let Some(run) = submodel.intersect(&range) else {
                continue;
            };
            let Some(mode) = OperationMode::for_submodel(submodel.kind) else {
                saturations += self.software.score(run, config, self.view(config), consistency)?;
                continue;
            };

            let request = self.hardware_request(hardware, config)?;
            let mut request = request.lock();
            request.update(hardware, run.start, run.end - run.start, mode)?;
            profiler.mark(InstrumentationPoint::LibSubmission);
            tracing::debug!(
                "Model {}: submitting layers {run:?} ({:?}) for config {}",
                self.id,
                submodel.kind,
                config.id()
            );
            match driver.submit(&request, profiler) {
                Ok(result) => {
                    profiler.add_driver(result.driver_perf);
                    profiler.add_hardware(result.hardware_perf);
                    let flags = status::decode(result.status).map_err(|fault| GnaError::Hardware { fault })?;
                    if flags.saturated {
                        saturations += 1;
                    }
                }
                Err(DriverError::QueueContention) if config.software_fallback() => {
                    tracing::warn!(
                        "Model {}: queue contention on layers {run:?}, falling back to software",
                        self.id
                    );
                    saturations += self.software.score(run, config, self.view(config), consistency)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(saturations)
    }

    /// Cached hardware request of `config`, rebuilt when its bindings changed
    fn hardware_request(
        &self,
        hardware: &HardwareModel,
        config: &RequestConfiguration,
    ) -> Result<Arc<Mutex<HardwareRequest>>> {
        // The cache lock never covers a request lock; a request may be held
        // across a submission.
        let cached = self.requests.lock().get(&config.id()).cloned();
        if let Some(existing) = cached {
            let mut request = existing.lock();
            if request.config_version() != config.version() {
                request.invalidate(hardware, config)?;
            }
            drop(request);
            return Ok(existing);
        }
        let request = Arc::new(Mutex::new(HardwareRequest::new(hardware, config)?));
        Ok(Arc::clone(
            self.requests.lock().entry(config.id()).or_insert(request),
        ))
    }
}
