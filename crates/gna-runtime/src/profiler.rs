// SPDX-License-Identifier: AGPL-3.0-only

//! Request profiling
//!
//! Library points are timestamps taken while a request moves through the
//! runtime, measured from the moment it starts running. Driver and hardware
//! points are counters reported back by the driver with each submission and
//! summed over all hardware sub-models of the request.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Measurement point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrumentationPoint {
    /// Request started running
    LibPreprocessing,
    /// First hardware submission issued
    LibSubmission,
    /// All sub-models scored
    LibProcessing,
    /// Result ready
    LibCompletion,
    /// Driver preparation
    DrvPreprocessing,
    /// Driver processing
    DrvProcessing,
    /// Device reported completion
    DrvDeviceRequestCompleted,
    /// Driver finished the request
    DrvCompletion,
    /// Device cycles spent scoring
    HwTotalCycles,
    /// Device cycles stalled on memory
    HwStallCycles,
}

impl InstrumentationPoint {
    /// True for points measured by the library itself
    pub fn is_library(self) -> bool {
        matches!(
            self,
            Self::LibPreprocessing | Self::LibSubmission | Self::LibProcessing | Self::LibCompletion
        )
    }
}

/// Unit of library and driver time points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentationUnit {
    /// Microseconds
    #[default]
    Microseconds,
    /// Milliseconds
    Milliseconds,
    /// Raw counter ticks
    Cycles,
}

/// Which points a request records
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfilerConfiguration {
    points: Vec<InstrumentationPoint>,
    unit: InstrumentationUnit,
}

impl ProfilerConfiguration {
    /// Record `points` in `unit`
    pub fn new(points: impl IntoIterator<Item = InstrumentationPoint>, unit: InstrumentationUnit) -> Self {
        let mut points: Vec<_> = points.into_iter().collect();
        points.sort();
        points.dedup();
        Self { points, unit }
    }

    /// Recorded points in order
    pub fn points(&self) -> &[InstrumentationPoint] {
        &self.points
    }

    /// Time unit
    pub fn unit(&self) -> InstrumentationUnit {
        self.unit
    }

    /// True when at least one point is recorded
    pub fn is_enabled(&self) -> bool {
        !self.points.is_empty()
    }
}

/// Driver counters of one submission, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverPerf {
    /// Preparation
    pub preprocessing: u64,
    /// Processing
    pub processing: u64,
    /// Until the device signalled completion
    pub device_completed: u64,
    /// Until the driver returned
    pub completion: u64,
}

/// Device counters of one submission, in cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwarePerf {
    /// Total scoring cycles
    pub total: u64,
    /// Stall cycles
    pub stall: u64,
}

/// Recorded values by point
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileReport {
    values: BTreeMap<InstrumentationPoint, u64>,
}

impl ProfileReport {
    /// Value of a point, if it was recorded
    pub fn get(&self, point: InstrumentationPoint) -> Option<u64> {
        self.values.get(&point).copied()
    }

    /// All recorded points
    pub fn iter(&self) -> impl Iterator<Item = (InstrumentationPoint, u64)> + '_ {
        self.values.iter().map(|(&p, &v)| (p, v))
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Profiler of one running request
#[derive(Debug)]
pub struct RequestProfiler {
    config: ProfilerConfiguration,
    start: Instant,
    marks: BTreeMap<InstrumentationPoint, Duration>,
    driver: DriverPerf,
    hardware: HardwarePerf,
    submissions: u32,
}

impl RequestProfiler {
    /// Start profiling now
    pub fn new(config: ProfilerConfiguration) -> Self {
        Self {
            config,
            start: Instant::now(),
            marks: BTreeMap::new(),
            driver: DriverPerf::default(),
            hardware: HardwarePerf::default(),
            submissions: 0,
        }
    }

    /// Record a library point; the first mark of a point wins
    pub fn mark(&mut self, point: InstrumentationPoint) {
        if point.is_library() {
            self.marks.entry(point).or_insert_with(|| self.start.elapsed());
        }
    }

    /// Add driver counters of a submission
    pub fn add_driver(&mut self, perf: DriverPerf) {
        self.driver.preprocessing += perf.preprocessing;
        self.driver.processing += perf.processing;
        self.driver.device_completed += perf.device_completed;
        self.driver.completion += perf.completion;
        self.submissions += 1;
    }

    /// Add device counters of a submission
    pub fn add_hardware(&mut self, perf: HardwarePerf) {
        self.hardware.total += perf.total;
        self.hardware.stall += perf.stall;
    }

    /// Hardware submissions recorded
    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    /// Values of the configured points
    pub fn report(&self) -> ProfileReport {
        let unit = self.config.unit;
        let time = |d: Duration| match unit {
            InstrumentationUnit::Milliseconds => d.as_millis() as u64,
            InstrumentationUnit::Microseconds | InstrumentationUnit::Cycles => d.as_micros() as u64,
        };
        let driver = |us: u64| match unit {
            InstrumentationUnit::Milliseconds => us / 1000,
            _ => us,
        };
        let values = self
            .config
            .points
            .iter()
            .filter_map(|&point| {
                use InstrumentationPoint as P;
                let value = match point {
                    P::LibPreprocessing | P::LibSubmission | P::LibProcessing | P::LibCompletion => {
                        time(*self.marks.get(&point)?)
                    }
                    P::DrvPreprocessing => driver(self.driver.preprocessing),
                    P::DrvProcessing => driver(self.driver.processing),
                    P::DrvDeviceRequestCompleted => driver(self.driver.device_completed),
                    P::DrvCompletion => driver(self.driver.completion),
                    P::HwTotalCycles => self.hardware.total,
                    P::HwStallCycles => self.hardware.stall,
                };
                Some((point, value))
            })
            .collect();
        ProfileReport { values }
    }
}
