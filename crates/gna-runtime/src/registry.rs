// SPDX-License-Identifier: AGPL-3.0-only

//! Device registry
//!
//! Opening an already open device returns the same [`Device`] and bumps a
//! reference count; the device is dropped when the last holder closes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::device::Device;
use crate::driver::DriverInterface;
use crate::error::{GnaError, Result};

/// Open devices of one process
#[derive(Debug)]
pub struct DeviceRegistry {
    config: RuntimeConfig,
    driver: Option<Arc<dyn DriverInterface>>,
    devices: Mutex<HashMap<u32, (Arc<Device>, usize)>>,
}

impl DeviceRegistry {
    /// Registry opening devices through `driver`; software-only devices
    /// when `None`
    pub fn new(config: RuntimeConfig, driver: Option<Arc<dyn DriverInterface>>) -> Self {
        Self {
            config,
            driver,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Open device `index`, or take another reference to it
    ///
    /// # Errors
    ///
    /// [`GnaError::DeviceNotAvailable`] when the index does not exist, and
    /// the errors of [`Device::open`].
    pub fn open(&self, index: u32) -> Result<Arc<Device>> {
        let mut devices = self.devices.lock();
        if let Some((device, count)) = devices.get_mut(&index) {
            *count += 1;
            return Ok(Arc::clone(device));
        }
        if self.driver.is_none() && index != 0 {
            return Err(GnaError::DeviceNotAvailable {
                index,
                reason: "only software device 0 exists without a driver".into(),
            });
        }
        let device = Arc::new(Device::open(index, self.driver.clone(), self.config.clone())?);
        devices.insert(index, (Arc::clone(&device), 1));
        info!("Opened device {index}");
        Ok(device)
    }

    /// Drop one reference to device `index`
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] when the device is not open.
    pub fn close(&self, index: u32) -> Result<()> {
        let mut devices = self.devices.lock();
        let (_, count) = devices
            .get_mut(&index)
            .ok_or_else(|| GnaError::identifier("device", index))?;
        *count -= 1;
        if *count == 0 {
            devices.remove(&index);
            info!("Closed device {index}");
        }
        Ok(())
    }

    /// Open device `index` without taking a reference
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] when the device is not open.
    pub fn get(&self, index: u32) -> Result<Arc<Device>> {
        self.devices
            .lock()
            .get(&index)
            .map(|(device, _)| Arc::clone(device))
            .ok_or_else(|| GnaError::identifier("device", index))
    }

    /// References held on device `index`; zero when closed
    pub fn open_count(&self, index: u32) -> usize {
        self.devices.lock().get(&index).map_or(0, |(_, count)| *count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::EmulatedDriver;
    use gna_chip::DeviceVersion;

    #[test]
    fn test_reference_counting() {
        let registry = DeviceRegistry::new(RuntimeConfig::default(), None);
        let first = registry.open(0).unwrap();
        let second = registry.open(0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.open_count(0), 2);
        registry.close(0).unwrap();
        assert!(registry.get(0).is_ok());
        registry.close(0).unwrap();
        assert_eq!(registry.open_count(0), 0);
        assert!(matches!(
            registry.close(0),
            Err(GnaError::IdentifierInvalid { what: "device", id: 0 })
        ));
    }

    #[test]
    fn test_unknown_device() {
        let registry = DeviceRegistry::new(RuntimeConfig::default(), None);
        assert!(matches!(
            registry.open(3),
            Err(GnaError::DeviceNotAvailable { index: 3, .. })
        ));
        let driver = Arc::new(EmulatedDriver::new(DeviceVersion::Gna3_5));
        let registry = DeviceRegistry::new(RuntimeConfig::default(), Some(driver as Arc<dyn DriverInterface>));
        assert_eq!(registry.open(0).unwrap().version(), Some(DeviceVersion::Gna3_5));
        assert!(matches!(
            registry.open(1),
            Err(GnaError::DeviceNotAvailable { index: 1, .. })
        ));
    }
}
