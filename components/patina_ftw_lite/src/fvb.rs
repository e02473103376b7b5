//! Firmware Volume Block (FVB) Access
//!
//! Defines the block device interface consumed by the FTW Lite service and the registry used to resolve the
//! logical device identifiers persisted in journal records back into block devices after a reset.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use crate::error::Result;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Stable logical identifier of a block device.
///
/// The identifier is stored in every journal record so that an interrupted write can be finished on the next boot
/// against the same device. The platform assigns identifiers when it registers devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fvb#{}", self.0)
    }
}

/// Block-erase storage access.
///
/// Offsets are relative to the start of the addressed block and an access must not cross the end of that block.
/// A write may only move bits from the erased value (1) to the programmed value (0); restoring a bit requires an
/// erase of the whole block.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait FirmwareVolumeBlock {
    /// Returns the memory mapped base address of the device.
    fn get_physical_address(&self) -> Result<u64>;

    /// Returns the erase block size in bytes.
    fn block_size(&self) -> usize;

    /// Returns the number of erase blocks on the device.
    fn num_blocks(&self) -> u64;

    /// Reads `buffer.len()` bytes from `offset` within block `lba`.
    ///
    /// Returns the number of bytes read.
    fn read(&self, lba: u64, offset: usize, buffer: &mut [u8]) -> Result<usize>;

    /// Programs `buffer` at `offset` within block `lba`.
    ///
    /// Returns the number of bytes written.
    fn write(&self, lba: u64, offset: usize, buffer: &[u8]) -> Result<usize>;

    /// Erases `count` blocks starting at `lba`.
    fn erase_blocks(&self, lba: u64, count: u64) -> Result<()>;
}

/// Resolves a [`DeviceId`] to a block device.
pub trait BlockDeviceRegistry {
    /// Returns the device registered under `id`, if any.
    fn locate(&self, id: DeviceId) -> Option<&dyn FirmwareVolumeBlock>;
}

/// A simple registry of block devices keyed by [`DeviceId`].
#[derive(Default, Clone)]
pub struct FvbRegistry {
    devices: Vec<(DeviceId, Arc<dyn FirmwareVolumeBlock + Send + Sync>)>,
}

impl FvbRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self { devices: Vec::new() }
    }

    /// Registers `device` under `id`, replacing any device previously registered under the same id.
    pub fn register(&mut self, id: DeviceId, device: Arc<dyn FirmwareVolumeBlock + Send + Sync>) {
        match self.devices.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = device,
            None => self.devices.push((id, device)),
        }
    }

    /// Builder form of [`FvbRegistry::register`].
    pub fn with_device(mut self, id: DeviceId, device: Arc<dyn FirmwareVolumeBlock + Send + Sync>) -> Self {
        self.register(id, device);
        self
    }

    /// Returns the number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl BlockDeviceRegistry for FvbRegistry {
    fn locate(&self, id: DeviceId) -> Option<&dyn FirmwareVolumeBlock> {
        self.devices
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, device)| device.as_ref() as &dyn FirmwareVolumeBlock)
    }
}

impl fmt::Debug for FvbRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.devices.iter().map(|(id, _)| id)).finish()
    }
}
