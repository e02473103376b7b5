//! FTW Lite Service
//!
//! The interface other components use to request fault tolerant writes, and its implementation over a
//! [`FtwLite`] engine.
//!
//! ## Logging
//!
//! Detailed logging is available for this component using the `ftw_lite` log target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt::{self, Debug};

use r_efi::efi;
use spin::Mutex;

use crate::{
    config::FtwLiteConfig,
    engine::FtwLite,
    error::{FtwError, Result},
    fvb::{BlockDeviceRegistry, DeviceId},
};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Fault Tolerant Write Lite Trait
///
/// Provides power-loss safe updates of up to one spare area's worth of bytes.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait FaultTolerantWriteLite {
    /// Writes `length` bytes of `buffer` at `offset` within block `lba` of `device`.
    ///
    /// # Parameters
    ///
    /// - `device`: The registered block device to write.
    /// - `lba`: The first block of the target range.
    /// - `offset`: Byte offset of the write inside the target range.
    /// - `length`: Number of bytes to write. Narrowed to what fits when the write exceeds one spare area.
    /// - `buffer`: The bytes to write.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The write is durable; an interruption after this point can no longer undo it.
    /// - `Err(FtwError::BadBufferSize)`: The write does not fit one spare area; `length` holds the size that fits.
    /// - `Err(FtwError::AccessDenied)`: Another write is in progress.
    /// - `Err(_)`: The write failed; after the next recovery the target holds either the old or the new bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use patina_ftw_lite::{fvb::DeviceId, service::FaultTolerantWriteLite};
    ///
    /// fn update_variable(ftw: &dyn FaultTolerantWriteLite, data: &[u8]) -> patina_ftw_lite::error::Result<()> {
    ///     let mut length = data.len();
    ///     ftw.write(DeviceId(0), 5, 0x40, &mut length, data)
    /// }
    /// ```
    fn write(&self, device: DeviceId, lba: u64, offset: usize, length: &mut usize, buffer: &[u8]) -> Result<()>;
}

/// The FTW Lite service backed by a [`FtwLite`] engine.
pub struct FtwLiteService<R: BlockDeviceRegistry> {
    engine: Mutex<FtwLite<R>>,
}

impl<R: BlockDeviceRegistry> FtwLiteService<R> {
    /// Wraps an already recovered engine.
    pub fn new(engine: FtwLite<R>) -> Self {
        Self { engine: Mutex::new(engine) }
    }

    /// Recovers the journal described by `config` and returns the ready service.
    pub fn initialize(config: FtwLiteConfig, registry: R) -> Result<Self> {
        FtwLite::new(config, registry).map(Self::new)
    }

    /// [`FaultTolerantWriteLite::write`] reporting an EFI status, for callers at the firmware ABI boundary.
    pub fn write_status(
        &self,
        device: DeviceId,
        lba: u64,
        offset: usize,
        length: &mut usize,
        buffer: &[u8],
    ) -> efi::Status {
        match self.write(device, lba, offset, length, buffer) {
            Ok(()) => efi::Status::SUCCESS,
            Err(err) => err.into(),
        }
    }

    /// Consumes the service and returns the engine.
    pub fn into_inner(self) -> FtwLite<R> {
        self.engine.into_inner()
    }
}

impl<R: BlockDeviceRegistry> FaultTolerantWriteLite for FtwLiteService<R> {
    fn write(&self, device: DeviceId, lba: u64, offset: usize, length: &mut usize, buffer: &[u8]) -> Result<()> {
        let mut engine = self.engine.try_lock().ok_or_else(|| {
            log::warn!(target: "ftw_lite", "Write to {} LBA {:#x} rejected: a write is in progress", device, lba);
            FtwError::AccessDenied
        })?;
        engine.write(device, lba, offset, length, buffer)
    }
}

impl<R: BlockDeviceRegistry> Debug for FtwLiteService<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtwLiteService").field("busy", &self.engine.is_locked()).finish()
    }
}
