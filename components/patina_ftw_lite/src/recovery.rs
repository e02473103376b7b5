//! FTW Lite Recovery
//!
//! Boot time pass that brings the journal back to a consistent state before the first write is accepted:
//!
//! - An invalid working block is rebuilt from a valid work space mirror in the spare area, or initialized from
//!   scratch when neither copy is valid.
//! - An allocated record was never staged and is aborted; the target is untouched.
//! - A staged record is restarted; the spare area holds the full image of its target.
//! - Anything but erased bytes after the last record forces a reclaim.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    config::FtwLiteConfig,
    engine::{locate, FtwLite},
    error::{FtwError, Result},
    fvb::{BlockDeviceRegistry, DeviceId},
    layout::{RecordFlags, RecordState},
    work_space::WorkSpace,
};

impl<R: BlockDeviceRegistry> FtwLite<R> {
    /// Creates the engine over `registry` and recovers any interrupted write.
    ///
    /// ## Errors
    ///
    /// - [`FtwError::InvalidParameter`]: the geometry is unusable or does not match the devices.
    /// - [`FtwError::NotFound`]: the work space or spare device is not registered.
    /// - [`FtwError::OutOfResources`]: the work space mirror could not be allocated.
    /// - [`FtwError::Aborted`]: recovery could not complete; the journal cannot be trusted.
    pub fn new(config: FtwLiteConfig, registry: R) -> Result<Self> {
        config.validate()?;
        check_device(&registry, &config, config.work_space_device, config.working_block_lba())?;
        check_device(&registry, &config, config.spare_device, config.spare_lba)?;

        let work_space = WorkSpace::new(config.work_space_lba, config.work_space_base, config.work_space_size)?;
        let mut ftw = Self { config, registry, work_space };
        ftw.recover().map_err(|err| {
            log::error!(target: "ftw_lite", "Recovery failed: {:?}", err);
            FtwError::Aborted
        })?;

        log::info!(
            target: "ftw_lite",
            "FTW Lite ready: work space {} LBA {:#x}, spare {} LBA {:#x}, {} record slots",
            ftw.config.work_space_device,
            ftw.config.work_space_lba,
            ftw.config.spare_device,
            ftw.config.spare_lba,
            ftw.work_space.capacity()
        );
        Ok(ftw)
    }

    fn recover(&mut self) -> Result<()> {
        self.refresh()?;

        if !self.work_space.is_valid() {
            if self.read_spare_work_space()?.is_valid() {
                log::info!(target: "ftw_lite", "Working block invalid, restoring the work space from the spare area");
                self.flush_spare_to_working()?;
                self.settle_mirrored_record()?;
                self.refresh()?;
            } else {
                log::info!(target: "ftw_lite", "No valid work space found, initializing");
                self.work_space.initialize();
                self.reclaim(false)?;
            }
        }

        match self.work_space.last_record_state()? {
            RecordState::Allocated => {
                log::info!(target: "ftw_lite", "Found an unstaged write, aborting it");
                self.abort()?;
            }
            RecordState::SpareStaged => {
                log::info!(target: "ftw_lite", "Found a staged write, completing it");
                self.restart()?;
            }
            RecordState::Idle | RecordState::Committed => {}
        }

        if self.work_space.is_dirty_after_last_record() {
            log::info!(target: "ftw_lite", "Work space not erased after the last record, reclaiming");
            self.reclaim(true)?;
        }
        Ok(())
    }

    /// Settles the last record of a work space that was just copied back from the spare mirror.
    ///
    /// An allocated record was carried over by an interrupted reclaim and is aborted. A staged record belongs to a
    /// working block write whose image the copy has just applied, so it is marked write complete.
    fn settle_mirrored_record(&mut self) -> Result<()> {
        match self.work_space.last_record_state()? {
            RecordState::Allocated => self.abort(),
            RecordState::SpareStaged => {
                let fvb = locate(&self.registry, self.config.work_space_device)?;
                self.work_space.update_flag(fvb, RecordFlags::WRITE_COMPLETED)?;
                self.erase_spare()?;
                log::info!(target: "ftw_lite", "Completed interrupted working block write");
                Ok(())
            }
            RecordState::Idle | RecordState::Committed => Ok(()),
        }
    }
}

/// Checks that the `number_of_spare_blocks` blocks at `lba` exist on `device` with the configured block size.
fn check_device<R: BlockDeviceRegistry>(
    registry: &R,
    config: &FtwLiteConfig,
    device: DeviceId,
    lba: u64,
) -> Result<()> {
    let fvb = locate(registry, device)?;
    if fvb.block_size() != config.block_size {
        log::error!(
            target: "ftw_lite",
            "{} has {:#x} byte blocks, expected {:#x}",
            device,
            fvb.block_size(),
            config.block_size
        );
        return Err(FtwError::InvalidParameter);
    }
    if lba.checked_add(config.number_of_spare_blocks as u64).is_none_or(|end| end > fvb.num_blocks()) {
        log::error!(target: "ftw_lite", "LBA {:#x} range runs past the end of {}", lba, device);
        return Err(FtwError::InvalidParameter);
    }
    Ok(())
}
