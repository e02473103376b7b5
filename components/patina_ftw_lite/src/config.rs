//! FTW Lite Configuration
//!
//! Describes where the work space and the spare area live. Firmware volume discovery happens elsewhere; the
//! platform hands the already resolved geometry to [`crate::FtwLite::new`].
//!
//! ## Configuration Example
//!
//! ```rust
//! use patina_ftw_lite::{config::FtwLiteConfig, fvb::DeviceId};
//!
//! // One 64 KiB NV storage device: the work space occupies the first 4 KiB of block 2, block 3 is the spare.
//! let config = FtwLiteConfig {
//!     work_space_device: DeviceId(0),
//!     work_space_lba: 2,
//!     work_space_base: 0,
//!     work_space_size: 0x1000,
//!     spare_device: DeviceId(0),
//!     spare_lba: 3,
//!     spare_area_length: 0x4000,
//!     block_size: 0x4000,
//!     number_of_spare_blocks: 1,
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.working_block_lba(), 2);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    error::{FtwError, Result},
    fvb::DeviceId,
    layout::{FtwLiteRecord, WorkingBlockHeader},
};

/// Pre-resolved flash geometry for the FTW Lite service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtwLiteConfig {
    /// Device holding the work space.
    pub work_space_device: DeviceId,
    /// Block containing the work space.
    pub work_space_lba: u64,
    /// Byte offset of the work space inside its block.
    pub work_space_base: usize,
    /// Size of the work space in bytes.
    pub work_space_size: usize,
    /// Device holding the spare area.
    pub spare_device: DeviceId,
    /// First block of the spare area.
    pub spare_lba: u64,
    /// Size of the spare area in bytes.
    pub spare_area_length: usize,
    /// Erase block size shared by the working block and the spare area.
    pub block_size: usize,
    /// Number of blocks in the spare area, and in the working block range.
    pub number_of_spare_blocks: usize,
}

impl FtwLiteConfig {
    /// Checks that the geometry is usable.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.number_of_spare_blocks == 0 {
            log::error!(target: "ftw_lite", "Block size and spare block count must be non-zero: {:?}", self);
            return Err(FtwError::InvalidParameter);
        }

        if self.block_size.checked_mul(self.number_of_spare_blocks) != Some(self.spare_area_length) {
            log::error!(
                target: "ftw_lite",
                "Spare area length {:#x} is not {} blocks of {:#x} bytes",
                self.spare_area_length,
                self.number_of_spare_blocks,
                self.block_size
            );
            return Err(FtwError::InvalidParameter);
        }

        if self.work_space_size < WorkingBlockHeader::SIZE + FtwLiteRecord::SIZE
            || self.work_space_base.checked_add(self.work_space_size).is_none_or(|end| end > self.block_size)
        {
            log::error!(
                target: "ftw_lite",
                "Work space {:#x}+{:#x} does not fit a header and a record inside one block",
                self.work_space_base,
                self.work_space_size
            );
            return Err(FtwError::InvalidParameter);
        }

        let spare_blocks = self.number_of_spare_blocks as u64;
        if self.work_space_lba.checked_add(1).is_none_or(|end| end < spare_blocks)
            || self.spare_lba.checked_add(spare_blocks).is_none()
        {
            log::error!(
                target: "ftw_lite",
                "Block ranges of {} blocks at work space LBA {:#x} and spare LBA {:#x} do not fit the LBA space",
                self.number_of_spare_blocks,
                self.work_space_lba,
                self.spare_lba
            );
            return Err(FtwError::InvalidParameter);
        }

        if self.work_space_device == self.spare_device
            && ranges_overlap(self.working_block_lba(), self.spare_lba, spare_blocks)
        {
            log::error!(target: "ftw_lite", "Spare area overlaps the working block range");
            return Err(FtwError::InvalidParameter);
        }

        Ok(())
    }

    /// First block of the working block range: the `number_of_spare_blocks` blocks ending with the work space block.
    pub fn working_block_lba(&self) -> u64 {
        self.work_space_lba.saturating_sub((self.number_of_spare_blocks as u64).saturating_sub(1))
    }

    /// Byte offset of the work space inside an image of the working block range.
    pub fn work_space_offset_in_range(&self) -> usize {
        (self.work_space_lba - self.working_block_lba()) as usize * self.block_size + self.work_space_base
    }

    /// Number of record slots following the header.
    pub fn record_capacity(&self) -> usize {
        (self.work_space_size - WorkingBlockHeader::SIZE) / FtwLiteRecord::SIZE
    }
}

/// Whether two ranges of `count` blocks starting at `a` and `b` intersect.
pub(crate) fn ranges_overlap(a: u64, b: u64, count: u64) -> bool {
    a.abs_diff(b) < count
}
