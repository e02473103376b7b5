//! FTW Lite Write Transaction Engine
//!
//! Drives a single write through the journal:
//!
//! 1. A record naming the target is allocated in the work space.
//! 2. The post-write image of the target range is staged in the spare area and the record is marked spare complete.
//! 3. The spare area is flushed to the target and the record is marked write complete.
//!
//! The spare area content found before the write is restored afterwards. When the target range is the working block
//! range itself, the flush rewrites the work space along with the payload.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;

use zerocopy::IntoBytes;

use crate::{
    config::{ranges_overlap, FtwLiteConfig},
    error::{FtwError, Result},
    fvb::{BlockDeviceRegistry, DeviceId, FirmwareVolumeBlock},
    layout::{FtwLiteRecord, RecordFlags, RecordState, WorkingBlockHeader, WorkingBlockState, FTW_ERASED_BYTE},
    work_space::{alloc_buffer, assert_state_bits, program_state, WorkSpace},
};

/// Where the blocks of a write land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// The working block range holding the work space.
    WorkingBlock,
    /// Any other range of blocks.
    Device,
}

/// The fault tolerant write engine.
///
/// Created by [`FtwLite::new`], which also runs the recovery pass.
pub struct FtwLite<R: BlockDeviceRegistry> {
    pub(crate) config: FtwLiteConfig,
    pub(crate) registry: R,
    pub(crate) work_space: WorkSpace,
}

pub(crate) fn locate<R: BlockDeviceRegistry>(registry: &R, id: DeviceId) -> Result<&dyn FirmwareVolumeBlock> {
    registry.locate(id).ok_or_else(|| {
        log::error!(target: "ftw_lite", "Block device {} is not registered", id);
        FtwError::NotFound
    })
}

fn read_blocks(fvb: &dyn FirmwareVolumeBlock, lba: u64, buffer: &mut [u8], block_size: usize) -> Result<()> {
    for (index, block) in buffer.chunks_mut(block_size).enumerate() {
        let lba = lba + index as u64;
        let len = block.len();
        match fvb.read(lba, 0, block) {
            Ok(read) if read == len => log::trace!(target: "ftw_lite", "Read LBA {:#x}", lba),
            result => {
                log::error!(target: "ftw_lite", "Read of LBA {:#x} failed: {:?}", lba, result);
                return Err(FtwError::Aborted);
            }
        }
    }
    Ok(())
}

fn write_blocks(fvb: &dyn FirmwareVolumeBlock, lba: u64, buffer: &[u8], block_size: usize) -> Result<()> {
    for (index, block) in buffer.chunks(block_size).enumerate() {
        let lba = lba + index as u64;
        match fvb.write(lba, 0, block) {
            Ok(written) if written == block.len() => log::trace!(target: "ftw_lite", "Wrote LBA {:#x}", lba),
            result => {
                log::error!(target: "ftw_lite", "Write of LBA {:#x} failed: {:?}", lba, result);
                return Err(FtwError::Aborted);
            }
        }
    }
    Ok(())
}

fn erase_blocks(fvb: &dyn FirmwareVolumeBlock, lba: u64, count: u64) -> Result<()> {
    fvb.erase_blocks(lba, count).map_err(|err| {
        log::error!(target: "ftw_lite", "Erase of {} blocks at LBA {:#x} failed: {:?}", count, lba, err);
        FtwError::Aborted
    })?;
    log::trace!(target: "ftw_lite", "Erased {} blocks at LBA {:#x}", count, lba);
    Ok(())
}

impl<R: BlockDeviceRegistry> FtwLite<R> {
    /// The geometry this engine was created with.
    pub fn config(&self) -> &FtwLiteConfig {
        &self.config
    }

    /// The registry resolving record device identifiers.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// The in-memory work space mirror.
    pub fn work_space(&self) -> &WorkSpace {
        &self.work_space
    }

    /// Writes `length` bytes of `buffer` at `offset` within block `lba` of `device`, fault tolerantly.
    ///
    /// `offset + length` must fit in one spare area. When it does not, `length` is narrowed to the largest size that
    /// would fit and [`FtwError::BadBufferSize`] is returned; the caller retries with fragments.
    ///
    /// ## Errors
    ///
    /// - [`FtwError::InvalidParameter`]: empty write, short buffer, or a target that overlaps the work space or the
    ///   spare area.
    /// - [`FtwError::AccessDenied`]: another write is still in flight.
    /// - [`FtwError::NotFound`]: `device` is not registered.
    /// - [`FtwError::OutOfResources`]: a temporary buffer could not be allocated.
    /// - [`FtwError::Aborted`]: a block device operation failed.
    pub fn write(
        &mut self,
        device: DeviceId,
        lba: u64,
        offset: usize,
        length: &mut usize,
        buffer: &[u8],
    ) -> Result<()> {
        let spare_len = self.config.spare_area_length;
        if offset.checked_add(*length).is_none_or(|end| end > spare_len) {
            *length = spare_len.saturating_sub(offset);
            log::warn!(target: "ftw_lite", "Write at offset {:#x} narrowed to {:#x} bytes", offset, *length);
            return Err(FtwError::BadBufferSize);
        }
        if *length == 0 || buffer.len() < *length {
            log::error!(target: "ftw_lite", "Write of {:#x} bytes from a {:#x} byte buffer", *length, buffer.len());
            return Err(FtwError::InvalidParameter);
        }

        let target = self.classify(device, lba)?;
        let image_offset = match target {
            Target::WorkingBlock => self.working_block_offset(lba, offset, length)?,
            Target::Device => offset,
        };
        let len = *length;

        self.refresh()?;
        if !self.work_space.is_valid() {
            log::error!(target: "ftw_lite", "Work space header is not valid");
            return Err(FtwError::Aborted);
        }
        self.next_free_record()?;

        let record = FtwLiteRecord::allocate(device, lba, offset, len);
        let fvb = locate(&self.registry, self.config.work_space_device)?;
        self.work_space.allocate(fvb, &record)?;
        log::debug!(
            target: "ftw_lite",
            "Allocated record at offset {:#x}: {} LBA {:#x} offset {:#x} length {:#x}",
            self.work_space.last_record_offset(),
            device,
            lba,
            offset,
            len
        );

        let mut image = self.read_target_image(target, device, lba)?;
        image[image_offset..image_offset + len].copy_from_slice(&buffer[..len]);

        let spare_backup = self.read_range(self.config.spare_device, self.config.spare_lba)?;
        self.write_range(self.config.spare_device, self.config.spare_lba, &image)?;
        let fvb = locate(&self.registry, self.config.work_space_device)?;
        self.work_space.update_flag(fvb, RecordFlags::SPARE_COMPLETED)?;

        self.commit_last_record()?;

        self.write_range(self.config.spare_device, self.config.spare_lba, &spare_backup).inspect_err(|_| {
            log::error!(target: "ftw_lite", "Write committed but the spare area could not be restored");
        })
    }

    /// Re-reads the work space from the working block.
    pub fn refresh(&mut self) -> Result<()> {
        let fvb = locate(&self.registry, self.config.work_space_device)?;
        self.work_space.refresh(fvb)
    }

    /// Makes sure the last record slot can take a new record.
    ///
    /// An in-flight record is never replaced: [`FtwError::AccessDenied`]. A full journal is reclaimed first.
    fn next_free_record(&mut self) -> Result<()> {
        if self.work_space.last_record_state()?.is_in_flight() {
            log::warn!(target: "ftw_lite", "Write in flight at offset {:#x}", self.work_space.last_record_offset());
            return Err(FtwError::AccessDenied);
        }
        if !self.work_space.has_free_slot() {
            self.reclaim(true)?;
        }
        if !self.work_space.has_free_slot() {
            log::error!(target: "ftw_lite", "No free record slot after reclaim");
            return Err(FtwError::Aborted);
        }
        Ok(())
    }

    /// Decides whether `lba` on `device` is the working block range or an ordinary target.
    fn classify(&self, device: DeviceId, lba: u64) -> Result<Target> {
        let fvb = locate(&self.registry, device)?;
        let count = self.config.number_of_spare_blocks as u64;

        if device == self.config.work_space_device {
            let working_lba = self.config.working_block_lba();
            if (working_lba..=self.config.work_space_lba).contains(&lba) {
                return Ok(Target::WorkingBlock);
            }
            if ranges_overlap(lba, working_lba, count) {
                log::error!(target: "ftw_lite", "Target LBA {:#x} straddles the working block range", lba);
                return Err(FtwError::InvalidParameter);
            }
        }
        if device == self.config.spare_device && ranges_overlap(lba, self.config.spare_lba, count) {
            log::error!(target: "ftw_lite", "Target LBA {:#x} overlaps the spare area", lba);
            return Err(FtwError::InvalidParameter);
        }
        if lba.checked_add(count).is_none_or(|end| end > fvb.num_blocks()) {
            log::error!(target: "ftw_lite", "Target LBA {:#x} runs past the end of {}", lba, device);
            return Err(FtwError::InvalidParameter);
        }
        Ok(Target::Device)
    }

    /// Translates a write inside the working block range to an offset in the image of that range.
    fn working_block_offset(&self, lba: u64, offset: usize, length: &mut usize) -> Result<usize> {
        let spare_len = self.config.spare_area_length;
        let image_offset = (lba - self.config.working_block_lba()) as usize * self.config.block_size + offset;
        if image_offset + *length > spare_len {
            *length = spare_len.saturating_sub(image_offset);
            log::warn!(target: "ftw_lite", "Working block write narrowed to {:#x} bytes", *length);
            return Err(FtwError::BadBufferSize);
        }

        let work_space_start = self.config.work_space_offset_in_range();
        let work_space_end = work_space_start + self.config.work_space_size;
        if image_offset < work_space_end && work_space_start < image_offset + *length {
            log::error!(target: "ftw_lite", "Write at LBA {:#x} offset {:#x} overlaps the work space", lba, offset);
            return Err(FtwError::InvalidParameter);
        }
        Ok(image_offset)
    }

    /// Block in the spare area holding the mirrored work space.
    fn spare_work_space_lba(&self) -> u64 {
        self.config.spare_lba + (self.config.work_space_lba - self.config.working_block_lba())
    }

    /// Reads `number_of_spare_blocks` blocks of `device` starting at `lba`.
    fn read_range(&self, device: DeviceId, lba: u64) -> Result<Vec<u8>> {
        let fvb = locate(&self.registry, device)?;
        let mut image = alloc_buffer(self.config.spare_area_length, FTW_ERASED_BYTE)?;
        read_blocks(fvb, lba, &mut image, self.config.block_size)?;
        Ok(image)
    }

    /// Erases `number_of_spare_blocks` blocks of `device` at `lba` and programs `image` there.
    fn write_range(&self, device: DeviceId, lba: u64, image: &[u8]) -> Result<()> {
        let fvb = locate(&self.registry, device)?;
        erase_blocks(fvb, lba, self.config.number_of_spare_blocks as u64)?;
        write_blocks(fvb, lba, image, self.config.block_size)
    }

    fn read_target_image(&self, target: Target, device: DeviceId, lba: u64) -> Result<Vec<u8>> {
        match target {
            Target::WorkingBlock => self.read_range(self.config.work_space_device, self.config.working_block_lba()),
            Target::Device => self.read_range(device, lba),
        }
    }

    pub(crate) fn read_spare_work_space(&self) -> Result<WorkSpace> {
        let fvb = locate(&self.registry, self.config.spare_device)?;
        let mut mirror =
            WorkSpace::new(self.spare_work_space_lba(), self.config.work_space_base, self.config.work_space_size)?;
        mirror.refresh(fvb)?;
        Ok(mirror)
    }

    pub(crate) fn erase_spare(&self) -> Result<()> {
        let fvb = locate(&self.registry, self.config.spare_device)?;
        erase_blocks(fvb, self.config.spare_lba, self.config.number_of_spare_blocks as u64)
    }

    /// Copies the spare area to `lba` on `device`.
    fn flush_spare_to_target(&self, device: DeviceId, lba: u64) -> Result<()> {
        let image = self.read_range(self.config.spare_device, self.config.spare_lba)?;
        self.write_range(device, lba, &image)?;
        log::debug!(target: "ftw_lite", "Flushed spare area to {} LBA {:#x}", device, lba);
        Ok(())
    }

    /// Copies the spare area over the working block range.
    ///
    /// The working header is marked invalid before the erase and the copy lands with its valid marker clear, so an
    /// interrupted flush leaves the spare as the only valid work space. The valid marker is programmed last.
    pub(crate) fn flush_spare_to_working(&mut self) -> Result<()> {
        let mut image = self.read_range(self.config.spare_device, self.config.spare_lba)?;
        let work_space_offset = self.config.work_space_offset_in_range();
        let mut header = WorkingBlockHeader::read_from(&image[work_space_offset..]).ok_or(FtwError::Aborted)?;
        header.clear_valid();
        image[work_space_offset..work_space_offset + WorkingBlockHeader::SIZE].copy_from_slice(header.as_bytes());

        let fvb = locate(&self.registry, self.config.work_space_device)?;
        let working_lba = self.config.working_block_lba();
        let state_offset = self.config.work_space_base + WorkingBlockHeader::STATE_OFFSET;

        let work_space_lba = self.config.work_space_lba;

        assert_state_bits(fvb, work_space_lba, state_offset, WorkingBlockState::WORKING_BLOCK_INVALID.bits())?;
        erase_blocks(fvb, working_lba, self.config.number_of_spare_blocks as u64)?;
        write_blocks(fvb, working_lba, &image, self.config.block_size)?;
        assert_state_bits(fvb, work_space_lba, state_offset, WorkingBlockState::WORKING_BLOCK_VALID.bits())?;
        log::debug!(target: "ftw_lite", "Flushed spare area to the working block range");

        self.work_space.refresh(fvb)
    }

    /// Finishes the staged last record: flush the spare area to its target, then mark it write complete.
    fn commit_last_record(&mut self) -> Result<()> {
        let record = self.work_space.last_record().ok_or(FtwError::Aborted)?;
        let target = self.classify(record.device(), record.lba()).map_err(|err| {
            log::error!(target: "ftw_lite", "Record target {} LBA {:#x}: {:?}", record.device(), record.lba(), err);
            FtwError::Aborted
        })?;

        match target {
            Target::WorkingBlock => {
                // The spare copy of the work space becomes the working block; its record must read as staged too.
                let record_offset = self.work_space.last_record_offset();
                let state = self.work_space.as_bytes()[record_offset + FtwLiteRecord::STATE_OFFSET];
                let fvb = locate(&self.registry, self.config.spare_device)?;
                program_state(
                    fvb,
                    self.spare_work_space_lba(),
                    self.config.work_space_base + record_offset + FtwLiteRecord::STATE_OFFSET,
                    state,
                )?;
                self.flush_spare_to_working()?;
            }
            Target::Device => self.flush_spare_to_target(record.device(), record.lba())?,
        }

        let fvb = locate(&self.registry, self.config.work_space_device)?;
        self.work_space.update_flag(fvb, RecordFlags::WRITE_COMPLETED)?;
        log::debug!(target: "ftw_lite", "Committed write to {} LBA {:#x}", record.device(), record.lba());
        Ok(())
    }

    /// Discards an allocated record that was never staged: the record is marked write complete without touching the
    /// target, and the spare area is erased.
    ///
    /// Only a [`RecordState::Allocated`] record can be discarded. A staged record owns the spare area content and
    /// must be completed with [`FtwLite::restart`]: [`FtwError::InvalidParameter`].
    pub fn abort(&mut self) -> Result<()> {
        let state = self.work_space.last_record_state()?;
        if state != RecordState::Allocated {
            log::error!(target: "ftw_lite", "Abort requires an unstaged record, found {:?}", state);
            return Err(FtwError::InvalidParameter);
        }

        let fvb = locate(&self.registry, self.config.work_space_device)?;
        self.work_space.update_flag(fvb, RecordFlags::WRITE_COMPLETED)?;
        self.erase_spare()?;
        log::info!(target: "ftw_lite", "Aborted interrupted write");
        Ok(())
    }

    /// Completes a staged record: the spare area is flushed to the record's target, the record is marked write
    /// complete, and the spare area is erased.
    pub fn restart(&mut self) -> Result<()> {
        if self.work_space.last_record_state()? != RecordState::SpareStaged {
            log::error!(target: "ftw_lite", "Restart requires a staged record");
            return Err(FtwError::InvalidParameter);
        }

        self.commit_last_record()?;
        self.erase_spare()?;
        log::info!(target: "ftw_lite", "Completed interrupted write");
        Ok(())
    }

    /// Compacts the journal through the spare area.
    ///
    /// Every committed record is dropped. With `preserve_last_record`, an allocated record is carried over to the
    /// first slot with its flags unchanged; without it, an allocated record is refused. A staged record is always
    /// refused since the spare area holds its payload. Both refusals are [`FtwError::AccessDenied`]. A work space
    /// that is not valid on flash is rebuilt from scratch.
    pub fn reclaim(&mut self, preserve_last_record: bool) -> Result<()> {
        log::debug!(target: "ftw_lite", "Reclaiming work space (preserve last record: {})", preserve_last_record);

        self.refresh()?;
        let last_record = if self.work_space.is_valid() { self.work_space.last_record() } else { None };
        let preserved = match last_record.map(|record| (record, record.record_state())) {
            Some((_, Ok(RecordState::SpareStaged))) => {
                log::error!(target: "ftw_lite", "Cannot reclaim while the spare area holds a staged write");
                return Err(FtwError::AccessDenied);
            }
            Some((record, Ok(RecordState::Allocated))) if preserve_last_record => Some(record),
            Some((_, Ok(RecordState::Allocated))) => {
                log::error!(target: "ftw_lite", "Cannot reclaim without preserving the allocated record");
                return Err(FtwError::AccessDenied);
            }
            _ => None,
        };

        let mut image = self.read_range(self.config.work_space_device, self.config.working_block_lba())?;
        let start = self.config.work_space_offset_in_range();
        let region = &mut image[start..start + self.config.work_space_size];
        region.fill(FTW_ERASED_BYTE);
        region[..WorkingBlockHeader::SIZE]
            .copy_from_slice(WorkingBlockHeader::new(self.config.work_space_size).as_bytes());
        if let Some(record) = preserved {
            region[WorkingBlockHeader::SIZE..WorkingBlockHeader::SIZE + FtwLiteRecord::SIZE]
                .copy_from_slice(record.as_bytes());
        }

        let spare_backup = self.read_range(self.config.spare_device, self.config.spare_lba)?;
        self.write_range(self.config.spare_device, self.config.spare_lba, &image)?;
        let fvb = locate(&self.registry, self.config.spare_device)?;
        assert_state_bits(
            fvb,
            self.spare_work_space_lba(),
            self.config.work_space_base + WorkingBlockHeader::STATE_OFFSET,
            WorkingBlockState::WORKING_BLOCK_VALID.bits(),
        )?;

        self.flush_spare_to_working()?;
        self.write_range(self.config.spare_device, self.config.spare_lba, &spare_backup)?;
        log::debug!(target: "ftw_lite", "Reclaim complete at offset {:#x}", self.work_space.last_record_offset());
        Ok(())
    }
}
