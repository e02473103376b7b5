//! FTW Work Space Journal
//!
//! In-memory mirror of the work space: the header followed by an append-only array of journal records. The
//! authoritative copy lives in the working block; every operation that needs the journal state refreshes the mirror
//! from flash first.
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
    error::{FtwError, Result},
    fvb::FirmwareVolumeBlock,
    layout::{revert_polarity, FtwLiteRecord, RecordFlags, RecordState, WorkingBlockHeader, FTW_ERASED_BYTE},
};

/// Allocates a temporary buffer of `len` bytes filled with `fill`.
///
/// Allocation failure is reported as [`FtwError::OutOfResources`] instead of aborting.
pub(crate) fn alloc_buffer(len: usize, fill: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| {
        log::error!(target: "ftw_lite", "Unable to allocate {:#x} byte buffer", len);
        FtwError::OutOfResources
    })?;
    buffer.resize(len, fill);
    Ok(buffer)
}

/// Mirror of the on-flash work space.
#[derive(Debug)]
pub struct WorkSpace {
    /// Block holding the work space.
    lba: u64,
    /// Offset of the work space inside that block.
    base: usize,
    /// Work space bytes.
    buffer: Vec<u8>,
    /// Offset of the last record: the first record that is not committed.
    last_record_offset: usize,
}

impl WorkSpace {
    /// Creates an erased mirror of a `size` byte work space at `base` in block `lba`.
    pub fn new(lba: u64, base: usize, size: usize) -> Result<Self> {
        let buffer = alloc_buffer(size, FTW_ERASED_BYTE)?;
        Ok(Self { lba, base, buffer, last_record_offset: WorkingBlockHeader::SIZE })
    }

    /// Builds a detached mirror from a work space image.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        let mut work_space = Self::new(0, 0, image.len())?;
        work_space.buffer.copy_from_slice(image);
        if work_space.is_valid() {
            work_space.locate_last_record()?;
        }
        Ok(work_space)
    }

    /// Reads the work space from `fvb` and locates the last record.
    pub fn refresh(&mut self, fvb: &dyn FirmwareVolumeBlock) -> Result<()> {
        match fvb.read(self.lba, self.base, &mut self.buffer) {
            Ok(read) if read == self.buffer.len() => {}
            result => {
                log::error!(target: "ftw_lite", "Work space refresh failed: {:?}", result);
                return Err(FtwError::Aborted);
            }
        }

        self.last_record_offset = WorkingBlockHeader::SIZE;
        if self.is_valid() {
            self.locate_last_record()?;
        }
        Ok(())
    }

    /// Resets the mirror to an erased work space carrying a fresh header.
    pub fn initialize(&mut self) {
        self.buffer.fill(FTW_ERASED_BYTE);
        let header = WorkingBlockHeader::new(self.buffer.len());
        self.buffer[..WorkingBlockHeader::SIZE].copy_from_slice(header.as_bytes());
        self.last_record_offset = WorkingBlockHeader::SIZE;
    }

    /// Returns the header, if the work space is large enough to hold one.
    pub fn header(&self) -> Option<WorkingBlockHeader> {
        WorkingBlockHeader::read_from(&self.buffer)
    }

    /// Whether the header carries the valid markers, signature and CRC.
    pub fn is_valid(&self) -> bool {
        self.header().is_some_and(|header| header.is_valid(self.buffer.len()))
    }

    /// The work space bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Size of the work space in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Number of record slots after the header.
    pub fn capacity(&self) -> usize {
        self.buffer.len().saturating_sub(WorkingBlockHeader::SIZE) / FtwLiteRecord::SIZE
    }

    /// Returns the record in slot `index`.
    pub fn record(&self, index: usize) -> Option<FtwLiteRecord> {
        if index >= self.capacity() {
            return None;
        }
        FtwLiteRecord::read_from(&self.buffer[Self::slot_offset(index)..])
    }

    /// Iterates over every record slot, used or not.
    pub fn records(&self) -> impl Iterator<Item = FtwLiteRecord> + '_ {
        (0..self.capacity()).filter_map(|index| self.record(index))
    }

    /// Offset of the last record inside the work space.
    pub fn last_record_offset(&self) -> usize {
        self.last_record_offset
    }

    /// The last record: the in-flight record, or the next free slot. `None` when every slot holds a committed record.
    pub fn last_record(&self) -> Option<FtwLiteRecord> {
        self.buffer.get(self.last_record_offset..).and_then(|tail| {
            if tail.len() < FtwLiteRecord::SIZE { None } else { FtwLiteRecord::read_from(tail) }
        })
    }

    /// State of the last record. A full journal reads as committed.
    pub fn last_record_state(&self) -> Result<RecordState> {
        match self.last_record() {
            Some(record) => record.record_state().map_err(|_| FtwError::Aborted),
            None => Ok(RecordState::Committed),
        }
    }

    /// Whether the last record slot is fully erased and can take a new record.
    pub fn has_free_slot(&self) -> bool {
        self.last_record().is_some_and(|record| record.is_erased())
    }

    /// Scans the records for the first one that is not committed.
    ///
    /// A record whose flags do not describe a reachable state stops the scan with [`FtwError::Aborted`].
    pub fn locate_last_record(&mut self) -> Result<()> {
        let mut offset = WorkingBlockHeader::SIZE;
        while offset + FtwLiteRecord::SIZE <= self.buffer.len() {
            let record = FtwLiteRecord::read_from(&self.buffer[offset..]).ok_or(FtwError::Aborted)?;
            let state = record.record_state().map_err(|err| {
                log::error!(target: "ftw_lite", "Corrupt record at work space offset {:#x}: {:?}", offset, err);
                FtwError::Aborted
            })?;
            if state != RecordState::Committed {
                break;
            }
            offset += FtwLiteRecord::SIZE;
        }

        self.last_record_offset = offset;
        log::trace!(target: "ftw_lite", "Last record at work space offset {:#x}", offset);
        Ok(())
    }

    /// Whether anything past the last record is not erased.
    pub fn is_dirty_after_last_record(&self) -> bool {
        let start = match self.last_record() {
            Some(record) if record.flags().is_empty() => self.last_record_offset,
            Some(_) => self.last_record_offset + FtwLiteRecord::SIZE,
            None => return false,
        };
        self.buffer.get(start..).is_some_and(|tail| tail.iter().any(|byte| *byte != FTW_ERASED_BYTE))
    }

    /// Programs `record` into the free last slot.
    pub fn allocate(&mut self, fvb: &dyn FirmwareVolumeBlock, record: &FtwLiteRecord) -> Result<()> {
        if !self.has_free_slot() {
            log::error!(target: "ftw_lite", "No free record slot at offset {:#x}", self.last_record_offset);
            return Err(FtwError::InvalidParameter);
        }
        if record.record_state() != Ok(RecordState::Allocated) {
            return Err(FtwError::InvalidParameter);
        }

        let offset = self.last_record_offset;
        match fvb.write(self.lba, self.base + offset, record.as_bytes()) {
            Ok(written) if written == FtwLiteRecord::SIZE => {}
            result => {
                log::error!(target: "ftw_lite", "Record allocation at offset {:#x} failed: {:?}", offset, result);
                return Err(FtwError::Aborted);
            }
        }

        self.buffer[offset..offset + FtwLiteRecord::SIZE].copy_from_slice(record.as_bytes());
        Ok(())
    }

    /// Asserts `flag` on the last record, on flash and in the mirror.
    ///
    /// When the record becomes committed, the last record moves on to the next slot.
    pub fn update_flag(&mut self, fvb: &dyn FirmwareVolumeBlock, flag: RecordFlags) -> Result<()> {
        let record = self.last_record().ok_or(FtwError::InvalidParameter)?;
        let state = record.state_byte_with(flag).inspect_err(|err| {
            log::error!(target: "ftw_lite", "Illegal record transition {:?} -> {:?}: {:?}", record.flags(), flag, err);
        })?;

        let offset = self.last_record_offset + FtwLiteRecord::STATE_OFFSET;
        program_state(fvb, self.lba, self.base + offset, state)?;
        self.buffer[offset] = state;
        log::debug!(target: "ftw_lite", "Record at {:#x} now {:?}", self.last_record_offset, record_state_of(state));

        if record_state_of(state) == Some(RecordState::Committed) {
            self.locate_last_record()?;
        }
        Ok(())
    }

    /// Byte offset of slot `index` inside the work space.
    pub const fn slot_offset(index: usize) -> usize {
        WorkingBlockHeader::SIZE + index * FtwLiteRecord::SIZE
    }
}

fn record_state_of(raw: u8) -> Option<RecordState> {
    RecordState::from_flags(RecordFlags::from_bits_retain(revert_polarity(raw))).ok()
}

/// Programs a single state byte at `offset` in block `lba`.
pub(crate) fn program_state(fvb: &dyn FirmwareVolumeBlock, lba: u64, offset: usize, state: u8) -> Result<()> {
    match fvb.write(lba, offset, &[state]) {
        Ok(1) => Ok(()),
        result => {
            log::error!(target: "ftw_lite", "State update at LBA {:#x} offset {:#x} failed: {:?}", lba, offset, result);
            Err(FtwError::Aborted)
        }
    }
}

/// Reads the state byte at `offset` in block `lba`, asserts the logical `bits` and programs it back.
pub(crate) fn assert_state_bits(fvb: &dyn FirmwareVolumeBlock, lba: u64, offset: usize, bits: u8) -> Result<()> {
    let mut state = [FTW_ERASED_BYTE];
    match fvb.read(lba, offset, &mut state) {
        Ok(1) => {}
        result => {
            log::error!(target: "ftw_lite", "State read at LBA {:#x} offset {:#x} failed: {:?}", lba, offset, result);
            return Err(FtwError::Aborted);
        }
    }
    program_state(fvb, lba, offset, revert_polarity(revert_polarity(state[0]) | bits))
}
