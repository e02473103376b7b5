//! On-Flash Work Space Layout
//!
//! Byte layout of the work space header and of the journal records that follow it, together with the record state
//! machine encoded by the record flag bits.
//!
//! Flash is erased to `0xFF`, so a flag is asserted by programming its bit to zero. The structures in this module
//! always hold raw (on-flash) bytes; [`RecordFlags`] and [`WorkingBlockState`] are the logical views with the
//! erase polarity reverted.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::mem::{offset_of, size_of};

use bitflags::bitflags;
use r_efi::efi;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::*;

use crate::{
    error::{FtwError, Result},
    fvb::DeviceId,
};

/// Value of an erased flash byte.
pub const FTW_ERASED_BYTE: u8 = 0xFF;

// { 0x9e58292b, 0x7c68, 0x497d, { 0xa0, 0xce, 0x65, 0x00, 0xfd, 0x9f, 0x1b, 0x95 }}
pub const WORKING_BLOCK_SIGNATURE_GUID: efi::Guid =
    efi::Guid::from_fields(0x9e58292b, 0x7c68, 0x497d, 0xa0, 0xce, &[0x65, 0x00, 0xfd, 0x9f, 0x1b, 0x95]);

bitflags! {
    /// Progress markers of one journal record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        const WRITE_ALLOCATED = 0x01;
        const SPARE_COMPLETED = 0x02;
        const WRITE_COMPLETED = 0x04;
    }
}

bitflags! {
    /// Validity markers of the work space header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkingBlockState: u8 {
        const WORKING_BLOCK_VALID = 0x01;
        const WORKING_BLOCK_INVALID = 0x02;
    }
}

/// Converts between the raw flash byte and the logical flag bits.
#[inline]
pub const fn revert_polarity(byte: u8) -> u8 {
    byte ^ FTW_ERASED_BYTE
}

/// The state of a single write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordState {
    /// The slot is unused.
    Idle,
    /// The write intent is recorded; nothing has been staged.
    Allocated,
    /// The spare area holds the full post-write image of the target.
    SpareStaged,
    /// The write has been applied, or was discarded before it was staged.
    Committed,
}

impl RecordState {
    /// Decodes the state from logical record flags.
    pub fn from_flags(flags: RecordFlags) -> Result<Self> {
        let allocated = flags.contains(RecordFlags::WRITE_ALLOCATED);
        let staged = flags.contains(RecordFlags::SPARE_COMPLETED);
        let completed = flags.contains(RecordFlags::WRITE_COMPLETED);

        match (allocated, staged, completed) {
            (false, false, false) => Ok(RecordState::Idle),
            (true, false, false) => Ok(RecordState::Allocated),
            (true, true, false) => Ok(RecordState::SpareStaged),
            // An aborted record completes without ever being staged.
            (true, _, true) => Ok(RecordState::Committed),
            _ => Err(FtwError::VolumeCorrupted),
        }
    }

    /// Returns the state reached by asserting `flag`.
    ///
    /// Only forward moves are accepted: allocate from `Idle`, stage from `Allocated`, and complete from either
    /// `SpareStaged` or `Allocated` (abort).
    pub fn advance(self, flag: RecordFlags) -> Result<Self> {
        let next = if flag == RecordFlags::WRITE_ALLOCATED && self == RecordState::Idle {
            RecordState::Allocated
        } else if flag == RecordFlags::SPARE_COMPLETED && self == RecordState::Allocated {
            RecordState::SpareStaged
        } else if flag == RecordFlags::WRITE_COMPLETED && self.is_in_flight() {
            RecordState::Committed
        } else {
            return Err(FtwError::InvalidParameter);
        };
        Ok(next)
    }

    /// Whether a write transaction owns this record.
    pub fn is_in_flight(self) -> bool {
        matches!(self, RecordState::Allocated | RecordState::SpareStaged)
    }
}

/// A journal record as stored in the work space.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FtwLiteRecord {
    /// Raw record flags.
    state: u8,
    /// Left erased.
    reserved: [u8; 7],
    /// Logical identifier of the target block device.
    device: u64,
    /// Target LBA on that device.
    lba: u64,
    /// Byte offset inside the target block.
    offset: u64,
    /// Number of bytes written.
    length: u64,
}

impl FtwLiteRecord {
    /// Size of a record in the work space.
    pub const SIZE: usize = size_of::<Self>();

    /// Offset of the state byte inside a record.
    pub const STATE_OFFSET: usize = offset_of!(FtwLiteRecord, state);

    /// Creates a freshly allocated record for a write of `length` bytes at `lba`/`offset` on `device`.
    pub fn allocate(device: DeviceId, lba: u64, offset: usize, length: usize) -> Self {
        Self {
            state: revert_polarity(RecordFlags::WRITE_ALLOCATED.bits()),
            reserved: [FTW_ERASED_BYTE; 7],
            device: device.0,
            lba,
            offset: offset as u64,
            length: length as u64,
        }
    }

    /// Reads a record from the start of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(record, _)| record)
    }

    /// The logical flags of this record.
    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_retain(revert_polarity(self.state))
    }

    /// The transaction state encoded in the flags.
    pub fn record_state(&self) -> Result<RecordState> {
        RecordState::from_flags(self.flags())
    }

    /// The raw state byte with `flag` asserted, after checking the transition is legal.
    pub fn state_byte_with(&self, flag: RecordFlags) -> Result<u8> {
        self.record_state()?.advance(flag)?;
        Ok(revert_polarity((self.flags() | flag).bits()))
    }

    /// Asserts `flag` in this in-memory copy.
    pub fn set_flag(&mut self, flag: RecordFlags) -> Result<()> {
        self.state = self.state_byte_with(flag)?;
        Ok(())
    }

    pub fn device(&self) -> DeviceId {
        DeviceId(self.device)
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether every byte of the record is erased.
    pub fn is_erased(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == FTW_ERASED_BYTE)
    }
}

/// Header at the start of the work space.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct WorkingBlockHeader {
    /// [`WORKING_BLOCK_SIGNATURE_GUID`] bytes.
    signature: [u8; 16],
    /// CRC32 of the header with this field erased and the state normalized to valid.
    crc: u32,
    /// Raw working block state.
    state: u8,
    /// Left erased.
    reserved: [u8; 3],
    /// Bytes available for records.
    write_queue_size: u64,
}

impl WorkingBlockHeader {
    /// Size of the header in the work space.
    pub const SIZE: usize = size_of::<Self>();

    /// Offset of the state byte inside the header.
    pub const STATE_OFFSET: usize = offset_of!(WorkingBlockHeader, state);

    /// Creates a header for a work space of `work_space_size` bytes.
    ///
    /// The header is returned with the valid marker clear; the marker is programmed separately once the whole work
    /// space has been written.
    pub fn new(work_space_size: usize) -> Self {
        let mut header = Self {
            signature: *WORKING_BLOCK_SIGNATURE_GUID.as_bytes(),
            crc: u32::MAX,
            state: FTW_ERASED_BYTE,
            reserved: [FTW_ERASED_BYTE; 3],
            write_queue_size: (work_space_size - Self::SIZE) as u64,
        };
        header.crc = header.compute_crc();
        header
    }

    /// Reads a header from the start of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(header, _)| header)
    }

    /// The logical working block state.
    pub fn working_block_state(&self) -> WorkingBlockState {
        WorkingBlockState::from_bits_retain(revert_polarity(self.state))
    }

    /// Asserts `state` in this in-memory copy.
    pub fn set_state(&mut self, state: WorkingBlockState) {
        self.state = revert_polarity((self.working_block_state() | state).bits());
    }

    /// Clears the valid marker in this in-memory copy, leaving it as it reads right after an erase.
    pub fn clear_valid(&mut self) {
        self.state = revert_polarity((self.working_block_state() - WorkingBlockState::WORKING_BLOCK_VALID).bits());
    }

    /// The raw state byte with `state` asserted.
    pub fn state_byte_with(&self, state: WorkingBlockState) -> u8 {
        revert_polarity((self.working_block_state() | state).bits())
    }

    pub fn write_queue_size(&self) -> u64 {
        self.write_queue_size
    }

    fn compute_crc(&self) -> u32 {
        let mut normalized = *self;
        normalized.crc = u32::MAX;
        normalized.state = revert_polarity(WorkingBlockState::WORKING_BLOCK_VALID.bits());
        crc32fast::hash(normalized.as_bytes())
    }

    /// Whether this header describes a usable work space of `work_space_size` bytes.
    pub fn is_valid(&self, work_space_size: usize) -> bool {
        let state = self.working_block_state();
        self.signature == *WORKING_BLOCK_SIGNATURE_GUID.as_bytes()
            && state.contains(WorkingBlockState::WORKING_BLOCK_VALID)
            && !state.contains(WorkingBlockState::WORKING_BLOCK_INVALID)
            && { self.write_queue_size } == (work_space_size - Self::SIZE) as u64
            && { self.crc } == self.compute_crc()
    }
}
