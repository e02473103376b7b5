//! Work space image parsing for use in the standard environment.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use crate::layout::{FtwLiteRecord, RecordState, WorkingBlockHeader, WORKING_BLOCK_SIGNATURE_GUID};
use alloc::format;

/// Parser for a work space image.
pub struct WorkSpaceParser<'a> {
    data: &'a [u8],
    header: WorkingBlockHeader,
}

impl<'a> WorkSpaceParser<'a> {
    /// Returns the offset of the first work space signature in `image`, such as a dump of a whole flash device.
    pub fn find(image: &[u8]) -> Option<usize> {
        let signature = WORKING_BLOCK_SIGNATURE_GUID.as_bytes();
        image.windows(signature.len()).position(|window| window == signature)
    }

    /// Creates a new `WorkSpaceParser` over `data`, which must start with a work space header.
    pub fn open(data: &'a [u8]) -> Result<Self, &'static str> {
        let header = WorkingBlockHeader::read_from(data).ok_or("Incomplete work space header.")?;
        if !data.starts_with(WORKING_BLOCK_SIGNATURE_GUID.as_bytes()) {
            return Err("No work space signature found.");
        }

        let size = usize::try_from(header.write_queue_size())
            .ok()
            .and_then(|queue| queue.checked_add(WorkingBlockHeader::SIZE))
            .ok_or("Work space size is not valid.")?;
        if data.len() < size {
            return Err("Incomplete work space.");
        }

        Ok(WorkSpaceParser { data: &data[..size], header })
    }

    /// Whether the header passes validation.
    pub fn is_valid(&self) -> bool {
        self.header.is_valid(self.data.len())
    }

    /// Iterates over the record slots.
    pub fn records(&self) -> impl Iterator<Item = FtwLiteRecord> + 'a {
        let data: &'a [u8] = self.data;
        data[WorkingBlockHeader::SIZE..].chunks_exact(FtwLiteRecord::SIZE).filter_map(FtwLiteRecord::read_from)
    }

    /// Writes the header information to the provided output stream.
    pub fn write_header<W: std::io::Write>(&self, out: &mut W) -> Result<(), &'static str> {
        let header = &format!(
            "Work space: {:#x} bytes, {} record slots, header {} ({:?})\n",
            self.data.len(),
            self.records().count(),
            if self.is_valid() { "valid" } else { "INVALID" },
            self.header.working_block_state()
        );
        out.write_all(header.as_bytes()).map_err(|_| "Failed to write to output.")
    }

    /// Writes one line per used record to the provided output stream, marking the last record.
    pub fn write_records<W: std::io::Write>(&self, out: &mut W) -> Result<(), &'static str> {
        let mut last_found = false;
        for (index, record) in self.records().enumerate() {
            if record.is_erased() {
                continue;
            }

            let state = record.record_state();
            let marker = match state {
                Ok(RecordState::Committed) => "",
                _ if last_found => "",
                _ => {
                    last_found = true;
                    " <- last"
                }
            };
            let line = &format!(
                "[{:>3}] {:<11} {} lba {:#x} offset {:#x} length {:#x}{}\n",
                index,
                state_name(state),
                record.device(),
                record.lba(),
                record.offset(),
                record.length(),
                marker
            );
            out.write_all(line.as_bytes()).map_err(|_| "Failed to write to output.")?;
        }
        Ok(())
    }

    /// Writes the header and the records.
    pub fn write_summary<W: std::io::Write>(&self, out: &mut W) -> Result<(), &'static str> {
        self.write_header(out)?;
        self.write_records(out)
    }
}

fn state_name(state: crate::error::Result<RecordState>) -> &'static str {
    match state {
        Ok(RecordState::Idle) => "IDLE",
        Ok(RecordState::Allocated) => "ALLOCATED",
        Ok(RecordState::SpareStaged) => "SPARE_STAGED",
        Ok(RecordState::Committed) => "COMMITTED",
        Err(_) => "CORRUPT",
    }
}
