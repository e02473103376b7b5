//! RAM Backed Flash Device
//!
//! A [`FirmwareVolumeBlock`] implementation over a memory buffer that follows NOR flash rules: the device starts
//! erased, a write can only clear bits and only an erase sets them again. The device can simulate a power loss
//! after a given number of mutating operations, which tears the interrupted operation and fails every later one.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{vec, vec::Vec};

use spin::Mutex;

use crate::{
    error::{FtwError, Result},
    fvb::FirmwareVolumeBlock,
};

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

struct FlashState {
    data: Vec<u8>,
    power_loss_budget: Option<usize>,
    powered_off: bool,
    fail_reads: bool,
    mutations: usize,
}

/// An in-memory flash device with power-loss injection.
pub struct MemoryFlash {
    block_size: usize,
    num_blocks: u64,
    base_address: u64,
    state: Mutex<FlashState>,
}

impl MemoryFlash {
    /// Creates an erased device of `num_blocks` blocks of `block_size` bytes.
    pub fn new(block_size: usize, num_blocks: u64) -> Self {
        Self {
            block_size,
            num_blocks,
            base_address: 0,
            state: Mutex::new(FlashState {
                data: vec![ERASED_BYTE; block_size * num_blocks as usize],
                power_loss_budget: None,
                powered_off: false,
                fail_reads: false,
                mutations: 0,
            }),
        }
    }

    /// Sets the address reported by [`FirmwareVolumeBlock::get_physical_address`].
    pub fn with_base_address(mut self, base_address: u64) -> Self {
        self.base_address = base_address;
        self
    }

    /// Returns a copy of the whole device content.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Returns a copy of `len` bytes starting at the absolute byte `address`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the device.
    pub fn bytes(&self, address: usize, len: usize) -> Vec<u8> {
        self.state.lock().data[address..address + len].to_vec()
    }

    /// Overwrites device content directly, bypassing flash program rules.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` runs past the end of the device.
    pub fn load(&self, address: usize, bytes: &[u8]) {
        self.state.lock().data[address..address + bytes.len()].copy_from_slice(bytes);
    }

    /// Allows `budget` more mutating operations; the next one is torn and reported as a device error.
    pub fn set_power_loss_budget(&self, budget: usize) {
        let mut state = self.state.lock();
        state.power_loss_budget = Some(budget);
        state.powered_off = false;
    }

    /// Restores power: all operations succeed again.
    pub fn clear_power_loss(&self) {
        let mut state = self.state.lock();
        state.power_loss_budget = None;
        state.powered_off = false;
    }

    /// Returns whether a simulated power loss has happened since the budget was set.
    pub fn power_lost(&self) -> bool {
        self.state.lock().powered_off
    }

    /// Forces every read to fail with a device error.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Returns the number of successful mutating operations since creation.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    fn check_range(&self, lba: u64, offset: usize, len: usize) -> Result<usize> {
        if lba >= self.num_blocks {
            return Err(FtwError::InvalidParameter);
        }
        if offset.checked_add(len).is_none_or(|end| end > self.block_size) {
            return Err(FtwError::BadBufferSize);
        }
        Ok(lba as usize * self.block_size + offset)
    }
}

impl FlashState {
    /// Accounts for a mutating operation. Returns `Ok(true)` when it may complete, `Ok(false)` when it must be torn.
    fn begin_mutation(&mut self) -> Result<bool> {
        if self.powered_off {
            return Err(FtwError::DeviceError);
        }
        match self.power_loss_budget {
            Some(0) => {
                self.powered_off = true;
                Ok(false)
            }
            Some(ref mut budget) => {
                *budget -= 1;
                self.mutations += 1;
                Ok(true)
            }
            None => {
                self.mutations += 1;
                Ok(true)
            }
        }
    }
}

impl FirmwareVolumeBlock for MemoryFlash {
    fn get_physical_address(&self) -> Result<u64> {
        Ok(self.base_address)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read(&self, lba: u64, offset: usize, buffer: &mut [u8]) -> Result<usize> {
        let start = self.check_range(lba, offset, buffer.len())?;
        let state = self.state.lock();
        if state.fail_reads {
            return Err(FtwError::DeviceError);
        }
        buffer.copy_from_slice(&state.data[start..start + buffer.len()]);
        Ok(buffer.len())
    }

    fn write(&self, lba: u64, offset: usize, buffer: &[u8]) -> Result<usize> {
        let start = self.check_range(lba, offset, buffer.len())?;
        let mut state = self.state.lock();
        let complete = state.begin_mutation()?;
        let programmed = if complete { buffer.len() } else { buffer.len() / 2 };

        for (cell, byte) in state.data[start..start + programmed].iter_mut().zip(buffer) {
            *cell &= *byte;
        }

        if complete {
            Ok(buffer.len())
        } else {
            Err(FtwError::DeviceError)
        }
    }

    fn erase_blocks(&self, lba: u64, count: u64) -> Result<()> {
        if count == 0 || lba.checked_add(count).is_none_or(|end| end > self.num_blocks) {
            return Err(FtwError::InvalidParameter);
        }
        let start = lba as usize * self.block_size;
        let len = count as usize * self.block_size;

        let mut state = self.state.lock();
        let complete = state.begin_mutation()?;
        let erased = if complete { len } else { len / 2 };
        state.data[start..start + erased].fill(ERASED_BYTE);

        if complete {
            Ok(())
        } else {
            Err(FtwError::DeviceError)
        }
    }
}
