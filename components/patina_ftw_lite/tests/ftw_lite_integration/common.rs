//! Common Test Infrastructure for FTW Lite Integration Tests
//!
//! A simulated platform: one NV storage flash device holding the work space, the spare area and ordinary target
//! blocks, plus a second data device.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use std::sync::{Arc, Once};

use patina_ftw_lite::{
    config::FtwLiteConfig,
    fvb::{DeviceId, FvbRegistry},
    memory_fvb::MemoryFlash,
    FtwLite,
};

/// Erase block size of both devices.
pub const BLOCK: usize = 0x1000;

/// NV storage device: work space, spare area and target blocks.
pub const NV: DeviceId = DeviceId(0);

/// Secondary data device.
pub const DATA: DeviceId = DeviceId(1);

/// Ordinary target block on the NV device.
pub const TARGET_LBA: u64 = 5;

/// Block used to fill up the journal.
pub const SCRATCH_LBA: u64 = 6;

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        // Default to no logging unless RUST_LOG environment variable is set
        let mut builder = env_logger::Builder::from_default_env();
        if std::env::var("RUST_LOG").is_err() {
            builder.filter_level(log::LevelFilter::Off);
        }
        let _ = builder.is_test(true).try_init();
    });
}

/// Work space in block 2, spare area in block 3, one block per spare area.
pub fn single_block_config(work_space_size: usize) -> FtwLiteConfig {
    FtwLiteConfig {
        work_space_device: NV,
        work_space_lba: 2,
        work_space_base: 0,
        work_space_size,
        spare_device: NV,
        spare_lba: 3,
        spare_area_length: BLOCK,
        block_size: BLOCK,
        number_of_spare_blocks: 1,
    }
}

/// Working block range 2..=3 with the work space at 0x100 in block 3, spare area in blocks 4..=5.
pub fn two_block_config() -> FtwLiteConfig {
    FtwLiteConfig {
        work_space_device: NV,
        work_space_lba: 3,
        work_space_base: 0x100,
        work_space_size: 0x400,
        spare_device: NV,
        spare_lba: 4,
        spare_area_length: 2 * BLOCK,
        block_size: BLOCK,
        number_of_spare_blocks: 2,
    }
}

/// A set of flash devices that survives simulated reboots.
pub struct Platform {
    pub nv: Arc<MemoryFlash>,
    pub data: Arc<MemoryFlash>,
    pub registry: FvbRegistry,
    pub config: FtwLiteConfig,
}

impl Platform {
    pub fn new(config: FtwLiteConfig) -> Self {
        init_logger();
        let nv = Arc::new(MemoryFlash::new(BLOCK, 10));
        let data = Arc::new(MemoryFlash::new(BLOCK, 4));
        let registry = FvbRegistry::new().with_device(NV, nv.clone()).with_device(DATA, data.clone());
        Self { nv, data, registry, config }
    }

    /// Runs recovery and returns the engine, as a platform boot would.
    pub fn boot(&self) -> FtwLite<FvbRegistry> {
        FtwLite::new(self.config, self.registry.clone()).expect("recovery should succeed")
    }

    /// Bytes of `count` blocks of the NV device starting at `lba`.
    pub fn nv_blocks(&self, lba: u64, count: usize) -> Vec<u8> {
        self.nv.bytes(lba as usize * BLOCK, count * BLOCK)
    }
}

/// Deterministic non-erased test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed) & 0x7F).collect()
}

/// Writes `data` through the engine, asserting success.
pub fn write_ok(ftw: &mut FtwLite<FvbRegistry>, device: DeviceId, lba: u64, offset: usize, data: &[u8]) {
    let mut length = data.len();
    ftw.write(device, lba, offset, &mut length, data).expect("write should succeed");
    assert_eq!(length, data.len());
}
