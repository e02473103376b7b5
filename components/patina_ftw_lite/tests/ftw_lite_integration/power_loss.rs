//! Power Loss Tests
//!
//! Cuts power at every flash operation of a write, reboots, and checks that the target holds either the old or
//! the new bytes, that recovery is repeatable, and that the journal keeps working afterwards.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use patina_ftw_lite::{
    config::FtwLiteConfig,
    error::FtwError,
    fvb::FvbRegistry,
    layout::{RecordState, FTW_ERASED_BYTE},
    FtwLite,
};

use crate::ftw_lite_integration::common::*;

/// Offset of the payload inside the target range.
const OFFSET: usize = 0x800;

/// Bytes of the `span` blocks at `lba`, with the work space blanked out when it lives in that range.
fn target_image(platform: &Platform, lba: u64, span: usize) -> Vec<u8> {
    let mut image = platform.nv_blocks(lba, span);
    let config = &platform.config;
    if (lba..lba + span as u64).contains(&config.work_space_lba) {
        let start = (config.work_space_lba - lba) as usize * BLOCK + config.work_space_base;
        image[start..start + config.work_space_size].fill(FTW_ERASED_BYTE);
    }
    image
}

/// Interrupts a 64 byte write to `lba` after every possible number of flash operations.
///
/// Returns the number of operations that must complete before the write survives a power loss.
fn crash_every_operation(config: FtwLiteConfig, lba: u64, fill_journal: bool) -> usize {
    let span = config.number_of_spare_blocks;
    let payload = pattern(64, 0x40);
    let mut outcomes = Vec::new();

    for budget in 0.. {
        let platform = Platform::new(config);
        let mut ftw = platform.boot();
        write_ok(&mut ftw, NV, lba, 0x400, &pattern(BLOCK - 0x400, 0x11));
        if fill_journal {
            while ftw.work_space().has_free_slot() {
                write_ok(&mut ftw, NV, SCRATCH_LBA, 0, &[0x22]);
            }
        }

        let before = target_image(&platform, lba, span);
        let mut expected = before.clone();
        expected[OFFSET..OFFSET + payload.len()].copy_from_slice(&payload);
        let untouched = platform.nv_blocks(0, 2);

        platform.nv.set_power_loss_budget(budget);
        let mut length = payload.len();
        let result = ftw.write(NV, lba, OFFSET, &mut length, &payload);
        let lost = platform.nv.power_lost();
        platform.nv.clear_power_loss();
        drop(ftw);

        if result.is_ok() {
            assert!(!lost, "budget {budget}: write reported success after a power loss");
            platform.boot();
            assert_eq!(target_image(&platform, lba, span), expected);
            break;
        }
        assert!(lost, "budget {budget}: write failed without a power loss: {result:?}");

        let mut ftw = platform.boot();
        let after = target_image(&platform, lba, span);
        let applied = if after == expected {
            true
        } else if after == before {
            false
        } else {
            panic!("budget {budget}: target holds a torn image");
        };
        outcomes.push(applied);

        assert!(ftw.work_space().is_valid(), "budget {budget}: journal left invalid");
        assert!(!ftw.work_space().last_record_state().unwrap().is_in_flight());
        assert_eq!(platform.nv_blocks(0, 2), untouched);

        // A second recovery finds nothing to do.
        let mutations = platform.nv.mutation_count();
        let snapshot = platform.nv.snapshot();
        drop(ftw);
        let mut ftw = platform.boot();
        assert_eq!(platform.nv.mutation_count(), mutations, "budget {budget}: recovery is not idempotent");
        assert_eq!(platform.nv.snapshot(), snapshot);

        write_ok(&mut ftw, NV, lba, OFFSET, &payload);
        assert_eq!(target_image(&platform, lba, span), expected);
    }

    let threshold = outcomes.iter().position(|applied| *applied).unwrap_or(outcomes.len());
    assert!(outcomes[threshold..].iter().all(|applied| *applied), "write reverted after it became durable");
    threshold
}

#[test]
fn write_to_another_block_is_all_or_nothing() {
    // Allocate, erase spare, write spare, mark spare complete.
    assert_eq!(crash_every_operation(single_block_config(0x400), TARGET_LBA, false), 4);
}

#[test]
fn write_to_the_working_block_is_all_or_nothing() {
    assert_eq!(crash_every_operation(single_block_config(0x400), 2, false), 4);
}

#[test]
fn write_after_reclaim_is_all_or_nothing() {
    // Nine operations of reclaim come first.
    assert_eq!(crash_every_operation(single_block_config(0xA0), TARGET_LBA, true), 13);
}

#[test]
fn working_block_write_after_reclaim_is_all_or_nothing() {
    assert_eq!(crash_every_operation(single_block_config(0xA0), 2, true), 13);
}

#[test]
fn multi_block_writes_are_all_or_nothing() {
    // The spare area is written one block at a time.
    assert_eq!(crash_every_operation(two_block_config(), 7, false), 5);
    assert_eq!(crash_every_operation(two_block_config(), 2, false), 5);
}

#[test]
fn staged_write_to_another_device_completes_after_reboot() {
    let platform = Platform::new(single_block_config(0x400));
    let mut ftw = platform.boot();

    let payload = pattern(32, 3);
    platform.data.set_power_loss_budget(0);
    let mut length = payload.len();
    assert_eq!(ftw.write(DATA, 1, 0x80, &mut length, &payload), Err(FtwError::Aborted));
    platform.data.clear_power_loss();
    assert_eq!(ftw.work_space().last_record_state(), Ok(RecordState::SpareStaged));
    drop(ftw);

    let ftw = platform.boot();
    let mut expected = vec![FTW_ERASED_BYTE; BLOCK];
    expected[0x80..0xA0].copy_from_slice(&payload);
    assert_eq!(platform.data.bytes(BLOCK, BLOCK), expected);
    assert_eq!(ftw.work_space().record(0).unwrap().record_state(), Ok(RecordState::Committed));
    assert_eq!(platform.nv_blocks(3, 1), vec![FTW_ERASED_BYTE; BLOCK]);
}

#[test]
fn staged_write_cannot_be_discarded_by_the_caller() {
    let platform = Platform::new(single_block_config(0x400));
    platform.data.load(BLOCK, &[0x11; BLOCK]);
    let mut ftw = platform.boot();

    // Power fails halfway through the target erase.
    let payload = pattern(16, 7);
    platform.data.set_power_loss_budget(0);
    let mut length = payload.len();
    assert_eq!(ftw.write(DATA, 1, 0x900, &mut length, &payload), Err(FtwError::Aborted));
    platform.data.clear_power_loss();
    assert_eq!(platform.data.bytes(BLOCK, 1), [FTW_ERASED_BYTE]);

    assert_eq!(ftw.abort(), Err(FtwError::InvalidParameter));
    assert_eq!(ftw.reclaim(false), Err(FtwError::AccessDenied));
    assert_eq!(ftw.reclaim(true), Err(FtwError::AccessDenied));
    assert_eq!(ftw.work_space().last_record_state(), Ok(RecordState::SpareStaged));
    drop(ftw);

    platform.boot();
    let mut expected = vec![0x11; BLOCK];
    expected[0x900..0x910].copy_from_slice(&payload);
    assert_eq!(platform.data.bytes(BLOCK, BLOCK), expected);
}

#[test]
fn recovery_refuses_to_start_without_the_staged_target() {
    let platform = Platform::new(single_block_config(0x400));
    let mut ftw = platform.boot();

    platform.data.set_power_loss_budget(0);
    let mut length = 4;
    assert!(ftw.write(DATA, 2, 0, &mut length, &[1, 2, 3, 4]).is_err());
    platform.data.clear_power_loss();
    drop(ftw);

    let registry = FvbRegistry::new().with_device(NV, platform.nv.clone());
    assert_eq!(FtwLite::new(platform.config, registry).err(), Some(FtwError::Aborted));

    // The staged write is still there for a boot that can see the device.
    let ftw = platform.boot();
    assert_eq!(ftw.work_space().last_record_state(), Ok(RecordState::Idle));
    assert_eq!(platform.data.bytes(2 * BLOCK, 4), vec![1, 2, 3, 4]);
}

#[test]
fn interrupted_first_boot_initialization_recovers() {
    let data = pattern(0x100, 0x5A);
    for budget in 0.. {
        let platform = Platform::new(single_block_config(0x400));
        platform.nv.load(2 * BLOCK + 0x800, &data);

        platform.nv.set_power_loss_budget(budget);
        let result = FtwLite::new(platform.config, platform.registry.clone());
        platform.nv.clear_power_loss();

        let ftw = platform.boot();
        assert!(ftw.work_space().is_valid());
        assert_eq!(platform.nv.bytes(2 * BLOCK + 0x800, data.len()), data, "budget {budget}");
        if result.is_ok() {
            break;
        }
    }
}
