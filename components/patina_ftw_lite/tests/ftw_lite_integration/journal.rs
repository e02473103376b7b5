//! Journal Behavior Tests
//!
//! Exercises the write contract and the journal bookkeeping through the public engine API.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use patina_ftw_lite::{
    error::FtwError,
    layout::{RecordFlags, RecordState, FTW_ERASED_BYTE},
    service::{FaultTolerantWriteLite, FtwLiteService},
    work_space::WorkSpace,
};

use crate::ftw_lite_integration::common::*;

#[test]
fn small_write_into_an_erased_block() {
    let platform = Platform::new(single_block_config(0x400));
    let mut ftw = platform.boot();

    let payload = pattern(64, 0x20);
    write_ok(&mut ftw, NV, TARGET_LBA, 100, &payload);

    let mut expected = vec![FTW_ERASED_BYTE; BLOCK];
    expected[100..164].copy_from_slice(&payload);
    assert_eq!(platform.nv_blocks(TARGET_LBA, 1), expected);
}

#[test]
fn second_write_is_denied_while_one_is_in_flight() {
    let platform = Platform::new(single_block_config(0x400));
    let mut ftw = platform.boot();

    // Only the record allocation reaches the flash.
    platform.nv.set_power_loss_budget(1);
    let mut length = 4;
    assert_eq!(ftw.write(NV, TARGET_LBA, 0, &mut length, &[1, 2, 3, 4]), Err(FtwError::Aborted));
    platform.nv.clear_power_loss();
    assert_eq!(ftw.work_space().last_record_state(), Ok(RecordState::Allocated));

    let snapshot = platform.nv.snapshot();
    let mutations = platform.nv.mutation_count();
    let mut length = 4;
    assert_eq!(ftw.write(NV, SCRATCH_LBA, 0, &mut length, &[5, 6, 7, 8]), Err(FtwError::AccessDenied));
    assert_eq!(platform.nv.snapshot(), snapshot);
    assert_eq!(platform.nv.mutation_count(), mutations);
}

#[test]
fn oversized_write_reports_what_fits() {
    let platform = Platform::new(single_block_config(0x400));
    let mut ftw = platform.boot();
    let snapshot = platform.nv.snapshot();

    let data = pattern(0x20, 1);
    let mut length = data.len();
    assert_eq!(ftw.write(NV, TARGET_LBA, BLOCK - 0x10, &mut length, &data), Err(FtwError::BadBufferSize));
    assert_eq!(length, 0x10);
    assert_eq!(platform.nv.snapshot(), snapshot);

    // The caller retries with the narrowed size.
    ftw.write(NV, TARGET_LBA, BLOCK - 0x10, &mut length, &data).unwrap();
    assert_eq!(platform.nv.bytes((TARGET_LBA as usize + 1) * BLOCK - 0x10, 0x10), &data[..0x10]);
}

#[test]
fn reclaim_keeps_only_the_unfinished_record() {
    let platform = Platform::new(single_block_config(0xA0));
    let mut ftw = platform.boot();
    let capacity = ftw.work_space().capacity();
    for index in 0..capacity - 1 {
        write_ok(&mut ftw, NV, SCRATCH_LBA, index, &[index as u8]);
    }

    platform.nv.set_power_loss_budget(1);
    let mut length = 8;
    assert!(ftw.write(NV, TARGET_LBA, 0x30, &mut length, &[9; 8]).is_err());
    platform.nv.clear_power_loss();

    let unfinished = ftw.work_space().record(capacity - 1).unwrap();
    assert_eq!(unfinished.record_state(), Ok(RecordState::Allocated));
    assert!(!ftw.work_space().has_free_slot());

    ftw.reclaim(true).unwrap();

    let work_space = ftw.work_space();
    assert!(work_space.is_valid());
    assert_eq!(work_space.last_record_offset(), WorkSpace::slot_offset(0));
    let first = work_space.record(0).unwrap();
    assert_eq!(first.flags(), RecordFlags::WRITE_ALLOCATED);
    assert_eq!(
        (first.device(), first.lba(), first.offset(), first.length()),
        (unfinished.device(), unfinished.lba(), unfinished.offset(), unfinished.length())
    );
    assert!(work_space.records().skip(1).all(|record| record.is_erased()));

    // The next boot aborts it and leaves the target alone.
    drop(ftw);
    let ftw = platform.boot();
    assert_eq!(ftw.work_space().record(0).unwrap().record_state(), Ok(RecordState::Committed));
    assert_eq!(platform.nv.bytes(TARGET_LBA as usize * BLOCK + 0x30, 8), vec![FTW_ERASED_BYTE; 8]);
    let scratch: Vec<u8> = (0..capacity - 1).map(|index| index as u8).collect();
    assert_eq!(platform.nv.bytes(SCRATCH_LBA as usize * BLOCK, capacity - 1), scratch);
}

#[test]
fn working_block_can_be_written_through_the_journal() {
    let platform = Platform::new(single_block_config(0x400));
    let mut ftw = platform.boot();

    let payload = pattern(0x40, 9);
    write_ok(&mut ftw, NV, 2, 0x900, &payload);
    write_ok(&mut ftw, NV, 2, 0x400, &payload);

    assert_eq!(platform.nv.bytes(2 * BLOCK + 0x900, 0x40), payload);
    assert_eq!(platform.nv.bytes(2 * BLOCK + 0x400, 0x40), payload);
    assert!(ftw.work_space().is_valid());
    assert_eq!(ftw.work_space().last_record_offset(), WorkSpace::slot_offset(2));

    let mut length = 0x10;
    assert_eq!(ftw.write(NV, 2, 0x3F8, &mut length, &payload), Err(FtwError::InvalidParameter));

    drop(ftw);
    let mutations = platform.nv.mutation_count();
    platform.boot();
    assert_eq!(platform.nv.mutation_count(), mutations);
}

#[test]
fn multi_block_working_range_translates_offsets() {
    let platform = Platform::new(two_block_config());
    let mut ftw = platform.boot();

    // Block 2 is the first block of the working range; the work space sits in block 3.
    let payload = pattern(0x30, 4);
    write_ok(&mut ftw, NV, 2, 0xFE0, &payload);
    assert_eq!(platform.nv.bytes(2 * BLOCK + 0xFE0, 0x30), payload);

    let mut length = 0x20;
    assert_eq!(ftw.write(NV, 3, 0xF0, &mut length, &payload), Err(FtwError::InvalidParameter));
    let mut length = 0x20;
    assert_eq!(ftw.write(NV, 3, 0xFF0, &mut length, &payload), Err(FtwError::BadBufferSize));
    assert_eq!(length, 0x10);

    // A write spanning both blocks of an ordinary target range.
    let payload = pattern(0x200, 8);
    write_ok(&mut ftw, NV, 7, 0xF00, &payload);
    assert_eq!(platform.nv.bytes(7 * BLOCK + 0xF00, 0x200), payload);
    assert!(ftw.work_space().is_valid());
}

#[test]
fn service_serves_writes_to_every_device() {
    let platform = Platform::new(single_block_config(0x400));
    let service = FtwLiteService::new(platform.boot());
    let ftw: &dyn FaultTolerantWriteLite = &service;

    let mut length = 3;
    ftw.write(DATA, 3, 0x10, &mut length, b"abc").unwrap();
    let mut length = 3;
    ftw.write(NV, TARGET_LBA, 0x10, &mut length, b"xyz").unwrap();
    let mut length = 1;
    assert_eq!(ftw.write(DATA, 4, 0, &mut length, b"!"), Err(FtwError::InvalidParameter));

    assert_eq!(platform.data.bytes(3 * BLOCK + 0x10, 3), b"abc");
    assert_eq!(platform.nv.bytes(TARGET_LBA as usize * BLOCK + 0x10, 3), b"xyz");
}
