//! Fault Tolerant Write Lite Support
//!
//! This library updates bytes on block-erase flash so that a power loss at any point leaves the target holding
//! either its old or its new content. A small journal (the work space) records each write, and a reserved range
//! of blocks (the spare area) stages the full post-write image of the target before the target is touched.
//!
//! ## Examples and Usage
//!
//! The platform resolves the flash geometry, registers its block devices, and creates the service once per boot.
//! Creating the engine runs the recovery pass, which finishes or discards a write interrupted on the previous
//! boot. Consumers then go through the [`service::FaultTolerantWriteLite`] trait.
//!
//! ```
//! use std::sync::Arc;
//! use patina_ftw_lite::{
//!     config::FtwLiteConfig,
//!     fvb::{DeviceId, FvbRegistry},
//!     memory_fvb::MemoryFlash,
//!     service::{FaultTolerantWriteLite, FtwLiteService},
//! };
//!
//! let flash = Arc::new(MemoryFlash::new(0x1000, 8));
//! let registry = FvbRegistry::new().with_device(DeviceId(0), flash.clone());
//! let config = FtwLiteConfig {
//!     work_space_device: DeviceId(0),
//!     work_space_lba: 2,
//!     work_space_base: 0,
//!     work_space_size: 0x400,
//!     spare_device: DeviceId(0),
//!     spare_lba: 3,
//!     spare_area_length: 0x1000,
//!     block_size: 0x1000,
//!     number_of_spare_blocks: 1,
//! };
//!
//! let ftw = FtwLiteService::initialize(config, registry).unwrap();
//! let mut length = 4;
//! ftw.write(DeviceId(0), 5, 0x10, &mut length, b"ftw!").unwrap();
//! assert_eq!(flash.bytes(5 * 0x1000 + 0x10, 4), b"ftw!");
//! ```
//!
//! ## Logging
//!
//! All components log through the `log` crate with the `ftw_lite` target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod config;
pub mod engine;
pub mod error;
pub mod fvb;
pub mod layout;
pub mod memory_fvb;
pub mod service;
pub mod work_space;

#[cfg(feature = "std")]
pub mod parser;

mod recovery;

pub use engine::FtwLite;
