//! Error definitions for the Fault Tolerant Write Lite service.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt::Display;

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for FTW operations.
pub type Result<T> = core::result::Result<T, FtwError>;

/// EDK II status codes produced or consumed by the FTW Lite service.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FtwError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The requested write does not fit in the spare area. The accepted size is returned in the length
    /// parameter when this error occurs.
    BadBufferSize,
    /// A write transaction is already in flight.
    AccessDenied,
    /// The target block device could not be resolved.
    NotFound,
    /// A temporary buffer could not be allocated.
    OutOfResources,
    /// A read, write or erase on the journal, spare or target storage failed.
    Aborted,
    /// The physical device reported an error while attempting the operation.
    DeviceError,
    /// The device can not be written to.
    WriteProtected,
    /// The on-flash journal is inconsistent.
    VolumeCorrupted,
    /// An unknown EFI status code was encountered.
    Unknown(efi::Status),
}

impl FtwError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// If the status is `SUCCESS`, it returns `Ok(())`. Otherwise, it returns an `Err` with the corresponding
    /// `FtwError`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            efi::Status::INVALID_PARAMETER => Err(FtwError::InvalidParameter),
            efi::Status::BAD_BUFFER_SIZE => Err(FtwError::BadBufferSize),
            efi::Status::ACCESS_DENIED => Err(FtwError::AccessDenied),
            efi::Status::NOT_FOUND => Err(FtwError::NotFound),
            efi::Status::OUT_OF_RESOURCES => Err(FtwError::OutOfResources),
            efi::Status::ABORTED => Err(FtwError::Aborted),
            efi::Status::DEVICE_ERROR => Err(FtwError::DeviceError),
            efi::Status::WRITE_PROTECTED => Err(FtwError::WriteProtected),
            efi::Status::VOLUME_CORRUPTED => Err(FtwError::VolumeCorrupted),
            _ => Err(FtwError::Unknown(status)),
        }
    }
}

impl From<FtwError> for efi::Status {
    fn from(e: FtwError) -> efi::Status {
        match e {
            FtwError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            FtwError::BadBufferSize => efi::Status::BAD_BUFFER_SIZE,
            FtwError::AccessDenied => efi::Status::ACCESS_DENIED,
            FtwError::NotFound => efi::Status::NOT_FOUND,
            FtwError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            FtwError::Aborted => efi::Status::ABORTED,
            FtwError::DeviceError => efi::Status::DEVICE_ERROR,
            FtwError::WriteProtected => efi::Status::WRITE_PROTECTED,
            FtwError::VolumeCorrupted => efi::Status::VOLUME_CORRUPTED,
            FtwError::Unknown(status) => status,
        }
    }
}

impl Display for FtwError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FtwError::InvalidParameter => write!(f, "Invalid parameter."),
            FtwError::BadBufferSize => write!(f, "Write does not fit in the spare area."),
            FtwError::AccessDenied => write!(f, "A fault tolerant write is already in flight."),
            FtwError::NotFound => write!(f, "Block device not found."),
            FtwError::OutOfResources => write!(f, "Out of resources."),
            FtwError::Aborted => write!(f, "Flash operation aborted."),
            FtwError::DeviceError => write!(f, "Device error."),
            FtwError::WriteProtected => write!(f, "Device is write protected."),
            FtwError::VolumeCorrupted => write!(f, "Work space is corrupted."),
            FtwError::Unknown(status) => write!(f, "Unknown status {:#x?}.", status),
        }
    }
}

impl core::error::Error for FtwError {}
