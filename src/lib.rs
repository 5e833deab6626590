// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # SGX EPC driver core
//!
//! Multiplexes the machine-wide pool of enclave page cache (EPC) pages
//! between user-built enclaves: allocation over the firmware-described
//! sections, per-enclave page tracking against a backing store, an
//! asynchronous add-page worker, a watermark-driven reclaimer that evicts
//! cold pages through the block/track/write-back sequence, and the fault
//! path that installs resident pages.
//!
//! The privileged instruction layer, the address-space layer and the
//! backing store are collaborator traits ([`encls::Encls`],
//! [`mm::AddressSpace`], [`backing::Backing`]); the character-device
//! dispatch that feeds [`encl::Encl`] lives outside this crate.
//!
//! ## Initialization
//!
//! `EpcMapBuilder` -> `EpcMap` -> [`driver::EpcDriver`] -> [`encl::Encl`]

use core::fmt;

/// Backing-store trait and the in-memory implementation.
pub mod backing;
/// Driver context and capability configuration.
pub mod driver;
/// The enclave object: construction, initialization, faults, teardown.
pub mod encl;
/// The privileged-instruction collaborator contract.
pub mod encls;
/// Address-space collaborators and enclave attachments.
pub mod mm;
/// Power-event notification.
mod pm;
/// The reclaim pipeline and reclaimer task.
mod reclaim;
/// Version-array pages and sealing slots.
mod va;
/// The per-enclave add-page worker.
mod worker;

pub use driver::{EpcDriver, SgxCaps};
pub use encl::{Encl, EnclFlags};
pub use epc_tracking::{EpcMap, EpcMapBuilder, MAX_EPC_SECTIONS};
pub use mm::{AddressSpace, CpuMask, CpuShootdown, EnclMm, VmFault, VmRegion};
pub use sync::SignalToken;

/// Code returned to a user holding a suspended enclave.
pub const POWER_LOST_ENCLAVE: i64 = 0x4000_0000;

/// Driver-level errors surfaced to the ioctl dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Validation failure in create/add/init.
    InvalidArgument,
    /// An enclave page already exists at the given address.
    Duplicate,
    /// The EPC is exhausted even after reclaim.
    OutOfMemory,
    /// A signal interrupted a blocking wait.
    Interrupted,
    /// The enclave was lost across a power transition.
    PowerLost,
    /// The enclave is dead; only release will succeed.
    Dead,
    /// The backing store failed.
    Io,
    /// A privileged instruction faulted; the enclave has been destroyed.
    HardwareFault,
    /// A privileged instruction returned a non-transient status, surfaced
    /// unmodified.
    HardwareStatus(sgx_arch::ErrorCode),
}

/// Holds the result of driver operations.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Maps the error onto the value the character-device dispatcher hands
    /// back: a negative errno, or a non-negative hardware status.
    pub fn errno(&self) -> i64 {
        match self {
            Error::InvalidArgument | Error::Duplicate => -22,
            Error::OutOfMemory => -12,
            Error::Interrupted => -512,
            Error::PowerLost => POWER_LOST_ENCLAVE,
            Error::Dead | Error::HardwareFault => -14,
            Error::Io => -5,
            Error::HardwareStatus(code) => *code as i64,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<epc_tracking::PoolError> for Error {
    fn from(err: epc_tracking::PoolError) -> Self {
        match err {
            epc_tracking::PoolError::OutOfMemory => Error::OutOfMemory,
            epc_tracking::PoolError::Interrupted => Error::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidArgument.errno(), -22);
        assert_eq!(Error::OutOfMemory.errno(), -12);
        assert_eq!(Error::Interrupted.errno(), -512);
        assert_eq!(Error::PowerLost.errno(), POWER_LOST_ENCLAVE);
        assert_eq!(
            Error::HardwareStatus(sgx_arch::ErrorCode::InvalidEinitToken).errno(),
            16
        );
    }
}
