// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The privileged-instruction layer. Each ENCLS leaf is an opaque operation
//! behind the [`Encls`] trait; the core only depends on the documented
//! inputs, outputs and status codes. A hardware binding implements this with
//! the real instructions, tests with a scripted stub.

use sgx_arch::{Einittoken, ErrorCode, Pcmd, Secinfo, Secs, Sigstruct, PAGE_SIZE};

pub use epc_tracking::EpcAddr;

/// Failure of a privileged instruction: either a status code out of the
/// leaf, or a fault raised while executing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclsError {
    Status(ErrorCode),
    Faulted { trap: u8 },
}

impl EnclsError {
    /// A transient event that retry loops absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, EnclsError::Status(ErrorCode::UnmaskedEvent))
    }

    /// The write-back ordering violation that ETRACK (and, failing that, a
    /// cross-processor shootdown) resolves.
    pub fn is_not_tracked(&self) -> bool {
        matches!(self, EnclsError::Status(ErrorCode::NotTracked))
    }
}

pub type EnclsResult = core::result::Result<(), EnclsError>;

/// The privileged primitives over EPC pages. Operands are passed as the
/// typed structures the hardware defines plus the linear EPC addresses the
/// leaves take; status comes back as [`EnclsError`].
pub trait Encls: Send + Sync {
    /// Creates an enclave: initializes the SECS page at `target` from
    /// `secs`.
    fn ecreate(&self, secs: &Secs, target: EpcAddr) -> EnclsResult;

    /// Adds a page: copies `contents` into `target`, bound to enclave
    /// address `addr` with `secinfo`, as a child of the SECS at `secs`.
    fn eadd(
        &self,
        contents: &[u8; PAGE_SIZE],
        secinfo: &Secinfo,
        addr: u64,
        secs: EpcAddr,
        target: EpcAddr,
    ) -> EnclsResult;

    /// Extends the enclave measurement with the 256-byte chunk at `chunk`.
    fn eextend(&self, secs: EpcAddr, chunk: EpcAddr) -> EnclsResult;

    /// Initializes the enclave, validating `sigstruct` and `token` against
    /// the SECS and the launch-key hash.
    fn einit(
        &self,
        sigstruct: &Sigstruct,
        token: &Einittoken,
        secs: EpcAddr,
        pubkey_hash: &[u64; 4],
    ) -> EnclsResult;

    /// Blocks the page at `target` ahead of eviction.
    fn eblock(&self, target: EpcAddr) -> EnclsResult;

    /// Increments the tracking epoch of the enclave whose SECS is `secs`.
    fn etrack(&self, secs: EpcAddr) -> EnclsResult;

    /// Writes the blocked page at `target` back: ciphertext into
    /// `contents`, crypto metadata into `pcmd`, the version counter into
    /// the slot at `va_slot`.
    fn ewb(
        &self,
        contents: &mut [u8; PAGE_SIZE],
        pcmd: &mut Pcmd,
        target: EpcAddr,
        va_slot: EpcAddr,
    ) -> EnclsResult;

    /// Reloads an evicted page into `target` from its sealed `contents`,
    /// `pcmd` and version slot. Part of the collaborator contract; this
    /// version of the core never issues it (faults on evicted pages are
    /// bus errors).
    fn eldu(
        &self,
        contents: &[u8; PAGE_SIZE],
        pcmd: &Pcmd,
        addr: u64,
        secs: EpcAddr,
        target: EpcAddr,
        va_slot: EpcAddr,
    ) -> EnclsResult;

    /// Removes the page at `target` from its enclave.
    fn eremove(&self, target: EpcAddr) -> EnclsResult;

    /// Turns the page at `target` into a version-array page.
    fn epa(&self, target: EpcAddr) -> EnclsResult;
}

/// Failure of a leaf that indicates either a bug or memory corruption.
pub(crate) fn encls_warn(leaf: &str, err: &EnclsError) {
    log::warn!("{} returned {:?}", leaf, err);
}
