// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The address-space side of the core: the collaborator trait the host OS
//! implements per process, the attachment records tying address spaces to an
//! enclave, and the fault entry point.

use std::sync::{Arc, Weak};

use sync::SpinMutex;

use crate::encl::Encl;

/// A set of CPUs, used to record where enclave threads may have run so the
/// write-back slow path can force them out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn single(cpu: u32) -> Self {
        Self(1u64 << (cpu % 64))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Accumulates `other` into `self`.
    pub fn union(&mut self, other: CpuMask) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

/// Shape of the mapping found at an address, as reported by the
/// address-space layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmRegion {
    pub start: u64,
    pub end: u64,
    /// Page offset of the mapping into its backing object.
    pub offset: u64,
}

/// Resolution of an enclave-range fault, in the host's terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmFault {
    /// The frame was installed; no page-cache page is involved.
    NoPage,
    /// The page is in flight through the reclaimer; the access should be
    /// retried.
    Retry,
    /// The access cannot be serviced.
    Sigbus,
}

/// One attached address space, implemented by the host OS layer.
pub trait AddressSpace: Send + Sync {
    /// Looks up the mapping containing `addr`, if any.
    fn find_region(&self, addr: u64) -> Option<VmRegion>;

    /// Removes the page-table entries covering `[start, start + len)` so
    /// subsequent accesses fault.
    fn zap(&self, start: u64, len: u64);

    /// Tests and clears the accessed bit on the page-table entry for
    /// `addr`. Returns whether the bit was set.
    fn test_and_clear_young(&self, addr: u64) -> bool;

    /// Installs the physical frame `pfn` at `addr`. Returns false when the
    /// entry cannot be installed.
    fn insert_pfn(&self, addr: u64, pfn: u64) -> bool;

    /// The CPUs this address space has run on.
    fn cpu_mask(&self) -> CpuMask;
}

/// The cross-processor barrier used by the write-back slow path: any
/// mechanism that synchronously forces enclave threads on the given CPUs to
/// exit satisfies the contract.
pub trait CpuShootdown: Send + Sync {
    fn force_exit(&self, cpus: CpuMask);
}

/// An attachment between one address space and one enclave. Created when a
/// process maps the enclave range; the mapping keeps the `Arc` (and with it
/// one enclave reference) alive until it is unmapped.
pub struct EnclMm {
    pub(crate) encl: Arc<Encl>,
    pub(crate) ops: Arc<dyn AddressSpace>,
}

impl EnclMm {
    /// Returns the enclave this attachment belongs to.
    pub fn encl(&self) -> &Arc<Encl> {
        &self.encl
    }

    /// Services a fault at `addr` within the enclave range.
    pub fn fault(&self, addr: u64) -> VmFault {
        self.encl.fault(self, addr)
    }
}

/// The per-enclave list of attachments. Entries are weak: the mapping owns
/// its attachment, the list only observes it. The lock covers brief list
/// edits; iteration upgrades one entry at a time so a concurrent unmap can
/// proceed, and stale entries are pruned as they are found.
pub(crate) struct MmList {
    entries: SpinMutex<Vec<Weak<EnclMm>>>,
}

impl MmList {
    pub(crate) fn new() -> Self {
        Self {
            entries: SpinMutex::new(Vec::new()),
        }
    }

    pub(crate) fn attach(&self, mm: Weak<EnclMm>) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.strong_count() > 0);
        entries.push(mm);
    }

    /// Walks the live attachments. `f` returning false stops the walk. The
    /// list lock is not held while `f` runs.
    pub(crate) fn for_each<F: FnMut(&Arc<EnclMm>) -> bool>(&self, mut f: F) {
        let mut idx = 0;
        loop {
            let next = {
                let mut entries = self.entries.lock();
                loop {
                    match entries.get(idx) {
                        None => break None,
                        Some(weak) => match weak.upgrade() {
                            Some(mm) => break Some(mm),
                            // The attachment went away under us; drop the
                            // stale entry and look at its successor.
                            None => {
                                entries.remove(idx);
                            }
                        },
                    }
                }
            };
            let mm = match next {
                Some(mm) => mm,
                None => return,
            };
            if !f(&mm) {
                return;
            }
            idx += 1;
        }
    }
}
