// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;
use sgx_arch::PAGE_SHIFT;
use sync::SpinMutex;

bitflags! {
    /// Flags carried by an EPC page descriptor.
    ///
    /// RECLAIMABLE is set while the page is a candidate for eviction. The
    /// flag alone does not say which list holds the page: a page can be off
    /// the reclaim list, still flagged, while the reclaimer is processing a
    /// batch; that combination is what the deferred-free contract keys on.
    pub struct EpcPageFlags: u8 {
        const RECLAIMABLE = 0x1;
    }
}

/// Linear address of an EPC page (or of an offset within one) in a section
/// mapping. This is the operand form the privileged instructions take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EpcAddr(u64);

impl EpcAddr {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw linear address.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Returns the address displaced by `off` bytes, for sub-page operands
    /// (EEXTEND chunks, version-array slots).
    pub fn offset(&self, off: u64) -> Self {
        Self(self.0 + off)
    }
}

/// Which container currently holds a page. Stands in for the original's
/// intrusive list membership: a page is on at most one list at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageLoc {
    /// On its section's free list.
    FreeList,
    /// On the global reclaimable list.
    ReclaimList,
    /// Held by an owner (or in flight through the reclaimer).
    Owned,
}

pub(crate) struct PageState<O> {
    pub(crate) flags: EpcPageFlags,
    pub(crate) loc: PageLoc,
    pub(crate) owner: Option<O>,
}

/// Descriptor for one EPC page. Descriptors are created when the pool is
/// built and live as long as the pool; everything else passes `Arc`s to
/// them around.
pub struct EpcPageDesc<O> {
    pub(crate) section: usize,
    pub(crate) index: usize,
    phys: u64,
    addr: EpcAddr,
    pub(crate) state: SpinMutex<PageState<O>>,
}

impl<O: Clone> EpcPageDesc<O> {
    pub(crate) fn new(section: usize, index: usize, phys: u64, addr: EpcAddr) -> Self {
        Self {
            section,
            index,
            phys,
            addr,
            state: SpinMutex::new(PageState {
                flags: EpcPageFlags::empty(),
                loc: PageLoc::FreeList,
                owner: None,
            }),
        }
    }

    /// Returns the linear address of the page.
    pub fn addr(&self) -> EpcAddr {
        self.addr
    }

    /// Returns the physical frame number of the page.
    pub fn pfn(&self) -> u64 {
        self.phys >> PAGE_SHIFT
    }

    /// Returns the index of the owning section.
    pub fn section(&self) -> usize {
        self.section
    }

    /// Returns a clone of the owner back-reference, if the page is bound.
    pub fn owner(&self) -> Option<O> {
        self.state.lock().owner.clone()
    }

    /// Returns whether the page is currently flagged reclaimable.
    pub fn is_reclaimable(&self) -> bool {
        self.state.lock().flags.contains(EpcPageFlags::RECLAIMABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_accessors() {
        let desc: EpcPageDesc<u32> = EpcPageDesc::new(1, 3, 0x8000_3000, EpcAddr::new(0x7000_3000));
        assert_eq!(desc.section(), 1);
        assert_eq!(desc.pfn(), 0x8000_3);
        assert_eq!(desc.addr().bits(), 0x7000_3000);
        assert_eq!(desc.addr().offset(0x100).bits(), 0x7000_3100);
        assert!(desc.owner().is_none());
        assert!(!desc.is_reclaimable());
    }
}
