// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use core::result;
use sgx_arch::PAGE_SIZE;

/// The hardware defines at most eight EPC sections.
pub const MAX_EPC_SECTIONS: usize = 8;

type RegionVec = ArrayVec<EpcRegion, MAX_EPC_SECTIONS>;

/// Errors that can be raised while building the EPC map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Section base or size is not page aligned.
    UnalignedSection,
    /// Section has zero size.
    EmptySection,
    /// Section overlaps another one, physically or in the mapping.
    OverlappingSection,
    /// More sections than the hardware can describe.
    OutOfSpace,
}

/// Holds the result of EPC map operations.
pub type Result<T> = result::Result<T, Error>;

/// One firmware-described EPC section: a contiguous range of EPC pages with
/// its physical base and the linear base at which the range is mapped for
/// the privileged instructions.
#[derive(Clone, Copy, Debug)]
pub struct EpcRegion {
    phys_base: u64,
    virt_base: u64,
    size: u64,
}

impl EpcRegion {
    /// Returns the physical base address of the section.
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Returns the linear base address of the section mapping.
    pub fn virt_base(&self) -> u64 {
        self.virt_base
    }

    /// Returns the total size of the section in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of EPC pages in the section.
    pub fn pages(&self) -> usize {
        (self.size / PAGE_SIZE as u64) as usize
    }
}

/// The raw layout of EPC as enumerated from firmware. Configuring this
/// correctly is critical: every page the pool hands out is carved from these
/// ranges.
#[derive(Default)]
pub struct EpcMap {
    regions: RegionVec,
}

impl EpcMap {
    /// Returns an iterator over the sections in enumeration order.
    pub fn regions(&self) -> impl ExactSizeIterator<Item = &EpcRegion> {
        self.regions.iter()
    }
}

/// A builder for an `EpcMap`. Call `add_section()` once per firmware-
/// enumerated section.
pub struct EpcMapBuilder {
    inner: EpcMap,
}

impl EpcMapBuilder {
    pub fn new() -> Self {
        Self {
            inner: EpcMap::default(),
        }
    }

    /// Adds a section with the given physical base, linear mapping base and
    /// size.
    pub fn add_section(mut self, phys_base: u64, virt_base: u64, size: u64) -> Result<Self> {
        let page = PAGE_SIZE as u64;
        if phys_base % page != 0 || virt_base % page != 0 || size % page != 0 {
            return Err(Error::UnalignedSection);
        }
        if size == 0 {
            return Err(Error::EmptySection);
        }
        let overlaps = |base: u64, other: u64, other_size: u64| {
            base < other + other_size && other < base + size
        };
        for r in self.inner.regions() {
            if overlaps(phys_base, r.phys_base, r.size) || overlaps(virt_base, r.virt_base, r.size)
            {
                return Err(Error::OverlappingSection);
            }
        }
        self.inner
            .regions
            .try_push(EpcRegion {
                phys_base,
                virt_base,
                size,
            })
            .map_err(|_| Error::OutOfSpace)?;
        Ok(self)
    }

    pub fn build(self) -> EpcMap {
        self.inner
    }
}

impl Default for EpcMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}
