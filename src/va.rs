// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Version-array pages. Each is an EPC page holding 512 eight-byte sealing
//! slots; an enclave keeps them in insertion order and allocates slots from
//! the page at the head, rotating full pages to the tail.

use sgx_arch::{VA_SLOT_COUNT, VA_SLOT_SIZE};

use crate::encl::EpcPageRef;
use crate::encls::EpcAddr;

pub(crate) struct VaPage {
    epc: EpcPageRef,
    slots: [u64; VA_SLOT_COUNT / 64],
    used: usize,
}

impl VaPage {
    pub(crate) fn new(epc: EpcPageRef) -> Self {
        Self {
            epc,
            slots: [0; VA_SLOT_COUNT / 64],
            used: 0,
        }
    }

    pub(crate) fn epc(&self) -> &EpcPageRef {
        &self.epc
    }

    pub(crate) fn is_full(&self) -> bool {
        self.used == VA_SLOT_COUNT
    }

    /// Claims the first free slot, if any.
    pub(crate) fn alloc_slot(&mut self) -> Option<u16> {
        for (word_idx, word) in self.slots.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            *word |= 1u64 << bit;
            self.used += 1;
            return Some((word_idx * 64 + bit) as u16);
        }
        None
    }

    /// Returns the linear address of `slot` for the write-back operand.
    pub(crate) fn slot_addr(&self, slot: u16) -> EpcAddr {
        self.epc.addr().offset(slot as u64 * VA_SLOT_SIZE as u64)
    }
}
