// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # EPC page tracking
//!
//! ## Key types
//!
//! - `EpcMap` - the firmware-described layout of EPC sections, built with
//!   `EpcMapBuilder` before anything else runs.
//! - `EpcPageDesc` - one descriptor per EPC page: its addresses, flags, an
//!   owner back-reference and a location tag recording which list (if any)
//!   currently holds the page.
//! - `EpcPool` - the allocator over all sections plus the global reclaimable
//!   list and the watermark plumbing between allocator and reclaimer.
//!
//! The pool is generic over the owner back-reference type so that the
//! enclave layer above can hang its own weak reference off every page
//! without this crate knowing about enclaves.
//!
//! ## Initialization
//!
//! `EpcMapBuilder` -> `EpcMap` -> `EpcPool`

/// The firmware EPC section map.
mod map;
/// Per-page descriptors.
mod page;
/// The allocator, reclaim list and watermarks.
mod pool;

pub use map::Error as MapError;
pub use map::Result as MapResult;
pub use map::{EpcMap, EpcMapBuilder, EpcRegion, MAX_EPC_SECTIONS};
pub use page::{EpcAddr, EpcPageDesc, EpcPageFlags};
pub use pool::Error as PoolError;
pub use pool::Result as PoolResult;
pub use pool::{EpcPool, TryFree, NR_HIGH_PAGES, NR_LOW_PAGES, NR_TO_SCAN};
