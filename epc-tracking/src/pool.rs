// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use sgx_arch::PAGE_SIZE;
use sync::{SignalToken, SpinMutex, WaitQueue};

use crate::map::{EpcMap, MAX_EPC_SECTIONS};
use crate::page::{EpcAddr, EpcPageDesc, EpcPageFlags, PageLoc};

/// Pages taken off the reclaimable list per eviction batch.
pub const NR_TO_SCAN: usize = 16;
/// Free-page watermark below which reclaim is kicked eagerly.
pub const NR_LOW_PAGES: u64 = 32;
/// Free-page watermark at which the reclaimer stops working.
pub const NR_HIGH_PAGES: u64 = 64;

/// Errors related to EPC page allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Every section is exhausted and reclaim cannot make progress.
    OutOfMemory,
    /// A signal became pending while waiting for reclaim progress.
    Interrupted,
}

/// Holds the result of pool operations.
pub type Result<T> = result::Result<T, Error>;

/// Outcome of [`EpcPool::try_detach`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryFree {
    /// The page is exclusively the caller's again; it may be freed.
    Detached,
    /// The reclaimer holds the page (or it is already free); the caller must
    /// leave it alone.
    Deferred,
}

struct EpcSection<O> {
    pages: Vec<Arc<EpcPageDesc<O>>>,
    free: SpinMutex<Vec<usize>>,
    free_cnt: AtomicU64,
}

impl<O: Clone> EpcSection<O> {
    fn new(section: usize, phys_base: u64, virt_base: u64, count: usize) -> Self {
        let pages = (0..count)
            .map(|i| {
                let off = (i * PAGE_SIZE) as u64;
                Arc::new(EpcPageDesc::new(
                    section,
                    i,
                    phys_base + off,
                    EpcAddr::new(virt_base + off),
                ))
            })
            .collect();
        Self {
            pages,
            free: SpinMutex::new((0..count).rev().collect()),
            free_cnt: AtomicU64::new(count as u64),
        }
    }
}

/// The allocator over every EPC section plus the global reclaimable list.
///
/// Lock order, where held together: reclaim-list lock, then a page's state
/// lock; a section's free-list lock, then a page's state lock. The two list
/// locks are never held at once. `free_cnt` is only written under the
/// owning section's free-list lock but may be read lock-free; it is the
/// availability signal the watermark checks use.
pub struct EpcPool<O> {
    sections: ArrayVec<EpcSection<O>, MAX_EPC_SECTIONS>,
    cursor: AtomicUsize,
    reclaim: SpinMutex<VecDeque<Arc<EpcPageDesc<O>>>>,
    reclaimer_wq: WaitQueue,
    progress_wq: WaitQueue,
    stop: AtomicBool,
}

impl<O: Clone + Send + Sync> EpcPool<O> {
    /// Builds the pool from the firmware map. All pages start free.
    pub fn new(map: &EpcMap) -> Self {
        let mut sections = ArrayVec::new();
        for (i, region) in map.regions().enumerate() {
            sections.push(EpcSection::new(
                i,
                region.phys_base(),
                region.virt_base(),
                region.pages(),
            ));
        }
        Self {
            sections,
            cursor: AtomicUsize::new(0),
            reclaim: SpinMutex::new(VecDeque::new()),
            reclaimer_wq: WaitQueue::new(),
            progress_wq: WaitQueue::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// Returns the number of pages the pool was built with.
    pub fn total_pages(&self) -> u64 {
        self.sections.iter().map(|s| s.pages.len() as u64).sum()
    }

    /// Returns the current free-page count across all sections. Lock-free;
    /// the value may be stale by the time the caller acts on it.
    pub fn total_free(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.free_cnt.load(Ordering::Acquire))
            .sum()
    }

    fn try_alloc(&self, owner: &O) -> Option<Arc<EpcPageDesc<O>>> {
        let n = self.sections.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let section = &self.sections[(start + i) % n];
            let mut free = section.free.lock();
            let idx = match free.pop() {
                Some(idx) => idx,
                None => continue,
            };
            section.free_cnt.fetch_sub(1, Ordering::Release);
            let page = section.pages[idx].clone();
            let mut state = page.state.lock();
            debug_assert_eq!(state.loc, PageLoc::FreeList);
            state.loc = PageLoc::Owned;
            state.flags = EpcPageFlags::empty();
            state.owner = Some(owner.clone());
            drop(state);
            return Some(page);
        }
        None
    }

    /// Allocates a page, binding `owner` as its back-reference.
    ///
    /// On exhaustion: fails immediately when `may_reclaim` is false or when
    /// the reclaimable list is empty (nothing can make progress); otherwise
    /// wakes the reclaimer and blocks on its progress notifications,
    /// retrying after each wake-up. The wait is interruptible.
    pub fn alloc(
        &self,
        owner: O,
        may_reclaim: bool,
        signals: &SignalToken,
    ) -> Result<Arc<EpcPageDesc<O>>> {
        loop {
            if let Some(page) = self.try_alloc(&owner) {
                return Ok(page);
            }
            if !may_reclaim {
                return Err(Error::OutOfMemory);
            }
            if self.reclaim.lock().is_empty() {
                return Err(Error::OutOfMemory);
            }
            self.wake_reclaimer();
            self.progress_wq
                .wait_interruptible(signals, || {
                    self.total_free() > 0 || self.reclaim.lock().is_empty()
                })
                .map_err(|_| Error::Interrupted)?;
        }
    }

    /// Returns `page` to its section's free list. The caller must hold the
    /// page exclusively (detached, or never marked reclaimable) and must
    /// already have issued the hardware remove where one is needed.
    pub fn free(&self, page: &Arc<EpcPageDesc<O>>) {
        {
            let section = &self.sections[page.section];
            let mut free = section.free.lock();
            let mut state = page.state.lock();
            debug_assert_ne!(state.loc, PageLoc::FreeList);
            debug_assert!(!state.flags.contains(EpcPageFlags::RECLAIMABLE));
            state.owner = None;
            state.flags = EpcPageFlags::empty();
            state.loc = PageLoc::FreeList;
            free.push(page.index);
            section.free_cnt.fetch_add(1, Ordering::Release);
        }
        self.progress_wq.notify_all();
    }

    /// Marks `page` reclaimable and appends it to the reclaimable list.
    /// Kicks the reclaimer when free pages have dipped below the low
    /// watermark.
    pub fn mark_reclaimable(&self, page: &Arc<EpcPageDesc<O>>) {
        {
            let mut list = self.reclaim.lock();
            let mut state = page.state.lock();
            debug_assert_eq!(state.loc, PageLoc::Owned);
            state.flags.insert(EpcPageFlags::RECLAIMABLE);
            state.loc = PageLoc::ReclaimList;
            list.push_back(page.clone());
        }
        if self.total_free() < NR_LOW_PAGES {
            self.wake_reclaimer();
        }
    }

    /// Pops up to `max` pages from the head of the reclaimable list. The
    /// popped pages stay flagged RECLAIMABLE while off the list, which is
    /// how a concurrent owner free learns to defer to the reclaimer.
    pub fn take_batch(&self, max: usize) -> Vec<Arc<EpcPageDesc<O>>> {
        let mut list = self.reclaim.lock();
        let mut batch = Vec::with_capacity(max.min(list.len()));
        while batch.len() < max {
            let page = match list.pop_front() {
                Some(page) => page,
                None => break,
            };
            let mut state = page.state.lock();
            debug_assert_eq!(state.loc, PageLoc::ReclaimList);
            state.loc = PageLoc::Owned;
            drop(state);
            batch.push(page);
        }
        batch
    }

    /// Returns a batch page that failed the age test to the tail of the
    /// reclaimable list.
    pub fn return_to_tail(&self, page: &Arc<EpcPageDesc<O>>) {
        let mut list = self.reclaim.lock();
        let mut state = page.state.lock();
        debug_assert_eq!(state.loc, PageLoc::Owned);
        debug_assert!(state.flags.contains(EpcPageFlags::RECLAIMABLE));
        state.loc = PageLoc::ReclaimList;
        list.push_back(page.clone());
    }

    /// Clears RECLAIMABLE on a page the reclaimer holds, after eviction (or
    /// owner teardown) has resolved it.
    pub fn clear_reclaimable(&self, page: &Arc<EpcPageDesc<O>>) {
        let _list = self.reclaim.lock();
        let mut state = page.state.lock();
        debug_assert_eq!(state.loc, PageLoc::Owned);
        state.flags.remove(EpcPageFlags::RECLAIMABLE);
    }

    /// Attempts to take a page back from the reclaim machinery so its owner
    /// can free it. If the page sits on the reclaimable list it is detached
    /// and the caller owns it again; if the reclaimer has taken it off the
    /// list (or it is already free), the free is deferred to whoever holds
    /// it.
    pub fn try_detach(&self, page: &Arc<EpcPageDesc<O>>) -> TryFree {
        let mut list = self.reclaim.lock();
        let state = page.state.lock();
        match state.loc {
            PageLoc::ReclaimList => {
                drop(state);
                if let Some(pos) = list.iter().position(|p| Arc::ptr_eq(p, page)) {
                    list.remove(pos);
                }
                let mut state = page.state.lock();
                state.flags.remove(EpcPageFlags::RECLAIMABLE);
                state.loc = PageLoc::Owned;
                TryFree::Detached
            }
            PageLoc::Owned if state.flags.contains(EpcPageFlags::RECLAIMABLE) => TryFree::Deferred,
            PageLoc::Owned => TryFree::Detached,
            PageLoc::FreeList => TryFree::Deferred,
        }
    }

    /// Returns whether the reclaimable list is empty.
    pub fn reclaim_list_empty(&self) -> bool {
        self.reclaim.lock().is_empty()
    }

    /// The reclaimer's work predicate: free pages below the high watermark
    /// with candidates available.
    pub fn should_reclaim(&self) -> bool {
        self.total_free() < NR_HIGH_PAGES && !self.reclaim_list_empty()
    }

    /// Wakes the reclaimer task.
    pub fn wake_reclaimer(&self) {
        self.reclaimer_wq.notify_all();
    }

    /// Blocks the reclaimer until there is work or the pool is shutting
    /// down.
    pub fn reclaimer_wait(&self) {
        self.reclaimer_wq
            .wait_until(|| self.stopped() || self.should_reclaim());
    }

    /// Wakes allocator waiters after reclaim progress.
    pub fn notify_progress(&self) {
        self.progress_wq.notify_all();
    }

    /// Asks the reclaimer to stop and unblocks every waiter.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.reclaimer_wq.notify_all();
        self.progress_wq.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}
