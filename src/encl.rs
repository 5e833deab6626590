// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The enclave object: lifecycle flags, the address-to-page map mirrored by
//! a backing store, construction through the add-page queue, the bounded
//! EINIT retry loop, fault servicing and teardown.
//!
//! The enclave mutex serializes page-map mutation, flag transitions and the
//! hardware operations that need the enclave quiescent. The attachment list
//! has its own short-lived lock (see [`crate::mm`]).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bitflags::bitflags;
use sha2::{Digest, Sha256};

use epc_tracking::{EpcPageDesc, EpcPool, TryFree};
use sgx_arch::{
    ssa_frame_size, AttributesFlags, Einittoken, PageType, Pcmd, Secinfo, Secs, Sigstruct, Tcs,
    SECINFO_RESERVED_MASK, PAGE_SHIFT, PAGE_SIZE,
};
use sync::{SignalToken, WaitQueue};

use crate::backing::{pcmd_index, pcmd_offset, Backing};
use crate::driver::{EpcDriver, SgxCaps};
use crate::encls::{encls_warn, Encls, EnclsError};
use crate::mm::{AddressSpace, CpuMask, CpuShootdown, EnclMm, MmList, VmFault};
use crate::va::VaPage;
use crate::worker::{self, AddReq};
use crate::{Error, Result};

const EINIT_SPIN_COUNT: usize = 20;
const EINIT_SLEEP_COUNT: usize = 50;
const EINIT_SLEEP_TIME: Duration = Duration::from_millis(20);

/// Attribute bits an enclave may carry without further authorization.
const ALLOWED_ATTRIBUTES: u64 =
    AttributesFlags::DEBUG.bits() | AttributesFlags::MODE64BIT.bits();

bitflags! {
    /// Enclave lifecycle flags. DEAD is monotonic; INITIALIZED is set at
    /// most once, under the enclave lock, with DEAD clear.
    pub struct EnclFlags: u32 {
        const DEBUG       = 0x1;
        const INITIALIZED = 0x2;
        const DEAD        = 0x4;
        const SUSPEND     = 0x8;
    }
}

bitflags! {
    struct EnclPageFlags: u8 {
        const TCS       = 0x1;
        /// The page was selected for eviction; concurrent faults must back
        /// off until the write-back resolves.
        const RECLAIMED = 0x2;
    }
}

/// Owner back-reference hung off every EPC page the enclave holds. `addr`
/// is `None` for control pages (SECS, version arrays), which are never on
/// the reclaimable list.
#[derive(Clone)]
pub(crate) struct EnclPageOwner {
    pub(crate) encl: Weak<Encl>,
    pub(crate) addr: Option<u64>,
}

pub(crate) type EpcPageRef = Arc<EpcPageDesc<EnclPageOwner>>;
pub(crate) type EnclPool = EpcPool<EnclPageOwner>;

struct EnclPage {
    flags: EnclPageFlags,
    epc_page: Option<EpcPageRef>,
    /// The version-array page and slot sealing this page once evicted.
    va_slot: Option<(EpcPageRef, u16)>,
}

impl EnclPage {
    fn new() -> Self {
        Self {
            flags: EnclPageFlags::empty(),
            epc_page: None,
            va_slot: None,
        }
    }
}

pub(crate) struct EnclInner {
    flags: EnclFlags,
    /// Page index within the enclave range -> descriptor. Ordered so
    /// teardown and diagnostics walk pages in address order.
    pages: BTreeMap<u64, EnclPage>,
    secs_page: Option<EpcPageRef>,
    secs_child_cnt: u32,
    va_pages: VecDeque<VaPage>,
    add_reqs: VecDeque<AddReq>,
    worker_running: bool,
}

impl EnclInner {
    pub(crate) fn is_dead(&self) -> bool {
        self.flags.contains(EnclFlags::DEAD)
    }

    pub(crate) fn pop_add_req(&mut self) -> Option<AddReq> {
        self.add_reqs.pop_front()
    }

    pub(crate) fn set_worker_idle(&mut self) {
        self.worker_running = false;
    }
}

/// One enclave. Reference counted: the mapping, every pending add request,
/// the worker while draining, and the reclaimer while it touches any of the
/// enclave's pages each hold a reference; teardown runs when the last one
/// drops.
pub struct Encl {
    weak_self: Weak<Encl>,
    base: u64,
    size: u64,
    attributes: sgx_arch::Attributes,
    allowed_attributes: AtomicU64,
    backing: Arc<dyn Backing>,
    pool: Arc<EnclPool>,
    encls: Arc<dyn Encls>,
    shootdown: Arc<dyn CpuShootdown>,
    inner: Mutex<EnclInner>,
    mm_list: MmList,
    worker_wq: WaitQueue,
}

impl Encl {
    /// Creates an enclave from a validated SECS: establishes the backing
    /// store, allocates and initializes the SECS page, registers for power
    /// events and attaches the creating address space, whose mapping must
    /// already span exactly the enclave range at offset zero.
    pub fn create(
        driver: &Arc<EpcDriver>,
        secs: &Secs,
        mm: Arc<dyn AddressSpace>,
        signals: &SignalToken,
    ) -> Result<(Arc<Encl>, Arc<EnclMm>)> {
        validate_secs(driver.caps(), secs)?;

        let encl_size = secs.size + PAGE_SIZE as u64;
        let backing = driver
            .new_backing(encl_size + (encl_size >> 5))
            .map_err(|_| Error::Io)?;

        let encl = Arc::new_cyclic(|weak| Encl {
            weak_self: weak.clone(),
            base: secs.base,
            size: secs.size,
            attributes: secs.attributes,
            allowed_attributes: AtomicU64::new(ALLOWED_ATTRIBUTES),
            backing,
            pool: driver.pool().clone(),
            encls: driver.encls().clone(),
            shootdown: driver.shootdown().clone(),
            inner: Mutex::new(EnclInner {
                flags: EnclFlags::empty(),
                pages: BTreeMap::new(),
                secs_page: None,
                secs_child_cnt: 0,
                va_pages: VecDeque::new(),
                add_reqs: VecDeque::new(),
                worker_running: false,
            }),
            mm_list: MmList::new(),
            worker_wq: WaitQueue::new(),
        });

        let secs_epc = encl
            .pool
            .alloc(encl.page_owner(None), true, signals)?;
        {
            let mut inner = encl.inner_lock();
            inner.secs_page = Some(secs_epc.clone());
            if secs.attributes.flags.contains(AttributesFlags::DEBUG) {
                inner.flags.insert(EnclFlags::DEBUG);
            }
        }
        // On failure the enclave drops here and release frees the page.
        match encl.encls.ecreate(secs, secs_epc.addr()) {
            Ok(()) => {}
            Err(EnclsError::Faulted { trap }) => {
                log::warn!("ECREATE faulted with trap {}", trap);
                return Err(Error::HardwareFault);
            }
            Err(EnclsError::Status(code)) => {
                log::debug!("ECREATE returned {:?}", code);
                return Err(Error::HardwareStatus(code));
            }
        }

        driver.pm().register(Arc::downgrade(&encl));

        let region = mm.find_region(secs.base).ok_or(Error::InvalidArgument)?;
        if region.start != secs.base
            || region.end != secs.base + secs.size
            || region.offset != 0
        {
            return Err(Error::InvalidArgument);
        }
        let attachment = encl.attach(mm);
        Ok((encl, attachment))
    }

    /// Attaches an address space that has mapped the enclave range. The
    /// returned record keeps the enclave referenced for the lifetime of the
    /// mapping.
    pub fn attach(self: &Arc<Self>, ops: Arc<dyn AddressSpace>) -> Arc<EnclMm> {
        let mm = Arc::new(EnclMm {
            encl: self.clone(),
            ops,
        });
        self.mm_list.attach(Arc::downgrade(&mm));
        mm
    }

    /// Validates and stages one page: the content goes to the backing
    /// store, the descriptor into the page map, and the hardware add is
    /// queued for the worker.
    pub fn add_page(
        self: &Arc<Self>,
        addr: u64,
        data: &[u8; PAGE_SIZE],
        secinfo: &Secinfo,
        mrmask: u16,
    ) -> Result<()> {
        let page_type = validate_secinfo(secinfo)?;
        if page_type == PageType::Tcs {
            let tcs = Tcs::try_copy_from(data).ok_or(Error::InvalidArgument)?;
            self.validate_tcs(&tcs)?;
        }
        if addr % PAGE_SIZE as u64 != 0 || addr < self.base || addr >= self.base + self.size {
            return Err(Error::InvalidArgument);
        }

        let mut spawn_worker = false;
        {
            let mut inner = self.inner_lock();
            if inner.flags.contains(EnclFlags::SUSPEND) {
                return Err(Error::PowerLost);
            }
            if inner.flags.contains(EnclFlags::DEAD) {
                return Err(Error::Dead);
            }
            if inner.flags.contains(EnclFlags::INITIALIZED) {
                return Err(Error::InvalidArgument);
            }
            let index = self.page_index(addr);
            if inner.pages.contains_key(&index) {
                return Err(Error::Duplicate);
            }
            self.backing.write_page(index, data).map_err(|_| Error::Io)?;

            let mut page = EnclPage::new();
            if page_type == PageType::Tcs {
                page.flags.insert(EnclPageFlags::TCS);
            }
            inner.pages.insert(index, page);
            inner.add_reqs.push_back(AddReq {
                encl: self.clone(),
                addr,
                secinfo: secinfo.clone(),
                mrmask,
            });
            if !inner.worker_running {
                inner.worker_running = true;
                spawn_worker = true;
            }
        }
        if spawn_worker {
            if let Err(err) = worker::spawn(self) {
                log::error!("failed to start add-page worker: {}", err);
                let mut inner = self.inner_lock();
                inner.worker_running = false;
                // Drop the queue now; each entry holds an enclave
                // reference that no worker will ever retire.
                inner.add_reqs.clear();
                self.destroy_locked(&mut inner);
                return Err(Error::Io);
            }
        }
        Ok(())
    }

    /// Initializes the enclave: checks the attribute ceiling, derives the
    /// signer hash, drains the construction queue, then runs the bounded
    /// EINIT retry loop under the enclave lock.
    pub fn init(
        &self,
        sigstruct: &Sigstruct,
        token: &Einittoken,
        signals: &SignalToken,
    ) -> Result<()> {
        if self.attributes.flags.bits() & !self.allowed_attributes.load(Ordering::Acquire) != 0 {
            return Err(Error::InvalidArgument);
        }

        let digest = Sha256::digest(sigstruct.modulus);
        let mut pubkey_hash = [0u64; 4];
        for (word, chunk) in pubkey_hash.iter_mut().zip(digest.chunks_exact(8)) {
            // Unwrap ok: chunks_exact yields 8-byte slices.
            *word = u64::from_le_bytes(chunk.try_into().unwrap());
        }

        self.flush_work();

        let mut inner = self.inner_lock();
        if inner.flags.contains(EnclFlags::SUSPEND) {
            return Err(Error::PowerLost);
        }
        if inner.flags.contains(EnclFlags::INITIALIZED) {
            return Ok(());
        }
        if inner.flags.contains(EnclFlags::DEAD) {
            return Err(Error::Dead);
        }
        let secs_addr = match &inner.secs_page {
            Some(secs) => secs.addr(),
            None => return Err(Error::Dead),
        };

        let mut res = Ok(());
        for _ in 0..EINIT_SLEEP_COUNT {
            for _ in 0..EINIT_SPIN_COUNT {
                res = self
                    .encls
                    .einit(sigstruct, token, secs_addr, &pubkey_hash);
                match &res {
                    Err(err) if err.is_transient() => continue,
                    _ => break,
                }
            }
            match &res {
                Err(err) if err.is_transient() => {}
                _ => break,
            }
            signals
                .sleep_interruptible(EINIT_SLEEP_TIME)
                .map_err(|_| Error::Interrupted)?;
        }

        match res {
            Ok(()) => {
                inner.flags.insert(EnclFlags::INITIALIZED);
                Ok(())
            }
            Err(EnclsError::Faulted { trap }) => {
                log::warn!("EINIT faulted with trap {}", trap);
                self.destroy_locked(&mut inner);
                Err(Error::HardwareFault)
            }
            Err(EnclsError::Status(code)) => {
                log::debug!("EINIT returned {:?}", code);
                Err(Error::HardwareStatus(code))
            }
        }
    }

    /// Raises the attribute ceiling checked at init. Repeated calls with
    /// the same bits are no-ops.
    pub fn set_allowed_attribute(&self, attributes: u64) {
        self.allowed_attributes.fetch_or(attributes, Ordering::AcqRel);
    }

    /// Returns the enclave base address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the enclave size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns a snapshot of the lifecycle flags.
    pub fn flags(&self) -> EnclFlags {
        self.inner_lock().flags
    }

    pub fn is_initialized(&self) -> bool {
        self.flags().contains(EnclFlags::INITIALIZED)
    }

    /// Services a fault at `addr` raised through attachment `mm`.
    pub(crate) fn fault(&self, mm: &EnclMm, addr: u64) -> VmFault {
        let page_addr = addr & !(PAGE_SIZE as u64 - 1);
        let inner = self.inner_lock();
        if inner.flags.contains(EnclFlags::DEAD)
            || !inner.flags.contains(EnclFlags::INITIALIZED)
        {
            return VmFault::Sigbus;
        }
        if page_addr < self.base || page_addr >= self.base + self.size {
            return VmFault::Sigbus;
        }
        let entry = match inner.pages.get(&self.page_index(page_addr)) {
            Some(entry) => entry,
            None => return VmFault::Sigbus,
        };
        if entry.flags.contains(EnclPageFlags::RECLAIMED) {
            return VmFault::Retry;
        }
        match &entry.epc_page {
            Some(page) => {
                if mm.ops.insert_pfn(page_addr, page.pfn()) {
                    VmFault::NoPage
                } else {
                    VmFault::Sigbus
                }
            }
            None => {
                // Evicted; the reload path is not wired in this version.
                if entry.va_slot.is_some() {
                    log::debug!("fault on evicted page {:#x}", page_addr);
                }
                VmFault::Sigbus
            }
        }
    }

    /// Performs the queued hardware add for one request, under the enclave
    /// lock. On success the page is bound, counted and made reclaimable.
    pub(crate) fn process_add_req(
        &self,
        inner: &mut EnclInner,
        req: &AddReq,
        epc_page: &EpcPageRef,
    ) -> Result<()> {
        if inner.flags.intersects(EnclFlags::SUSPEND | EnclFlags::DEAD) {
            return Err(Error::Dead);
        }
        let index = self.page_index(req.addr);
        let mut contents = [0u8; PAGE_SIZE];
        self.backing
            .read_page(index, &mut contents)
            .map_err(|_| Error::Io)?;
        let secs_addr = match &inner.secs_page {
            Some(secs) => secs.addr(),
            None => return Err(Error::Dead),
        };

        self.encls
            .eadd(&contents, &req.secinfo, req.addr, secs_addr, epc_page.addr())
            .map_err(|err| {
                encls_warn("EADD", &err);
                Error::HardwareFault
            })?;

        for i in 0..16u64 {
            if req.mrmask & (1 << i) == 0 {
                continue;
            }
            self.encls
                .eextend(secs_addr, epc_page.addr().offset(i * 0x100))
                .map_err(|err| {
                    encls_warn("EEXTEND", &err);
                    Error::HardwareFault
                })?;
        }

        let entry = inner.pages.get_mut(&index).ok_or(Error::Dead)?;
        entry.epc_page = Some(epc_page.clone());
        inner.secs_child_cnt += 1;
        self.pool.mark_reclaimable(epc_page);
        Ok(())
    }

    /// Marks the enclave dead and frees every resident page. Pages the
    /// reclaimer holds in flight are left to it; their bindings resolve
    /// when the batch completes.
    pub(crate) fn destroy_locked(&self, inner: &mut EnclInner) {
        inner.flags.insert(EnclFlags::DEAD);

        let mut freed: u32 = 0;
        for entry in inner.pages.values_mut() {
            let page = match &entry.epc_page {
                Some(page) => page.clone(),
                None => continue,
            };
            match self.pool.try_detach(&page) {
                TryFree::Detached => {
                    self.epc_free(&page);
                    entry.epc_page = None;
                    freed += 1;
                }
                TryFree::Deferred => {}
            }
        }
        inner.secs_child_cnt -= freed;

        if inner.secs_child_cnt == 0 {
            if let Some(secs) = inner.secs_page.take() {
                self.epc_free(&secs);
            }
        }
    }

    /// Suspend/hibernate preparation: the protected contents will not
    /// survive, so tear the pages down now and poison the handle.
    pub(crate) fn power_lost(&self) {
        {
            let mut inner = self.inner_lock();
            self.destroy_locked(&mut inner);
            inner.flags.insert(EnclFlags::SUSPEND);
        }
        self.flush_work();
    }

    /// Blocks until the construction queue is drained and the worker idle.
    pub(crate) fn flush_work(&self) {
        self.worker_wq.wait_until(|| {
            let inner = self.inner_lock();
            inner.add_reqs.is_empty() && !inner.worker_running
        });
    }

    pub(crate) fn notify_worker_idle(&self) {
        self.worker_wq.notify_all();
    }

    // ---- reclaimer entry points ----------------------------------------

    /// Phase 2: ages the page at `addr`. Returns whether it should be
    /// evicted. A recently-accessed mapping vetoes eviction; a dead enclave
    /// short-circuits straight to it.
    pub(crate) fn reclaimer_age(&self, addr: u64) -> bool {
        let mut young = false;
        let mut dead = false;
        self.mm_list.for_each(|mm| {
            let inner = self.inner_lock();
            if inner.flags.contains(EnclFlags::DEAD) {
                dead = true;
                return false;
            }
            if mm.ops.test_and_clear_young(addr) {
                young = true;
                return false;
            }
            true
        });

        let mut inner = self.inner_lock();
        if inner.flags.contains(EnclFlags::DEAD) {
            dead = true;
        }
        if young && !dead {
            return false;
        }
        if let Some(entry) = inner.pages.get_mut(&self.page_index(addr)) {
            entry.flags.insert(EnclPageFlags::RECLAIMED);
        }
        true
    }

    /// Phase 3: zaps the page-table entries for `addr` in every attachment,
    /// then blocks the page. The zap must precede the block, and both must
    /// precede the write-back.
    pub(crate) fn reclaimer_block(&self, page: &EpcPageRef, addr: u64) {
        self.mm_list.for_each(|mm| {
            if mm.ops.find_region(addr).is_some() {
                mm.ops.zap(addr, PAGE_SIZE as u64);
            }
            true
        });

        let inner = self.inner_lock();
        if !inner.flags.contains(EnclFlags::DEAD) {
            if let Err(err) = self.encls.eblock(page.addr()) {
                encls_warn("EBLOCK", &err);
            }
        }
    }

    /// Phase 4: writes the page back (or removes it from a dead enclave),
    /// clears the binding and settles the child count. The last child of a
    /// dead or initialized enclave takes the SECS with it.
    pub(crate) fn reclaimer_write(&self, page: &EpcPageRef, addr: u64) {
        let mut inner = self.inner_lock();
        let index = self.page_index(addr);

        if let Some(entry) = inner.pages.get_mut(&index) {
            entry.flags.remove(EnclPageFlags::RECLAIMED);
        }

        if inner.flags.contains(EnclFlags::DEAD) {
            if let Err(err) = self.encls.eremove(page.addr()) {
                encls_warn("EREMOVE", &err);
            }
        } else {
            self.encl_ewb(&mut inner, page, Some(addr));
        }
        if let Some(entry) = inner.pages.get_mut(&index) {
            entry.epc_page = None;
        }
        inner.secs_child_cnt -= 1;

        if inner.secs_child_cnt == 0
            && inner
                .flags
                .intersects(EnclFlags::DEAD | EnclFlags::INITIALIZED)
        {
            if let Some(secs) = inner.secs_page.take() {
                if inner.flags.contains(EnclFlags::DEAD) {
                    self.epc_free(&secs);
                } else {
                    self.encl_ewb(&mut inner, &secs, None);
                    self.pool.free(&secs);
                }
            }
        }
    }

    /// Seals one page out to the backing store: version slot, EWB with the
    /// track-and-shootdown retries, then content and PCMD writes. `addr` is
    /// `None` for the SECS. Persistent failure is logged and the content
    /// dropped; bookkeeping stays consistent either way.
    fn encl_ewb(&self, inner: &mut EnclInner, page: &EpcPageRef, addr: Option<u64>) {
        let mut cpus = CpuMask::empty();
        self.mm_list.for_each(|mm| {
            cpus.union(mm.ops.cpu_mask());
            true
        });

        let (va_page, slot) = match self.alloc_va_slot(inner) {
            Some(slot) => slot,
            None => {
                log::error!("no version-array slot for evicted page; content dropped");
                return;
            }
        };
        let va_addr = va_page.addr().offset(slot as u64 * sgx_arch::VA_SLOT_SIZE as u64);

        let mut contents = [0u8; PAGE_SIZE];
        let mut pcmd = Pcmd::default();
        let mut res = self
            .encls
            .ewb(&mut contents, &mut pcmd, page.addr(), va_addr);
        if res.as_ref().err().map_or(false, EnclsError::is_not_tracked) {
            if let Some(secs) = &inner.secs_page {
                if let Err(err) = self.encls.etrack(secs.addr()) {
                    encls_warn("ETRACK", &err);
                }
            }
            res = self
                .encls
                .ewb(&mut contents, &mut pcmd, page.addr(), va_addr);
            if res.as_ref().err().map_or(false, EnclsError::is_not_tracked) {
                // Slow path: some CPU is still executing in the enclave.
                self.shootdown.force_exit(cpus);
                res = self
                    .encls
                    .ewb(&mut contents, &mut pcmd, page.addr(), va_addr);
            }
        }
        if let Err(err) = res {
            encls_warn("EWB", &err);
            return;
        }

        let index = match addr {
            Some(addr) => self.page_index(addr),
            None => self.secs_index(),
        };
        if let Err(err) = self.backing.write_page(index, &contents) {
            log::error!("backing write for evicted page failed: {}", err);
            return;
        }
        let pcmd_off = (pcmd_index(self.size, index) << PAGE_SHIFT) + pcmd_offset(index);
        if let Err(err) = self.backing.write_at(pcmd_off, pcmd.as_ref()) {
            log::error!("backing write for page metadata failed: {}", err);
            return;
        }
        if let Some(addr) = addr {
            if let Some(entry) = inner.pages.get_mut(&self.page_index(addr)) {
                entry.va_slot = Some((va_page, slot));
            }
        }
    }

    /// Takes a sealing slot, appending a fresh version-array page when the
    /// head is full. Full pages rotate to the tail.
    fn alloc_va_slot(&self, inner: &mut EnclInner) -> Option<(EpcPageRef, u16)> {
        let need_new = inner.va_pages.front().map_or(true, VaPage::is_full);
        if need_new {
            // Never reclaim from inside the reclaimer.
            let epc = self
                .pool
                .alloc(self.page_owner(None), false, &SignalToken::new())
                .ok()?;
            if let Err(err) = self.encls.epa(epc.addr()) {
                encls_warn("EPA", &err);
                self.pool.free(&epc);
                return None;
            }
            inner.va_pages.push_front(VaPage::new(epc));
        }
        let va = inner.va_pages.front_mut()?;
        let slot = va.alloc_slot()?;
        let page = va.epc().clone();
        if va.is_full() {
            if let Some(full) = inner.va_pages.pop_front() {
                inner.va_pages.push_back(full);
            }
        }
        Some((page, slot))
    }

    // ---- helpers --------------------------------------------------------

    pub(crate) fn inner_lock(&self) -> MutexGuard<'_, EnclInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn pool(&self) -> &Arc<EnclPool> {
        &self.pool
    }

    pub(crate) fn page_owner(&self, addr: Option<u64>) -> EnclPageOwner {
        EnclPageOwner {
            encl: self.weak_self.clone(),
            addr,
        }
    }

    /// Removes `page` from the hardware and returns it to its section. For
    /// pages the write-back already pulled out of the EPC, free through the
    /// pool directly instead.
    pub(crate) fn epc_free(&self, page: &EpcPageRef) {
        if let Err(err) = self.encls.eremove(page.addr()) {
            encls_warn("EREMOVE", &err);
        }
        self.pool.free(page);
    }

    /// Converts an address in the enclave range to its backing-slot index.
    fn page_index(&self, addr: u64) -> u64 {
        (addr - self.base) >> PAGE_SHIFT
    }

    /// The SECS backing slot sits after all enclave pages.
    fn secs_index(&self) -> u64 {
        self.size >> PAGE_SHIFT
    }

    fn validate_tcs(&self, tcs: &Tcs) -> Result<()> {
        // All TCS flags, DBGOPTIN included, are refused from user space.
        if !tcs.flags.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let offset_ok = |offset: u64| offset % PAGE_SIZE as u64 == 0 && offset < self.size;
        if !offset_ok(tcs.ssa_offset) || !offset_ok(tcs.fs_offset) || !offset_ok(tcs.gs_offset) {
            return Err(Error::InvalidArgument);
        }
        if tcs.fs_limit & 0xFFF != 0xFFF || tcs.gs_limit & 0xFFF != 0xFFF {
            return Err(Error::InvalidArgument);
        }
        if tcs.reserved.iter().any(|&b| b != 0) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Drop for Encl {
    fn drop(&mut self) {
        // Last reference: pending requests, attachments and in-flight
        // reclaim batches each held one, so the queue is drained and every
        // deferred page has been resolved by now.
        let mut inner = self.inner.lock().unwrap();
        self.destroy_locked(&mut inner);
        // Version arrays live until release so sealed pages kept their
        // slots.
        while let Some(va) = inner.va_pages.pop_front() {
            self.epc_free(va.epc());
        }
        if inner.secs_child_cnt != 0 {
            log::warn!(
                "enclave released with {} children outstanding",
                inner.secs_child_cnt
            );
        }
    }
}

/// Checks the SECS shape and feature selection against the platform
/// capabilities.
pub(crate) fn validate_secs(caps: &SgxCaps, secs: &Secs) -> Result<()> {
    let page = PAGE_SIZE as u64;
    if secs.size < 2 * page || !secs.size.is_power_of_two() {
        return Err(Error::InvalidArgument);
    }
    if secs.base & (secs.size - 1) != 0 {
        return Err(Error::InvalidArgument);
    }
    if secs.miscselect.bits() & caps.miscselect_reserved_mask != 0
        || secs.attributes.flags.bits() & caps.attributes_reserved_mask != 0
        || secs.attributes.xfrm & caps.xfrm_reserved_mask != 0
    {
        return Err(Error::InvalidArgument);
    }
    if secs.attributes.flags.contains(AttributesFlags::MODE64BIT) {
        if secs.size > caps.encl_size_max_64 {
            return Err(Error::InvalidArgument);
        }
    } else if secs.size > caps.encl_size_max_32 {
        return Err(Error::InvalidArgument);
    }
    let xfrm = secs.attributes.xfrm;
    if xfrm & sgx_arch::XFRM_FP == 0
        || xfrm & sgx_arch::XFRM_SSE == 0
        || ((xfrm >> 3) & 1) != ((xfrm >> 4) & 1)
    {
        return Err(Error::InvalidArgument);
    }
    if secs.ssa_frame_size == 0
        || ssa_frame_size(secs.miscselect, xfrm) > secs.ssa_frame_size
    {
        return Err(Error::InvalidArgument);
    }
    if secs.reserved1.iter().any(|&b| b != 0)
        || secs.reserved2.iter().any(|&b| b != 0)
        || secs.reserved3.iter().any(|&b| b != 0)
        || secs.reserved4.iter().any(|&b| b != 0)
    {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Checks a user-supplied SECINFO: reserved bits clear, writable implies
/// readable, and a page type an add may carry.
pub(crate) fn validate_secinfo(secinfo: &Secinfo) -> Result<PageType> {
    let bits = secinfo.flags.bits();
    if bits & SECINFO_RESERVED_MASK != 0 {
        return Err(Error::InvalidArgument);
    }
    if bits & sgx_arch::SecinfoFlags::W.bits() != 0 && bits & sgx_arch::SecinfoFlags::R.bits() == 0
    {
        return Err(Error::InvalidArgument);
    }
    if secinfo.reserved.iter().any(|&b| b != 0) {
        return Err(Error::InvalidArgument);
    }
    match PageType::from_repr(secinfo.flags.page_type()) {
        Some(pt @ (PageType::Reg | PageType::Tcs | PageType::Trim)) => Ok(pt),
        _ => Err(Error::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgx_arch::{Miscselect, SecinfoFlags};

    fn stub_secs(size: u64, base: u64) -> Secs {
        let mut secs = Secs::default();
        secs.size = size;
        secs.base = base;
        secs.ssa_frame_size = 1;
        secs.attributes.xfrm = sgx_arch::XFRM_FP | sgx_arch::XFRM_SSE;
        secs
    }

    #[test]
    fn secs_shape_boundaries() {
        let caps = SgxCaps::default();
        let page = PAGE_SIZE as u64;
        // Two pages at a two-page-aligned base is the smallest accepted
        // shape.
        assert!(validate_secs(&caps, &stub_secs(2 * page, 2 * page)).is_ok());
        // Base aligned only to one page is refused.
        assert_eq!(
            validate_secs(&caps, &stub_secs(2 * page, page)),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            validate_secs(&caps, &stub_secs(page, 2 * page)),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            validate_secs(&caps, &stub_secs(3 * page, 4 * page)),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn secs_feature_rules() {
        let caps = SgxCaps::default();
        let page = PAGE_SIZE as u64;

        let mut secs = stub_secs(2 * page, 2 * page);
        secs.attributes.xfrm = sgx_arch::XFRM_SSE;
        assert_eq!(validate_secs(&caps, &secs), Err(Error::InvalidArgument));

        // Both MPX components or neither.
        let mut secs = stub_secs(2 * page, 2 * page);
        secs.attributes.xfrm |= sgx_arch::XFRM_BNDREGS;
        assert_eq!(validate_secs(&caps, &secs), Err(Error::InvalidArgument));
        secs.attributes.xfrm |= sgx_arch::XFRM_BNDCSR;
        assert!(validate_secs(&caps, &secs).is_ok());

        let mut secs = stub_secs(2 * page, 2 * page);
        secs.ssa_frame_size = 0;
        assert_eq!(validate_secs(&caps, &secs), Err(Error::InvalidArgument));

        let mut secs = stub_secs(2 * page, 2 * page);
        secs.reserved3[17] = 1;
        assert_eq!(validate_secs(&caps, &secs), Err(Error::InvalidArgument));

        let mut secs = stub_secs(2 * page, 2 * page);
        // Unknown miscselect bits are reserved.
        secs.miscselect = unsafe { Miscselect::from_bits_unchecked(!0) };
        assert_eq!(validate_secs(&caps, &secs), Err(Error::InvalidArgument));
    }

    #[test]
    fn secs_size_maxima() {
        let caps = SgxCaps {
            encl_size_max_64: 1 << 20,
            encl_size_max_32: 1 << 16,
            ..SgxCaps::default()
        };
        let mut secs = stub_secs(1 << 17, 1 << 17);
        assert_eq!(validate_secs(&caps, &secs), Err(Error::InvalidArgument));
        secs.attributes.flags |= AttributesFlags::MODE64BIT;
        assert!(validate_secs(&caps, &secs).is_ok());
    }

    #[test]
    fn secinfo_rules() {
        let secinfo = Secinfo::new(PageType::Reg, SecinfoFlags::R | SecinfoFlags::W);
        assert_eq!(validate_secinfo(&secinfo), Ok(PageType::Reg));

        // Writable but not readable.
        let secinfo = Secinfo::new(PageType::Reg, SecinfoFlags::W);
        assert_eq!(validate_secinfo(&secinfo), Err(Error::InvalidArgument));

        // SECS and VA page types cannot be added from user space.
        let secinfo = Secinfo::new(PageType::Secs, SecinfoFlags::empty());
        assert_eq!(validate_secinfo(&secinfo), Err(Error::InvalidArgument));
        let secinfo = Secinfo::new(PageType::Va, SecinfoFlags::empty());
        assert_eq!(validate_secinfo(&secinfo), Err(Error::InvalidArgument));

        let mut secinfo = Secinfo::new(PageType::Reg, SecinfoFlags::R);
        secinfo.reserved[3] = 1;
        assert_eq!(validate_secinfo(&secinfo), Err(Error::InvalidArgument));

        let mut secinfo = Secinfo::new(PageType::Tcs, SecinfoFlags::empty());
        secinfo.flags.insert(SecinfoFlags::PENDING);
        assert_eq!(validate_secinfo(&secinfo), Err(Error::InvalidArgument));
    }
}
