// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Stub collaborators: a scriptable privileged-instruction layer that keeps
//! a model of EPC contents, an address space with young bits and installed
//! frames, and a backing provider that exposes the stores it built.

// Each test binary uses its own slice of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sgx_arch::{
    Einittoken, Pcmd, Secinfo, SecinfoFlags, Secs, Sigstruct, Tcs, PageType, PAGE_SIZE,
};
use sgx_epc::backing::{Backing, MemBacking};
use sgx_epc::driver::BackingProvider;
use sgx_epc::encls::{Encls, EnclsResult, EpcAddr};
use sgx_epc::{AddressSpace, CpuMask, CpuShootdown, EpcDriver, EpcMapBuilder, SgxCaps, VmRegion};

/// Scriptable ENCLS layer. EADD records page contents per EPC address and
/// EWB hands them back, so eviction round-trips are observable; EINIT pulls
/// results from a script before falling back to a default.
pub struct StubEncls {
    pub ops: Mutex<Vec<(&'static str, u64)>>,
    pub einit_calls: AtomicUsize,
    pub einit_script: Mutex<VecDeque<EnclsResult>>,
    pub einit_default: Mutex<EnclsResult>,
    epc: Mutex<HashMap<u64, [u8; PAGE_SIZE]>>,
}

impl StubEncls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            einit_calls: AtomicUsize::new(0),
            einit_script: Mutex::new(VecDeque::new()),
            einit_default: Mutex::new(Ok(())),
            epc: Mutex::new(HashMap::new()),
        })
    }

    fn log(&self, leaf: &'static str, operand: u64) {
        self.ops.lock().unwrap().push((leaf, operand));
    }

    /// The enclave addresses EADD was issued for, in order.
    pub fn added_addrs(&self) -> Vec<u64> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|(leaf, _)| *leaf == "EADD")
            .map(|(_, addr)| *addr)
            .collect()
    }

    pub fn count(&self, leaf: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == leaf)
            .count()
    }
}

impl Encls for StubEncls {
    fn ecreate(&self, secs: &Secs, _target: EpcAddr) -> EnclsResult {
        self.log("ECREATE", secs.base);
        Ok(())
    }

    fn eadd(
        &self,
        contents: &[u8; PAGE_SIZE],
        _secinfo: &Secinfo,
        addr: u64,
        _secs: EpcAddr,
        target: EpcAddr,
    ) -> EnclsResult {
        self.epc.lock().unwrap().insert(target.bits(), *contents);
        self.log("EADD", addr);
        Ok(())
    }

    fn eextend(&self, _secs: EpcAddr, chunk: EpcAddr) -> EnclsResult {
        self.log("EEXTEND", chunk.bits());
        Ok(())
    }

    fn einit(
        &self,
        _sigstruct: &Sigstruct,
        _token: &Einittoken,
        _secs: EpcAddr,
        _pubkey_hash: &[u64; 4],
    ) -> EnclsResult {
        self.einit_calls.fetch_add(1, Ordering::Relaxed);
        self.log("EINIT", 0);
        match self.einit_script.lock().unwrap().pop_front() {
            Some(res) => res,
            None => *self.einit_default.lock().unwrap(),
        }
    }

    fn eblock(&self, target: EpcAddr) -> EnclsResult {
        self.log("EBLOCK", target.bits());
        Ok(())
    }

    fn etrack(&self, secs: EpcAddr) -> EnclsResult {
        self.log("ETRACK", secs.bits());
        Ok(())
    }

    fn ewb(
        &self,
        contents: &mut [u8; PAGE_SIZE],
        _pcmd: &mut Pcmd,
        target: EpcAddr,
        _va_slot: EpcAddr,
    ) -> EnclsResult {
        if let Some(stored) = self.epc.lock().unwrap().remove(&target.bits()) {
            *contents = stored;
        }
        self.log("EWB", target.bits());
        Ok(())
    }

    fn eldu(
        &self,
        _contents: &[u8; PAGE_SIZE],
        _pcmd: &Pcmd,
        _addr: u64,
        _secs: EpcAddr,
        _target: EpcAddr,
        _va_slot: EpcAddr,
    ) -> EnclsResult {
        self.log("ELDU", 0);
        Ok(())
    }

    fn eremove(&self, target: EpcAddr) -> EnclsResult {
        self.epc.lock().unwrap().remove(&target.bits());
        self.log("EREMOVE", target.bits());
        Ok(())
    }

    fn epa(&self, target: EpcAddr) -> EnclsResult {
        self.log("EPA", target.bits());
        Ok(())
    }
}

/// Address-space stub: one configurable mapping, a young-bit set, and a log
/// of zaps and installed frames.
pub struct StubMm {
    pub region: Mutex<Option<VmRegion>>,
    pub young: Mutex<HashSet<u64>>,
    pub installed: Mutex<HashMap<u64, u64>>,
    pub zapped: Mutex<Vec<u64>>,
    pub cpus: CpuMask,
}

impl StubMm {
    pub fn new(start: u64, end: u64) -> Arc<Self> {
        Arc::new(Self {
            region: Mutex::new(Some(VmRegion {
                start,
                end,
                offset: 0,
            })),
            young: Mutex::new(HashSet::new()),
            installed: Mutex::new(HashMap::new()),
            zapped: Mutex::new(Vec::new()),
            cpus: CpuMask::single(1),
        })
    }

    pub fn mark_young(&self, addr: u64) {
        self.young.lock().unwrap().insert(addr);
    }
}

impl AddressSpace for StubMm {
    fn find_region(&self, addr: u64) -> Option<VmRegion> {
        let region = (*self.region.lock().unwrap())?;
        (addr >= region.start && addr < region.end).then_some(region)
    }

    fn zap(&self, start: u64, len: u64) {
        self.zapped.lock().unwrap().push(start);
        let mut installed = self.installed.lock().unwrap();
        installed.retain(|&addr, _| addr < start || addr >= start + len);
    }

    fn test_and_clear_young(&self, addr: u64) -> bool {
        self.young.lock().unwrap().remove(&addr)
    }

    fn insert_pfn(&self, addr: u64, pfn: u64) -> bool {
        self.installed.lock().unwrap().insert(addr, pfn);
        true
    }

    fn cpu_mask(&self) -> CpuMask {
        self.cpus
    }
}

pub struct StubShootdown {
    pub masks: Mutex<Vec<CpuMask>>,
}

impl StubShootdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            masks: Mutex::new(Vec::new()),
        })
    }
}

impl CpuShootdown for StubShootdown {
    fn force_exit(&self, cpus: CpuMask) {
        self.masks.lock().unwrap().push(cpus);
    }
}

/// Backing provider that remembers every store it hands out, so tests can
/// inspect sealed contents after eviction.
pub fn tracking_backing_provider() -> (BackingProvider, Arc<Mutex<Vec<Arc<MemBacking>>>>) {
    let stores: Arc<Mutex<Vec<Arc<MemBacking>>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = stores.clone();
    let provider: BackingProvider = Box::new(move |len| {
        let store = Arc::new(MemBacking::new(len));
        handle.lock().unwrap().push(store.clone());
        Ok(store as Arc<dyn Backing>)
    });
    (provider, stores)
}

pub struct StubDriver {
    pub driver: Arc<EpcDriver>,
    pub encls: Arc<StubEncls>,
    pub shootdown: Arc<StubShootdown>,
    pub backings: Arc<Mutex<Vec<Arc<MemBacking>>>>,
}

/// Builds a driver over a single EPC section of `pages` pages.
pub fn stub_driver(pages: usize) -> StubDriver {
    let map = EpcMapBuilder::new()
        .add_section(
            0x1000_0000,
            0x7000_0000_0000,
            (pages * PAGE_SIZE) as u64,
        )
        .unwrap()
        .build();
    let encls = StubEncls::new();
    let shootdown = StubShootdown::new();
    let (provider, backings) = tracking_backing_provider();
    let driver = EpcDriver::new(
        &map,
        encls.clone(),
        shootdown.clone(),
        provider,
        SgxCaps::default(),
    )
    .unwrap();
    StubDriver {
        driver,
        encls,
        shootdown,
        backings,
    }
}

pub fn stub_secs(size: u64, base: u64) -> Secs {
    let mut secs = Secs::default();
    secs.size = size;
    secs.base = base;
    secs.ssa_frame_size = 1;
    secs.attributes.xfrm = sgx_arch::XFRM_FP | sgx_arch::XFRM_SSE;
    secs
}

pub fn reg_secinfo() -> Secinfo {
    Secinfo::new(PageType::Reg, SecinfoFlags::R | SecinfoFlags::W)
}

pub fn tcs_secinfo() -> Secinfo {
    Secinfo::new(PageType::Tcs, SecinfoFlags::empty())
}

/// A TCS payload that passes validation: zeroed fields, page-aligned
/// offsets and 0xFFF-terminated limits.
pub fn stub_tcs_page() -> [u8; PAGE_SIZE] {
    let mut tcs = Tcs::default();
    tcs.ssa_offset = 0;
    tcs.fs_offset = 0;
    tcs.gs_offset = 0;
    tcs.fs_limit = 0xFFF;
    tcs.gs_limit = 0xFFF;
    let mut page = [0u8; PAGE_SIZE];
    page.copy_from_slice(tcs.as_ref());
    page
}

/// A REG page filled with a recognizable pattern.
pub fn pattern_page(seed: u8) -> [u8; PAGE_SIZE] {
    let mut page = [0u8; PAGE_SIZE];
    for (i, byte) in page.iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
    page
}
