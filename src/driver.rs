// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The driver context: the EPC pool, the collaborator handles, the platform
//! capability masks and the reclaimer task, created together at load and
//! torn down together at unload. All other operations hang off this object;
//! there is no free-floating global state.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use epc_tracking::{EpcMap, EpcPool};
use sgx_arch::{AttributesFlags, Miscselect};

use crate::backing::Backing;
use crate::encl::EnclPool;
use crate::encls::Encls;
use crate::mm::CpuShootdown;
use crate::pm::PmNotifierList;
use crate::reclaim;

/// Platform capabilities the embedder derives from CPUID at boot: which
/// attribute, miscselect and XFRM bits exist, and the maximum enclave sizes
/// per addressing mode.
pub struct SgxCaps {
    pub attributes_reserved_mask: u64,
    pub miscselect_reserved_mask: u32,
    pub xfrm_reserved_mask: u64,
    pub encl_size_max_64: u64,
    pub encl_size_max_32: u64,
}

impl Default for SgxCaps {
    fn default() -> Self {
        let xfrm_known = sgx_arch::XFRM_FP
            | sgx_arch::XFRM_SSE
            | sgx_arch::XFRM_YMM
            | sgx_arch::XFRM_BNDREGS
            | sgx_arch::XFRM_BNDCSR
            | sgx_arch::XFRM_OPMASK
            | sgx_arch::XFRM_ZMM_HI256
            | sgx_arch::XFRM_HI16_ZMM
            | sgx_arch::XFRM_PKRU;
        Self {
            attributes_reserved_mask: !AttributesFlags::all().bits(),
            miscselect_reserved_mask: !Miscselect::all().bits(),
            xfrm_reserved_mask: !xfrm_known,
            encl_size_max_64: 1 << 36,
            encl_size_max_32: 1 << 31,
        }
    }
}

/// Factory for per-enclave backing stores of a requested size.
pub type BackingProvider =
    Box<dyn Fn(u64) -> io::Result<Arc<dyn Backing>> + Send + Sync>;

/// The process-wide driver state.
pub struct EpcDriver {
    pool: Arc<EnclPool>,
    encls: Arc<dyn Encls>,
    shootdown: Arc<dyn CpuShootdown>,
    backing: BackingProvider,
    caps: SgxCaps,
    pm: PmNotifierList,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl EpcDriver {
    /// Builds the pool from the firmware map and starts the reclaimer.
    pub fn new(
        map: &EpcMap,
        encls: Arc<dyn Encls>,
        shootdown: Arc<dyn CpuShootdown>,
        backing: BackingProvider,
        caps: SgxCaps,
    ) -> io::Result<Arc<Self>> {
        let pool = Arc::new(EpcPool::new(map));
        let reclaimer = reclaim::spawn_reclaimer(pool.clone(), encls.clone())?;
        Ok(Arc::new(Self {
            pool,
            encls,
            shootdown,
            backing,
            caps,
            pm: PmNotifierList::new(),
            reclaimer: Mutex::new(Some(reclaimer)),
        }))
    }

    /// Stops the reclaimer and waits for it. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let handle = self.reclaimer.lock().unwrap().take();
        if let Some(handle) = handle {
            self.pool.request_stop();
            if handle.join().is_err() {
                log::error!("reclaimer task panicked");
            }
        }
    }

    /// Delivers a suspend/hibernate prepare event to every live enclave.
    pub fn suspend_prepare(&self) {
        self.pm.broadcast_suspend();
    }

    /// Runs one synchronous eviction batch if any candidates exist.
    /// Returns whether a batch was attempted.
    pub fn reclaim_now(&self) -> bool {
        if self.pool.reclaim_list_empty() {
            return false;
        }
        reclaim::reclaim_pages(&self.pool, &self.encls);
        true
    }

    /// Current machine-wide free EPC page count.
    pub fn total_free(&self) -> u64 {
        self.pool.total_free()
    }

    /// Number of EPC pages the driver was initialized with.
    pub fn total_pages(&self) -> u64 {
        self.pool.total_pages()
    }

    pub(crate) fn pool(&self) -> &Arc<EnclPool> {
        &self.pool
    }

    pub(crate) fn encls(&self) -> &Arc<dyn Encls> {
        &self.encls
    }

    pub(crate) fn shootdown(&self) -> &Arc<dyn CpuShootdown> {
        &self.shootdown
    }

    pub(crate) fn caps(&self) -> &SgxCaps {
        &self.caps
    }

    pub(crate) fn pm(&self) -> &PmNotifierList {
        &self.pm
    }

    pub(crate) fn new_backing(&self, len: u64) -> io::Result<Arc<dyn Backing>> {
        (self.backing)(len)
    }
}

impl Drop for EpcDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
