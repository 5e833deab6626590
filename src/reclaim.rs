// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The reclaim pipeline and its background task. Batches of candidates come
//! off the head of the reclaimable list and move through four phases:
//! harvest (take an enclave reference), age-test, block, write-back. The
//! enclave reference taken in phase 1 keeps the owner alive through phase 4
//! even if its last user reference drops mid-batch.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use epc_tracking::NR_TO_SCAN;

use crate::encl::{Encl, EnclPool, EpcPageRef};
use crate::encls::{encls_warn, Encls};

/// Evicts up to one batch of pages. Called from the reclaimer task and, for
/// embedders that want synchronous pressure relief, from
/// [`crate::driver::EpcDriver::reclaim_now`].
pub(crate) fn reclaim_pages(pool: &EnclPool, encls: &Arc<dyn Encls>) {
    // Phase 1: harvest candidates, taking a reference on each owner. An
    // owner already in teardown cannot free a page the batch holds, so
    // resolve such pages here instead of leaking them.
    let mut batch: Vec<(Arc<Encl>, EpcPageRef, u64)> = Vec::with_capacity(NR_TO_SCAN);
    for page in pool.take_batch(NR_TO_SCAN) {
        let upgraded = page
            .owner()
            .and_then(|owner| owner.encl.upgrade().map(|encl| (encl, owner.addr)));
        match upgraded {
            Some((encl, Some(addr))) => batch.push((encl, page, addr)),
            _ => {
                pool.clear_reclaimable(&page);
                if let Err(err) = encls.eremove(page.addr()) {
                    encls_warn("EREMOVE", &err);
                }
                pool.free(&page);
            }
        }
    }

    // Phase 2: age-test. Recently used pages go back to the tail and their
    // enclave references drop.
    let mut evict = Vec::with_capacity(batch.len());
    for (encl, page, addr) in batch {
        if encl.reclaimer_age(addr) {
            evict.push((encl, page, addr));
        } else {
            pool.return_to_tail(&page);
        }
    }

    // Phase 3: zap and block everything surviving, before any write-back
    // starts.
    for (encl, page, addr) in &evict {
        encl.reclaimer_block(page, *addr);
    }

    // Phase 4: write back and return each page to its section.
    for (encl, page, addr) in evict {
        encl.reclaimer_write(&page, addr);
        pool.clear_reclaimable(&page);
        pool.free(&page);
        drop(encl);
    }

    pool.notify_progress();
}

/// Starts the background reclaimer. It sleeps until the free count sinks
/// below the high watermark with candidates available, then batches until
/// the condition clears; a stop request wakes and retires it.
pub(crate) fn spawn_reclaimer(
    pool: Arc<EnclPool>,
    encls: Arc<dyn Encls>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("epc-reclaimer".into())
        .spawn(move || loop {
            pool.reclaimer_wait();
            if pool.stopped() {
                return;
            }
            while pool.should_reclaim() {
                reclaim_pages(&pool, &encls);
                thread::yield_now();
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encl::EnclPageOwner;
    use crate::encls::{EnclsError, EnclsResult, EpcAddr};
    use epc_tracking::{EpcMapBuilder, EpcPool};
    use sgx_arch::{Einittoken, ErrorCode, Pcmd, Secinfo, Secs, Sigstruct, PAGE_SIZE};
    use std::sync::Weak;
    use sync::SignalToken;

    struct NopEncls;

    impl Encls for NopEncls {
        fn ecreate(&self, _secs: &Secs, _target: EpcAddr) -> EnclsResult {
            Ok(())
        }
        fn eadd(
            &self,
            _contents: &[u8; PAGE_SIZE],
            _secinfo: &Secinfo,
            _addr: u64,
            _secs: EpcAddr,
            _target: EpcAddr,
        ) -> EnclsResult {
            Ok(())
        }
        fn eextend(&self, _secs: EpcAddr, _chunk: EpcAddr) -> EnclsResult {
            Ok(())
        }
        fn einit(
            &self,
            _sigstruct: &Sigstruct,
            _token: &Einittoken,
            _secs: EpcAddr,
            _pubkey_hash: &[u64; 4],
        ) -> EnclsResult {
            Ok(())
        }
        fn eblock(&self, _target: EpcAddr) -> EnclsResult {
            Ok(())
        }
        fn etrack(&self, _secs: EpcAddr) -> EnclsResult {
            Ok(())
        }
        fn ewb(
            &self,
            _contents: &mut [u8; PAGE_SIZE],
            _pcmd: &mut Pcmd,
            _target: EpcAddr,
            _va_slot: EpcAddr,
        ) -> EnclsResult {
            Err(EnclsError::Status(ErrorCode::PgInvld))
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
            Ok(())
        }
        fn eremove(&self, _target: EpcAddr) -> EnclsResult {
            Ok(())
        }
        fn epa(&self, _target: EpcAddr) -> EnclsResult {
            Ok(())
        }
    }

    #[test]
    fn orphaned_candidates_return_to_their_section() {
        let map = EpcMapBuilder::new()
            .add_section(0x1000_0000, 0x7000_0000_0000, 4 * PAGE_SIZE as u64)
            .unwrap()
            .build();
        let pool: EnclPool = EpcPool::new(&map);
        let encls: Arc<dyn Encls> = Arc::new(NopEncls);

        // A page whose owner is already gone: the weak reference upgrades
        // to nothing, as after an enclave release raced the harvest.
        let owner = EnclPageOwner {
            encl: Weak::new(),
            addr: Some(0x8000),
        };
        let page = pool.alloc(owner, false, &SignalToken::new()).unwrap();
        pool.mark_reclaimable(&page);
        assert_eq!(pool.total_free(), 3);

        reclaim_pages(&pool, &encls);

        assert_eq!(pool.total_free(), 4);
        assert!(!page.is_reclaimable());
        assert!(pool.reclaim_list_empty());
    }

    #[test]
    fn reclaimer_thread_stops_on_request() {
        let map = EpcMapBuilder::new()
            .add_section(0x1000_0000, 0x7000_0000_0000, 2 * PAGE_SIZE as u64)
            .unwrap()
            .build();
        let pool = Arc::new(EpcPool::new(&map));
        let encls: Arc<dyn Encls> = Arc::new(NopEncls);
        let handle = spawn_reclaimer(pool.clone(), encls).unwrap();
        pool.request_stop();
        handle.join().unwrap();
    }
}
