// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The asynchronous add-page worker. The hardware add is slow and must be
//! serialized per enclave; queueing the requests lets a builder batch many
//! adds without holding its own execution context. One worker exists per
//! enclave while its queue is non-empty.

use std::io;
use std::sync::Arc;
use std::thread;

use sgx_arch::Secinfo;
use sync::SignalToken;

use crate::encl::Encl;

/// One pending hardware add. The enclave reference is held until the
/// request retires, successful or not.
pub(crate) struct AddReq {
    pub(crate) encl: Arc<Encl>,
    pub(crate) addr: u64,
    /// Copied out of the caller; the field's 64-byte alignment satisfies
    /// the hardware operand requirement.
    pub(crate) secinfo: Secinfo,
    pub(crate) mrmask: u16,
}

/// Starts the worker for `encl`. Called by the enqueue path on the
/// empty-to-non-empty transition, after setting the running flag.
pub(crate) fn spawn(encl: &Arc<Encl>) -> io::Result<()> {
    let encl = encl.clone();
    thread::Builder::new()
        .name("sgx-add-page".into())
        .spawn(move || run(encl))
        .map(drop)
}

fn run(encl: Arc<Encl>) {
    let mut skip_rest = false;
    loop {
        // Fairness: let the enqueuing side make progress between requests.
        thread::yield_now();

        let req = {
            let mut inner = encl.inner_lock();
            if inner.is_dead() {
                skip_rest = true;
            }
            match inner.pop_add_req() {
                Some(req) => req,
                None => {
                    inner.set_worker_idle();
                    drop(inner);
                    encl.notify_worker_idle();
                    return;
                }
            }
        };

        if !skip_rest {
            // The allocation may sleep for reclaim; workers have no signal
            // context.
            match encl
                .pool()
                .alloc(encl.page_owner(Some(req.addr)), true, &SignalToken::new())
            {
                Ok(page) => {
                    let mut inner = encl.inner_lock();
                    if let Err(err) = encl.process_add_req(&mut inner, &req, &page) {
                        log::debug!("add-page at {:#x} failed: {:?}", req.addr, err);
                        encl.epc_free(&page);
                        encl.destroy_locked(&mut inner);
                        skip_rest = true;
                    }
                }
                Err(err) => {
                    log::debug!("add-page allocation failed: {:?}", err);
                    let mut inner = encl.inner_lock();
                    encl.destroy_locked(&mut inner);
                    skip_rest = true;
                }
            }
        }

        // `req` drops here, releasing the enclave reference it held.
        drop(req);
    }
}
