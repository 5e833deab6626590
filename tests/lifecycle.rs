// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Enclave lifecycle scenarios against stub collaborators: build and
//! initialize, evict and fault, duplicate adds, attribute gating, suspend,
//! and teardown accounting.

mod common;

use common::*;
use sgx_arch::{AttributesFlags, Einittoken, Sigstruct, PAGE_SIZE};
use sgx_epc::{Encl, EnclFlags, Error, SignalToken, VmFault, POWER_LOST_ENCLAVE};

const PAGE: u64 = PAGE_SIZE as u64;

#[test]
fn build_two_page_enclave_then_evict() {
    let stub = stub_driver(80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();

    let (encl, attachment) =
        Encl::create(&stub.driver, &secs, mm.clone(), &signals).unwrap();

    let data = pattern_page(0x42);
    encl.add_page(2 * PAGE, &data, &reg_secinfo(), 0xFFFF).unwrap();
    encl.add_page(3 * PAGE, &stub_tcs_page(), &tcs_secinfo(), 0xFFFF)
        .unwrap();

    encl.init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap();
    assert!(encl.is_initialized());
    assert_eq!(stub.encls.einit_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
    // Adds were processed in enqueue order, with all sixteen extends each.
    assert_eq!(stub.encls.added_addrs(), vec![2 * PAGE, 3 * PAGE]);
    assert_eq!(stub.encls.count("EEXTEND"), 32);

    // A resident page faults in cleanly.
    assert_eq!(attachment.fault(2 * PAGE), VmFault::NoPage);
    assert!(mm.installed.lock().unwrap().contains_key(&(2 * PAGE)));

    // Evict: both pages are cold, so one batch takes them, and with the
    // child count at zero the SECS follows.
    assert_eq!(stub.driver.total_free(), 77);
    assert!(stub.driver.reclaim_now());
    assert_eq!(stub.encls.count("EBLOCK"), 2);
    assert_eq!(stub.encls.count("EWB"), 3);
    assert_eq!(stub.encls.count("EPA"), 1);
    // Pages and SECS returned, one version-array page retained.
    assert_eq!(stub.driver.total_free(), 79);

    // Block strictly precedes write-back.
    {
        let ops = stub.encls.ops.lock().unwrap();
        let last_block = ops.iter().rposition(|(l, _)| *l == "EBLOCK").unwrap();
        let first_ewb = ops.iter().position(|(l, _)| *l == "EWB").unwrap();
        assert!(last_block < first_ewb);
    }
    // The mappings were zapped before the block.
    assert_eq!(mm.zapped.lock().unwrap().len(), 2);

    // The sealed content round-tripped into the backing store.
    let backing = stub.backings.lock().unwrap()[0].clone();
    let mut sealed = [0u8; PAGE_SIZE];
    use sgx_epc::backing::Backing;
    backing.read_page(0, &mut sealed).unwrap();
    assert_eq!(sealed, data);

    // An access to the evicted page now takes the reload fault path, which
    // this version answers with a bus error.
    assert_eq!(attachment.fault(2 * PAGE), VmFault::Sigbus);
}

#[test]
fn duplicate_add_rejected() {
    let stub = stub_driver(80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();
    let (encl, _attachment) = Encl::create(&stub.driver, &secs, mm, &signals).unwrap();

    encl.add_page(2 * PAGE, &pattern_page(1), &reg_secinfo(), 0).unwrap();
    assert_eq!(
        encl.add_page(2 * PAGE, &pattern_page(2), &reg_secinfo(), 0),
        Err(Error::Duplicate)
    );
    assert_eq!(Error::Duplicate.errno(), -22);

    // The failed add did not perturb the page map: construction finishes.
    encl.add_page(3 * PAGE, &stub_tcs_page(), &tcs_secinfo(), 0).unwrap();
    encl.init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap();
    assert_eq!(stub.encls.added_addrs(), vec![2 * PAGE, 3 * PAGE]);
}

#[test]
fn add_page_validation() {
    let stub = stub_driver(80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();
    let (encl, _attachment) = Encl::create(&stub.driver, &secs, mm, &signals).unwrap();

    // Unaligned and out-of-range addresses.
    assert_eq!(
        encl.add_page(2 * PAGE + 8, &pattern_page(0), &reg_secinfo(), 0),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        encl.add_page(5 * PAGE, &pattern_page(0), &reg_secinfo(), 0),
        Err(Error::InvalidArgument)
    );

    // A TCS whose limits are not 0xFFF-terminated.
    let mut bad_tcs = stub_tcs_page();
    bad_tcs[64] = 0; // fs_limit low byte
    assert_eq!(
        encl.add_page(3 * PAGE, &bad_tcs, &tcs_secinfo(), 0),
        Err(Error::InvalidArgument)
    );

    // After initialization no further pages are accepted.
    encl.init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap();
    assert_eq!(
        encl.add_page(3 * PAGE, &pattern_page(0), &reg_secinfo(), 0),
        Err(Error::InvalidArgument)
    );
}

#[test]
fn attribute_ceiling_gates_init() {
    let stub = stub_driver(80);
    let mut secs = stub_secs(2 * PAGE, 2 * PAGE);
    secs.attributes.flags |= AttributesFlags::PROVISIONKEY;
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();
    let (encl, _attachment) = Encl::create(&stub.driver, &secs, mm, &signals).unwrap();

    assert_eq!(
        encl.init(&Sigstruct::default(), &Einittoken::default(), &signals),
        Err(Error::InvalidArgument)
    );

    encl.set_allowed_attribute(AttributesFlags::PROVISIONKEY.bits());
    // Raising the ceiling twice changes nothing beyond the first call.
    encl.set_allowed_attribute(AttributesFlags::PROVISIONKEY.bits());
    encl.init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap();

    // Initializing an initialized enclave is a no-op.
    encl.init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap();
    assert_eq!(stub.encls.einit_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn suspend_poisons_enclave_and_frees_pages() {
    let stub = stub_driver(80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();
    let (encl, _attachment) = Encl::create(&stub.driver, &secs, mm, &signals).unwrap();
    encl.add_page(2 * PAGE, &pattern_page(7), &reg_secinfo(), 0).unwrap();

    stub.driver.suspend_prepare();

    let flags = encl.flags();
    assert!(flags.contains(EnclFlags::DEAD));
    assert!(flags.contains(EnclFlags::SUSPEND));
    // Every bound page, the SECS included, went back to the pool.
    assert_eq!(stub.driver.total_free(), 80);

    let err = encl
        .init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap_err();
    assert_eq!(err, Error::PowerLost);
    assert_eq!(err.errno(), POWER_LOST_ENCLAVE);
    assert_eq!(
        encl.add_page(3 * PAGE, &pattern_page(0), &reg_secinfo(), 0),
        Err(Error::PowerLost)
    );
}

#[test]
fn release_restores_free_count() {
    let stub = stub_driver(80);
    assert_eq!(stub.driver.total_free(), 80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();

    let (encl, attachment) = Encl::create(&stub.driver, &secs, mm, &signals).unwrap();
    assert_eq!(stub.driver.total_free(), 79);

    drop(attachment);
    drop(encl);
    assert_eq!(stub.driver.total_free(), 80);
}

#[test]
fn create_requires_exact_mapping() {
    let stub = stub_driver(80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let signals = SignalToken::new();

    // Mapping wider than the enclave range.
    let mm = StubMm::new(2 * PAGE, 8 * PAGE);
    assert_eq!(
        Encl::create(&stub.driver, &secs, mm, &signals).err(),
        Some(Error::InvalidArgument)
    );

    // No mapping at the base.
    let mm = StubMm::new(16 * PAGE, 18 * PAGE);
    assert_eq!(
        Encl::create(&stub.driver, &secs, mm, &signals).err(),
        Some(Error::InvalidArgument)
    );

    // The failed creations returned their SECS pages.
    assert_eq!(stub.driver.total_free(), 80);
}

#[test]
fn fault_before_init_is_a_bus_error() {
    let stub = stub_driver(80);
    let secs = stub_secs(2 * PAGE, 2 * PAGE);
    let mm = StubMm::new(2 * PAGE, 4 * PAGE);
    let signals = SignalToken::new();
    let (encl, attachment) = Encl::create(&stub.driver, &secs, mm, &signals).unwrap();
    encl.add_page(2 * PAGE, &pattern_page(3), &reg_secinfo(), 0).unwrap();

    assert_eq!(attachment.fault(2 * PAGE), VmFault::Sigbus);
    // Outside the range, even once initialized.
    encl.init(&Sigstruct::default(), &Einittoken::default(), &signals)
        .unwrap();
    assert_eq!(attachment.fault(5 * PAGE), VmFault::Sigbus);
}
