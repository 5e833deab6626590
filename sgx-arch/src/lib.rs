// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # SGX architectural structures.
//!
//! The data structures and constants the SGX hardware defines: SECS, TCS,
//! SECINFO, PCMD, SIGSTRUCT, EINITTOKEN, the attribute and miscselect bit
//! sets, and the ENCLS status codes. Layouts are `#[repr(C)]` and pinned to
//! their architectural sizes; everything here is plain data with no driver
//! policy attached.

#![no_std]

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Size of one enclave page and of every EPC page.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of the SIGSTRUCT RSA modulus used to derive the signer measurement.
pub const MODULUS_SIZE: usize = 384;

/// Number of sealing slots in one version-array page.
pub const VA_SLOT_COUNT: usize = 512;
/// Size of one version-array slot.
pub const VA_SLOT_SIZE: usize = 8;

/// Size of the GPR region at the end of an SSA frame.
pub const SSA_GPRS_SIZE: u32 = 184;
/// Size of the MISC EXINFO region of an SSA frame.
pub const SSA_MISC_EXINFO_SIZE: u32 = 16;

/// XFRM bits with architectural meaning for SSA sizing.
pub const XFRM_FP: u64 = 1 << 0;
pub const XFRM_SSE: u64 = 1 << 1;
pub const XFRM_YMM: u64 = 1 << 2;
pub const XFRM_BNDREGS: u64 = 1 << 3;
pub const XFRM_BNDCSR: u64 = 1 << 4;
pub const XFRM_OPMASK: u64 = 1 << 5;
pub const XFRM_ZMM_HI256: u64 = 1 << 6;
pub const XFRM_HI16_ZMM: u64 = 1 << 7;
pub const XFRM_PKRU: u64 = 1 << 9;

// End offset of each XSAVE component within the save area (legacy region and
// header included). Component 8 is supervisor state and never valid in XFRM.
const XSAVE_END_OFFSET: [u32; 10] = [0, 0, 832, 1024, 1088, 1152, 1664, 2688, 0, 2696];

bitflags! {
    /// SECS attribute flags (the low half of the 128-bit attribute field).
    pub struct AttributesFlags: u64 {
        const INIT          = 0x01;
        const DEBUG         = 0x02;
        const MODE64BIT     = 0x04;
        const PROVISIONKEY  = 0x10;
        const EINITTOKENKEY = 0x20;
    }
}

bitflags! {
    /// SECS MISCSELECT extended-information selector.
    pub struct Miscselect: u32 {
        const EXINFO = 0x01;
    }
}

bitflags! {
    /// TCS flags. Every bit other than DBGOPTIN is reserved.
    pub struct TcsFlags: u64 {
        const DBGOPTIN = 0x01;
    }
}

bitflags! {
    /// SECINFO flags: permissions in the low bits, page type in bits 8..16.
    pub struct SecinfoFlags: u64 {
        const R        = 0x0001;
        const W        = 0x0002;
        const X        = 0x0004;
        const PENDING  = 0x0008;
        const MODIFIED = 0x0010;
        const PR       = 0x0020;
        const PT_MASK  = 0xFF00;
    }
}

/// Permission bits of a SECINFO.
pub const SECINFO_PERMISSION_MASK: u64 = 0x7;
/// Page-type bits of a SECINFO.
pub const SECINFO_PAGE_TYPE_MASK: u64 = 0xFF00;
/// Bits that must be clear in a user-supplied SECINFO.
pub const SECINFO_RESERVED_MASK: u64 = !(SECINFO_PERMISSION_MASK | SECINFO_PAGE_TYPE_MASK);

impl SecinfoFlags {
    /// Returns the raw page-type byte.
    pub fn page_type(&self) -> u8 {
        ((self.bits() & SECINFO_PAGE_TYPE_MASK) >> 8) as u8
    }
}

impl From<PageType> for SecinfoFlags {
    fn from(pt: PageType) -> SecinfoFlags {
        SecinfoFlags::from_bits_truncate((pt as u64) << 8)
    }
}

/// Enclave page types as encoded in SECINFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Secs = 0,
    Tcs = 1,
    Reg = 2,
    Va = 3,
    Trim = 4,
}

impl PageType {
    pub fn from_repr(v: u8) -> Option<Self> {
        match v {
            0 => Some(PageType::Secs),
            1 => Some(PageType::Tcs),
            2 => Some(PageType::Reg),
            3 => Some(PageType::Va),
            4 => Some(PageType::Trim),
            _ => None,
        }
    }
}

/// Status codes returned by the ENCLS leaf functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidSigStruct = 1,
    InvalidAttribute = 2,
    Blkstate = 3,
    InvalidMeasurement = 4,
    NotBlockable = 5,
    PgInvld = 6,
    Lockfail = 7,
    InvalidSignature = 8,
    MacCompareFail = 9,
    PageNotBlocked = 10,
    NotTracked = 11,
    VaSlotOccupied = 12,
    ChildPresent = 13,
    EnclaveAct = 14,
    EntryepochLocked = 15,
    InvalidEinitToken = 16,
    PrevTrkIncmpl = 17,
    PgIsSecs = 18,
    InvalidCpusvn = 32,
    InvalidIsvsvn = 64,
    UnmaskedEvent = 128,
    InvalidKeyname = 256,
}

impl ErrorCode {
    pub fn from_repr(v: u32) -> Option<Self> {
        use ErrorCode::*;
        match v {
            1 => Some(InvalidSigStruct),
            2 => Some(InvalidAttribute),
            3 => Some(Blkstate),
            4 => Some(InvalidMeasurement),
            5 => Some(NotBlockable),
            6 => Some(PgInvld),
            7 => Some(Lockfail),
            8 => Some(InvalidSignature),
            9 => Some(MacCompareFail),
            10 => Some(PageNotBlocked),
            11 => Some(NotTracked),
            12 => Some(VaSlotOccupied),
            13 => Some(ChildPresent),
            14 => Some(EnclaveAct),
            15 => Some(EntryepochLocked),
            16 => Some(InvalidEinitToken),
            17 => Some(PrevTrkIncmpl),
            18 => Some(PgIsSecs),
            32 => Some(InvalidCpusvn),
            64 => Some(InvalidIsvsvn),
            128 => Some(UnmaskedEvent),
            256 => Some(InvalidKeyname),
            _ => None,
        }
    }
}

/// The full 128-bit attribute field: flags plus the XSAVE feature request
/// mask.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub flags: AttributesFlags,
    pub xfrm: u64,
}

impl Default for Attributes {
    fn default() -> Self {
        Attributes {
            flags: AttributesFlags::empty(),
            xfrm: 0,
        }
    }
}

/// SGX Enclave Control Structure. One page; lives in the EPC while the
/// enclave exists.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secs {
    pub size: u64,
    pub base: u64,
    pub ssa_frame_size: u32,
    pub miscselect: Miscselect,
    pub reserved1: [u8; 24],
    pub attributes: Attributes,
    pub mrenclave: [u8; 32],
    pub reserved2: [u8; 32],
    pub mrsigner: [u8; 32],
    pub reserved3: [u8; 96],
    pub isvprodid: u16,
    pub isvsvn: u16,
    pub reserved4: [u8; 3836],
}

/// Thread Control Structure payload of a TCS page.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tcs {
    pub state: u64,
    pub flags: TcsFlags,
    pub ssa_offset: u64,
    pub ssa_index: u32,
    pub nr_ssa_frames: u32,
    pub entry_offset: u64,
    pub exit_addr: u64,
    pub fs_offset: u64,
    pub gs_offset: u64,
    pub fs_limit: u32,
    pub gs_limit: u32,
    pub reserved: [u8; 4024],
}

/// Security information operand for EADD; 64-byte aligned as the hardware
/// requires of the operand.
#[repr(C, align(64))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secinfo {
    pub flags: SecinfoFlags,
    pub reserved: [u8; 56],
}

impl Secinfo {
    /// Builds a SECINFO for the given page type and permission bits.
    pub fn new(pt: PageType, perms: SecinfoFlags) -> Self {
        Secinfo {
            flags: SecinfoFlags::from(pt) | (perms & SecinfoFlags::from_bits_truncate(SECINFO_PERMISSION_MASK)),
            reserved: [0; 56],
        }
    }
}

/// Paging crypto metadata produced by EWB and consumed by ELDU; one record
/// per sealed page.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pcmd {
    pub secinfo: Secinfo,
    pub enclave_id: u64,
    pub reserved: [u8; 40],
    pub mac: [u8; 16],
}

/// Enclave signature structure handed to EINIT.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sigstruct {
    pub header: [u8; 16],
    pub vendor: u32,
    pub date: u32,
    pub header2: [u8; 16],
    pub swdefined: u32,
    pub reserved1: [u8; 84],
    pub modulus: [u8; MODULUS_SIZE],
    pub exponent: u32,
    pub signature: [u8; MODULUS_SIZE],
    pub miscselect: Miscselect,
    pub miscmask: u32,
    pub reserved2: [u8; 20],
    pub attributes: Attributes,
    pub attributemask: [u64; 2],
    pub enclavehash: [u8; 32],
    pub reserved3: [u8; 32],
    pub isvprodid: u16,
    pub isvsvn: u16,
    pub reserved4: [u8; 12],
    pub q1: [u8; MODULUS_SIZE],
    pub q2: [u8; MODULUS_SIZE],
}

/// Launch token handed to EINIT alongside the SIGSTRUCT.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Einittoken {
    pub valid: u32,
    pub reserved1: [u8; 44],
    pub attributes: Attributes,
    pub mrenclave: [u8; 32],
    pub reserved2: [u8; 32],
    pub mrsigner: [u8; 32],
    pub reserved3: [u8; 32],
    pub cpusvnle: [u8; 16],
    pub isvprodidle: u16,
    pub isvsvnle: u16,
    pub reserved4: [u8; 24],
    pub maskedmiscselectle: Miscselect,
    pub maskedattributesle: Attributes,
    pub keyid: [u8; 32],
    pub mac: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<Attributes>(), 16);
const_assert_eq!(core::mem::size_of::<Secs>(), PAGE_SIZE);
const_assert_eq!(core::mem::size_of::<Tcs>(), PAGE_SIZE);
const_assert_eq!(core::mem::size_of::<Secinfo>(), 64);
const_assert_eq!(core::mem::size_of::<Pcmd>(), 128);
const_assert_eq!(core::mem::size_of::<Sigstruct>(), 1808);
const_assert_eq!(core::mem::size_of::<Einittoken>(), 304);

macro_rules! bytes_impl {
    ($($t:ty),* $(,)?) => {$(
        impl $t {
            /// Copies a value out of `src` if the length matches the
            /// structure size. The read is unaligned; user buffers carry no
            /// alignment guarantee.
            pub fn try_copy_from(src: &[u8]) -> Option<Self> {
                if src.len() == core::mem::size_of::<Self>() {
                    Some(unsafe { core::ptr::read_unaligned(src.as_ptr() as *const Self) })
                } else {
                    None
                }
            }
        }

        impl AsRef<[u8]> for $t {
            fn as_ref(&self) -> &[u8] {
                unsafe {
                    core::slice::from_raw_parts(
                        self as *const $t as *const u8,
                        core::mem::size_of::<$t>(),
                    )
                }
            }
        }

        impl Default for $t {
            fn default() -> Self {
                // All-zero is a valid quiescent value for every structure
                // here.
                unsafe { core::mem::zeroed() }
            }
        }
    )*};
}

bytes_impl! {
    Secs,
    Tcs,
    Secinfo,
    Pcmd,
    Sigstruct,
    Einittoken,
}

/// Computes the required SSA frame size, in pages, for the given MISCSELECT
/// and XFRM. Mirrors what the hardware will demand at ECREATE: the largest
/// XSAVE footprint over the requested extended features, plus the GPR area
/// and, when EXINFO is selected, the MISC region.
pub fn ssa_frame_size(miscselect: Miscselect, xfrm: u64) -> u32 {
    let mut size_max = PAGE_SIZE as u32;
    for i in 2..64u64 {
        if xfrm & (1 << i) == 0 {
            continue;
        }
        let xsave = match XSAVE_END_OFFSET.get(i as usize) {
            Some(&end) if end != 0 => end,
            _ => continue,
        };
        let mut size = SSA_GPRS_SIZE + xsave;
        if miscselect.contains(Miscselect::EXINFO) {
            size += SSA_MISC_EXINFO_SIZE;
        }
        if size > size_max {
            size_max = size;
        }
    }
    (size_max + PAGE_SIZE as u32 - 1) >> PAGE_SHIFT
}
