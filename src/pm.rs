// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Power-event notification. Enclave contents do not survive a suspend or
//! hibernate, so the prepare notification destroys every registered
//! enclave's pages and marks the enclave itself as lost; user operations on
//! it surface the power-loss code until the handle is released.

use std::sync::Weak;

use sync::SpinMutex;

use crate::encl::Encl;

pub(crate) struct PmNotifierList {
    entries: SpinMutex<Vec<Weak<Encl>>>,
}

impl PmNotifierList {
    pub(crate) fn new() -> Self {
        Self {
            entries: SpinMutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, encl: Weak<Encl>) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.strong_count() > 0);
        entries.push(encl);
    }

    /// Delivers a suspend/hibernate prepare event. Released enclaves fall
    /// out of the registry here.
    pub(crate) fn broadcast_suspend(&self) {
        let live: Vec<_> = {
            let mut entries = self.entries.lock();
            entries.retain(|e| e.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        for encl in live {
            encl.power_lost();
        }
    }
}
