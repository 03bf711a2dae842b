// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Boundary to the file-backed algorithm tuning store.
//!
//! The store itself lives outside this crate. The engine registers bindings
//! for the session's algorithms at open, feeds measured statistics back after
//! successful passes, and unregisters at close. A failed statistics write
//! never fails the dispatch that produced it; the worker downgrades it to a
//! warning.

use crate::buffer::FieldStats;
use crate::config::Algo;

pub trait TuningStore: Send {
    fn register(&mut self, algo: Algo) -> anyhow::Result<()>;

    fn unregister(&mut self, algo: Algo);

    /// Records post-processing statistics for `algo`.
    fn record_stats(&mut self, algo: Algo, stats: &FieldStats) -> anyhow::Result<()>;
}

/// Store used when no tuning backing file is configured.
pub struct NoopTuningStore;

impl TuningStore for NoopTuningStore {
    fn register(&mut self, _algo: Algo) -> anyhow::Result<()> {
        Ok(())
    }

    fn unregister(&mut self, _algo: Algo) {}

    fn record_stats(&mut self, _algo: Algo, _stats: &FieldStats) -> anyhow::Result<()> {
        Ok(())
    }
}
