// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The accelerator boundary. The engine never sees pixel data or the firmware
//! transport; everything behind this trait is a black box invoked with buffer
//! handles and parameter blocks.

use thiserror::Error;

use crate::buffer::FieldStats;
use crate::buffer::VppBuffer;
use crate::config::AlgoMask;
use crate::config::ComputedParams;
use crate::port::PortParams;

pub mod dummy;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("algorithm combination not supported by this accelerator build")]
    UnsupportedCombination,
    #[error("not enough accelerator resources to proceed with the operation")]
    OutOfResources,
    #[error("accelerator processing call failed with status {0}")]
    ProcessingFailed(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Buffer counts the accelerator declares for one algorithm combination.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferRequirements {
    /// Input buffers that must be visible to one processing pass.
    pub input_min: usize,
    /// Output buffers one processing pass fills.
    pub output_min: usize,
}

/// One processing pass handed to the accelerator. Input buffers beyond the
/// first are temporal look-ahead; the accelerator reads all of them but the
/// engine only retires the window head.
pub struct ProcessJob<'a> {
    pub inputs: &'a [VppBuffer],
    pub outputs: &'a [VppBuffer],
    pub params: &'a ComputedParams,
    /// The algorithms to run on this particular window. A subset of the
    /// session enable mask, e.g. with DI dropped for a progressive head.
    pub algos: AlgoMask,
    /// No temporal continuity with the previous pass; the accelerator must
    /// not reuse motion history.
    pub fresh_window: bool,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ProcessOutcome {
    /// Bytes written into each consumed output buffer.
    pub output_filled_len: usize,
    pub stats: [FieldStats; 2],
}

pub trait VppBackend: Send {
    /// Algorithms this accelerator build supports. Queried once at init.
    fn caps(&self) -> AlgoMask;

    /// Allocates the accelerator-side buffer management structures for a
    /// session with the given port geometry.
    fn open(&mut self, input: &PortParams, output: &PortParams) -> Result<(), BackendError>;

    fn close(&mut self);

    /// Buffer counts required for `algos`. Stable for a given combination
    /// within one open session.
    fn buffer_requirements(&self, algos: AlgoMask) -> Result<BufferRequirements, BackendError>;

    /// Runs one blocking processing pass. Called on the worker thread with
    /// the engine lock released.
    fn process(&mut self, job: ProcessJob) -> Result<ProcessOutcome, BackendError>;
}
