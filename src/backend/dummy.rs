// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A backend that performs no processing, for running the engine without
//! accelerator hardware. Tests use its shared state handle to script failures
//! and observe the jobs the engine dispatched.

use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::BackendError;
use crate::backend::BufferRequirements;
use crate::backend::ProcessJob;
use crate::backend::ProcessOutcome;
use crate::backend::VppBackend;
use crate::buffer::FieldStats;
use crate::config::Algo;
use crate::config::AlgoMask;
use crate::port::PortParams;

/// What the dummy remembers about one `process` call.
#[derive(Clone, Debug)]
pub struct RecordedJob {
    pub input_cookies: Vec<u64>,
    pub output_cookies: Vec<u64>,
    pub algos: AlgoMask,
    pub fresh_window: bool,
}

#[derive(Default)]
pub struct DummyState {
    pub opened: bool,
    pub process_calls: Vec<RecordedJob>,
    /// Fail this many upcoming `process` calls with `ProcessingFailed`.
    pub fail_process: usize,
    /// Report zero buffer requirements, as a broken firmware build would.
    pub zero_requirements: bool,
    /// Refuse the next `open` with `OutOfResources`.
    pub fail_open: bool,
}

pub struct DummyBackend {
    caps: AlgoMask,
    output_params: Option<PortParams>,
    state: Arc<Mutex<DummyState>>,
}

impl DummyBackend {
    pub fn new(caps: AlgoMask) -> Self {
        Self { caps, output_params: None, state: Default::default() }
    }

    /// Shared handle for inspecting and scripting this backend after it has
    /// been moved into an engine.
    pub fn state(&self) -> Arc<Mutex<DummyState>> {
        self.state.clone()
    }
}

impl VppBackend for DummyBackend {
    fn caps(&self) -> AlgoMask {
        self.caps
    }

    fn open(&mut self, _input: &PortParams, output: &PortParams) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            state.fail_open = false;
            return Err(BackendError::OutOfResources);
        }
        state.opened = true;
        self.output_params = Some(*output);
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().opened = false;
        self.output_params = None;
    }

    fn buffer_requirements(&self, algos: AlgoMask) -> Result<BufferRequirements, BackendError> {
        let requested = algos.intersection(AlgoMask::frame_algos());
        if requested.intersection(self.caps) != requested {
            return Err(BackendError::UnsupportedCombination);
        }
        if self.state.lock().unwrap().zero_requirements {
            return Ok(BufferRequirements { input_min: 0, output_min: 0 });
        }
        // Motion-adaptive DI wants a three buffer temporal window and doubles
        // the frame rate; everything else is a single in/out pass.
        if algos.contains(Algo::Di) {
            Ok(BufferRequirements { input_min: 3, output_min: 2 })
        } else {
            Ok(BufferRequirements { input_min: 1, output_min: 1 })
        }
    }

    fn process(&mut self, job: ProcessJob) -> Result<ProcessOutcome, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.process_calls.push(RecordedJob {
            input_cookies: job.inputs.iter().map(|b| b.cookie).collect(),
            output_cookies: job.outputs.iter().map(|b| b.cookie).collect(),
            algos: job.algos,
            fresh_window: job.fresh_window,
        });
        if state.fail_process > 0 {
            state.fail_process -= 1;
            return Err(BackendError::ProcessingFailed(-5));
        }
        Ok(ProcessOutcome {
            output_filled_len: self.output_params.as_ref().map_or(0, |p| p.frame_size()),
            stats: [
                FieldStats { motion: 12, noise: 3, peak_level: 200 },
                FieldStats { motion: 10, noise: 4, peak_level: 180 },
            ],
        })
    }
}
