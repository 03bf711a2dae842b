// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The worker thread: drains the command ring, evaluates admission when idle,
//! and runs dispatch cycles. Every buffer removed from a queue during a cycle
//! is returned through the buffer-done callback exactly once, on the success
//! and the failure path alike.

use std::sync::Arc;

use anyhow::anyhow;

use crate::admission::admission;
use crate::admission::counts_for_head;
use crate::admission::di_timestamps;
use crate::admission::plan_cycle;
use crate::admission::propagate_flags;
use crate::admission::propagation_source;
use crate::admission::BufferMeta;
use crate::admission::CycleCounts;
use crate::admission::CyclePlan;
use crate::admission::QueueSnapshot;
use crate::backend::BackendError;
use crate::backend::ProcessJob;
use crate::backend::ProcessOutcome;
use crate::backend::VppBackend;
use crate::buffer::BufferType;
use crate::buffer::VppBuffer;
use crate::config::Algo;
use crate::config::AlgoMask;
use crate::config::ComputedParams;
use crate::config::ALL_ALGOS;
use crate::engine::Command;
use crate::engine::EngineEvent;
use crate::engine::EngineInner;
use crate::engine::EngineState;
use crate::engine::ProcState;
use crate::engine::Shared;
use crate::port::PortDir;
use crate::port::PortParams;
use crate::tuning::TuningStore;
use crate::VppError;

pub(crate) type BufferDoneCb = dyn FnMut(PortDir, VppBuffer) + Send;
pub(crate) type EventCb = dyn FnMut(EngineEvent) + Send;

fn backend_to_vpp_error(err: BackendError) -> VppError {
    match err {
        BackendError::UnsupportedCombination => VppError::Unsupported(err.to_string()),
        BackendError::OutOfResources => VppError::Resources(err.to_string()),
        BackendError::ProcessingFailed(status) => {
            VppError::Internal(anyhow!("accelerator returned status {status}"))
        }
        BackendError::Other(err) => VppError::Internal(err),
    }
}

fn snapshot_of(shared: &Shared) -> QueueSnapshot {
    let input_window = (0..shared.counts.input_into)
        .map_while(|offset| shared.input_queue.peek(offset).map(BufferMeta::from))
        .collect();
    QueueSnapshot {
        input_depth: shared.input_queue.len(),
        output_depth: shared.output_queue.len(),
        input_window,
    }
}

enum NextAction {
    Command(Command),
    Cycle,
    Wait,
}

/// What one admitted cycle removed from the queues, decided under the lock.
enum Prepared {
    /// Nothing admissible after re-checking under the lock.
    Skip,
    /// The head input goes straight to the output port.
    Bypass { input: VppBuffer },
    /// The window failed validation; return everything with failure
    /// semantics without calling the accelerator.
    Aborted { inputs: Vec<VppBuffer>, outputs: Vec<VppBuffer> },
    /// A processing pass.
    Process {
        window: Vec<VppBuffer>,
        outputs: Vec<VppBuffer>,
        plan: CyclePlan,
        params: ComputedParams,
        fresh: bool,
        flush_epoch: u64,
    },
}

pub(crate) struct Worker {
    inner: Arc<EngineInner>,
    backend: Box<dyn VppBackend>,
    tuning: Box<dyn TuningStore>,
    buffer_done_cb: Box<BufferDoneCb>,
    event_cb: Box<EventCb>,
}

impl Worker {
    pub fn new(
        inner: Arc<EngineInner>,
        backend: Box<dyn VppBackend>,
        tuning: Box<dyn TuningStore>,
        buffer_done_cb: Box<BufferDoneCb>,
        event_cb: Box<EventCb>,
    ) -> Self {
        Self { inner, backend, tuning, buffer_done_cb, event_cb }
    }

    pub fn run(mut self) {
        log::debug!("vpp worker running");
        loop {
            match self.next_action() {
                NextAction::Command(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                NextAction::Cycle => self.run_cycle(),
                NextAction::Wait => {
                    self.inner.wake.read().unwrap();
                }
            }
        }
        log::debug!("vpp worker exiting");
    }

    /// Commands always win over buffer work; the wake event makes sure a
    /// command or buffer posted after the idle check is not slept through.
    fn next_action(&mut self) -> NextAction {
        let inner = self.inner.clone();
        let mut shared = inner.shared.lock().unwrap();
        if let Some(command) = shared.commands.pop_front() {
            return NextAction::Command(command);
        }
        if shared.state == EngineState::Active {
            self.refresh_config(&mut shared);
            let snapshot = snapshot_of(&shared);
            let decision =
                admission(&snapshot, shared.counts, shared.config.enabled, shared.drain_pending);
            if decision.is_admissible() {
                return NextAction::Cycle;
            }
        }
        NextAction::Wait
    }

    /// Runs the pending compute pass, renegotiating the session buffer
    /// counts when the enable mask or port geometry changed.
    fn refresh_config(&mut self, shared: &mut Shared) {
        if !shared.config.is_dirty() {
            return;
        }
        let requirements_stale = shared.config.compute();
        if !requirements_stale || shared.state != EngineState::Active {
            return;
        }
        match self.backend.buffer_requirements(shared.config.enabled) {
            Ok(req) if req.input_min > 0 && req.output_min > 0 => {
                shared.max_requirements = req;
                shared.counts = CycleCounts::from_requirements(req);
                // A renegotiated window has no usable history.
                shared.proc_state = ProcState::ActiveStart;
            }
            Ok(req) => {
                log::warn!(
                    "accelerator declared {}x{} buffers mid-session; keeping previous counts",
                    req.input_min,
                    req.output_min
                );
            }
            Err(err) => {
                log::warn!("buffer requirement renegotiation failed, keeping previous: {err}");
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Open { done } => {
                let _ = done.send(self.do_open());
            }
            Command::Close { done } => {
                let _ = done.send(self.do_close());
            }
            Command::Reconfigure { input, output, done } => {
                let _ = done.send(self.do_reconfigure(input, output));
            }
            Command::Flush { port } => self.do_flush(port),
            Command::Drain => self.do_drain(),
            Command::ThreadExit => return false,
        }
        true
    }

    fn do_open(&mut self) -> Result<(), VppError> {
        let inner = self.inner.clone();
        let (input, output, secure) = {
            let shared = inner.shared.lock().unwrap();
            if shared.state != EngineState::Inited {
                return Err(VppError::InvalidState("open requires a closed engine"));
            }
            let input = shared
                .input_params
                .ok_or(VppError::InvalidState("input port parameters not set"))?;
            let output = shared
                .output_params
                .ok_or(VppError::InvalidState("output port parameters not set"))?;
            (input, output, shared.secure)
        };

        log::debug!(
            "opening {}session, {}x{} -> {}x{}",
            if secure { "secure " } else { "" },
            input.size.width,
            input.size.height,
            output.size.width,
            output.size.height
        );
        self.backend.open(&input, &output).map_err(backend_to_vpp_error)?;

        // One compute pass so the requirement query sees fresh parameter
        // blocks for the enabled combination.
        let (enabled, caps) = {
            let mut shared = inner.shared.lock().unwrap();
            shared.config.compute();
            (shared.config.enabled, shared.config.caps())
        };

        let requirements = match self.backend.buffer_requirements(enabled) {
            Ok(requirements) => requirements,
            Err(err) => {
                self.backend.close();
                return Err(backend_to_vpp_error(err));
            }
        };
        if requirements.input_min == 0 || requirements.output_min == 0 {
            self.backend.close();
            return Err(VppError::Resources(
                "accelerator declared a zero buffer requirement".into(),
            ));
        }

        for algo in ALL_ALGOS {
            if !caps.contains(algo) {
                continue;
            }
            if let Err(err) = self.tuning.register(algo) {
                log::warn!("tuning registration for {:?} failed (ignored): {:#}", algo, err);
            }
        }

        let mut shared = inner.shared.lock().unwrap();
        shared.max_requirements = requirements;
        shared.counts = CycleCounts::from_requirements(requirements);
        shared.state = EngineState::Active;
        shared.proc_state = ProcState::ActiveStart;
        Ok(())
    }

    fn do_close(&mut self) -> Result<(), VppError> {
        let inner = self.inner.clone();
        let (inputs, outputs, caps) = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.state != EngineState::Active {
                return Err(VppError::InvalidState("close requires an open session"));
            }
            shared.input_flush_epoch += 1;
            shared.drain_pending = false;
            (
                shared.input_queue.drain_all(),
                shared.output_queue.drain_all(),
                shared.config.caps(),
            )
        };

        // Anything still pending goes back as flushed before the session
        // resources disappear.
        for mut buffer in inputs {
            buffer.flags.flushed = true;
            (self.buffer_done_cb)(PortDir::Input, buffer);
        }
        for mut buffer in outputs {
            buffer.flags.flushed = true;
            buffer.filled_len = 0;
            (self.buffer_done_cb)(PortDir::Output, buffer);
        }

        for algo in ALL_ALGOS {
            if caps.contains(algo) {
                self.tuning.unregister(algo);
            }
        }
        self.backend.close();

        let mut shared = inner.shared.lock().unwrap();
        shared.state = EngineState::Inited;
        shared.proc_state = ProcState::Inited;
        Ok(())
    }

    fn do_reconfigure(&mut self, input: PortParams, output: PortParams) -> Result<(), VppError> {
        let inner = self.inner.clone();
        let previous = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.state != EngineState::Active {
                return Err(VppError::InvalidState("reconfigure requires an open session"));
            }
            if !shared.input_queue.is_empty() {
                return Err(VppError::InvalidState("reconfigure requires an empty input queue"));
            }
            let previous = (shared.input_params, shared.output_params);
            shared.input_params = Some(input);
            shared.output_params = Some(output);
            shared.config.mark_port_params_dirty();
            shared.config.compute();
            previous
        };

        // The accelerator-side buffer management is sized for the old
        // geometry; cycle it.
        self.backend.close();
        if let Err(err) = self.backend.open(&input, &output) {
            // Put the old geometry back so the session stays usable.
            {
                let mut shared = inner.shared.lock().unwrap();
                shared.input_params = previous.0;
                shared.output_params = previous.1;
                shared.config.mark_port_params_dirty();
            }
            if let (Some(old_input), Some(old_output)) = previous {
                if let Err(reopen) = self.backend.open(&old_input, &old_output) {
                    log::error!("failed to restore session after reconfigure: {reopen}");
                    let mut shared = inner.shared.lock().unwrap();
                    shared.state = EngineState::Inited;
                    shared.proc_state = ProcState::Inited;
                }
            }
            return Err(backend_to_vpp_error(err));
        }

        let enabled = inner.shared.lock().unwrap().config.enabled;
        let requirements =
            self.backend.buffer_requirements(enabled).map_err(backend_to_vpp_error)?;
        if requirements.input_min == 0 || requirements.output_min == 0 {
            return Err(VppError::Resources(
                "accelerator declared a zero buffer requirement".into(),
            ));
        }
        let mut shared = inner.shared.lock().unwrap();
        shared.max_requirements = requirements;
        shared.counts = CycleCounts::from_requirements(requirements);
        shared.proc_state = ProcState::ActiveStart;
        Ok(())
    }

    fn do_flush(&mut self, port: PortDir) {
        let inner = self.inner.clone();
        let buffers = {
            let mut shared = inner.shared.lock().unwrap();
            if port == PortDir::Input {
                shared.input_flush_epoch += 1;
            }
            match port {
                PortDir::Input => shared.input_queue.drain_all(),
                PortDir::Output => shared.output_queue.drain_all(),
            }
        };
        log::debug!("flushing {} buffers from {:?}", buffers.len(), port);
        for mut buffer in buffers {
            buffer.flags.flushed = true;
            if port == PortDir::Output {
                buffer.filled_len = 0;
            }
            (self.buffer_done_cb)(port, buffer);
        }
        (self.event_cb)(EngineEvent::FlushDone(port));
        if port == PortDir::Input {
            self.finish_drain_if_idle();
        }
    }

    fn do_drain(&mut self) {
        let inner = self.inner.clone();
        let already_empty = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.input_queue.is_empty() {
                true
            } else {
                shared.drain_pending = true;
                false
            }
        };
        if already_empty {
            (self.event_cb)(EngineEvent::DrainDone);
        }
    }

    /// Fires drain-done once a pending drain sees an empty input queue.
    fn finish_drain_if_idle(&mut self) {
        let inner = self.inner.clone();
        let fire = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.drain_pending && shared.input_queue.is_empty() {
                shared.drain_pending = false;
                true
            } else {
                false
            }
        };
        if fire {
            (self.event_cb)(EngineEvent::DrainDone);
        }
    }

    /// One dispatch cycle: re-evaluate admission under the lock, remove the
    /// window, then run bypass or the accelerator pass with the lock
    /// released.
    fn run_cycle(&mut self) {
        let inner = self.inner.clone();

        let prepared = {
            let mut shared = inner.shared.lock().unwrap();
            if shared.state != EngineState::Active {
                Prepared::Skip
            } else {
                let snapshot = snapshot_of(&shared);
                let decision = admission(
                    &snapshot,
                    shared.counts,
                    shared.config.enabled,
                    shared.drain_pending,
                );
                if !decision.is_admissible() {
                    Prepared::Skip
                } else {
                    let min_input_len = shared.input_params.map_or(0, |p| p.frame_size());
                    let head_type = snapshot.input_window[0].buffer_type;
                    let effective =
                        counts_for_head(shared.counts, shared.config.enabled, head_type);
                    match plan_cycle(
                        &snapshot.input_window,
                        shared.counts,
                        shared.config.enabled,
                        min_input_len,
                    ) {
                        Err(err) => {
                            log::error!("dispatch cycle aborted: {err}");
                            let inputs = shared.input_queue.remove_first(1);
                            let available = shared.output_queue.len();
                            let outputs = shared
                                .output_queue
                                .remove_first(effective.output_outof.min(available));
                            shared.proc_state = ProcState::ActiveStart;
                            Prepared::Aborted { inputs, outputs }
                        }
                        Ok(plan) if plan.bypass => {
                            let input = shared
                                .input_queue
                                .pop()
                                .expect("admitted cycle with an empty input queue");
                            shared.proc_state = ProcState::ActiveStart;
                            Prepared::Bypass { input }
                        }
                        Ok(plan) => {
                            let window = shared.input_queue.remove_first(plan.input_window);
                            let outputs = shared.output_queue.remove_first(plan.output_consumed);
                            let fresh = shared.proc_state != ProcState::Active;
                            let flush_epoch = shared.input_flush_epoch;
                            Prepared::Process {
                                window,
                                outputs,
                                plan,
                                params: shared.config.computed,
                                fresh,
                                flush_epoch,
                            }
                        }
                    }
                }
            }
        };

        match prepared {
            Prepared::Skip => (),
            Prepared::Bypass { mut input } => {
                log::debug!("bypassing input buffer {:#x}", input.cookie);
                // The buffer keeps the flags that made it a bypass; they
                // describe the outcome to the client.
                input.algos_run = AlgoMask::empty();
                (self.buffer_done_cb)(PortDir::Output, input);
                self.finish_drain_if_idle();
            }
            Prepared::Aborted { inputs, outputs } => {
                self.return_aborted(inputs, outputs);
                self.finish_drain_if_idle();
            }
            Prepared::Process { window, outputs, plan, params, fresh, flush_epoch } => {
                let result = self.backend.process(ProcessJob {
                    inputs: &window,
                    outputs: &outputs,
                    params: &params,
                    algos: plan.algos,
                    fresh_window: fresh,
                });
                match result {
                    Ok(outcome) => {
                        self.record_tuning(&plan, &outcome);
                        self.finish_cycle(window, outputs, &plan, Some(outcome), flush_epoch);
                    }
                    Err(err) => {
                        log::error!("accelerator processing failed: {err}");
                        self.finish_cycle(window, outputs, &plan, None, flush_epoch);
                    }
                }
                self.finish_drain_if_idle();
            }
        }
    }

    /// Tuning-metadata failures are observability losses, never dispatch
    /// failures.
    fn record_tuning(&mut self, plan: &CyclePlan, outcome: &ProcessOutcome) {
        for algo in [Algo::Di, Algo::Cnr, Algo::Aie] {
            if !plan.algos.contains(algo) {
                continue;
            }
            for stats in &outcome.stats {
                if let Err(err) = self.tuning.record_stats(algo, stats) {
                    log::warn!("tuning statistics write for {:?} failed (ignored): {:#}", algo, err);
                }
            }
        }
    }

    /// The buffer return path. Consumed inputs go back to the input port with
    /// transient flags cleared; outputs are stamped with metadata from the
    /// window head (timestamps interpolated for field-rate DI) and returned
    /// filled on success, zero-length on failure. Look-ahead inputs rejoin
    /// the queue unless the port was flushed while the pass was in flight.
    fn finish_cycle(
        &mut self,
        window: Vec<VppBuffer>,
        outputs: Vec<VppBuffer>,
        plan: &CyclePlan,
        outcome: Option<ProcessOutcome>,
        flush_epoch: u64,
    ) {
        let src_index = propagation_source(window.len(), window[0].buffer_type);
        let src_flags = window[src_index.min(window.len() - 1)].flags;
        let head_ts = window[0].timestamp_us;
        let next_ts = window.get(1).map(|b| b.timestamp_us);
        let fields = window[0].buffer_type.fields_per_buffer();
        let di_ran = plan.algos.contains(Algo::Di);
        let success = outcome.is_some();

        let mut window = window.into_iter();
        let consumed: Vec<VppBuffer> = window.by_ref().take(plan.input_consumed).collect();
        let lookahead: Vec<VppBuffer> = window.collect();
        self.requeue_lookahead(lookahead, flush_epoch);

        let stats = outcome.as_ref().map(|o| o.stats).unwrap_or_default();
        for mut input in consumed {
            input.flags.clear_transient();
            input.field_stats = stats;
            (self.buffer_done_cb)(PortDir::Input, input);
        }

        let timestamps = if di_ran && success {
            di_timestamps(head_ts, next_ts, fields, outputs.len())
        } else {
            vec![head_ts; outputs.len()]
        };
        let out_count = outputs.len();
        for (index, mut output) in outputs.into_iter().enumerate() {
            output.filled_len = outcome.as_ref().map_or(0, |o| o.output_filled_len);
            output.timestamp_us = timestamps[index];
            output.flags = propagate_flags(src_flags, index, out_count);
            output.frame_rate_multiplier = if di_ran && success { fields as u32 } else { 1 };
            output.algos_run = if success { plan.algos } else { AlgoMask::empty() };
            output.buffer_type = BufferType::Progressive;
            (self.buffer_done_cb)(PortDir::Output, output);
        }

        let mut shared = self.inner.shared.lock().unwrap();
        shared.proc_state = if success && plan.input_window >= shared.counts.input_into {
            ProcState::Active
        } else {
            ProcState::ActiveStart
        };
    }

    /// Failure path for a window that never reached the accelerator.
    fn return_aborted(&mut self, inputs: Vec<VppBuffer>, outputs: Vec<VppBuffer>) {
        for mut input in inputs {
            input.flags.clear_transient();
            (self.buffer_done_cb)(PortDir::Input, input);
        }
        for mut output in outputs {
            output.filled_len = 0;
            output.flags.flushed = false;
            output.algos_run = AlgoMask::empty();
            (self.buffer_done_cb)(PortDir::Output, output);
        }
    }

    fn requeue_lookahead(&mut self, lookahead: Vec<VppBuffer>, flush_epoch: u64) {
        if lookahead.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        let mut shared = inner.shared.lock().unwrap();
        if shared.input_flush_epoch != flush_epoch {
            // The client flushed the port while the pass was in flight; the
            // look-ahead must not reappear as pending work.
            drop(shared);
            for mut buffer in lookahead {
                buffer.flags.flushed = true;
                (self.buffer_done_cb)(PortDir::Input, buffer);
            }
            return;
        }
        shared.input_queue.requeue_front(lookahead);
    }
}
