// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The client-facing engine: buffer queueing, control delivery, and the
//! single worker thread that serializes commands with dispatch cycles.
//!
//! All entry points are non-blocking except `open`, `close` and
//! `reconfigure`, which post a command and wait on its completion channel.
//! The worker always drains the command ring before considering buffer work,
//! so commands are never reordered relative to each other or overtaken by
//! buffers queued after them.

use std::collections::VecDeque;
use std::sync::mpsc::sync_channel;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use anyhow::anyhow;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::admission::CycleCounts;
use crate::backend::BufferRequirements;
use crate::backend::VppBackend;
use crate::buffer::VppBuffer;
use crate::config::AlgoMask;
use crate::config::ConfigState;
use crate::config::Control;
use crate::port::PendingQueue;
use crate::port::PortDir;
use crate::port::PortParams;
use crate::tuning::TuningStore;
use crate::VppError;

mod worker;

use worker::Worker;

/// Session-level flags fixed at init.
#[derive(Copy, Clone, Debug, Default)]
pub struct InitFlags {
    /// The session processes protected content; buffers are not mappable.
    pub secure: bool,
}

/// Asynchronous completions delivered through the event callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    FlushDone(PortDir),
    DrainDone,
}

/// Per-buffer counts and sizes reported to the client for pool allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortRequirements {
    pub min_count: usize,
    pub px_size: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionRequirements {
    pub input: PortRequirements,
    pub output: PortRequirements,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EngineState {
    Inited,
    Active,
}

/// Continuity state of the processing path. `ActiveStart` forces the next
/// window to be treated as fresh, with no temporal history carried over.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ProcState {
    Inited,
    ActiveStart,
    Active,
}

pub(crate) enum Command {
    Open { done: SyncSender<Result<(), VppError>> },
    Close { done: SyncSender<Result<(), VppError>> },
    Reconfigure { input: PortParams, output: PortParams, done: SyncSender<Result<(), VppError>> },
    Flush { port: PortDir },
    Drain,
    ThreadExit,
}

/// Everything guarded by the engine lock. The lock is never held across the
/// accelerator's processing call.
pub(crate) struct Shared {
    pub state: EngineState,
    pub proc_state: ProcState,
    pub config: ConfigState,
    pub input_params: Option<PortParams>,
    pub output_params: Option<PortParams>,
    pub input_queue: PendingQueue,
    pub output_queue: PendingQueue,
    /// Bumped by every input-port flush so an in-flight dispatch can tell its
    /// look-ahead buffers must not silently rejoin the queue.
    pub input_flush_epoch: u64,
    pub commands: VecDeque<Command>,
    pub drain_pending: bool,
    pub max_requirements: BufferRequirements,
    pub counts: CycleCounts,
    pub secure: bool,
}

pub(crate) struct EngineInner {
    pub shared: Mutex<Shared>,
    pub wake: EventFd,
}

impl EngineInner {
    pub fn wake_worker(&self) {
        self.wake.write(1).unwrap();
    }
}

/// One post-processing engine instance with its dedicated worker thread.
pub struct VppEngine {
    inner: Arc<EngineInner>,
    worker_thread: Option<JoinHandle<()>>,
}

impl VppEngine {
    /// Creates the engine and spawns its worker. Both callbacks are invoked
    /// from the worker thread only: `buffer_done_cb` for every buffer handed
    /// back (exactly once per buffer), `event_cb` for flush/drain
    /// completions.
    pub fn new(
        flags: InitFlags,
        backend: Box<dyn VppBackend>,
        tuning: Box<dyn TuningStore>,
        buffer_done_cb: impl FnMut(PortDir, VppBuffer) + Send + 'static,
        event_cb: impl FnMut(EngineEvent) + Send + 'static,
    ) -> Result<Self, VppError> {
        let caps = backend.caps();
        if caps.intersection(AlgoMask::frame_algos()).is_empty() {
            return Err(VppError::Unsupported(
                "accelerator build supports no processing algorithm".into(),
            ));
        }

        let inner = Arc::new(EngineInner {
            shared: Mutex::new(Shared {
                state: EngineState::Inited,
                proc_state: ProcState::Inited,
                config: ConfigState::new(caps),
                input_params: None,
                output_params: None,
                input_queue: Default::default(),
                output_queue: Default::default(),
                input_flush_epoch: 0,
                commands: Default::default(),
                drain_pending: false,
                max_requirements: Default::default(),
                counts: CycleCounts::minimal(),
                secure: flags.secure,
            }),
            wake: EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .map_err(|e| VppError::Resources(format!("failed to create wake event: {e}")))?,
        });

        let worker_inner = inner.clone();
        let worker_thread = thread::Builder::new()
            .name("vpp-worker".into())
            .spawn(move || {
                Worker::new(
                    worker_inner,
                    backend,
                    tuning,
                    Box::new(buffer_done_cb),
                    Box::new(event_cb),
                )
                .run()
            })
            .map_err(|e| VppError::Resources(format!("failed to spawn worker: {e}")))?;

        Ok(Self { inner, worker_thread: Some(worker_thread) })
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    /// Sets one port's frame geometry. Only legal before `open`.
    pub fn set_param(&self, port: PortDir, params: PortParams) -> Result<(), VppError> {
        params.validate()?;
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != EngineState::Inited {
            return Err(VppError::InvalidState("port parameters are fixed while open"));
        }
        match port {
            PortDir::Input => shared.input_params = Some(params),
            PortDir::Output => shared.output_params = Some(params),
        }
        shared.config.mark_port_params_dirty();
        Ok(())
    }

    /// Applies one algorithm control. Legal in any state; takes effect before
    /// the next dispatch cycle.
    pub fn set_ctrl(&self, ctrl: Control) -> Result<(), VppError> {
        self.inner.shared.lock().unwrap().config.set_ctrl(ctrl)?;
        // The new configuration may change what is admissible.
        self.inner.wake_worker();
        Ok(())
    }

    /// Hands `buffer` to the engine. Ownership transfers to the port's
    /// pending queue; the buffer comes back through the buffer-done callback.
    pub fn queue_buf(&self, port: PortDir, buffer: VppBuffer) -> Result<(), VppError> {
        if buffer.valid_len == 0 {
            return Err(VppError::InvalidArgument("buffer has no capacity"));
        }
        if buffer.filled_len > buffer.valid_len {
            return Err(VppError::InvalidArgument("filled length exceeds buffer capacity"));
        }
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.state != EngineState::Active {
                return Err(VppError::InvalidState("queue_buf requires an open session"));
            }
            match port {
                PortDir::Input => shared.input_queue.push(buffer),
                PortDir::Output => shared.output_queue.push(buffer),
            }
        }
        self.inner.wake_worker();
        Ok(())
    }

    /// Opens the session: allocates accelerator resources and negotiates
    /// buffer requirements. Blocks until the worker finishes the transition.
    pub fn open(&self) -> Result<(), VppError> {
        self.blocking_command(|done| Command::Open { done })
    }

    /// Closes the session, returning any still-queued buffers as flushed.
    /// Blocks until the worker finishes the transition.
    pub fn close(&self) -> Result<(), VppError> {
        self.blocking_command(|done| Command::Close { done })
    }

    /// Replaces the port geometry of an active session. Requires an empty
    /// input queue; serialized with dispatches through the command ring.
    pub fn reconfigure(&self, input: PortParams, output: PortParams) -> Result<(), VppError> {
        input.validate()?;
        output.validate()?;
        self.blocking_command(|done| Command::Reconfigure { input, output, done })
    }

    /// Empties `port`'s pending queue, returning every buffer tagged as
    /// flushed. Completion is signaled with a flush-done event.
    pub fn flush(&self, port: PortDir) -> Result<(), VppError> {
        self.inner.shared.lock().unwrap().commands.push_back(Command::Flush { port });
        self.inner.wake_worker();
        Ok(())
    }

    /// Requests that all pending input be processed through. Completion is
    /// signaled with a drain-done event.
    pub fn drain(&self) -> Result<(), VppError> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.state != EngineState::Active {
                return Err(VppError::InvalidState("drain requires an open session"));
            }
            shared.commands.push_back(Command::Drain);
        }
        self.inner.wake_worker();
        Ok(())
    }

    /// Buffer counts and sizes the client should allocate for each port.
    pub fn buffer_requirements(&self) -> Result<SessionRequirements, VppError> {
        let shared = self.inner.shared.lock().unwrap();
        let input_params = shared
            .input_params
            .ok_or(VppError::InvalidState("input port parameters not set"))?;
        let output_params = shared
            .output_params
            .ok_or(VppError::InvalidState("output port parameters not set"))?;
        let (input_count, output_count) = match shared.state {
            EngineState::Active => {
                (shared.max_requirements.input_min, shared.max_requirements.output_min)
            }
            EngineState::Inited => (1, 1),
        };
        Ok(SessionRequirements {
            input: PortRequirements { min_count: input_count, px_size: input_params.frame_size() },
            output: PortRequirements {
                min_count: output_count,
                px_size: output_params.frame_size(),
            },
        })
    }

    fn blocking_command(
        &self,
        make: impl FnOnce(SyncSender<Result<(), VppError>>) -> Command,
    ) -> Result<(), VppError> {
        let (done, completion) = sync_channel(1);
        self.inner.shared.lock().unwrap().commands.push_back(make(done));
        self.inner.wake_worker();
        completion
            .recv()
            .map_err(|_| VppError::Internal(anyhow!("worker exited before completing command")))?
    }
}

// Teardown is RAII: return whatever is still queued, then stop the worker.
impl Drop for VppEngine {
    fn drop(&mut self) {
        {
            let (done, _completion) = sync_channel(1);
            let mut shared = self.inner.shared.lock().unwrap();
            shared.commands.push_back(Command::Close { done });
            shared.commands.push_back(Command::Flush { port: PortDir::Input });
            shared.commands.push_back(Command::Flush { port: PortDir::Output });
            shared.commands.push_back(Command::ThreadExit);
        }
        self.inner.wake_worker();
        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use anyhow::anyhow;

    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::dummy::DummyState;
    use crate::buffer::BufferType;
    use crate::buffer::FieldStats;
    use crate::config::Algo;
    use crate::config::AlgoRunMode;
    use crate::config::CnrControl;
    use crate::config::ControlMode;
    use crate::config::DiControl;
    use crate::config::DiMode;
    use crate::config::ALL_ALGOS;
    use crate::tuning::NoopTuningStore;
    use crate::PixelFormat;
    use crate::Resolution;

    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 64;

    fn params() -> PortParams {
        PortParams {
            size: Resolution { width: WIDTH, height: HEIGHT },
            pixel_format: PixelFormat::Nv12,
            stride: WIDTH,
            scanlines: HEIGHT,
        }
    }

    fn frame_len() -> usize {
        params().frame_size()
    }

    type Returned = Arc<Mutex<Vec<(PortDir, VppBuffer)>>>;
    type Events = Arc<Mutex<Vec<EngineEvent>>>;

    struct Harness {
        engine: VppEngine,
        returned: Returned,
        events: Events,
        backend: Arc<Mutex<DummyState>>,
    }

    fn harness(caps: &[Algo]) -> Harness {
        harness_with_tuning(caps, Box::new(NoopTuningStore))
    }

    fn harness_with_tuning(caps: &[Algo], tuning: Box<dyn TuningStore>) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = DummyBackend::new(AlgoMask::from_algos(caps));
        let backend_state = backend.state();
        let returned: Returned = Default::default();
        let events: Events = Default::default();
        let returned_cb = returned.clone();
        let events_cb = events.clone();
        let engine = VppEngine::new(
            InitFlags::default(),
            Box::new(backend),
            tuning,
            move |port, buffer| returned_cb.lock().unwrap().push((port, buffer)),
            move |event| events_cb.lock().unwrap().push(event),
        )
        .unwrap();
        engine.set_param(PortDir::Input, params()).unwrap();
        engine.set_param(PortDir::Output, params()).unwrap();
        Harness { engine, returned, events, backend: backend_state }
    }

    fn wait_for(mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn input_buf(cookie: u64, buffer_type: BufferType, ts: u64) -> VppBuffer {
        let mut buffer = VppBuffer::new(cookie, frame_len(), buffer_type);
        buffer.filled_len = frame_len();
        buffer.timestamp_us = ts;
        buffer
    }

    fn output_buf(cookie: u64) -> VppBuffer {
        VppBuffer::new(cookie, frame_len(), BufferType::Progressive)
    }

    fn enable_di(harness: &Harness) {
        harness.engine.set_ctrl(Control::Mode(ControlMode::Manual)).unwrap();
        harness
            .engine
            .set_ctrl(Control::Di(DiControl {
                mode: AlgoRunMode::Manual,
                di_mode: DiMode::ThreeField,
            }))
            .unwrap();
    }

    fn enable_cnr(harness: &Harness, level: u32) {
        harness.engine.set_ctrl(Control::Mode(ControlMode::Manual)).unwrap();
        harness
            .engine
            .set_ctrl(Control::Cnr(CnrControl { mode: AlgoRunMode::Manual, level }))
            .unwrap();
    }

    #[test]
    fn state_gating() {
        let h = harness(&ALL_ALGOS);
        assert!(h.engine.is_alive());
        // Pre-open: no close, no drain, no reconfigure, no buffers.
        assert!(matches!(h.engine.close(), Err(VppError::InvalidState(_))));
        assert!(matches!(h.engine.drain(), Err(VppError::InvalidState(_))));
        assert!(matches!(
            h.engine.reconfigure(params(), params()),
            Err(VppError::InvalidState(_))
        ));
        assert!(matches!(
            h.engine.queue_buf(PortDir::Input, input_buf(1, BufferType::Progressive, 0)),
            Err(VppError::InvalidState(_))
        ));

        h.engine.open().unwrap();
        // Port parameters are frozen while open.
        assert!(matches!(
            h.engine.set_param(PortDir::Input, params()),
            Err(VppError::InvalidState(_))
        ));

        h.engine.close().unwrap();
        assert!(matches!(h.engine.close(), Err(VppError::InvalidState(_))));
        // And the engine is reconfigurable again.
        h.engine.set_param(PortDir::Input, params()).unwrap();
    }

    #[test]
    fn open_fails_when_accelerator_declares_zero_buffers() {
        let h = harness(&ALL_ALGOS);
        h.backend.lock().unwrap().zero_requirements = true;
        assert!(matches!(h.engine.open(), Err(VppError::Resources(_))));
        // The failed transition leaves the engine pre-open; a retry with a
        // healthy accelerator succeeds.
        h.backend.lock().unwrap().zero_requirements = false;
        h.engine.open().unwrap();
    }

    #[test]
    fn open_propagates_accelerator_setup_failure() {
        let h = harness(&ALL_ALGOS);
        h.backend.lock().unwrap().fail_open = true;
        assert!(matches!(h.engine.open(), Err(VppError::Resources(_))));
        h.engine.open().unwrap();
    }

    #[test]
    fn bypass_when_everything_disabled() {
        let h = harness(&ALL_ALGOS);
        h.engine.open().unwrap();

        let mut input = input_buf(1, BufferType::Progressive, 777);
        input.flags.sync_frame = true;
        h.engine.queue_buf(PortDir::Input, input).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(2)).unwrap();

        wait_for(|| !h.returned.lock().unwrap().is_empty());
        {
            let returned = h.returned.lock().unwrap();
            assert_eq!(returned.len(), 1);
            let (port, buffer) = &returned[0];
            // The input buffer is spliced through to the output port with its
            // metadata untouched; the queued output buffer stays available.
            assert_eq!(*port, PortDir::Output);
            assert_eq!(buffer.cookie, 1);
            assert_eq!(buffer.timestamp_us, 777);
            assert!(buffer.flags.sync_frame);
            assert!(buffer.algos_run.is_empty());
        }
        assert!(h.backend.lock().unwrap().process_calls.is_empty());
    }

    #[test]
    fn di_only_with_progressive_input_bypasses() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        h.engine.open().unwrap();

        h.engine.queue_buf(PortDir::Input, input_buf(7, BufferType::Progressive, 123)).unwrap();
        wait_for(|| !h.returned.lock().unwrap().is_empty());
        let returned = h.returned.lock().unwrap();
        assert_eq!(returned[0].0, PortDir::Output);
        assert_eq!(returned[0].1.cookie, 7);
        assert_eq!(returned[0].1.timestamp_us, 123);
        assert!(h.backend.lock().unwrap().process_calls.is_empty());
    }

    #[test]
    fn bypass_flagged_input_needs_no_output_buffer() {
        let h = harness(&ALL_ALGOS);
        enable_cnr(&h, 64);
        h.engine.open().unwrap();

        let mut input = input_buf(1, BufferType::Progressive, 42);
        input.flags.internal_bypass = true;
        h.engine.queue_buf(PortDir::Input, input).unwrap();

        wait_for(|| !h.returned.lock().unwrap().is_empty());
        let returned = h.returned.lock().unwrap();
        assert_eq!(returned[0].0, PortDir::Output);
        assert_eq!(returned[0].1.cookie, 1);
        // The flag that made it a bypass describes the outcome and stays.
        assert!(returned[0].1.flags.internal_bypass);
        assert!(h.backend.lock().unwrap().process_calls.is_empty());
    }

    #[test]
    fn unsupported_buffer_type_passes_through() {
        let h = harness(&ALL_ALGOS);
        enable_cnr(&h, 64);
        h.engine.open().unwrap();

        h.engine
            .queue_buf(PortDir::Input, input_buf(3, BufferType::Unsupported(9), 55))
            .unwrap();
        wait_for(|| !h.returned.lock().unwrap().is_empty());
        let returned = h.returned.lock().unwrap();
        assert_eq!(returned[0].0, PortDir::Output);
        assert_eq!(returned[0].1.buffer_type, BufferType::Unsupported(9));
    }

    #[test]
    fn di_consumes_three_field_window() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        h.engine.open().unwrap();

        for (cookie, ts) in [(10, 1000), (11, 2000), (12, 3000)] {
            h.engine
                .queue_buf(PortDir::Input, input_buf(cookie, BufferType::InterleavedTopFirst, ts))
                .unwrap();
        }
        h.engine.queue_buf(PortDir::Output, output_buf(20)).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(21)).unwrap();

        wait_for(|| h.returned.lock().unwrap().len() >= 3);
        {
            let state = h.backend.lock().unwrap();
            assert_eq!(state.process_calls.len(), 1);
            let job = &state.process_calls[0];
            assert_eq!(job.input_cookies, vec![10, 11, 12]);
            assert_eq!(job.output_cookies, vec![20, 21]);
            assert!(job.algos.contains(Algo::Di));
            assert!(job.fresh_window);
        }
        let returned = h.returned.lock().unwrap();
        assert_eq!(returned.len(), 3);
        // The window head retires; the two look-ahead buffers stay queued.
        assert_eq!(returned[0].0, PortDir::Input);
        assert_eq!(returned[0].1.cookie, 10);
        let out0 = &returned[1].1;
        let out1 = &returned[2].1;
        assert_eq!((out0.cookie, out0.timestamp_us), (20, 1000));
        // Field 1 interpolates halfway to the next buffer's timestamp.
        assert_eq!((out1.cookie, out1.timestamp_us), (21, 1500));
        assert!(out0.algos_run.contains(Algo::Di));
        assert_eq!(out0.frame_rate_multiplier, 2);
        assert!(out0.filled_len > 0);
        assert_eq!(out0.buffer_type, BufferType::Progressive);
    }

    #[test]
    fn drain_returns_every_buffer_exactly_once() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        h.engine.open().unwrap();

        for cookie in 0..5u64 {
            h.engine
                .queue_buf(
                    PortDir::Input,
                    input_buf(cookie, BufferType::InterleavedTopFirst, 1000 * (cookie + 1)),
                )
                .unwrap();
        }
        for cookie in 100..110u64 {
            h.engine.queue_buf(PortDir::Output, output_buf(cookie)).unwrap();
        }
        h.engine.drain().unwrap();
        wait_for(|| h.events.lock().unwrap().contains(&EngineEvent::DrainDone));

        let returned = h.returned.lock().unwrap();
        let inputs: Vec<u64> = returned
            .iter()
            .filter(|(port, _)| *port == PortDir::Input)
            .map(|(_, b)| b.cookie)
            .collect();
        // Every input exactly once, in FIFO order.
        assert_eq!(inputs, vec![0, 1, 2, 3, 4]);
        let outputs: Vec<&VppBuffer> = returned
            .iter()
            .filter(|(port, _)| *port == PortDir::Output)
            .map(|(_, b)| b)
            .collect();
        assert_eq!(outputs.iter().map(|b| b.cookie).collect::<Vec<_>>(), (100..110).collect::<Vec<_>>());
        // Output timestamps never run backwards.
        for pair in outputs.windows(2) {
            assert!(pair[0].timestamp_us <= pair[1].timestamp_us);
        }
        assert_eq!(h.events.lock().unwrap().iter().filter(|e| **e == EngineEvent::DrainDone).count(), 1);
    }

    #[test]
    fn drain_with_empty_input_completes_immediately() {
        let h = harness(&ALL_ALGOS);
        h.engine.open().unwrap();
        h.engine.drain().unwrap();
        wait_for(|| h.events.lock().unwrap().contains(&EngineEvent::DrainDone));
        assert!(h.returned.lock().unwrap().is_empty());
    }

    #[test]
    fn eos_head_dispatches_without_full_window() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        h.engine.open().unwrap();

        let mut input = input_buf(1, BufferType::InterleavedTopFirst, 9000);
        input.flags.eos = true;
        h.engine.queue_buf(PortDir::Input, input).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(2)).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(3)).unwrap();

        wait_for(|| h.returned.lock().unwrap().len() >= 3);
        let returned = h.returned.lock().unwrap();
        let outputs: Vec<&VppBuffer> = returned
            .iter()
            .filter(|(port, _)| *port == PortDir::Output)
            .map(|(_, b)| b)
            .collect();
        assert_eq!(outputs.len(), 2);
        // End-of-stream marks the last output of the cycle only.
        assert!(!outputs[0].flags.eos);
        assert!(outputs[1].flags.eos);
        assert_eq!(outputs[1].timestamp_us, 9000);
    }

    #[test]
    fn progressive_head_skips_di_but_runs_the_rest() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        h.engine
            .set_ctrl(Control::Cnr(CnrControl { mode: AlgoRunMode::Manual, level: 32 }))
            .unwrap();
        h.engine.open().unwrap();

        h.engine.queue_buf(PortDir::Input, input_buf(1, BufferType::Progressive, 100)).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(2)).unwrap();

        wait_for(|| h.returned.lock().unwrap().len() >= 2);
        {
            let state = h.backend.lock().unwrap();
            assert_eq!(state.process_calls.len(), 1);
            let job = &state.process_calls[0];
            assert!(!job.algos.contains(Algo::Di));
            assert!(job.algos.contains(Algo::Cnr));
            assert_eq!(job.input_cookies, vec![1]);
        }
        let returned = h.returned.lock().unwrap();
        let output = returned.iter().find(|(port, _)| *port == PortDir::Output).unwrap();
        assert_eq!(output.1.frame_rate_multiplier, 1);
        assert_eq!(output.1.timestamp_us, 100);
        assert!(output.1.algos_run.contains(Algo::Cnr));
    }

    #[test]
    fn failed_dispatch_still_returns_buffers() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        h.engine.open().unwrap();
        h.backend.lock().unwrap().fail_process = 1;

        for (cookie, ts) in [(1, 1000), (2, 2000), (3, 3000)] {
            h.engine
                .queue_buf(PortDir::Input, input_buf(cookie, BufferType::InterleavedTopFirst, ts))
                .unwrap();
        }
        h.engine.queue_buf(PortDir::Output, output_buf(10)).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(11)).unwrap();

        wait_for(|| h.returned.lock().unwrap().len() >= 3);
        {
            let returned = h.returned.lock().unwrap();
            assert_eq!(returned[0].0, PortDir::Input);
            assert_eq!(returned[0].1.cookie, 1);
            for (_, output) in returned.iter().filter(|(port, _)| *port == PortDir::Output) {
                assert_eq!(output.filled_len, 0);
                assert!(output.algos_run.is_empty());
            }
        }

        // The next window must start fresh after the failure.
        h.engine
            .queue_buf(PortDir::Input, input_buf(4, BufferType::InterleavedTopFirst, 4000))
            .unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(12)).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(13)).unwrap();
        wait_for(|| h.backend.lock().unwrap().process_calls.len() >= 2);
        let state = h.backend.lock().unwrap();
        assert_eq!(state.process_calls[1].input_cookies, vec![2, 3, 4]);
        assert!(state.process_calls[1].fresh_window);
    }

    #[test]
    fn undersized_input_aborts_cycle_but_returns_buffers() {
        let h = harness(&ALL_ALGOS);
        enable_cnr(&h, 64);
        h.engine.open().unwrap();

        let mut input = input_buf(1, BufferType::Progressive, 0);
        input.filled_len = 16;
        h.engine.queue_buf(PortDir::Input, input).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(2)).unwrap();

        wait_for(|| h.returned.lock().unwrap().len() >= 2);
        let returned = h.returned.lock().unwrap();
        assert_eq!(returned.len(), 2);
        let output = returned.iter().find(|(port, _)| *port == PortDir::Output).unwrap();
        assert_eq!(output.1.filled_len, 0);
        assert!(h.backend.lock().unwrap().process_calls.is_empty());
    }

    #[test]
    fn tuning_write_failure_does_not_fail_dispatch() {
        struct FailingTuningStore;
        impl TuningStore for FailingTuningStore {
            fn register(&mut self, _algo: Algo) -> anyhow::Result<()> {
                Ok(())
            }
            fn unregister(&mut self, _algo: Algo) {}
            fn record_stats(&mut self, _algo: Algo, _stats: &FieldStats) -> anyhow::Result<()> {
                Err(anyhow!("tuning store unavailable"))
            }
        }

        let h = harness_with_tuning(&ALL_ALGOS, Box::new(FailingTuningStore));
        enable_cnr(&h, 128);
        h.engine.open().unwrap();

        h.engine.queue_buf(PortDir::Input, input_buf(1, BufferType::Progressive, 500)).unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(2)).unwrap();

        wait_for(|| h.returned.lock().unwrap().len() >= 2);
        let returned = h.returned.lock().unwrap();
        let output = returned.iter().find(|(port, _)| *port == PortDir::Output).unwrap();
        // The dispatch itself still reports success.
        assert!(output.1.algos_run.contains(Algo::Cnr));
        assert!(output.1.filled_len > 0);
    }

    #[test]
    fn reconfigure_requires_quiescent_input() {
        let h = harness(&ALL_ALGOS);
        enable_cnr(&h, 64);
        h.engine.open().unwrap();

        // No output buffer is queued, so this input stays pending.
        h.engine.queue_buf(PortDir::Input, input_buf(1, BufferType::Progressive, 0)).unwrap();
        let bigger = PortParams {
            size: Resolution { width: 128, height: 128 },
            pixel_format: PixelFormat::Nv12,
            stride: 128,
            scanlines: 128,
        };
        assert!(matches!(
            h.engine.reconfigure(bigger, bigger),
            Err(VppError::InvalidState(_))
        ));

        h.engine.flush(PortDir::Input).unwrap();
        wait_for(|| h.events.lock().unwrap().contains(&EngineEvent::FlushDone(PortDir::Input)));
        h.engine.reconfigure(bigger, bigger).unwrap();

        let returned = h.returned.lock().unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].0, PortDir::Input);
        assert!(returned[0].1.flags.flushed);
    }

    #[test]
    fn flush_returns_queued_outputs() {
        let h = harness(&ALL_ALGOS);
        h.engine.open().unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(5)).unwrap();
        h.engine.flush(PortDir::Output).unwrap();
        wait_for(|| h.events.lock().unwrap().contains(&EngineEvent::FlushDone(PortDir::Output)));
        let returned = h.returned.lock().unwrap();
        assert_eq!(returned.len(), 1);
        assert!(returned[0].1.flags.flushed);
        assert_eq!(returned[0].1.filled_len, 0);
    }

    #[test]
    fn close_returns_pending_buffers() {
        let h = harness(&ALL_ALGOS);
        h.engine.open().unwrap();
        h.engine.queue_buf(PortDir::Output, output_buf(9)).unwrap();
        h.engine.close().unwrap();
        // Close is synchronous; the flushed buffer is already back.
        {
            let returned = h.returned.lock().unwrap();
            assert_eq!(returned.len(), 1);
            assert!(returned[0].1.flags.flushed);
        }
        // The engine can be reopened afterwards.
        h.engine.open().unwrap();
    }

    #[test]
    fn buffer_requirements_reflect_negotiation() {
        let h = harness(&ALL_ALGOS);
        enable_di(&h);
        let before = h.engine.buffer_requirements().unwrap();
        assert_eq!(before.input.min_count, 1);
        assert_eq!(before.input.px_size, frame_len());

        h.engine.open().unwrap();
        let after = h.engine.buffer_requirements().unwrap();
        assert_eq!(after.input.min_count, 3);
        assert_eq!(after.output.min_count, 2);
        assert_eq!(after.output.px_size, frame_len());
    }
}
