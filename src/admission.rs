// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame admission and window planning.
//!
//! Everything in this module is a pure function over a snapshot of the queue
//! state taken under the engine lock: given the same snapshot and
//! configuration, the same decision comes out. The worker uses [`admission`]
//! both as its dispatch gate and as its sleep condition, and [`plan_cycle`]
//! to turn an admitted frame into concrete buffer counts.

use thiserror::Error;

use crate::backend::BufferRequirements;
use crate::buffer::BufferFlags;
use crate::buffer::BufferType;
use crate::buffer::VppBuffer;
use crate::config::Algo;
use crate::config::AlgoMask;

/// Metadata of one queued buffer, copied out so decisions never borrow the
/// queue itself.
#[derive(Copy, Clone, Debug)]
pub struct BufferMeta {
    pub buffer_type: BufferType,
    pub flags: BufferFlags,
    pub filled_len: usize,
}

impl From<&VppBuffer> for BufferMeta {
    fn from(buffer: &VppBuffer) -> Self {
        Self {
            buffer_type: buffer.buffer_type,
            flags: buffer.flags,
            filled_len: buffer.filled_len,
        }
    }
}

/// Queue state relevant to one admission decision.
#[derive(Clone, Debug, Default)]
pub struct QueueSnapshot {
    pub input_depth: usize,
    pub output_depth: usize,
    /// Metadata of the head of the input queue, up to the session's
    /// into-process count (fewer when the queue is shorter).
    pub input_window: Vec<BufferMeta>,
}

/// The session's negotiated buffer counts.
///
/// `into` counts are how many buffers a dispatch examines; `outof` counts are
/// how many it removes and returns. The difference on the input side is the
/// temporal look-ahead that stays queued for the next cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CycleCounts {
    pub input_into: usize,
    pub input_outof: usize,
    pub output_into: usize,
    pub output_outof: usize,
}

impl CycleCounts {
    /// Derives the session counts from what the accelerator declared. A
    /// multi-buffer input requirement means temporal look-ahead: only the
    /// window head retires each cycle.
    pub fn from_requirements(req: BufferRequirements) -> Self {
        let input_into = req.input_min.max(1);
        Self {
            input_into,
            input_outof: 1.min(input_into),
            output_into: req.output_min.max(1),
            output_outof: req.output_min.max(1),
        }
    }

    /// Single-buffer counts used while nothing is negotiated.
    pub fn minimal() -> Self {
        Self { input_into: 1, input_outof: 1, output_into: 1, output_outof: 1 }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BypassReason {
    /// The head buffer itself asks to be passed through (flushed or tagged
    /// for internal bypass).
    ClientFlagged,
    /// The head buffer's type tag is not one the pipeline understands.
    UnsupportedType,
    /// The enabled algorithm set cannot do anything with this buffer shape,
    /// e.g. DI alone with a progressive head.
    ConfigBypass,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    NotReady,
    Bypass(BypassReason),
    Dispatch,
}

impl Admission {
    pub fn is_admissible(&self) -> bool {
        !matches!(self, Admission::NotReady)
    }
}

/// Which of the enabled algorithms can run on a buffer of the given type.
///
/// DI only makes sense on interleaved content, and without DI the remaining
/// algorithms cannot consume interleaved content at all.
pub fn algos_for_buffer(enabled: AlgoMask, buffer_type: BufferType) -> AlgoMask {
    let frame = enabled.intersection(AlgoMask::frame_algos());
    match buffer_type {
        BufferType::Progressive => {
            let mut mask = frame;
            mask.remove(Algo::Di);
            mask
        }
        BufferType::InterleavedTopFirst | BufferType::InterleavedBottomFirst => {
            if frame.contains(Algo::Di) {
                frame
            } else {
                AlgoMask::empty()
            }
        }
        BufferType::Unsupported(_) => AlgoMask::empty(),
    }
}

/// The counts governing a cycle whose head has the given type: the full
/// negotiated window when DI will run on it, a single-buffer pass otherwise.
/// This is how a progressive frame in a DI-enabled session avoids waiting
/// for a field window that will never be used.
pub fn counts_for_head(
    session: CycleCounts,
    enabled: AlgoMask,
    head_type: BufferType,
) -> CycleCounts {
    if algos_for_buffer(enabled, head_type).contains(Algo::Di) {
        session
    } else {
        CycleCounts::minimal()
    }
}

/// The admission predicate. First matching rule wins.
pub fn admission(
    snapshot: &QueueSnapshot,
    counts: CycleCounts,
    enabled: AlgoMask,
    drain_pending: bool,
) -> Admission {
    // 1. Nothing to do without input.
    let head = match snapshot.input_window.first() {
        Some(head) => *head,
        None => return Admission::NotReady,
    };

    // 2. The head asks for bypass on its own; no output buffer is needed to
    // splice it through.
    if head.flags.wants_bypass() {
        return Admission::Bypass(BypassReason::ClientFlagged);
    }

    // 3. Unrecognized buffer shape passes through untouched.
    if !head.buffer_type.is_supported() {
        return Admission::Bypass(BypassReason::UnsupportedType);
    }

    // 4. The configuration cannot process this shape.
    if algos_for_buffer(enabled, head.buffer_type).is_empty() {
        return Admission::Bypass(BypassReason::ConfigBypass);
    }

    // Rules below compare against the counts this particular head needs,
    // which collapse to a single-buffer pass when DI sits this one out.
    let counts = counts_for_head(counts, enabled, head.buffer_type);

    // 5. A processing pass needs somewhere to write.
    if snapshot.output_depth == 0 {
        return Admission::NotReady;
    }

    // 6. Steady state: full window on both ports.
    if snapshot.input_depth >= counts.input_into && snapshot.output_depth >= counts.output_into {
        return Admission::Dispatch;
    }

    // 7. A drain flushes partial windows through.
    if drain_pending && snapshot.output_depth >= counts.output_outof {
        return Admission::Dispatch;
    }

    // 8. A stream-final or bypass-flagged buffer inside the window must not
    // wait for buffers that will never come.
    if snapshot.output_depth >= counts.output_outof
        && snapshot
            .input_window
            .iter()
            .take(counts.input_into)
            .any(|meta| meta.flags.eos || meta.flags.internal_bypass)
    {
        return Admission::Dispatch;
    }

    // 9. Wait for more buffers.
    Admission::NotReady
}

/// The concrete shape of one dispatch cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CyclePlan {
    /// No algorithm runs; the head input is spliced through to the output
    /// port and no output buffer is consumed.
    pub bypass: bool,
    /// DI is enabled for the session but skipped for this cycle because the
    /// head is progressive while CNR/AIE still run.
    pub skip_di: bool,
    /// Algorithms that run this cycle.
    pub algos: AlgoMask,
    /// Input buffers handed to the accelerator, look-ahead included.
    pub input_window: usize,
    /// Input buffers retired (removed and returned) this cycle.
    pub input_consumed: usize,
    /// Output buffers consumed, filled and returned this cycle.
    pub output_consumed: usize,
}

impl CyclePlan {
    fn bypass_splice() -> Self {
        Self {
            bypass: true,
            skip_di: false,
            algos: AlgoMask::empty(),
            input_window: 1,
            input_consumed: 1,
            output_consumed: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("input buffer {index} too short: {filled} bytes filled, {required} required")]
    ShortBuffer { index: usize, filled: usize, required: usize },
}

/// Inspects the actual head buffers of an admitted frame and fixes the cycle
/// shape: bypass or process, DI skipped or not, and how far the input window
/// reaches before a flagged or shape-mismatched buffer truncates it.
///
/// `window` holds the metadata of the first `counts.input_into` queued input
/// buffers (fewer when the queue is shorter); `min_input_len` is the port's
/// minimum filled length for a frame.
pub fn plan_cycle(
    window: &[BufferMeta],
    counts: CycleCounts,
    enabled: AlgoMask,
    min_input_len: usize,
) -> Result<CyclePlan, WindowError> {
    let head = window[0];
    let head_algos = algos_for_buffer(enabled, head.buffer_type);

    if head.flags.wants_bypass() || !head.buffer_type.is_supported() || head_algos.is_empty() {
        return Ok(CyclePlan::bypass_splice());
    }

    if head.filled_len < min_input_len {
        if head.flags.eos {
            // An undersized end-of-stream marker carries no frame; splice it.
            return Ok(CyclePlan::bypass_splice());
        }
        return Err(WindowError::ShortBuffer {
            index: 0,
            filled: head.filled_len,
            required: min_input_len,
        });
    }

    let mut algos = head_algos;
    if enabled.contains(Algo::Demo) {
        algos.insert(Algo::Demo);
    }

    let di_runs = head_algos.contains(Algo::Di);
    let skip_di = enabled.contains(Algo::Di) && !di_runs;

    if !di_runs {
        return Ok(CyclePlan {
            bypass: false,
            skip_di,
            algos,
            input_window: 1,
            input_consumed: 1,
            output_consumed: 1,
        });
    }

    // DI path: walk the look-ahead and stop at the first buffer that must
    // not share an accelerator call with the head.
    let mut window_len = window.len().min(counts.input_into);
    for (index, meta) in window.iter().enumerate().take(window_len).skip(1) {
        if meta.flags.wants_bypass() || meta.buffer_type != head.buffer_type {
            window_len = index;
            break;
        }
        if meta.filled_len < min_input_len && !meta.flags.eos {
            // A short look-ahead buffer cannot feed the motion filter.
            window_len = index;
            break;
        }
    }

    Ok(CyclePlan {
        bypass: false,
        skip_di: false,
        algos,
        input_window: window_len,
        input_consumed: counts.input_outof.min(window_len),
        output_consumed: counts.output_outof,
    })
}

/// Output timestamps for a deinterlacing pass. Output `k` covers field `k` of
/// the window head: field 0 shares the head's timestamp, later fields
/// interpolate toward the following buffer's timestamp by field position.
/// Without a forward reference (stream tail) the head timestamp repeats.
pub fn di_timestamps(
    head_ts: u64,
    next_ts: Option<u64>,
    fields: u64,
    out_count: usize,
) -> Vec<u64> {
    (0..out_count as u64)
        .map(|k| match next_ts {
            Some(next) if k > 0 && next > head_ts => head_ts + (next - head_ts) * k / fields,
            _ => head_ts,
        })
        .collect()
}

/// Index of the window buffer that donates stream-level metadata (sync-frame
/// marks, corruption, extradata) to this cycle's outputs. Motion-adaptive
/// interleaved windows center on the second buffer; every other shape reads
/// the head.
pub fn propagation_source(window_len: usize, buffer_type: BufferType) -> usize {
    if buffer_type.is_interleaved() && window_len >= 3 {
        1
    } else {
        0
    }
}

/// How the source buffer's flags land on output `out_index` of `out_count`.
/// End-of-stream marks only the last output of the cycle, a sync frame only
/// the first; corruption and dump marks apply to all of them. Transient flags
/// never propagate.
pub fn propagate_flags(src: BufferFlags, out_index: usize, out_count: usize) -> BufferFlags {
    BufferFlags {
        eos: src.eos && out_index + 1 == out_count,
        corrupt: src.corrupt,
        sync_frame: src.sync_frame && out_index == 0,
        flushed: false,
        internal_bypass: false,
        dump: src.dump,
    }
}
