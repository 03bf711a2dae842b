// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The buffer model shared by both ports and the dispatch path.
//!
//! Buffers are owned values: a queued buffer belongs to its port's pending
//! queue, a buffer removed for a dispatch cycle belongs to the worker, and the
//! return path moves it into the buffer-done callback. Returning a buffer
//! twice is unrepresentable.

use crate::config::AlgoMask;

/// Scan structure of the payload carried by a buffer, as tagged by the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferType {
    Progressive,
    InterleavedTopFirst,
    InterleavedBottomFirst,
    /// Any tag the engine does not recognize. Carried through so the buffer
    /// can be bypassed rather than rejected.
    Unsupported(u32),
}

impl BufferType {
    const TAG_PROGRESSIVE: u32 = 0;
    const TAG_INTERLEAVED_TB: u32 = 1;
    const TAG_INTERLEAVED_BT: u32 = 2;

    pub fn from_tag(tag: u32) -> Self {
        match tag {
            Self::TAG_PROGRESSIVE => BufferType::Progressive,
            Self::TAG_INTERLEAVED_TB => BufferType::InterleavedTopFirst,
            Self::TAG_INTERLEAVED_BT => BufferType::InterleavedBottomFirst,
            other => BufferType::Unsupported(other),
        }
    }

    pub fn tag(&self) -> u32 {
        match self {
            BufferType::Progressive => Self::TAG_PROGRESSIVE,
            BufferType::InterleavedTopFirst => Self::TAG_INTERLEAVED_TB,
            BufferType::InterleavedBottomFirst => Self::TAG_INTERLEAVED_BT,
            BufferType::Unsupported(other) => *other,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, BufferType::Unsupported(_))
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self, BufferType::InterleavedTopFirst | BufferType::InterleavedBottomFirst)
    }

    /// Number of displayable fields woven into one buffer of this type.
    pub fn fields_per_buffer(&self) -> u64 {
        if self.is_interleaved() {
            2
        } else {
            1
        }
    }
}

/// Per-buffer flags. `flushed` and `internal_bypass` are transient: they
/// describe how this pass through the engine should treat the buffer and are
/// cleared before the buffer goes back to the client queue-side.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub eos: bool,
    pub corrupt: bool,
    pub sync_frame: bool,
    pub flushed: bool,
    pub internal_bypass: bool,
    pub dump: bool,
}

impl BufferFlags {
    /// Whether the flags alone force this buffer onto the bypass path.
    pub fn wants_bypass(&self) -> bool {
        self.internal_bypass || self.flushed
    }

    pub fn clear_transient(&mut self) {
        self.flushed = false;
        self.internal_bypass = false;
    }
}

/// Per-field statistics reported by the accelerator after a processing pass.
/// Fed to the tuning store so future auto-mode sessions start from measured
/// content characteristics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldStats {
    pub motion: u32,
    pub noise: u32,
    pub peak_level: u32,
}

/// An opaque video buffer handle.
///
/// The engine never touches pixel data; `cookie` is how the client recognizes
/// its buffer when it comes back through the buffer-done callback.
#[derive(Clone, Debug)]
pub struct VppBuffer {
    pub cookie: u64,
    /// Bytes of valid payload currently in the buffer.
    pub filled_len: usize,
    /// Total usable capacity of the allocation.
    pub valid_len: usize,
    pub buffer_type: BufferType,
    pub flags: BufferFlags,
    pub timestamp_us: u64,
    /// Output frame rate relative to the input nominal rate. Field-rate
    /// deinterlacing doubles it.
    pub frame_rate_multiplier: u32,
    /// Which algorithms actually ran on the cycle that produced this buffer.
    /// Empty for bypassed buffers.
    pub algos_run: AlgoMask,
    pub field_stats: [FieldStats; 2],
}

impl VppBuffer {
    pub fn new(cookie: u64, valid_len: usize, buffer_type: BufferType) -> Self {
        Self {
            cookie,
            filled_len: 0,
            valid_len,
            buffer_type,
            flags: Default::default(),
            timestamp_us: 0,
            frame_rate_multiplier: 1,
            algos_run: AlgoMask::empty(),
            field_stats: Default::default(),
        }
    }
}
