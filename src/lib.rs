// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated video post-processing front-end for Linux.
//!
//! This crate sits between a client that produces filled input frames (and empty
//! output frames) and an opaque accelerator that performs deinterlacing (DI),
//! chroma noise reduction (CNR) and adaptive image enhancement (AIE). The
//! engine decides per frame whether enough buffers of the right shape are
//! queued to dispatch an accelerated pass, negotiates how many buffers each
//! enabled algorithm needs, and returns processed or bypassed buffers to the
//! client exactly once.

pub mod admission;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod port;
pub mod tuning;

use std::str::FromStr;

use enumn::N;
use thiserror::Error;

/// Smallest frame dimensions the engine will accept.
pub const MIN_FRAME_WIDTH: u32 = 32;
pub const MIN_FRAME_HEIGHT: u32 = 32;
/// Largest frame dimensions the accelerator pipeline is qualified for.
pub const MAX_FRAME_WIDTH: u32 = 4096;
pub const MAX_FRAME_HEIGHT: u32 = 2176;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Pixel formats accepted on either port. The numeric values are the tags used
/// by clients driving the engine over an FFI boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum PixelFormat {
    Nv12 = 1,
    Nv21 = 2,
    P010 = 3,
    /// Bandwidth-compressed NV12. Stride/scanline rules do not apply; the
    /// compressed plane layout is opaque to the engine.
    Nv12Ubwc = 4,
}

impl PixelFormat {
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Nv12Ubwc)
    }

    /// Bytes per luma sample. Chroma is always 4:2:0 subsampled.
    fn bytes_per_sample(&self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Nv12Ubwc => 1,
            PixelFormat::P010 => 2,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(PixelFormat::Nv12),
            "nv21" | "NV21" => Ok(PixelFormat::Nv21),
            "p010" | "P010" => Ok(PixelFormat::P010),
            "nv12_ubwc" | "NV12_UBWC" => Ok(PixelFormat::Nv12Ubwc),
            _ => Err("unrecognized pixel format. Valid values: nv12, nv21, p010, nv12_ubwc"),
        }
    }
}

pub fn align_up(x: usize, alignment: usize) -> usize {
    (x + alignment - 1) / alignment * alignment
}

/// Returns the minimum number of bytes one frame of `format` occupies at
/// `width`x`height`, without any padding. Compressed formats are sized from
/// their hardware macro-tile alignment instead of the visible dimensions.
pub fn frame_size(format: PixelFormat, width: usize, height: usize) -> usize {
    match format {
        PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::P010 => {
            let y_size = width * height;
            // UV plane is aligned to 2 in both dimensions.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            (y_size + uv_size) * format.bytes_per_sample()
        }
        PixelFormat::Nv12Ubwc => {
            // Worst-case compressed footprint: tile-aligned NV12 plus the
            // per-tile metadata planes.
            let y_size = align_up(width, 128) * align_up(height, 32);
            let uv_size = align_up(width, 128) * align_up((height + 1) / 2, 32);
            let meta_size = align_up(width / 32 + 1, 64) * align_up(height / 8 + 1, 16) * 2;

            y_size + uv_size + meta_size
        }
    }
}

/// Errors surfaced to clients of the engine.
#[derive(Debug, Error)]
pub enum VppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("operation not valid in the current state: {0}")]
    InvalidState(&'static str),
    #[error("out of resources: {0}")]
    Resources(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
