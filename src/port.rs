// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ports and their pending buffer queues.

use std::collections::VecDeque;

use crate::buffer::VppBuffer;
use crate::frame_size;
use crate::PixelFormat;
use crate::Resolution;
use crate::VppError;
use crate::MAX_FRAME_HEIGHT;
use crate::MAX_FRAME_WIDTH;
use crate::MIN_FRAME_HEIGHT;
use crate::MIN_FRAME_WIDTH;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortDir {
    Input,
    Output,
}

/// Geometry and layout of the frames travelling through one port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortParams {
    pub size: Resolution,
    pub pixel_format: PixelFormat,
    /// Line stride in pixels.
    pub stride: u32,
    /// Number of allocated lines.
    pub scanlines: u32,
}

impl PortParams {
    pub fn validate(&self) -> Result<(), VppError> {
        if self.size.width < MIN_FRAME_WIDTH || self.size.height < MIN_FRAME_HEIGHT {
            return Err(VppError::InvalidArgument("frame dimensions below minimum"));
        }
        if self.size.width > MAX_FRAME_WIDTH || self.size.height > MAX_FRAME_HEIGHT {
            return Err(VppError::InvalidArgument("frame dimensions above maximum"));
        }
        // Compressed layouts are tiled; stride and scanlines are not
        // meaningful for them.
        if !self.pixel_format.is_compressed() {
            if self.size.width > self.stride {
                return Err(VppError::InvalidArgument("width exceeds stride"));
            }
            if self.size.height > self.scanlines {
                return Err(VppError::InvalidArgument("height exceeds scanlines"));
            }
        }
        Ok(())
    }

    /// Minimum byte size of one frame with these parameters.
    pub fn frame_size(&self) -> usize {
        frame_size(self.pixel_format, self.size.width as usize, self.size.height as usize)
    }
}

/// FIFO of buffers owned by a port. Buffers can be peeked by offset without a
/// change of ownership; removal moves them out.
#[derive(Default)]
pub struct PendingQueue {
    queue: VecDeque<VppBuffer>,
}

impl PendingQueue {
    pub fn push(&mut self, buffer: VppBuffer) {
        self.queue.push_back(buffer);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn peek(&self, offset: usize) -> Option<&VppBuffer> {
        self.queue.get(offset)
    }

    pub fn pop(&mut self) -> Option<VppBuffer> {
        self.queue.pop_front()
    }

    /// Removes and returns the first `n` buffers, preserving order. Panics if
    /// fewer than `n` are queued; callers size their window from the queue
    /// depth they observed under the same lock.
    pub fn remove_first(&mut self, n: usize) -> Vec<VppBuffer> {
        assert!(n <= self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Puts look-ahead buffers back at the head of the queue, preserving
    /// their original order.
    pub fn requeue_front(&mut self, buffers: Vec<VppBuffer>) {
        for buffer in buffers.into_iter().rev() {
            self.queue.push_front(buffer);
        }
    }

    pub fn drain_all(&mut self) -> Vec<VppBuffer> {
        self.queue.drain(..).collect()
    }
}
