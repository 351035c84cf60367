// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Common traits and types for block storage device drivers that accept
//! queued, asynchronously completed operations.
//!
//! A client submits a [`BlockOp`] through [`BlockImplOps::queue`] together
//! with a [`CompletionFn`] and an opaque cookie. The driver hands the
//! operation back through the callback exactly once, either immediately (for
//! requests it rejects or can satisfy without hardware) or later from its own
//! execution context.

#![no_std]

extern crate alloc;

use alloc::{boxed::Box, sync::Arc};
use core::{fmt, ptr::NonNull};

#[doc(no_inline)]
pub use driver_base::{DeviceKind, DriverError, DriverOps, DriverResult};

/// Geometry and limits of a block device.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BlockInfo {
    /// Number of blocks on the device.
    pub block_count: u64,
    /// Size of one block in bytes.
    pub block_size: u32,
    /// Largest transfer, in bytes, a single operation may request.
    pub max_transfer_size: u64,
}

impl BlockInfo {
    /// Total device size in bytes.
    pub const fn size(&self) -> u64 {
        self.block_count * self.block_size as u64
    }
}

/// A memory object a client hands to the driver as the source or destination
/// of a transfer.
///
/// # Safety
///
/// Implementors must guarantee that a region returned by [`map`] is valid for
/// reads and writes of `len` bytes and is not accessed by anyone else until
/// the matching [`unmap`].
///
/// [`map`]: BlockBuffer::map
/// [`unmap`]: BlockBuffer::unmap
pub unsafe trait BlockBuffer: Send + Sync {
    /// Size of the memory object in bytes.
    fn size(&self) -> usize;

    /// Maps `len` bytes starting at byte `offset` into the driver's address
    /// space.
    fn map(&self, offset: usize, len: usize) -> DriverResult<NonNull<u8>>;

    /// Releases a mapping created by [`BlockBuffer::map`].
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe a live mapping returned by `map` on
    /// this buffer, and the mapping must not be used afterwards.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize);
}

/// Parameters shared by read and write operations.
///
/// `length` and both offsets are in blocks.
#[derive(Clone)]
pub struct BlockRw {
    /// Memory object to transfer from or into.
    pub buffer: Arc<dyn BlockBuffer>,
    /// Number of blocks to transfer.
    pub length: u32,
    /// Offset on the device.
    pub offset_dev: u64,
    /// Offset into `buffer`.
    pub offset_buf: u64,
}

impl BlockRw {
    /// Creates read/write parameters for `length` blocks.
    pub fn new(buffer: Arc<dyn BlockBuffer>, offset_dev: u64, offset_buf: u64, length: u32) -> Self {
        Self {
            buffer,
            length,
            offset_dev,
            offset_buf,
        }
    }
}

impl fmt::Debug for BlockRw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRw")
            .field("length", &self.length)
            .field("offset_dev", &self.offset_dev)
            .field("offset_buf", &self.offset_buf)
            .field("buffer_size", &self.buffer.size())
            .finish()
    }
}

/// A block operation submitted by a client.
#[derive(Debug, Clone)]
pub enum BlockOp {
    /// Reads blocks from the device into the buffer.
    Read(BlockRw),
    /// Writes blocks from the buffer to the device.
    Write(BlockRw),
    /// Ensures every operation queued before this one has reached the device.
    Flush,
    /// Discards a range of blocks.
    Trim {
        /// Number of blocks to discard.
        length: u32,
        /// First block to discard.
        offset_dev: u64,
    },
}

impl BlockOp {
    /// Short name of the operation, for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            BlockOp::Read(_) => "read",
            BlockOp::Write(_) => "write",
            BlockOp::Flush => "flush",
            BlockOp::Trim { .. } => "trim",
        }
    }

    /// Returns the read/write parameters, if this is a data transfer.
    pub const fn rw(&self) -> Option<&BlockRw> {
        match self {
            BlockOp::Read(rw) | BlockOp::Write(rw) => Some(rw),
            _ => None,
        }
    }
}

/// Completion callback of a queued operation.
///
/// Invoked exactly once with the cookie supplied at submission, the final
/// status, and the operation, whose ownership returns to the client.
pub type CompletionFn = Box<dyn FnOnce(usize, DriverResult, BlockOp) + Send>;

/// Device control requests understood by block drivers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlockIoctl {
    /// Returns the device's [`BlockInfo`].
    GetInfo,
    /// Waits until previously queued writes are durable.
    DeviceSync,
    /// Any other request, identified by its raw opcode.
    Other(u32),
}

/// Reply of a successful [`BlockIoctl`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlockIoctlReply {
    /// Reply to [`BlockIoctl::GetInfo`].
    Info(BlockInfo),
    /// The request carries no reply payload.
    Done,
}

/// Operations of a block device driver that executes queued requests.
pub trait BlockImplOps: DriverOps {
    /// Returns the device geometry and the per-operation bookkeeping size the
    /// driver keeps for each queued request.
    fn query(&self) -> (BlockInfo, usize);

    /// Queues an operation. Never blocks on hardware; every outcome,
    /// including rejection, is reported through `callback`.
    fn queue(&self, op: BlockOp, callback: CompletionFn, cookie: usize);
}
