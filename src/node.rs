//! Block-node layer: a closed set of drivers behind one dispatch type.
//!
//! The outer world (and the drivers themselves, for their backing chains)
//! talk to images through [`ImageNode`], which is polymorphic over the
//! driver operations open/close/read/write/zero/status/flush.  Backing
//! files are opened through a format probe on the image magic.

use crate::helpers::{BlockFutureResult, IoVector, IoVectorMut};
use crate::qcow2::{self, Qcow2Image, Qcow2OpenOptions};
use crate::raw::RawImage;
use crate::{BlockError, BlockResult};
use std::path::PathBuf;

/// Result of a `block_status` query: classification of one contiguous run
/// starting at the queried offset.
pub struct BlockStatus<'a> {
    /// Length of the run, in bytes.
    pub bytes: u64,
    /// The run reads as zeroes.
    pub zero: bool,
    /// The run is backed by stored data.
    pub data: bool,
    /// `host_offset` (and `file`) are meaningful.
    pub offset_valid: bool,
    /// Byte offset of the run in `file`.
    pub host_offset: u64,
    /// The file that actually holds the data.
    pub file: Option<&'a RawImage>,
}

/// An open image of any supported format.
pub enum ImageNode {
    Raw(RawImage),
    Qcow2(Qcow2Image),
}

impl ImageNode {
    /// Open `path`, probing the format: a qcow2 magic selects the qcow2
    /// driver, anything else is treated as raw.
    pub fn open(path: PathBuf, read_only: bool) -> BlockFutureResult<'static, ImageNode> {
        Box::pin(async move {
            let probe = RawImage::open(&path, true)?;
            let mut magic = [0u8; 4];
            probe.read(&mut magic, 0).await?;
            drop(probe);

            if u32::from_be_bytes(magic) == qcow2::QCOW2_MAGIC {
                let image = Qcow2Image::open(&path, Qcow2OpenOptions::default(), read_only).await?;
                Ok(ImageNode::Qcow2(image))
            } else {
                Ok(ImageNode::Raw(RawImage::open(&path, read_only)?))
            }
        })
    }

    /// Virtual size of the image in bytes.
    pub fn size(&self) -> BlockResult<u64> {
        match self {
            ImageNode::Raw(raw) => raw.len(),
            ImageNode::Qcow2(qcow2) => Ok(qcow2.virtual_size()),
        }
    }

    pub fn readv<'a>(&'a self, bufv: IoVectorMut<'a>, offset: u64) -> BlockFutureResult<'a, ()> {
        match self {
            ImageNode::Raw(raw) => Box::pin(raw.readv(bufv, offset)),
            ImageNode::Qcow2(qcow2) => Box::pin(qcow2.preadv_part(bufv, offset)),
        }
    }

    pub fn writev<'a>(&'a self, bufv: IoVector<'a>, offset: u64) -> BlockFutureResult<'a, ()> {
        match self {
            ImageNode::Raw(raw) => Box::pin(raw.writev(bufv, offset)),
            ImageNode::Qcow2(qcow2) => Box::pin(qcow2.pwritev_part(bufv, offset)),
        }
    }

    /// Make `[offset, offset + bytes)` read as zeroes.  Drivers may return
    /// `NotSupported` when they cannot do this more cheaply than an
    /// explicit write of zeroes; the caller then falls back to `writev`.
    pub fn write_zeroes(&self, offset: u64, bytes: u64) -> BlockFutureResult<'_, ()> {
        match self {
            ImageNode::Raw(raw) => Box::pin(raw.write_zeroes(offset, bytes, false)),
            ImageNode::Qcow2(qcow2) => Box::pin(qcow2.pwrite_zeroes(offset, bytes)),
        }
    }

    pub fn block_status(&self, offset: u64, bytes: u64) -> BlockFutureResult<'_, BlockStatus<'_>> {
        match self {
            ImageNode::Raw(raw) => Box::pin(raw.block_status(offset, bytes)),
            ImageNode::Qcow2(qcow2) => Box::pin(qcow2.block_status(offset, bytes)),
        }
    }

    /// Quick check whether the given range is known to read as zeroes,
    /// without reading data.  `false` means "not known to be zero".
    pub fn is_zero_fast(&self, offset: u64, bytes: u64) -> BlockFutureResult<'_, bool> {
        match self {
            ImageNode::Raw(raw) => Box::pin(async move {
                let mut offset = offset;
                let mut bytes = bytes;
                while bytes > 0 {
                    let status = raw.block_status(offset, bytes).await?;
                    if !status.zero || status.bytes == 0 {
                        return Ok(false);
                    }
                    offset += status.bytes;
                    bytes -= status.bytes;
                }
                Ok(true)
            }),
            ImageNode::Qcow2(qcow2) => Box::pin(qcow2.is_zero(offset, bytes)),
        }
    }

    /// Flush caches and the underlying file(s).
    pub fn flush(&self) -> BlockFutureResult<'_, ()> {
        match self {
            ImageNode::Raw(raw) => Box::pin(raw.flush()),
            ImageNode::Qcow2(qcow2) => Box::pin(qcow2.flush_to_os()),
        }
    }

    /// Best-effort teardown: flush what can be flushed.  Unlike `flush`,
    /// failures are reported but do not prevent the close.
    pub async fn close(&self) -> BlockResult<()> {
        match self {
            ImageNode::Raw(raw) => raw.flush().await,
            ImageNode::Qcow2(qcow2) => qcow2.close().await,
        }
    }
}

impl From<RawImage> for ImageNode {
    fn from(raw: RawImage) -> Self {
        ImageNode::Raw(raw)
    }
}

impl From<Qcow2Image> for ImageNode {
    fn from(qcow2: Qcow2Image) -> Self {
        ImageNode::Qcow2(qcow2)
    }
}

impl ImageNode {
    /// The concrete driver name, mainly for diagnostics.
    pub fn driver_name(&self) -> &'static str {
        match self {
            ImageNode::Raw(_) => "raw",
            ImageNode::Qcow2(_) => "qcow2",
        }
    }
}

/// Convenience check used by option validation.
pub(crate) fn require<T>(value: Option<T>, what: &str) -> BlockResult<T> {
    value.ok_or_else(|| BlockError::InvalidArgument(format!("missing required option: {}", what)))
}
