//! A QCOW2 disk-image storage engine.
//!
//! `qblock` exposes a random-access block device interface while persisting
//! data to a host file in the QCOW2 version-3 on-disk format, including the
//! optional extended-L2 ("subcluster") allocation granularity.  Virtual disk
//! regions are mapped to host clusters through the two-level L1/L2 tables,
//! clusters are allocated on demand through the refcount structures, and an
//! optional backing image provides copy-on-write semantics.
//!
//! The main entry points are [`node::ImageNode`] (format-probing open,
//! read/write/zero/status/flush over any supported driver) and the
//! [`qcow2`] module's `create`/`open` functions.

pub mod helpers;
pub mod node;
pub mod qcow2;
pub mod raw;

use std::io;
use thiserror::Error;

/// Error type shared by all block drivers in this crate.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The image file is not something this crate can interpret.
    #[error("invalid image format: {0}")]
    Format(String),

    /// The image metadata is self-contradictory.  Continuing to write could
    /// make things worse, so operations that detect this stop immediately.
    #[error("image is corrupt: {0}")]
    CorruptImage(String),

    /// A metadata structure cannot grow any further.
    #[error("out of metadata space: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The request cannot be served by this implementation (unsupported
    /// feature, or an unaligned zero-write whose surroundings are not
    /// zero).  Callers may fall back to a different strategy.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request cancelled")]
    Cancelled,
}

pub type BlockResult<T> = std::result::Result<T, BlockError>;

impl BlockError {
    /// Whether the failed operation may have left the image metadata in a
    /// state that differs from what is on disk.  Used to decide when an
    /// image must be frozen.
    pub fn is_metadata_hazard(&self) -> bool {
        matches!(self, BlockError::Io(_) | BlockError::CorruptImage(_))
    }
}
