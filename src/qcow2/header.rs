//! On-disk qcow2 header: a fixed big-endian record at offset 0.

use super::{
    BACKING_NAME_OFFSET, CLUSTER_BITS, CLUSTER_SIZE, HEADER_LENGTH, INCOMPAT_CORRUPT,
    INCOMPAT_DIRTY, INCOMPAT_EXTL2, QCOW2_MAGIC, REFCOUNT_ORDER, V2_HEADER_LENGTH,
};
use crate::raw::RawImage;
use crate::{BlockError, BlockResult};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Serialized size of `Qcow2RawHeader` (no padding).
const RAW_HEADER_SIZE: usize = 105;

#[derive(Clone, Default, Deserialize, Serialize)]
struct Qcow2RawHeader {
    /// QCOW magic string ("QFI\xfb")
    magic: u32,

    /// Version number (valid values are 2 and 3)
    version: u32,

    /// Offset into the image file at which the backing file name is stored
    /// (NB: the string is not null terminated).  0 if the image doesn't
    /// have a backing file.
    backing_file_offset: u64,

    /// Length of the backing file name in bytes.  Must not be longer than
    /// 1023 bytes.
    backing_file_size: u32,

    /// Number of bits used for addressing an offset within a cluster
    /// (1 << cluster_bits is the cluster size).
    cluster_bits: u32,

    /// Virtual disk size in bytes.
    size: u64,

    /// 0 for no encryption
    crypt_method: u32,

    /// Number of entries in the active L1 table
    l1_size: u32,

    /// Offset into the image file at which the active L1 table starts
    l1_table_offset: u64,

    /// Offset into the image file at which the refcount table starts
    refcount_table_offset: u64,

    /// Number of clusters that the refcount table occupies
    refcount_table_clusters: u32,

    /// Number of snapshots contained in the image
    nb_snapshots: u32,

    /// Offset into the image file at which the snapshot table starts
    snapshots_offset: u64,

    // The following fields are only valid for version >= 3
    /// Bitmask of incompatible features.  An implementation must fail to
    /// open an image if an unknown bit is set.  Bit 4 is Extended L2
    /// Entries (subcluster allocation).
    incompatible_features: u64,

    /// Bitmask of compatible features; unknown bits may be ignored
    compatible_features: u64,

    /// Bitmask of auto-clear features; unknown bits must be cleared before
    /// writing to the image
    autoclear_features: u64,

    /// Width of a refcount block entry: refcount_bits = 1 << refcount_order
    refcount_order: u32,

    /// Length of the header structure in bytes
    header_length: u32,

    /// Compression method for compressed clusters (0 = deflate)
    compression_type: u8,
}

pub struct Qcow2Header {
    raw: Qcow2RawHeader,
    backing_filename: Option<String>,
}

fn bincode_big_endian() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

impl Qcow2Header {
    /// Read and validate the header of an existing image.  For read-write
    /// opens, unknown auto-clear feature bits are cleared on disk before
    /// anything else happens.
    pub async fn load(file: &RawImage, read_only: bool) -> BlockResult<Self> {
        let mut header_buf = vec![0u8; RAW_HEADER_SIZE];
        file.read(&mut header_buf, 0).await?;

        let mut raw: Qcow2RawHeader = bincode_big_endian()
            .deserialize(&header_buf)
            .map_err(|err| BlockError::Format(format!("cannot parse header: {}", err)))?;

        if raw.magic != QCOW2_MAGIC {
            return Err(BlockError::Format("not a qcow2 file".into()));
        }
        match raw.version {
            2 => {
                // Version 2 headers end after the snapshot fields; the rest
                // of the buffer belongs to whatever follows on disk
                raw.incompatible_features = 0;
                raw.compatible_features = 0;
                raw.autoclear_features = 0;
                raw.refcount_order = REFCOUNT_ORDER;
                raw.header_length = V2_HEADER_LENGTH;
                raw.compression_type = 0;
            }
            3 => {}
            v => {
                return Err(BlockError::Format(format!(
                    "qcow2 version {} is not supported",
                    v
                )))
            }
        }

        if raw.cluster_bits != CLUSTER_BITS {
            return Err(BlockError::NotSupported(format!(
                "cluster size {} (only {} KiB clusters are supported)",
                1u64 << raw.cluster_bits,
                CLUSTER_SIZE / 1024,
            )));
        }
        if raw.refcount_order != REFCOUNT_ORDER {
            return Err(BlockError::NotSupported(format!(
                "refcount order {} (only 4 is supported)",
                raw.refcount_order
            )));
        }
        if raw.crypt_method != 0 {
            return Err(BlockError::NotSupported("encrypted images".into()));
        }
        if raw.version == 3 && raw.header_length > HEADER_LENGTH {
            return Err(BlockError::NotSupported(
                "extended qcow2 headers".into(),
            ));
        }

        if raw.incompatible_features & INCOMPAT_DIRTY != 0 {
            return Err(BlockError::CorruptImage(
                "image has the dirty flag set and needs repair".into(),
            ));
        }
        if raw.incompatible_features & INCOMPAT_CORRUPT != 0 {
            return Err(BlockError::CorruptImage(
                "image has the corrupt flag set".into(),
            ));
        }
        let unknown = raw.incompatible_features & !INCOMPAT_EXTL2;
        if unknown != 0 {
            return Err(BlockError::NotSupported(format!(
                "unknown incompatible feature bits 0x{:x}",
                unknown
            )));
        }

        let backing_filename = if raw.backing_file_offset != 0 {
            let (offset, length) = (raw.backing_file_offset, raw.backing_file_size);
            if length > 1023 {
                return Err(BlockError::Format(format!(
                    "backing file name is too long ({}, must not exceed 1023)",
                    length
                )));
            }
            if offset
                .checked_add(length as u64)
                .map(|end| end > CLUSTER_SIZE as u64)
                != Some(false)
            {
                return Err(BlockError::Format(
                    "backing file name offset is invalid".into(),
                ));
            }

            let mut backing_buf = vec![0; length as usize];
            file.read(&mut backing_buf, offset).await?;

            Some(String::from_utf8(backing_buf).map_err(|err| {
                BlockError::Format(format!("backing file name is invalid: {}", err))
            })?)
        } else {
            None
        };

        let mut header = Qcow2Header {
            raw,
            backing_filename,
        };

        // No need to clear autoclear features for read-only images
        if header.raw.autoclear_features != 0 && !read_only {
            header.raw.autoclear_features = 0;
            header.write(file).await?;
        }

        Ok(header)
    }

    /// Header for a freshly created image (always version 3).
    pub fn create_new(
        size: u64,
        l1_size: u32,
        l1_table_offset: u64,
        refcount_table_offset: u64,
        refcount_table_clusters: u32,
        backing_filename: Option<String>,
        extended_l2: bool,
    ) -> Self {
        let mut raw = Qcow2RawHeader {
            magic: QCOW2_MAGIC,
            version: 3,
            cluster_bits: CLUSTER_BITS,
            size,
            crypt_method: 0,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            refcount_order: REFCOUNT_ORDER,
            header_length: HEADER_LENGTH,
            ..Default::default()
        };
        if extended_l2 {
            raw.incompatible_features |= INCOMPAT_EXTL2;
        }
        if let Some(name) = backing_filename.as_ref() {
            raw.backing_file_offset = BACKING_NAME_OFFSET;
            raw.backing_file_size = name.len() as u32;
        }

        Qcow2Header {
            raw,
            backing_filename,
        }
    }

    /// Write the header record back to offset 0.  The backing file name is
    /// stored separately and is not touched.
    pub async fn write(&mut self, file: &RawImage) -> BlockResult<()> {
        let mut buf = bincode_big_endian()
            .serialize(&self.raw)
            .map_err(|err| BlockError::Format(format!("cannot serialize header: {}", err)))?;
        debug_assert_eq!(buf.len(), RAW_HEADER_SIZE);
        buf.resize(buf.len().next_multiple_of(8), 0);

        // Version 2 headers are shorter; do not clobber what follows
        buf.truncate(self.raw.header_length as usize);

        file.write(&buf, 0).await
    }

    pub fn size(&self) -> u64 {
        self.raw.size
    }

    pub fn version(&self) -> u32 {
        self.raw.version
    }

    pub fn l1_table_offset(&self) -> u64 {
        self.raw.l1_table_offset
    }

    pub fn l1_entries(&self) -> usize {
        self.raw.l1_size as usize
    }

    pub fn reftable_offset(&self) -> u64 {
        self.raw.refcount_table_offset
    }

    pub fn reftable_clusters(&self) -> usize {
        self.raw.refcount_table_clusters as usize
    }

    pub fn set_reftable(&mut self, offset: u64, clusters: usize) -> BlockResult<()> {
        self.raw.refcount_table_clusters = clusters
            .try_into()
            .map_err(|_| BlockError::ResourceExhausted("refcount table too large".into()))?;
        self.raw.refcount_table_offset = offset;
        Ok(())
    }

    pub fn extended_l2(&self) -> bool {
        self.raw.incompatible_features & INCOMPAT_EXTL2 != 0
    }

    pub fn backing_filename(&self) -> Option<&String> {
        self.backing_filename.as_ref()
    }
}
