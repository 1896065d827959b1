//! Raw host-file driver: positional I/O on a plain file or block device.
//!
//! This is the bottom of every driver stack.  All offsets are byte-exact;
//! reads past the end of the file return zeroes (so short backing files
//! behave), writes grow the file as needed.

use crate::helpers::{IoVector, IoVectorMut};
use crate::node::BlockStatus;
use crate::{BlockError, BlockResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// The operation to perform with `fallocate`.
enum FallocateMode {
    ZeroRange,
}

impl From<FallocateMode> for i32 {
    fn from(value: FallocateMode) -> Self {
        match value {
            FallocateMode::ZeroRange => libc::FALLOC_FL_ZERO_RANGE | libc::FALLOC_FL_KEEP_SIZE,
        }
    }
}

/// Safe wrapper for `fallocate()`.
fn fallocate(file: &File, mode: FallocateMode, offset: u64, len: u64) -> io::Result<()> {
    let offset: libc::off64_t = offset
        .try_into()
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let len: libc::off64_t = len
        .try_into()
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

    // SAFETY: valid fd, mode, offset and length; the return value is
    // checked
    let res = unsafe { libc::fallocate64(file.as_raw_fd(), mode.into(), offset, len) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Result of `lseek(SEEK_DATA/SEEK_HOLE)`.
enum SeekOutcome {
    /// The next data/hole starts at this offset
    At(u64),
    /// `ENXIO`: nothing of the sought kind before the end of the file
    NoneFound,
    /// The file system cannot enumerate holes
    Unsupported,
}

fn seek_to(file: &File, offset: u64, whence: libc::c_int) -> io::Result<SeekOutcome> {
    // SAFETY: valid fd and whence; the return value is checked
    let res = unsafe { libc::lseek64(file.as_raw_fd(), offset as libc::off64_t, whence) };
    if res < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENXIO) => Ok(SeekOutcome::NoneFound),
            Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => Ok(SeekOutcome::Unsupported),
            _ => Err(err),
        }
    } else {
        Ok(SeekOutcome::At(res as u64))
    }
}

pub struct RawImage {
    file: File,
    read_only: bool,
}

impl RawImage {
    /// Create a new empty file at `path`, truncating anything already there.
    pub fn create<P: AsRef<Path>>(path: P) -> BlockResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(RawImage {
            file,
            read_only: false,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> BlockResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(RawImage { file, read_only })
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn len(&self) -> BlockResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> BlockResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Read `buf.len()` bytes from `offset`.  The part of the range beyond
    /// the end of the file reads as zeroes.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> BlockResult<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    buf[done..].fill(0);
                    break;
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub async fn readv(&self, bufv: IoVectorMut<'_>, offset: u64) -> BlockResult<()> {
        let mut offset = offset;
        for segment in bufv.into_inner() {
            let len = segment.len() as u64;
            self.read(segment, offset).await?;
            offset += len;
        }
        Ok(())
    }

    /// Write `buf.len()` bytes at `offset`, growing the file if the range
    /// reaches past its current end.
    pub async fn write(&self, buf: &[u8], offset: u64) -> BlockResult<()> {
        if self.read_only {
            return Err(BlockError::InvalidArgument(
                "file is opened read-only".into(),
            ));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub async fn writev(&self, bufv: IoVector<'_>, offset: u64) -> BlockResult<()> {
        let mut offset = offset;
        for segment in bufv.into_inner() {
            self.write(segment, offset).await?;
            offset += segment.len() as u64;
        }
        Ok(())
    }

    /// Write zeroes to `[offset, offset + len)`.  With `no_fallback`, only
    /// constant-time methods are acceptable; if the file system cannot do
    /// that, `NotSupported` is returned and nothing was written.
    pub async fn write_zeroes(&self, offset: u64, len: u64, no_fallback: bool) -> BlockResult<()> {
        if self.read_only {
            return Err(BlockError::InvalidArgument(
                "file is opened read-only".into(),
            ));
        }

        match fallocate(&self.file, FallocateMode::ZeroRange, offset, len) {
            Ok(()) => return Ok(()),
            Err(err) => {
                let unsupported = matches!(
                    err.raw_os_error(),
                    Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) | Some(libc::EINVAL)
                );
                if !unsupported {
                    return Err(err.into());
                }
                if no_fallback {
                    return Err(BlockError::NotSupported(
                        "file system cannot zero without writing".into(),
                    ));
                }
            }
        }

        // fallocate() is unavailable; fall back to writing a buffer of
        // zeroes until the range is covered
        let buf = vec![0u8; std::cmp::min(len, 0x10000) as usize];
        let mut offset = offset;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = std::cmp::min(remaining, buf.len() as u64) as usize;
            self.file.write_all_at(&buf[..chunk], offset)?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    pub async fn flush(&self) -> BlockResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Allocation status of the byte range starting at `offset`: holes (and
    /// anything past the end of the file) read as zeroes.  When the file
    /// system cannot enumerate holes, the range is reported as data, so
    /// that no caller skips a read based on an unknown status.
    pub async fn block_status(&self, offset: u64, bytes: u64) -> BlockResult<BlockStatus<'_>> {
        let file_len = self.len()?;

        if offset >= file_len {
            return Ok(BlockStatus {
                bytes,
                zero: true,
                data: false,
                offset_valid: true,
                host_offset: offset,
                file: Some(self),
            });
        }

        let end = std::cmp::min(offset + bytes, file_len);
        let (run_end, data) = match seek_to(&self.file, offset, libc::SEEK_DATA)? {
            SeekOutcome::At(data_start) if data_start <= offset => {
                // Data at `offset`; the run lasts until the next hole.  A
                // hole always follows at EOF at the latest.
                let hole = match seek_to(&self.file, offset, libc::SEEK_HOLE)? {
                    SeekOutcome::At(hole) => hole,
                    _ => file_len,
                };
                (std::cmp::min(hole, end), true)
            }
            SeekOutcome::At(data_start) => (std::cmp::min(data_start, end), false),
            // A hole reaches from here to the end of the file
            SeekOutcome::NoneFound => (end, false),
            SeekOutcome::Unsupported => (end, true),
        };

        let zero = !data;
        Ok(BlockStatus {
            bytes: run_end - offset,
            zero,
            data,
            offset_valid: true,
            host_offset: offset,
            file: Some(self),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_past_eof_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.img");
        let image = RawImage::create(&path).unwrap();

        image.write(&[0xabu8; 512], 0).await.unwrap();

        let mut buf = vec![0xffu8; 1024];
        image.read(&mut buf, 256).await.unwrap();
        assert!(buf[..256].iter().all(|b| *b == 0xab));
        assert!(buf[256..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn write_grows_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.img");
        let image = RawImage::create(&path).unwrap();

        image.write(&[1u8; 10], 4096).await.unwrap();
        assert_eq!(image.len().unwrap(), 4106);
    }

    #[tokio::test]
    async fn write_zeroes_reads_back_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.img");
        let image = RawImage::create(&path).unwrap();

        image.write(&[0x55u8; 8192], 0).await.unwrap();
        image.write_zeroes(1024, 4096, false).await.unwrap();

        let mut buf = vec![0xffu8; 8192];
        image.read(&mut buf, 0).await.unwrap();
        assert!(buf[..1024].iter().all(|b| *b == 0x55));
        assert!(buf[1024..5120].iter().all(|b| *b == 0));
        assert!(buf[5120..].iter().all(|b| *b == 0x55));
    }

    #[tokio::test]
    async fn vectored_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.img");
        let image = RawImage::create(&path).unwrap();

        let head = [1u8; 300];
        let tail = [2u8; 700];
        let mut bufv = IoVector::new();
        bufv.push(&head);
        bufv.push(&tail);
        image.writev(bufv, 100).await.unwrap();

        let mut front = [0u8; 500];
        let mut back = [0u8; 500];
        let mut bufv = IoVectorMut::new();
        bufv.push(&mut front);
        bufv.push(&mut back);
        image.readv(bufv, 100).await.unwrap();

        assert!(front[..300].iter().all(|b| *b == 1));
        assert!(front[300..].iter().all(|b| *b == 2));
        assert!(back.iter().all(|b| *b == 2));
    }

    #[tokio::test]
    async fn status_past_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.img");
        let image = RawImage::create(&path).unwrap();

        let status = image.block_status(0, 4096).await.unwrap();
        assert!(status.zero);
        assert!(!status.data);
        assert_eq!(status.bytes, 4096);
    }

    #[tokio::test]
    async fn status_sees_written_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.img");
        let image = RawImage::create(&path).unwrap();

        image.write(&[0x11u8; 8192], 0).await.unwrap();

        let status = image.block_status(0, 8192).await.unwrap();
        assert!(status.data);
        assert!(!status.zero);
        assert!(status.bytes > 0);
    }
}
