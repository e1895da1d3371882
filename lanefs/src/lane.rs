//! Lane-multiplexed container files.
//!
//! A container file holds `lane_count` independent byte streams ("lanes")
//! interleaved block by block after a fixed-size header:
//!
//! ```text
//! [0..header)                        Container header
//! [header + 0*B .. header + 1*B)     lane 0, virtual bytes [0, B)
//! [header + 1*B .. header + 2*B)     lane 1, virtual bytes [0, B)
//! ...
//! [header + N*B .. header + (N+1)*B) lane 0, virtual bytes [B, 2B)
//! ```
//!
//! [`LaneAddressSpace`] does the address arithmetic for one lane and owns no
//! file handle. [`ContainerFile`] wraps the shared physical file with
//! positioned I/O so lanes never share a cursor. [`LaneIo`] binds the two
//! into a conventional `Read + Write + Seek` cursor in lane coordinates.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{ConfigError, Result, StorageError};

/// Magic bytes identifying a lanefs container file.
const CONTAINER_MAGIC: [u8; 4] = *b"LNFS";

/// Current container format version.
const CONTAINER_VERSION: u32 = 1;

/// Bytes of the header that carry data; the rest up to the configured header
/// size is zero padding.
pub const CONTAINER_HEADER_MIN: u64 = 24;

/// Address translation for one lane of a container file.
///
/// Physical offset of virtual byte `v`:
/// `header + (v / B) * B * N + lane * B + (v % B)`.
#[derive(Debug)]
pub struct LaneAddressSpace {
    header_size: u64,
    lane_count: u64,
    lane: u64,
    block_size: u64,
    /// One past the highest virtual byte written.
    last_virtual_address: Mutex<u64>,
}

impl LaneAddressSpace {
    /// Creates the address space for `lane` of an `lane_count`-lane file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `lane >= lane_count` or the block
    /// size is zero.
    pub fn new(header_size: u64, lane_count: u32, lane: u32, block_size: u64) -> Result<Self> {
        if lane >= lane_count || block_size == 0 {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "lane {lane} of {lane_count} with block size {block_size} is not addressable"
                ),
            }
            .into());
        }
        Ok(Self {
            header_size,
            lane_count: u64::from(lane_count),
            lane: u64::from(lane),
            block_size,
            last_virtual_address: Mutex::new(0),
        })
    }

    /// The lane index.
    pub fn lane(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)] // constructed from a u32
        let lane = self.lane as u32;
        lane
    }

    /// Interleave block size.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn stride(&self) -> u64 {
        self.block_size * self.lane_count
    }

    /// Physical offset of virtual byte `virtual_addr`.
    pub fn xlate(&self, virtual_addr: u64) -> u64 {
        self.header_size
            + (virtual_addr / self.block_size) * self.stride()
            + self.lane * self.block_size
            + virtual_addr % self.block_size
    }

    /// `true` if the physical byte belongs to the header or another lane.
    pub fn is_used(&self, physical: u64) -> bool {
        if physical < self.header_size {
            return true;
        }
        (physical - self.header_size) / self.block_size % self.lane_count != self.lane
    }

    /// First physical byte at or after `physical` that belongs to this lane.
    pub fn next_unused_address(&self, physical: u64) -> u64 {
        if physical < self.header_size {
            return self.xlate(0);
        }
        let q = physical - self.header_size;
        let stripe = q / self.stride();
        let within = q % self.stride();
        let own_start = self.lane * self.block_size;
        if within < own_start {
            self.header_size + stripe * self.stride() + own_start
        } else if within < own_start + self.block_size {
            physical
        } else {
            self.header_size + (stripe + 1) * self.stride() + own_start
        }
    }

    /// Inverse of [`LaneAddressSpace::xlate`] for bytes of this lane.
    pub fn virtual_of(&self, physical: u64) -> Option<u64> {
        if self.is_used(physical) {
            return None;
        }
        let q = physical - self.header_size;
        let stripe = q / self.stride();
        let within = q % self.stride() - self.lane * self.block_size;
        Some(stripe * self.block_size + within)
    }

    /// Number of this lane's virtual bytes stored below `physical_len`.
    pub fn length_within(&self, physical_len: u64) -> u64 {
        if physical_len <= self.header_size {
            return 0;
        }
        let q = physical_len - self.header_size;
        let full = q / self.stride() * self.block_size;
        let partial = (q % self.stride())
            .saturating_sub(self.lane * self.block_size)
            .min(self.block_size);
        full + partial
    }

    /// One past the highest virtual byte written so far.
    pub fn virtual_length(&self) -> u64 {
        *self
            .last_virtual_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Raises the recorded length to at least `end`.
    pub fn extend_to(&self, end: u64) {
        let mut last = self
            .last_virtual_address
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *last = (*last).max(end);
    }

    /// Sets the length from the physical size of an existing file.
    pub fn recover_length(&self, physical_len: u64) {
        self.extend_to(self.length_within(physical_len));
    }
}

/// A container file shared by all of its lanes.
#[derive(Debug)]
pub struct ContainerFile {
    path: PathBuf,
    file: File,
    header_size: u64,
    lane_count: u32,
    block_size: u64,
}

impl ContainerFile {
    /// Opens `path`, creating it with a fresh header if it is empty or
    /// missing. An existing header must match the requested geometry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the header is invalid or
    /// disagrees with the geometry, and [`StorageError::Io`] on I/O failure.
    pub fn open(path: &Path, header_size: u64, lane_count: u32, block_size: u64) -> Result<Self> {
        if header_size < CONTAINER_HEADER_MIN {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "container header size {header_size} is below {CONTAINER_HEADER_MIN}"
                ),
            }
            .into());
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        let container = Self {
            path: path.to_path_buf(),
            file,
            header_size,
            lane_count,
            block_size,
        };

        if container.len()? == 0 {
            container.write_header()?;
            debug!(path = %path.display(), lane_count, block_size, "created container file");
        } else {
            container.validate_header()?;
        }
        Ok(container)
    }

    fn write_header(&self) -> Result<()> {
        let mut header = vec![0u8; usize::try_from(self.header_size).unwrap_or(usize::MAX)];
        header[0..4].copy_from_slice(&CONTAINER_MAGIC);
        header[4..8].copy_from_slice(&CONTAINER_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&self.lane_count.to_le_bytes());
        header[12..20].copy_from_slice(&self.block_size.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // header sizes are small
        header[20..24].copy_from_slice(&(self.header_size as u32).to_le_bytes());
        self.write_at(&header, 0)
    }

    /// Checks magic, version and geometry.
    fn validate_header(&self) -> Result<()> {
        let mut header = [0u8; 24];
        self.read_at(&mut header, 0)?;
        let corrupt = |reason: String| StorageError::corrupt(&self.path, reason);

        if header[0..4] != CONTAINER_MAGIC {
            return Err(corrupt(format!(
                "invalid magic bytes: expected {CONTAINER_MAGIC:?}, found {:?}",
                &header[0..4]
            ))
            .into());
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != CONTAINER_VERSION {
            return Err(corrupt(format!(
                "unsupported version: expected {CONTAINER_VERSION}, found {version}"
            ))
            .into());
        }
        let lanes = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut block = [0u8; 8];
        block.copy_from_slice(&header[12..20]);
        let block = u64::from_le_bytes(block);
        let hsize = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        if lanes != self.lane_count || block != self.block_size || u64::from(hsize) != self.header_size {
            return Err(corrupt(format!(
                "geometry mismatch: file has {lanes} lanes x {block} bytes after {hsize}, expected {} x {} after {}",
                self.lane_count, self.block_size, self.header_size
            ))
            .into());
        }
        Ok(())
    }

    /// Path of the physical file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lanes.
    pub fn lane_count(&self) -> u32 {
        self.lane_count
    }

    /// Address space for `lane`, with its length recovered from the file
    /// size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the lane is out of range.
    pub fn address_space(&self, lane: u32) -> Result<LaneAddressSpace> {
        let space = LaneAddressSpace::new(self.header_size, self.lane_count, lane, self.block_size)?;
        space.recover_length(self.len()?);
        Ok(space)
    }

    /// Physical size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if metadata cannot be read.
    pub fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StorageError::io(&self.path, e).into())
    }

    /// Reads exactly `buf.len()` bytes at `offset`. Bytes past the end of
    /// the file read as zero.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on I/O failure.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match pread(&self.file, &mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    buf[done..].fill(0);
                    break;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StorageError::io(&self.path, e).into()),
            }
        }
        Ok(())
    }

    /// Writes all of `buf` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on I/O failure.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match pwrite(&self.file, &buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(StorageError::io(
                        &self.path,
                        io::Error::new(io::ErrorKind::WriteZero, "container write returned 0"),
                    )
                    .into());
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StorageError::io(&self.path, e).into()),
            }
        }
        Ok(())
    }

    /// Flushes file data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| StorageError::io(&self.path, e).into())
    }

    /// Writes `data` to lane coordinates starting at `virtual_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on I/O failure.
    pub fn write_lane(&self, space: &LaneAddressSpace, virtual_addr: u64, data: &[u8]) -> Result<()> {
        let mut v = virtual_addr;
        let mut rest = data;
        while !rest.is_empty() {
            let room = space.block_size() - v % space.block_size();
            let n = usize::try_from(room).map_or(rest.len(), |room| room.min(rest.len()));
            self.write_at(&rest[..n], space.xlate(v))?;
            rest = &rest[n..];
            v += n as u64;
        }
        space.extend_to(v);
        Ok(())
    }

    /// Reads `buf.len()` bytes from lane coordinates at `virtual_addr`.
    /// Unwritten bytes read as zero.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on I/O failure.
    pub fn read_lane(&self, space: &LaneAddressSpace, virtual_addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut v = virtual_addr;
        let mut done = 0;
        while done < buf.len() {
            let room = space.block_size() - v % space.block_size();
            let n = usize::try_from(room).map_or(buf.len() - done, |room| room.min(buf.len() - done));
            self.read_at(&mut buf[done..done + n], space.xlate(v))?;
            done += n;
            v += n as u64;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

/// A seekable cursor over one lane of a container.
///
/// The cursor position is private to each `LaneIo`, so any number of them
/// can work on different lanes of the same [`ContainerFile`] concurrently.
#[derive(Debug)]
pub struct LaneIo<'a> {
    file: &'a ContainerFile,
    space: &'a LaneAddressSpace,
    position: u64,
}

impl<'a> LaneIo<'a> {
    /// Binds `space` to `file` with the cursor at virtual offset 0.
    pub fn new(file: &'a ContainerFile, space: &'a LaneAddressSpace) -> Self {
        Self {
            file,
            space,
            position: 0,
        }
    }

    /// Current virtual position.
    pub fn position(&self) -> u64 {
        self.position
    }
}

fn to_io(e: crate::error::FsError) -> io::Error {
    io::Error::other(e)
}

impl Read for LaneIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.space.virtual_length().saturating_sub(self.position);
        let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        if n == 0 {
            return Ok(0);
        }
        self.file
            .read_lane(self.space, self.position, &mut buf[..n])
            .map_err(to_io)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for LaneIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .write_lane(self.space, self.position, buf)
            .map_err(to_io)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for LaneIo<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.space.virtual_length().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of lane")
        })?;
        self.position = target;
        Ok(target)
    }
}
