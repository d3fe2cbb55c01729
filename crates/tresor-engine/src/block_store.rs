//! Non-blocking block-store handles
//!
//! The partial-I/O job drives one of these handles. Every call returns
//! immediately: a read is queued first and polled for its result later, a
//! write may transfer fewer bytes than offered and a sync is queued and
//! polled like a read.
//!
//! Two handles are provided:
//! - [`FileBlockStore`]: positional I/O on a regular image file
//! - [`MemoryBlockStore`]: a shared in-memory image with adjustable
//!   transfer size, latency and fault injection

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tresor_common::{BLOCK_SIZE, Block, Error, Pba, Result};

/// Outcome of polling a queued read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were copied into the destination
    Done(usize),
    /// The read is still in flight
    Queued,
    /// The store is busy, poll again
    WouldBlock,
}

/// Outcome of a write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// `n` bytes were accepted
    Done(usize),
    /// The store is busy, retry later
    WouldBlock,
}

/// Outcome of polling a queued sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Done,
    Queued,
}

/// Non-blocking handle to a block-oriented backing store
pub trait BlockStore {
    /// Set the byte position of the next read or write
    fn seek(&mut self, offset: u64);

    /// Queue a read of `count` bytes at the current position
    ///
    /// Returns false if the store cannot accept the read right now.
    fn queue_read(&mut self, count: usize) -> bool;

    /// Poll the queued read, copying its data into `dst`
    fn complete_read(&mut self, dst: &mut [u8]) -> Result<ReadStatus>;

    /// Write `src` at the current position, possibly only partially
    fn write(&mut self, src: &[u8]) -> Result<WriteStatus>;

    /// Queue a flush of all written data
    ///
    /// Returns false if the store cannot accept the sync right now.
    fn queue_sync(&mut self) -> bool;

    /// Poll the queued sync
    fn complete_sync(&mut self) -> Result<SyncStatus>;
}

/// Block store on a regular file
pub struct FileBlockStore {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    position: u64,
    pending_read: Option<usize>,
    sync_queued: bool,
}

impl FileBlockStore {
    /// Open an existing image file
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {path_str}: {e}")))?;
        let size = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to get metadata for {path_str}: {e}")))?
            .len();

        Ok(Self::with_file(file, path_str, size, read_only))
    }

    /// Create (or truncate) an image file of `blocks` zeroed blocks
    pub fn create(path: impl AsRef<Path>, blocks: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let size = blocks
            .checked_mul(BLOCK_SIZE as u64)
            .ok_or_else(|| Error::invalid_argument(format!("{blocks} blocks overflow")))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;
        file.set_len(size)
            .map_err(|e| Error::Storage(format!("failed to set size for {path_str}: {e}")))?;

        Ok(Self::with_file(file, path_str, size, false))
    }

    fn with_file(file: File, path: String, size: u64, read_only: bool) -> Self {
        Self {
            file,
            path,
            size,
            read_only,
            position: 0,
            pending_read: None,
            sync_queued: false,
        }
    }

    /// Get the file size
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write a whole block synchronously
    ///
    /// Used when formatting an image, outside of any scheduler pass.
    pub fn write_block(&self, pba: Pba, blk: &Block) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let offset = block_offset(pba)?;
        self.check_bounds(offset, BLOCK_SIZE)?;
        self.file
            .write_all_at(blk.as_slice(), offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {e}", self.path)))
    }

    /// Read a whole block synchronously
    pub fn read_block(&self, pba: Pba) -> Result<Block> {
        let offset = block_offset(pba)?;
        self.check_bounds(offset, BLOCK_SIZE)?;
        let mut blk = Block::new();
        self.file
            .read_exact_at(blk.as_mut_slice(), offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {e}", self.path)))?;
        Ok(blk)
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                size: self.size,
            }),
        }
    }
}

impl BlockStore for FileBlockStore {
    fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    fn queue_read(&mut self, count: usize) -> bool {
        if self.pending_read.is_some() {
            return false;
        }
        self.pending_read = Some(count);
        true
    }

    fn complete_read(&mut self, dst: &mut [u8]) -> Result<ReadStatus> {
        let Some(count) = self.pending_read.take() else {
            return Err(Error::storage("no read queued"));
        };
        if self.position >= self.size {
            return Ok(ReadStatus::Done(0));
        }
        let len = count.min(dst.len());
        let read = self
            .file
            .read_at(&mut dst[..len], self.position)
            .map_err(|e| Error::Storage(format!("read failed on {}: {e}", self.path)))?;
        self.position += read as u64;
        Ok(ReadStatus::Done(read))
    }

    fn write(&mut self, src: &[u8]) -> Result<WriteStatus> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.check_bounds(self.position, src.len())?;
        let written = self
            .file
            .write_at(src, self.position)
            .map_err(|e| Error::Storage(format!("write failed on {}: {e}", self.path)))?;
        self.position += written as u64;
        Ok(WriteStatus::Done(written))
    }

    fn queue_sync(&mut self) -> bool {
        self.sync_queued = true;
        true
    }

    fn complete_sync(&mut self) -> Result<SyncStatus> {
        if !std::mem::take(&mut self.sync_queued) {
            return Err(Error::storage("no sync queued"));
        }
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync_data failed on {}: {e}", self.path)))?;
        Ok(SyncStatus::Done)
    }
}

/// Byte offset of a block
pub fn block_offset(pba: Pba) -> Result<u64> {
    pba.checked_mul(BLOCK_SIZE as u64)
        .ok_or_else(|| Error::invalid_argument(format!("pba {pba} overflows the byte range")))
}

#[derive(Debug, Default)]
struct ImageState {
    data: Vec<u8>,
    write_log: Vec<(u64, usize)>,
    syncs: u64,
    fail_reads: bool,
    fail_writes: bool,
    fail_syncs: bool,
}

/// In-memory image shared between store handles and observers
#[derive(Clone, Debug)]
pub struct MemoryImage {
    inner: Arc<Mutex<ImageState>>,
}

impl MemoryImage {
    /// Create a zeroed image of `blocks` blocks
    #[must_use]
    pub fn new(blocks: u64) -> Self {
        let size = usize::try_from(blocks).map_or(0, |b| b.saturating_mul(BLOCK_SIZE));
        Self {
            inner: Arc::new(Mutex::new(ImageState {
                data: vec![0u8; size],
                ..ImageState::default()
            })),
        }
    }

    /// Image size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().data.len() as u64
    }

    /// Copy a whole block out of the image
    pub fn read_block(&self, pba: Pba) -> Result<Block> {
        let state = self.inner.lock();
        let range = block_range(pba, state.data.len())?;
        Block::from_slice(&state.data[range])
    }

    /// Store a whole block without touching the write log
    pub fn write_block(&self, pba: Pba, blk: &Block) -> Result<()> {
        let mut state = self.inner.lock();
        let range = block_range(pba, state.data.len())?;
        state.data[range].copy_from_slice(blk.as_slice());
        Ok(())
    }

    /// Every write performed through a store handle as `(offset, len)`
    #[must_use]
    pub fn write_log(&self) -> Vec<(u64, usize)> {
        self.inner.lock().write_log.clone()
    }

    /// Blocks whose write started at their first byte, in write order
    #[must_use]
    pub fn written_blocks(&self) -> Vec<Pba> {
        self.inner
            .lock()
            .write_log
            .iter()
            .filter(|(offset, _)| offset % BLOCK_SIZE as u64 == 0)
            .map(|(offset, _)| offset / BLOCK_SIZE as u64)
            .collect()
    }

    pub fn clear_write_log(&self) {
        self.inner.lock().write_log.clear();
    }

    /// Number of completed syncs
    #[must_use]
    pub fn syncs(&self) -> u64 {
        self.inner.lock().syncs
    }

    /// Make every following read fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Make every following write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Make every following sync fail once it completes
    pub fn set_fail_syncs(&self, fail: bool) {
        self.inner.lock().fail_syncs = fail;
    }
}

fn block_range(pba: Pba, size: usize) -> Result<std::ops::Range<usize>> {
    let offset = block_offset(pba)?;
    let start = usize::try_from(offset).map_err(|_| Error::OutOfBounds {
        offset,
        size: size as u64,
    })?;
    match start.checked_add(BLOCK_SIZE) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(Error::OutOfBounds {
            offset,
            size: size as u64,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingOp {
    count: usize,
    polls_left: u32,
}

/// Block store on a [`MemoryImage`]
///
/// Transfers are capped at `max_transfer` bytes, queued operations need
/// `latency` polls before they complete and the first `queue_refusals`
/// queue attempts and `write_stalls` write attempts are turned away.
#[derive(Debug)]
pub struct MemoryBlockStore {
    image: MemoryImage,
    position: u64,
    max_transfer: usize,
    latency: u32,
    queue_refusals: u32,
    write_stalls: u32,
    pending_read: Option<PendingOp>,
    pending_sync: Option<u32>,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new(image: MemoryImage) -> Self {
        Self {
            image,
            position: 0,
            max_transfer: usize::MAX,
            latency: 0,
            queue_refusals: 0,
            write_stalls: 0,
            pending_read: None,
            pending_sync: None,
        }
    }

    /// Cap every transfer at `max_transfer` bytes
    #[must_use]
    pub fn with_max_transfer(mut self, max_transfer: usize) -> Self {
        self.max_transfer = max_transfer.max(1);
        self
    }

    /// Let queued reads and syncs report `Queued` for `polls` polls
    #[must_use]
    pub const fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Refuse the next `count` queue attempts
    #[must_use]
    pub const fn with_queue_refusals(mut self, count: u32) -> Self {
        self.queue_refusals = count;
        self
    }

    /// Answer the next `count` writes with `WouldBlock`
    #[must_use]
    pub const fn with_write_stalls(mut self, count: u32) -> Self {
        self.write_stalls = count;
        self
    }

    #[must_use]
    pub const fn image(&self) -> &MemoryImage {
        &self.image
    }

    fn refuse_queue(&mut self) -> bool {
        if self.queue_refusals > 0 {
            self.queue_refusals -= 1;
            return true;
        }
        false
    }
}

impl BlockStore for MemoryBlockStore {
    fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    fn queue_read(&mut self, count: usize) -> bool {
        if self.pending_read.is_some() || self.refuse_queue() {
            return false;
        }
        self.pending_read = Some(PendingOp {
            count,
            polls_left: self.latency,
        });
        true
    }

    fn complete_read(&mut self, dst: &mut [u8]) -> Result<ReadStatus> {
        let Some(op) = self.pending_read.as_mut() else {
            return Err(Error::storage("no read queued"));
        };
        if op.polls_left > 0 {
            op.polls_left -= 1;
            return Ok(ReadStatus::Queued);
        }
        let count = op.count;
        self.pending_read = None;

        let state = self.image.inner.lock();
        if state.fail_reads {
            return Err(Error::storage("injected read failure"));
        }
        let size = state.data.len() as u64;
        if self.position >= size {
            return Ok(ReadStatus::Done(0));
        }
        let start = self.position as usize;
        let len = count
            .min(dst.len())
            .min(self.max_transfer)
            .min(state.data.len() - start);
        dst[..len].copy_from_slice(&state.data[start..start + len]);
        drop(state);

        self.position += len as u64;
        Ok(ReadStatus::Done(len))
    }

    fn write(&mut self, src: &[u8]) -> Result<WriteStatus> {
        if self.write_stalls > 0 {
            self.write_stalls -= 1;
            return Ok(WriteStatus::WouldBlock);
        }

        let mut state = self.image.inner.lock();
        if state.fail_writes {
            return Err(Error::storage("injected write failure"));
        }
        let size = state.data.len() as u64;
        let len = src.len().min(self.max_transfer);
        let end = self.position.checked_add(len as u64);
        if !matches!(end, Some(end) if end <= size) {
            return Err(Error::OutOfBounds {
                offset: self.position,
                size,
            });
        }
        let start = self.position as usize;
        state.data[start..start + len].copy_from_slice(&src[..len]);
        state.write_log.push((self.position, len));
        drop(state);

        self.position += len as u64;
        Ok(WriteStatus::Done(len))
    }

    fn queue_sync(&mut self) -> bool {
        if self.pending_sync.is_some() || self.refuse_queue() {
            return false;
        }
        self.pending_sync = Some(self.latency);
        true
    }

    fn complete_sync(&mut self) -> Result<SyncStatus> {
        match self.pending_sync.as_mut() {
            None => Err(Error::storage("no sync queued")),
            Some(polls_left) if *polls_left > 0 => {
                *polls_left -= 1;
                Ok(SyncStatus::Queued)
            }
            Some(_) => {
                self.pending_sync = None;
                let mut state = self.image.inner.lock();
                if state.fail_syncs {
                    return Err(Error::storage("injected sync failure"));
                }
                state.syncs += 1;
                Ok(SyncStatus::Done)
            }
        }
    }
}
