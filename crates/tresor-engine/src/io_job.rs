//! Partial-I/O job
//!
//! Drives exactly one read, write or sync against a [`BlockStore`] until it
//! completes. Short transfers are normal: each one advances the cursor and
//! the job loops back to issue the remainder. Hard errors complete the job
//! with `success = false`; they are never retried here.

use crate::block_store::{BlockStore, ReadStatus, SyncStatus, WriteStatus};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Read,
    Write,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoJobState {
    Pending,
    InProgress,
    Complete,
}

/// What to do when the store transfers zero bytes before the job is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialResult {
    /// Complete successfully with what was transferred so far
    Allow,
    /// Treat it as a hard error
    #[default]
    Deny,
}

/// One read, write or sync operation driven to completion
#[derive(Debug)]
pub struct IoJob {
    op: IoOperation,
    state: IoJobState,
    partial: PartialResult,
    base_offset: u64,
    buffer: BytesMut,
    /// Bytes transferred so far, relative to `base_offset`
    current_offset: usize,
    /// Bytes still to transfer
    current_count: usize,
    success: bool,
    complete: bool,
}

impl IoJob {
    fn new(op: IoOperation, base_offset: u64, buffer: BytesMut) -> Self {
        let current_count = buffer.len();
        Self {
            op,
            state: IoJobState::Pending,
            partial: PartialResult::default(),
            base_offset,
            buffer,
            current_offset: 0,
            current_count,
            success: false,
            complete: false,
        }
    }

    /// Read `count` bytes starting at `base_offset`
    #[must_use]
    pub fn read(base_offset: u64, count: usize) -> Self {
        Self::new(IoOperation::Read, base_offset, BytesMut::zeroed(count))
    }

    /// Write `data` starting at `base_offset`
    #[must_use]
    pub fn write(base_offset: u64, data: &[u8]) -> Self {
        Self::new(IoOperation::Write, base_offset, BytesMut::from(data))
    }

    /// Flush everything written so far
    #[must_use]
    pub fn sync() -> Self {
        Self::new(IoOperation::Sync, 0, BytesMut::new())
    }

    #[must_use]
    pub const fn with_partial_result(mut self, partial: PartialResult) -> Self {
        self.partial = partial;
        self
    }

    /// Advance the job as far as the store allows
    ///
    /// Returns whether any state changed.
    pub fn execute<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> bool {
        let mut progress = false;
        while !self.complete {
            let step = match self.op {
                IoOperation::Read => self.execute_read(store),
                IoOperation::Write => self.execute_write(store),
                IoOperation::Sync => self.execute_sync(store),
            };
            if !step {
                break;
            }
            progress = true;
        }
        progress
    }

    fn execute_read<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> bool {
        match self.state {
            IoJobState::Pending => {
                if self.current_count == 0 {
                    self.finish(true);
                    return true;
                }
                store.seek(self.position());
                if !store.queue_read(self.current_count) {
                    return false;
                }
                self.state = IoJobState::InProgress;
                true
            }
            IoJobState::InProgress => {
                let range = self.current_offset..self.current_offset + self.current_count;
                match store.complete_read(&mut self.buffer[range]) {
                    Ok(ReadStatus::Done(n)) => {
                        self.advance(n);
                        true
                    }
                    Ok(ReadStatus::Queued | ReadStatus::WouldBlock) => false,
                    Err(e) => {
                        warn!("read at {} failed: {e}", self.position());
                        self.finish(false);
                        true
                    }
                }
            }
            IoJobState::Complete => false,
        }
    }

    fn execute_write<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> bool {
        match self.state {
            IoJobState::Pending => {
                if self.current_count == 0 {
                    self.finish(true);
                    return true;
                }
                store.seek(self.position());
                self.state = IoJobState::InProgress;
                true
            }
            IoJobState::InProgress => {
                let range = self.current_offset..self.current_offset + self.current_count;
                match store.write(&self.buffer[range]) {
                    Ok(WriteStatus::Done(n)) => {
                        self.advance(n);
                        true
                    }
                    Ok(WriteStatus::WouldBlock) => false,
                    Err(e) => {
                        warn!("write at {} failed: {e}", self.position());
                        self.finish(false);
                        true
                    }
                }
            }
            IoJobState::Complete => false,
        }
    }

    fn execute_sync<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> bool {
        match self.state {
            IoJobState::Pending => {
                if !store.queue_sync() {
                    return false;
                }
                self.state = IoJobState::InProgress;
                true
            }
            IoJobState::InProgress => match store.complete_sync() {
                Ok(SyncStatus::Done) => {
                    self.finish(true);
                    true
                }
                Ok(SyncStatus::Queued) => false,
                Err(e) => {
                    warn!("sync failed: {e}");
                    self.finish(false);
                    true
                }
            },
            IoJobState::Complete => false,
        }
    }

    fn advance(&mut self, transferred: usize) {
        if transferred == 0 {
            match self.partial {
                PartialResult::Allow => {
                    debug!(
                        "{:?} stopped after {} of {} bytes",
                        self.op,
                        self.current_offset,
                        self.buffer.len()
                    );
                    self.finish(true);
                }
                PartialResult::Deny => {
                    warn!(
                        "{:?} at {} transferred nothing, {} bytes missing",
                        self.op,
                        self.position(),
                        self.current_count
                    );
                    self.finish(false);
                }
            }
            return;
        }

        let transferred = transferred.min(self.current_count);
        self.current_offset += transferred;
        self.current_count -= transferred;
        if self.current_count == 0 {
            self.finish(true);
        } else {
            self.state = IoJobState::Pending;
        }
    }

    fn finish(&mut self, success: bool) {
        self.state = IoJobState::Complete;
        self.success = success;
        self.complete = true;
    }

    fn position(&self) -> u64 {
        self.base_offset + self.current_offset as u64
    }

    #[must_use]
    pub const fn op(&self) -> IoOperation {
        self.op
    }

    #[must_use]
    pub const fn state(&self) -> IoJobState {
        self.state
    }

    #[must_use]
    pub const fn completed(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.success
    }

    #[must_use]
    pub const fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Bytes transferred so far
    #[must_use]
    pub const fn current_offset(&self) -> usize {
        self.current_offset
    }

    /// Bytes still to transfer
    #[must_use]
    pub const fn current_count(&self) -> usize {
        self.current_count
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn into_buffer(self) -> Bytes {
        self.buffer.freeze()
    }
}
