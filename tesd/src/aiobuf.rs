//! Double-buffered asynchronous file writer.
//!
//! Each capture stream owns one of these: a fixed mmap'ed staging zone
//! that frames are memcpy'ed into at `cur`, and a write batch
//! `[tail, tail + enqueued)` handed to the blocking pool as one positional
//! write. Batches are carved at `min(ceil - tail, cur - tail)` so a batch
//! never crosses the wrap point, and nothing is submitted below a soft
//! minimum unless the zone is about to wrap or the writer is flushing.
//!
//! Invariants, with all arithmetic mod the zone capacity:
//! `cur - tail == enqueued + waiting`, and immediately after [`AioBuf::stage`]
//! returns, `enqueued + waiting <= capacity - MTU` (there is always room
//! for one more frame: `stage` cannot fail, it blocks on forced submits
//! instead).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{MmapMut, MmapRaw};
use tokio::task::JoinHandle;

use tespkt::MTU;

/// Default staging zone capacity.
pub const BUFSIZE: usize = 10 * 1024 * 1024;
/// Soft minimum batch: positional writes have enough overhead that
/// anything much smaller is slower than a synchronous write.
pub const MINSIZE: usize = 512_000;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("stream file is not open")]
    NotOpen,
    #[error("short write: queued {expected} bytes, wrote {wrote}")]
    Short { expected: usize, wrote: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// A batch is (still) in flight.
    InFlight,
    /// Nothing queued and nothing waiting.
    Drained,
}

enum WriteState {
    Idle,
    InFlight(JoinHandle<io::Result<usize>>),
    /// The previous batch came back with EAGAIN; the same range gets
    /// submitted again.
    Retrying,
}

pub struct AioBuf {
    path: PathBuf,
    file: Option<Arc<File>>,
    zone: Arc<MmapRaw>,
    capacity: usize,
    min_batch: usize,
    tail: usize,
    cur: usize,
    waiting: usize,
    enqueued: usize,
    size: u64,
    state: WriteState,
}

impl AioBuf {
    pub fn new(path: PathBuf) -> io::Result<AioBuf> {
        AioBuf::with_params(path, BUFSIZE, MINSIZE)
    }

    pub fn with_params(path: PathBuf, capacity: usize, min_batch: usize) -> io::Result<AioBuf> {
        assert!(capacity > 2 * MTU);
        let zone: MmapRaw = MmapMut::map_anon(capacity)?.into();
        Ok(AioBuf {
            path,
            file: None,
            zone: Arc::new(zone),
            capacity,
            min_batch,
            tail: 0,
            cur: 0,
            waiting: 0,
            enqueued: 0,
            size: 0,
            state: WriteState::Idle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes already written to the file.
    pub fn written(&self) -> u64 {
        self.size
    }

    /// Bytes staged since the last submit plus bytes in flight. The next
    /// staged byte lands at `written() + outstanding()` in the file.
    pub fn outstanding(&self) -> u64 {
        (self.waiting + self.enqueued) as u64
    }

    /// Open the stream file. When overwriting, an existing target is
    /// unlinked first: reopening in place could follow a symlink or trip
    /// over another owner's permissions.
    pub fn open(&mut self, overwrite: bool) -> io::Result<()> {
        debug_assert!(self.file.is_none());
        debug_assert!(self.size == 0 && self.waiting == 0 && self.enqueued == 0);
        if overwrite {
            match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).mode(0o644);
        if overwrite {
            opts.create(true);
        } else {
            opts.create_new(true);
        }
        self.file = Some(Arc::new(opts.open(&self.path)?));
        Ok(())
    }

    /// Truncate the file to its real written size and release it. The
    /// caller flushes first; anything still staged is discarded.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        debug_assert!(matches!(self.state, WriteState::Idle));
        file.set_len(self.size)?;
        self.tail = 0;
        self.cur = 0;
        self.waiting = 0;
        self.enqueued = 0;
        self.size = 0;
        Ok(())
    }

    /// Copy `buf` into the staging zone. Always succeeds barring a write
    /// error: if the zone has no room for another full frame, this blocks
    /// on forced submits until it does.
    pub async fn stage(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        if self.file.is_none() {
            return Err(WriteError::NotOpen);
        }
        let len = buf.len();
        debug_assert!(len <= MTU);
        debug_assert!(self.enqueued + self.waiting <= self.capacity - MTU);

        let to_ceil = self.capacity - self.cur;
        let wrapped = len >= to_ceil;
        unsafe {
            let base = self.zone.as_mut_ptr();
            if !wrapped {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), base.add(self.cur), len);
                self.cur += len;
            } else {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), base.add(self.cur), to_ceil);
                std::ptr::copy_nonoverlapping(buf.as_ptr().add(to_ceil), base, len - to_ceil);
                self.cur = len - to_ceil;
            }
        }
        self.waiting += len;

        // Hold out for a bigger batch while the cursor hasn't wrapped and
        // there is still room for more frames.
        if self.waiting < self.min_batch
            && !wrapped
            && self.enqueued + self.waiting <= self.capacity - MTU
        {
            return Ok(());
        }

        let mut st = self.try_submit(false).await?;
        while self.enqueued + self.waiting > self.capacity - MTU && st == Submit::InFlight {
            st = self.try_submit(true).await?;
        }
        Ok(())
    }

    /// Drive the write state machine one step.
    ///
    /// Settles the in-flight batch (peeking when `force` is false, waiting
    /// when true), verifies the byte count, re-submits the same range on
    /// EAGAIN, then carves and submits the next batch.
    pub async fn try_submit(&mut self, force: bool) -> Result<Submit, WriteError> {
        loop {
            match std::mem::replace(&mut self.state, WriteState::Idle) {
                WriteState::Idle => break,
                WriteState::Retrying => {
                    // previous batch failed transiently, send it again as is
                    self.submit_batch()?;
                    return Ok(Submit::InFlight);
                }
                WriteState::InFlight(handle) => {
                    if !force && !handle.is_finished() {
                        self.state = WriteState::InFlight(handle);
                        return Ok(Submit::InFlight);
                    }
                    let res = handle
                        .await
                        .map_err(|e| WriteError::Io(io::Error::other(e)))?;
                    match res {
                        Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                            self.state = WriteState::Retrying;
                            continue;
                        }
                        Err(e) => return Err(WriteError::Io(e)),
                        Ok(n) if n != self.enqueued => {
                            return Err(WriteError::Short { expected: self.enqueued, wrote: n })
                        }
                        Ok(_) => {
                            self.size += self.enqueued as u64;
                            self.tail += self.enqueued;
                            if self.tail == self.capacity {
                                self.tail = 0;
                            }
                            self.enqueued = 0;
                            break;
                        }
                    }
                }
            }
        }

        debug_assert!(self.enqueued == 0);
        // never let a batch cross the wrap point
        let batch = if self.cur < self.tail || (self.cur == self.tail && self.waiting > 0) {
            self.capacity - self.tail
        } else {
            self.cur - self.tail
        };
        if batch == 0 {
            debug_assert!(self.waiting == 0);
            return Ok(Submit::Drained);
        }
        self.enqueued = batch;
        self.waiting -= batch;
        self.submit_batch()?;
        Ok(Submit::InFlight)
    }

    /// Wait for everything staged to reach the file.
    pub async fn flush(&mut self) -> Result<(), WriteError> {
        while self.try_submit(true).await? == Submit::InFlight {}
        Ok(())
    }

    fn submit_batch(&mut self) -> Result<(), WriteError> {
        let file = Arc::clone(self.file.as_ref().ok_or(WriteError::NotOpen)?);
        let zone = Arc::clone(&self.zone);
        let tail = self.tail;
        let len = self.enqueued;
        let offset = self.size;
        debug_assert!(tail + len <= self.capacity);
        let handle = tokio::task::spawn_blocking(move || {
            // Safety: the task never stages into [tail, tail + len) while
            // this batch is outstanding (the cursor is held at least one
            // MTU away by `stage`), and the mapping is kept alive by the
            // Arc moved into this closure.
            let buf = unsafe { std::slice::from_raw_parts(zone.as_mut_ptr().add(tail), len) };
            loop {
                match file.write_at(buf, offset) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => return other,
                }
            }
        });
        self.state = WriteState::InFlight(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[tokio::test]
    async fn staged_bytes_reach_the_file_in_order() {
        let (_dir, path) = tmp("s.dat");
        let mut ab = AioBuf::with_params(path.clone(), 64 * 1024, 1024).unwrap();
        ab.open(false).unwrap();
        let mut expect = Vec::new();
        for i in 0..200u32 {
            let chunk = vec![(i & 0xff) as u8; 101];
            expect.extend_from_slice(&chunk);
            ab.stage(&chunk).await.unwrap();
        }
        ab.flush().await.unwrap();
        assert_eq!(ab.written(), expect.len() as u64);
        ab.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), expect);
    }

    #[tokio::test]
    async fn wrap_around_preserves_content() {
        let (_dir, path) = tmp("w.dat");
        // capacity small enough that the cursor wraps many times
        let mut ab = AioBuf::with_params(path.clone(), 4 * MTU, 1).unwrap();
        ab.open(false).unwrap();
        let mut expect = Vec::new();
        for i in 0..64u32 {
            let chunk: Vec<u8> = (0..997).map(|j| (i as usize + j) as u8).collect();
            expect.extend_from_slice(&chunk);
            ab.stage(&chunk).await.unwrap();
        }
        ab.flush().await.unwrap();
        ab.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), expect);
    }

    #[tokio::test]
    async fn small_batches_are_held_back() {
        let (_dir, path) = tmp("h.dat");
        let mut ab = AioBuf::with_params(path.clone(), 64 * 1024, 16 * 1024).unwrap();
        ab.open(false).unwrap();
        ab.stage(&[7u8; 100]).await.unwrap();
        // below the soft minimum: nothing submitted yet
        assert_eq!(ab.written(), 0);
        assert_eq!(ab.outstanding(), 100);
        ab.flush().await.unwrap();
        assert_eq!(ab.written(), 100);
        ab.close().unwrap();
    }

    #[tokio::test]
    async fn close_truncates_to_real_size() {
        let (_dir, path) = tmp("t.dat");
        let mut ab = AioBuf::with_params(path.clone(), 64 * 1024, 1).unwrap();
        ab.open(false).unwrap();
        ab.stage(&[1u8; 3000]).await.unwrap();
        ab.flush().await.unwrap();
        ab.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3000);
    }

    #[tokio::test]
    async fn no_overwrite_refuses_existing() {
        let (_dir, path) = tmp("e.dat");
        std::fs::write(&path, b"old").unwrap();
        let mut ab = AioBuf::with_params(path.clone(), 64 * 1024, 1).unwrap();
        assert!(ab.open(false).is_err());
    }

    #[tokio::test]
    async fn overwrite_unlinks_first() {
        let (_dir, path) = tmp("o.dat");
        std::fs::write(&path, b"old-old-old").unwrap();
        let mut ab = AioBuf::with_params(path.clone(), 64 * 1024, 1).unwrap();
        ab.open(true).unwrap();
        ab.stage(b"new").await.unwrap();
        ab.flush().await.unwrap();
        ab.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}
