//! Record files over positional I/O.
//!
//! A [`TlvFile`] is a plain Unix file holding concatenated records; the
//! file format is byte-identical to the wire format. All reading and
//! writing goes through per-endpoint cursors: [`TlvFile::feeder`] and
//! [`TlvFile::drainer`] each carry their own 64-bit position and issue
//! `pread(2)` / `pwritev(2)` against the shared descriptor, so any number
//! of endpoints can work on one file concurrently without contending on a
//! shared offset.
//!
//! A freshly preallocated file is zero-filled past its written prefix;
//! zero is not a valid lead byte, so a feeder that runs into the tail
//! reports a framing error once the real records are delivered. Callers
//! that preallocate must track their logical end externally.

use std::io;
use std::io::IoSlice;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::fstat;
use nix::sys::uio::{pread, pwritev};
use nix::unistd;

use crate::codec::{self, Record, Records};
use crate::error::TlvError;
use crate::stream::{advance_batch, Whence, MIN_READ};

/// Most record slices offered to one `pwritev` call (IOV_MAX headroom).
const MAX_IOV: usize = 1024;

/// A record file. Cheap to share: endpoints borrow it and carry their own
/// cursors.
pub struct TlvFile {
    fd: Option<RawFd>,
}

impl TlvFile {
    /// Create (or open) a record file, optionally preallocating
    /// `prealloc_bytes` with `ftruncate`. The preallocated tail reads as
    /// zeroes, which no feeder will mistake for records.
    pub fn create<P: AsRef<Path>>(path: P, prealloc_bytes: u64) -> Result<Self, TlvError> {
        use std::os::unix::fs::OpenOptionsExt;
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o660)
            .open(path.as_ref())?;
        let fd = f.into_raw_fd();
        if prealloc_bytes > 0 {
            if let Err(e) =
                unistd::ftruncate(unsafe { BorrowedFd::borrow_raw(fd) }, prealloc_bytes as i64)
            {
                let _ = unistd::close(fd);
                return Err(e.into());
            }
        }
        Ok(TlvFile { fd: Some(fd) })
    }

    /// Open an existing record file for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TlvError> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(TlvFile {
            fd: Some(f.into_raw_fd()),
        })
    }

    /// Open an existing record file read-only; its drainers will fail.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, TlvError> {
        let f = std::fs::File::open(path.as_ref())?;
        Ok(TlvFile {
            fd: Some(f.into_raw_fd()),
        })
    }

    fn fd(&self) -> Result<RawFd, TlvError> {
        self.fd.ok_or(TlvError::Closed)
    }

    /// Current file length in bytes.
    pub fn size(&self) -> Result<u64, TlvError> {
        let fd = self.fd()?;
        let st = fstat(unsafe { BorrowedFd::borrow_raw(fd) })?;
        Ok(st.st_size as u64)
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<(), TlvError> {
        let fd = self.fd()?;
        unistd::fsync(unsafe { BorrowedFd::borrow_raw(fd) })?;
        Ok(())
    }

    /// Close the descriptor. Safe to call twice; the second call reports
    /// [`TlvError::Closed`] instead of touching a recycled descriptor.
    pub fn close(&mut self) -> Result<(), TlvError> {
        match self.fd.take() {
            Some(fd) => {
                unistd::close(fd)?;
                Ok(())
            }
            None => Err(TlvError::Closed),
        }
    }

    /// A fresh read endpoint positioned at the start of the file.
    pub fn feeder(&self) -> FileFeeder<'_> {
        FileFeeder {
            file: self,
            pos: 0,
            rest: Vec::new(),
            closed: false,
        }
    }

    /// A fresh write endpoint positioned at the start of the file.
    pub fn drainer(&self) -> FileDrainer<'_> {
        FileDrainer {
            file: self,
            pos: 0,
            closed: false,
        }
    }
}

impl Drop for TlvFile {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

fn resolve_seek(pos: i64, offset: i64, whence: Whence, size: u64) -> i64 {
    match whence {
        Whence::Start => offset,
        Whence::Current => pos + offset,
        Whence::End => size as i64 - offset,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Pull-style record reader over a [`TlvFile`], with its own cursor.
///
/// Single-consumer per instance; independent instances on one file never
/// contend.
pub struct FileFeeder<'f> {
    file: &'f TlvFile,
    pos: i64,
    rest: Vec<u8>,
    closed: bool,
}

impl FileFeeder<'_> {
    /// Read forward and return every whole record obtained.
    ///
    /// May return an empty batch while a large record is still arriving.
    /// End-of-file and framing errors are reported only after the records
    /// read so far have been delivered.
    pub fn feed(&mut self) -> Result<Records, TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        let fd = self.file.fd()?;

        // One disk sector minimum; when a header has already told us the
        // record size, fetch the whole remainder in one go. Files get the
        // trusting treatment: a 2 GB header cannot DoS us the way a
        // network peer could.
        let mut more = MIN_READ;
        if !self.rest.is_empty() {
            let need = codec::needed(&self.rest);
            more = more.max(need.saturating_sub(self.rest.len()));
        }

        let start = self.rest.len();
        let target = start + more;
        self.rest.resize(target, 0);
        let mut len = start;
        let mut eof = false;
        while len < target {
            match pread(
                unsafe { BorrowedFd::borrow_raw(fd) },
                &mut self.rest[len..target],
                self.pos,
            ) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    len += n;
                    self.pos += n as i64;
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    self.rest.truncate(len);
                    return Err(e.into());
                }
            }
        }
        self.rest.truncate(len);

        let (records, tail, err) = codec::split(&self.rest);
        if records.is_empty() {
            if let Some(e) = err {
                return Err(e);
            }
            if eof {
                return Err(TlvError::EndOfStream);
            }
            return Ok(Vec::new());
        }
        let batch: Records = records.iter().map(|r| r.to_vec()).collect();
        let consumed = self.rest.len() - tail.len();
        self.rest.drain(..consumed);
        Ok(batch)
    }

    /// Move the cursor, discarding any partially read record.
    ///
    /// An out-of-range position is not an error here; the next
    /// [`feed`](FileFeeder::feed) reports end-of-stream.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64, TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.pos = resolve_seek(self.pos, offset, whence, self.file.size()?);
        self.rest.clear();
        Ok(self.pos)
    }

    /// Detach the endpoint; the file itself stays open.
    pub fn close(&mut self) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.closed = true;
        self.rest = Vec::new();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Push-style record writer over a [`TlvFile`], with its own cursor.
pub struct FileDrainer<'f> {
    file: &'f TlvFile,
    pos: i64,
    closed: bool,
}

impl FileDrainer<'_> {
    /// Write the framed records at the cursor with one scatter write per
    /// syscall, looping until every byte is down.
    pub fn drain(&mut self, records: &[Record]) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        let fd = self.file.fd()?;
        let total: usize = records.iter().map(|r| r.len()).sum();
        if total == 0 {
            return Ok(());
        }

        let mut idx = 0usize;
        let mut off = 0usize;
        while idx < records.len() {
            // Stay under the kernel's iovec-count ceiling per call.
            let take = (records.len() - idx).min(MAX_IOV);
            let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(take);
            iov.push(IoSlice::new(&records[idx][off..]));
            for rec in &records[idx + 1..idx + take] {
                iov.push(IoSlice::new(rec));
            }
            match pwritev(unsafe { BorrowedFd::borrow_raw(fd) }, &iov, self.pos) {
                Ok(0) => return Err(TlvError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.pos += n as i64;
                    advance_batch(records, &mut idx, &mut off, n);
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Encode and write one record at the cursor.
    pub fn write_record(&mut self, lit: u8, body: &[u8]) -> Result<(), TlvError> {
        self.drain(std::slice::from_ref(&codec::record(lit, &[body])))
    }

    /// Move the cursor. An out-of-range position surfaces on the next
    /// [`drain`](FileDrainer::drain), not here.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64, TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.pos = resolve_seek(self.pos, offset, whence, self.file.size()?);
        Ok(self.pos)
    }

    /// Detach the endpoint; the file itself stays open.
    pub fn close(&mut self) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.closed = true;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::record;

    fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn create_drain_feed_round_trip() {
        let (_dir, path) = scratch("roundtrip.tlv");
        let mut file = TlvFile::create(&path, 0).unwrap();
        {
            let mut drainer = file.drainer();
            drainer
                .drain(&[
                    record(b'T', &[b"test"]),
                    record(b'T', &[b"test", b"test"]),
                    record(b'T', &[b"test", b"test", b"test"]),
                ])
                .unwrap();
        }
        file.sync().unwrap();

        let mut feeder = file.feeder();
        let batch = feeder.feed().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].len(), 6);
        assert_eq!(batch[1].len(), 10);
        assert_eq!(batch[2].len(), 14);

        assert!(matches!(feeder.feed(), Err(TlvError::EndOfStream)));
        file.close().unwrap();
    }

    #[test]
    fn preallocated_tail_is_a_framing_error() {
        let (_dir, path) = scratch("prealloc.tlv");
        let file = TlvFile::create(&path, 1024).unwrap();
        assert_eq!(file.size().unwrap(), 1024);

        let mut drainer = file.drainer();
        drainer.write_record(b'T', b"test").unwrap();

        let mut feeder = file.feeder();
        let batch = feeder.feed().unwrap();
        assert_eq!(batch.len(), 1);
        // The zero tail is not a record.
        assert!(matches!(feeder.feed(), Err(TlvError::Malformed)));
    }

    #[test]
    fn second_close_reports_closed() {
        let (_dir, path) = scratch("close.tlv");
        let mut file = TlvFile::create(&path, 0).unwrap();
        file.close().unwrap();
        assert!(matches!(file.close(), Err(TlvError::Closed)));
        assert!(matches!(file.size(), Err(TlvError::Closed)));
    }

    #[test]
    fn endpoints_have_independent_cursors() {
        let (_dir, path) = scratch("cursors.tlv");
        let file = TlvFile::create(&path, 0).unwrap();

        // Two drainers write disjoint regions.
        let mut left = file.drainer();
        let mut right = file.drainer();
        right.seek(4096, Whence::Start).unwrap();
        left.drain(&[record(b'L', &[&[b'l'; 100]])]).unwrap();
        right.drain(&[record(b'R', &[&[b'r'; 100]])]).unwrap();

        // Each feeder observes only its own region.
        let mut f_left = file.feeder();
        let batch = f_left.feed().unwrap();
        assert_eq!(batch, vec![record(b'L', &[&[b'l'; 100]])]);

        let mut f_right = file.feeder();
        f_right.seek(4096, Whence::Start).unwrap();
        let batch = f_right.feed().unwrap();
        assert_eq!(batch, vec![record(b'R', &[&[b'r'; 100]])]);
    }

    #[test]
    fn seek_from_end_counts_backwards() {
        let (_dir, path) = scratch("seekend.tlv");
        let file = TlvFile::create(&path, 0).unwrap();
        let mut drainer = file.drainer();
        let rec = record(b'E', &[b"end"]);
        drainer.drain(&[record(b'F', &[b"front"]), rec.clone()]).unwrap();

        let mut feeder = file.feeder();
        feeder.seek(rec.len() as i64, Whence::End).unwrap();
        assert_eq!(feeder.feed().unwrap(), vec![rec]);
    }

    #[test]
    fn feeder_close_detaches_only_the_endpoint() {
        let (_dir, path) = scratch("detach.tlv");
        let file = TlvFile::create(&path, 0).unwrap();
        let mut feeder = file.feeder();
        feeder.close().unwrap();
        assert!(matches!(feeder.feed(), Err(TlvError::Closed)));
        // The file is still usable.
        assert_eq!(file.size().unwrap(), 0);
    }
}
