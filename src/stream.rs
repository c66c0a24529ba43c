//! Buffered record endpoints over arbitrary byte transports.
//!
//! [`Feeder`] wraps any [`Read`] source and turns it into batches of whole
//! records; [`Drainer`] wraps any [`Write`] sink and turns record batches
//! into coalesced writes. Both buffer: the feeder reads ahead into a
//! pre-buffer, the drainer bundles small records until a write is worth
//! issuing. Neither interprets body bytes.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::codec::{self, Probe, Record, Records};
use crate::error::TlvError;

/// Initial pre-buffer capacity, one default page.
pub const DEFAULT_PRE_BUF: usize = 4096;

/// Reads smaller than this are not worth issuing; the pre-buffer keeps at
/// least this much headroom free.
pub const MIN_READ: usize = 512;

/// Writes smaller than this are bundled; bodies at least this large skip
/// the bundle and go to the sink directly.
pub const MIN_WRITE: usize = 512;

/// Origin for [`Feeder::seek`] and the file endpoint seeks.
///
/// `End` measures a positive offset back from the source's reported end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

// ─────────────────────────────────────────────────────────────────────────────
// Feeder
// ─────────────────────────────────────────────────────────────────────────────

/// Pull-style record reader over any byte source.
///
/// Each [`feed`](Feeder::feed) call yields every whole record currently
/// obtainable and keeps the partial tail for the next call. The pre-buffer
/// always begins at a record boundary.
///
/// A feeder is cheap; when seeking an underlying file around, recreating
/// one costs a single page allocation.
pub struct Feeder<R> {
    src: R,
    pre: Vec<u8>,
    closed: bool,
}

impl<R: Read> Feeder<R> {
    pub fn new(src: R) -> Self {
        Feeder {
            src,
            pre: Vec::with_capacity(DEFAULT_PRE_BUF),
            closed: false,
        }
    }

    /// Read records until at least one whole record, end-of-source, or a
    /// framing error.
    ///
    /// End-of-source never swallows data: the call that hits it returns
    /// any buffered whole records as `Ok`, and the *next* call reports
    /// [`TlvError::EndOfStream`]. A malformed head behaves the same way:
    /// records first, the error on the following call. The feeder does
    /// not resynchronize after a framing error.
    pub fn feed(&mut self) -> Result<Records, TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        let mut eof = false;
        loop {
            match codec::probe(&self.pre) {
                Probe::Header {
                    hdr_len, body_len, ..
                } if self.pre.len() >= hdr_len + body_len => break,
                Probe::Malformed => break,
                _ => {
                    let target = codec::needed(&self.pre).max(self.pre.len() + 1);
                    match self.fill_to(target) {
                        Ok(()) => {}
                        Err(TlvError::EndOfStream) => {
                            eof = true;
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let (records, rest, err) = codec::split(&self.pre);
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
        let consumed = self.pre.len() - rest.len();
        self.pre.drain(..consumed);
        Ok(batch)
    }

    /// Grow and fill the pre-buffer until it holds `target` bytes.
    ///
    /// Growth is doubling-or-minimum: when headroom drops under
    /// [`MIN_READ`] or the capacity cannot hold the target, a fresh buffer
    /// of at least [`DEFAULT_PRE_BUF`] and at least `target` bytes takes
    /// over. Trickle sources therefore do not cause per-byte reallocation.
    fn fill_to(&mut self, target: usize) -> Result<(), TlvError> {
        if self.pre.capacity() - self.pre.len() < MIN_READ || self.pre.capacity() < target {
            let mut grown = Vec::with_capacity(DEFAULT_PRE_BUF.max(target));
            grown.extend_from_slice(&self.pre);
            self.pre = grown;
        }
        while self.pre.len() < target {
            let len = self.pre.len();
            let cap = self.pre.capacity();
            self.pre.resize(cap, 0);
            match self.src.read(&mut self.pre[len..cap]) {
                Ok(0) => {
                    self.pre.truncate(len);
                    return Err(TlvError::EndOfStream);
                }
                Ok(n) => self.pre.truncate(len + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.pre.truncate(len),
                Err(e) => {
                    self.pre.truncate(len);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Mark the feeder closed; further calls report [`TlvError::Closed`].
    pub fn close(&mut self) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.closed = true;
        self.pre = Vec::new();
        Ok(())
    }
}

impl<R: Read + Seek> Feeder<R> {
    /// Move the read position, discarding the pre-buffer.
    ///
    /// `Whence::End` takes a positive `offset` measured back from the end
    /// of the source. Returns the new absolute position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.pre.clear();
        let pos = self.src.seek(match whence {
            Whence::Start => SeekFrom::Start(offset as u64),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(-offset),
        })?;
        Ok(pos)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Drainer
// ─────────────────────────────────────────────────────────────────────────────

/// Push-style record writer over any byte sink.
///
/// Small records accumulate in an outbound buffer and go out once it
/// crosses [`MIN_WRITE`]; a record with a body of [`MIN_WRITE`] bytes or
/// more bypasses the buffer and is written directly. With the manual flag
/// set nothing is written until [`flush`](Drainer::flush).
///
/// Nothing is durable until `flush` returns `Ok`.
pub struct Drainer<W> {
    sink: W,
    buf: Vec<u8>,
    manual: bool,
    closed: bool,
}

impl<W: Write> Drainer<W> {
    pub fn new(sink: W) -> Self {
        Drainer {
            sink,
            buf: Vec::new(),
            manual: false,
            closed: false,
        }
    }

    /// Suppress or re-enable automatic flushing; with `manual` on, the
    /// caller coalesces batches explicitly via [`flush`](Drainer::flush).
    pub fn set_manual(&mut self, manual: bool) {
        self.manual = manual;
    }

    /// Append framed records, flushing opportunistically.
    ///
    /// Every element must be exactly one whole record; anything else is
    /// [`TlvError::Malformed`] and nothing past it is submitted.
    pub fn drain(&mut self, records: &[Record]) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        for rec in records {
            let body_len = match codec::probe(rec) {
                Probe::Header {
                    hdr_len, body_len, ..
                } if rec.len() == hdr_len + body_len => body_len,
                _ => return Err(TlvError::Malformed),
            };
            if body_len >= MIN_WRITE && !self.manual {
                // Large record: flush the bundle, then hand the record to
                // the sink directly.
                self.flush()?;
                self.write_direct(rec)?;
            } else {
                self.buf.extend_from_slice(rec);
                if !self.manual && self.buf.len() >= MIN_WRITE {
                    self.write_once()?;
                }
            }
        }
        Ok(())
    }

    /// Encode and submit one record from a literal and body.
    ///
    /// Same policy as [`drain`](Drainer::drain): bodies of [`MIN_WRITE`]
    /// bytes or more skip the outbound buffer (header first, then the
    /// body, looping over short writes).
    ///
    /// # Panics
    ///
    /// On a non-letter literal or a body over
    /// [`MAX_BODY_LEN`](codec::MAX_BODY_LEN), as the codec does.
    pub fn write_record(&mut self, lit: u8, body: &[u8]) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        codec::append_header(&mut self.buf, lit, body.len());
        if body.len() >= MIN_WRITE && !self.manual {
            self.flush()?;
            self.write_direct(body)?;
        } else {
            self.buf.extend_from_slice(body);
            if !self.manual && self.buf.len() >= MIN_WRITE {
                self.write_once()?;
            }
        }
        Ok(())
    }

    /// Issue one write of the outbound buffer, keeping whatever the sink
    /// did not accept.
    fn write_once(&mut self) -> Result<(), TlvError> {
        match self.sink.write(&self.buf) {
            Ok(0) if !self.buf.is_empty() => {
                Err(TlvError::Io(io::ErrorKind::WriteZero.into()))
            }
            Ok(n) => {
                self.buf.drain(..n);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(TlvError::Io(e)),
        }
    }

    fn write_direct(&mut self, mut bytes: &[u8]) -> Result<(), TlvError> {
        while !bytes.is_empty() {
            match self.sink.write(bytes) {
                Ok(0) => return Err(TlvError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TlvError::Io(e)),
            }
        }
        Ok(())
    }

    /// Drain the outbound buffer completely, looping over short writes.
    pub fn flush(&mut self) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        while !self.buf.is_empty() {
            self.write_once()?;
        }
        Ok(())
    }

    /// Flush, then mark the drainer closed.
    pub fn close(&mut self) -> Result<(), TlvError> {
        if self.closed {
            return Err(TlvError::Closed);
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    /// Bytes bundled but not yet offered to the sink.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Flush and hand the sink back.
    pub fn into_inner(mut self) -> Result<W, TlvError> {
        if !self.closed {
            self.flush()?;
        }
        Ok(self.sink)
    }
}

/// Advance a scatter-write cursor over `records` by `n` written bytes.
///
/// `idx`/`off` address the first unwritten byte. Shared by the file
/// drainer and the depot's socket writer.
pub(crate) fn advance_batch(records: &[Record], idx: &mut usize, off: &mut usize, mut n: usize) {
    while n > 0 && *idx < records.len() {
        let left = records[*idx].len() - *off;
        if n < left {
            *off += n;
            return;
        }
        n -= left;
        *idx += 1;
        *off = 0;
    }
    // Skip any zero-length entries so the cursor lands on real bytes.
    while *idx < records.len() && records[*idx].is_empty() {
        *idx += 1;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::record;
    use std::io::Cursor;

    /// A reader that hands out one byte per call, exercising the partial
    /// read paths.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    /// A sink that records every write call's length and accepts at most
    /// `accept` bytes per call.
    struct ChunkSink {
        written: Vec<u8>,
        calls: Vec<usize>,
        accept: usize,
    }

    impl ChunkSink {
        fn new(accept: usize) -> Self {
            ChunkSink {
                written: Vec::new(),
                calls: Vec::new(),
                accept,
            }
        }
    }

    impl Write for ChunkSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.accept);
            self.written.extend_from_slice(&buf[..n]);
            self.calls.push(n);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn stream_of(specs: &[(u8, usize)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(lit, len) in specs {
            crate::codec::append_record(&mut out, lit, &[&vec![lit; len]]);
        }
        out
    }

    #[test]
    fn feeder_returns_whole_records_then_eof() {
        let stream = stream_of(&[(b'A', 4), (b'B', 8)]);
        let mut feeder = Feeder::new(Cursor::new(stream));

        let batch = feeder.feed().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], record(b'A', &[&[b'A'; 4]]));
        assert!(matches!(feeder.feed(), Err(TlvError::EndOfStream)));
    }

    #[test]
    fn feeder_tolerates_single_byte_reads() {
        let stream = stream_of(&[(b'A', 3), (b'B', 300), (b'C', 0)]);
        let mut feeder = Feeder::new(Trickle {
            data: stream.clone(),
            pos: 0,
        });

        let mut all = Vec::new();
        loop {
            match feeder.feed() {
                Ok(batch) => all.extend(batch),
                Err(TlvError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let flat: Vec<u8> = all.concat();
        assert_eq!(flat, stream);
    }

    #[test]
    fn feeder_surfaces_malformed_after_good_records() {
        let mut stream = stream_of(&[(b'A', 2)]);
        stream.extend_from_slice(&[0x00, 0x00]);
        let mut feeder = Feeder::new(Cursor::new(stream));

        let batch = feeder.feed().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(feeder.feed(), Err(TlvError::Malformed)));
    }

    #[test]
    fn feeder_seek_resets_the_prebuffer() {
        let stream = stream_of(&[(b'A', 4), (b'B', 8), (b'C', 12)]);
        let mut feeder = Feeder::new(Cursor::new(stream));
        let first = feeder.feed().unwrap();
        assert_eq!(first.len(), 3);

        // Back to the second record.
        feeder.seek(6, Whence::Start).unwrap();
        let again = feeder.feed().unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0], record(b'B', &[&[b'B'; 8]]));
    }

    #[test]
    fn feeder_close_is_terminal() {
        let mut feeder = Feeder::new(Cursor::new(Vec::new()));
        feeder.close().unwrap();
        assert!(matches!(feeder.feed(), Err(TlvError::Closed)));
        assert!(matches!(feeder.close(), Err(TlvError::Closed)));
    }

    #[test]
    fn drainer_bundles_small_records() {
        let mut drainer = Drainer::new(ChunkSink::new(usize::MAX));
        let recs: Records = (0..4).map(|_| record(b'A', &[b"tiny"])).collect();
        drainer.drain(&recs).unwrap();
        // 4 records of 6 bytes stay under the write threshold.
        assert_eq!(drainer.pending(), 24);
        assert!(drainer.sink.calls.is_empty());

        drainer.flush().unwrap();
        assert_eq!(drainer.pending(), 0);
        assert_eq!(drainer.sink.written.len(), 24);
    }

    #[test]
    fn drainer_large_bodies_bypass_the_buffer() {
        let mut drainer = Drainer::new(ChunkSink::new(usize::MAX));
        drainer.drain(&[record(b'S', &[b"small"])]).unwrap();
        let big = record(b'L', &[&vec![7u8; 2048]]);
        drainer.drain(&[big.clone()]).unwrap();

        // The pending small record was flushed ahead of the direct write.
        assert_eq!(drainer.pending(), 0);
        let mut expect = record(b'S', &[b"small"]);
        expect.extend_from_slice(&big);
        assert_eq!(drainer.sink.written, expect);
    }

    #[test]
    fn drainer_loops_over_short_writes() {
        let mut drainer = Drainer::new(ChunkSink::new(100));
        drainer.write_record(b'L', &vec![3u8; 1500]).unwrap();
        drainer.flush().unwrap();
        assert_eq!(drainer.sink.written.len(), 5 + 1500);
        assert!(drainer.sink.calls.iter().all(|&n| n <= 100));
    }

    #[test]
    fn manual_mode_suppresses_auto_flush() {
        let mut drainer = Drainer::new(ChunkSink::new(usize::MAX));
        drainer.set_manual(true);
        drainer.write_record(b'L', &vec![1u8; 4096]).unwrap();
        assert!(drainer.sink.calls.is_empty());
        assert_eq!(drainer.pending(), 5 + 4096);

        drainer.flush().unwrap();
        assert_eq!(drainer.sink.written.len(), 5 + 4096);
    }

    #[test]
    fn drainer_rejects_partial_records() {
        let mut drainer = Drainer::new(ChunkSink::new(usize::MAX));
        let rec = record(b'A', &[b"whole"]);
        assert!(matches!(
            drainer.drain(&[rec[..3].to_vec()]),
            Err(TlvError::Malformed)
        ));
    }

    #[test]
    fn advance_batch_walks_partial_writes() {
        let recs: Records = vec![record(b'A', &[b"aa"]), record(b'B', &[b"bbbb"])];
        let (mut idx, mut off) = (0, 0);
        advance_batch(&recs, &mut idx, &mut off, 3);
        assert_eq!((idx, off), (0, 3));
        advance_batch(&recs, &mut idx, &mut off, 1);
        assert_eq!((idx, off), (1, 0));
        advance_batch(&recs, &mut idx, &mut off, 6);
        assert_eq!((idx, off), (2, 0));
    }
}
