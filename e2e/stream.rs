//! E2E Test Suite 02: Buffered feeder and drainer
//!
//! Exercises the stream machinery over in-memory transports: chunked
//! sources, end-of-stream ordering, write coalescing, and the drainer's
//! large-record fast path.

use std::io::{self, Cursor, Read};

use tlvio::{record, split, Drainer, Feeder, Records, TlvError, Whence};

/// A source that yields at most `chunk` bytes per read call.
struct Chunked {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.data.len() - self.pos).min(self.chunk).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn sample_stream() -> (Vec<u8>, Records) {
    let records = vec![
        record(b'A', &[b""]),
        record(b'B', &[b"body"]),
        record(b'C', &[&vec![b'c'; 255]]),
        record(b'D', &[&vec![b'd'; 256]]),
        record(b'E', &[&vec![b'e'; 5000]]),
    ];
    (records.concat(), records)
}

/// Feed the whole source to exhaustion, collecting every batch.
fn feed_all<R: Read>(feeder: &mut Feeder<R>) -> Records {
    let mut all = Vec::new();
    loop {
        match feeder.feed() {
            Ok(batch) => all.extend(batch),
            Err(TlvError::EndOfStream) => return all,
            Err(e) => panic!("feed failed: {e}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: Chunking does not change what the feeder yields
// ─────────────────────────────────────────────────────────────────────────────

/// Byte-at-a-time, small-chunk, and single-read sources all produce the
/// same record list.
#[test]
fn streaming_equivalence_under_chunking() {
    let (stream, expect) = sample_stream();

    for chunk in [1usize, 7, 512, usize::MAX] {
        let mut feeder = Feeder::new(Chunked {
            data: stream.clone(),
            pos: 0,
            chunk,
        });
        let got = feed_all(&mut feeder);
        assert_eq!(got, expect, "chunk size {chunk}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: End-of-stream comes after the records, never instead of them
// ─────────────────────────────────────────────────────────────────────────────

/// A source that ends right at a record boundary delivers every record
/// before reporting end-of-stream.
#[test]
fn eof_never_swallows_records() {
    let (stream, expect) = sample_stream();
    let mut feeder = Feeder::new(Cursor::new(stream));

    let mut batches = Vec::new();
    let err = loop {
        match feeder.feed() {
            Ok(batch) => batches.push(batch),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, TlvError::EndOfStream));
    let got: Records = batches.into_iter().flatten().collect();
    assert_eq!(got, expect);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: A truncated tail is incomplete, a corrupt head is fatal
// ─────────────────────────────────────────────────────────────────────────────

/// Truncating the final record yields the whole records then EOF; a bad
/// lead byte yields the whole records then a framing error.
#[test]
fn tail_truncation_vs_corruption() {
    let (stream, expect) = sample_stream();

    let mut truncated = stream.clone();
    truncated.truncate(stream.len() - 1);
    let mut feeder = Feeder::new(Cursor::new(truncated));
    let got = feed_all(&mut feeder);
    assert_eq!(got, expect[..expect.len() - 1]);

    let mut corrupt = stream.clone();
    let cut = expect[0].len() + expect[1].len();
    corrupt.truncate(cut);
    corrupt.push(0x1F); // not a lead byte
    let mut feeder = Feeder::new(Cursor::new(corrupt));
    let first = feeder.feed().expect("records before the corruption");
    assert_eq!(first, expect[..2]);
    assert!(matches!(feeder.feed(), Err(TlvError::Malformed)));
    // The feeder does not resynchronize.
    assert!(matches!(feeder.feed(), Err(TlvError::Malformed)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: Seeking resets the read-ahead
// ─────────────────────────────────────────────────────────────────────────────

/// After a seek the feeder picks up records at the new position with no
/// stale pre-buffered bytes.
#[test]
fn seek_discards_read_ahead() {
    let (stream, expect) = sample_stream();
    let mut feeder = Feeder::new(Cursor::new(stream));
    let _ = feeder.feed().expect("initial read");

    feeder
        .seek(expect[0].len() as i64, Whence::Start)
        .expect("seek to the second record");
    let got = feed_all(&mut feeder);
    assert_eq!(got, expect[1..]);

    // And from the end: exactly the last record's length back.
    feeder
        .seek(expect.last().unwrap().len() as i64, Whence::End)
        .expect("seek from end");
    let got = feed_all(&mut feeder);
    assert_eq!(got, expect[expect.len() - 1..]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: Drainer output equals the concatenated records
// ─────────────────────────────────────────────────────────────────────────────

/// Whatever mix of buffered, direct, and manual paths the records take,
/// the sink ends up with the exact byte stream.
#[test]
fn drainer_preserves_the_byte_stream() {
    let (stream, records) = sample_stream();

    let mut auto = Drainer::new(Vec::new());
    auto.drain(&records).expect("auto drain");
    auto.flush().expect("auto flush");

    let mut manual = Drainer::new(Vec::new());
    manual.set_manual(true);
    for rec in &records {
        manual
            .drain(std::slice::from_ref(rec))
            .expect("manual drain");
    }
    manual.flush().expect("manual flush");

    let mut by_parts = Drainer::new(Vec::new());
    by_parts.write_record(b'A', b"").expect("write_record");
    by_parts.write_record(b'B', b"body").expect("write_record");
    by_parts
        .write_record(b'C', &vec![b'c'; 255])
        .expect("write_record");
    by_parts
        .write_record(b'D', &vec![b'd'; 256])
        .expect("write_record");
    by_parts
        .write_record(b'E', &vec![b'e'; 5000])
        .expect("write_record");

    assert_eq!(auto.into_inner().expect("auto sink"), stream);
    assert_eq!(manual.into_inner().expect("manual sink"), stream);
    assert_eq!(by_parts.into_inner().expect("by_parts sink"), stream);

    // And the byte stream still splits back into the same records.
    let (recs, rest, err) = split(&stream);
    assert!(err.is_none() && rest.is_empty());
    assert_eq!(recs.len(), records.len());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: Closed endpoints refuse further work
// ─────────────────────────────────────────────────────────────────────────────

/// close() is terminal on both endpoints and reports Closed thereafter.
#[test]
fn close_is_terminal() {
    let (stream, _) = sample_stream();
    let mut feeder = Feeder::new(Cursor::new(stream));
    feeder.close().expect("first close");
    assert!(matches!(feeder.feed(), Err(TlvError::Closed)));
    assert!(matches!(feeder.close(), Err(TlvError::Closed)));

    let mut drainer = Drainer::new(Vec::new());
    drainer.drain(&[record(b'A', &[b"x"])]).expect("drain");
    drainer.close().expect("first close flushes");
    assert!(matches!(
        drainer.drain(&[record(b'A', &[b"x"])]),
        Err(TlvError::Closed)
    ));
    assert!(matches!(drainer.flush(), Err(TlvError::Closed)));
}
