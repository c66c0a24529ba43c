//! E2E Test Suite 03: File transport
//!
//! Drives `TlvFile` endpoints against real temporary files: the
//! preallocated-file read sequence, seeking, endpoint independence under
//! concurrency, and close semantics.

#![cfg(unix)]

use tlvio::{record, take, Records, TlvError, TlvFile, Whence};

fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: The preallocated-file feed sequence
// ─────────────────────────────────────────────────────────────────────────────

/// Into a 10000-byte preallocated file go ⟨'T',4⟩ ⟨'T',8⟩ ⟨'T',12⟩ and
/// ⟨'T',8192⟩. The first feed returns the three short records (6, 10, 14
/// bytes), the second returns the one long record (8197 bytes), and the
/// third runs into the zero tail and reports a framing error.
#[test]
fn preallocated_feed_sequence() {
    let (_dir, path) = scratch("prealloc.tlv");
    let mut file = TlvFile::create(&path, 10_000).expect("create");
    assert_eq!(file.size().expect("size"), 10_000);

    {
        let mut drainer = file.drainer();
        drainer
            .drain(&[
                record(b'T', &[&[b't'; 4]]),
                record(b'T', &[&[b't'; 8]]),
                record(b'T', &[&[b't'; 12]]),
                record(b'T', &[&[b't'; 8192]]),
            ])
            .expect("drain");
    }
    file.sync().expect("sync");

    let mut feeder = file.feeder();
    let first = feeder.feed().expect("first feed");
    assert_eq!(
        first.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![6, 10, 14]
    );

    let second = feeder.feed().expect("second feed");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].len(), 5 + 8192);
    let (body, _) = take(b'T', &second[0]).expect("long record decodes");
    assert_eq!(body.len(), 8192);

    assert!(matches!(feeder.feed(), Err(TlvError::Malformed)));

    file.close().expect("close");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: Seeking to a record boundary
// ─────────────────────────────────────────────────────────────────────────────

/// After the scenario above, seek(6, start) re-reads records two and
/// three: lengths 10 and 14.
#[test]
fn seek_to_second_record() {
    let (_dir, path) = scratch("seek.tlv");
    let file = TlvFile::create(&path, 10_000).expect("create");
    {
        let mut drainer = file.drainer();
        drainer
            .drain(&[
                record(b'T', &[&[b't'; 4]]),
                record(b'T', &[&[b't'; 8]]),
                record(b'T', &[&[b't'; 12]]),
            ])
            .expect("drain");
    }

    let mut feeder = file.feeder();
    let _ = feeder.feed().expect("initial feed");
    feeder.seek(6, Whence::Start).expect("seek");
    let batch = feeder.feed().expect("feed after seek");
    assert_eq!(
        batch.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![10, 14]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: Endpoints are independent under concurrency
// ─────────────────────────────────────────────────────────────────────────────

/// Two drainers write disjoint regions from separate threads; two feeders
/// then read back exactly the records of their own region.
#[test]
fn concurrent_endpoints_do_not_interfere() {
    let (_dir, path) = scratch("parallel.tlv");
    let file = TlvFile::create(&path, 0).expect("create");

    let low: Records = (0..50).map(|i| record(b'L', &[&[i as u8; 64]])).collect();
    let high: Records = (0..50).map(|i| record(b'H', &[&[i as u8; 64]])).collect();
    let region = 64 * 1024;

    std::thread::scope(|s| {
        let low = &low;
        let high = &high;
        let file = &file;
        s.spawn(move || {
            let mut d = file.drainer();
            for rec in low {
                d.drain(std::slice::from_ref(rec)).expect("low drain");
            }
        });
        s.spawn(move || {
            let mut d = file.drainer();
            d.seek(region, Whence::Start).expect("seek high");
            for rec in high {
                d.drain(std::slice::from_ref(rec)).expect("high drain");
            }
        });
    });
    file.sync().expect("sync");

    let mut f_low = file.feeder();
    let mut got_low = Vec::new();
    while got_low.len() < low.len() {
        match f_low.feed() {
            Ok(batch) => got_low.extend(batch),
            Err(e) => panic!("low region unreadable: {e}"),
        }
    }
    assert_eq!(got_low, low);

    let mut f_high = file.feeder();
    f_high.seek(region, Whence::Start).expect("seek high");
    let mut got_high = Vec::new();
    while got_high.len() < high.len() {
        match f_high.feed() {
            Ok(batch) => got_high.extend(batch),
            Err(TlvError::EndOfStream) => break,
            Err(e) => panic!("high region unreadable: {e}"),
        }
    }
    assert_eq!(got_high, high);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: Close semantics
// ─────────────────────────────────────────────────────────────────────────────

/// Close is idempotent for safety but the second call reports Closed, and
/// endpoints of a closed file fail rather than touch a dead descriptor.
#[test]
fn close_semantics() {
    let (_dir, path) = scratch("close.tlv");
    let mut file = TlvFile::create(&path, 0).expect("create");

    {
        let mut feeder = file.feeder();
        let mut drainer = file.drainer();

        // Endpoint close detaches only the endpoint.
        drainer.close().expect("drainer close");
        assert!(matches!(
            drainer.drain(&[record(b'A', &[b"x"])]),
            Err(TlvError::Closed)
        ));
        // The file itself is untouched: an empty file is just EOF.
        assert!(matches!(feeder.feed(), Err(TlvError::EndOfStream)));
    }

    file.close().expect("first close");
    assert!(matches!(file.close(), Err(TlvError::Closed)));
    assert!(matches!(file.sync(), Err(TlvError::Closed)));
    assert!(matches!(file.feeder().feed(), Err(TlvError::Closed)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: Read-only files feed but do not drain
// ─────────────────────────────────────────────────────────────────────────────

/// A read-only handle serves feeders; its drainers surface the transport
/// error instead of silently writing nothing.
#[test]
fn read_only_files_reject_writes() {
    let (_dir, path) = scratch("ro.tlv");
    {
        let file = TlvFile::create(&path, 0).expect("create");
        let mut d = file.drainer();
        d.write_record(b'R', b"read me").expect("seed record");
    }

    let file = TlvFile::open_read_only(&path).expect("open read-only");
    let mut feeder = file.feeder();
    let batch = feeder.feed().expect("feed");
    assert_eq!(batch, vec![record(b'R', &[b"read me"])]);

    let mut drainer = file.drainer();
    assert!(matches!(
        drainer.write_record(b'W', b"nope"),
        Err(TlvError::Io(_))
    ));
}
