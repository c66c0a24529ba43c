//! E2E Test Suite 01: Frame codec
//!
//! Wire-level scenarios for the three header encodings, plus the decode
//! properties the rest of the crate leans on: round-trip, prefix-closed
//! probing, and the incomplete/malformed distinction.

use tlvio::codec::MAX_BODY_LEN;
use tlvio::{
    append_record, close_header, open_header, probe, record, split, take, take_any, Probe,
    TlvError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: Two short records, byte for byte
// ─────────────────────────────────────────────────────────────────────────────

/// ⟨'A',"A"⟩ then ⟨'B',"BB"⟩ encode to `61 01 41 62 02 42 42` and decode
/// back with an empty remainder.
#[test]
fn short_short_byte_exact() {
    let mut buf = Vec::new();
    append_record(&mut buf, b'A', &[b"A"]);
    append_record(&mut buf, b'B', &[b"BB"]);
    assert_eq!(buf, [0x61, 0x01, 0x41, 0x62, 0x02, 0x42, 0x42]);

    let (lit, body, rest) = take_any(&buf).expect("first record");
    assert_eq!((lit, body), (b'A', &b"A"[..]));
    let (lit, body, rest) = take_any(rest).expect("second record");
    assert_eq!((lit, body), (b'B', &b"BB"[..]));
    assert!(rest.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: The 256-byte body crosses into the long form
// ─────────────────────────────────────────────────────────────────────────────

/// ⟨'C', 256 × 'c'⟩ is 261 bytes: lead 0x43, length `00 01 00 00`, body.
#[test]
fn long_form_at_256() {
    let body = vec![b'c'; 256];
    let rec = record(b'C', &[&body]);
    assert_eq!(rec.len(), 261);
    assert_eq!(rec[0], 0x43);
    assert_eq!(&rec[1..5], &[0x00, 0x01, 0x00, 0x00]);

    let (got, rest) = take(b'C', &rec).expect("long record decodes");
    assert_eq!(got, &body[..]);
    assert!(rest.is_empty());

    // One byte smaller stays short.
    let rec = record(b'C', &[&body[..255]]);
    assert_eq!(rec.len(), 2 + 255);
    assert_eq!(rec[0], b'c');
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: Oversize length vs merely missing bytes
// ─────────────────────────────────────────────────────────────────────────────

/// A long length field of 0x80000000 is malformed; a header-only long
/// record with length 1 is incomplete.
#[test]
fn oversize_is_malformed_header_only_is_incomplete() {
    let oversize = [b'A', 0x00, 0x00, 0x00, 0x80];
    assert_eq!(probe(&oversize), Probe::Malformed);
    assert!(matches!(take_any(&oversize), Err(TlvError::Malformed)));

    let header_only = [b'A', 0x01, 0x00, 0x00, 0x00];
    assert_eq!(
        probe(&header_only),
        Probe::Header {
            lit: b'A',
            hdr_len: 5,
            body_len: 1
        }
    );
    assert!(matches!(take_any(&header_only), Err(TlvError::Incomplete)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: Round-trip across sizes and literals
// ─────────────────────────────────────────────────────────────────────────────

/// Encoding a mixed batch and splitting it back yields the same records
/// with nothing left over.
#[test]
fn mixed_batch_round_trip() {
    let sizes = [0usize, 1, 9, 10, 200, 255, 256, 1000, 70_000];
    let mut stream = Vec::new();
    let mut expect = Vec::new();
    for (i, &n) in sizes.iter().enumerate() {
        let lit = b'A' + (i as u8 % 26);
        let body = vec![lit; n];
        let rec = record(lit, &[&body]);
        stream.extend_from_slice(&rec);
        expect.push(rec);
    }

    let (records, rest, err) = split(&stream);
    assert!(err.is_none());
    assert!(rest.is_empty());
    assert_eq!(records.len(), expect.len());
    for (got, want) in records.iter().zip(&expect) {
        assert_eq!(got, &&want[..]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: Probing every prefix of a stream
// ─────────────────────────────────────────────────────────────────────────────

/// No strict prefix of a valid stream ever probes malformed, and every
/// complete-header prefix reports the first record's true shape.
#[test]
fn prefixes_never_probe_malformed() {
    let mut stream = Vec::new();
    append_record(&mut stream, b't', &[b"abc"]); // tiny on request
    append_record(&mut stream, b'S', &[b"short"]);
    append_record(&mut stream, b'L', &[&vec![9u8; 400]]);

    let first = probe(&stream);
    for k in 0..=stream.len() {
        match probe(&stream[..k]) {
            Probe::Malformed => panic!("prefix {k} probed malformed"),
            Probe::Header { lit, hdr_len, body_len } if k >= 1 => {
                // Once the header is visible its classification is final.
                assert_eq!(
                    Probe::Header { lit, hdr_len, body_len },
                    first,
                    "prefix {k} disagrees with the full stream"
                );
            }
            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: Streamed records via open/close header
// ─────────────────────────────────────────────────────────────────────────────

/// open_header + body appends + close_header produces a record `take`
/// accepts, including an empty one.
#[test]
fn open_close_header_streams_bodies() {
    let mut buf = Vec::new();
    let mark = open_header(&mut buf, b'A');
    for chunk in [b"part one, ".as_slice(), b"part two".as_slice()] {
        buf.extend_from_slice(chunk);
    }
    close_header(&mut buf, mark);

    let (body, rest) = take(b'A', &buf).expect("streamed record decodes");
    assert_eq!(body, b"part one, part two");
    assert!(rest.is_empty());

    // Zero-length streamed record.
    let mut buf = Vec::new();
    let mark = open_header(&mut buf, b'Z');
    close_header(&mut buf, mark);
    let (body, _) = take(b'Z', &buf).expect("empty streamed record decodes");
    assert!(body.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: The decode-side length cap
// ─────────────────────────────────────────────────────────────────────────────

/// 2^31−1 is the largest length a header may claim; the next value up is
/// malformed on sight.
#[test]
fn length_cap_boundary() {
    let max_ok = {
        let mut h = vec![b'A'];
        h.extend_from_slice(&(MAX_BODY_LEN as u32).to_le_bytes());
        h
    };
    assert_eq!(
        probe(&max_ok),
        Probe::Header {
            lit: b'A',
            hdr_len: 5,
            body_len: MAX_BODY_LEN
        }
    );

    let too_big = {
        let mut h = vec![b'A'];
        h.extend_from_slice(&((MAX_BODY_LEN as u32) + 1).to_le_bytes());
        h
    };
    assert_eq!(probe(&too_big), Probe::Malformed);
}
