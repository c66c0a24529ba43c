//! The TLV frame codec: pure functions over byte slices.
//!
//! A record on the wire is `header || body`. The header shape is dictated
//! entirely by the lead byte:
//!
//! | lead byte    | header | body length          | body range |
//! |--------------|--------|----------------------|------------|
//! | `'0'..='9'`  | 1      | lead − `'0'`         | 0..9       |
//! | `'a'..='z'`  | 2      | second byte          | 0..255     |
//! | `'A'..='Z'`  | 5      | u32 LE, top bit zero | 0..2^31−1  |
//!
//! Tiny records carry a length only; they decode with the synthetic
//! literal `'0'`. Short and long records decode with the uppercase letter.
//! Nothing in this module touches body bytes or allocates beyond the
//! record list returned by [`split`].

use crate::error::TlvError;

/// One whole framed record, header included.
pub type Record = Vec<u8>;

/// A batch of framed records, as produced by feeders and consumed by
/// drainers.
pub type Records = Vec<Record>;

/// Largest body a record may carry: 2^31 − 1 bytes. Longer length fields
/// (top bit set) are malformed on decode; encoding a longer body panics.
pub const MAX_BODY_LEN: usize = 0x7FFF_FFFF;

/// Lead bytes at or above this body length take the long form.
const SHORT_MAX: usize = 0xFF;

/// Bodies below this length may take the tiny form when the caller asks
/// for it with a lowercase literal.
const TINY_MAX: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Literal classification
// ─────────────────────────────────────────────────────────────────────────────

/// `true` for a lowercase letter, the short-form lead range.
#[inline]
pub fn is_short_lit(lit: u8) -> bool {
    lit.is_ascii_lowercase()
}

/// `true` for an uppercase letter, the long-form lead range.
#[inline]
pub fn is_long_lit(lit: u8) -> bool {
    lit.is_ascii_uppercase()
}

/// `true` for any letter usable as a record literal.
#[inline]
pub fn is_lit(lit: u8) -> bool {
    is_short_lit(lit) || is_long_lit(lit)
}

// ─────────────────────────────────────────────────────────────────────────────
// Probing
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of the next record in a buffer, without consuming input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The buffer is a strict prefix of a valid header; read more.
    Incomplete,
    /// The lead byte is outside the three ranges, or a long length field
    /// has its top bit set.
    Malformed,
    /// A well-formed header. The whole record needs `hdr_len + body_len`
    /// bytes; `lit` is `'A'..='Z'` or the synthetic `'0'`.
    Header {
        lit: u8,
        hdr_len: usize,
        body_len: usize,
    },
}

/// Classify the next record. Total over every input; inspects only the
/// header bytes, never the body.
pub fn probe(buf: &[u8]) -> Probe {
    let Some(&lead) = buf.first() else {
        return Probe::Incomplete;
    };
    match lead {
        b'0'..=b'9' => Probe::Header {
            lit: b'0',
            hdr_len: 1,
            body_len: (lead - b'0') as usize,
        },
        b'a'..=b'z' => {
            if buf.len() < 2 {
                Probe::Incomplete
            } else {
                Probe::Header {
                    lit: lead.to_ascii_uppercase(),
                    hdr_len: 2,
                    body_len: buf[1] as usize,
                }
            }
        }
        b'A'..=b'Z' => {
            if buf.len() < 5 {
                return Probe::Incomplete;
            }
            let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
            if len & 0x8000_0000 != 0 {
                Probe::Malformed
            } else {
                Probe::Header {
                    lit: lead,
                    hdr_len: 5,
                    body_len: len as usize,
                }
            }
        }
        _ => Probe::Malformed,
    }
}

/// Total bytes the next record requires, once its header is readable.
///
/// While the header itself is still incomplete the best answer is "at
/// least one more byte", so `buf.len() + 1` is returned. A malformed head
/// needs nothing more and yields 0. Feeders use this to size their reads.
pub fn needed(buf: &[u8]) -> usize {
    match probe(buf) {
        Probe::Header {
            hdr_len, body_len, ..
        } => hdr_len + body_len,
        Probe::Incomplete => buf.len() + 1,
        Probe::Malformed => 0,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Taking records off a buffer
// ─────────────────────────────────────────────────────────────────────────────

/// Take the first record's body off `data`, whatever its literal.
///
/// Returns `(lit, body, rest)`. Wary: an ill-formed head is
/// [`TlvError::Malformed`], a short buffer is [`TlvError::Incomplete`].
pub fn take_any(data: &[u8]) -> Result<(u8, &[u8], &[u8]), TlvError> {
    match probe(data) {
        Probe::Incomplete => Err(TlvError::Incomplete),
        Probe::Malformed => Err(TlvError::Malformed),
        Probe::Header {
            lit,
            hdr_len,
            body_len,
        } => {
            let total = hdr_len + body_len;
            if data.len() < total {
                return Err(TlvError::Incomplete);
            }
            Ok((lit, &data[hdr_len..total], &data[total..]))
        }
    }
}

/// Take the first record's body off `data`, requiring the literal `lit`.
///
/// `lit == b'0'` matches any well-formed record; otherwise a literal
/// mismatch is [`TlvError::Malformed`].
pub fn take(lit: u8, data: &[u8]) -> Result<(&[u8], &[u8]), TlvError> {
    let (got, body, rest) = take_any(data)?;
    if lit != b'0' && got != lit {
        return Err(TlvError::Malformed);
    }
    Ok((body, rest))
}

/// Trusting form of [`take`]: collapses any failure to an empty body and
/// an untouched buffer. Only for storage this process produced itself.
pub fn take_trusting(lit: u8, data: &[u8]) -> (&[u8], &[u8]) {
    match take(lit, data) {
        Ok((body, rest)) => (body, rest),
        Err(_) => (&[], data),
    }
}

/// Trusting form of [`take_any`]; a zero literal marks the failure case.
pub fn take_any_trusting(data: &[u8]) -> (u8, &[u8], &[u8]) {
    match take_any(data) {
        Ok(x) => x,
        Err(_) => (0, &[], data),
    }
}

/// Greedily peel whole records off the front of `buf`.
///
/// The returned slices point into `buf`. Peeling stops at an incomplete
/// tail, returned as the remainder with no error, or at a malformed head,
/// returned as the remainder together with `Some(Malformed)` and
/// everything already peeled.
pub fn split(buf: &[u8]) -> (Vec<&[u8]>, &[u8], Option<TlvError>) {
    let mut records = Vec::new();
    let mut rest = buf;
    loop {
        match probe(rest) {
            Probe::Header {
                hdr_len, body_len, ..
            } if rest.len() >= hdr_len + body_len => {
                let (rec, tail) = rest.split_at(hdr_len + body_len);
                records.push(rec);
                rest = tail;
            }
            Probe::Malformed => return (records, rest, Some(TlvError::Malformed)),
            _ => return (records, rest, None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Append one record header to `out`.
///
/// Selection rule: a body over 255 bytes always takes the long form with
/// an uppercase lead. Otherwise the short form is used, unless the
/// caller passed a lowercase literal for a body under 10 bytes, which
/// requests the tiny form (the letter is dropped on the wire).
///
/// # Panics
///
/// On a non-letter literal, or a body length over [`MAX_BODY_LEN`]. Both
/// are caller contract violations, not data errors.
pub fn append_header(out: &mut Vec<u8>, lit: u8, body_len: usize) {
    assert!(is_lit(lit), "record literals are letters A-Z");
    assert!(
        body_len <= MAX_BODY_LEN,
        "record body exceeds 2^31-1 bytes"
    );
    if body_len > SHORT_MAX {
        out.push(lit.to_ascii_uppercase());
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
    } else if is_short_lit(lit) && body_len < TINY_MAX {
        out.push(b'0' + body_len as u8);
    } else {
        out.push(lit.to_ascii_lowercase());
        out.push(body_len as u8);
    }
}

/// Append one record made of `parts` concatenated into a single body.
pub fn append_record(out: &mut Vec<u8>, lit: u8, parts: &[&[u8]]) {
    let body_len = parts.iter().map(|p| p.len()).sum();
    append_header(out, lit, body_len);
    for part in parts {
        out.extend_from_slice(part);
    }
}

/// Frame one record from body parts.
pub fn record(lit: u8, parts: &[&[u8]]) -> Record {
    let mut out = Vec::new();
    append_record(&mut out, lit, parts);
    out
}

/// Open a streamed record: emit a long header with a blank length, to be
/// patched by [`close_header`] once the body has been appended.
///
/// Returns a bookmark for the close call. Always emits the long form.
///
/// # Panics
///
/// On a non-uppercase literal.
pub fn open_header(out: &mut Vec<u8>, lit: u8) -> usize {
    assert!(is_long_lit(lit), "streamed records take uppercase A-Z literals");
    out.push(lit);
    out.extend_from_slice(&[0u8; 4]);
    out.len()
}

/// Close a streamed record opened by [`open_header`], patching the length
/// field in place.
///
/// # Panics
///
/// On a bookmark that cannot have come from `open_header` on this buffer,
/// or a body that grew past [`MAX_BODY_LEN`].
pub fn close_header(out: &mut Vec<u8>, bookmark: usize) {
    assert!(
        bookmark >= 5 && bookmark <= out.len(),
        "close_header: bookmark does not match an open header"
    );
    let body_len = out.len() - bookmark;
    assert!(
        body_len <= MAX_BODY_LEN,
        "record body exceeds 2^31-1 bytes"
    );
    out[bookmark - 4..bookmark].copy_from_slice(&(body_len as u32).to_le_bytes());
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_records_encode_as_documented() {
        let mut buf = Vec::new();
        append_record(&mut buf, b'A', &[b"A"]);
        append_record(&mut buf, b'B', &[b"BB"]);
        assert_eq!(buf, [b'a', 1, b'A', b'b', 2, b'B', b'B']);

        let (body, rest) = take(b'A', &buf).unwrap();
        assert_eq!(body, b"A");
        let (body2, rest2) = take(b'B', rest).unwrap();
        assert_eq!(body2, b"BB");
        assert!(rest2.is_empty());
    }

    #[test]
    fn large_bodies_take_the_long_form() {
        let body = vec![b'c'; 256];
        let mut buf = Vec::new();
        append_record(&mut buf, b'C', &[&body]);
        assert_eq!(buf.len(), 5 + 256);
        assert_eq!(buf[0], 0x43);
        assert_eq!(&buf[1..5], &[0x00, 0x01, 0x00, 0x00]);

        let (lit, got, rest) = take_any(&buf).unwrap();
        assert_eq!(lit, b'C');
        assert_eq!(got, &body[..]);
        assert!(rest.is_empty());
    }

    #[test]
    fn tiny_form_needs_an_explicit_lowercase_request() {
        let mut explicit = Vec::new();
        append_record(&mut explicit, b't', &[b"abc"]);
        assert_eq!(explicit, [b'3', b'a', b'b', b'c']);

        // Uppercase callers get the short form even for small bodies.
        let mut default = Vec::new();
        append_record(&mut default, b'T', &[b"abc"]);
        assert_eq!(default, [b't', 3, b'a', b'b', b'c']);

        // Tiny decodes with the synthetic '0' literal.
        let (lit, body, _) = take_any(&explicit).unwrap();
        assert_eq!(lit, b'0');
        assert_eq!(body, b"abc");
    }

    #[test]
    fn multipart_bodies_concatenate() {
        let rec = record(b'T', &[b"te", b"st"]);
        let (body, _) = take(b'T', &rec).unwrap();
        assert_eq!(body, b"test");
    }

    #[test]
    fn probe_is_prefix_closed() {
        // Every strict prefix of a valid encoding probes as incomplete or
        // as the record's own header; never as malformed.
        let mut stream = Vec::new();
        append_record(&mut stream, b'A', &[b"x"]);
        append_record(&mut stream, b'Z', &[&vec![0u8; 300]]);
        for k in 0..stream.len() {
            match probe(&stream[..k]) {
                Probe::Malformed => panic!("prefix of length {k} probed malformed"),
                Probe::Incomplete | Probe::Header { .. } => {}
            }
        }
    }

    #[test]
    fn lone_lead_bytes_are_incomplete_not_malformed() {
        assert_eq!(probe(b"A"), Probe::Incomplete);
        assert_eq!(probe(b"A\x01\x00"), Probe::Incomplete);
        assert_eq!(probe(b"a"), Probe::Incomplete);
        assert!(matches!(take_any(b"a"), Err(TlvError::Incomplete)));
    }

    #[test]
    fn bad_leads_and_oversize_lengths_are_malformed() {
        assert_eq!(probe(&[0x00]), Probe::Malformed);
        assert_eq!(probe(&[0x7F]), Probe::Malformed);
        // Long length with the top bit set.
        assert_eq!(probe(&[b'A', 0x00, 0x00, 0x00, 0x80]), Probe::Malformed);
        // The same field one below the limit is merely incomplete.
        assert_eq!(
            probe(&[b'A', 0xFF, 0xFF, 0xFF, 0x7F]),
            Probe::Header {
                lit: b'A',
                hdr_len: 5,
                body_len: MAX_BODY_LEN
            }
        );
    }

    #[test]
    fn literal_mismatch_is_malformed() {
        let rec = record(b'A', &[b"x"]);
        assert!(matches!(take(b'B', &rec), Err(TlvError::Malformed)));
        // The wildcard literal matches anything.
        let (body, _) = take(b'0', &rec).unwrap();
        assert_eq!(body, b"x");
    }

    #[test]
    fn trusting_take_collapses_failures() {
        let rec = record(b'A', &[b"x"]);
        let (body, rest) = take_trusting(b'B', &rec);
        assert!(body.is_empty());
        assert_eq!(rest, &rec[..]);

        let (lit, body, rest) = take_any_trusting(&[0x00, 0x01]);
        assert_eq!(lit, 0);
        assert!(body.is_empty());
        assert_eq!(rest, &[0x00, 0x01]);
    }

    #[test]
    fn split_peels_whole_records() {
        let mut stream = Vec::new();
        append_record(&mut stream, b'A', &[b"one"]);
        append_record(&mut stream, b'B', &[b"two"]);
        stream.push(b'c'); // incomplete short header

        let (records, rest, err) = split(&stream);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], &record(b'A', &[b"one"])[..]);
        assert_eq!(records[1], &record(b'B', &[b"two"])[..]);
        assert_eq!(rest, b"c");
        assert!(err.is_none());
    }

    #[test]
    fn split_reports_malformed_after_peeling() {
        let mut stream = Vec::new();
        append_record(&mut stream, b'A', &[b"ok"]);
        stream.push(0x00); // preallocation tail, not a record

        let (records, rest, err) = split(&stream);
        assert_eq!(records.len(), 1);
        assert_eq!(rest, &[0x00]);
        assert!(matches!(err, Some(TlvError::Malformed)));
    }

    #[test]
    fn open_close_header_round_trips() {
        let mut buf = Vec::new();
        let mark = open_header(&mut buf, b'A');
        buf.extend_from_slice(b"some text");
        close_header(&mut buf, mark);

        let (body, rest) = take(b'A', &buf).unwrap();
        assert_eq!(body, b"some text");
        assert!(rest.is_empty());
    }

    #[test]
    fn needed_reports_the_shortfall() {
        let rec = record(b'A', &[&vec![1u8; 300]]);
        assert_eq!(needed(&rec[..5]), 305);
        assert_eq!(needed(&rec[..2]), 3); // header itself incomplete
        assert_eq!(needed(&[]), 1);
    }

    #[test]
    #[should_panic(expected = "record literals are letters")]
    fn non_letter_literal_panics() {
        let mut buf = Vec::new();
        append_header(&mut buf, b'5', 3);
    }

    #[test]
    #[should_panic(expected = "uppercase")]
    fn open_header_rejects_lowercase() {
        let mut buf = Vec::new();
        open_header(&mut buf, b'a');
    }

    #[test]
    #[should_panic(expected = "bookmark")]
    fn close_header_rejects_bad_bookmark() {
        let mut buf = vec![0u8; 3];
        close_header(&mut buf, 2);
    }
}
