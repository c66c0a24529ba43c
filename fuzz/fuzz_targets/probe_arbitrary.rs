#![no_main]
use libfuzzer_sys::fuzz_target;

use tlvio::{probe, split, take_any, Probe, TlvError};

fuzz_target!(|data: &[u8]| {
    // Probe is total: any input classifies without panicking, and the
    // wary take agrees with the classification.
    match probe(data) {
        Probe::Incomplete => {
            assert!(matches!(take_any(data), Err(TlvError::Incomplete)));
        }
        Probe::Malformed => {
            assert!(matches!(take_any(data), Err(TlvError::Malformed)));
        }
        Probe::Header {
            lit,
            hdr_len,
            body_len,
        } => {
            assert!(lit == b'0' || lit.is_ascii_uppercase());
            if data.len() >= hdr_len + body_len {
                let (got, body, _) = take_any(data).expect("probe promised a record");
                assert_eq!(got, lit);
                assert_eq!(body.len(), body_len);
            } else {
                assert!(matches!(take_any(data), Err(TlvError::Incomplete)));
            }
        }
    }

    // Split never loses bytes: records + rest re-concatenate to the input.
    let (records, rest, _err) = split(data);
    let total: usize = records.iter().map(|r| r.len()).sum();
    assert_eq!(total + rest.len(), data.len());
});
