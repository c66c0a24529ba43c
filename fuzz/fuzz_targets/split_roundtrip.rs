#![no_main]
use libfuzzer_sys::fuzz_target;

use tlvio::{append_record, split};

fuzz_target!(|data: &[u8]| {
    // Carve the input into records: one literal byte plus a length hint
    // per record, bodies drawn from the remaining input.
    let mut input = data;
    let mut stream = Vec::new();
    let mut expect = 0usize;
    while input.len() >= 2 {
        let lit = b'A' + (input[0] % 26);
        let body_len = (input[1] as usize * 7) % 600;
        input = &input[2..];
        let take_n = body_len.min(input.len());
        let mut body = input[..take_n].to_vec();
        body.resize(body_len, 0x2E);
        input = &input[take_n..];

        append_record(&mut stream, lit, &[&body]);
        expect += 1;
    }

    // Self-produced streams split back losslessly.
    let (records, rest, err) = split(&stream);
    assert!(err.is_none(), "self-produced stream flagged malformed");
    assert!(rest.is_empty(), "self-produced stream left a remainder");
    assert_eq!(records.len(), expect);
});
