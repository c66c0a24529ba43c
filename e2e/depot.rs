//! E2E Test Suite 04: TCP depot
//!
//! Live loopback exchanges: the request/response echo, peer teardown,
//! listener lifecycle, and reconnect after the remote goes away.

use std::time::{Duration, Instant};

use anyhow::Result;
use tlvio::{record, take, Depot, PeerOptions, QueueJack, TlvError};

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Receive the next inbound batch within the deadline.
fn next_batch(jack: &QueueJack) -> Result<(String, Vec<Vec<u8>>)> {
    jack.recv_timeout(WAIT)?
        .ok_or_else(|| anyhow::anyhow!("no batch within {WAIT:?}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: Listen, connect, send, respond
// ─────────────────────────────────────────────────────────────────────────────

/// A record sent to the listener arrives tagged with the accepted peer's
/// address, and a response sent to that address reaches the original
/// sender.
#[test]
fn echo_round_trip() -> Result<()> {
    init_logging();
    let jack = QueueJack::new();
    let depot = Depot::open(jack.clone());

    let addr = depot.listen("127.0.0.1:0")?;
    depot.connect(&addr)?;

    jack.send_record(&addr, b'M', b"Hi there")?;
    let (from, batch) = next_batch(&jack)?;
    assert_eq!(batch.len(), 1);
    let (body, _) = take(b'M', &batch[0]).expect("inbound record decodes");
    assert_eq!(body, b"Hi there");
    // The batch is keyed by the accepted peer, not the listener.
    assert_ne!(from, addr);

    jack.send_record(&from, b'M', b"Re: Hi there")?;
    let (_, batch) = next_batch(&jack)?;
    let (body, _) = take(b'M', &batch[0]).expect("response decodes");
    assert_eq!(body, b"Re: Hi there");

    depot.close();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: Batches keep their order and their framing
// ─────────────────────────────────────────────────────────────────────────────

/// A burst of mixed-size records, including some that take the long
/// form, arrives complete and in append order.
#[test]
fn ordered_mixed_burst() -> Result<()> {
    init_logging();
    let jack = QueueJack::new();
    let depot = Depot::open(jack.clone());

    let addr = depot.listen("127.0.0.1:0")?;
    depot.connect(&addr)?;

    let mut sent = Vec::new();
    for i in 0u8..50 {
        let body = vec![i; 1 + (i as usize * 37) % 700];
        sent.push(record(b'D', &[&body]));
    }
    jack.send(&addr, sent.clone())?;

    let mut got = Vec::new();
    while got.len() < sent.len() {
        let (_, batch) = next_batch(&jack)?;
        got.extend(batch);
    }
    assert_eq!(got, sent);

    depot.close();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: Disconnect removes the peer
// ─────────────────────────────────────────────────────────────────────────────

/// After disconnect the address is unknown to the jack's routing and to
/// the depot.
#[test]
fn disconnect_forgets_the_address() -> Result<()> {
    init_logging();
    let jack = QueueJack::new();
    let depot = Depot::open(jack.clone());

    let addr = depot.listen("127.0.0.1:0")?;
    depot.connect_with(
        &addr,
        PeerOptions {
            reconnect: false,
            keepalive: true,
        },
    )?;
    jack.send_record(&addr, b'M', b"ping")?;
    let _ = next_batch(&jack)?;

    depot.disconnect(&addr)?;
    assert!(matches!(
        depot.disconnect(&addr),
        Err(TlvError::AddressUnknown(_))
    ));
    // The endpoint is gone too; sends no longer route.
    let deadline = Instant::now() + WAIT;
    loop {
        match jack.send_record(&addr, b'M', b"after") {
            Err(TlvError::AddressUnknown(_)) | Err(TlvError::Closed) => break,
            Ok(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            other => panic!("send after disconnect: {other:?}"),
        }
    }

    depot.close();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: Stopping a listener strands no accepted peers
// ─────────────────────────────────────────────────────────────────────────────

/// stop_listening refuses new connections but traffic on the accepted
/// peer keeps flowing.
#[test]
fn stop_listening_keeps_accepted_peers() -> Result<()> {
    init_logging();
    let jack = QueueJack::new();
    let depot = Depot::open(jack.clone());

    let addr = depot.listen("127.0.0.1:0")?;
    depot.connect(&addr)?;
    jack.send_record(&addr, b'M', b"before")?;
    let (from, _) = next_batch(&jack)?;

    depot.stop_listening(&addr)?;
    assert!(matches!(
        depot.stop_listening(&addr),
        Err(TlvError::AddressUnknown(_))
    ));

    // The accepted side still answers.
    jack.send_record(&from, b'M', b"still here")?;
    let (_, batch) = next_batch(&jack)?;
    let (body, _) = take(b'M', &batch[0]).expect("record decodes");
    assert_eq!(body, b"still here");

    depot.close();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: Outbound peers reconnect under backoff
// ─────────────────────────────────────────────────────────────────────────────

/// Killing the accepted peer tears down the client's connection; the
/// client's supervisor redials and traffic resumes on the same address.
#[test]
fn outbound_peer_reconnects() -> Result<()> {
    init_logging();
    let server_jack = QueueJack::new();
    let server = Depot::open(server_jack.clone());
    let client_jack = QueueJack::new();
    let client = Depot::open(client_jack.clone());

    let addr = server.listen("127.0.0.1:0")?;
    client.connect(&addr)?;

    client_jack.send_record(&addr, b'M', b"first")?;
    let (accepted, _) = next_batch(&server_jack)?;

    // Kill the server side of the connection; the client should redial.
    server.disconnect(&accepted)?;

    // Keep offering a record until a fresh connection carries one over.
    let deadline = Instant::now() + WAIT;
    let second = loop {
        let _ = client_jack.send_record(&addr, b'M', b"second");
        match server_jack.recv_timeout(Duration::from_millis(500))? {
            Some((from, batch)) => {
                assert_ne!(from, accepted, "expected a fresh accepted peer");
                break batch;
            }
            None if Instant::now() < deadline => {}
            None => anyhow::bail!("no reconnect within {WAIT:?}"),
        }
    };
    let (body, _) = take(b'M', &second[0]).expect("record decodes");
    assert_eq!(body, b"second");

    client.close();
    server.close();
    Ok(())
}
