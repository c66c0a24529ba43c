//! The jack: how a depot peer plugs into the application.
//!
//! A [`Jack`] is a factory the depot calls once per fresh connection; it
//! returns the [`Endpoint`] the peer's I/O tasks talk to. The depot pulls
//! outbound record batches from `feed` and pushes inbound batches into
//! `drain`; what sits behind those calls (channels, queues, a router)
//! is the application's business, as is any backpressure or drop policy.
//!
//! [`QueueJack`] is the stock implementation: a bounded per-peer outbound
//! queue plus a single inbound channel tagging every batch with the peer
//! address it arrived from.

use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::codec::{self, Probe, Record, Records};
use crate::error::TlvError;

/// Paired feeder/drainer endpoint for one peer.
///
/// Implementations must be internally thread-safe for one producer per
/// direction; the depot guarantees a single reader task calls `drain` and
/// a single writer task calls `feed`.
pub trait Endpoint: Send + Sync {
    /// Block until outbound records are available, then hand them over in
    /// append order. [`TlvError::Closed`] once the endpoint is closed and
    /// empty.
    fn feed(&self) -> Result<Records, TlvError>;

    /// Deliver inbound records framed off the socket, in arrival order.
    fn drain(&self, records: Records) -> Result<(), TlvError>;

    /// Refuse further traffic and wake any blocked `feed`.
    fn close(&self);
}

/// Factory building one [`Endpoint`] per fresh connection.
pub trait Jack: Send + Sync {
    fn build(&self, peer_addr: &str, sock: &TcpStream) -> Result<Arc<dyn Endpoint>, TlvError>;
}

/// Soft cap on records queued outbound per peer, roughly 16 MB of record
/// pointers. Producers hitting it block until the writer catches up.
pub const OUTBOUND_SOFT_CAP: usize = 1 << 20;

// ─────────────────────────────────────────────────────────────────────────────
// QueueJack
// ─────────────────────────────────────────────────────────────────────────────

/// Stock jack: per-peer outbound queues and one merged inbound channel.
///
/// Clone the jack and keep a copy on the application side; the depot gets
/// the other. [`send`](QueueJack::send) routes records to a peer's queue
/// (blocking at [`OUTBOUND_SOFT_CAP`]), [`recv`](QueueJack::recv) yields
/// `(peer_addr, records)` batches as connections produce them.
#[derive(Clone)]
pub struct QueueJack {
    shared: Arc<JackShared>,
}

struct JackShared {
    inbound_tx: Sender<(String, Records)>,
    inbound_rx: Receiver<(String, Records)>,
    peers: Mutex<HashMap<String, Arc<OutQueue>>>,
}

struct OutQueue {
    state: Mutex<OutState>,
    ready: Condvar,
}

struct OutState {
    queue: VecDeque<Record>,
    closed: bool,
}

impl QueueJack {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        QueueJack {
            shared: Arc::new(JackShared {
                inbound_tx,
                inbound_rx,
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue framed records for the peer at `addr`.
    ///
    /// Blocks while the peer's queue is at the soft cap. Every element
    /// must be exactly one whole record; a half-frame would poison the
    /// remote stream, so it is rejected here rather than on the wire.
    pub fn send(&self, addr: &str, records: Records) -> Result<(), TlvError> {
        for rec in &records {
            match codec::probe(rec) {
                Probe::Header {
                    hdr_len, body_len, ..
                } if rec.len() == hdr_len + body_len => {}
                _ => return Err(TlvError::Malformed),
            }
        }
        let out = {
            let peers = self.shared.peers.lock().unwrap();
            peers
                .get(addr)
                .cloned()
                .ok_or_else(|| TlvError::AddressUnknown(addr.to_string()))?
        };
        let mut st = out.state.lock().unwrap();
        for rec in records {
            while st.queue.len() >= OUTBOUND_SOFT_CAP && !st.closed {
                st = out.ready.wait(st).unwrap();
            }
            if st.closed {
                return Err(TlvError::Closed);
            }
            st.queue.push_back(rec);
        }
        drop(st);
        out.ready.notify_all();
        Ok(())
    }

    /// Frame one record and queue it for `addr`.
    pub fn send_record(&self, addr: &str, lit: u8, body: &[u8]) -> Result<(), TlvError> {
        self.send(addr, vec![codec::record(lit, &[body])])
    }

    /// Next inbound batch, blocking. Fails only when every endpoint and
    /// jack clone is gone.
    pub fn recv(&self) -> Result<(String, Records), TlvError> {
        self.shared.inbound_rx.recv().map_err(|_| TlvError::Closed)
    }

    /// Next inbound batch, waiting at most `timeout`. `Ok(None)` on
    /// timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(String, Records)>, TlvError> {
        match self.shared.inbound_rx.recv_timeout(timeout) {
            Ok(x) => Ok(Some(x)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TlvError::Closed),
        }
    }

    /// Non-blocking [`recv`](QueueJack::recv).
    pub fn try_recv(&self) -> Result<Option<(String, Records)>, TlvError> {
        match self.shared.inbound_rx.try_recv() {
            Ok(x) => Ok(Some(x)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TlvError::Closed),
        }
    }
}

impl Default for QueueJack {
    fn default() -> Self {
        Self::new()
    }
}

impl Jack for QueueJack {
    fn build(&self, peer_addr: &str, _sock: &TcpStream) -> Result<Arc<dyn Endpoint>, TlvError> {
        let out = Arc::new(OutQueue {
            state: Mutex::new(OutState {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        });
        self.shared
            .peers
            .lock()
            .unwrap()
            .insert(peer_addr.to_string(), out.clone());
        Ok(Arc::new(QueueEndpoint {
            addr: peer_addr.to_string(),
            out,
            inbound: self.shared.inbound_tx.clone(),
            jack: Arc::downgrade(&self.shared),
        }))
    }
}

struct QueueEndpoint {
    addr: String,
    out: Arc<OutQueue>,
    inbound: Sender<(String, Records)>,
    jack: Weak<JackShared>,
}

impl Endpoint for QueueEndpoint {
    fn feed(&self) -> Result<Records, TlvError> {
        let mut st = self.out.state.lock().unwrap();
        loop {
            if !st.queue.is_empty() {
                let batch: Records = st.queue.drain(..).collect();
                // Producers may be parked on the soft cap.
                self.out.ready.notify_all();
                return Ok(batch);
            }
            if st.closed {
                return Err(TlvError::Closed);
            }
            st = self.out.ready.wait(st).unwrap();
        }
    }

    fn drain(&self, records: Records) -> Result<(), TlvError> {
        self.inbound
            .send((self.addr.clone(), records))
            .map_err(|_| TlvError::Closed)
    }

    fn close(&self) {
        {
            let mut st = self.out.state.lock().unwrap();
            st.closed = true;
        }
        self.out.ready.notify_all();
        // Unregister the queue unless a newer connection already replaced
        // it under the same address.
        if let Some(shared) = self.jack.upgrade() {
            let mut peers = shared.peers.lock().unwrap();
            if let Some(q) = peers.get(&self.addr) {
                if Arc::ptr_eq(q, &self.out) {
                    peers.remove(&self.addr);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::record;
    use std::net::{TcpListener, TcpStream};

    /// A connected stream for `build`; the queue jack never touches it.
    fn loopback() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _server = listener.accept().unwrap();
        client
    }

    #[test]
    fn send_reaches_feed_in_order() {
        let jack = QueueJack::new();
        let sock = loopback();
        let ep = jack.build("10.0.0.1:7", &sock).unwrap();

        jack.send(
            "10.0.0.1:7",
            vec![record(b'A', &[b"1"]), record(b'A', &[b"2"])],
        )
        .unwrap();
        jack.send_record("10.0.0.1:7", b'A', b"3").unwrap();

        let mut got = ep.feed().unwrap();
        while got.len() < 3 {
            got.extend(ep.feed().unwrap());
        }
        assert_eq!(got[0], record(b'A', &[b"1"]));
        assert_eq!(got[2], record(b'A', &[b"3"]));
    }

    #[test]
    fn unknown_addresses_are_rejected() {
        let jack = QueueJack::new();
        assert!(matches!(
            jack.send_record("nowhere:0", b'A', b"x"),
            Err(TlvError::AddressUnknown(_))
        ));
    }

    #[test]
    fn half_frames_are_rejected() {
        let jack = QueueJack::new();
        let sock = loopback();
        let _ep = jack.build("10.0.0.1:7", &sock).unwrap();
        let rec = record(b'A', &[b"whole"]);
        assert!(matches!(
            jack.send("10.0.0.1:7", vec![rec[..3].to_vec()]),
            Err(TlvError::Malformed)
        ));
    }

    #[test]
    fn close_wakes_feed_and_unregisters() {
        let jack = QueueJack::new();
        let sock = loopback();
        let ep = jack.build("10.0.0.1:7", &sock).unwrap();

        let waiter = {
            let ep = ep.clone();
            std::thread::spawn(move || ep.feed())
        };
        std::thread::sleep(Duration::from_millis(50));
        ep.close();
        assert!(matches!(waiter.join().unwrap(), Err(TlvError::Closed)));
        assert!(matches!(
            jack.send_record("10.0.0.1:7", b'A', b"x"),
            Err(TlvError::AddressUnknown(_))
        ));
    }

    #[test]
    fn inbound_batches_carry_the_peer_address() {
        let jack = QueueJack::new();
        let sock = loopback();
        let ep = jack.build("10.0.0.9:42", &sock).unwrap();

        ep.drain(vec![record(b'M', &[b"hi"])]).unwrap();
        let (addr, batch) = jack.recv().unwrap();
        assert_eq!(addr, "10.0.0.9:42");
        assert_eq!(batch, vec![record(b'M', &[b"hi"])]);
    }
}
