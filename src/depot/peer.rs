//! One registered connection: its socket slot, outbound carryover, and
//! the reader / writer / supervisor tasks that serve it.

use std::io::{IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{self, Record, Records};
use crate::error::TlvError;
use crate::stream::advance_batch;

use super::jack::Endpoint;
use super::{DepotInner, PeerOptions};

/// Initial reader buffer, one default page.
const READ_BUF_INIT: usize = 4096;

/// Headroom the reader always keeps free.
const READ_HEADROOM: usize = 512;

/// Shortest pause between redial attempts.
pub(super) const MIN_RETRY_PERIOD: Duration = Duration::from_millis(500);

/// Longest pause between redial attempts.
pub(super) const MAX_RETRY_PERIOD: Duration = Duration::from_secs(60);

/// A connection that lived at least this long counts as healthy and does
/// not grow the bad-peer penalty.
const STEADY_TALK: Duration = Duration::from_secs(5 * 60);

/// How long teardown waits for pending outbound bytes, best effort.
pub(super) const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Most record slices offered to one vectored write (IOV_MAX headroom).
const MAX_IOV: usize = 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

/// Redial pacing for one peer.
///
/// Dial failures double `conn` and a successful dial resets it, so plain
/// network outages recover quickly. Connections that die young double
/// `talk`, which never resets: a peer we keep failing to talk to backs
/// off harder and stays backed off.
#[derive(Debug, Clone, Copy)]
pub(super) struct Backoff {
    conn: Duration,
    talk: Duration,
}

impl Backoff {
    pub(super) fn new() -> Self {
        Backoff {
            conn: MIN_RETRY_PERIOD,
            talk: MIN_RETRY_PERIOD,
        }
    }

    /// Account for a connection that just ended after `lived`.
    pub(super) fn note_session(&mut self, lived: Duration) {
        if lived < STEADY_TALK {
            self.talk = (self.talk * 2).min(MAX_RETRY_PERIOD);
        }
    }

    pub(super) fn note_dial_ok(&mut self) {
        self.conn = MIN_RETRY_PERIOD;
    }

    pub(super) fn note_dial_err(&mut self) {
        self.conn = (self.conn * 2).min(MAX_RETRY_PERIOD);
    }

    /// Pause to take before the next dial.
    pub(super) fn delay(&self) -> Duration {
        self.conn + self.talk
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer
// ─────────────────────────────────────────────────────────────────────────────

pub(super) struct Peer {
    pub(super) addr: String,
    pub(super) endpoint: Arc<dyn Endpoint>,
    reconnect: bool,
    keepalive: bool,
    state: Mutex<PeerState>,
    /// Tied to `state`: socket arrivals, outbound-buffer drain, shutdown.
    wake: Condvar,
    depot: Weak<DepotInner>,
}

struct PeerState {
    sock: Option<TcpStream>,
    /// Bumped on every `install_socket` so a stale writer cannot kill a
    /// fresh connection.
    epoch: u64,
    /// Bytes pulled from the endpoint but not yet written; drained ahead
    /// of fresh batches, surviving reconnects.
    out: Vec<u8>,
    shutdown: bool,
}

impl Peer {
    pub(super) fn new(
        addr: &str,
        endpoint: Arc<dyn Endpoint>,
        opts: PeerOptions,
        depot: Weak<DepotInner>,
    ) -> Arc<Self> {
        Arc::new(Peer {
            addr: addr.to_string(),
            endpoint,
            reconnect: opts.reconnect,
            keepalive: opts.keepalive,
            state: Mutex::new(PeerState {
                sock: None,
                epoch: 0,
                out: Vec::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            depot,
        })
    }

    /// Apply per-peer socket options to a freshly acquired connection.
    pub(super) fn configure(&self, sock: &TcpStream) {
        if !self.keepalive {
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let on: libc::c_int = 1;
            // SAFETY: the descriptor is a live socket owned by `sock` for
            // the duration of the call; SO_KEEPALIVE takes an int flag.
            let rc = unsafe {
                libc::setsockopt(
                    sock.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_KEEPALIVE,
                    &on as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                log::warn!(
                    "{}: enabling keepalive failed: {}",
                    self.addr,
                    std::io::Error::last_os_error()
                );
            }
        }
        #[cfg(not(unix))]
        log::warn!("{}: keepalive not supported on this platform", self.addr);
    }

    pub(super) fn install_socket(&self, sock: TcpStream) {
        {
            let mut st = self.state.lock().unwrap();
            st.sock = Some(sock);
            st.epoch += 1;
        }
        self.wake.notify_all();
    }

    /// Drop the current socket after its reader returned.
    fn clear_socket(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some(s) = st.sock.take() {
            let _ = s.shutdown(Shutdown::Both);
        }
    }

    pub(super) fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    /// Terminal teardown: refuse further traffic, cut the socket, wake
    /// every sleeper. Idempotent; the endpoint is closed exactly once.
    pub(super) fn shut_down(&self) {
        let first = {
            let mut st = self.state.lock().unwrap();
            let first = !st.shutdown;
            st.shutdown = true;
            if let Some(s) = st.sock.take() {
                let _ = s.shutdown(Shutdown::Both);
            }
            first
        };
        self.wake.notify_all();
        if first {
            self.endpoint.close();
        }
    }

    /// Teardown plus registry removal; the tail of every peer task.
    pub(super) fn finish(&self) {
        self.shut_down();
        if let Some(inner) = self.depot.upgrade() {
            inner.remove_peer(&self.addr, self);
        }
    }

    /// Wait up to `grace` for the outbound carryover to drain.
    pub(super) fn drain_grace(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut st = self.state.lock().unwrap();
        while !st.out.is_empty() && !st.shutdown {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, timeout) = self.wake.wait_timeout(st, deadline - now).unwrap();
            st = guard;
            if timeout.timed_out() {
                break;
            }
        }
    }

    /// Block until a socket is available; `None` once the peer is shut
    /// down. Returns a cloned handle and the socket's epoch.
    fn wait_socket(&self) -> Option<(TcpStream, u64)> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.shutdown {
                return None;
            }
            if let Some(s) = &st.sock {
                match s.try_clone() {
                    Ok(clone) => return Some((clone, st.epoch)),
                    Err(_) => {
                        // A handle we cannot clone is as good as dead.
                        st.sock = None;
                    }
                }
            }
            st = self.wake.wait(st).unwrap();
        }
    }

    /// Cut a socket that failed mid-write, unless a newer one has already
    /// taken its place.
    fn socket_died(&self, epoch: u64) {
        let mut st = self.state.lock().unwrap();
        if st.epoch == epoch {
            if let Some(s) = st.sock.take() {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }

    /// Write the outbound carryover, if any. Only the writer task touches
    /// `out`, so taking it out of the lock during the write is safe.
    fn flush_carry(&self, mut sock: &TcpStream) -> Result<(), TlvError> {
        let pending = {
            let mut st = self.state.lock().unwrap();
            if st.out.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut st.out)
        };
        let mut off = 0;
        while off < pending.len() {
            match sock.write(&pending[off..]) {
                Ok(0) => {
                    self.stash_bytes(&pending[off..]);
                    return Err(TlvError::Io(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => off += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stash_bytes(&pending[off..]);
                    return Err(TlvError::Io(e));
                }
            }
        }
        self.wake.notify_all(); // drain_grace watchers
        Ok(())
    }

    fn stash_bytes(&self, bytes: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.out.extend_from_slice(bytes);
    }

    fn stash_batch(&self, records: &[Record], idx: usize, off: usize) {
        let mut st = self.state.lock().unwrap();
        if idx < records.len() {
            st.out.extend_from_slice(&records[idx][off..]);
            for rec in &records[idx + 1..] {
                st.out.extend_from_slice(rec);
            }
        }
    }

    /// Scatter-write one batch, looping over short writes. Whatever the
    /// socket refused is parked in the carryover for the next socket.
    fn write_batch(&self, mut sock: &TcpStream, records: &Records) -> Result<(), TlvError> {
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
            match sock.write_vectored(&iov) {
                Ok(0) => {
                    self.stash_batch(records, idx, off);
                    return Err(TlvError::Io(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => advance_batch(records, &mut idx, &mut off, n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stash_batch(records, idx, off);
                    return Err(TlvError::Io(e));
                }
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

/// The writer task: one per peer, alive across reconnects.
///
/// Exits when the peer shuts down or the application closes its endpoint;
/// a dead socket merely parks it until the supervisor installs a new one.
pub(super) fn writer_loop(peer: &Peer) {
    loop {
        let Some((sock, epoch)) = peer.wait_socket() else {
            break;
        };
        if let Err(e) = peer.flush_carry(&sock) {
            log::debug!("{}: write failed, parking outbound bytes: {e}", peer.addr);
            peer.socket_died(epoch);
            continue;
        }
        let batch = match peer.endpoint.feed() {
            Ok(b) => b,
            // The application hung up its side; nothing left to transmit.
            Err(_) => break,
        };
        if batch.is_empty() {
            continue;
        }
        if let Err(e) = peer.write_batch(&sock, &batch) {
            log::debug!("{}: write failed, parking outbound bytes: {e}", peer.addr);
            peer.socket_died(epoch);
        }
    }
}

/// The reader task body: frame bytes off the socket and hand batches to
/// the endpoint until the connection or the stream dies.
fn reader_loop(peer: &Peer, mut sock: &TcpStream) -> Result<(), TlvError> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_BUF_INIT);
    loop {
        if peer.is_shutdown() {
            return Ok(());
        }
        // Double once occupancy passes half the buffer, and always keep
        // room for a real read.
        if buf.capacity() - buf.len() < READ_HEADROOM {
            let doubled = if buf.len() > READ_BUF_INIT / 2 {
                buf.len() * 2
            } else {
                READ_BUF_INIT
            };
            let mut grown = Vec::with_capacity(doubled.max(buf.len() + READ_HEADROOM));
            grown.extend_from_slice(&buf);
            buf = grown;
        }
        let len = buf.len();
        let cap = buf.capacity();
        buf.resize(cap, 0);
        match sock.read(&mut buf[len..cap]) {
            Ok(0) => {
                buf.truncate(len);
                return Err(TlvError::EndOfStream);
            }
            Ok(n) => buf.truncate(len + n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                buf.truncate(len);
                continue;
            }
            Err(e) => {
                buf.truncate(len);
                return Err(e.into());
            }
        }

        let (batch, consumed, err) = {
            let (records, rest, err) = codec::split(&buf);
            let batch: Records = records.iter().map(|r| r.to_vec()).collect();
            (batch, buf.len() - rest.len(), err)
        };
        if !batch.is_empty() {
            peer.endpoint.drain(batch)?;
            buf.drain(..consumed);
        }
        if let Some(e) = err {
            return Err(e);
        }
    }
}

/// Reader wrapper for accepted (inbound) peers: no reconnect, the peer
/// dies with its socket.
pub(super) fn inbound_loop(peer: Arc<Peer>, sock: TcpStream) {
    match reader_loop(&peer, &sock) {
        Ok(()) | Err(TlvError::EndOfStream) => {
            log::info!("{}: connection closed", peer.addr);
        }
        Err(e) => log::warn!("{}: connection failed: {e}", peer.addr),
    }
    peer.finish();
}

/// Supervisor for outbound peers: run the reader, and when it returns,
/// redial under backoff until shutdown (or immediately stop if the peer
/// was created without the reconnect flag).
pub(super) fn supervisor_loop(peer: Arc<Peer>, first: TcpStream) {
    let mut sock = first;
    let mut backoff = Backoff::new();
    'sessions: loop {
        let started = Instant::now();
        let ended = reader_loop(&peer, &sock);
        match &ended {
            Ok(()) | Err(TlvError::EndOfStream) => {
                log::info!("{}: connection closed", peer.addr);
            }
            Err(e) => log::warn!("{}: connection failed: {e}", peer.addr),
        }
        peer.clear_socket();
        // An endpoint refusing records means the application hung up;
        // redialing would reconnect to nobody.
        if peer.is_shutdown() || !peer.reconnect || matches!(ended, Err(TlvError::Closed)) {
            break;
        }
        backoff.note_session(started.elapsed());

        loop {
            thread::sleep(backoff.delay());
            if peer.is_shutdown() {
                break 'sessions;
            }
            match TcpStream::connect(&peer.addr) {
                Ok(fresh) => {
                    backoff.note_dial_ok();
                    peer.configure(&fresh);
                    match fresh.try_clone() {
                        Ok(clone) => {
                            peer.install_socket(fresh);
                            sock = clone;
                            log::info!("{}: reconnected", peer.addr);
                            continue 'sessions;
                        }
                        Err(e) => {
                            log::warn!("{}: reconnect failed: {e}", peer.addr);
                            backoff.note_dial_err();
                        }
                    }
                }
                Err(e) => {
                    log::debug!("{}: dial failed: {e}", peer.addr);
                    backoff.note_dial_err();
                }
            }
        }
    }
    peer.finish();
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_failures_double_and_success_resets() {
        let mut b = Backoff::new();
        assert_eq!(b.delay(), MIN_RETRY_PERIOD * 2);

        b.note_dial_err();
        b.note_dial_err();
        assert_eq!(b.delay(), MIN_RETRY_PERIOD * 4 + MIN_RETRY_PERIOD);

        b.note_dial_ok();
        assert_eq!(b.delay(), MIN_RETRY_PERIOD * 2);
    }

    #[test]
    fn dial_backoff_is_clamped() {
        let mut b = Backoff::new();
        for _ in 0..20 {
            b.note_dial_err();
        }
        assert_eq!(b.delay(), MAX_RETRY_PERIOD + MIN_RETRY_PERIOD);
    }

    #[test]
    fn short_lived_sessions_grow_the_penalty_for_good() {
        let mut b = Backoff::new();
        b.note_session(Duration::from_secs(1));
        b.note_session(Duration::from_secs(1));
        let penalized = b.delay();
        assert_eq!(penalized, MIN_RETRY_PERIOD + MIN_RETRY_PERIOD * 4);

        // A healthy session neither grows nor resets the penalty.
        b.note_session(STEADY_TALK + Duration::from_secs(1));
        assert_eq!(b.delay(), penalized);

        // Nor does a successful dial.
        b.note_dial_ok();
        assert_eq!(b.delay(), penalized);
    }

    #[test]
    fn talk_backoff_is_clamped() {
        let mut b = Backoff::new();
        for _ in 0..20 {
            b.note_session(Duration::ZERO);
        }
        assert_eq!(b.delay(), MIN_RETRY_PERIOD + MAX_RETRY_PERIOD);
    }
}
