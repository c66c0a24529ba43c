//! The TCP depot: a process-wide registry of named peer connections and
//! listeners.
//!
//! Peers are keyed by remote address string. An outbound peer (made by
//! [`Depot::connect`]) gets a supervisor that redials under backoff when
//! its connection fails; an accepted peer lives only as long as its
//! socket. Every peer runs one reader task and one writer task; the
//! record traffic on both sides flows through the endpoint built by the
//! depot's [`Jack`].
//!
//! The registry mutex guards only the two maps and is never held across
//! I/O.

mod jack;
mod peer;

pub use jack::{Endpoint, Jack, QueueJack, OUTBOUND_SOFT_CAP};

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crate::error::TlvError;

use peer::{inbound_loop, supervisor_loop, writer_loop, Peer, DRAIN_GRACE};

/// Flags for a peer created by [`Depot::connect_with`].
#[derive(Debug, Clone, Copy)]
pub struct PeerOptions {
    /// Redial under backoff when the connection fails. Off, the peer is
    /// removed on its first failure.
    pub reconnect: bool,
    /// Enable TCP keepalive on every socket the peer acquires.
    pub keepalive: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        PeerOptions {
            reconnect: true,
            keepalive: false,
        }
    }
}

/// The registry handle. Clones share one registry; [`Depot::close`] is
/// the terminator for all of them.
#[derive(Clone)]
pub struct Depot {
    inner: Arc<DepotInner>,
}

pub(crate) struct DepotInner {
    jack: Box<dyn Jack>,
    reg: Mutex<Registry>,
}

struct Registry {
    peers: HashMap<String, Arc<Peer>>,
    listeners: HashMap<String, TcpListener>,
    closed: bool,
}

impl Depot {
    /// Open a depot around the jack that will terminate its connections.
    pub fn open(jack: impl Jack + 'static) -> Self {
        Depot {
            inner: Arc::new(DepotInner {
                jack: Box::new(jack),
                reg: Mutex::new(Registry {
                    peers: HashMap::new(),
                    listeners: HashMap::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Dial `addr` and register a reconnecting peer under that address.
    pub fn connect(&self, addr: &str) -> Result<(), TlvError> {
        self.connect_with(addr, PeerOptions::default())
    }

    /// Dial `addr` with explicit peer flags.
    pub fn connect_with(&self, addr: &str, opts: PeerOptions) -> Result<(), TlvError> {
        let sock = TcpStream::connect(addr)?;
        let endpoint = self.inner.jack.build(addr, &sock)?;
        let peer = Peer::new(addr, endpoint, opts, Arc::downgrade(&self.inner));
        peer.configure(&sock);
        let reader_sock = sock.try_clone()?;
        peer.install_socket(sock);

        {
            let mut reg = self.inner.reg.lock().unwrap();
            if reg.closed {
                drop(reg);
                peer.shut_down();
                return Err(TlvError::Closed);
            }
            if let Some(old) = reg.peers.insert(addr.to_string(), peer.clone()) {
                drop(reg);
                old.shut_down();
            }
        }

        let w = peer.clone();
        thread::Builder::new()
            .name(format!("tlvio-wr-{addr}"))
            .spawn(move || writer_loop(&w))?;
        thread::Builder::new()
            .name(format!("tlvio-sup-{addr}"))
            .spawn(move || supervisor_loop(peer, reader_sock))?;
        log::info!("{addr}: connected");
        Ok(())
    }

    /// Bind a listener and start accepting peers.
    ///
    /// Returns the resolved local address, which is also the listener's
    /// registry key, so binding port 0 yields a key with the real port. A
    /// prior listener at the same address is replaced and closed.
    pub fn listen(&self, bind: &str) -> Result<String, TlvError> {
        let listener = TcpListener::bind(bind)?;
        let local = listener.local_addr()?.to_string();
        let acceptor = listener.try_clone()?;

        {
            let mut reg = self.inner.reg.lock().unwrap();
            if reg.closed {
                return Err(TlvError::Closed);
            }
            if let Some(old) = reg.listeners.insert(local.clone(), listener) {
                shutdown_listener(&old);
            }
        }

        let inner = Arc::downgrade(&self.inner);
        let key = local.clone();
        thread::Builder::new()
            .name(format!("tlvio-acc-{local}"))
            .spawn(move || accept_loop(inner, key, acceptor))?;
        log::info!("{local}: listening");
        Ok(local)
    }

    /// Close a peer's socket, wake its writer, and drop it from the
    /// registry. Waits briefly for pending outbound bytes first.
    pub fn disconnect(&self, addr: &str) -> Result<(), TlvError> {
        let peer = {
            let mut reg = self.inner.reg.lock().unwrap();
            reg.peers
                .remove(addr)
                .ok_or_else(|| TlvError::AddressUnknown(addr.to_string()))?
        };
        peer.drain_grace(DRAIN_GRACE);
        peer.shut_down();
        log::info!("{addr}: disconnected");
        Ok(())
    }

    /// Remove and close a listener. Peers it accepted live on until they
    /// fail or are disconnected individually.
    pub fn stop_listening(&self, bind: &str) -> Result<(), TlvError> {
        let listener = {
            let mut reg = self.inner.reg.lock().unwrap();
            reg.listeners
                .remove(bind)
                .ok_or_else(|| TlvError::AddressUnknown(bind.to_string()))?
        };
        shutdown_listener(&listener);
        log::info!("{bind}: stopped listening");
        Ok(())
    }

    /// Shut down every listener, then every peer, then clear the maps.
    /// The depot accepts no further work afterwards.
    pub fn close(&self) {
        let (listeners, peers) = {
            let mut reg = self.inner.reg.lock().unwrap();
            reg.closed = true;
            (
                std::mem::take(&mut reg.listeners),
                std::mem::take(&mut reg.peers),
            )
        };
        for (_, listener) in &listeners {
            shutdown_listener(listener);
        }
        for (_, peer) in &peers {
            peer.drain_grace(DRAIN_GRACE);
            peer.shut_down();
        }
        log::info!("depot closed");
    }
}

impl DepotInner {
    /// Register an accepted socket as a non-reconnecting peer keyed by the
    /// remote's reported address.
    fn install_inbound(self: &Arc<Self>, addr: String, sock: TcpStream) -> Result<(), TlvError> {
        let endpoint = self.jack.build(&addr, &sock)?;
        let peer = Peer::new(
            &addr,
            endpoint,
            PeerOptions {
                reconnect: false,
                keepalive: false,
            },
            Arc::downgrade(self),
        );
        let reader_sock = sock.try_clone()?;
        peer.install_socket(sock);

        {
            let mut reg = self.reg.lock().unwrap();
            if reg.closed {
                drop(reg);
                peer.shut_down();
                return Err(TlvError::Closed);
            }
            if let Some(old) = reg.peers.insert(addr.clone(), peer.clone()) {
                drop(reg);
                old.shut_down();
            }
        }

        let w = peer.clone();
        thread::Builder::new()
            .name(format!("tlvio-wr-{addr}"))
            .spawn(move || writer_loop(&w))?;
        thread::Builder::new()
            .name(format!("tlvio-rd-{addr}"))
            .spawn(move || inbound_loop(peer, reader_sock))?;
        Ok(())
    }

    fn is_listening(&self, bind: &str) -> bool {
        self.reg.lock().unwrap().listeners.contains_key(bind)
    }

    /// Drop `peer`'s registry entry, unless a newer peer already owns the
    /// address.
    pub(crate) fn remove_peer(&self, addr: &str, peer: &Peer) {
        let mut reg = self.reg.lock().unwrap();
        if let Some(entry) = reg.peers.get(addr) {
            if Arc::as_ptr(entry) == peer as *const Peer {
                reg.peers.remove(addr);
            }
        }
    }
}

fn accept_loop(depot: Weak<DepotInner>, bind: String, listener: TcpListener) {
    loop {
        let (sock, remote) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!("{bind}: accept ended: {e}");
                break;
            }
        };
        let Some(inner) = depot.upgrade() else {
            break;
        };
        if !inner.is_listening(&bind) {
            break;
        }
        let addr = remote.to_string();
        log::info!("{addr}: accepted");
        if let Err(e) = inner.install_inbound(addr.clone(), sock) {
            log::warn!("{addr}: rejecting connection: {e}");
        }
    }
}

/// Unblock a listener's accept loop. Dropping the handle alone does not
/// wake a thread already parked in `accept(2)`.
fn shutdown_listener(listener: &TcpListener) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is a live listening socket owned by
        // `listener` for the duration of the call.
        unsafe {
            libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
    #[cfg(not(unix))]
    let _ = listener;
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_addresses_are_reported() {
        let depot = Depot::open(QueueJack::new());
        assert!(matches!(
            depot.disconnect("127.0.0.1:1"),
            Err(TlvError::AddressUnknown(_))
        ));
        assert!(matches!(
            depot.stop_listening("127.0.0.1:1"),
            Err(TlvError::AddressUnknown(_))
        ));
        depot.close();
    }

    #[test]
    fn dial_failure_propagates_as_io() {
        let depot = Depot::open(QueueJack::new());
        // A listener we immediately close leaves a port nobody answers.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        assert!(matches!(depot.connect(&dead), Err(TlvError::Io(_))));
        depot.close();
    }

    #[test]
    fn closed_depot_refuses_new_work() {
        let depot = Depot::open(QueueJack::new());
        depot.close();
        assert!(matches!(
            depot.listen("127.0.0.1:0"),
            Err(TlvError::Closed)
        ));
    }

    #[test]
    fn listen_reports_the_resolved_address() {
        let depot = Depot::open(QueueJack::new());
        let addr = depot.listen("127.0.0.1:0").unwrap();
        assert_ne!(addr, "127.0.0.1:0");
        depot.stop_listening(&addr).unwrap();
        depot.close();
    }
}
