// tlvio: buffered TLV record framing over files and sockets

pub mod codec;
pub mod depot;
pub mod error;
#[cfg(unix)]
pub mod file;
pub mod stream;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level convenience re-exports for the most common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// The crate-wide error type.
pub use error::TlvError;

/// One whole framed record and a batch of them.
pub use codec::{Record, Records};

/// Header classification without consuming input.
pub use codec::{probe, Probe};

/// Pull one record off a buffer, wary and trusting forms.
pub use codec::{take, take_any, take_any_trusting, take_trusting};

/// Peel every whole record off the front of a buffer.
pub use codec::split;

/// Frame records into a buffer.
pub use codec::{append_header, append_record, record};

/// Streamed records with a patched-in-place length field.
pub use codec::{close_header, open_header};

/// Buffered record endpoints over any `Read` / `Write` transport.
pub use stream::{Drainer, Feeder, Whence};

/// Record files over positional I/O, with independent per-endpoint
/// cursors.
#[cfg(unix)]
pub use file::{FileDrainer, FileFeeder, TlvFile};

/// The TCP peer registry and its application-side plumbing.
pub use depot::{Depot, Endpoint, Jack, PeerOptions, QueueJack};
