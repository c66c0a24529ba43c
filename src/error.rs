//! Crate-wide error type shared by the codec, the buffered endpoints, the
//! file transport, and the TCP depot.

use std::fmt;
use std::io;

/// Everything that can go wrong while framing, feeding, or draining records.
///
/// Two variants are signals rather than failures: [`TlvError::Incomplete`]
/// means "read more bytes and retry", and [`TlvError::EndOfStream`] is the
/// orderly end of a source, reported only after every buffered complete
/// record has been delivered.
#[derive(Debug)]
pub enum TlvError {
    /// The buffer does not yet contain a full record.
    Incomplete,
    /// The bytes at the head of the stream cannot be a valid record: the
    /// lead byte is outside the three header ranges, a long length has its
    /// top bit set, or a literal did not match the expected one. Fatal to
    /// the stream; the codec does not resynchronize.
    Malformed,
    /// Operation attempted on a closed file, feeder, drainer, or endpoint.
    Closed,
    /// The source is exhausted.
    EndOfStream,
    /// A depot operation referenced an address with no registered peer.
    AddressUnknown(String),
    /// Transport error, propagated verbatim from the underlying source or
    /// sink.
    Io(io::Error),
}

impl TlvError {
    /// `true` for the two non-failure signals (`Incomplete`, `EndOfStream`).
    pub fn is_signal(&self) -> bool {
        matches!(self, TlvError::Incomplete | TlvError::EndOfStream)
    }
}

impl fmt::Display for TlvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlvError::Incomplete => f.write_str("incomplete record"),
            TlvError::Malformed => f.write_str("bad record format"),
            TlvError::Closed => f.write_str("already closed"),
            TlvError::EndOfStream => f.write_str("end of stream"),
            TlvError::AddressUnknown(addr) => write!(f, "address unknown: {addr}"),
            TlvError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for TlvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlvError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TlvError {
    fn from(e: io::Error) -> Self {
        // An EOF from the transport and an exhausted source are the same
        // condition at this layer.
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TlvError::EndOfStream
        } else {
            TlvError::Io(e)
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for TlvError {
    fn from(e: nix::errno::Errno) -> Self {
        TlvError::Io(io::Error::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_end_of_stream() {
        let e: TlvError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(e, TlvError::EndOfStream));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let e: TlvError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(e, TlvError::Io(_)));
    }

    #[test]
    fn signals_are_signals() {
        assert!(TlvError::Incomplete.is_signal());
        assert!(TlvError::EndOfStream.is_signal());
        assert!(!TlvError::Malformed.is_signal());
        assert!(!TlvError::Closed.is_signal());
    }
}
