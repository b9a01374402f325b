//! Duplex frame transport
//!
//! A [`Transport`] is a pair of byte channels carrying a length-prefixed
//! envelope stream. Concrete transports (the server's WebSocket adapter, a
//! future stdio pipe) pump their socket into these channels; the connection
//! core only ever sees the channel pair. Channel closure is the disconnect
//! signal on both sides.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Buffered frames per direction
const CHANNEL_CAPACITY: usize = 256;

/// A duplex, message-chunked byte pipe
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
}

impl Transport {
    /// Wrap an existing channel pair
    ///
    /// `outbound` carries bytes toward the remote end; `inbound` delivers
    /// bytes from it. Chunk boundaries are arbitrary; the connection core
    /// reassembles frames from the 4-byte length prefixes.
    pub fn new(outbound: mpsc::Sender<Bytes>, inbound: mpsc::Receiver<Bytes>) -> Self {
        Self { outbound, inbound }
    }

    /// A connected in-process transport pair
    ///
    /// Bytes written to one end arrive at the other. Used by tests and
    /// same-process peers.
    pub fn pipe() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Transport::new(a_tx, b_rx), Transport::new(b_tx, a_rx))
    }

    /// Split into the raw halves for the connection core
    pub(crate) fn split(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.outbound, self.inbound)
    }
}
