//! An in-memory `Transport` pair for end-to-end dialog tests: what each side
//! sends lands directly in the other side's inbound queue, no socket or
//! serialization involved. Grounded on the teacher's in-process transaction
//! manager test harnesses, which wire two ends together the same way rather
//! than spinning up real UDP sockets for a unit test.

use std::net::SocketAddr;

use async_trait::async_trait;
use rsip::SipMessage;
use sip_dialog_core::{Destination, Transport, TransportError};
use tokio::sync::{mpsc, Mutex};

pub struct LoopbackTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<(Destination, SipMessage)>,
    inbound: Mutex<mpsc::UnboundedReceiver<(Destination, SipMessage)>>,
}

/// Builds two ends of a loopback pair, `a` at `a_addr` and `b` at `b_addr`.
/// Whatever `a` sends, `b.recv()` yields tagged with `a_addr` as the source,
/// and vice versa.
pub fn pair(a_addr: SocketAddr, b_addr: SocketAddr) -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a = LoopbackTransport { local_addr: a_addr, peer_addr: b_addr, outbound: a_tx, inbound: Mutex::new(a_rx) };
    let b = LoopbackTransport { local_addr: b_addr, peer_addr: a_addr, outbound: b_tx, inbound: Mutex::new(b_rx) };
    (a, b)
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, _destination: Destination, message: SipMessage) -> Result<(), TransportError> {
        self.outbound.send((self.local_addr, message)).map_err(|_| TransportError::Unreachable("peer dropped".to_string()))
    }

    async fn recv(&self) -> Option<(Destination, SipMessage)> {
        self.inbound.lock().await.recv().await
    }

    fn is_reliable(&self, _destination: Destination) -> bool {
        false
    }
}

impl LoopbackTransport {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}
