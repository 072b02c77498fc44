//! A `Transport` that accepts every outbound send and never produces an
//! inbound message — for exercising timer-driven paths (INVITE timeout)
//! without a peer to answer.

use async_trait::async_trait;
use rsip::SipMessage;
use sip_dialog_core::{Destination, Transport, TransportError};
use tokio::sync::Mutex;

pub struct VoidTransport {
    never: Mutex<tokio::sync::mpsc::UnboundedReceiver<(Destination, SipMessage)>>,
}

impl VoidTransport {
    pub fn new() -> Self {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self { never: Mutex::new(rx) }
    }
}

impl Default for VoidTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for VoidTransport {
    async fn send(&self, _destination: Destination, _message: SipMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&self) -> Option<(Destination, SipMessage)> {
        self.never.lock().await.recv().await
    }

    fn is_reliable(&self, _destination: Destination) -> bool {
        false
    }
}
