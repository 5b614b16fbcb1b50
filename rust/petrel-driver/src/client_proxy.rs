//! Conductor-to-clients event proxy.
//!
//! Wraps the to-clients broadcast transmitter. The Conductor is the single
//! producer; every client process mapping the CnC file may follow along.

use petrel_primitives::broadcast::BroadcastTransmitter;

use crate::protocol::{EVT_CLIENT_TIMEOUT, encode_client_id};

pub struct ClientProxy {
    transmitter: BroadcastTransmitter,
}

impl ClientProxy {
    pub fn new(transmitter: BroadcastTransmitter) -> Self {
        Self { transmitter }
    }

    /// Announce that a client was aged out for missing keepalives.
    pub fn on_client_timeout(&self, client_id: i64) {
        self.transmit(EVT_CLIENT_TIMEOUT, &encode_client_id(client_id));
    }

    /// Transmit a raw event. Oversized payloads are a programming error on
    /// the driver side; they are dropped rather than allowed to wedge the
    /// Conductor.
    pub fn transmit(&self, msg_type: i32, payload: &[u8]) {
        if let Err(e) = self.transmitter.transmit(msg_type, payload) {
            log_at!(warn, "dropped client event {msg_type}: {e}");
            let _ = e;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_client_id;
    use petrel_primitives::broadcast::{BroadcastReceiver, BroadcastTransmitter};
    use petrel_primitives::HeapRegion;

    #[test]
    fn client_timeout_event_reaches_receiver() {
        let backing =
            HeapRegion::new_zeroed(BroadcastTransmitter::required_region_length(4096));
        let tx = unsafe { BroadcastTransmitter::init(backing.region(), 0, 4096) };
        let mut rx = unsafe { BroadcastReceiver::attach(backing.region(), 0) }.unwrap();

        let proxy = ClientProxy::new(tx);
        proxy.on_client_timeout(77);

        let mut seen = None;
        assert!(rx.receive(|msg_type, payload| {
            seen = Some((msg_type, decode_client_id(payload)));
        }));
        assert_eq!(seen, Some((EVT_CLIENT_TIMEOUT, Some(77))));
    }
}
