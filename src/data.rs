//! The tagged data channel handed off after PIN succeeds.

use serde_json::{json, Value};
use tracing::debug;

use crate::codec::{decode_tagged_json, encode_data, for_each_single_key_item, require, top_level_family, TAG_DATA};
use crate::error::ShipError;
use crate::transport::{Frame, Transport};

const LAYER: &str = "data";

/// An open data channel: `protocol_id` is sent with every outgoing message
/// so the peer can route it, matching the reference's `SHIPDataConnection`.
pub struct DataChannel<'t> {
    transport: &'t mut dyn Transport,
    protocol_id: String,
    remote_ski: String,
}

impl<'t> DataChannel<'t> {
    pub fn new(transport: &'t mut dyn Transport, protocol_id: impl Into<String>, remote_ski: impl Into<String>) -> Self {
        Self { transport, protocol_id: protocol_id.into(), remote_ski: remote_ski.into() }
    }

    pub fn remote_ski(&self) -> &str {
        &self.remote_ski
    }

    /// Sends an application payload, wrapped in the data envelope's header
    /// and payload items.
    pub async fn send_data(&mut self, payload: Value) -> Result<(), ShipError> {
        let envelope = json!({
            "data": [
                {"header": [{"protocolId": self.protocol_id}]},
                {"payload": payload},
            ]
        });
        debug!(protocol_id = %self.protocol_id, "sending data message");
        self.transport.send(Frame::Binary(encode_data(&envelope))).await
    }

    /// Receives the next application payload, extracting it from the data
    /// envelope's list of single-key items.
    pub async fn recv_data(&mut self) -> Result<Value, ShipError> {
        let bytes = self.transport.recv().await?.into_bytes();
        let value = decode_tagged_json(&bytes, TAG_DATA, LAYER)?;
        let (family, items) = top_level_family(&value, LAYER)?;
        if family != "data" {
            return Err(ShipError::abort(LAYER, format!("unknown message family '{family}'")));
        }

        let mut payload = None;
        for_each_single_key_item(items, LAYER, |key, value| {
            if key == "payload" {
                payload = Some(value.clone());
            }
            Ok(())
        })?;

        require(payload, "payload", LAYER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paired_transport;

    #[tokio::test]
    async fn round_trips_a_payload() {
        let (mut a, mut b) = paired_transport();
        let mut sender = DataChannel::new(&mut a, "S2", "peer-ski");
        let mut receiver = DataChannel::new(&mut b, "S2", "peer-ski");

        sender.send_data(json!({"hello": "world"})).await.unwrap();
        let received = receiver.recv_data().await.unwrap();
        assert_eq!(received, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn rejects_empty_frame() {
        let (mut a, mut b) = paired_transport();
        a.send(Frame::Binary(vec![])).await.unwrap();
        let mut receiver = DataChannel::new(&mut b, "S2", "peer-ski");
        assert!(receiver.recv_data().await.is_err());
    }
}
