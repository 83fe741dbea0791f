//! In-memory paired transport for tests, in the manner of the teacher's
//! `LoopbackTransport` — but channel-backed so a `recv` on one end actually
//! suspends until the other end sends, which the handshake's race-based
//! timeout logic depends on.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ShipError;
use crate::transport::{Frame, Transport};

/// One half of an in-memory, full-duplex pipe.
pub struct PipeTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    closed: bool,
}

#[async_trait]
impl Transport for PipeTransport {
    async fn recv(&mut self) -> Result<Frame, ShipError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ShipError::Transport("peer dropped the pipe".into()))
    }

    async fn send(&mut self, frame: Frame) -> Result<(), ShipError> {
        if self.closed {
            return Err(ShipError::Transport("send on a closed pipe".into()));
        }
        self.tx
            .send(frame)
            .map_err(|_| ShipError::Transport("peer dropped the pipe".into()))
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), ShipError> {
        self.closed = true;
        Ok(())
    }
}

/// Builds a connected pair of in-memory transports, one per side of a
/// handshake under test.
pub fn paired_transport() -> (PipeTransport, PipeTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    (
        PipeTransport {
            tx: a_tx,
            rx: a_rx,
            closed: false,
        },
        PipeTransport {
            tx: b_tx,
            rx: b_rx,
            closed: false,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (mut a, mut b) = paired_transport();
        a.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Frame::Binary(vec![1, 2, 3]));

        b.send(Frame::Text("hi".into())).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Frame::Text("hi".into()));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut a, _b) = paired_transport();
        a.close(1000, "done").await.unwrap();
        assert!(a.send(Frame::Binary(vec![])).await.is_err());
    }
}
