//! Connection Mode Initialisation: the two-byte sentinel exchange that
//! opens every SHIP connection.

use tracing::{debug, error};

use crate::config::HandshakeConfig;
use crate::error::ShipError;
use crate::race::{first_to_finish, BoxFuture};
use crate::transport::{Frame, Transport};

const SENTINEL: [u8; 2] = [0x00, 0x00];
const LAYER: &str = "cmi";

fn evaluate_cmi_message(bytes: &[u8]) -> Result<(), ShipError> {
    if bytes.len() >= 2 && bytes[0..2] == SENTINEL {
        Ok(())
    } else {
        Err(ShipError::abort(LAYER, "did not receive the CMI sentinel"))
    }
}

async fn receive_cmi_message(transport: &mut dyn Transport) -> Result<Vec<u8>, ShipError> {
    Ok(transport.recv().await?.into_bytes())
}

async fn send_cmi_message(transport: &mut dyn Transport) -> Result<(), ShipError> {
    transport.send(Frame::Binary(SENTINEL.to_vec())).await
}

/// Runs CMI as the connecting side: send the sentinel, then wait for the
/// peer's sentinel or the shared timeout, whichever comes first.
pub async fn run_client(transport: &mut dyn Transport, config: &HandshakeConfig) -> Result<(), ShipError> {
    debug!("starting CMI as client");
    send_cmi_message(transport).await?;
    let bytes = await_frame_or_timeout(transport, config).await?;
    evaluate_cmi_message(&bytes)?;
    debug!("CMI finished");
    Ok(())
}

/// Runs CMI as the accepting side: wait for the peer's sentinel (or the
/// shared timeout), echo our own sentinel back, then validate what we
/// received. Per spec §4.5 the server always echoes before evaluating, so a
/// garbage sentinel still gets a `0x00 0x00` reply before the abort.
pub async fn run_server(transport: &mut dyn Transport, config: &HandshakeConfig) -> Result<(), ShipError> {
    debug!("starting CMI as server");
    let bytes = await_frame_or_timeout(transport, config).await?;
    send_cmi_message(transport).await?;
    evaluate_cmi_message(&bytes)?;
    debug!("CMI finished");
    Ok(())
}

enum CmiInput {
    Message(Result<Vec<u8>, ShipError>),
    Timeout,
}

async fn await_frame_or_timeout(
    transport: &mut dyn Transport,
    config: &HandshakeConfig,
) -> Result<Vec<u8>, ShipError> {
    let recv: BoxFuture<'_, CmiInput> =
        Box::pin(async { CmiInput::Message(receive_cmi_message(transport).await) });
    let timeout: BoxFuture<'_, CmiInput> = Box::pin(async {
        tokio::time::sleep(config.cmi_timeout).await;
        CmiInput::Timeout
    });

    let mut results = first_to_finish(vec![("cmi_message", recv), ("cmi_timeout", timeout)]).await;

    if results.contains_key("cmi_timeout") {
        debug!("CMI timeout timer triggered");
        return Err(ShipError::abort(LAYER, "timed out waiting for the CMI sentinel"));
    }

    match results.remove("cmi_message") {
        Some(CmiInput::Message(Ok(bytes))) => Ok(bytes),
        Some(CmiInput::Message(Err(e))) => Err(e),
        _ => {
            error!("CMI produced neither a message nor a timeout");
            Err(ShipError::abort(LAYER, "internal race error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paired_transport;
    use std::time::Duration;

    #[tokio::test]
    async fn client_and_server_complete() {
        let (mut client, mut server) = paired_transport();
        let config = HandshakeConfig::default();

        let (client_result, server_result) =
            tokio::join!(run_client(&mut client, &config), run_server(&mut server, &config));

        client_result.unwrap();
        server_result.unwrap();
    }

    #[tokio::test]
    async fn client_times_out_without_peer() {
        let (mut client, _server) = paired_transport();
        let config = HandshakeConfig {
            cmi_timeout: Duration::from_millis(5),
            ..HandshakeConfig::default()
        };

        let result = run_client(&mut client, &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn server_rejects_garbage_sentinel() {
        let (mut client, mut server) = paired_transport();
        let config = HandshakeConfig::default();

        client.send(Frame::Binary(vec![0x01, 0x02])).await.unwrap();
        let result = run_server(&mut server, &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn server_echoes_sentinel_before_evaluating_a_garbage_one() {
        let (mut client, mut server) = paired_transport();
        let config = HandshakeConfig::default();

        client.send(Frame::Binary(vec![0x01, 0x02])).await.unwrap();
        let result = run_server(&mut server, &config).await;
        assert!(result.is_err());

        let echoed = client.recv().await.unwrap().into_bytes();
        assert_eq!(echoed, SENTINEL.to_vec());
    }
}
