//! End-to-end handshake scenarios driven through the public API only,
//! mirroring the teacher's top-level `tests/` integration suite
//! (`tests/basic.rs`, `tests/feature_suite.rs`) rather than the per-module
//! unit tests that live beside each layer.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use ship::{HandshakeConfig, Transport, TrustListener, TrustManager};

struct AutoTrust;

#[async_trait]
impl TrustListener for AutoTrust {
    async fn decide(&self, _ski: String, grant: ship::GrantFuture) {
        grant.await;
    }
}

fn pipe() -> (ship::testing::PipeTransport, ship::testing::PipeTransport) {
    ship::testing::paired_transport()
}

/// Scenario 1 from the spec: both sides already trust each other, so every
/// layer runs straight through and application data flows afterward.
#[tokio::test]
async fn happy_path_both_already_trusted() {
    let (mut client_t, mut server_t) = pipe();
    let client_trust = TrustManager::new(AutoTrust);
    let server_trust = TrustManager::new(AutoTrust);
    client_trust.trust_remote("server-ski");
    server_trust.trust_remote("client-ski");
    let config = HandshakeConfig::default();

    let (client_result, server_result) = tokio::join!(
        ship::run_client(&mut client_t, &client_trust, "server-ski", "lighting-demo", &config),
        ship::run_server(&mut server_t, &server_trust, "client-ski", "lighting-demo", &config),
    );

    let mut client_channel = client_result.expect("client handshake succeeds");
    let mut server_channel = server_result.expect("server handshake succeeds");

    client_channel.send_data(json!({"brightness": 80})).await.unwrap();
    let received = server_channel.recv_data().await.unwrap();
    assert_eq!(received, json!({"brightness": 80}));

    server_channel.send_data(json!({"ack": true})).await.unwrap();
    let reply = client_channel.recv_data().await.unwrap();
    assert_eq!(reply, json!({"ack": true}));
}

/// Scenario 2 from the spec: trust arrives mid-flight for the initially
/// untrusted side, which must still converge to a successful handshake.
#[tokio::test]
async fn trust_arriving_mid_flight_still_completes() {
    let (mut client_t, mut server_t) = pipe();
    let client_trust = TrustManager::new(AutoTrust);
    let server_trust = TrustManager::new(AutoTrust);
    client_trust.trust_remote("server-ski");

    let config = HandshakeConfig { hello_init: Duration::from_secs(5), ..HandshakeConfig::default() };

    let trigger = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server_trust.trust_remote("client-ski");
    };

    let (client_result, server_result, ()) = tokio::join!(
        ship::run_client(&mut client_t, &client_trust, "server-ski", "lighting-demo", &config),
        ship::run_server(&mut server_t, &server_trust, "client-ski", "lighting-demo", &config),
        trigger,
    );
    assert!(client_result.is_ok());
    assert!(server_result.is_ok());
}

/// Scenario 6 from the spec: a peer that requires PIN pairing aborts the
/// whole connection, since PIN-based pairing is explicitly out of scope.
#[tokio::test]
async fn peer_requiring_pin_aborts_whole_connection() {
    let (mut client_t, mut server_t) = pipe();
    let client_trust = TrustManager::new(AutoTrust);
    let server_trust = TrustManager::new(AutoTrust);
    client_trust.trust_remote("server-ski");
    server_trust.trust_remote("client-ski");
    let config = HandshakeConfig::default();

    let client_side =
        ship::run_client(&mut client_t, &client_trust, "server-ski", "lighting-demo", &config);

    let server_side = async {
        ship::cmi::run_server(&mut server_t, &config).await?;
        ship::csh::run(&mut server_t, &server_trust, "client-ski", &config).await?;
        ship::cshp::run_server(&mut server_t, &config).await?;

        let value = json!({"connectionPinState": [{"pinState": "required"}]});
        let bytes = ship::codec::encode_control(&value);
        server_t.send(ship::Frame::Binary(bytes)).await?;
        server_t.close(ship::CLOSE_NORMAL, "peer requires PIN pairing").await?;
        Err::<(), ship::ShipError>(ship::ShipError::Transport("peer requires PIN pairing".into()))
    };

    let (client_result, server_result) = tokio::join!(client_side, server_side);
    assert!(client_result.is_err());
    assert!(server_result.is_err());
}
