//! CSHP: version and format negotiation following CMI, before CSH.

use serde_json::{json, Value};
use tracing::debug;

use crate::codec::{decode_tagged_json, encode_control, for_each_single_key_item, require, top_level_family, TAG_CONTROL};
use crate::config::HandshakeConfig;
use crate::error::ShipError;
use crate::race::{first_to_finish, BoxFuture};
use crate::timer::Timer;
use crate::transport::{Frame, Transport};

const LAYER: &str = "cshp";

/// The version both sides agreed on. Only `(1, 0)` is ever negotiable, but
/// the layer returns it explicitly to match spec §4.6 ("OK: return (1, 0)")
/// rather than discarding the negotiated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShipVersion {
    pub major: i64,
    pub minor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    AnnounceMax,
    Select,
}

impl HandshakeType {
    fn as_str(self) -> &'static str {
        match self {
            HandshakeType::AnnounceMax => "announceMax",
            HandshakeType::Select => "SELECT",
        }
    }

    fn parse(s: &str, layer: &'static str) -> Result<Self, ShipError> {
        match s {
            "announceMax" => Ok(HandshakeType::AnnounceMax),
            "SELECT" => Ok(HandshakeType::Select),
            other => Err(ShipError::abort(layer, format!("unknown handshakeType '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipFormat {
    JsonUtf8,
    JsonUtf16,
}

impl ShipFormat {
    fn as_str(self) -> &'static str {
        match self {
            ShipFormat::JsonUtf8 => "JSON-UTF8",
            ShipFormat::JsonUtf16 => "JSON-UTF16",
        }
    }

    fn parse(s: &str, layer: &'static str) -> Result<Self, ShipError> {
        match s {
            "JSON-UTF8" => Ok(ShipFormat::JsonUtf8),
            "JSON-UTF16" => Ok(ShipFormat::JsonUtf16),
            other => Err(ShipError::abort(layer, format!("unknown format '{other}'"))),
        }
    }
}

/// `messageProtocolHandshake`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHandshake {
    pub handshake_type: HandshakeType,
    pub version_major: i64,
    pub version_minor: i64,
    pub formats: Vec<ShipFormat>,
}

impl ProtocolHandshake {
    fn to_json(&self) -> Value {
        json!({
            "messageProtocolHandshake": [
                {"handshakeType": self.handshake_type.as_str()},
                {"version": {"major": self.version_major, "minor": self.version_minor}},
                {"formats": [{"format": self.formats.iter().map(|f| f.as_str()).collect::<Vec<_>>()}]},
            ]
        })
    }

    fn from_items(items: &[Value]) -> Result<Self, ShipError> {
        let mut handshake_type = None;
        let mut version_major = None;
        let mut version_minor = None;
        let mut formats = None;

        for_each_single_key_item(items, LAYER, |key, value| {
            match key {
                "handshakeType" => {
                    let s = value.as_str().ok_or_else(|| ShipError::abort(LAYER, "handshakeType must be a string"))?;
                    handshake_type = Some(HandshakeType::parse(s, LAYER)?);
                }
                "version" => {
                    version_major = value.get("major").and_then(Value::as_i64);
                    version_minor = value.get("minor").and_then(Value::as_i64);
                }
                "formats" => {
                    let list = value
                        .as_array()
                        .and_then(|arr| arr.first())
                        .and_then(|entry| entry.get("format"))
                        .and_then(Value::as_array)
                        .ok_or_else(|| ShipError::abort(LAYER, "formats must be a list of {format: [...]}"))?;
                    let mut parsed = Vec::with_capacity(list.len());
                    for f in list {
                        let s = f.as_str().ok_or_else(|| ShipError::abort(LAYER, "format entry must be a string"))?;
                        parsed.push(ShipFormat::parse(s, LAYER)?);
                    }
                    formats = Some(parsed);
                }
                other => return Err(ShipError::abort(LAYER, format!("unexpected field '{other}'"))),
            }
            Ok(())
        })?;

        Ok(ProtocolHandshake {
            handshake_type: require(handshake_type, "handshakeType", LAYER)?,
            version_major: require(version_major, "version.major", LAYER)?,
            version_minor: require(version_minor, "version.minor", LAYER)?,
            formats: require(formats, "formats.format", LAYER)?,
        })
    }
}

enum CshpMessage {
    Handshake(ProtocolHandshake),
    Error(i64),
}

fn decode_cshp(bytes: &[u8]) -> Result<CshpMessage, ShipError> {
    let value = decode_tagged_json(bytes, TAG_CONTROL, LAYER)?;
    let (family, items) = top_level_family(&value, LAYER)?;
    match family {
        "messageProtocolHandshake" => Ok(CshpMessage::Handshake(ProtocolHandshake::from_items(items)?)),
        "messageProtocolHandshakeError" => {
            let mut error = None;
            for_each_single_key_item(items, LAYER, |key, value| {
                match key {
                    "error" => error = value.as_i64(),
                    other => return Err(ShipError::abort(LAYER, format!("unexpected field '{other}'"))),
                }
                Ok(())
            })?;
            Ok(CshpMessage::Error(require(error, "error", LAYER)?))
        }
        other => Err(ShipError::abort(LAYER, format!("unknown message family '{other}'"))),
    }
}

async fn send_handshake(transport: &mut dyn Transport, msg: &ProtocolHandshake) -> Result<(), ShipError> {
    debug!(?msg, "sending CSHP handshake message");
    transport.send(Frame::Binary(encode_control(&msg.to_json()))).await
}

async fn send_error(transport: &mut dyn Transport, error: i64) -> Result<(), ShipError> {
    let value = json!({"messageProtocolHandshakeError": [{"error": error}]});
    transport.send(Frame::Binary(encode_control(&value))).await
}

async fn recv_cshp(transport: &mut dyn Transport) -> Result<CshpMessage, ShipError> {
    let bytes = transport.recv().await?.into_bytes();
    decode_cshp(&bytes)
}

enum NextInput {
    Message(CshpMessage),
    TimedOut,
}

async fn decide_next_input(transport: &mut dyn Transport, timer: &Timer) -> Result<NextInput, ShipError> {
    let recv: BoxFuture<'_, Result<NextInput, ShipError>> =
        Box::pin(async { recv_cshp(transport).await.map(NextInput::Message) });
    let wait: BoxFuture<'_, Result<NextInput, ShipError>> = Box::pin(async {
        timer.wait_until_completed().await;
        Ok(NextInput::TimedOut)
    });

    let mut results = first_to_finish(vec![("cshp_message", recv), ("wait_timer", wait)]).await;

    if results.contains_key("wait_timer") {
        debug!("wait_timer expired");
        return Ok(NextInput::TimedOut);
    }

    results
        .remove("cshp_message")
        .expect("one of the two races must have produced a result")
}

/// Negotiates version and format as the connecting side: propose the
/// maximum we support, then accept or reject the peer's selection.
pub async fn run_client(transport: &mut dyn Transport, config: &HandshakeConfig) -> Result<ShipVersion, ShipError> {
    debug!("starting CSHP as client");

    send_handshake(
        transport,
        &ProtocolHandshake {
            handshake_type: HandshakeType::AnnounceMax,
            version_major: 1,
            version_minor: 0,
            formats: vec![ShipFormat::JsonUtf8],
        },
    )
    .await?;

    let mut timer = Timer::new();
    timer.start(config.cshp_timeout).expect("fresh timer");

    let outcome = match decide_next_input(transport, &timer).await? {
        NextInput::TimedOut => Err(1),
        NextInput::Message(CshpMessage::Handshake(msg)) => {
            let valid = msg.handshake_type == HandshakeType::Select
                && msg.version_major == 1
                && msg.version_minor == 0
                && msg.formats == vec![ShipFormat::JsonUtf8];
            if valid {
                Ok(msg)
            } else {
                Err(3)
            }
        }
        NextInput::Message(CshpMessage::Error(peer_code)) => {
            debug!(peer_code, "peer reported a protocol handshake error");
            Err(2)
        }
    };

    timer.cancel();

    match outcome {
        Ok(selected) => {
            let version = ShipVersion { major: selected.version_major, minor: selected.version_minor };
            send_handshake(transport, &selected).await?;
            debug!("CSHP was successful");
            Ok(version)
        }
        Err(code) => {
            debug!(code, "CSHP requested abort");
            send_error(transport, code).await?;
            Err(ShipError::abort(LAYER, "protocol handshake did not reach agreement"))
        }
    }
}

/// Negotiates version and format as the accepting side: wait for a
/// proposal, answer with our selection, then wait for confirmation.
pub async fn run_server(transport: &mut dyn Transport, config: &HandshakeConfig) -> Result<ShipVersion, ShipError> {
    debug!("starting CSHP as server");

    let mut timer = Timer::new();
    timer.start(config.cshp_timeout).expect("fresh timer");

    let proposal = match decide_next_input(transport, &timer).await? {
        NextInput::TimedOut => {
            timer.cancel();
            send_error(transport, 1).await?;
            return Err(ShipError::abort(LAYER, "timed out waiting for a proposal"));
        }
        NextInput::Message(CshpMessage::Error(peer_code)) => {
            timer.cancel();
            debug!(peer_code, "peer reported a protocol handshake error");
            send_error(transport, 2).await?;
            return Err(ShipError::abort(LAYER, "peer reported an error"));
        }
        NextInput::Message(CshpMessage::Handshake(msg)) => msg,
    };
    timer.cancel();

    let valid = proposal.handshake_type == HandshakeType::AnnounceMax
        && proposal.version_major == 1
        && proposal.version_minor == 0
        && proposal.formats.contains(&ShipFormat::JsonUtf8);

    if !valid {
        send_error(transport, 3).await?;
        return Err(ShipError::abort(LAYER, "proposal did not match our supported version/format"));
    }

    let selection = ProtocolHandshake {
        handshake_type: HandshakeType::Select,
        version_major: 1,
        version_minor: 0,
        formats: vec![ShipFormat::JsonUtf8],
    };
    send_handshake(transport, &selection).await?;

    let mut confirm_timer = Timer::new();
    confirm_timer.start(config.cshp_timeout).expect("fresh timer");

    let outcome = match decide_next_input(transport, &confirm_timer).await? {
        NextInput::TimedOut => Err(1),
        NextInput::Message(CshpMessage::Error(peer_code)) => {
            debug!(peer_code, "peer reported a protocol handshake error");
            Err(2)
        }
        NextInput::Message(CshpMessage::Handshake(msg)) if msg == selection => Ok(()),
        NextInput::Message(CshpMessage::Handshake(_)) => Err(3),
    };
    confirm_timer.cancel();

    match outcome {
        Ok(()) => {
            debug!("CSHP was successful");
            Ok(ShipVersion { major: selection.version_major, minor: selection.version_minor })
        }
        Err(code) => {
            debug!(code, "CSHP requested abort");
            send_error(transport, code).await?;
            Err(ShipError::abort(LAYER, "confirmation did not match our selection"))
        }
    }
}
