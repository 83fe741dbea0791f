//! PIN layer: an announce-only stub. SHIP defines PIN-based pairing, but
//! pairing itself is out of scope — this layer only confirms neither side
//! requires it, then aborts if it does.

use serde_json::{json, Value};
use tracing::debug;

use crate::codec::{decode_tagged_json, encode_control, for_each_single_key_item, require, top_level_family, TAG_CONTROL};
use crate::error::ShipError;
use crate::transport::{Frame, Transport};

const LAYER: &str = "pin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Required,
    Optional,
    PinOk,
    None,
}

impl PinState {
    fn as_str(self) -> &'static str {
        match self {
            PinState::Required => "required",
            PinState::Optional => "optional",
            PinState::PinOk => "pinOk",
            PinState::None => "none",
        }
    }

    fn parse(s: &str) -> Result<Self, ShipError> {
        match s {
            "required" => Ok(PinState::Required),
            "optional" => Ok(PinState::Optional),
            "pinOk" => Ok(PinState::PinOk),
            "none" => Ok(PinState::None),
            other => Err(ShipError::abort(LAYER, format!("unknown pinState '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPermission {
    Busy,
    Ok,
}

impl InputPermission {
    fn as_str(self) -> &'static str {
        match self {
            InputPermission::Busy => "busy",
            InputPermission::Ok => "ok",
        }
    }

    fn parse(s: &str) -> Result<Self, ShipError> {
        match s {
            "busy" => Ok(InputPermission::Busy),
            "ok" => Ok(InputPermission::Ok),
            other => Err(ShipError::abort(LAYER, format!("unknown inputPermission '{other}'"))),
        }
    }
}

/// `connectionPinState`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinStateMessage {
    pub pin_state: PinState,
    pub input_permission: Option<InputPermission>,
}

impl PinStateMessage {
    fn to_json(&self) -> Value {
        let mut items = vec![json!({"pinState": self.pin_state.as_str()})];
        if let Some(perm) = self.input_permission {
            items.push(json!({"inputPermission": perm.as_str()}));
        }
        json!({"connectionPinState": items})
    }

    fn from_items(items: &[Value]) -> Result<Self, ShipError> {
        let mut pin_state = None;
        let mut input_permission = None;

        for_each_single_key_item(items, LAYER, |key, value| {
            match key {
                "pinState" => {
                    let s = value.as_str().ok_or_else(|| ShipError::abort(LAYER, "pinState must be a string"))?;
                    pin_state = Some(PinState::parse(s)?);
                }
                "inputPermission" => {
                    let s = value.as_str().ok_or_else(|| ShipError::abort(LAYER, "inputPermission must be a string"))?;
                    input_permission = Some(InputPermission::parse(s)?);
                }
                other => return Err(ShipError::abort(LAYER, format!("unexpected field '{other}'"))),
            }
            Ok(())
        })?;

        Ok(PinStateMessage {
            pin_state: require(pin_state, "pinState", LAYER)?,
            input_permission,
        })
    }
}

enum PinMessage {
    State(PinStateMessage),
    /// `connectionPinInput`/`connectionPinError` — accepted as valid parses
    /// but never produced or needed beyond detecting "not a state message".
    Other,
}

fn decode_pin(bytes: &[u8]) -> Result<PinMessage, ShipError> {
    let value = decode_tagged_json(bytes, TAG_CONTROL, LAYER)?;
    let (family, items) = top_level_family(&value, LAYER)?;
    match family {
        "connectionPinState" => Ok(PinMessage::State(PinStateMessage::from_items(items)?)),
        "connectionPinInput" | "connectionPinError" => Ok(PinMessage::Other),
        other => Err(ShipError::abort(LAYER, format!("unknown message family '{other}'"))),
    }
}

async fn send_state(transport: &mut dyn Transport, msg: &PinStateMessage) -> Result<(), ShipError> {
    debug!(?msg, "sending PIN state message");
    transport.send(Frame::Binary(encode_control(&msg.to_json()))).await
}

/// Announces `pinState: none` and aborts unless the peer does the same.
/// `remote_ski` is carried only for logging context, matching the reference
/// implementation's unused-but-threaded constructor parameter.
pub async fn run(transport: &mut dyn Transport, remote_ski: &str) -> Result<(), ShipError> {
    debug!(remote_ski, "starting PIN");

    send_state(
        transport,
        &PinStateMessage {
            pin_state: PinState::None,
            input_permission: None,
        },
    )
    .await?;

    let bytes = transport.recv().await?.into_bytes();
    match decode_pin(&bytes)? {
        PinMessage::State(msg) if msg.pin_state == PinState::None => {
            debug!("PIN finished");
            Ok(())
        }
        PinMessage::State(_) => Err(ShipError::abort(
            LAYER,
            "remote side has PIN requirements and this library does not support pairing",
        )),
        PinMessage::Other => Err(ShipError::abort(LAYER, "expected a PIN state message")),
    }
}
