//! Shared framing and JSON-shape helpers used by every control-layer message
//! family (CSHP, PIN, CSH) and by the data channel.
//!
//! Every SHIP control message is `{"<family>": [ {"k": v}, {"k": v}, ... ]}`:
//! a single top-level key naming the family, whose value is a list of
//! single-key objects. Receivers reject list items with more than one key
//! and never partially apply a message — it is either fully parsed and then
//! interpreted, or rejected outright.

use serde_json::Value;

use crate::error::ShipError;

pub const TAG_CONTROL: u8 = 0x01;
pub const TAG_DATA: u8 = 0x02;

/// Frames a JSON value as a tagged control-layer message (tag `0x01`).
pub fn encode_control(value: &Value) -> Vec<u8> {
    let mut out = vec![TAG_CONTROL];
    out.extend(serde_json::to_vec(value).expect("control messages are always serializable"));
    out
}

/// Frames a JSON value as a tagged data message (tag `0x02`).
pub fn encode_data(value: &Value) -> Vec<u8> {
    let mut out = vec![TAG_DATA];
    out.extend(serde_json::to_vec(value).expect("data messages are always serializable"));
    out
}

/// Validates and strips the tag byte from a received frame, then parses the
/// remainder as JSON. `layer` names the caller for the resulting abort
/// reason.
pub fn decode_tagged_json(bytes: &[u8], expected_tag: u8, layer: &'static str) -> Result<Value, ShipError> {
    if bytes.is_empty() {
        return Err(ShipError::abort(layer, "received an empty frame"));
    }

    if bytes[0] != expected_tag {
        return Err(ShipError::abort(
            layer,
            format!(
                "expected message tag {:#04x}, received {:#04x}",
                expected_tag, bytes[0]
            ),
        ));
    }

    serde_json::from_slice(&bytes[1..])
        .map_err(|e| ShipError::abort(layer, format!("could not parse message as JSON: {e}")))
}

/// Extracts the sole top-level `(family, items)` pair from a control
/// message object, rejecting anything with zero or more than one top-level
/// key or whose value isn't a list.
pub fn top_level_family<'a>(
    value: &'a Value,
    layer: &'static str,
) -> Result<(&'a str, &'a Vec<Value>), ShipError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ShipError::abort(layer, "message is not a JSON object"))?;

    if obj.len() != 1 {
        return Err(ShipError::abort(
            layer,
            "message must have exactly one top-level key",
        ));
    }

    let (key, items) = obj.iter().next().expect("checked len == 1 above");
    let items = items
        .as_array()
        .ok_or_else(|| ShipError::abort(layer, format!("value of '{key}' must be a list")))?;

    Ok((key.as_str(), items))
}

/// Visits every `{key: value}` singleton in `items`, failing on any item
/// that carries more than one key.
pub fn for_each_single_key_item<'a>(
    items: &'a [Value],
    layer: &'static str,
    mut visit: impl FnMut(&'a str, &'a Value) -> Result<(), ShipError>,
) -> Result<(), ShipError> {
    for item in items {
        let obj = item
            .as_object()
            .ok_or_else(|| ShipError::abort(layer, "list item is not an object"))?;

        if obj.len() != 1 {
            return Err(ShipError::abort(
                layer,
                "each list item must carry exactly one key",
            ));
        }

        let (key, val) = obj.iter().next().expect("checked len == 1 above");
        visit(key.as_str(), val)?;
    }

    Ok(())
}

/// Fails with an abort naming the missing field, used once all items have
/// been visited to confirm every required field arrived.
pub fn require<T>(value: Option<T>, field: &str, layer: &'static str) -> Result<T, ShipError> {
    value.ok_or_else(|| ShipError::abort(layer, format!("missing required field '{field}'")))
}
