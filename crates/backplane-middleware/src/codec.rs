//! Envelope codec: `Fields` ⇄ msgpack map payloads.
//!
//! Payloads are a single msgpack map with string keys. Values map onto
//! [`FieldValue`] as follows:
//!
//! | msgpack | `FieldValue` |
//! |---|---|
//! | str | `Text` |
//! | int | `Int` |
//! | float32 / float64 | `Float` |
//! | bin, or an array of ints in `0..=255` | `Bytes` |
//! | bool | `Int` (0 / 1) |
//!
//! Anything else is rejected with [`BackplaneError::MalformedPayload`].

use backplane_types::{BackplaneError, FieldValue, Fields, Message, Topic};
use rmpv::Value;

/// Encode `fields` as a msgpack map under `topic`.
///
/// Only fails if the underlying writer fails, which cannot happen for the
/// in-memory buffer used here; the `Result` keeps the error in the type.
pub fn encode(topic: impl Into<Topic>, fields: &Fields) -> Result<Message, BackplaneError> {
    let map = fields
        .iter()
        .map(|(k, v)| (Value::from(k.as_str()), to_value(v)))
        .collect();

    let mut payload = Vec::new();
    rmpv::encode::write_value(&mut payload, &Value::Map(map))
        .map_err(|e| BackplaneError::MalformedPayload(e.to_string()))?;

    Ok(Message::new(topic, payload))
}

/// Decode a message into its topic and field map.
///
/// # Errors
///
/// * [`BackplaneError::MalformedPayload`] – not a msgpack map, a non-string
///   key, an unsupported value type, or a non-text `command`.
/// * [`BackplaneError::MissingCommand`] – the map has no `command` key.
pub fn decode(message: &Message) -> Result<(Topic, Fields), BackplaneError> {
    let mut cursor = message.payload.as_slice();
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| BackplaneError::MalformedPayload(e.to_string()))?;

    let Value::Map(entries) = value else {
        return Err(BackplaneError::MalformedPayload(
            "payload is not a map".to_string(),
        ));
    };

    let mut fields = Fields::empty();
    for (key, value) in entries {
        let key = match key {
            Value::String(s) => s.into_str().ok_or_else(|| {
                BackplaneError::MalformedPayload("key is not valid UTF-8".to_string())
            })?,
            other => {
                return Err(BackplaneError::MalformedPayload(format!(
                    "non-string key {other}"
                )));
            }
        };
        let value = from_value(&key, value)?;
        fields.insert(key, value);
    }

    match fields.get(Fields::COMMAND) {
        None => Err(BackplaneError::MissingCommand),
        Some(FieldValue::Text(_)) => Ok((message.topic.clone(), fields)),
        Some(_) => Err(BackplaneError::MalformedPayload(
            "`command` is not text".to_string(),
        )),
    }
}

fn to_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Text(s) => Value::from(s.as_str()),
        FieldValue::Int(n) => Value::from(*n),
        FieldValue::Float(f) => Value::F64(*f),
        FieldValue::Bytes(b) => Value::Binary(b.clone()),
    }
}

fn from_value(key: &str, value: Value) -> Result<FieldValue, BackplaneError> {
    let unsupported = |what: &str| {
        BackplaneError::MalformedPayload(format!("field `{key}` has unsupported {what}"))
    };

    match value {
        Value::String(s) => s
            .into_str()
            .map(FieldValue::Text)
            .ok_or_else(|| unsupported("non-UTF-8 text")),
        Value::Integer(n) => n
            .as_i64()
            .map(FieldValue::Int)
            .ok_or_else(|| unsupported("integer width")),
        Value::F32(f) => Ok(FieldValue::Float(f.into())),
        Value::F64(f) => Ok(FieldValue::Float(f)),
        Value::Binary(b) => Ok(FieldValue::Bytes(b)),
        Value::Boolean(b) => Ok(FieldValue::Int(b.into())),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| unsupported("array element"))
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(FieldValue::Bytes),
        _ => Err(unsupported("value type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backplane_types::Command;

    fn raw(value: Value) -> Message {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).unwrap();
        Message::new("A1", payload)
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let fields = Fields::new(Command::DigitalPinMode)
            .with("enable", "Enable")
            .with("pin", "13")
            .with("mode", "Output");
        let message = encode(Topic::command(1), &fields).unwrap();
        assert_eq!(message.topic, Topic::command(1));

        let (topic, decoded) = decode(&message).unwrap();
        assert_eq!(topic, Topic::command(1));
        assert_eq!(decoded, fields);
    }

    #[test]
    fn mixed_value_types_survive() {
        let fields = Fields::new(Command::I2cReply)
            .with("board", 2i64)
            .with("data", vec![0u8, 255, 7])
            .with("gain", 0.004);
        let (_, decoded) = decode(&encode("B2", &fields).unwrap()).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn int_arrays_decode_as_bytes() {
        let message = raw(Value::Map(vec![
            (Value::from("command"), Value::from("i2c_reply")),
            (
                Value::from("data"),
                Value::Array(vec![Value::from(1), Value::from(2)]),
            ),
        ]));
        let (_, fields) = decode(&message).unwrap();
        assert_eq!(fields.get("data"), Some(&FieldValue::Bytes(vec![1, 2])));
    }

    #[test]
    fn non_map_payload_is_malformed() {
        let err = decode(&raw(Value::from("hello"))).unwrap_err();
        assert!(matches!(err, BackplaneError::MalformedPayload(_)));

        let err = decode(&Message::new("A1", vec![0xc1])).unwrap_err();
        assert!(matches!(err, BackplaneError::MalformedPayload(_)));

        let err = decode(&Message::new("A1", Vec::new())).unwrap_err();
        assert!(matches!(err, BackplaneError::MalformedPayload(_)));
    }

    #[test]
    fn missing_command_is_reported() {
        let message = raw(Value::Map(vec![(Value::from("pin"), Value::from(3))]));
        assert!(matches!(
            decode(&message).unwrap_err(),
            BackplaneError::MissingCommand
        ));
    }

    #[test]
    fn non_string_key_is_malformed() {
        let message = raw(Value::Map(vec![
            (Value::from("command"), Value::from("tone_off")),
            (Value::from(5), Value::from(3)),
        ]));
        assert!(matches!(
            decode(&message).unwrap_err(),
            BackplaneError::MalformedPayload(_)
        ));
    }
}
