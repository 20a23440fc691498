//! Network framing for one envelope.
//!
//! ```text
//! +----------------+-------------+-----------------+
//! | topic len (BE) | topic bytes | payload bytes   |
//! |    2 bytes     |   N bytes   | rest of message |
//! +----------------+-------------+-----------------+
//! ```
//!
//! Each frame travels as a single WebSocket binary message, so the payload
//! length is implied by the message boundary.

use backplane_types::{BackplaneError, Message, Topic};

const HEADER_LEN: usize = 2;

pub fn encode(message: &Message) -> Result<Vec<u8>, BackplaneError> {
    let topic = message.topic.as_bytes();
    let len = u16::try_from(topic.len()).map_err(|_| {
        BackplaneError::Frame(format!("topic of {} bytes is too long", topic.len()))
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN + topic.len() + message.payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(topic);
    out.extend_from_slice(&message.payload);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Message, BackplaneError> {
    let Some((header, rest)) = bytes.split_first_chunk::<HEADER_LEN>() else {
        return Err(BackplaneError::Frame(format!(
            "frame of {} bytes has no header",
            bytes.len()
        )));
    };
    let len = usize::from(u16::from_be_bytes(*header));
    if rest.len() < len {
        return Err(BackplaneError::Frame(format!(
            "topic length {len} exceeds frame body of {} bytes",
            rest.len()
        )));
    }
    let (topic, payload) = rest.split_at(len);
    Ok(Message {
        topic: Topic::from(topic),
        payload: payload.to_vec(),
    })
}
