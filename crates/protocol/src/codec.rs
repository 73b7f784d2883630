//! Multipart wire framing.
//!
//! ```text
//! [identity...] <IDS|MSG> signature header parent_header metadata content
//! ```
//!
//! The signature is the hex HMAC over the four json frames, in that order.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::{
    content::MessageContent,
    message::{Header, Message, MessageData},
    signature::Signer,
    CodecError,
};

pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Frames following the delimiter: signature plus four json blocks.
const FRAMES_AFTER_DELIMITER: usize = 5;

pub fn encode(message: &Message, signer: &Signer) -> Result<Vec<Bytes>, CodecError> {
    let data = &message.data;

    let header = to_json("header", &data.header)?;
    let parent_header = match &data.parent_header {
        Some(parent) => to_json("parent_header", parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = to_json("metadata", &data.metadata)?;
    let content = data
        .content
        .to_value()
        .and_then(|value| serde_json::to_vec(&value))
        .map_err(|source| CodecError::Json {
            part: "content",
            source,
        })?;

    let signature = signer.sign(&[&header[..], &parent_header[..], &metadata[..], &content[..]]);

    let mut frames = Vec::with_capacity(message.identities.len() + 1 + FRAMES_AFTER_DELIMITER);
    frames.extend(message.identities.iter().cloned());
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.push(Bytes::from(header));
    frames.push(Bytes::from(parent_header));
    frames.push(Bytes::from(metadata));
    frames.push(Bytes::from(content));

    Ok(frames)
}

pub fn decode(mut frames: Vec<Bytes>, signer: &Signer) -> Result<Message, CodecError> {
    let delimiter = frames
        .iter()
        .position(|frame| frame.as_ref() == DELIMITER)
        .ok_or_else(|| CodecError::Format("missing <IDS|MSG> delimiter".to_string()))?;

    let payload = frames.split_off(delimiter + 1);
    frames.truncate(delimiter);
    let identities = frames;

    if payload.len() != FRAMES_AFTER_DELIMITER {
        return Err(CodecError::Format(format!(
            "expected {FRAMES_AFTER_DELIMITER} frames after the delimiter, got {}",
            payload.len()
        )));
    }

    let [signature, header, parent_header, metadata, content] =
        <[Bytes; FRAMES_AFTER_DELIMITER]>::try_from(payload)
            .map_err(|_| CodecError::Format("unexpected frame count".to_string()))?;

    signer.verify(
        &[&header[..], &parent_header[..], &metadata[..], &content[..]],
        &signature,
    )?;

    let header: Header = from_json("header", &header)?;
    let parent_header = parse_parent(&parent_header)?;
    let metadata: Map<String, Value> = from_json("metadata", &metadata)?;
    let content: Value = from_json("content", &content)?;
    let content = MessageContent::from_value(&header.msg_type, content).map_err(|source| {
        CodecError::Json {
            part: "content",
            source,
        }
    })?;

    Ok(Message {
        identities,
        data: MessageData {
            header,
            parent_header,
            metadata,
            content,
        },
    })
}

/// An empty object stands for "no parent".
fn parse_parent(frame: &[u8]) -> Result<Option<Header>, CodecError> {
    let value: Value = from_json("parent_header", frame)?;
    match value {
        Value::Object(ref fields) if fields.is_empty() => Ok(None),
        Value::Null => Ok(None),
        value => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| CodecError::Json {
                part: "parent_header",
                source,
            }),
    }
}

fn to_json<T: serde::Serialize>(part: &'static str, value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|source| CodecError::Json { part, source })
}

fn from_json<T: serde::de::DeserializeOwned>(part: &'static str, frame: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(frame).map_err(|source| CodecError::Json { part, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        content::{ExecuteRequest, ExecutionState, StreamName},
        signature::SignatureScheme,
    };
    use googletest::prelude::*;

    fn signer(key: &str) -> Signer {
        Signer::new(SignatureScheme::HmacSha256, key.as_bytes()).unwrap()
    }

    fn execute_request() -> Message {
        let data = MessageData::new(
            ExecuteRequest::new("val x = 1").into(),
            "client-session",
            "tester",
        );
        Message::new(vec![Bytes::from_static(b"client-1")], data)
    }

    #[googletest::test]
    fn encoded_frames_follow_the_wire_layout() {
        let message = execute_request();
        let frames = encode(&message, &signer("key")).unwrap();

        expect_that!(frames.len(), eq(7));
        expect_that!(frames[0].as_ref(), eq(b"client-1".as_slice()));
        expect_that!(frames[1].as_ref(), eq(DELIMITER));
        expect_that!(frames[2].len(), eq(64));
        expect_that!(frames[4].as_ref(), eq(b"{}".as_slice()));
    }

    #[googletest::test]
    fn message_survives_a_round_trip() {
        let request = execute_request();
        let broadcast = Message::broadcast(
            request.header(),
            MessageContent::stream(StreamName::Stdout, "hello\n"),
        );

        for message in [request, broadcast] {
            let frames = encode(&message, &signer("key")).unwrap();
            let decoded = decode(frames, &signer("key")).unwrap();
            expect_that!(decoded, eq(message.clone()));
        }
    }

    #[googletest::test]
    fn decoding_with_another_key_fails_authentication() {
        let frames = encode(&execute_request(), &signer("key")).unwrap();

        let result = decode(frames, &signer("another key"));

        expect_that!(result.map_err(|e| e.is_auth()), pat!(Err(eq(true))));
    }

    #[googletest::test]
    fn tampered_content_fails_authentication() {
        let mut frames = encode(&execute_request(), &signer("key")).unwrap();
        let last = frames.len() - 1;
        frames[last] = Bytes::from_static(br#"{"code":"rm -rf /"}"#);

        let result = decode(frames, &signer("key"));

        expect_that!(result.map_err(|e| e.is_auth()), pat!(Err(eq(true))));
    }

    #[googletest::test]
    fn unsigned_messages_skip_verification() {
        let mut frames = encode(&execute_request(), &Signer::unsigned()).unwrap();
        expect_that!(frames[2].is_empty(), eq(true));

        frames[2] = Bytes::from_static(b"whatever");
        expect_that!(decode(frames, &Signer::unsigned()), pat!(Ok(_)));
    }

    #[googletest::test]
    fn missing_delimiter_is_a_format_error() {
        let mut frames = encode(&execute_request(), &signer("key")).unwrap();
        frames.remove(1);

        let result = decode(frames, &signer("key"));

        expect_that!(result, pat!(Err(pat!(CodecError::Format(_)))));
    }

    #[googletest::test]
    fn wrong_frame_count_is_a_format_error() {
        let mut frames = encode(&execute_request(), &signer("key")).unwrap();
        frames.pop();

        let result = decode(frames.clone(), &signer("key"));
        expect_that!(result, pat!(Err(pat!(CodecError::Format(_)))));

        frames.push(Bytes::from_static(b"{}"));
        frames.push(Bytes::from_static(b"extra"));
        let result = decode(frames, &signer("key"));
        expect_that!(result, pat!(Err(pat!(CodecError::Format(_)))));
    }

    #[googletest::test]
    fn identities_may_be_empty_or_many() {
        let mut message = Message::broadcast(
            execute_request().header(),
            MessageContent::status(ExecutionState::Busy),
        );
        message.identities = vec![];
        let decoded = decode(encode(&message, &signer("k")).unwrap(), &signer("k")).unwrap();
        expect_that!(decoded.identities.len(), eq(0));

        message.identities = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let decoded = decode(encode(&message, &signer("k")).unwrap(), &signer("k")).unwrap();
        expect_that!(decoded.identities.len(), eq(2));
        expect_that!(decoded.parent_id(), eq(Some(message.parent_id().unwrap())));
    }
}
