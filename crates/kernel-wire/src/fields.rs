//! Serde adapters for the message fields whose JSON form differs from
//! their in-memory form.
//!
//! - `buffers` travel inside JSON as base64 strings. On the WebSocket they
//!   normally ride in a binary frame instead (see [`crate::frame`]), so the
//!   JSON form only shows up in diagnostics and in frontends that inline them.
//! - `parent_header` is written as `{}` when absent, which is what kernels and
//!   the Jupyter server expect from a top-level request.

use base64::prelude::*;
use bytes::Bytes;
use jupyter_protocol::Header;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Write binary buffers as a JSON array of base64 strings.
pub fn serialize_buffers<S>(buffers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let encoded: Vec<String> = buffers.iter().map(|b| BASE64_STANDARD.encode(b)).collect();
    encoded.serialize(serializer)
}

/// Read a JSON array of base64 strings. A missing or `null` field is an empty
/// list; a string that is not valid base64 fails the whole message.
pub fn deserialize_buffers<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(encoded) = Option::<Vec<String>>::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    encoded
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            BASE64_STANDARD
                .decode(text.as_bytes())
                .map(Bytes::from)
                .map_err(|e| serde::de::Error::custom(format!("buffer {index}: {e}")))
        })
        .collect()
}

/// Write an absent parent header as an empty object.
pub fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serialize_parent_ref(&parent.as_ref(), serializer)
}

pub(crate) fn serialize_parent_ref<S>(
    parent: &Option<&Header>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Attachments {
        #[serde(
            default,
            serialize_with = "serialize_buffers",
            deserialize_with = "deserialize_buffers"
        )]
        buffers: Vec<Bytes>,
    }

    #[derive(Serialize)]
    struct Parent {
        #[serde(serialize_with = "serialize_parent_header")]
        parent_header: Option<Header>,
    }

    #[test]
    fn buffers_are_written_as_base64() {
        let value = Attachments {
            buffers: vec![Bytes::from_static(b"\x00\x01\xff")],
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["buffers"][0], "AAH/");
    }

    #[test]
    fn null_and_missing_buffers_are_empty() {
        let null: Attachments = serde_json::from_str(r#"{"buffers": null}"#).unwrap();
        let missing: Attachments = serde_json::from_str("{}").unwrap();
        assert!(null.buffers.is_empty());
        assert!(missing.buffers.is_empty());
    }

    #[test]
    fn invalid_base64_names_the_offending_buffer() {
        let err = serde_json::from_str::<Attachments>(r#"{"buffers": ["aGk=", "***"]}"#)
            .err()
            .unwrap();
        assert!(err.to_string().contains("buffer 1"));
    }

    #[test]
    fn missing_parent_is_an_empty_object() {
        let json = serde_json::to_value(Parent {
            parent_header: None,
        })
        .unwrap();
        assert_eq!(json["parent_header"], serde_json::json!({}));
    }
}
