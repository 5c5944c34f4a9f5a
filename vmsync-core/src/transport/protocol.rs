//! Wire frames and their encodings.
//!
//! Inbound (client to server):
//!
//! ```json
//! {"instanceId": "Person", "verb": "request", "typeName": "Person"}
//! {"instanceId": "Person", "verb": "update", "properties": {"FirstName": "John"}}
//! {"instanceId": "Person", "verb": "dispose"}
//! ```
//!
//! Any inbound frame may carry a `headers` object. A request may carry the
//! `state` the client already holds.
//!
//! Outbound (server to client):
//!
//! ```json
//! {"instanceId": "Person", "data": {"FirstName": "John"}, "errors": []}
//! {"instanceId": "Person", "error": "access denied"}
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, PropertyFault};
use crate::ids::InstanceId;
use crate::state::{Diff, Snapshot};

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub instance_id: InstanceId,
    #[serde(flatten)]
    pub command: Command,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl InboundFrame {
    pub fn request(instance_id: impl Into<InstanceId>, type_name: impl Into<String>) -> Self {
        Self::new(
            instance_id,
            Command::Request {
                type_name: type_name.into(),
                state: None,
            },
        )
    }

    pub fn update(instance_id: impl Into<InstanceId>, properties: Snapshot) -> Self {
        Self::new(instance_id, Command::Update { properties })
    }

    pub fn dispose(instance_id: impl Into<InstanceId>) -> Self {
        Self::new(instance_id, Command::Dispose)
    }

    fn new(instance_id: impl Into<InstanceId>, command: Command) -> Self {
        Self {
            instance_id: instance_id.into(),
            command,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach the state the client already holds to a request.
    pub fn with_state(mut self, resume: Snapshot) -> Self {
        if let Command::Request { state, .. } = &mut self.command {
            *state = Some(resume);
        }
        self
    }
}

/// The verb of an inbound frame and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Request {
        type_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<Snapshot>,
    },
    Update {
        properties: Snapshot,
    },
    Dispose,
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Response {
        instance_id: InstanceId,
        data: Diff,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<PropertyFault>,
    },
    #[serde(rename_all = "camelCase")]
    Reject { instance_id: InstanceId, error: String },
}

impl OutboundFrame {
    pub fn response(instance_id: InstanceId, data: Diff) -> Self {
        Self::Response {
            instance_id,
            data,
            errors: Vec::new(),
        }
    }

    pub fn reject(instance_id: InstanceId, error: impl fmt::Display) -> Self {
        Self::Reject {
            instance_id,
            error: error.to_string(),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Response { instance_id, .. } | Self::Reject { instance_id, .. } => instance_id,
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }

    /// Payload of a response.
    pub fn data(&self) -> Option<&Diff> {
        match self {
            Self::Response { data, .. } => Some(data),
            Self::Reject { .. } => None,
        }
    }
}

/// Byte encoding of frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameCodec {
    #[default]
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl FrameCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    /// Decode an inbound frame, refusing anything over `limit` bytes.
    pub fn decode_inbound(&self, bytes: &[u8], limit: usize) -> Result<InboundFrame, CodecError> {
        if bytes.len() > limit {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }
        self.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Change;
    use serde_json::json;

    #[test]
    fn parses_request_frames() {
        let frame: InboundFrame = FrameCodec::Json
            .decode(br#"{"instanceId":"Person","verb":"request","typeName":"Person"}"#)
            .unwrap();

        assert_eq!(frame, InboundFrame::request("Person", "Person"));
    }

    #[test]
    fn parses_update_frames_with_headers() {
        let frame: InboundFrame = FrameCodec::Json
            .decode(
                br#"{
                    "instanceId": "Person",
                    "verb": "update",
                    "properties": {"FirstName": "John"},
                    "headers": {"Authorization": "Bearer abc"}
                }"#,
            )
            .unwrap();

        let Command::Update { properties } = &frame.command else {
            panic!("expected update, got {:?}", frame.command);
        };
        assert_eq!(properties["FirstName"], json!("John"));
        assert_eq!(frame.headers["Authorization"], "Bearer abc");
    }

    #[test]
    fn parses_request_with_resume_state() {
        let frame: InboundFrame = FrameCodec::Json
            .decode(
                br#"{"instanceId":"P","verb":"request","typeName":"Person","state":{"FirstName":"Hello"}}"#,
            )
            .unwrap();

        let Command::Request { state: Some(state), .. } = frame.command else {
            panic!("expected resume state");
        };
        assert_eq!(state["FirstName"], json!("Hello"));
    }

    #[test]
    fn parses_dispose_frames() {
        let frame: InboundFrame = FrameCodec::Json
            .decode(br#"{"instanceId":"Person","verb":"dispose"}"#)
            .unwrap();
        assert_eq!(frame, InboundFrame::dispose("Person"));
    }

    #[test]
    fn rejects_unknown_verbs() {
        let result: Result<InboundFrame, _> =
            FrameCodec::Json.decode(br#"{"instanceId":"Person","verb":"explode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn outbound_frames_serialize_camel_case() {
        let mut data = Diff::new();
        data.insert("FirstName", Change::Set(json!("John")));
        let frame = OutboundFrame::response(InstanceId::new("Person"), data);

        let encoded: serde_json::Value =
            serde_json::from_slice(&FrameCodec::Json.encode(&frame).unwrap()).unwrap();
        assert_eq!(encoded, json!({"instanceId": "Person", "data": {"FirstName": "John"}}));

        let reject = OutboundFrame::reject(InstanceId::new("Person"), "access denied");
        let encoded: serde_json::Value =
            serde_json::from_slice(&FrameCodec::Json.encode(&reject).unwrap()).unwrap();
        assert_eq!(encoded, json!({"instanceId": "Person", "error": "access denied"}));
    }

    #[test]
    fn removed_survives_json_round_trip() {
        let mut data = Diff::new();
        data.insert("Gone", Change::Removed);
        data.insert("Kept", Change::Set(json!(1)));
        let frame = OutboundFrame::response(InstanceId::new("Person"), data);

        let bytes = FrameCodec::Json.encode(&frame).unwrap();
        let decoded: OutboundFrame = FrameCodec::Json.decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.data().unwrap().get("Gone"), Some(&Change::Removed));
    }

    #[test]
    fn msgpack_carries_inbound_frames() {
        let mut properties = Snapshot::new();
        properties.insert("Age".into(), json!(42));
        let frame = InboundFrame::update("Person", properties).with_header("x-trace", "1");

        let bytes = FrameCodec::MessagePack.encode(&frame).unwrap();
        let decoded = FrameCodec::MessagePack.decode_inbound(&bytes, 1024).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn oversized_frames_are_refused() {
        let bytes = vec![b' '; 64];
        let err = FrameCodec::Json.decode_inbound(&bytes, 16).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { size: 64, limit: 16 }));
    }
}
