use crate::{decoder::DecodeError, detection::DetectionRecord, detector::DetectionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const FALLBACK_REPLY: &str = r#"{"error":"Internal error"}"#;

/// Client to server: `{"image": "<base64>"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSubmit {
    pub image: String,
}

/// Server to client. Exactly one is sent for every inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    DetectionReply { detections: Vec<DetectionRecord> },
    ProtocolError { error: String },
}

impl ServerMessage {
    pub fn detections(detections: Vec<DetectionRecord>) -> Self {
        ServerMessage::DetectionReply { detections }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::ProtocolError {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::ProtocolError { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize reply: {}", e);
            FALLBACK_REPLY.to_string()
        })
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("No image provided")]
    NoImageProvided,
    #[error("Invalid image: expected a base64 string")]
    ImageNotText,
    #[error("Invalid image: {0}")]
    Decode(#[from] DecodeError),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),
}

impl ProtocolError {
    /// Errors caused by what the client sent, as opposed to detector failures.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ProtocolError::Detection(_))
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson => "invalid_json",
            ProtocolError::NoImageProvided => "no_image",
            ProtocolError::ImageNotText | ProtocolError::Decode(_) => "decode",
            ProtocolError::Detection(DetectionError::Timeout(_)) => "timeout",
            ProtocolError::Detection(_) => "detection",
        }
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::error(err.to_string())
    }
}

/// Parses one text message. Anything that is not JSON is `InvalidJson`; JSON
/// whose `image` member is absent or falsy (`null`, `false`, `""`, `0`) is
/// `NoImageProvided`.
pub fn parse_client_message(text: &str) -> Result<FrameSubmit, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

    let image = match value {
        Value::Object(mut members) => members.remove("image"),
        _ => None,
    };

    match image {
        None | Some(Value::Null) | Some(Value::Bool(false)) => {
            Err(ProtocolError::NoImageProvided)
        }
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Err(ProtocolError::NoImageProvided),
        Some(Value::String(image)) if image.is_empty() => Err(ProtocolError::NoImageProvided),
        Some(Value::String(image)) => Ok(FrameSubmit { image }),
        Some(_) => Err(ProtocolError::ImageNotText),
    }
}

/// Binary frames carry the same JSON document as text frames.
pub fn parse_client_bytes(bytes: &[u8]) -> Result<FrameSubmit, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidJson)?;
    parse_client_message(text)
}
