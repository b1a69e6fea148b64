//! Gateway frame envelope
//!
//! Wire format of a frame: a JSON object whose `type` field selects the
//! variant. Unknown `type` values fail to parse and are dropped by the
//! session's read loop.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level gateway frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Request (client to gateway)
    #[serde(rename = "req")]
    Request(RequestFrame),
    /// Response to a request (gateway to client)
    #[serde(rename = "res")]
    Response(ResponseFrame),
    /// Event pushed by the gateway
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl GatewayFrame {
    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound text frame
    pub fn parse(text: &str) -> Result<GatewayFrame> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Request id, unique among requests currently in flight
    pub id: String,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestFrame {
    /// Create a request frame
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request this responds to
    pub id: String,
    /// Whether the request succeeded
    #[serde(default)]
    pub ok: bool,
    /// Result payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error details on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl ResponseFrame {
    /// Upstream error message, or the generic fallback
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| "Request failed".to_string())
    }
}

/// Event frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Error details carried by a failed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Machine-readable code, when the gateway provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_serialization() {
        let frame = GatewayFrame::Request(RequestFrame::new("1", "chat.send", json!({"x": 1})));
        let text = frame.to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["id"], "1");
        assert_eq!(value["method"], "chat.send");
        assert_eq!(value["params"]["x"], 1);
    }

    #[test]
    fn test_parse_ok_response() {
        let text = r#"{"type":"res","id":"7","ok":true,"payload":{"runId":"r1"}}"#;
        match GatewayFrame::parse(text).unwrap() {
            GatewayFrame::Response(res) => {
                assert_eq!(res.id, "7");
                assert!(res.ok);
                assert_eq!(res.payload.unwrap()["runId"], "r1");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_response() {
        let text = r#"{"type":"res","id":"7","ok":false,"error":{"code":"busy","message":"session busy"}}"#;
        match GatewayFrame::parse(text).unwrap() {
            GatewayFrame::Response(res) => {
                assert!(!res.ok);
                assert_eq!(res.error_message(), "session busy");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_error_message_fallback() {
        let text = r#"{"type":"res","id":"7","ok":false}"#;
        match GatewayFrame::parse(text).unwrap() {
            GatewayFrame::Response(res) => assert_eq!(res.error_message(), "Request failed"),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_event_without_payload() {
        let text = r#"{"type":"event","event":"connect.challenge"}"#;
        match GatewayFrame::parse(text).unwrap() {
            GatewayFrame::Event(event) => {
                assert_eq!(event.event, "connect.challenge");
                assert!(event.payload.is_null());
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(GatewayFrame::parse(r#"{"type":"ping","id":"1"}"#).is_err());
        assert!(GatewayFrame::parse("not json").is_err());
    }
}
