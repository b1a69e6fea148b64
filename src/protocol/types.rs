//! Typed payloads for the gateway methods and events the bridge uses

use serde::{Deserialize, Serialize};

/// Reserved request id for the connect handshake, outside the counter space
pub const CONNECT_REQUEST_ID: &str = "connect-1";

/// Protocol version spoken on the wire (offered as both bounds)
pub const PROTOCOL_VERSION: u32 = 3;

/// Method names
pub mod methods {
    /// Connect handshake
    pub const CONNECT: &str = "connect";
    /// Start a chat run
    pub const CHAT_SEND: &str = "chat.send";
}

/// Event names
pub mod events {
    /// Handshake trigger pushed right after the transport opens
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    /// Streaming event carrying a cumulative text snapshot for a run
    pub const AGENT: &str = "agent";
    /// Run lifecycle event
    pub const CHAT: &str = "chat";
}

/// Chat run lifecycle states carried by `chat` events
pub mod chat_states {
    /// Run finished normally
    pub const FINAL: &str = "final";
    /// Run failed
    pub const ERROR: &str = "error";
    /// Run was cancelled
    pub const ABORTED: &str = "aborted";
}

// ============================================================================
// Connect
// ============================================================================

/// Client descriptor sent in the connect handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client identifier
    pub id: String,
    /// Client version
    pub version: String,
    /// Platform name
    pub platform: String,
    /// Operating mode
    pub mode: String,
}

/// Auth section of the connect params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    /// Shared gateway token
    pub token: String,
}

/// Params for the `connect` method
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Lowest protocol version we accept
    pub min_protocol: u32,
    /// Highest protocol version we accept
    pub max_protocol: u32,
    /// Client descriptor
    pub client: ClientInfo,
    /// Requested role
    pub role: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Capability list (none for the bridge)
    pub caps: Vec<String>,
    /// Command list (none for the bridge)
    pub commands: Vec<String>,
    /// Permission map (empty for the bridge)
    pub permissions: serde_json::Value,
    /// Authentication
    pub auth: ConnectAuth,
    /// Locale tag
    pub locale: String,
    /// User agent string
    pub user_agent: String,
}

impl ConnectParams {
    /// Build the operator-role connect params the bridge always sends
    pub fn operator(token: String) -> Self {
        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: "gateway-client".to_string(),
                version: crate::VERSION.to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: "backend".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            caps: vec![],
            commands: vec![],
            permissions: serde_json::json!({}),
            auth: ConnectAuth { token },
            locale: "en-US".to_string(),
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
        }
    }
}

/// Payload of a successful connect response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelloPayload {
    /// Payload marker; `hello-ok` completes the handshake
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// State snapshot sent along with the hello
    #[serde(default)]
    pub snapshot: Option<HelloSnapshot>,
}

/// Snapshot section of the hello payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloSnapshot {
    /// Session defaults advertised by the gateway
    #[serde(default)]
    pub session_defaults: Option<SessionDefaults>,
}

/// Session defaults advertised by the gateway
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefaults {
    /// Key of the gateway's main session
    #[serde(default)]
    pub main_session_key: Option<String>,
}

impl HelloPayload {
    /// True when the payload marks a completed handshake
    pub fn is_hello_ok(&self) -> bool {
        self.kind.as_deref() == Some("hello-ok")
    }

    /// Negotiated session key, falling back to "main"
    pub fn session_key(&self) -> String {
        self.snapshot
            .as_ref()
            .and_then(|s| s.session_defaults.as_ref())
            .and_then(|d| d.main_session_key.clone())
            .unwrap_or_else(|| "main".to_string())
    }
}

// ============================================================================
// Chat
// ============================================================================

/// Params for the `chat.send` method
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    /// Target session key, negotiated at handshake
    pub session_key: String,
    /// User message text
    pub message: String,
    /// Fresh token making gateway-side retries safe
    pub idempotency_key: String,
}

/// Payload of a successful `chat.send` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendAck {
    /// Server-issued run id
    #[serde(default)]
    pub run_id: Option<String>,
}

// ============================================================================
// Events
// ============================================================================

/// Payload of an `agent` streaming event
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventPayload {
    /// Run id (older gateways send it as `run`)
    #[serde(default, alias = "run")]
    pub run_id: Option<String>,
    /// Stream name; assistant text arrives on `assistant`
    #[serde(default)]
    pub stream: Option<String>,
    /// Cumulative content snapshot
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Payload of a `chat` lifecycle event
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    /// Run id
    #[serde(default)]
    pub run_id: Option<String>,
    /// Lifecycle state, see [`chat_states`]
    #[serde(default)]
    pub state: Option<String>,
    /// Error detail for error/aborted states
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Extract the cumulative text from an agent event's data field.
///
/// Accepts a plain string, an object with a string `content` or `text`
/// field, or an object whose `content` is an array of typed blocks (blocks
/// with `type == "text"` are concatenated). Anything else yields an empty
/// string.
pub fn extract_text_content(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(obj) => {
            if let Some(serde_json::Value::String(content)) = obj.get("content") {
                return content.clone();
            }
            if let Some(serde_json::Value::String(text)) = obj.get("text") {
                return text.clone();
            }
            if let Some(serde_json::Value::Array(blocks)) = obj.get("content") {
                return blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect();
            }
            String::new()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_params_wire_shape() {
        let params = ConnectParams::operator("tok".to_string());
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["minProtocol"], 3);
        assert_eq!(value["maxProtocol"], 3);
        assert_eq!(value["client"]["id"], "gateway-client");
        assert_eq!(value["client"]["mode"], "backend");
        assert_eq!(value["role"], "operator");
        assert_eq!(value["scopes"], json!(["operator.read", "operator.write"]));
        assert_eq!(value["auth"]["token"], "tok");
        assert!(value["userAgent"].as_str().unwrap().starts_with("clawbridge/"));
    }

    #[test]
    fn test_hello_payload_session_key() {
        let payload: HelloPayload = serde_json::from_value(json!({
            "type": "hello-ok",
            "snapshot": {"sessionDefaults": {"mainSessionKey": "agent:main"}}
        }))
        .unwrap();
        assert!(payload.is_hello_ok());
        assert_eq!(payload.session_key(), "agent:main");
    }

    #[test]
    fn test_hello_payload_defaults_to_main() {
        let payload: HelloPayload =
            serde_json::from_value(json!({"type": "hello-ok"})).unwrap();
        assert_eq!(payload.session_key(), "main");

        let payload: HelloPayload = serde_json::from_value(json!({
            "type": "hello-ok",
            "snapshot": {"sessionDefaults": {}}
        }))
        .unwrap();
        assert_eq!(payload.session_key(), "main");
    }

    #[test]
    fn test_agent_payload_accepts_run_alias() {
        let payload: AgentEventPayload = serde_json::from_value(json!({
            "run": "r1",
            "stream": "assistant",
            "data": "hi"
        }))
        .unwrap();
        assert_eq!(payload.run_id.as_deref(), Some("r1"));

        let payload: AgentEventPayload = serde_json::from_value(json!({
            "runId": "r2",
            "stream": "assistant"
        }))
        .unwrap();
        assert_eq!(payload.run_id.as_deref(), Some("r2"));
    }

    #[test]
    fn test_chat_payload_camel_case_error_message() {
        let payload: ChatEventPayload = serde_json::from_value(json!({
            "runId": "r1",
            "state": "aborted",
            "errorMessage": "user cancelled"
        }))
        .unwrap();
        assert_eq!(payload.state.as_deref(), Some(chat_states::ABORTED));
        assert_eq!(payload.error_message.as_deref(), Some("user cancelled"));
    }

    #[test]
    fn test_extract_text_plain_string() {
        assert_eq!(extract_text_content(&json!("hello")), "hello");
    }

    #[test]
    fn test_extract_text_content_field() {
        assert_eq!(extract_text_content(&json!({"content": "hi"})), "hi");
    }

    #[test]
    fn test_extract_text_text_field() {
        assert_eq!(extract_text_content(&json!({"text": "hi"})), "hi");
    }

    #[test]
    fn test_extract_text_prefers_content_over_text() {
        let data = json!({"content": "a", "text": "b"});
        assert_eq!(extract_text_content(&data), "a");
    }

    #[test]
    fn test_extract_text_block_array() {
        let data = json!({
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "name": "calc"},
                {"type": "text", "text": " world"}
            ]
        });
        assert_eq!(extract_text_content(&data), "Hello world");
    }

    #[test]
    fn test_extract_text_unknown_shape() {
        assert_eq!(extract_text_content(&json!(42)), "");
        assert_eq!(extract_text_content(&json!({"foo": "bar"})), "");
        assert_eq!(extract_text_content(&json!(null)), "");
    }
}
