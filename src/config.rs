//! Configuration management for clawbridge
//!
//! Loads configuration from environment variables.

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Upstream gateway (WebSocket) configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway
    pub url: String,
    /// Token presented during the connect handshake
    pub token: SecretString,
    /// TCP port probed before the first dial (defaults to the URL's port)
    pub ready_port: Option<u16>,
    /// How long to wait for the ready port, in seconds
    pub ready_timeout_secs: u64,
    /// Reconnect budget for the whole session
    pub reconnect_max_attempts: u32,
    /// Backoff base in seconds; the delay doubles on each attempt
    pub reconnect_base_secs: u64,
}

impl GatewayConfig {
    /// Host and port probed for gateway readiness
    pub fn ready_addr(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("Invalid gateway URL {}: {}", self.url, e)))?;
        let host = url.host_str().unwrap_or("127.0.0.1").to_string();
        let port = self
            .ready_port
            .or_else(|| url.port_or_known_default())
            .unwrap_or(80);
        Ok((host, port))
    }
}

/// Bridge HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bearer token required on bridge routes (None disables auth)
    pub auth_token: Option<SecretString>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream gateway settings
    pub gateway: GatewayConfig,
    /// Bridge server settings
    pub server: ServerConfig,
    /// Logging settings
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Config {
            gateway: GatewayConfig {
                url: std::env::var("GATEWAY_WS_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:18789".to_string()),
                token: SecretString::from(
                    std::env::var("OPENCLAW_GATEWAY_TOKEN").unwrap_or_default(),
                ),
                ready_port: std::env::var("GATEWAY_READY_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                ready_timeout_secs: std::env::var("GATEWAY_READY_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
                reconnect_max_attempts: std::env::var("GATEWAY_RECONNECT_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                reconnect_base_secs: std::env::var("GATEWAY_RECONNECT_BASE_SECS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .unwrap_or(1),
            },
            server: ServerConfig {
                auth_token: std::env::var("BRIDGE_AUTH_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty())
                    .map(SecretString::from),
            },
            log: LogConfig {
                level: std::env::var("RUST_LOG")
                    .unwrap_or_else(|_| "info,clawbridge=debug".to_string()),
                format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            },
        })
    }

    /// Create a minimal config for testing
    pub fn minimal() -> Self {
        Config {
            gateway: GatewayConfig {
                url: "ws://127.0.0.1:18789".to_string(),
                token: SecretString::from(""),
                ready_port: None,
                ready_timeout_secs: 120,
                reconnect_max_attempts: 3,
                reconnect_base_secs: 1,
            },
            server: ServerConfig { auth_token: None },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Validate that all required configuration is present
    pub fn validate(&self) -> Result<()> {
        if self.gateway.token.expose_secret().is_empty() {
            return Err(Error::Config(
                "OPENCLAW_GATEWAY_TOKEN is required".to_string(),
            ));
        }
        let url = Url::parse(&self.gateway.url)
            .map_err(|e| Error::Config(format!("Invalid gateway URL {}: {}", self.gateway.url, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::Config(format!(
                "Gateway URL must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Config::minimal();
        assert!(config.validate().is_err()); // Should fail validation
    }

    #[test]
    fn test_validate_rejects_non_ws_url() {
        let mut config = Config::minimal();
        config.gateway.token = SecretString::from("tok");
        config.gateway.url = "http://127.0.0.1:18789".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_wss_url() {
        let mut config = Config::minimal();
        config.gateway.token = SecretString::from("tok");
        config.gateway.url = "wss://gateway.example.com:18789".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ready_addr_from_url() {
        let config = Config::minimal();
        let (host, port) = config.gateway.ready_addr().unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 18789);
    }

    #[test]
    fn test_ready_addr_override() {
        let mut config = Config::minimal();
        config.gateway.ready_port = Some(9999);
        let (_, port) = config.gateway.ready_addr().unwrap();
        assert_eq!(port, 9999);
    }

    #[test]
    fn test_ready_addr_scheme_default_port() {
        let mut config = Config::minimal();
        config.gateway.url = "wss://gateway.example.com".to_string();
        let (host, port) = config.gateway.ready_addr().unwrap();
        assert_eq!(host, "gateway.example.com");
        assert_eq!(port, 443);
    }
}
