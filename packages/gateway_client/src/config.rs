use std::time::Duration;

use crate::protocol::{AuthParams, ClientInfo, ConnectParams, PROTOCOL_VERSION};

/// Everything the connection manager needs to reach and talk to a gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:18789`.
    pub url: String,
    pub token: Option<String>,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
    /// Budget for socket open + challenge + hello.
    pub connect_timeout: Duration,
    /// Default budget for a single request/response exchange.
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Longest silence tolerated between two events of one chat run.
    pub run_idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            client: ClientInfo {
                id: "chat-relay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: "backend".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            run_idle_timeout: Duration::from_secs(120),
        }
    }
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Params for the handshake's `connect` request.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            auth: AuthParams {
                token: self.token.clone(),
            },
            role: self.role.clone(),
            scopes: self.scopes.clone(),
        }
    }
}
