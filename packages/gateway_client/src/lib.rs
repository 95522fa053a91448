//! Gateway Client - multiplexed WebSocket connection to the agent gateway
//!
//! One supervising task owns the socket. It performs the challenge/hello
//! handshake, watches heartbeats, reconnects with backoff, matches responses
//! to requests, and fans chat run events out to per-run streams.
//! [`GatewayClient`] is a cheap handle to that task.
//!
//! # Example
//!
//! ```no_run
//! use gateway_client::{ChatSendParams, GatewayClient, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gateway_client::GatewayError> {
//!     let client = GatewayClient::spawn(GatewayConfig::new("ws://127.0.0.1:18789"));
//!     client.ensure_connected().await?;
//!
//!     let (ack, mut run) = client
//!         .chat_send(ChatSendParams {
//!             session_key: "main".to_string(),
//!             message: "Show me my contacts".to_string(),
//!             idempotency_key: uuid::Uuid::new_v4().to_string(),
//!             timeout_ms: None,
//!             attachments: None,
//!         })
//!         .await?;
//!
//!     println!("run {}", ack.run_id);
//!     while let Some(event) = run.next_event().await {
//!         println!("{:?}: {:?}", event.state, event.text());
//!     }
//!     Ok(())
//! }
//! ```

mod backoff;
mod client;
mod config;
mod correlator;
mod dispatcher;
mod error;
mod link;
pub mod protocol;
mod stream;
mod supervisor;

pub use backoff::Backoff;
pub use client::{ConnectionState, ConnectionStatus, GatewayClient};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use protocol::{
    ChatAbortParams, ChatAbortResult, ChatEvent, ChatHistory, ChatHistoryParams,
    ChatInjectParams, ChatInjectResult, ChatSendAck, ChatSendParams, ChatState,
};
pub use stream::ChatRunStream;
