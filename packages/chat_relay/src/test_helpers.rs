use std::sync::Arc;
use std::time::Duration;

use gateway_client::{GatewayClient, GatewayConfig};

use crate::AppState;
use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;

/// Gateway settings pointing at a port nothing listens on, so every
/// connect attempt fails fast.
pub fn unreachable_gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::new("ws://127.0.0.1:9");
    config.connect_timeout = Duration::from_secs(2);
    config.request_timeout = Duration::from_secs(2);
    config.backoff_base = Duration::from_millis(50);
    config.backoff_max = Duration::from_millis(200);
    config
}

/// Build a fully-wired `AppState` whose gateway can never connect.
/// Must be called inside a tokio runtime.
pub fn test_app_state() -> AppState {
    AppState {
        gateway: GatewayClient::spawn(unreachable_gateway_config()),
        relay_config: Arc::new(RelayConfig::default()),
        metrics: Arc::new(RelayMetrics::new()),
    }
}
