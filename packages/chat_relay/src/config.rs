use anyhow::{Context, Result};
use gateway_client::GatewayConfig;
use gateway_client::protocol::{ClientInfo, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [gateway]
//                    url = "ws://10.0.0.5:18789"
//
//   env var:         CHAT_RELAY_GATEWAY__URL=ws://10.0.0.5:18789
//
//   (single underscore stays within field names: CHAT_RELAY_GATEWAY__CONNECT_TIMEOUT_MS)

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;

/// Named configuration presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// host=127.0.0.1
    Local,
    /// host=0.0.0.0
    Server,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub gateway: GatewayFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Gateway connection settings (lives under `[gateway]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_protocol")]
    pub min_protocol: u32,
    #[serde(default = "default_protocol")]
    pub max_protocol: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Longest gap between two events of one chat run before the run is given up.
    #[serde(default = "default_run_idle_timeout_ms")]
    pub run_idle_timeout_ms: u64,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
            client_id: default_client_id(),
            client_version: default_client_version(),
            platform: default_platform(),
            mode: default_mode(),
            role: default_role(),
            scopes: default_scopes(),
            min_protocol: default_protocol(),
            max_protocol: default_protocol(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            run_idle_timeout_ms: default_run_idle_timeout_ms(),
        }
    }
}

impl GatewayFileConfig {
    /// Runtime view handed to the gateway client.
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.url.clone(),
            token: self.token.clone().filter(|t| !t.is_empty()),
            client: ClientInfo {
                id: self.client_id.clone(),
                version: self.client_version.clone(),
                platform: self.platform.clone(),
                mode: self.mode.clone(),
            },
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            run_idle_timeout: Duration::from_millis(self.run_idle_timeout_ms),
        }
    }
}

/// Relay tunables (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_session_key")]
    pub default_session_key: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Outward events buffered per chat turn before the relay waits on the client.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            default_session_key: default_session_key(),
            keep_alive_secs: default_keep_alive_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}
fn default_client_id() -> String {
    "chat-relay".to_string()
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_platform() -> String {
    std::env::consts::OS.to_string()
}
fn default_mode() -> String {
    "backend".to_string()
}
fn default_role() -> String {
    "operator".to_string()
}
fn default_scopes() -> Vec<String> {
    vec!["operator.read".to_string(), "operator.write".to_string()]
}
fn default_protocol() -> u32 {
    PROTOCOL_VERSION
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_run_idle_timeout_ms() -> u64 {
    120_000
}
fn default_session_key() -> String {
    "main".to_string()
}
fn default_keep_alive_secs() -> u64 {
    15
}
fn default_channel_capacity() -> usize {
    64
}

/// Build a figment that layers: defaults → profile defaults → config.toml → CHAT_RELAY_* env vars.
///
/// The CLI profile takes priority over the config file profile.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_RELAY_GATEWAY__TOKEN=secret`  →  `gateway.token = "secret"`
///   `CHAT_RELAY_RELAY__KEEP_ALIVE_SECS=30`  →  `relay.keep_alive_secs = 30`
pub fn load_config(data_dir: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at profile from config.toml/env (CLI overrides file)
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_RELAY_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: rebuild with profile defaults between struct defaults and config.toml
    let profile_layer = profile_to_file_config(profile.as_ref());

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_layer))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_RELAY_").split("__"))
}

/// Profile defaults as a `FileConfig`. Fields the profile does not set keep
/// their struct defaults so explicit config.toml / env values still win.
fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    let host = match profile {
        Some(Profile::Local) => "127.0.0.1",
        Some(Profile::Server) => "0.0.0.0",
        None => return FileConfig::default(),
    };
    FileConfig {
        profile: profile.cloned(),
        server: ServerFileConfig {
            host: Some(host.to_string()),
            port: None,
        },
        ..Default::default()
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Relay behavior (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Session used when a request names none
    pub default_session_key: String,
    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,
    /// Outward channel size per turn; one slot is held back for `done`
    pub channel_capacity: usize,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            default_session_key: fc.default_session_key.clone(),
            keep_alive: Duration::from_secs(fc.keep_alive_secs.max(1)),
            channel_capacity: fc.channel_capacity.max(2),
        }
    }

    /// The session a request targets: its own key if non-blank, else the default.
    pub fn session_key(&self, requested: Option<String>) -> String {
        requested
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| self.default_session_key.clone())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayDirs {
    pub data_dir: PathBuf,
}

impl RelayDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chat-relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Load and extract the layered configuration for this data directory.
    pub fn load(&self, cli_profile: Option<&Profile>) -> Result<FileConfig> {
        load_config(&self.data_dir, cli_profile)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }
}
