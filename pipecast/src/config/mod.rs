use config::{Config, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::utils::log;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipecast.toml";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalingMode {
    Stdio,
    Websocket,
}

/// How the answer is printed in stdio mode. Offers are accepted in either
/// form.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StdioEncoding {
    Json,
    Base64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SignalingConfig {
    pub mode: SignalingMode,
    pub url: String,
    pub stdio_encoding: StdioEncoding,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Term,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// msid stream label shared by the outbound tracks.
    pub stream_id: String,
}

/// How the external capture/encode process is launched.
///
/// Any argument containing `{device}` has it replaced by `device` before the
/// process is spawned.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProducerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub device: String,
    pub max_chunk_size: usize,
    pub idle_backoff_ms: u64,
}

impl ProducerConfig {
    pub fn resolved_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{device}", &self.device))
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub log: LogConfig,
    pub rtc: RtcConfig,
    pub producer: ProducerConfig,
}

// 全局配置实例
pub static CONFIG: Lazy<Arc<RwLock<AppConfig>>> =
    Lazy::new(|| Arc::new(RwLock::new(AppConfig::default())));

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            mode: SignalingMode::Stdio,
            url: "ws://127.0.0.1:8080/ws".to_string(),
            stdio_encoding: StdioEncoding::Base64,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Term,
        }
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
            stream_id: "pipecast".to_string(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        let args = [
            "-f", "avfoundation", "-re", "-i", "{device}", "-c:v", "libvpx", "-b:v", "1M",
            "-c:a", "libvorbis", "-f", "webm", "pipe:",
        ];
        Self {
            command: "ffmpeg".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            device: "1:".to_string(),
            max_chunk_size: 512 * 1024,
            idle_backoff_ms: 10,
        }
    }
}

impl AppConfig {
    /// Layers an optional TOML file under `PIPECAST__*` environment variables.
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(Environment::with_prefix("PIPECAST").separator("__"))
            .build()?;

        let cfg: AppConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads `config_path` and publishes it as the process-wide [`CONFIG`].
    pub async fn init(config_path: &str) -> Result<(), ConfigError> {
        let loaded = Self::load(config_path)?;
        let mut config = CONFIG.write().await;
        *config = loaded;
        Ok(())
    }

    /// Snapshot of the published configuration.
    pub async fn current() -> Self {
        CONFIG.read().await.clone()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if log::parse_level(&self.log.level).is_none() {
            return Err(ConfigError::Message(format!(
                "log.level `{}` is not one of critical, error, warning, info, debug, trace",
                self.log.level
            )));
        }
        if self.rtc.ice_servers.iter().all(|s| s.urls.is_empty()) {
            return Err(ConfigError::Message(
                "rtc.ice_servers must list at least one discovery server".to_string(),
            ));
        }
        if self.producer.command.is_empty() {
            return Err(ConfigError::Message("producer.command is empty".to_string()));
        }
        if self.producer.max_chunk_size == 0 {
            return Err(ConfigError::Message(
                "producer.max_chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
