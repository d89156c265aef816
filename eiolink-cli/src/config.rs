use anyhow::Context;
use config::{Config, Environment, File};
use eiolink_client::Session;
use eiolink_client::protocol::DEFAULT_ENDPOINT_PATH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub keep_alive: KeepAliveConfig,
    pub session: SessionOverrides,
    pub logging: LoggingConfig,
    /// Payloads sent verbatim once the connection is open.
    pub messages: Vec<String>,
}

impl AppConfig {
    pub fn parse() -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name(config_file_path("config.toml")?.as_str()).required(false))
            .add_source(File::with_name("config.toml").required(false))
            .add_source(
                Environment::with_prefix("eiolink")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build config")?
            .try_deserialize::<Self>()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.base_url.trim().is_empty() {
            anyhow::bail!("Server base URL is empty");
        } else if self.keep_alive.interval_millis == Some(0) {
            anyhow::bail!("Keep-alive interval must be greater than zero");
        }
        Ok(())
    }
}

pub fn config_file_path(file_name: impl AsRef<Path>) -> anyhow::Result<String> {
    Ok(Path::new("/etc")
        .join("eiolink")
        .join(file_name)
        .to_str()
        .context("Failed to build config file path")?
        .to_string())
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    pub endpoint_path: String,
    pub handshake_timeout_millis: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "".to_string(),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            handshake_timeout_millis: 10000,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_millis)
    }
}

/// Keep-alive overrides. Unset values use the session's timing.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KeepAliveConfig {
    pub interval_millis: Option<u64>,
    pub timeout_millis: Option<u64>,
}

impl KeepAliveConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_millis.map(Duration::from_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_millis.map(Duration::from_millis)
    }
}

/// Session values known ahead of time. With a `sid` the handshake is skipped entirely, otherwise
/// the remaining values fill whatever the handshake left out.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SessionOverrides {
    pub sid: Option<String>,
    pub ping_interval_millis: Option<u64>,
    pub ping_timeout_millis: Option<u64>,
}

impl SessionOverrides {
    pub fn skips_handshake(&self) -> bool {
        self.sid.as_deref().is_some_and(|sid| !sid.is_empty())
    }

    pub fn apply(&self, mut session: Session) -> Session {
        if let Some(sid) = &self.sid {
            session = session.with_sid(sid.clone());
        }
        if let Some(millis) = self.ping_interval_millis {
            session = session.with_ping_interval(Duration::from_millis(millis));
        }
        if let Some(millis) = self.ping_timeout_millis {
            session = session.with_ping_timeout(Duration::from_millis(millis));
        }
        session
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directives, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "eiolink=info,eiolink_client=info".to_string(),
        }
    }
}
