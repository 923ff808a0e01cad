use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_FRONTEND: &str = "./web/build";
pub const DEFAULT_CONFIG_FILE: &str = "logproxy.toml";
pub const EVENTS_PATH: &str = "/events/";
pub const SSE_EVENT_NAME: &str = "log";
pub const DEFAULT_QUEUE_DEPTH: usize = 256; // per-consumer outbound queue
pub const DEFAULT_BUS_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_CONSUMERS: usize = 256;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024; // same cap as a default line scanner

/// Top-level config (logproxy.toml + LOGPROXY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogproxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Viewer frontend: an `http://` / `https://` URL is reverse-proxied,
    /// `embedded` serves the built-in page, anything else is a directory.
    /// Empty means the default directory.
    /// Override with env var: LOGPROXY_FRONTEND
    #[serde(default = "default_frontend")]
    pub frontend: String,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Default for LogproxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            frontend: default_frontend(),
            broadcast: BroadcastConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// When the bus drain loop is spawned.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartMode {
    /// At process init, before any viewer connects.
    #[default]
    Eager,
    /// On the first consumer registration.
    Lazy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Outbound queue depth per consumer; a full queue drops events for
    /// that consumer only.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Capacity of the ingest → broadcast channel.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    #[serde(default = "default_max_consumers")]
    pub max_consumers: usize,
    /// Evict a consumer after this many consecutive drops. Unset = never.
    #[serde(default)]
    pub evict_after_drops: Option<u32>,
    #[serde(default)]
    pub start: StartMode,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            max_consumers: DEFAULT_MAX_CONSUMERS,
            evict_after_drops: None,
            start: StartMode::Eager,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Longer lines are truncated; the remainder is discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Echo every ingested line to the diagnostic log.
    #[serde(default = "bool_true")]
    pub echo: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            echo: true,
        }
    }
}

/// Where viewer UI requests are routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendTarget {
    /// Serve files from a directory (SPA fallback to index.html).
    Directory(std::path::PathBuf),
    /// Reverse-proxy to a dev server, e.g. `http://localhost:3000/`.
    Proxy(String),
    /// The viewer page compiled into the binary.
    Embedded,
}

impl FrontendTarget {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            FrontendTarget::Proxy(raw.trim_end_matches('/').to_string())
        } else if raw.eq_ignore_ascii_case("embedded") {
            FrontendTarget::Embedded
        } else if raw.is_empty() {
            FrontendTarget::Directory(DEFAULT_FRONTEND.into())
        } else {
            FrontendTarget::Directory(raw.into())
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_frontend() -> String {
    DEFAULT_FRONTEND.to_string()
}
fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}
fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
}
fn default_max_consumers() -> usize {
    DEFAULT_MAX_CONSUMERS
}
fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}
fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

impl LogproxyConfig {
    /// Load config from a TOML file with LOGPROXY_* env var overrides.
    ///
    /// File lookup order:
    ///   1. Explicit path argument
    ///   2. LOGPROXY_CONFIG env var
    ///   3. ./logproxy.toml (skipped silently when absent)
    ///
    /// Nested keys use a double underscore: LOGPROXY_BROADCAST__QUEUE_DEPTH=64.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("LOGPROXY_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let figment = Figment::from(Serialized::defaults(LogproxyConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("LOGPROXY_").ignore(&["config"]).split("__"));

        Self::from_figment(figment)
    }

    /// Extract and validate from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: LogproxyConfig = figment
            .extract()
            .map_err(|e| crate::error::LogproxyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let checks = [
            ("broadcast.queue_depth", self.broadcast.queue_depth),
            ("broadcast.bus_capacity", self.broadcast.bus_capacity),
            ("broadcast.max_consumers", self.broadcast.max_consumers),
            ("ingest.max_line_bytes", self.ingest.max_line_bytes),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(crate::error::LogproxyError::Config(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        if self.broadcast.evict_after_drops == Some(0) {
            return Err(crate::error::LogproxyError::Config(
                "broadcast.evict_after_drops must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn frontend_target(&self) -> FrontendTarget {
        FrontendTarget::parse(&self.frontend)
    }

    /// `bind:port` as configured.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}
