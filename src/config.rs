use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::{Validate, ValidationError};

/// Config file used when none is given
pub const DEFAULT_FILE: &str = "config.toml";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Server and durable store settings
    #[serde(rename = "exp", default)]
    #[validate(nested)]
    pub server: ServerConfig,

    /// Route definitions
    #[serde(default)]
    #[validate(nested)]
    pub routes: Vec<RouteConfig>,

    /// Downstream broker settings
    #[serde(default)]
    #[validate(nested)]
    pub mqtt: MqttConfig,

    /// Stream cache tuning
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    /// File the configuration was read from
    #[serde(skip)]
    pub file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            ServerConfig::default(),
            Vec::new(),
            MqttConfig::default(),
            None,
        )
    }
}

impl Config {
    pub fn new(
        server: ServerConfig,
        routes: Vec<RouteConfig>,
        mqtt: MqttConfig,
        file: Option<PathBuf>,
    ) -> Self {
        Self {
            server,
            routes,
            mqtt,
            cache: CacheConfig::default(),
            file: file.unwrap_or_else(|| PathBuf::from(DEFAULT_FILE)),
        }
    }

    /// Load configuration from file and environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Config = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            // Override with environment variables (prefix: EXPORT_)
            .add_source(
                config::Environment::with_prefix("EXPORT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.file = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML, falling back to JSON
    pub fn read_bytes(data: &[u8]) -> Result<Self> {
        let toml_err = match std::str::from_utf8(data) {
            Ok(text) => match toml::from_str::<Config>(text) {
                Ok(config) => {
                    config.validate()?;
                    return Ok(config);
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        let config: Config = serde_json::from_slice(data).map_err(|json_err| {
            AppError::Configuration(format!(
                "Error unmarshaling config content: toml: {}; json: {}",
                toml_err, json_err
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Store config in its file
    pub fn save(&self) -> Result<()> {
        let body = toml::to_string_pretty(self)?;
        let file = if self.file.as_os_str().is_empty() {
            Path::new(DEFAULT_FILE)
        } else {
            self.file.as_path()
        };
        std::fs::write(file, body)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for buffer space, slowing the bus subscriber down
    #[default]
    Block,
    /// Drop the message and count it
    Drop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Publish straight after processing
    Direct,
    /// Stage every message in the stream cache
    Cached,
    /// Publish straight away, stage only on publish failure
    #[default]
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// NATS server URL
    #[serde(rename = "nats", default = "default_nats_url")]
    #[validate(length(min = 1))]
    pub nats_url: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Metrics and health port
    #[serde(default = "default_port")]
    pub port: String,

    /// Redis address
    #[serde(default = "default_cache_url")]
    pub cache_url: String,

    #[serde(default)]
    pub cache_pass: String,

    /// Redis database index
    #[serde(default = "default_cache_db")]
    pub cache_db: String,

    /// Capacity of each route buffer
    #[serde(default = "default_buffer_size")]
    #[validate(range(min = 1))]
    pub buffer_size: usize,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    #[serde(default)]
    pub delivery: DeliveryMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            log_level: default_log_level(),
            json_logs: false,
            port: default_port(),
            cache_url: default_cache_url(),
            cache_pass: String::new(),
            cache_db: default_cache_db(),
            buffer_size: default_buffer_size(),
            backpressure: BackpressurePolicy::default(),
            delivery: DeliveryMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MqttConfig {
    /// Broker address, `tcp://host:port` or `ssl://host:port`
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Present a client certificate
    #[serde(default)]
    pub mtls: bool,

    /// Skip broker certificate verification
    #[serde(default)]
    pub skip_tls_ver: bool,

    #[serde(default)]
    pub retain: bool,

    #[serde(default)]
    #[validate(range(max = 2))]
    pub qos: u8,

    /// Channel used to build `channels/<channel>/messages/...` topics
    #[serde(default)]
    pub channel: String,

    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    #[serde(default)]
    pub priv_key_path: Option<PathBuf>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            username: String::new(),
            password: String::new(),
            mtls: false,
            skip_tls_ver: false,
            retain: false,
            qos: 0,
            channel: String::new(),
            ca_path: None,
            cert_path: None,
            priv_key_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_route_filter"))]
pub struct RouteConfig {
    /// Destination topic
    #[validate(length(min = 1))]
    pub mqtt_topic: String,

    /// Source subject pattern
    #[validate(length(min = 1))]
    pub nats_topic: String,

    #[serde(default)]
    pub subtopic: String,

    /// Transform applied by the route: `mfx` or `plain`
    #[serde(rename = "type", default)]
    pub route_type: String,

    #[serde(default = "default_workers")]
    #[validate(range(min = 1))]
    pub workers: usize,
}

fn validate_route_filter(route: &RouteConfig) -> std::result::Result<(), ValidationError> {
    if route.nats_topic.is_empty() {
        // Reported by the field rule
        return Ok(());
    }

    let filter = crate::routes::subject::route_filter(&route.nats_topic, &route.subtopic);
    crate::routes::subject::check_filter(&filter).map_err(|reason| {
        let mut err = ValidationError::new("route_filter");
        err.message = Some(reason.into());
        err
    })
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            mqtt_topic: String::new(),
            nats_topic: String::new(),
            subtopic: String::new(),
            route_type: String::new(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    /// Approximate maximum stream length
    #[serde(default = "default_stream_len")]
    #[validate(range(min = 1))]
    pub stream_len: usize,

    /// Prefix prepended to the destination topic to name a route's stream
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    #[serde(default = "default_group")]
    #[validate(length(min = 1))]
    pub group: String,

    #[serde(default = "default_consumer")]
    #[validate(length(min = 1))]
    pub consumer: String,

    /// Pending entries idle longer than this are re-claimed (milliseconds)
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    /// Upper bound on one blocking read (milliseconds)
    #[serde(default = "default_read_block_ms")]
    #[validate(range(min = 1))]
    pub read_block_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stream_len: default_stream_len(),
            stream_prefix: default_stream_prefix(),
            group: default_group(),
            consumer: default_consumer(),
            claim_idle_ms: default_claim_idle_ms(),
            read_block_ms: default_read_block_ms(),
        }
    }
}

// Default value functions
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "8170".to_string()
}

fn default_cache_url() -> String {
    "localhost:6379".to_string()
}

fn default_cache_db() -> String {
    "0".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_mqtt_host() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_workers() -> usize {
    10
}

fn default_stream_len() -> usize {
    crate::cache::DEFAULT_STREAM_LEN
}

fn default_stream_prefix() -> String {
    "export:".to_string()
}

fn default_group() -> String {
    "export".to_string()
}

fn default_consumer() -> String {
    "export-consumer".to_string()
}

fn default_claim_idle_ms() -> u64 {
    30_000
}

fn default_read_block_ms() -> u64 {
    5_000
}
