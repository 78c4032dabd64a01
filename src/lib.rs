//! Live CRUD
//!
//! An item collection API that streams every committed change:
//! - Monotonic sequencing of created/updated/deleted events
//! - Bounded replay window for `Last-Event-ID` / `resume_from` catch-up
//! - Per-subscriber bounded queues with gap detection and forced resync
//! - Server-Sent Events and WebSocket transports over the same hub

pub mod api;
pub mod events;
pub mod items;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub logging: LoggingYamlConfig,
    pub events: EventsYamlConfig,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingYamlConfig {
    pub format: LogFormat,
}

/// Event streaming configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsYamlConfig {
    pub replay_capacity: usize,
    pub replay_max_age_secs: u64,
    pub queue_capacity: usize,
    pub gap_threshold: u64,
    pub sse_keep_alive_secs: u64,
    pub ws_ping_interval_secs: u64,
    pub ws_max_missed_pongs: u32,
    pub ws_resume_timeout_ms: u64,
}

impl Default for EventsYamlConfig {
    fn default() -> Self {
        Self {
            replay_capacity: events::DEFAULT_REPLAY_CAPACITY,
            replay_max_age_secs: events::DEFAULT_REPLAY_MAX_AGE.as_secs(),
            queue_capacity: events::DEFAULT_QUEUE_CAPACITY,
            gap_threshold: events::DEFAULT_GAP_THRESHOLD,
            sse_keep_alive_secs: 15,
            ws_ping_interval_secs: 30,
            ws_max_missed_pongs: 2,
            ws_resume_timeout_ms: 1000,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub log_format: LogFormat,
    pub replay_capacity: usize,
    pub replay_max_age_secs: u64,
    pub queue_capacity: usize,
    pub gap_threshold: u64,
    pub sse_keep_alive_secs: u64,
    pub ws_ping_interval_secs: u64,
    pub ws_max_missed_pongs: u32,
    pub ws_resume_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(YamlConfig::default())
    }
}

/// Read and parse an env var, keeping `fallback` when unset or malformed
fn env_or<T: FromStr>(name: &str, fallback: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}", name, raw);
                fallback
            }
        },
        Err(_) => fallback,
    }
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);
        let base = Self::from_yaml(yaml);

        let config = Self {
            server_host: std::env::var("SERVER_HOST").unwrap_or(base.server_host),
            server_port: env_or("SERVER_PORT", base.server_port),
            log_format: env_or("LOG_FORMAT", base.log_format),
            replay_capacity: env_or("REPLAY_CAPACITY", base.replay_capacity),
            replay_max_age_secs: env_or("REPLAY_MAX_AGE_SECS", base.replay_max_age_secs),
            queue_capacity: env_or("SUBSCRIBER_QUEUE_CAPACITY", base.queue_capacity),
            gap_threshold: env_or("SUBSCRIBER_GAP_THRESHOLD", base.gap_threshold),
            sse_keep_alive_secs: env_or("SSE_KEEP_ALIVE_SECS", base.sse_keep_alive_secs),
            ws_ping_interval_secs: env_or("WS_PING_INTERVAL_SECS", base.ws_ping_interval_secs),
            ws_max_missed_pongs: env_or("WS_MAX_MISSED_PONGS", base.ws_max_missed_pongs),
            ws_resume_timeout_ms: env_or("WS_RESUME_TIMEOUT_MS", base.ws_resume_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        Self {
            server_host: yaml.server.host,
            server_port: yaml.server.port,
            log_format: yaml.logging.format,
            replay_capacity: yaml.events.replay_capacity,
            replay_max_age_secs: yaml.events.replay_max_age_secs,
            queue_capacity: yaml.events.queue_capacity,
            gap_threshold: yaml.events.gap_threshold,
            sse_keep_alive_secs: yaml.events.sse_keep_alive_secs,
            ws_ping_interval_secs: yaml.events.ws_ping_interval_secs,
            ws_max_missed_pongs: yaml.events.ws_max_missed_pongs,
            ws_resume_timeout_ms: yaml.events.ws_resume_timeout_ms,
        }
    }

    /// Reject values that would disable a bound entirely
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.replay_capacity > 0, "replay_capacity must be > 0");
        anyhow::ensure!(self.queue_capacity > 0, "queue_capacity must be > 0");
        anyhow::ensure!(self.gap_threshold > 0, "gap_threshold must be > 0");
        anyhow::ensure!(
            self.ws_ping_interval_secs > 0,
            "ws_ping_interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.sse_keep_alive_secs > 0,
            "sse_keep_alive_secs must be > 0"
        );
        anyhow::ensure!(
            self.replay_max_age_secs > 0,
            "replay_max_age_secs must be > 0"
        );
        anyhow::ensure!(
            self.ws_max_missed_pongs > 0,
            "ws_max_missed_pongs must be > 0"
        );
        anyhow::ensure!(
            self.ws_resume_timeout_ms > 0,
            "ws_resume_timeout_ms must be > 0"
        );
        Ok(())
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn pipeline_config(&self) -> events::PipelineConfig {
        events::PipelineConfig {
            replay_capacity: self.replay_capacity,
            replay_max_age: Duration::from_secs(self.replay_max_age_secs),
            queue_capacity: self.queue_capacity,
            gap_threshold: self.gap_threshold,
        }
    }

    pub fn sse_keep_alive(&self) -> Duration {
        Duration::from_secs(self.sse_keep_alive_secs)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs)
    }

    pub fn ws_resume_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_resume_timeout_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

// ============================================================================
// Logging
// ============================================================================

/// `RUST_LOG` if set, otherwise the server's default levels
pub fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,livecrud=debug,tower_http=debug".into())
}

/// Load the configuration before the global subscriber exists.
///
/// The output format is itself configured, so loading runs under a
/// temporary stderr subscriber and its warnings are not lost.
pub fn load_config(yaml_path: Option<&Path>) -> Result<Config> {
    load_config_logging_to(yaml_path, std::io::stderr)
}

fn load_config_logging_to<W>(yaml_path: Option<&Path>, make_writer: W) -> Result<Config>
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::with_default(bootstrap, || Config::from_yaml_and_env(yaml_path))
}

// ============================================================================
// Server
// ============================================================================

/// Build state and router, bind, and serve until ctrl-c / SIGTERM
pub async fn start_server(config: Config) -> Result<()> {
    let addr = config.bind_addr();
    let state = Arc::new(api::ServerState::new(config));
    let pipeline = state.pipeline.clone();
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Streaming responses only finish once their queues close
            pipeline.shutdown();
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9090

logging:
  format: json

events:
  replay_capacity: 50
  replay_max_age_secs: 60
  queue_capacity: 16
  gap_threshold: 3
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.events.replay_capacity, 50);
        assert_eq!(config.events.gap_threshold, 3);
        // Unset fields keep their defaults
        assert_eq!(config.events.ws_ping_interval_secs, 30);
    }

    #[test]
    fn test_yaml_defaults() {
        let config = YamlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.events.replay_capacity, 1000);
        assert_eq!(config.events.replay_max_age_secs, 300);
        assert_eq!(config.events.queue_capacity, 256);
        assert_eq!(config.events.gap_threshold, 8);
        assert_eq!(config.events.ws_resume_timeout_ms, 1000);
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_pipeline_config_mapping() {
        let config = Config {
            replay_capacity: 10,
            replay_max_age_secs: 5,
            queue_capacity: 4,
            gap_threshold: 2,
            ..Config::default()
        };
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.replay_capacity, 10);
        assert_eq!(pipeline.replay_max_age, Duration::from_secs(5));
        assert_eq!(pipeline.queue_capacity, 4);
        assert_eq!(pipeline.gap_threshold, 2);
        assert_eq!(config.ws_resume_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let zeroed = [
            Config {
                queue_capacity: 0,
                ..Config::default()
            },
            Config {
                replay_max_age_secs: 0,
                ..Config::default()
            },
            Config {
                ws_max_missed_pongs: 0,
                ..Config::default()
            },
            Config {
                ws_resume_timeout_ms: 0,
                ..Config::default()
            },
        ];
        for config in &zeroed {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }
        let err = zeroed[2].validate().unwrap_err();
        assert!(err.to_string().contains("ws_max_missed_pongs"));
        assert!(Config::default().validate().is_ok());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_config_load_warnings_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        std::fs::write(&file_path, "server: [unclosed").unwrap();

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        // Result depends on env vars other tests may set; only the log matters
        let _ = load_config_logging_to(Some(&file_path), move || writer.clone());

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Failed to parse"), "logs: {}", output);
        assert!(output.contains("WARN"));
    }

    /// Combined test for YAML file loading and env var overrides.
    /// Runs as a single test to avoid parallel env var race conditions.
    #[test]
    fn test_yaml_and_env_lifecycle() {
        fn clear_env() {
            for var in &[
                "SERVER_HOST",
                "SERVER_PORT",
                "LOG_FORMAT",
                "REPLAY_CAPACITY",
                "REPLAY_MAX_AGE_SECS",
                "SUBSCRIBER_QUEUE_CAPACITY",
                "SUBSCRIBER_GAP_THRESHOLD",
                "SSE_KEEP_ALIVE_SECS",
                "WS_PING_INTERVAL_SECS",
                "WS_MAX_MISSED_PONGS",
                "WS_RESUME_TIMEOUT_MS",
            ] {
                std::env::remove_var(var);
            }
        }

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
server:
  port: 9999
events:
  replay_capacity: 20
  queue_capacity: 8
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.replay_capacity, 20);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.gap_threshold, 8);

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("SERVER_PORT", "7777");
        std::env::set_var("SUBSCRIBER_QUEUE_CAPACITY", "32");
        std::env::set_var("LOG_FORMAT", "json");
        std::env::set_var("REPLAY_CAPACITY", "not-a-number");

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.server_port, 7777);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.log_format, LogFormat::Json);
        // Malformed override keeps the YAML value
        assert_eq!(config.replay_capacity, 20);

        clear_env();

        // --- Phase 3: No YAML file → defaults ---
        let nonexistent = Path::new("/tmp/nonexistent-livecrud-config-12345.yaml");
        let config = Config::from_yaml_and_env(Some(nonexistent)).unwrap();
        assert_eq!(config.server_port, 8000);
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.replay_capacity, 1000);
    }
}
