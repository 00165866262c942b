use crate::detection::DetectionRecord;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const MAX_IN_FLIGHT_CEILING: usize = 4;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

fn deserialize_detector_mode<'de, D>(deserializer: D) -> Result<DetectorMode, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Limits applied to every client session.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Pending detections per session before the session stops reading.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,
    /// Upper bound on the decoded frame size in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
    /// Close the session after this many client errors in a row. Unset means never.
    #[serde(default)]
    pub max_consecutive_errors: Option<u32>,
}

fn default_max_in_flight() -> usize {
    2
}

fn default_detection_timeout_ms() -> u64 {
    30_000
}

fn default_max_frame_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_image_dimension() -> u32 {
    8192
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            detection_timeout_ms: default_detection_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            max_image_dimension: default_max_image_dimension(),
            max_consecutive_errors: None,
        }
    }
}

impl SessionConfig {
    pub fn get_max_in_flight(&self) -> usize {
        self.max_in_flight.clamp(1, MAX_IN_FLIGHT_CEILING)
    }

    pub fn get_detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_in_flight == 0 {
            return Err("session.max_in_flight must be at least 1".into());
        }
        if self.detection_timeout_ms == 0 {
            return Err("session.detection_timeout_ms must be greater than 0".into());
        }
        if self.max_frame_bytes == 0 {
            return Err("session.max_frame_bytes must be greater than 0".into());
        }
        if self.max_consecutive_errors == Some(0) {
            return Err("session.max_consecutive_errors must be at least 1 when set".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DetectorConfig {
    #[serde(default, deserialize_with = "deserialize_detector_mode")]
    pub mode: DetectorMode,
    #[serde(default)]
    pub stub: StubDetectorConfig,
    pub remote: Option<RemoteDetectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StubDetectorConfig {
    /// Artificial latency added to every call.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default = "default_stub_detections")]
    pub detections: Vec<DetectionRecord>,
}

fn default_stub_detections() -> Vec<DetectionRecord> {
    vec![DetectionRecord::new([50.0, 50.0, 100.0, 100.0], "person", 0.9)]
}

impl Default for StubDetectorConfig {
    fn default() -> Self {
        Self {
            delay_ms: None,
            detections: default_stub_detections(),
        }
    }
}

impl StubDetectorConfig {
    pub fn get_delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteDetectorConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    10
}

fn default_initial_retry_delay_ms() -> u64 {
    50
}

fn default_max_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

impl RemoteDetectorConfig {
    pub fn get_address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetectorMode {
    #[default]
    Stub,
    Remote,
}

impl DetectorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorMode::Stub => "stub",
            DetectorMode::Remote => "remote",
        }
    }
}

impl TryFrom<String> for DetectorMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "remote" => Ok(Self::Remote),
            other => Err(format!(
                "{} is not a supported detector mode. Use either `stub` or `remote`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    load_configuration(&base_path.join("configuration"), environment)
}

/// Layers `base.yaml`, the environment file, `APP_*` variables and the
/// `PORT`/`MODE` shorthands, in that order.
pub fn load_configuration(
    configuration_directory: &Path,
    environment: Environment,
) -> Result<Config, config::ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .set_override_option("server.port", std::env::var("PORT").ok())?
        .set_override_option("detector.mode", std::env::var("MODE").ok())?;

    finish(builder.build()?)
}

fn finish(config: config::Config) -> Result<Config, config::ConfigError> {
    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.session.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }
    if config.detector.mode == DetectorMode::Remote && config.detector.remote.is_none() {
        return Err(config::ConfigError::Message(
            "detector.remote must be set when detector.mode is `remote`".into(),
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn parse(yaml: &str) -> Result<Config, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        finish(config)
    }

    #[test]
    fn test_minimal_configuration_uses_defaults() {
        let config = parse(
            r#"
server:
  host: 127.0.0.1
  port: 3000
log_level: info
"#,
        )
        .unwrap();

        assert_eq!(config.server.get_address(), "127.0.0.1:3000");
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.detector.mode, DetectorMode::Stub);
        assert_eq!(config.session.get_max_in_flight(), 2);
        assert_eq!(
            config.session.get_detection_timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(config.session.max_frame_bytes, 10 * 1024 * 1024);
        assert_eq!(config.session.max_consecutive_errors, None);
        assert_eq!(config.detector.stub.detections.len(), 1);
        assert_eq!(config.detector.stub.detections[0].class_label, "person");
    }

    #[test]
    fn test_remote_mode_requires_remote_section() {
        let err = parse(
            r#"
server:
  host: 0.0.0.0
  port: 3000
log_level: debug
detector:
  mode: remote
"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("detector.remote"));
    }

    #[test]
    fn test_remote_section_is_parsed() {
        let config = parse(
            r#"
server:
  host: 0.0.0.0
  port: 3000
log_level: debug
detector:
  mode: Remote
  remote:
    host: yolo
    port: 50051
"#,
        )
        .unwrap();

        let remote = config.detector.remote.unwrap();
        assert_eq!(config.detector.mode, DetectorMode::Remote);
        assert_eq!(remote.get_address(), "http://yolo:50051");
        assert_eq!(remote.max_retries, 10);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = parse(
            r#"
server:
  host: 0.0.0.0
  port: 3000
log_level: info
session:
  max_in_flight: 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_in_flight"));

        let err = parse(
            r#"
server:
  host: 0.0.0.0
  port: 3000
log_level: verbose
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_max_in_flight_is_clamped() {
        let session = SessionConfig {
            max_in_flight: 64,
            ..SessionConfig::default()
        };
        assert_eq!(session.get_max_in_flight(), 4);
    }

    #[test]
    fn test_detector_mode_from_string() {
        assert_eq!(
            DetectorMode::try_from("STUB".to_string()),
            Ok(DetectorMode::Stub)
        );
        assert!(DetectorMode::try_from("wasm".to_string()).is_err());
    }

    #[test]
    fn test_shipped_configuration_files_load() {
        let directory = Path::new(env!("CARGO_MANIFEST_DIR")).join("configuration");

        let local = load_configuration(&directory, Environment::Local).unwrap();
        assert_eq!(local.log_level, LogLevel::Debug);
        assert_eq!(local.detector.stub.get_delay(), Some(Duration::from_millis(20)));

        let production = load_configuration(&directory, Environment::Production).unwrap();
        assert_eq!(production.session.max_consecutive_errors, Some(20));
        assert!(production.detector.remote.is_some());
    }
}
