use crate::codec::{EncodeOptions, Quality};
use crate::orchestrator::DispatchPolicy;
use detection_proto::DEFAULT_SOCKET_PATH;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub detection_service: DetectionServiceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    pub job: JobConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionServiceConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for DetectionServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Sequential,
    #[default]
    Batched,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between requests in sequential mode.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            batch_size: default_batch_size(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}

fn default_request_delay_ms() -> u64 {
    100
}

impl DispatchConfig {
    pub fn policy(&self) -> DispatchPolicy {
        match self.mode {
            DispatchMode::Sequential => DispatchPolicy::Sequential {
                delay: Duration::from_millis(self.request_delay_ms),
            },
            DispatchMode::Batched => DispatchPolicy::Batched {
                size: self.batch_size.max(1),
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CodecConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            framerate: default_framerate(),
            quality: Quality::default(),
            video_codec: default_video_codec(),
            resolution: None,
        }
    }
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_framerate() -> u32 {
    25
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

impl CodecConfig {
    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            framerate: self.framerate,
            quality: self.quality,
            video_codec: self.video_codec.clone(),
            resolution: self.resolution.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub input_video: PathBuf,
    pub work_dir: PathBuf,
    pub output_video: PathBuf,
    #[serde(default = "default_fallback_to_source")]
    pub fallback_to_source: bool,
}

fn default_fallback_to_source() -> bool {
    true
}

impl JobConfig {
    /// Where extracted frames are archived.
    pub fn frames_dir(&self) -> PathBuf {
        self.work_dir.join("frames")
    }

    /// Where frames are archived again with their detection outcome.
    pub fn processed_dir(&self) -> PathBuf {
        self.work_dir.join("processed")
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.input_video.exists() {
            return Err(format!("File not found: {:?}", self.input_video));
        }
        Ok(())
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
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        let wanted = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "{} is not a supported minimum log level. Use one of trace, debug, info, warn or error.",
                    s
                )
            })
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let settings = config::Config::builder()
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
            config::Environment::with_prefix("FP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = settings.try_deserialize::<Config>()?;
    if let Err(e) = config.job.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
