pub mod capture;
pub mod encoder;
pub mod error;
pub mod indicator;
pub mod mux;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use encoder::EncoderConfig;
pub use error::{Error, Result};
pub use mux::AudioFormat;
pub use pipeline::QueueStats;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub mux: MuxConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: f64,
    /// Native buffers the screen source cycles through
    pub buffer_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Video track ticks per second
    pub timescale: u32,
    /// Nominal rate the per-sample duration is derived from
    pub framerate: u32,
    pub audio: AudioFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub framerate: f64,
    pub scale: f32,
    pub microphone: bool,
    /// Ticks between elapsed-time updates to the indicator
    pub elapsed_report_every: u64,
    /// 0 = unbounded
    pub encoder_queue_capacity: usize,
    /// `None` blocks the codec read callback until a frame or shutdown
    pub read_timeout_ms: Option<u64>,
    pub pin_threads: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub max_duration_secs: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_rate: 60.0,
            buffer_count: 4,
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            timescale: 90_000,
            framerate: 30,
            audio: AudioFormat::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            framerate: 30.0,
            scale: 1.0,
            microphone: false,
            elapsed_report_every: 30,
            encoder_queue_capacity: 0,
            read_timeout_ms: None,
            pin_threads: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: utils::default_recordings_dir(),
            max_duration_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `SCREENCAST`-prefixed
    /// environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SCREENCAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Performance metrics collected throughout the pipeline
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub elapsed: Duration,
    pub ticks: u64,
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub samples_written: u64,
    pub encoder_queue: QueueStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_recorder_constants() {
        let config = Config::default();
        assert_eq!(config.mux.timescale / config.mux.framerate, 3000);
        assert_eq!(config.encoder.bitrate, 25_000_000);
        assert_eq!(config.encoder.i_frame_interval, 15);
        assert_eq!(config.pipeline.elapsed_report_every, 30);
        assert!(config.pipeline.read_timeout().is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("screencast-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("screencast.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[pipeline]\nframerate = 24.0\nread_timeout_ms = 500").unwrap();
        writeln!(file, "[capture]\nbuffer_count = 2").unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.pipeline.framerate, 24.0);
        assert_eq!(config.pipeline.read_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.capture.buffer_count, 2);
        assert_eq!(config.capture.width, 1280);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
