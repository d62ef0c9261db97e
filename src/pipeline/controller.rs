//! Recording session layer on top of the [`Recorder`]

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use super::{FrameQueue, Recorder};
use crate::capture::{Capture, SyntheticCapture};
use crate::encoder::{CodecEncoder, Encoder, EncoderConfig, LoopbackCodec};
use crate::error::{Error, Result};
use crate::indicator::{Indicator, LogIndicator};
use crate::mux::{Mp4Mux, Mux};
use crate::{utils, Config, Metrics};

/// Stage objects for one session.
pub struct Backends {
    pub capture: Box<dyn Capture>,
    pub encoder: Box<dyn Encoder>,
    pub mux: Box<dyn Mux>,
    pub indicator: Box<dyn Indicator>,
}

/// Builds fresh stages for every session.
pub trait BackendFactory: Send {
    fn build(&self, config: &Config) -> Result<Backends>;
}

/// Synthetic screen source, loopback codec, MP4 file and log indicator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackends;

impl BackendFactory for DefaultBackends {
    fn build(&self, config: &Config) -> Result<Backends> {
        let queue = match config.pipeline.encoder_queue_capacity {
            0 => FrameQueue::unbounded(),
            capacity => FrameQueue::new(capacity),
        };
        Ok(Backends {
            capture: Box::new(SyntheticCapture::new(config.capture.clone())),
            encoder: Box::new(CodecEncoder::with_queue(
                LoopbackCodec::new(),
                queue,
                config.pipeline.read_timeout(),
            )),
            mux: Box::new(Mp4Mux::new(config.mux.clone())),
            indicator: Box::new(LogIndicator::new()),
        })
    }
}

struct Session {
    recorder: Recorder,
    path: PathBuf,
}

/// Starts and stops recordings into timestamped files.
pub struct Controller<F: BackendFactory = DefaultBackends> {
    config: Config,
    factory: F,
    session: Option<Session>,
}

impl Controller<DefaultBackends> {
    pub fn with_defaults(config: Config) -> Self {
        Self::new(config, DefaultBackends)
    }
}

impl<F: BackendFactory> Controller<F> {
    pub fn new(config: Config, factory: F) -> Self {
        Self {
            config,
            factory,
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// File the running session writes to.
    pub fn current_path(&self) -> Option<&PathBuf> {
        self.session.as_ref().map(|session| &session.path)
    }

    /// Begin a recording. Encoder configuration failures abort before the
    /// output file is created.
    #[instrument(skip(self))]
    pub fn start(&mut self, scale: f32, framerate: f64, microphone: bool) -> Result<PathBuf> {
        if self.session.is_some() {
            return Err(Error::InvalidState {
                component: "controller",
                state: "recording",
            });
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(Error::Configuration(format!("scale {scale}")));
        }
        if !(framerate.is_finite() && framerate >= 1.0) {
            return Err(Error::Configuration(format!("framerate {framerate}")));
        }

        let mut config = self.config.clone();
        config.pipeline.scale = scale;
        config.pipeline.framerate = framerate;
        config.pipeline.microphone = microphone;
        config.mux.framerate = framerate.round() as u32;

        let Backends {
            mut capture,
            mut encoder,
            mut mux,
            indicator,
        } = self.factory.build(&config)?;

        capture.init()?;
        let encoder_config = EncoderConfig {
            width: capture.width(),
            height: capture.height(),
            output_scale: scale,
            framerate: config.mux.framerate,
            ..config.encoder.clone()
        };
        encoder.configure(&encoder_config)?;
        let (width, height) = encoder_config.scaled_size();

        if microphone {
            mux.setup_audio_track(config.mux.audio);
        }

        utils::ensure_dir(&config.output.directory)?;
        let path = utils::new_recording_path(&config.output.directory);
        mux.start(&path, width, height)?;

        let mut recorder = Recorder::new(&config.pipeline);
        recorder.setup(capture, encoder, mux, indicator)?;
        recorder.start(framerate, microphone)?;

        info!(path = %path.display(), width, height, "recording to file");
        self.session = Some(Session {
            recorder,
            path: path.clone(),
        });
        Ok(path)
    }

    /// Stop the running recording and return the saved file.
    pub fn stop(&mut self) -> Result<PathBuf> {
        let Some(mut session) = self.session.take() else {
            return Err(Error::InvalidState {
                component: "controller",
                state: "idle",
            });
        };
        session.recorder.stop();
        session.recorder.stop_mux();
        let stats = session.recorder.stats();
        info!(
            path = %session.path.display(),
            frames = stats.frames_encoded,
            samples = stats.samples_written,
            "recording saved"
        );
        Ok(session.path)
    }

    pub fn stats(&self) -> Option<Metrics> {
        self.session.as_ref().map(|session| session.recorder.stats())
    }

    /// Delete finished recordings from the output directory.
    pub fn clean_space(&self) -> Result<usize> {
        if self.session.is_some() {
            warn!("not cleaning recordings while one is being written");
            return Err(Error::InvalidState {
                component: "controller",
                state: "recording",
            });
        }
        let removed = utils::clean_recordings(&self.config.output.directory)?;
        info!(removed, "cleaned recordings");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_in(name: &str) -> Config {
        let mut config = Config::default();
        config.output.directory =
            std::env::temp_dir().join(format!("screencast-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&config.output.directory);
        config.capture.width = 320;
        config.capture.height = 240;
        config
    }

    #[test]
    fn records_into_timestamped_file() {
        let config = config_in("controller-record");
        let dir = config.output.directory.clone();
        let mut controller = Controller::with_defaults(config);

        let path = controller.start(1.0, 30.0, false).unwrap();
        assert!(controller.is_recording());
        assert!(matches!(
            controller.start(1.0, 30.0, false),
            Err(Error::InvalidState { .. })
        ));
        std::thread::sleep(Duration::from_millis(300));

        let saved = controller.stop().unwrap();
        assert_eq!(saved, path);
        assert!(utils::is_recording_file(&saved));
        // ftyp + mdat header + at least one sample + moov
        assert!(std::fs::metadata(&saved).unwrap().len() > 48);

        assert!(matches!(controller.stop(), Err(Error::InvalidState { .. })));
        assert_eq!(controller.clean_space().unwrap(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn configure_failure_creates_no_file() {
        let config = config_in("controller-refused");
        let dir = config.output.directory.clone();
        let mut controller = Controller::with_defaults(config);

        // 320 * 0.001 rounds down to an empty frame
        assert!(matches!(
            controller.start(0.001, 30.0, false),
            Err(Error::Configuration(_))
        ));
        assert!(!controller.is_recording());
        assert!(!dir.exists());
    }

    #[test]
    fn rejects_unusable_arguments() {
        let mut controller = Controller::with_defaults(config_in("controller-args"));
        assert!(controller.start(0.0, 30.0, false).is_err());
        assert!(controller.start(1.0, 0.0, false).is_err());
        assert!(controller.start(1.0, f64::NAN, false).is_err());
    }
}
