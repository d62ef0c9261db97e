//! Progressive MP4 writer
//!
//! Layout: `ftyp`, one `mdat` that grows as samples arrive, `moov` appended on
//! finish. Sample positions are tracked while writing, so the sink never has
//! to be read back.

use std::fs::File;
use std::path::Path;

use tracing::{debug, error, info, instrument, warn};

use super::boxes::{self, Sample, SampleEntry, TrackInfo};
use super::nal::{self, NalUnits, NAL_TYPE_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS};
use super::{AudioFormat, DynSink, Mux, MuxEvent, Sink};
use crate::error::{Error, Result};
use crate::pipeline::{FrameRef, Listener};
use crate::MuxConfig;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
/// Samples per AAC frame, used when no timestamp delta is known.
const AAC_FRAME_SAMPLES: u32 = 1024;
/// `avc1` stores width and height as 16-bit fields.
const MAX_DIMENSION: u32 = u16::MAX as u32;

struct AudioTrack {
    format: AudioFormat,
    samples: Vec<Sample>,
    last_timestamp: Option<i64>,
}

/// Writes one MP4 file into a random-access sink.
pub struct BoxWriter<S: Sink> {
    sink: S,
    cursor: u64,
    mdat_start: u64,
    width: u32,
    height: u32,
    timescale: u32,
    sample_duration: u32,
    video: Vec<Sample>,
    audio: Option<AudioTrack>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    finished: bool,
}

impl<S: Sink> BoxWriter<S> {
    /// Write the file header and open the `mdat` box.
    pub fn new(
        sink: S,
        width: u32,
        height: u32,
        config: &MuxConfig,
        audio: Option<AudioFormat>,
    ) -> Result<Self> {
        if config.timescale == 0 || config.framerate == 0 {
            return Err(Error::Configuration(format!(
                "timescale {} / framerate {}",
                config.timescale, config.framerate
            )));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::Configuration(format!(
                "{width}x{height} does not fit a sample entry"
            )));
        }

        let mut writer = Self {
            sink,
            cursor: 0,
            mdat_start: 0,
            width,
            height,
            timescale: config.timescale,
            sample_duration: config.timescale / config.framerate,
            video: Vec::new(),
            audio: audio.map(|format| AudioTrack {
                format,
                samples: Vec::new(),
                last_timestamp: None,
            }),
            sps: None,
            pps: None,
            finished: false,
        };

        let mut header = Vec::with_capacity(64);
        boxes::ftyp(&mut header);
        writer.write(&header)?;
        writer.mdat_start = writer.cursor;
        writer.write(&boxes::mdat_header())?;
        Ok(writer)
    }

    pub fn sample_duration(&self) -> u32 {
        self.sample_duration
    }

    pub fn video_samples(&self) -> &[Sample] {
        &self.video
    }

    pub fn audio_samples(&self) -> &[Sample] {
        match &self.audio {
            Some(track) => &track.samples,
            None => &[],
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let written = self.sink.write_at(self.cursor, bytes)?;
        if written != bytes.len() {
            return Err(Error::ShortWrite {
                requested: bytes.len(),
                written,
            });
        }
        self.cursor += bytes.len() as u64;
        Ok(())
    }

    /// Split an Annex B buffer into units and append each as one video
    /// sample. A unit that fails to write is logged and skipped. Returns how
    /// many samples were appended.
    pub fn write_video(&mut self, data: &[u8]) -> usize {
        let mut appended = 0;
        for unit in NalUnits::new(data) {
            let Some(payload) = nal::payload(unit) else {
                debug!(len = unit.len(), "skipping unit without payload");
                continue;
            };
            match self.write_video_unit(payload) {
                Ok(()) => appended += 1,
                Err(e) => {
                    error!("failed to write video sample: {}", e);
                    metrics::counter!("screencast_sample_errors_total").increment(1);
                }
            }
        }
        appended
    }

    /// Append one NAL unit, start code already stripped, as a length-prefixed
    /// sample.
    pub fn write_video_unit(&mut self, payload: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState {
                component: "mp4 writer",
                state: "finished",
            });
        }
        let nal_type = nal::nal_type(payload);
        match nal_type {
            Some(NAL_TYPE_SPS) => self.sps = Some(payload.to_vec()),
            Some(NAL_TYPE_PPS) => self.pps = Some(payload.to_vec()),
            _ => {}
        }

        let size = payload
            .len()
            .checked_add(4)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or_else(|| Error::Codec(format!("{} byte unit", payload.len())))?;
        let mut sample = Vec::with_capacity(payload.len() + 4);
        sample.extend_from_slice(&(size - 4).to_be_bytes());
        sample.extend_from_slice(payload);

        let offset = self.cursor;
        self.write(&sample)?;
        self.video.push(Sample {
            offset,
            size,
            duration: self.sample_duration,
            sync: nal_type == Some(NAL_TYPE_IDR),
        });
        metrics::counter!("screencast_samples_written_total").increment(1);
        Ok(())
    }

    /// Append one raw audio frame captured at `timestamp` microseconds.
    pub fn write_audio(&mut self, data: &[u8], timestamp: i64) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState {
                component: "mp4 writer",
                state: "finished",
            });
        }
        if self.audio.is_none() {
            return Err(Error::InvalidState {
                component: "mp4 writer",
                state: "without an audio track",
            });
        }
        let size = u32::try_from(data.len())
            .map_err(|_| Error::Codec(format!("{} byte audio frame", data.len())))?;

        let offset = self.cursor;
        self.write(data)?;

        let Some(track) = self.audio.as_mut() else {
            return Ok(());
        };
        if let (Some(previous), Some(last)) = (track.last_timestamp, track.samples.last_mut()) {
            let ticks = timestamp
                .checked_sub(previous)
                .and_then(|delta| delta.checked_mul(i64::from(track.format.sample_rate)))
                .map(|scaled| scaled / 1_000_000)
                .and_then(|ticks| u32::try_from(ticks).ok());
            last.duration = match ticks {
                Some(ticks) if ticks > 0 => ticks,
                _ => AAC_FRAME_SAMPLES,
            };
        }
        track.samples.push(Sample {
            offset,
            size,
            duration: AAC_FRAME_SAMPLES,
            sync: true,
        });
        track.last_timestamp = Some(timestamp);
        metrics::counter!("screencast_samples_written_total").increment(1);
        Ok(())
    }

    /// Patch the `mdat` size and append `moov`. A second call only warns.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            warn!("mp4 writer already finished");
            return Ok(());
        }
        self.finished = true;

        let mdat_size = self.cursor - self.mdat_start;
        self.sink
            .write_at(self.mdat_start + 8, &mdat_size.to_be_bytes())
            .map_err(Error::from)
            .and_then(|written| match written {
                8 => Ok(()),
                written => Err(Error::ShortWrite {
                    requested: 8,
                    written,
                }),
            })?;

        let mut tracks = vec![TrackInfo {
            id: VIDEO_TRACK_ID,
            timescale: self.timescale,
            entry: SampleEntry::Avc {
                width: self.width,
                height: self.height,
                sps: self.sps.as_deref(),
                pps: self.pps.as_deref(),
            },
            samples: &self.video,
        }];
        if let Some(audio) = &self.audio {
            tracks.push(TrackInfo {
                id: AUDIO_TRACK_ID,
                timescale: audio.format.sample_rate,
                entry: SampleEntry::Aac(audio.format),
                samples: &audio.samples,
            });
        }

        let mut moov = Vec::with_capacity(1024 + 16 * self.video.len());
        boxes::moov(&mut moov, self.timescale, &tracks);
        drop(tracks);
        self.write(&moov)?;
        self.sink.flush()?;

        debug!(
            video_samples = self.video.len(),
            audio_samples = self.audio_samples().len(),
            bytes = self.cursor,
            "mp4 finalized"
        );
        Ok(())
    }
}

impl<S: Sink> Drop for BoxWriter<S> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                error!("failed to finalize mp4: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Idle,
    Started,
    Stopped,
}

/// [`Mux`] writing an MP4 file through a [`BoxWriter`].
pub struct Mp4Mux {
    config: MuxConfig,
    audio: Option<AudioFormat>,
    writer: Option<BoxWriter<DynSink>>,
    listener: Option<Listener<MuxEvent>>,
    state: MuxState,
}

impl Mp4Mux {
    pub fn new(config: MuxConfig) -> Self {
        Self {
            config,
            audio: None,
            writer: None,
            listener: None,
            state: MuxState::Idle,
        }
    }

    /// Start writing into an already opened sink.
    pub fn start_with_sink(
        &mut self,
        sink: impl Sink + 'static,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.ensure_idle()?;
        let sink = DynSink::new(sink);
        self.writer = Some(BoxWriter::new(sink, width, height, &self.config, self.audio)?);
        self.state = MuxState::Started;
        info!(width, height, "started mp4 mux");
        Ok(())
    }

    /// One mux writes one file: only an idle mux may start.
    fn ensure_idle(&self) -> Result<()> {
        match self.state {
            MuxState::Idle => Ok(()),
            MuxState::Started => Err(Error::InvalidState {
                component: "mux",
                state: "started",
            }),
            MuxState::Stopped => Err(Error::InvalidState {
                component: "mux",
                state: "stopped",
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == MuxState::Started
    }

    fn emit(&self, event: MuxEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }
}

impl Mux for Mp4Mux {
    fn setup_audio_track(&mut self, format: AudioFormat) {
        if self.state == MuxState::Started {
            warn!("audio track must be set up before the mux starts");
            return;
        }
        self.audio = Some(format);
    }

    #[instrument(skip(self))]
    fn start(&mut self, path: &Path, width: u32, height: u32) -> Result<()> {
        self.ensure_idle()?;
        let file = File::create(path)?;
        self.start_with_sink(file, width, height)
    }

    fn add_buffer(&mut self, frame: FrameRef, codec_config: bool) {
        let Some(writer) = self.writer.as_mut() else {
            warn!("mux got a buffer while not running");
            return;
        };
        let appended = writer.write_video(frame.data());
        if codec_config {
            debug!(units = appended, "muxed codec config");
        }
        for _ in 0..appended {
            self.emit(MuxEvent::SampleAppended(frame.timestamp()));
        }
    }

    fn add_audio_buffer(&mut self, frame: FrameRef) {
        let Some(writer) = self.writer.as_mut() else {
            warn!("mux got an audio buffer while not running");
            return;
        };
        match writer.write_audio(frame.data(), frame.timestamp()) {
            Ok(()) => self.emit(MuxEvent::SampleAppended(frame.timestamp())),
            Err(e) => {
                error!("failed to write audio sample: {}", e);
                metrics::counter!("screencast_sample_errors_total").increment(1);
            }
        }
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        self.audio
    }

    fn stop(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            warn!("trying to stop mp4 muxer that is not running");
            return;
        };
        if let Err(e) = writer.finish() {
            error!("failed to finalize mp4: {}", e);
        }
        self.state = MuxState::Stopped;
        info!("stopped mp4 mux");
    }

    fn set_listener(&mut self, listener: Listener<MuxEvent>) {
        self.listener = Some(listener);
    }
}

impl Drop for Mp4Mux {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.stop();
        }
    }
}
