//! Container writing stage

use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod boxes;
pub mod mp4;
pub mod nal;

pub use mp4::{BoxWriter, Mp4Mux};

use crate::error::Result;
use crate::pipeline::{FrameRef, Listener};

#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// One sample of the frame stamped with this timestamp reached the sink.
    SampleAppended(i64),
}

/// Format of the optional AAC audio track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// Random-access byte sink the box writer targets.
pub trait Sink: Send {
    /// Write `bytes` at absolute `offset`, returning how many were written.
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;
}

impl<T: Write + Seek + Send> Sink for T {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut written = 0;
        while written < bytes.len() {
            match self.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}

/// Type-erased [`Sink`].
pub struct DynSink(Box<dyn Sink>);

impl DynSink {
    pub fn new(sink: impl Sink + 'static) -> Self {
        Self(Box::new(sink))
    }
}

impl Sink for DynSink {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        self.0.write_at(offset, bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Muxing stage consuming encoded frames.
pub trait Mux: Send {
    /// Add an audio track to the next file. Only honoured before `start`.
    fn setup_audio_track(&mut self, format: AudioFormat);

    /// Open `path` and write the container header for a `width`x`height`
    /// video track.
    fn start(&mut self, path: &Path, width: u32, height: u32) -> Result<()>;

    fn add_buffer(&mut self, frame: FrameRef, codec_config: bool);

    fn add_audio_buffer(&mut self, frame: FrameRef);

    /// Format of the audio track, when one was set up.
    fn audio_format(&self) -> Option<AudioFormat>;

    fn stop(&mut self);

    fn set_listener(&mut self, listener: Listener<MuxEvent>);
}

impl<M: Mux + ?Sized> Mux for Box<M> {
    fn setup_audio_track(&mut self, format: AudioFormat) {
        (**self).setup_audio_track(format)
    }

    fn start(&mut self, path: &Path, width: u32, height: u32) -> Result<()> {
        (**self).start(path, width, height)
    }

    fn add_buffer(&mut self, frame: FrameRef, codec_config: bool) {
        (**self).add_buffer(frame, codec_config)
    }

    fn add_audio_buffer(&mut self, frame: FrameRef) {
        (**self).add_audio_buffer(frame)
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        (**self).audio_format()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn set_listener(&mut self, listener: Listener<MuxEvent>) {
        (**self).set_listener(listener)
    }
}
