//! In-process codec producing an H.264 shaped elementary stream
//!
//! It does not compress pixels. Every input buffer becomes one slice NAL unit
//! carrying the buffer's timestamp and handle, which is enough for the muxer,
//! the buffer lifecycle and key-frame cadence to behave like a real stream.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use super::codec::{BufferId, CodecBackend, CodecOutput, MediaSource};
use super::EncoderConfig;
use crate::error::{Error, Result};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;

const PROFILE_BASELINE: u8 = 66;
const LEVEL_3_1: u8 = 31;

pub struct LoopbackCodec {
    config: Option<EncoderConfig>,
    source: Option<Arc<dyn MediaSource>>,
    /// Buffers referenced by the "reference picture"
    held: VecDeque<BufferId>,
    hold: usize,
    sent_config: bool,
    frames: u64,
    force_key_frame: bool,
}

impl LoopbackCodec {
    pub fn new() -> Self {
        Self::with_hold(1)
    }

    /// Keep up to `hold` input buffers before returning the oldest one.
    pub fn with_hold(hold: usize) -> Self {
        Self {
            config: None,
            source: None,
            held: VecDeque::new(),
            hold,
            sent_config: false,
            frames: 0,
            force_key_frame: false,
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames
    }

    fn gop_length(config: &EncoderConfig) -> u64 {
        config.framerate as u64 * config.i_frame_interval as u64
    }

    fn sps(config: &EncoderConfig) -> Vec<u8> {
        let profile = match config.profile_idc {
            0 => PROFILE_BASELINE,
            idc => idc as u8,
        };
        let level = match config.level_idc {
            0 => LEVEL_3_1,
            idc => idc as u8,
        };
        let mut rbsp = Vec::with_capacity(9);
        rbsp.extend_from_slice(&(config.width as u16).to_be_bytes());
        rbsp.extend_from_slice(&(config.height as u16).to_be_bytes());
        rbsp.push(config.framerate as u8);

        let mut nal = vec![NAL_SPS, profile, config.constraint_set as u8, level];
        nal.extend(escape(&rbsp));
        nal
    }

    fn parameter_sets(config: &EncoderConfig) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&START_CODE);
        out.extend(Self::sps(config));
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&[NAL_PPS, 0xce, 0x3c, 0x80]);
        out
    }
}

impl Default for LoopbackCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert emulation prevention bytes so no start code can appear inside a
/// NAL payload.
fn escape(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 2);
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    // A trailing zero would merge with the next start code.
    if out.last() == Some(&0) {
        out.push(3);
    }
    out
}

impl CodecBackend for LoopbackCodec {
    fn configure(&mut self, config: &EncoderConfig) -> Result<()> {
        if config.width == 0 || config.height == 0 {
            return Err(Error::Codec(format!(
                "unsupported size {}x{}",
                config.width, config.height
            )));
        }
        if config.width > u16::MAX as u32 || config.height > u16::MAX as u32 {
            return Err(Error::Codec("frame size out of range".into()));
        }
        if config.framerate == 0 || config.framerate > u8::MAX as u32 {
            return Err(Error::Codec(format!(
                "unsupported framerate {}",
                config.framerate
            )));
        }
        if config.bitrate == 0 {
            return Err(Error::Codec("bitrate must be positive".into()));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn start(&mut self, source: Arc<dyn MediaSource>) -> Result<()> {
        if self.config.is_none() {
            return Err(Error::Codec("codec not configured".into()));
        }
        self.source = Some(source);
        self.sent_config = false;
        self.frames = 0;
        self.force_key_frame = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| Error::Codec("codec not started".into()))?;
        for id in self.held.drain(..) {
            source.buffer_returned(id);
        }
        debug!(frames = self.frames, "loopback codec stopped");
        Ok(())
    }

    fn read(&mut self) -> Result<CodecOutput> {
        let (Some(source), Some(config)) = (self.source.clone(), self.config.as_ref()) else {
            return Err(Error::Codec("codec not started".into()));
        };

        if !self.sent_config {
            self.sent_config = true;
            return Ok(CodecOutput {
                data: Self::parameter_sets(config),
                timestamp: 0,
                codec_config: true,
            });
        }

        let buffer = source.read().map_err(|e| Error::Codec(e.to_string()))?;

        let gop = Self::gop_length(config);
        let key_frame = self.force_key_frame
            || self.frames == 0
            || (gop > 0 && self.frames % gop == 0);
        self.force_key_frame = false;

        let mut data = Vec::with_capacity(32);
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&buffer.timestamp.to_be_bytes());
        payload.extend_from_slice(&buffer.handle.0.to_be_bytes());
        data.extend_from_slice(&START_CODE);
        data.push(if key_frame { NAL_IDR } else { NAL_SLICE });
        data.extend(escape(&payload));

        trace!(
            timestamp = buffer.timestamp,
            key_frame,
            size = data.len(),
            "encoded frame"
        );

        self.frames += 1;
        self.held.push_back(buffer.id);
        while self.held.len() > self.hold {
            if let Some(id) = self.held.pop_front() {
                source.buffer_returned(id);
            }
        }

        Ok(CodecOutput {
            data,
            timestamp: buffer.timestamp,
            codec_config: false,
        })
    }

    fn request_key_frame(&mut self) {
        self.force_key_frame = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{CodecBuffer, SourceError};
    use crate::pipeline::NativeHandle;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counter {
        next: Mutex<u64>,
        returned: Mutex<Vec<BufferId>>,
    }

    impl MediaSource for Counter {
        fn read(&self) -> std::result::Result<CodecBuffer, SourceError> {
            let mut next = self.next.lock();
            *next += 1;
            Ok(CodecBuffer {
                id: BufferId(*next),
                handle: NativeHandle(*next),
                timestamp: *next as i64 * 1000,
            })
        }

        fn buffer_returned(&self, id: BufferId) {
            self.returned.lock().push(id);
        }
    }

    fn config() -> EncoderConfig {
        EncoderConfig {
            width: 256,
            height: 256,
            framerate: 2,
            i_frame_interval: 2,
            ..EncoderConfig::default_config()
        }
    }

    fn slice_type(data: &[u8]) -> u8 {
        let pos = data
            .windows(4)
            .rposition(|w| w == START_CODE.as_slice())
            .unwrap();
        data[pos + 4]
    }

    #[test]
    fn escape_breaks_start_codes() {
        assert_eq!(escape(&[0, 0, 1]), vec![0, 0, 3, 1]);
        assert_eq!(escape(&[0, 0, 0, 0]), vec![0, 0, 3, 0, 0, 3]);
        assert_eq!(escape(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn key_frames_follow_gop() {
        let source = Arc::new(Counter::default());
        let mut codec = LoopbackCodec::new();
        codec.configure(&config()).unwrap();
        codec.start(source.clone()).unwrap();

        let setup = codec.read().unwrap();
        assert!(setup.codec_config);
        assert_eq!(setup.data[4], NAL_SPS);

        let kinds: Vec<u8> = (0..6).map(|_| slice_type(&codec.read().unwrap().data)).collect();
        assert_eq!(
            kinds,
            vec![NAL_IDR, NAL_SLICE, NAL_SLICE, NAL_SLICE, NAL_IDR, NAL_SLICE]
        );

        codec.request_key_frame();
        assert_eq!(slice_type(&codec.read().unwrap().data), NAL_IDR);
    }

    #[test]
    fn holds_one_buffer_and_returns_rest_on_stop() {
        let source = Arc::new(Counter::default());
        let mut codec = LoopbackCodec::new();
        codec.configure(&config()).unwrap();
        codec.start(source.clone()).unwrap();

        for _ in 0..4 {
            codec.read().unwrap();
        }
        assert_eq!(*source.returned.lock(), vec![BufferId(1), BufferId(2)]);

        codec.stop().unwrap();
        assert_eq!(source.returned.lock().len(), 3);
        assert!(codec.stop().is_err());
    }

    #[test]
    fn rejects_unusable_formats() {
        let mut codec = LoopbackCodec::new();
        assert!(codec
            .configure(&EncoderConfig::default_config())
            .is_err());
        assert!(codec
            .start(Arc::new(Counter::default()))
            .is_err());
    }
}
