//! Video encoding stage
//!
//! [`CodecEncoder`] bridges the push-style pipeline (frames arrive through
//! [`Encoder::add_buffer`]) to pull-style codec backends that ask for input
//! through a read callback and hand buffers back when they are done.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod codec;
pub mod loopback;
pub mod pending;

pub use bridge::{CodecEncoder, EncoderState};
pub use codec::{BufferId, CodecBackend, CodecBuffer, CodecOutput, MediaSource, SourceError};
pub use loopback::LoopbackCodec;
pub use pending::PendingBuffers;

use crate::error::Result;
use crate::pipeline::{FrameQueue, FrameRef, Listener};

/// Supplying this as framerate lets the codec pick its usual rate.
pub const ANY_FRAMERATE: u32 = 30;
/// 25 MBit/s
pub const DEFAULT_BITRATE: u32 = 25_000_000;
/// Seconds between forced I-frames
pub const DEFAULT_I_FRAME_INTERVAL: u32 = 15;

/// Events emitted by an encoder.
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// Encoded output; `codec_config` marks decoder setup data (SPS/PPS).
    FrameAvailable { frame: FrameRef, codec_config: bool },
    /// The codec handed an input buffer back to its producer.
    BufferReturned,
    Started,
    Stopped,
    /// Input frame handed to the codec
    BeganFrame(i64),
    /// Encoded buffer produced
    FinishedFrame(i64),
    /// Raw frame queued for encoding
    ReceivedInputBuffer(i64),
}

/// Encoder format parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub output_scale: f32,
    pub bitrate: u32,
    pub framerate: u32,
    // H.264 specifics
    pub profile: u32,
    pub level: u32,
    pub profile_idc: u32,
    pub level_idc: u32,
    pub constraint_set: u32,
    pub i_frame_interval: u32,
    pub intra_refresh_mode: u32,
}

impl EncoderConfig {
    pub fn default_config() -> Self {
        Self {
            width: 0,
            height: 0,
            output_scale: 1.0,
            bitrate: DEFAULT_BITRATE,
            framerate: ANY_FRAMERATE,
            profile: 0,
            level: 0,
            profile_idc: 0,
            level_idc: 0,
            constraint_set: 0,
            i_frame_interval: DEFAULT_I_FRAME_INTERVAL,
            intra_refresh_mode: 1,
        }
    }

    /// Output dimensions after applying `output_scale`, rounded down to even
    /// values as 4:2:0 chroma subsampling requires.
    pub fn scaled_size(&self) -> (u32, u32) {
        let scale = |v: u32| ((v as f32 * self.output_scale) as u32) & !1;
        (scale(self.width), scale(self.height))
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Encoding stage consuming raw frames and emitting encoded ones.
pub trait Encoder: Send {
    /// Instantiate the codec. Fails when the format is not supported.
    fn configure(&mut self, config: &EncoderConfig) -> Result<()>;

    fn start(&mut self);

    fn stop(&mut self);

    fn add_buffer(&mut self, frame: FrameRef);

    fn request_key_frame(&mut self) {}

    /// The queue `add_buffer` feeds. Shutdown wakes it so a codec parked in
    /// its read callback gives up.
    fn input_queue(&self) -> Arc<FrameQueue>;

    fn set_listener(&mut self, listener: Listener<EncoderEvent>);
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn configure(&mut self, config: &EncoderConfig) -> Result<()> {
        (**self).configure(config)
    }

    fn start(&mut self) {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn add_buffer(&mut self, frame: FrameRef) {
        (**self).add_buffer(frame)
    }

    fn request_key_frame(&mut self) {
        (**self).request_key_frame()
    }

    fn input_queue(&self) -> Arc<FrameQueue> {
        (**self).input_queue()
    }

    fn set_listener(&mut self, listener: Listener<EncoderEvent>) {
        (**self).set_listener(listener)
    }
}
