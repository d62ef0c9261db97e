//! Codec backend boundary

use std::sync::Arc;

use thiserror::Error;

use super::EncoderConfig;
use crate::error::Result;
use crate::pipeline::NativeHandle;

/// Identity of a buffer handed to the codec, unique per encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Input descriptor the codec receives from the read callback.
#[derive(Debug, Clone, Copy)]
pub struct CodecBuffer {
    pub id: BufferId,
    pub handle: NativeHandle,
    /// Capture time in microseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source is not connected")]
    NotConnected,
    #[error("end of stream")]
    EndOfStream,
}

/// Input side the codec pulls from. Both calls may arrive on any thread.
pub trait MediaSource: Send + Sync {
    /// Block until the next input buffer is ready.
    fn read(&self) -> std::result::Result<CodecBuffer, SourceError>;

    /// The codec no longer needs `id`.
    fn buffer_returned(&self, id: BufferId);
}

/// One encoded access-unit buffer.
#[derive(Debug, Clone)]
pub struct CodecOutput {
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub codec_config: bool,
}

/// Pull-model codec. Once started it drives input through the
/// [`MediaSource`] it was given.
pub trait CodecBackend: Send {
    fn configure(&mut self, config: &EncoderConfig) -> Result<()>;

    fn start(&mut self, source: Arc<dyn MediaSource>) -> Result<()>;

    /// Flush and stop. Buffers still held are returned through the source.
    fn stop(&mut self) -> Result<()>;

    /// Produce the next encoded buffer, pulling input as needed.
    fn read(&mut self) -> Result<CodecOutput>;

    fn request_key_frame(&mut self) {}
}
