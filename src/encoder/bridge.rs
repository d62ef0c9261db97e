//! Push-to-pull adapter between the pipeline and a codec backend

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use super::codec::{BufferId, CodecBackend, CodecBuffer, MediaSource, SourceError};
use super::pending::PendingBuffers;
use super::{Encoder, EncoderConfig, EncoderEvent};
use crate::error::{Error, Result};
use crate::pipeline::{Frame, FrameQueue, FrameRef, Listener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Configured,
    Running,
    Stopped,
}

impl EncoderState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the codec sees as its input. Shared between the encoder and the
/// backend, which may call in from its own threads.
struct SourceBridge {
    queue: Arc<FrameQueue>,
    pending: PendingBuffers,
    running: AtomicBool,
    next_id: AtomicU64,
    read_timeout: Option<Duration>,
    listener: RwLock<Option<Listener<EncoderEvent>>>,
}

impl SourceBridge {
    fn emit(&self, event: EncoderEvent) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    /// Release every frame still owned on the codec's behalf.
    fn release_all(&self) {
        for frame in self.pending.drain() {
            frame.release();
        }
        for frame in self.queue.drain() {
            frame.release();
        }
    }
}

impl MediaSource for SourceBridge {
    fn read(&self) -> std::result::Result<CodecBuffer, SourceError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SourceError::NotConnected);
        }
        let frame = self
            .queue
            .next(self.read_timeout)
            .ok_or(SourceError::EndOfStream)?;

        let Some(handle) = frame.native_handle() else {
            warn!("ignoring input buffer without a native handle");
            frame.release();
            return Err(SourceError::EndOfStream);
        };

        let descriptor = CodecBuffer {
            id: BufferId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            handle,
            timestamp: frame.timestamp(),
        };
        self.pending.insert(descriptor, frame);
        self.emit(EncoderEvent::BeganFrame(descriptor.timestamp));
        Ok(descriptor)
    }

    fn buffer_returned(&self, id: BufferId) {
        if let Some(frame) = self.pending.take(id) {
            frame.release();
            trace!(buffer = id.0, "codec returned input buffer");
            self.emit(EncoderEvent::BufferReturned);
        }
    }
}

/// [`Encoder`] driving a pull-model [`CodecBackend`].
///
/// Raw frames are queued by `add_buffer`, each call then pulls one encoded
/// buffer out of the codec. The codec reads queued frames through the
/// bridge and returns them once it no longer references their memory, at
/// which point the frame is released to its producer.
pub struct CodecEncoder<B: CodecBackend> {
    backend: B,
    state: EncoderState,
    bridge: Arc<SourceBridge>,
    config: Option<EncoderConfig>,
}

impl<B: CodecBackend> CodecEncoder<B> {
    /// Encoder with an unbounded input queue that waits indefinitely for
    /// input when the codec asks for it.
    pub fn new(backend: B) -> Self {
        Self::with_queue(backend, FrameQueue::unbounded(), None)
    }

    pub fn with_queue(backend: B, queue: FrameQueue, read_timeout: Option<Duration>) -> Self {
        Self {
            backend,
            state: EncoderState::Idle,
            bridge: Arc::new(SourceBridge {
                queue: Arc::new(queue),
                pending: PendingBuffers::new(),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                read_timeout,
                listener: RwLock::new(None),
            }),
            config: None,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn config(&self) -> Option<&EncoderConfig> {
        self.config.as_ref()
    }

    pub fn pending_buffers(&self) -> usize {
        self.bridge.pending.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn start_backend(&mut self) -> bool {
        self.bridge.queue.reset();
        self.bridge.running.store(true, Ordering::Release);
        let source: Arc<dyn MediaSource> = self.bridge.clone();
        if let Err(e) = self.backend.start(source) {
            error!("failed to start encoder: {}", e);
            self.bridge.running.store(false, Ordering::Release);
            return false;
        }
        self.state = EncoderState::Running;
        info!("encoder started");
        self.bridge.emit(EncoderEvent::Started);
        true
    }
}

impl<B: CodecBackend> Encoder for CodecEncoder<B> {
    fn configure(&mut self, config: &EncoderConfig) -> Result<()> {
        if !matches!(self.state, EncoderState::Idle | EncoderState::Configured) {
            return Err(Error::InvalidState {
                component: "encoder",
                state: self.state.as_str(),
            });
        }

        let (width, height) = config.scaled_size();
        let effective = EncoderConfig {
            width,
            height,
            ..config.clone()
        };
        debug!(
            width,
            height,
            bitrate = effective.bitrate,
            framerate = effective.framerate,
            "configuring encoder"
        );
        self.backend
            .configure(&effective)
            .map_err(|e| Error::Configuration(format!("failed to configure encoder: {e}")))?;

        self.config = Some(effective);
        self.state = EncoderState::Configured;
        Ok(())
    }

    fn start(&mut self) {
        match self.state {
            EncoderState::Running => debug!("encoder already running"),
            EncoderState::Idle => warn!("encoder started before it was configured"),
            EncoderState::Configured | EncoderState::Stopped => {
                self.start_backend();
            }
        }
    }

    fn stop(&mut self) {
        if self.state != EncoderState::Running {
            return;
        }

        // A codec parked in the read callback has to give up first.
        self.bridge.queue.wake_and_fail();
        if let Err(e) = self.backend.stop() {
            error!("failed to stop encoder: {}", e);
            self.bridge.queue.reset();
            return;
        }

        self.bridge.running.store(false, Ordering::Release);
        self.bridge.release_all();
        self.state = EncoderState::Stopped;
        info!("encoder stopped");
        self.bridge.emit(EncoderEvent::Stopped);
    }

    fn add_buffer(&mut self, frame: FrameRef) {
        match self.state {
            EncoderState::Running => {}
            EncoderState::Configured => {
                if !self.start_backend() {
                    frame.release();
                    return;
                }
            }
            state => {
                warn!(%state, "encoder not accepting buffers");
                frame.release();
                return;
            }
        }

        let timestamp = frame.timestamp();
        self.bridge.queue.push(frame);
        self.bridge.emit(EncoderEvent::ReceivedInputBuffer(timestamp));

        if self.bridge.queue.is_failed() {
            // Shutting down: the frame waits in the queue for stop to release it.
            trace!(timestamp, "input queue woken, not reading from codec");
            return;
        }

        match self.backend.read() {
            Ok(output) => {
                self.bridge.emit(EncoderEvent::FinishedFrame(output.timestamp));
                let encoded = Frame::from_slice(&output.data, output.timestamp).into_shared();
                if !output.codec_config {
                    metrics::counter!("screencast_frames_encoded_total").increment(1);
                }
                self.bridge.emit(EncoderEvent::FrameAvailable {
                    frame: encoded,
                    codec_config: output.codec_config,
                });
            }
            Err(e) => error!("failed to read a new buffer from encoder: {}", e),
        }
    }

    fn request_key_frame(&mut self) {
        if self.state == EncoderState::Running {
            self.backend.request_key_frame();
        }
    }

    fn input_queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.bridge.queue)
    }

    fn set_listener(&mut self, listener: Listener<EncoderEvent>) {
        *self.bridge.listener.write() = Some(listener);
    }
}

impl<B: CodecBackend> Drop for CodecEncoder<B> {
    fn drop(&mut self) {
        self.stop();
        self.bridge.running.store(false, Ordering::Release);
        self.bridge.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::BufferPool;
    use crate::encoder::LoopbackCodec;
    use parking_lot::Mutex;

    fn config() -> EncoderConfig {
        EncoderConfig {
            width: 640,
            height: 480,
            ..EncoderConfig::default_config()
        }
    }

    fn recording(encoder: &mut CodecEncoder<LoopbackCodec>) -> Arc<Mutex<Vec<EncoderEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        encoder.set_listener(Arc::new(move |event| sink.lock().push(event)));
        events
    }

    /// Backend whose configure always fails.
    struct Unsupported;

    impl CodecBackend for Unsupported {
        fn configure(&mut self, _: &EncoderConfig) -> Result<()> {
            Err(Error::Codec("no such format".into()))
        }
        fn start(&mut self, _: Arc<dyn MediaSource>) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn read(&mut self) -> Result<crate::encoder::CodecOutput> {
            Err(Error::Codec("not running".into()))
        }
    }

    /// Backend that pulls one frame per read, never returns buffers, and
    /// refuses to start or stop on demand.
    #[derive(Default)]
    struct Stubborn {
        refuse_start: bool,
        refuse_stop: AtomicBool,
        source: Option<Arc<dyn MediaSource>>,
    }

    impl CodecBackend for Stubborn {
        fn configure(&mut self, _: &EncoderConfig) -> Result<()> {
            Ok(())
        }
        fn start(&mut self, source: Arc<dyn MediaSource>) -> Result<()> {
            if self.refuse_start {
                return Err(Error::Codec("device busy".into()));
            }
            self.source = Some(source);
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            if self.refuse_stop.load(Ordering::SeqCst) {
                return Err(Error::Codec("still draining".into()));
            }
            self.source = None;
            Ok(())
        }
        fn read(&mut self) -> Result<crate::encoder::CodecOutput> {
            let source = self
                .source
                .as_ref()
                .ok_or_else(|| Error::Codec("not running".into()))?;
            let buffer = source.read().map_err(|e| Error::Codec(e.to_string()))?;
            Ok(crate::encoder::CodecOutput {
                data: vec![0, 0, 1, 0x65, 0x88],
                timestamp: buffer.timestamp,
                codec_config: false,
            })
        }
    }

    #[derive(Default)]
    struct Releases(std::sync::atomic::AtomicUsize);

    impl crate::pipeline::FrameDelegate for Releases {
        fn on_frame_finished(&self, _frame: &Frame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn refused_stop_keeps_encoder_running() {
        let pool = BufferPool::new(4);
        let mut encoder = CodecEncoder::new(Stubborn {
            refuse_stop: AtomicBool::new(true),
            ..Stubborn::default()
        });
        encoder.configure(&config()).unwrap();
        encoder.start();
        encoder.add_buffer(pool.acquire().unwrap().into_shared());
        assert_eq!(pool.in_use(), 1);

        encoder.stop();
        assert_eq!(encoder.state(), EncoderState::Running);
        assert!(!encoder.input_queue().is_failed());
        assert_eq!(encoder.pending_buffers(), 1);
        assert_eq!(pool.in_use(), 1);

        // Still usable after the refusal.
        encoder.add_buffer(pool.acquire().unwrap().into_shared());
        assert_eq!(encoder.pending_buffers(), 2);

        encoder.backend().refuse_stop.store(false, Ordering::SeqCst);
        encoder.stop();
        assert_eq!(encoder.state(), EncoderState::Stopped);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn failed_lazy_start_releases_the_frame() {
        let pool = BufferPool::new(2);
        let mut encoder = CodecEncoder::new(Stubborn {
            refuse_start: true,
            ..Stubborn::default()
        });
        encoder.configure(&config()).unwrap();

        encoder.add_buffer(pool.acquire().unwrap().into_shared());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(encoder.state(), EncoderState::Configured);
        assert!(encoder.input_queue().is_empty());
        assert_eq!(encoder.pending_buffers(), 0);
    }

    #[test]
    fn frame_without_native_handle_ends_the_pull() {
        let releases = Arc::new(Releases::default());
        let delegated = || {
            let mut frame = Frame::from_slice(&[1, 2, 3, 4], 5);
            let delegate: Arc<dyn crate::pipeline::FrameDelegate> = releases.clone();
            frame.set_delegate(Arc::downgrade(&delegate));
            frame.into_shared()
        };

        let mut encoder = CodecEncoder::new(Stubborn::default());
        encoder.configure(&config()).unwrap();
        encoder.start();

        // Through the codec: the read fails and nothing reaches the table.
        encoder.add_buffer(delegated());
        assert_eq!(releases.0.load(Ordering::SeqCst), 1);
        assert_eq!(encoder.pending_buffers(), 0);

        // Straight at the callback.
        let source: Arc<dyn MediaSource> = encoder.bridge.clone();
        encoder.input_queue().push(delegated());
        assert_eq!(source.read().unwrap_err(), SourceError::EndOfStream);
        assert_eq!(releases.0.load(Ordering::SeqCst), 2);
        assert_eq!(encoder.pending_buffers(), 0);
        assert!(encoder.input_queue().is_empty());
    }

    #[test]
    fn configure_failure_is_reported() {
        let mut encoder = CodecEncoder::new(Unsupported);
        assert!(matches!(
            encoder.configure(&config()),
            Err(Error::Configuration(_))
        ));
        assert_eq!(encoder.state(), EncoderState::Idle);
    }

    #[test]
    fn unconfigured_encoder_releases_frames() {
        let pool = BufferPool::new(1);
        let mut encoder = CodecEncoder::new(LoopbackCodec::new());
        encoder.add_buffer(pool.acquire().unwrap().into_shared());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(encoder.state(), EncoderState::Idle);
    }

    #[test]
    fn encodes_and_returns_buffers() {
        let pool = BufferPool::new(4);
        let mut encoder = CodecEncoder::new(LoopbackCodec::new());
        let events = recording(&mut encoder);
        encoder.configure(&config()).unwrap();

        for ts in [0, 33_333, 66_666] {
            let mut frame = pool.acquire().unwrap();
            frame.set_timestamp(ts);
            encoder.add_buffer(frame.into_shared());
        }
        assert_eq!(encoder.state(), EncoderState::Running);

        let events = events.lock();
        let outputs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EncoderEvent::FrameAvailable {
                    frame,
                    codec_config,
                } => Some((frame.timestamp(), *codec_config)),
                _ => None,
            })
            .collect();
        // Setup data first, then one slice per consumed frame.
        assert_eq!(outputs, vec![(0, true), (0, false), (33_333, false)]);
        assert!(events.iter().any(|e| matches!(e, EncoderEvent::Started)));
        assert!(events
            .iter()
            .any(|e| matches!(e, EncoderEvent::BufferReturned)));
    }

    #[test]
    fn stop_releases_everything_and_rejects_late_frames() {
        let pool = BufferPool::new(4);
        let mut encoder = CodecEncoder::new(LoopbackCodec::new());
        let events = recording(&mut encoder);
        encoder.configure(&config()).unwrap();
        encoder.start();
        for _ in 0..3 {
            encoder.add_buffer(pool.acquire().unwrap().into_shared());
        }
        assert!(pool.in_use() > 0);

        encoder.stop();
        assert_eq!(encoder.state(), EncoderState::Stopped);
        assert_eq!(encoder.pending_buffers(), 0);
        assert_eq!(pool.in_use(), 0);
        assert!(matches!(events.lock().last(), Some(EncoderEvent::Stopped)));

        encoder.add_buffer(pool.acquire().unwrap().into_shared());
        assert_eq!(pool.in_use(), 0);

        // Second stop is a no-op.
        encoder.stop();
        assert!(matches!(encoder.configure(&config()), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn codec_gives_up_reading_once_queue_is_woken() {
        let mut encoder = CodecEncoder::new(LoopbackCodec::new());
        encoder.configure(&config()).unwrap();
        encoder.start();
        let queue = encoder.input_queue();
        queue.wake_and_fail();

        let source: Arc<dyn MediaSource> = encoder.bridge.clone();
        assert_eq!(source.read().unwrap_err(), SourceError::EndOfStream);
        encoder.stop();
        assert_eq!(source.read().unwrap_err(), SourceError::NotConnected);
    }
}
