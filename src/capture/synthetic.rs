//! In-process screen source backed by a native buffer pool

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{BufferPool, Capture, CaptureEvent};
use crate::error::{Error, Result};
use crate::pipeline::Listener;
use crate::CaptureConfig;

/// Screen source that hands out pool buffers as frames, one per swap.
///
/// Stands in for a compositor screencast: it owns a fixed number of
/// externally-owned buffers and skips a tick when all of them are still held
/// by the encoder.
pub struct SyntheticCapture {
    config: CaptureConfig,
    pool: Option<Arc<BufferPool>>,
    started_at: Option<Instant>,
    listener: Option<Listener<CaptureEvent>>,
    initialized: bool,
    sequence: u64,
}

impl SyntheticCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            pool: None,
            started_at: None,
            listener: None,
            initialized: false,
            sequence: 0,
        }
    }

    pub fn pool(&self) -> Option<&Arc<BufferPool>> {
        self.pool.as_ref()
    }

    fn emit(&self, event: CaptureEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }
}

impl Capture for SyntheticCapture {
    fn init(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(Error::Configuration(format!(
                "display reports {}x{}",
                self.config.width, self.config.height
            )));
        }
        if self.config.buffer_count == 0 {
            return Err(Error::Configuration("capture needs at least one buffer".into()));
        }
        self.initialized = true;
        debug!(
            width = self.config.width,
            height = self.config.height,
            "capture initialized"
        );
        Ok(())
    }

    fn width(&self) -> u32 {
        self.config.width
    }

    fn height(&self) -> u32 {
        self.config.height
    }

    fn start(&mut self) {
        if self.started_at.is_some() {
            warn!("tried to start a capture while already started");
            return;
        }
        if !self.initialized {
            if let Err(e) = self.init() {
                warn!("capture failed to initialize: {}", e);
                return;
            }
        }

        self.pool = Some(BufferPool::new(self.config.buffer_count));
        self.started_at = Some(Instant::now());
        self.sequence = 0;

        info!("started synthetic capture");
        self.emit(CaptureEvent::Started {
            width: self.config.width,
            height: self.config.height,
            framerate: self.config.refresh_rate,
        });
    }

    fn stop(&mut self) {
        if self.started_at.take().is_some() {
            info!(frames = self.sequence, "stopped synthetic capture");
        }
        // Frames still in flight hold only a weak link to the pool.
        self.pool = None;
    }

    fn swap_buffers(&mut self) {
        let (Some(pool), Some(started_at)) = (&self.pool, self.started_at) else {
            return;
        };
        let Some(mut frame) = pool.acquire() else {
            debug!("all capture buffers in flight, skipping swap");
            return;
        };
        frame.set_timestamp(started_at.elapsed().as_micros() as i64);
        self.sequence += 1;
        metrics::counter!("screencast_frames_captured_total").increment(1);
        self.emit(CaptureEvent::FrameAvailable(frame.into_shared()));
    }

    fn set_listener(&mut self, listener: Listener<CaptureEvent>) {
        self.listener = Some(listener);
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
