//! Capture → encode → mux orchestration

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use tracing::{debug, error, info, instrument, trace, warn};

use super::worker::{core_for, Worker, WorkerHandle};
use super::FrameQueue;
use crate::capture::{Capture, CaptureEvent};
use crate::encoder::{Encoder, EncoderEvent};
use crate::error::{Error, Result};
use crate::indicator::Indicator;
use crate::mux::{Mux, MuxEvent};
use crate::{Metrics, PipelineConfig};

type CaptureStage = Box<dyn Capture>;
type EncoderStage = Box<dyn Encoder>;
type MuxStage = Box<dyn Mux>;
type IndicatorStage = Box<dyn Indicator>;

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    captured: AtomicU64,
    encoded: AtomicU64,
    samples: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.captured.store(0, Ordering::Relaxed);
        self.encoded.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}

/// Periodic trigger on its own thread. Each tick asks capture for a frame
/// and every `report_every` ticks pushes the elapsed time to the indicator.
struct Ticker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn(
        interval: Duration,
        report_every: u64,
        started_at: Instant,
        capture: WorkerHandle<CaptureStage>,
        indicator: WorkerHandle<IndicatorStage>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("ticker".to_owned())
            .spawn(move || {
                let ticks = channel::tick(interval);
                loop {
                    channel::select! {
                        recv(ticks) -> _ => {
                            capture.invoke(|capture| capture.swap_buffers());
                            let n = counters.ticks.fetch_add(1, Ordering::Relaxed) + 1;
                            if report_every > 0 && n % report_every == 0 {
                                let elapsed = started_at.elapsed();
                                trace!(ticks = n, "tick");
                                indicator.invoke(move |indicator| indicator.update_elapsed(elapsed));
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        // Disconnecting wakes the select.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs capture, encoder, mux and indicator on dedicated workers and drives
/// them with a tick timer.
///
/// Capture frames flow to the encoder and encoded frames to the mux through
/// queued jobs on the receiving worker, so a slow stage never blocks the one
/// feeding it.
pub struct Recorder {
    // Field order is drop order: producers go before their consumers.
    ticker: Option<Ticker>,
    capture: Option<Worker<CaptureStage>>,
    encoder: Option<Worker<EncoderStage>>,
    mux: Option<Worker<MuxStage>>,
    indicator: Option<Worker<IndicatorStage>>,
    encoder_queue: Option<Arc<FrameQueue>>,
    counters: Arc<Counters>,
    started_at: Option<Instant>,
    last_elapsed: Duration,
    report_every: u64,
    pin_threads: bool,
}

impl Recorder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            ticker: None,
            capture: None,
            encoder: None,
            mux: None,
            indicator: None,
            encoder_queue: None,
            counters: Arc::new(Counters::default()),
            started_at: None,
            last_elapsed: Duration::ZERO,
            report_every: config.elapsed_report_every,
            pin_threads: config.pin_threads,
        }
    }

    pub fn is_setup(&self) -> bool {
        self.capture.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.ticker.is_some()
    }

    /// Move every stage onto its worker and connect their events.
    #[instrument(skip_all)]
    pub fn setup(
        &mut self,
        mut capture: CaptureStage,
        mut encoder: EncoderStage,
        mut mux: MuxStage,
        indicator: IndicatorStage,
    ) -> Result<()> {
        if self.is_setup() {
            return Err(Error::InvalidState {
                component: "recorder",
                state: "already set up",
            });
        }
        let counters = Arc::clone(&self.counters);
        mux.set_listener(Arc::new(move |event: MuxEvent| match event {
            MuxEvent::SampleAppended(timestamp) => {
                counters.samples.fetch_add(1, Ordering::Relaxed);
                trace!(timestamp, "sample appended");
            }
        }));
        let mux = Worker::spawn("mux", mux, core_for(2, self.pin_threads))?;

        let mux_handle = mux.handle();
        let counters = Arc::clone(&self.counters);
        encoder.set_listener(Arc::new(move |event: EncoderEvent| match event {
            EncoderEvent::FrameAvailable {
                frame,
                codec_config,
            } => {
                if !codec_config {
                    counters.encoded.fetch_add(1, Ordering::Relaxed);
                }
                mux_handle.invoke(move |mux| mux.add_buffer(frame, codec_config));
            }
            EncoderEvent::BufferReturned => trace!("buffer returned"),
            EncoderEvent::Started => debug!("encoder running"),
            EncoderEvent::Stopped => debug!("encoder stopped"),
            EncoderEvent::ReceivedInputBuffer(timestamp) => trace!(timestamp, "frame queued"),
            EncoderEvent::BeganFrame(timestamp) => trace!(timestamp, "frame began"),
            EncoderEvent::FinishedFrame(timestamp) => trace!(timestamp, "frame finished"),
        }));
        let encoder_queue = encoder.input_queue();
        let encoder = Worker::spawn("encoder", encoder, core_for(1, self.pin_threads))?;

        let encoder_handle = encoder.handle();
        let counters = Arc::clone(&self.counters);
        capture.set_listener(Arc::new(move |event: CaptureEvent| match event {
            CaptureEvent::Started {
                width,
                height,
                framerate,
            } => info!(width, height, framerate, "capture started"),
            CaptureEvent::FrameAvailable(frame) => {
                counters.captured.fetch_add(1, Ordering::Relaxed);
                encoder_handle.invoke(move |encoder| encoder.add_buffer(frame));
            }
        }));
        let capture = Worker::spawn("capture", capture, core_for(0, self.pin_threads))?;

        let indicator = Worker::spawn("indicator", indicator, None)?;

        self.capture = Some(capture);
        self.encoder = Some(encoder);
        self.mux = Some(mux);
        self.indicator = Some(indicator);
        self.encoder_queue = Some(encoder_queue);
        debug!("recorder set up");
        Ok(())
    }

    /// Start encoder and capture on their workers, then the tick timer.
    /// Returns without waiting for either stage.
    #[instrument(skip(self))]
    pub fn start(&mut self, framerate: f64, microphone: bool) -> Result<()> {
        let (Some(capture), Some(encoder), Some(indicator)) =
            (&self.capture, &self.encoder, &self.indicator)
        else {
            return Err(Error::InvalidState {
                component: "recorder",
                state: "not set up",
            });
        };
        if self.ticker.is_some() {
            warn!("recorder already started");
            return Ok(());
        }
        if !(framerate.is_finite() && framerate > 0.0) {
            return Err(Error::Configuration(format!("framerate {framerate}")));
        }
        if microphone {
            warn!("no microphone source available, recording video only");
        }

        self.counters.reset();
        let started_at = Instant::now();
        self.started_at = Some(started_at);
        self.last_elapsed = Duration::ZERO;

        indicator.invoke(|indicator| indicator.start());
        encoder.invoke(|encoder| encoder.start());
        capture.invoke(|capture| capture.start());

        self.ticker = Some(Ticker::spawn(
            Duration::from_secs_f64(1.0 / framerate),
            self.report_every,
            started_at,
            capture.handle(),
            indicator.handle(),
            Arc::clone(&self.counters),
        )?);
        info!(framerate, "recording started");
        Ok(())
    }

    /// Stop the timer, then capture, then encoder, each synchronously. Capture
    /// goes first so no frame reaches an encoder that already stopped.
    pub fn stop(&mut self) {
        let Some(mut ticker) = self.ticker.take() else {
            warn!("trying to stop a recorder that is not recording");
            return;
        };

        if let Some(indicator) = &self.indicator {
            indicator.invoke(|indicator| indicator.stop());
        }
        ticker.stop();
        if let Some(started_at) = self.started_at.take() {
            self.last_elapsed = started_at.elapsed();
        }

        if let Some(capture) = &self.capture {
            if let Err(e) = capture.invoke_blocking(|capture| capture.stop()) {
                error!("failed to stop capture: {}", e);
            }
        }
        // The codec may be parked waiting for input on the encoder worker.
        if let Some(queue) = &self.encoder_queue {
            queue.wake_and_fail();
        }
        if let Some(encoder) = &self.encoder {
            if let Err(e) = encoder.invoke_blocking(|encoder| encoder.stop()) {
                error!("failed to stop encoder: {}", e);
            }
        }
        info!(elapsed = ?self.last_elapsed, "recording stopped");
    }

    /// Finalize the container once every queued encoded frame was written.
    pub fn stop_mux(&mut self) {
        if let Some(mux) = &self.mux {
            if let Err(e) = mux.invoke_blocking(|mux| mux.stop()) {
                error!("failed to stop mux: {}", e);
            }
        }
    }

    pub fn request_key_frame(&self) {
        if let Some(encoder) = &self.encoder {
            encoder.invoke(|encoder| encoder.request_key_frame());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map_or(self.last_elapsed, |started_at| started_at.elapsed())
    }

    pub fn stats(&self) -> Metrics {
        Metrics {
            elapsed: self.elapsed(),
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_encoded: self.counters.encoded.load(Ordering::Relaxed),
            samples_written: self.counters.samples.load(Ordering::Relaxed),
            encoder_queue: self
                .encoder_queue
                .as_ref()
                .map(|queue| queue.stats())
                .unwrap_or_default(),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.ticker.is_some() {
            self.stop();
        }
    }
}
