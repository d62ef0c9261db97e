pub mod pool;
pub mod synthetic;

pub use pool::BufferPool;
pub use synthetic::SyntheticCapture;

use crate::error::Result;
use crate::pipeline::{FrameRef, Listener};

/// Events emitted by a capture source.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Started { width: u32, height: u32, framerate: f64 },
    FrameAvailable(FrameRef),
}

/// Screen source producing one frame per [`swap_buffers`](Capture::swap_buffers).
pub trait Capture: Send {
    /// Connect to the display and learn its dimensions.
    fn init(&mut self) -> Result<()>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn start(&mut self);

    fn stop(&mut self);

    /// Request the next frame; delivered through the listener.
    fn swap_buffers(&mut self);

    fn set_listener(&mut self, listener: Listener<CaptureEvent>);
}

impl<C: Capture + ?Sized> Capture for Box<C> {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn width(&self) -> u32 {
        (**self).width()
    }

    fn height(&self) -> u32 {
        (**self).height()
    }

    fn start(&mut self) {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn swap_buffers(&mut self) {
        (**self).swap_buffers()
    }

    fn set_listener(&mut self, listener: Listener<CaptureEvent>) {
        (**self).set_listener(listener)
    }
}
