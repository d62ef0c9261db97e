//! Fixed set of externally-owned capture buffers

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::pipeline::{Frame, FrameDelegate, NativeHandle};

/// Hands out native buffer handles and takes them back when the consumer
/// releases the wrapping frame.
pub struct BufferPool {
    in_use: Mutex<Vec<bool>>,
}

impl BufferPool {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            in_use: Mutex::new(vec![false; count]),
        })
    }

    /// Wrap the next free buffer in a frame whose release returns the buffer
    /// here. `None` when every buffer is still held downstream.
    pub fn acquire(self: &Arc<Self>) -> Option<Frame> {
        let slot = {
            let mut in_use = self.in_use.lock();
            let slot = in_use.iter().position(|used| !used)?;
            in_use[slot] = true;
            slot
        };
        let mut frame = Frame::from_handle(NativeHandle(slot as u64));
        let delegate: Weak<dyn FrameDelegate> = Arc::downgrade(self) as Weak<dyn FrameDelegate>;
        frame.set_delegate(delegate);
        Some(frame)
    }

    pub fn capacity(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().iter().filter(|used| **used).count()
    }
}

impl FrameDelegate for BufferPool {
    fn on_frame_finished(&self, frame: &Frame) {
        let Some(NativeHandle(id)) = frame.native_handle() else {
            warn!("released frame carries no native handle");
            return;
        };
        let mut in_use = self.in_use.lock();
        match in_use.get_mut(id as usize) {
            Some(used) if *used => {
                *used = false;
                trace!(buffer = id, "capture buffer reclaimed");
            }
            Some(_) => warn!(buffer = id, "capture buffer returned twice"),
            None => warn!(buffer = id, "unknown capture buffer returned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_come_back_on_release() {
        let pool = BufferPool::new(2);
        let a = pool.acquire().unwrap().into_shared();
        let b = pool.acquire().unwrap().into_shared();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        a.release();
        assert_eq!(pool.in_use(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(c.native_handle(), a.native_handle());

        drop(b);
        assert_eq!(pool.in_use(), 1);
        drop(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn frames_outliving_pool_release_quietly() {
        let pool = BufferPool::new(1);
        let frame = pool.acquire().unwrap().into_shared();
        drop(pool);
        frame.release();
        assert!(!frame.has_delegate());
    }
}
