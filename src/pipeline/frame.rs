//! Reference-counted media frames shared between pipeline stages

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

/// Shared, read-only frame handle passed between stages.
///
/// A frame is mutated only while it is still an owned [`Frame`]; once frozen
/// into a `FrameRef` it can only be read or released.
pub type FrameRef = Arc<Frame>;

/// Opaque reference to memory owned outside the pipeline (GPU buffer,
/// driver-managed surface, ...). The core never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Observer told when a consumer is done with a frame.
///
/// Registered weakly: the frame never keeps its producer alive.
pub trait FrameDelegate: Send + Sync {
    fn on_frame_finished(&self, frame: &Frame);
}

enum Storage {
    Owned(BytesMut),
    External(NativeHandle),
}

pub struct Frame {
    storage: Storage,
    offset: usize,
    length: usize,
    /// Capture time in microseconds
    timestamp: i64,
    delegate: Mutex<Option<Weak<dyn FrameDelegate>>>,
}

impl Frame {
    /// Owned frame of `capacity` zeroed bytes; the range covers all of it.
    pub fn with_capacity(capacity: usize, timestamp: i64) -> Self {
        Self {
            storage: Storage::Owned(BytesMut::zeroed(capacity)),
            offset: 0,
            length: capacity,
            timestamp,
            delegate: Mutex::new(None),
        }
    }

    /// Owned frame holding a copy of `data`.
    pub fn from_slice(data: &[u8], timestamp: i64) -> Self {
        Self {
            storage: Storage::Owned(BytesMut::from(data)),
            offset: 0,
            length: data.len(),
            timestamp,
            delegate: Mutex::new(None),
        }
    }

    /// Frame wrapping externally owned memory. Has no byte storage.
    pub fn from_handle(handle: NativeHandle) -> Self {
        Self {
            storage: Storage::External(handle),
            offset: 0,
            length: 0,
            timestamp: 0,
            delegate: Mutex::new(None),
        }
    }

    /// Restrict the readable window to `[offset, offset + length)`.
    ///
    /// Out-of-bounds ranges and handle-backed frames are left untouched;
    /// returns whether the range was applied.
    pub fn set_range(&mut self, offset: usize, length: usize) -> bool {
        let capacity = match &self.storage {
            Storage::Owned(data) => data.len(),
            Storage::External(_) => return false,
        };
        match offset.checked_add(length) {
            Some(end) if end <= capacity => {
                self.offset = offset;
                self.length = length;
                true
            }
            _ => false,
        }
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    pub fn set_delegate(&mut self, delegate: Weak<dyn FrameDelegate>) {
        *self.delegate.get_mut() = Some(delegate);
    }

    /// Freeze into a shared handle.
    pub fn into_shared(self) -> FrameRef {
        Arc::new(self)
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(data) => data.len(),
            Storage::External(_) => 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Bytes inside the current range. Empty for handle-backed frames.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(data) => &data[self.offset..self.offset + self.length],
            Storage::External(_) => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(data) => &mut data[self.offset..self.offset + self.length],
            Storage::External(_) => &mut [],
        }
    }

    pub fn native_handle(&self) -> Option<NativeHandle> {
        match self.storage {
            Storage::External(handle) => Some(handle),
            Storage::Owned(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        match &self.storage {
            Storage::Owned(data) => !data.is_empty(),
            Storage::External(_) => true,
        }
    }

    /// Tell the delegate this frame is finished. Fires at most once; later
    /// calls, or calls without a delegate, do nothing.
    pub fn release(&self) {
        // Take the delegate out before calling it so a re-entrant release from
        // inside the callback sees an empty slot.
        let delegate = self.delegate.lock().take();
        let Some(delegate) = delegate else {
            return;
        };
        match delegate.upgrade() {
            Some(delegate) => delegate.on_frame_finished(self),
            None => trace!("frame delegate already gone"),
        }
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate.lock().is_some()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Backing memory must be handed back even if nobody released us.
        if self.delegate.get_mut().is_some() {
            self.release();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Frame");
        debug.field("timestamp", &self.timestamp);
        match &self.storage {
            Storage::Owned(data) => debug
                .field("capacity", &data.len())
                .field("offset", &self.offset)
                .field("length", &self.length),
            Storage::External(handle) => debug.field("handle", handle),
        };
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDelegate {
        finished: AtomicUsize,
    }

    impl FrameDelegate for CountingDelegate {
        fn on_frame_finished(&self, _frame: &Frame) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn delegated_frame(delegate: &Arc<CountingDelegate>) -> FrameRef {
        let mut frame = Frame::from_handle(NativeHandle(7));
        let weak: Weak<dyn FrameDelegate> = Arc::downgrade(delegate) as Weak<dyn FrameDelegate>;
        frame.set_delegate(weak);
        frame.into_shared()
    }

    #[test]
    fn owned_frame_defaults_to_full_range() {
        let frame = Frame::with_capacity(16, 42);
        assert_eq!(frame.capacity(), 16);
        assert_eq!(frame.len(), 16);
        assert_eq!(frame.offset(), 0);
        assert_eq!(frame.timestamp(), 42);
        assert!(frame.is_valid());
        assert!(frame.native_handle().is_none());
    }

    #[test]
    fn set_range_rejects_out_of_bounds() {
        let mut frame = Frame::from_slice(&[1, 2, 3, 4, 5, 6], 0);
        assert!(frame.set_range(2, 3));
        assert_eq!(frame.data(), &[3, 4, 5]);

        assert!(!frame.set_range(4, 3));
        assert!(!frame.set_range(usize::MAX, 2));
        assert_eq!(frame.data(), &[3, 4, 5]);
    }

    #[test]
    fn handle_frame_has_no_bytes() {
        let mut frame = Frame::from_handle(NativeHandle(3));
        assert!(!frame.set_range(0, 1));
        assert!(frame.data().is_empty());
        assert_eq!(frame.native_handle(), Some(NativeHandle(3)));
        assert!(frame.is_valid());
    }

    #[test]
    fn release_notifies_exactly_once() {
        let delegate = Arc::new(CountingDelegate::default());
        let frame = delegated_frame(&delegate);

        frame.release();
        frame.release();
        assert_eq!(delegate.finished.load(Ordering::SeqCst), 1);

        drop(frame);
        assert_eq!(delegate.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_without_delegate_is_noop() {
        let frame = Frame::with_capacity(4, 0).into_shared();
        frame.release();
        assert!(!frame.has_delegate());
    }

    #[test]
    fn dropping_unreleased_frame_notifies_delegate() {
        let delegate = Arc::new(CountingDelegate::default());
        let frame = delegated_frame(&delegate);
        let other_holder = Arc::clone(&frame);

        drop(frame);
        assert_eq!(delegate.finished.load(Ordering::SeqCst), 0);

        drop(other_holder);
        assert_eq!(delegate.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dead_delegate_is_ignored() {
        let delegate = Arc::new(CountingDelegate::default());
        let frame = delegated_frame(&delegate);
        drop(delegate);
        frame.release();
        assert!(!frame.has_delegate());
    }
}
