use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use super::codec::{BufferId, CodecBuffer};
use crate::pipeline::FrameRef;

struct PendingEntry {
    frame: FrameRef,
    descriptor: CodecBuffer,
}

/// Frames the codec currently holds, keyed by the buffer identity it was
/// given. Entries live from dispatch until the codec returns the buffer.
#[derive(Default)]
pub struct PendingBuffers {
    entries: Mutex<HashMap<BufferId, PendingEntry>>,
}

impl PendingBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: CodecBuffer, frame: FrameRef) {
        let mut entries = self.entries.lock();
        if entries
            .insert(descriptor.id, PendingEntry { frame, descriptor })
            .is_some()
        {
            warn!(buffer = descriptor.id.0, "buffer id dispatched twice");
        }
        metrics::gauge!("screencast_pending_buffers").set(entries.len() as f64);
    }

    /// Remove the entry for a returned buffer. A miss is logged and leaves
    /// the table untouched.
    pub fn take(&self, id: BufferId) -> Option<FrameRef> {
        let mut entries = self.entries.lock();
        match entries.remove(&id) {
            Some(entry) => {
                metrics::gauge!("screencast_pending_buffers").set(entries.len() as f64);
                Some(entry.frame)
            }
            None => {
                warn!(buffer = id.0, "didn't remember returned buffer");
                None
            }
        }
    }

    /// Empty the table, e.g. when the codec went away without returning.
    pub fn drain(&self) -> Vec<FrameRef> {
        let mut entries = self.entries.lock();
        let frames = entries.drain().map(|(_, entry)| entry.frame).collect();
        metrics::gauge!("screencast_pending_buffers").set(0.0);
        frames
    }

    pub fn descriptor(&self, id: BufferId) -> Option<CodecBuffer> {
        self.entries.lock().get(&id).map(|entry| entry.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
