//! Frame handoff, stage execution contexts and orchestration

use std::sync::Arc;

pub mod controller;
pub mod frame;
pub mod queue;
pub mod recorder;
pub mod worker;

pub use controller::{BackendFactory, Backends, Controller, DefaultBackends};
pub use frame::{Frame, FrameDelegate, FrameRef, NativeHandle};
pub use queue::{FrameQueue, QueueStats};
pub use recorder::Recorder;
pub use worker::{Worker, WorkerHandle};

/// Event callback a stage invokes from whatever thread produced the event.
/// Receivers that need their own context forward into a worker mailbox.
pub type Listener<E> = Arc<dyn Fn(E) + Send + Sync>;
