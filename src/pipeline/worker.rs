//! Dedicated execution contexts for pipeline stages
//!
//! Each stage object is moved onto its own thread and only touched through
//! jobs posted to that thread's mailbox, so a slow mux write never stalls
//! capture and a codec blocking in its read callback never stalls the tick.

use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Job<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Owns a stage thread. Dropping it closes the mailbox and joins the thread
/// once every outstanding [`WorkerHandle`] is gone.
pub struct Worker<T> {
    name: &'static str,
    tx: Option<Sender<Job<T>>>,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable sender side of a worker mailbox.
pub struct WorkerHandle<T> {
    name: &'static str,
    tx: Sender<Job<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Move `stage` onto a new thread called `name`. With `core` set, the
    /// thread pins itself to that CPU first.
    pub fn spawn(name: &'static str, stage: T, core: Option<core_affinity::CoreId>) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<Job<T>>();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(name, stage, rx, core))?;
        Ok(Self {
            name,
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle<T> {
        WorkerHandle {
            name: self.name,
            tx: self
                .tx
                .clone()
                .unwrap_or_else(|| flume::unbounded().0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a job without waiting for it.
    pub fn invoke(&self, job: impl FnOnce(&mut T) + Send + 'static) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                warn!(worker = self.name, "dropping job, worker has exited");
            }
        }
    }

    /// Run a job on the worker thread and wait for its result.
    pub fn invoke_blocking<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut T) -> R + Send + 'static,
    ) -> Result<R> {
        match &self.tx {
            Some(tx) => call(self.name, tx, job),
            None => Err(Error::WorkerGone(self.name)),
        }
    }
}

impl<T: Send + 'static> WorkerHandle<T> {
    pub fn invoke(&self, job: impl FnOnce(&mut T) + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            debug!(worker = self.name, "dropping job, worker has exited");
        }
    }

    pub fn invoke_blocking<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut T) -> R + Send + 'static,
    ) -> Result<R> {
        call(self.name, &self.tx, job)
    }
}

impl<T> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

fn call<T: Send + 'static, R: Send + 'static>(
    name: &'static str,
    tx: &Sender<Job<T>>,
    job: impl FnOnce(&mut T) -> R + Send + 'static,
) -> Result<R> {
    if thread::current().name() == Some(name) {
        // Waiting on our own mailbox would deadlock.
        return Err(Error::InvalidState {
            component: name,
            state: "called from its own worker thread",
        });
    }
    let (reply_tx, reply_rx) = flume::bounded(1);
    tx.send(Box::new(move |stage: &mut T| {
        let _ = reply_tx.send(job(stage));
    }))
    .map_err(|_| Error::WorkerGone(name))?;
    reply_rx.recv().map_err(|_| Error::WorkerGone(name))
}

fn run<T>(name: &'static str, mut stage: T, rx: Receiver<Job<T>>, core: Option<core_affinity::CoreId>) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(core) {
            warn!(worker = name, core = core.id, "failed to pin worker thread");
        }
    }
    debug!(worker = name, "worker started");
    while let Ok(job) = rx.recv() {
        job(&mut stage);
    }
    debug!(worker = name, "worker finished");
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = self.name, "worker thread panicked");
            }
        }
    }
}

/// Pick a core for the `index`-th worker when pinning is enabled.
pub fn core_for(index: usize, pin: bool) -> Option<core_affinity::CoreId> {
    if !pin {
        return None;
    }
    let cores = core_affinity::get_core_ids()?;
    if cores.is_empty() {
        return None;
    }
    Some(cores[index % cores.len()])
}
