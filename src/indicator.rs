//! Recording indicator shown to the user while a session runs

use std::time::Duration;

use tracing::info;

/// Fire-and-forget status surface. Calls come from the indicator worker.
pub trait Indicator: Send {
    fn start(&mut self);

    fn stop(&mut self);

    fn update_elapsed(&mut self, elapsed: Duration);
}

impl<I: Indicator + ?Sized> Indicator for Box<I> {
    fn start(&mut self) {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn update_elapsed(&mut self, elapsed: Duration) {
        (**self).update_elapsed(elapsed)
    }
}

/// Reports the session through the log.
#[derive(Debug, Default)]
pub struct LogIndicator {
    visible: bool,
    last: Duration,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn last_elapsed(&self) -> Duration {
        self.last
    }
}

/// `mm:ss`, or `h:mm:ss` past the hour.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

impl Indicator for LogIndicator {
    fn start(&mut self) {
        self.visible = true;
        self.last = Duration::ZERO;
        info!("recording");
    }

    fn stop(&mut self) {
        if self.visible {
            info!(elapsed = %format_elapsed(self.last), "recording finished");
        }
        self.visible = false;
    }

    fn update_elapsed(&mut self, elapsed: Duration) {
        if !self.visible {
            return;
        }
        self.last = elapsed;
        info!("recording {}", format_elapsed(elapsed));
    }
}
