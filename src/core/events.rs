// ─── Update Events ───
// Progress, errors and state changes are published onto a channel the UI
// subscribes to, instead of callbacks threaded through every layer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::error::{ErrorKind, UpdaterError};
use crate::core::update::UpdateState;

/// Coarse phase a progress event belongs to.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Preparing,
    Download,
    Patch,
    RuntimeDeps,
    Launch,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    Progress {
        stage: ProgressStage,
        percent: u8,
        message_key: String,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        technical_detail: String,
    },
    StateChanged {
        state: UpdateState,
        exit_code: Option<i32>,
    },
}

/// Publishing side of the event channel. A sink without a receiver
/// silently drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<UpdateEvent>>,
    /// Highest percentage published so far; later reports never go below it.
    floor: Arc<AtomicU8>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                floor: Arc::new(AtomicU8::new(0)),
            },
            rx,
        )
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Sink on the same channel with its own progress floor, so one run's
    /// percentages never clamp another's.
    pub fn for_run(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            floor: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn progress(
        &self,
        stage: ProgressStage,
        percent: f32,
        message_key: &str,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
    ) {
        let requested = percent.clamp(0.0, 100.0).round() as u8;
        let previous = self.floor.fetch_max(requested, Ordering::SeqCst);
        self.send(UpdateEvent::Progress {
            stage,
            percent: requested.max(previous),
            message_key: message_key.to_string(),
            downloaded_bytes,
            total_bytes,
        });
    }

    pub fn error(&self, error: &UpdaterError) {
        self.send(UpdateEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
            technical_detail: format!("{error:?}"),
        });
    }

    pub fn state_changed(&self, state: UpdateState, exit_code: Option<i32>) {
        self.send(UpdateEvent::StateChanged { state, exit_code });
    }

    fn send(&self, event: UpdateEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// A slice `[start, end]` of the overall 0–100 progress bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressBand {
    pub start: f32,
    pub end: f32,
}

impl ProgressBand {
    pub const fn new(start: f32, end: f32) -> Self {
        Self { start, end }
    }

    /// Map a stage-local fraction in `[0, 1]` into this band.
    pub fn map(&self, fraction: f32) -> f32 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.start + (self.end - self.start) * fraction
    }

    /// The `index`-th of `count` equal sub-bands.
    pub fn slice(&self, index: usize, count: usize) -> Self {
        let count = count.max(1) as f32;
        let width = (self.end - self.start) / count;
        let start = self.start + width * index as f32;
        Self::new(start, start + width)
    }

    /// Split at `ratio` into a leading and trailing band.
    pub fn split(&self, ratio: f32) -> (Self, Self) {
        let middle = self.map(ratio);
        (Self::new(self.start, middle), Self::new(middle, self.end))
    }
}

/// Progress reporter bound to one stage and one band of the bar.
#[derive(Debug, Clone)]
pub struct ProgressScope<'a> {
    sink: &'a EventSink,
    stage: ProgressStage,
    message_key: &'static str,
    band: ProgressBand,
}

impl<'a> ProgressScope<'a> {
    pub fn new(
        sink: &'a EventSink,
        stage: ProgressStage,
        message_key: &'static str,
        band: ProgressBand,
    ) -> Self {
        Self {
            sink,
            stage,
            message_key,
            band,
        }
    }

    pub fn report(&self, fraction: f32, downloaded_bytes: Option<u64>, total_bytes: Option<u64>) {
        self.sink.progress(
            self.stage,
            self.band.map(fraction),
            self.message_key,
            downloaded_bytes,
            total_bytes,
        );
    }

    pub fn band(&self) -> ProgressBand {
        self.band
    }
}
