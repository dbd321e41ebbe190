//! Progress events and the callback seam the pipeline reports through.
//!
//! The controller never talks to subscribers directly. It hands every
//! [`ProgressEvent`] to an [`Arc<dyn ConversionProgressCallback>`]; the
//! [`crate::broadcast::ProgressHub`] implements the trait, so wiring a run to
//! live subscribers is a matter of passing the hub in.
//!
//! # Example
//!
//! ```rust
//! use pdf2md_pipeline::{ConversionProgressCallback, ProgressEvent};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     seen: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_progress(&self, event: ProgressEvent) {
//!         self.seen.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}: {:.0}%", event.task_id, event.progress);
//!     }
//! }
//!
//! let cb: Arc<dyn ConversionProgressCallback> =
//!     Arc::new(CountingCallback { seen: AtomicUsize::new(0) });
//! cb.on_progress(ProgressEvent::processing("task-1", 1, 4));
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle reported in a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Processing,
    Completed,
    Failed,
}

/// A transient status update for one task. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    /// Pages completed when the event was created. Units report
    /// concurrently, so successive events may carry this out of order.
    pub current_page: usize,
    /// Pages known so far (grows while the renderer is still producing).
    pub total_pages: usize,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub status: ProgressStatus,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl ProgressEvent {
    pub fn new(
        task_id: impl Into<String>,
        current_page: usize,
        total_pages: usize,
        progress: f64,
        status: ProgressStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            current_page,
            total_pages,
            progress: progress.clamp(0.0, 100.0),
            status,
            timestamp: unix_now(),
        }
    }

    /// `completed / total × 100`, with an empty total reading as 0 %.
    pub fn processing(task_id: impl Into<String>, completed: usize, total: usize) -> Self {
        let pct = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        Self::new(task_id, completed, total, pct, ProgressStatus::Processing)
    }

    pub fn completed(task_id: impl Into<String>, total: usize) -> Self {
        Self::new(task_id, total, total, 100.0, ProgressStatus::Completed)
    }

    pub fn failed(task_id: impl Into<String>, current_page: usize, total: usize) -> Self {
        let pct = if total == 0 {
            0.0
        } else {
            current_page as f64 / total as f64 * 100.0
        };
        Self::new(task_id, current_page, total, pct, ProgressStatus::Failed)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Receives progress from the pipeline.
///
/// Called concurrently from every conversion unit of a run, so
/// implementations must be `Send + Sync` and must not block.
pub trait ConversionProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = event;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type the pipeline accepts.
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ConversionProgressCallback for Recorder {
        fn on_progress(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn processing_percentage() {
        let e = ProgressEvent::processing("t", 1, 4);
        assert_eq!(e.progress, 25.0);
        assert_eq!(e.status, ProgressStatus::Processing);
    }

    #[test]
    fn empty_total_is_zero_percent() {
        assert_eq!(ProgressEvent::processing("t", 0, 0).progress, 0.0);
    }

    #[test]
    fn progress_is_clamped() {
        let e = ProgressEvent::new("t", 5, 4, 125.0, ProgressStatus::Processing);
        assert_eq!(e.progress, 100.0);
    }

    #[test]
    fn status_serialises_lowercase() {
        let json = serde_json::to_string(&ProgressEvent::completed("t", 3)).unwrap();
        assert!(json.contains("\"status\":\"completed\""), "got: {json}");
        assert!(json.contains("\"progress\":100.0"), "got: {json}");
    }

    #[test]
    fn noop_callback_does_not_panic() {
        NoopProgressCallback.on_progress(ProgressEvent::processing("t", 0, 1));
    }

    #[test]
    fn arc_dyn_callback_records() {
        let rec = Arc::new(Recorder {
            events: Mutex::new(vec![]),
        });
        let cb: ProgressCallback = rec.clone();
        cb.on_progress(ProgressEvent::processing("t", 1, 2));
        cb.on_progress(ProgressEvent::completed("t", 2));
        let events = rec.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, ProgressStatus::Completed);
    }
}
