//! Per-instance trailing-edge debouncer.
//!
//! A burst of `schedule` calls within the window collapses into a single
//! callback run after the burst settles. Each controller owns its own
//! debouncer state (timer generation + cancel switch) so `destroy()` can
//! reliably stop in-flight timers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trailing-edge window used by the sync pipeline.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Trailing-edge debouncer. Cheap to clone-by-Arc via its inner atomics.
pub struct Debouncer {
    window: Duration,
    generation: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Arm (or re-arm) the timer. The callback runs on a tokio task after
    /// the window elapses with no newer `schedule` call. Must be called
    /// within a tokio runtime.
    pub fn schedule<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.armed.store(true, Ordering::SeqCst);

        let latest = Arc::clone(&self.generation);
        let cancelled = Arc::clone(&self.cancelled);
        let armed = Arc::clone(&self.armed);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if latest.load(Ordering::SeqCst) != generation {
                return; // superseded by a newer call
            }
            armed.store(false, Ordering::SeqCst);
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            callback();
        });
    }

    /// Permanently disarm. Any in-flight timer becomes a no-op; later
    /// `schedule` calls are ignored.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether a timer is currently armed.
    pub fn pending(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}
