//! tests/common/harness.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, PoisonError};
use std::time::{Duration, Instant};

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "deferral=info".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// A countdown latch released once `count_down` has been called `count` times.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<(Mutex<usize>, Condvar)>,
    fired: Arc<AtomicUsize>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(count), Condvar::new())),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count_down(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        let (remaining, signal) = &*self.inner;
        let mut remaining = remaining.lock().unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            signal.notify_all();
        }
    }

    /// Returns `true` if the latch reached zero within `limit`.
    pub fn wait(&self, limit: Duration) -> bool {
        let give_up = Instant::now() + limit;
        let (remaining, signal) = &*self.inner;
        let mut remaining = remaining.lock().unwrap_or_else(PoisonError::into_inner);
        while *remaining > 0 {
            let now = Instant::now();
            if now >= give_up {
                return false;
            }
            remaining = signal
                .wait_timeout(remaining, give_up - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Total number of `count_down` calls, including any past zero.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}
