use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Inner {
    messages: u64,
    errors: u64,
    samples: VecDeque<f64>,
}

/// Per-node request counters and a rolling response-time window.
///
/// Every handled request is counted and timed, success or not; the error
/// counter moves only on handler faults. The mean is over the last
/// `window` samples, not the process lifetime.
#[derive(Clone)]
pub struct NodeMetrics {
    inner: Arc<RwLock<Inner>>,
    window: usize,
    started_at: Instant,
}

impl NodeMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                messages: 0,
                errors: 0,
                samples: VecDeque::with_capacity(window),
            })),
            window,
            started_at: Instant::now(),
        }
    }

    pub async fn record_request(&self, elapsed: Duration) {
        let mut inner = self.inner.write().await;
        inner.messages += 1;
        if inner.samples.len() >= self.window {
            inner.samples.pop_front();
        }
        inner.samples.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    pub async fn record_error(&self) {
        self.inner.write().await.errors += 1;
    }

    pub async fn messages(&self) -> u64 {
        self.inner.read().await.messages
    }

    pub async fn errors(&self) -> u64 {
        self.inner.read().await.errors
    }

    /// Arithmetic mean of the windowed samples, in milliseconds.
    pub async fn average_response_time(&self) -> f64 {
        let inner = self.inner.read().await;
        if inner.samples.is_empty() {
            return 0.0;
        }
        inner.samples.iter().sum::<f64>() / inner.samples.len() as f64
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Resident set size of this process, if the platform exposes it.
pub fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // statm reports pages; 4 KiB pages assumed
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
