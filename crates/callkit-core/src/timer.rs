use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Whole-second call duration counter driven by a background ticker.
///
/// The counter only advances while a ticker is running. `stop` aborts the
/// ticker immediately; the last value is kept until the next `start`.
pub struct CallTimer {
    elapsed: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self {
            elapsed: Arc::new(AtomicU64::new(0)),
            ticker: None,
        }
    }

    /// Reset to zero and start ticking once per second.
    pub fn start(&mut self) {
        self.stop();
        self.elapsed.store(0, Ordering::SeqCst);

        let elapsed = self.elapsed.clone();
        self.ticker = Some(tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                elapsed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }
}

impl Default for CallTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Format whole seconds as zero-padded `mm:ss`. Minutes keep counting past 59.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
