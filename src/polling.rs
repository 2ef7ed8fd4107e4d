//! Fixed-cadence, single-flight background fetches.
//!
//! A [`PollingTask`] fires `fetch` every `cadence`. While one fetch is still
//! outstanding further ticks are skipped, not queued. Stopping the task (or
//! dropping it) ends the timer; a fetch already in flight may finish but its
//! result never reaches `apply`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

pub struct PollingTask {
    name: &'static str,
    cancel: CancellationToken,
}

impl PollingTask {
    /// Start polling. The first fetch happens one `cadence` from now; callers
    /// that need data immediately load it themselves before spawning.
    pub fn spawn<F, Fut, T, A>(name: &'static str, cadence: Duration, fetch: F, apply: A) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        A: Fn(T) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let busy = Arc::new(AtomicBool::new(false));
        let apply = Arc::new(apply);

        let token = cancel.clone();
        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + cadence, cadence);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = token.cancelled() => {
                        debug!(task = name, "polling stopped");
                        return;
                    }
                }

                if busy.swap(true, Ordering::AcqRel) {
                    debug!(task = name, "previous fetch still in flight, skipping tick");
                    continue;
                }

                let guard = BusyGuard(busy.clone());
                let fut = fetch();
                let apply = apply.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    match fut.await {
                        Ok(_) if token.is_cancelled() => {
                            warn!(task = name, "discarding result fetched after stop");
                        }
                        Ok(value) => apply(value),
                        Err(e) => warn!(task = name, error = %e, "poll failed"),
                    }
                });
            }
        });

        Self { name, cancel }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PollingTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Clears the in-flight flag however the fetch ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
