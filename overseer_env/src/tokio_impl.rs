//! Production context: the poll loop runs on the Tokio runtime.

use crate::ObserverContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug_span, Instrument};

/// Context backed by the Tokio timer.
///
/// `now` is measured on Tokio's clock, so a runtime started with paused
/// time drives the refresh gate the same way the virtual clock does.
pub struct TokioContext {
    created: Instant,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObserverContext for TokioContext {
    fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Runs `future` on the runtime inside a span named after the task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(debug_span!("task", name = %name)));
    }
}
