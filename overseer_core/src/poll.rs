//! Poll loop - the observer's recurring refresh task.
//!
//! Every iteration sleeps one quantum, then asks the session to refresh if
//! at least `refresh_interval` has passed since the last remote query. The
//! session sits behind an async mutex held for the whole cycle, so two
//! cycles never overlap even if the loop is driven from several places.
//!
//! Shutdown is only observed while sleeping. A cycle that has started always
//! runs to completion, so a remote lock is never abandoned halfway.

use std::sync::Arc;
use std::time::Duration;

use overseer_env::ObserverContext;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::ObserverError;
use crate::observer::{CycleOutcome, ObserverSession};

/// Timing of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep before every iteration
    pub sleep_quantum: Duration,

    /// Minimum time between two remote step queries
    pub refresh_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            sleep_quantum: Duration::from_millis(25),
            refresh_interval: Duration::from_millis(1000),
        }
    }
}

/// Drives an [`ObserverSession`] on the context's clock.
pub struct PollLoop<Ctx: ObserverContext> {
    context: Arc<Ctx>,
    config: PollConfig,
    session: Arc<Mutex<ObserverSession>>,

    /// Context time of the last remote query, `None` before the first
    last_query: Option<Duration>,
}

impl<Ctx: ObserverContext> PollLoop<Ctx> {
    pub fn new(context: Arc<Ctx>, session: Arc<Mutex<ObserverSession>>, config: PollConfig) -> Self {
        Self {
            context,
            config,
            session,
            last_query: None,
        }
    }

    /// The guarded session, for readers outside the loop.
    pub fn session(&self) -> Arc<Mutex<ObserverSession>> {
        Arc::clone(&self.session)
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Sleeps one quantum, then polls once.
    pub async fn tick(&mut self) -> Result<CycleOutcome, ObserverError> {
        self.context.sleep(self.config.sleep_quantum).await;
        self.poll_once().await
    }

    /// Polls once without sleeping, subject to the refresh-interval gate.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, ObserverError> {
        let now = self.context.now();
        let mut session = self.session.lock().await;
        session.metrics_mut().cycles += 1;

        if let Some(last) = self.last_query {
            if now.saturating_sub(last) < self.config.refresh_interval {
                session.metrics_mut().throttled += 1;
                return Ok(CycleOutcome::Throttled);
            }
        }
        self.last_query = Some(now);

        session.refresh().await
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            quantum_ms = self.config.sleep_quantum.as_millis() as u64,
            interval_ms = self.config.refresh_interval.as_millis() as u64,
            "poll loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = self.context.sleep(self.config.sleep_quantum) => {}
            }

            match self.poll_once().await {
                Ok(CycleOutcome::Refreshed(report)) => {
                    debug!(step = report.observed_step, "cycle refreshed");
                }
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    warn!("Poll cycle failed, retrying next cycle: {}", err);
                }
                Err(err) => {
                    error!("Poll cycle failed: {}", err);
                }
            }
        }

        info!("poll loop stopped");
    }

    /// Spawns [`run`](Self::run) on the context.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) {
        let context = Arc::clone(&self.context);
        context.spawn("observer-poll", self.run(shutdown));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{shared, DoubleGridMirror};
    use crate::testing::{Call, ManualContext, MockCluster, MockDirectory};

    async fn poll_loop(
        cluster: &MockCluster,
        config: PollConfig,
    ) -> PollLoop<ManualContext> {
        let mut session = ObserverSession::connect(MockDirectory::shared(cluster))
            .await
            .unwrap();
        session.register_field("heat", shared(DoubleGridMirror::new()), 0);
        cluster.clear_calls();
        PollLoop::new(
            ManualContext::shared(),
            Arc::new(Mutex::new(session)),
            config,
        )
    }

    #[tokio::test]
    async fn test_refresh_interval_gate() {
        let cluster = MockCluster::new(2);
        let config = PollConfig {
            sleep_quantum: Duration::from_millis(25),
            refresh_interval: Duration::from_millis(100),
        };
        let mut poll = poll_loop(&cluster, config).await;

        // t = 25: first query always goes through
        assert!(poll.tick().await.unwrap().is_refreshed());
        // t = 50, 75, 100: inside the interval
        for _ in 0..3 {
            assert_eq!(poll.tick().await.unwrap(), CycleOutcome::Throttled);
        }
        // t = 125: 100 ms after the last query
        assert_eq!(
            poll.tick().await.unwrap(),
            CycleOutcome::Unchanged { step: 0 }
        );

        let metrics = poll.session().lock().await.metrics();
        assert_eq!(metrics.cycles, 5);
        assert_eq!(metrics.throttled, 3);
        assert_eq!(cluster.count(Call::StepCounter), 3);
    }

    #[tokio::test]
    async fn test_unchanged_step_means_no_fetch_and_no_ingest() {
        let cluster = MockCluster::new(3);
        cluster.set_step_all(4);
        let config = PollConfig {
            sleep_quantum: Duration::from_millis(10),
            refresh_interval: Duration::ZERO,
        };
        let mut poll = poll_loop(&cluster, config).await;
        assert!(poll.tick().await.unwrap().is_refreshed());
        cluster.clear_calls();

        for _ in 0..5 {
            assert_eq!(
                poll.tick().await.unwrap(),
                CycleOutcome::Unchanged { step: 4 }
            );
        }
        assert_eq!(cluster.count(Call::Fetch(0)), 0);
        assert_eq!(cluster.count(Call::Stats), 0);
        assert_eq!(cluster.count(Call::Lock), 0);

        cluster.set_step_all(5);
        assert!(poll.tick().await.unwrap().is_refreshed());
        assert_eq!(cluster.count(Call::Fetch(0)), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let cluster = MockCluster::new(1);
        let config = PollConfig {
            sleep_quantum: Duration::from_millis(5),
            refresh_interval: Duration::from_millis(20),
        };
        let poll = poll_loop(&cluster, config).await;
        let session = poll.session();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poll.run(rx));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let metrics = session.lock().await.metrics();
        assert!(metrics.cycles > 0);
        assert!(metrics.throttled > 0);
        assert_eq!(cluster.count(Call::Lock), cluster.count(Call::Unlock));
    }
}
