use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use common::metrics;
use domain::codec::encode_event;
use domain::envelope::EventEnvelope;
use domain::topics;
use messaging::BusPublisher;
use saga::{SagaEngine, SagaStore};

const SWEEP_BATCH: i64 = 100;

/// Background sweeper for sagas stuck in a non-terminal state beyond the
/// stage timeout. It synthesizes the stage's failure event onto the events
/// topic, so the forced transition flows through the same
/// consume-apply-persist cycle as a real reply.
pub struct Reaper {
    store: Arc<dyn SagaStore>,
    publisher: Arc<dyn BusPublisher>,
    interval: Duration,
    stage_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn SagaStore>,
        publisher: Arc<dyn BusPublisher>,
        interval: Duration,
        stage_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            publisher,
            interval,
            stage_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            stage_timeout_secs = self.stage_timeout.as_secs(),
            "Starting saga reaper"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }

        info!("Saga reaper stopped");
    }

    async fn sweep(&self) {
        let timeout = match chrono::Duration::from_std(self.stage_timeout) {
            Ok(timeout) => timeout,
            Err(e) => {
                error!(error = %e, "Stage timeout out of range, skipping sweep");
                return;
            }
        };
        let cutoff = chrono::Utc::now() - timeout;

        let stale = match self.store.find_stale(cutoff, SWEEP_BATCH).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "Reaper scan failed");
                return;
            }
        };

        for record in stale {
            let Some(event) = SagaEngine::timeout_event_for(&record) else {
                continue;
            };

            let envelope = EventEnvelope::new(record.saga_id, event);
            let payload = match encode_event(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(saga_id = %record.saga_id, error = %e, "Failed to encode timeout event");
                    continue;
                }
            };

            match self
                .publisher
                .send(topics::CHECKOUT_EVENTS, record.saga_id, payload)
                .await
            {
                Ok(()) => {
                    metrics::record_reaped(&record.state.to_string());
                    warn!(
                        saga_id = %record.saga_id,
                        state = %record.state,
                        event_type = envelope.event.name(),
                        updated_at = %record.updated_at,
                        "Synthesized timeout event for stuck saga"
                    );
                }
                Err(e) => {
                    // The next sweep picks the saga up again.
                    error!(saga_id = %record.saga_id, error = %e, "Failed to publish timeout event");
                }
            }
        }
    }
}
