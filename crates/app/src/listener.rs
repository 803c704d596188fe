use std::{any::Any, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use fitness_core::generator::{GeneratorError, RecommendationGenerator};
use fitness_core::types::{Activity, ActivityDecodeError, Recommendation};
use fitness_storage::{PersistOutcome, RecommendationError, RecommendationRepository};

use crate::channel::{ActivityChannel, ChannelError, Delivery};

/// Destination for generated recommendations. Writes must be idempotent per activity.
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn persist(
        &self,
        recommendation: &Recommendation,
    ) -> Result<PersistOutcome, RecommendationError>;
}

#[async_trait]
impl RecommendationStore for RecommendationRepository {
    async fn persist(
        &self,
        recommendation: &Recommendation,
    ) -> Result<PersistOutcome, RecommendationError> {
        RecommendationRepository::persist(self, recommendation, Utc::now()).await
    }
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Deliveries allowed before a transiently failing message is dead-lettered.
    pub max_attempts: u32,
    /// Sleep between polls of an empty channel.
    pub poll_interval: Duration,
    /// Base delay before a nacked message becomes visible; multiplied by the attempt count.
    pub retry_backoff: Duration,
}

/// Per-worker consumption states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Receiving,
    Processing,
    Acked,
    Nacked,
    DeadLettered,
}

impl ListenerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Receiving => "receiving",
            Self::Processing => "processing",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// How a failed delivery was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    PoisonMessage,
    Transient,
    Fatal,
    RetriesExhausted,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PoisonMessage => "poison_message",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acked(PersistOutcome),
    Nacked,
    DeadLettered(FailureClass),
}

impl ProcessOutcome {
    fn state(self) -> ListenerState {
        match self {
            Self::Acked(_) => ListenerState::Acked,
            Self::Nacked => ListenerState::Nacked,
            Self::DeadLettered(_) => ListenerState::DeadLettered,
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            Self::Acked(_) => "acked",
            Self::Nacked => "nacked",
            Self::DeadLettered(_) => "dead_lettered",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("malformed activity payload: {0}")]
    Poison(#[from] ActivityDecodeError),
    #[error("recommendation generation failed: {0}")]
    Generate(#[from] GeneratorError),
    #[error("failed to persist recommendation: {0}")]
    Persist(#[from] RecommendationError),
    #[error("processing panicked: {0}")]
    Panicked(String),
    #[error("processing was cancelled")]
    Cancelled,
}

impl ProcessingError {
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Poison(_) => FailureClass::PoisonMessage,
            Self::Generate(err) if err.is_transient() => FailureClass::Transient,
            Self::Persist(err) if err.is_transient() => FailureClass::Transient,
            Self::Cancelled => FailureClass::Transient,
            Self::Generate(_) | Self::Persist(_) | Self::Panicked(_) => FailureClass::Fatal,
        }
    }
}

/// Binds the activity channel to the generator and the recommendation store.
pub struct EventListener<C, G, S> {
    channel: Arc<C>,
    generator: Arc<G>,
    store: Arc<S>,
    settings: ListenerSettings,
}

impl<C, G, S> EventListener<C, G, S>
where
    C: ActivityChannel + 'static,
    G: RecommendationGenerator + 'static,
    S: RecommendationStore + 'static,
{
    pub fn new(channel: Arc<C>, generator: Arc<G>, store: Arc<S>, settings: ListenerSettings) -> Self {
        Self {
            channel,
            generator,
            store,
            settings,
        }
    }

    /// Starts `workers` consumption loops that stop once `shutdown` turns `true`.
    pub fn spawn(
        self: Arc<Self>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|worker| {
                let listener = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { listener.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(stage = "listener", worker, "activity listener worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once(worker).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    error!(stage = "listener", worker, error = %err, "activity channel error");
                    true
                }
            };
            transition(worker, ListenerState::Idle);

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(stage = "listener", worker, "activity listener worker stopped");
    }

    /// Runs one `Receiving -> Processing -> Acked | Nacked | DeadLettered` cycle.
    ///
    /// Returns `Ok(None)` when the channel had nothing to deliver.
    pub async fn poll_once(&self, worker: usize) -> Result<Option<ProcessOutcome>, ChannelError> {
        transition(worker, ListenerState::Receiving);
        let Some(delivery) = self.channel.receive().await? else {
            return Ok(None);
        };
        self.handle(worker, delivery).await.map(Some)
    }

    /// Processes a leased delivery and settles it on the channel.
    pub async fn handle(
        &self,
        worker: usize,
        delivery: Delivery,
    ) -> Result<ProcessOutcome, ChannelError> {
        transition(worker, ListenerState::Processing);
        debug!(stage = "listener", worker, message_id = %delivery.message_id, attempts = delivery.attempts, "processing activity");

        // A delivery past its budget was leased before and never settled.
        if delivery.attempts > self.settings.max_attempts {
            let outcome = self.exhausted(worker, &delivery).await?;
            counter!("listener_messages_total", "outcome" => outcome.metric_label()).increment(1);
            transition(worker, outcome.state());
            return Ok(outcome);
        }

        let outcome = match self.process_isolated(&delivery).await {
            Ok(persisted) => {
                // Ack strictly after the store accepted the write.
                self.channel.ack(&delivery).await?;
                counter!("recommendations_persisted_total", "outcome" => persisted.as_str())
                    .increment(1);
                info!(
                    stage = "listener",
                    worker,
                    message_id = %delivery.message_id,
                    persisted = persisted.as_str(),
                    "activity processed"
                );
                ProcessOutcome::Acked(persisted)
            }
            Err(err) => self.settle_failure(worker, &delivery, &err).await?,
        };

        counter!("listener_messages_total", "outcome" => outcome.metric_label()).increment(1);
        transition(worker, outcome.state());
        Ok(outcome)
    }

    /// Runs decode, generate and persist on their own task so a panic fails
    /// only this delivery.
    async fn process_isolated(&self, delivery: &Delivery) -> Result<PersistOutcome, ProcessingError> {
        let generator = Arc::clone(&self.generator);
        let store = Arc::clone(&self.store);
        let payload = delivery.payload.clone();
        let task = tokio::spawn(async move {
            let activity = Activity::decode(&payload)?;
            let recommendation = generator.generate(&activity).await?;
            let persisted = store.persist(&recommendation).await?;
            Ok::<_, ProcessingError>(persisted)
        });

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(ProcessingError::Panicked(panic_message(err.into_panic())))
            }
            Err(_) => Err(ProcessingError::Cancelled),
        }
    }

    async fn exhausted(&self, worker: usize, delivery: &Delivery) -> Result<ProcessOutcome, ChannelError> {
        let class = FailureClass::RetriesExhausted;
        let reason = format!(
            "{}: delivered {} times without being settled",
            class.as_str(),
            delivery.attempts
        );
        self.channel.dead_letter(delivery, &reason).await?;
        error!(
            stage = "listener",
            worker,
            message_id = %delivery.message_id,
            attempts = delivery.attempts,
            class = class.as_str(),
            "activity dead-lettered"
        );
        Ok(ProcessOutcome::DeadLettered(class))
    }

    async fn settle_failure(
        &self,
        worker: usize,
        delivery: &Delivery,
        err: &ProcessingError,
    ) -> Result<ProcessOutcome, ChannelError> {
        let class = match err.classify() {
            FailureClass::Transient if delivery.attempts < self.settings.max_attempts => {
                let retry_after = self.settings.retry_backoff * delivery.attempts;
                self.channel.nack(delivery, retry_after).await?;
                warn!(
                    stage = "listener",
                    worker,
                    message_id = %delivery.message_id,
                    attempts = delivery.attempts,
                    retry_after_ms = retry_after.as_millis() as u64,
                    error = %err,
                    "activity processing failed; scheduled redelivery"
                );
                return Ok(ProcessOutcome::Nacked);
            }
            FailureClass::Transient => FailureClass::RetriesExhausted,
            other => other,
        };

        let reason = format!("{}: {err}", class.as_str());
        self.channel.dead_letter(delivery, &reason).await?;
        error!(
            stage = "listener",
            worker,
            message_id = %delivery.message_id,
            attempts = delivery.attempts,
            class = class.as_str(),
            error = %err,
            "activity dead-lettered"
        );
        Ok(ProcessOutcome::DeadLettered(class))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
    }
}

fn transition(worker: usize, state: ListenerState) {
    trace!(stage = "listener", worker, state = state.as_str(), "listener state");
}
