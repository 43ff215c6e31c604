use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures_util::FutureExt;
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::Instrument;

use crate::{ErrorReporter, MessageHandler, MessageSource, ReceivedMessage};

/// Pause after a failed pull before trying again.
const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_MAX_OUTSTANDING: usize = 8;

/// Ack deadline, in seconds, requested for a message while its handler runs.
pub const LEASE_SECONDS: u32 = 30;

/// How often the deadline of a message being handled is pushed back. Shorter than the
/// smallest deadline a subscription can have.
const DEFAULT_LEASE_RENEWAL: Duration = Duration::from_secs(5);

/// Feeds messages from a [`MessageSource`] to a [`MessageHandler`].
///
/// Every message is acknowledged once its handler returns, whether it succeeded, failed or
/// panicked. Failures go to the [`ErrorReporter`] and never stop delivery of other messages.
pub struct Subscriber {
    source: Arc<dyn MessageSource>,
    reporter: Arc<dyn ErrorReporter>,
    max_outstanding: usize,
    lease_renewal: Duration,
}

impl Subscriber {
    pub fn new(source: Arc<dyn MessageSource>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            source,
            reporter,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            lease_renewal: DEFAULT_LEASE_RENEWAL,
        }
    }

    /// Limits the number of concurrently running handler invocations.
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding.max(1);
        self
    }

    /// Sets how often the ack deadline of a message is extended while it is handled.
    pub fn with_lease_renewal(mut self, interval: Duration) -> Self {
        self.lease_renewal = interval.max(Duration::from_millis(1));
        self
    }

    /// Starts delivery in the background and returns immediately.
    pub fn subscribe(self, handler: Arc<dyn MessageHandler>) -> SubscriptionHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(handler, stop_rx).in_current_span());
        SubscriptionHandle { stop_tx, task }
    }

    async fn run(self, handler: Arc<dyn MessageHandler>, mut stop_rx: watch::Receiver<bool>) {
        let mut in_flight = JoinSet::new();
        loop {
            while let Some(result) = in_flight.try_join_next() {
                log_join_error(result);
            }
            let capacity = self.max_outstanding.saturating_sub(in_flight.len());
            if capacity == 0 {
                tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    Some(result) = in_flight.join_next() => log_join_error(result),
                }
                continue;
            }

            let pulled = tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                pulled = self.source.pull(capacity) => pulled,
            };
            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!("Failed to pull messages: {e:#}");
                    tokio::select! {
                        _ = stopped(&mut stop_rx) => break,
                        _ = tokio::time::sleep(PULL_RETRY_DELAY) => continue,
                    }
                }
            };
            for received in messages {
                let span = tracing::info_span!("message", id = %received.message.id);
                in_flight.spawn(
                    handle_message(
                        self.source.clone(),
                        handler.clone(),
                        self.reporter.clone(),
                        received,
                        self.lease_renewal,
                    )
                    .instrument(span),
                );
            }
        }

        if !in_flight.is_empty() {
            tracing::info!("Waiting for {} in-flight message(s)", in_flight.len());
        }
        while let Some(result) = in_flight.join_next().await {
            log_join_error(result);
        }
        tracing::info!("Subscription stopped");
    }
}

/// Resolves once a stop was requested or the handle was dropped.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Message task failed: {e}");
    }
}

async fn handle_message(
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn MessageHandler>,
    reporter: Arc<dyn ErrorReporter>,
    received: ReceivedMessage,
    lease_renewal: Duration,
) {
    let ReceivedMessage { ack_id, message } = received;
    let ack_ids = std::slice::from_ref(&ack_id);
    let process = AssertUnwindSafe(handler.process_message(&message)).catch_unwind();
    let error = match keep_leased(source.as_ref(), ack_ids, lease_renewal, process).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => Some(anyhow!("Handler panicked: {}", panic_message(panic.as_ref()))),
    };
    if let Some(e) = error {
        reporter.report(&e, &message);
    }
    if let Err(e) = source.acknowledge(ack_ids).await {
        tracing::warn!("Failed to acknowledge message: {e:#}");
    }
}

/// Drives `future` to completion, extending the ack deadline of `ack_ids` every `interval`
/// so the channel does not redeliver them in the meantime.
async fn keep_leased<F: Future>(
    source: &dyn MessageSource,
    ack_ids: &[String],
    interval: Duration,
    future: F,
) -> F::Output {
    tokio::pin!(future);
    let mut renewal = tokio::time::interval_at(Instant::now() + interval, interval);
    renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            output = &mut future => return output,
            _ = renewal.tick() => {
                if let Err(e) = source.modify_ack_deadline(ack_ids, LEASE_SECONDS).await {
                    tracing::warn!("Failed to extend ack deadline: {e:#}");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// A running subscription.
///
/// Dropping the handle stops the subscription without waiting for it.
pub struct SubscriptionHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stops pulling new messages. Messages already being handled run to completion.
    pub fn stop(&self) { self.stop_tx.send_replace(true); }

    /// Waits for the subscription loop and every in-flight handler to finish.
    pub async fn wait(self) -> Result<()> {
        let Self { stop_tx, task } = self;
        let result = task.await.context("Subscription loop failed");
        drop(stop_tx);
        result
    }

    pub async fn stop_and_wait(self) -> Result<()> {
        self.stop();
        self.wait().await
    }
}
