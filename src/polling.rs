//! Status confirmation after the details are submitted.
//!
//! Three things race: a poll loop asking the provider for the status, a
//! simulated completion standing in for the webhook the provider does not
//! always deliver, and an overall timeout. Whichever fires first decides; the
//! others are dropped with the `select!`.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::provider::{RemoteStatus, RemoteVideoId, StreamingProvider};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SIMULATED_COMPLETION: Duration = Duration::from_secs(15);
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingTimings {
    pub poll_interval: Duration,
    /// `None` waits for the poll or the timeout only.
    pub simulated_completion: Option<Duration>,
    pub timeout: Duration,
}

impl Default for ProcessingTimings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            simulated_completion: Some(DEFAULT_SIMULATED_COMPLETION),
            timeout: DEFAULT_PROCESSING_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    StatusPoll,
    SimulatedWebhook,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready(RemoteStatus),
    /// The ceiling passed without a ready answer.
    GaveUp { attempts: u32 },
}

/// Asks the provider for a video's status at a fixed interval. No backoff.
pub struct StatusPoller {
    provider: Arc<dyn StreamingProvider>,
    interval: Duration,
    ceiling: Duration,
}

impl StatusPoller {
    pub fn new(provider: Arc<dyn StreamingProvider>, interval: Duration, ceiling: Duration) -> Self {
        Self {
            provider,
            interval,
            ceiling,
        }
    }

    pub async fn wait_until_ready(&self, id: &RemoteVideoId) -> PollOutcome {
        let deadline = Instant::now() + self.ceiling;
        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; processing never finishes
        // that fast, so skip it.
        ticks.tick().await;
        let mut attempts = 0;
        loop {
            ticks.tick().await;
            if Instant::now() > deadline {
                return PollOutcome::GaveUp { attempts };
            }
            attempts += 1;
            match self.provider.video_status(id).await {
                Ok(status) if status.is_ready() => {
                    debug!(video = %id, ?status, attempts, "provider reports ready");
                    return PollOutcome::Ready(status);
                }
                Ok(status) => debug!(video = %id, ?status, "still processing"),
                Err(err) => warn!(video = %id, error = %err, "status poll failed"),
            }
        }
    }
}

async fn simulated_completion(after: Option<Duration>) {
    match after {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Runs the race and reports which branch won.
pub async fn confirm_processing(
    provider: Arc<dyn StreamingProvider>,
    id: &RemoteVideoId,
    timings: ProcessingTimings,
) -> CompletionSource {
    let poller = StatusPoller::new(provider, timings.poll_interval, timings.timeout);
    // A poller that gave up only pends, so the timeout arm decides.
    let poll = async {
        if let PollOutcome::GaveUp { attempts } = poller.wait_until_ready(id).await {
            debug!(video = %id, attempts, "status poll gave up");
            std::future::pending::<()>().await;
        }
    };
    let source = tokio::select! {
        _ = poll => CompletionSource::StatusPoll,
        _ = simulated_completion(timings.simulated_completion) => CompletionSource::SimulatedWebhook,
        _ = tokio::time::sleep(timings.timeout) => CompletionSource::Timeout,
    };
    info!(video = %id, ?source, "processing confirmed");
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::FakeProvider;
    use std::sync::atomic::Ordering;

    fn id() -> RemoteVideoId {
        RemoteVideoId::new("remote-1")
    }

    #[tokio::test(start_paused = true)]
    async fn poller_stops_once_ready() {
        let provider = Arc::new(FakeProvider::with_statuses(&[
            RemoteStatus::Processing,
            RemoteStatus::Processing,
            RemoteStatus::Finished,
        ]));
        let poller = StatusPoller::new(provider.clone(), DEFAULT_POLL_INTERVAL, DEFAULT_PROCESSING_TIMEOUT);
        let started = Instant::now();
        let outcome = poller.wait_until_ready(&id()).await;
        assert_eq!(outcome, PollOutcome::Ready(RemoteStatus::Finished));
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed().as_secs(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_gives_up_at_the_ceiling() {
        let provider = Arc::new(FakeProvider::with_statuses(&[RemoteStatus::Processing]));
        let poller = StatusPoller::new(provider.clone(), Duration::from_secs(2), Duration::from_secs(10));
        let outcome = poller.wait_until_ready(&id()).await;
        assert_eq!(outcome, PollOutcome::GaveUp { attempts: 5 });
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_before_the_simulated_completion_wins() {
        let provider = Arc::new(FakeProvider::with_statuses(&[
            RemoteStatus::Processing,
            RemoteStatus::Transcoding,
        ]));
        let started = Instant::now();
        let source = confirm_processing(provider, &id(), ProcessingTimings::default()).await;
        assert_eq!(source, CompletionSource::StatusPoll);
        assert!(started.elapsed() < DEFAULT_SIMULATED_COMPLETION);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_completion_fires_after_fifteen_seconds() {
        let provider = Arc::new(FakeProvider::with_statuses(&[RemoteStatus::Processing]));
        let started = Instant::now();
        let source = confirm_processing(provider, &id(), ProcessingTimings::default()).await;
        assert_eq!(source, CompletionSource::SimulatedWebhook);
        assert_eq!(started.elapsed().as_secs(), DEFAULT_SIMULATED_COMPLETION.as_secs());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_forces_completion_when_nothing_else_fires() {
        let provider = Arc::new(FakeProvider::with_statuses(&[RemoteStatus::Processing]));
        let timings = ProcessingTimings {
            simulated_completion: None,
            ..ProcessingTimings::default()
        };
        let started = Instant::now();
        let source = confirm_processing(provider, &id(), timings).await;
        assert_eq!(source, CompletionSource::Timeout);
        assert_eq!(started.elapsed().as_secs(), DEFAULT_PROCESSING_TIMEOUT.as_secs());
    }
}
