//! Condition watcher - turns a change feed into a single readiness signal.

use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use packo_core::{ChangeEvent, ConditionStatus, ConditionType, WatchFilter};

use crate::error::StoreError;
use crate::store::ChangeFeed;

/// State of a [`ConditionWatcher`]. `Ready` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for the condition to become True.
    Watching,
    /// The condition was observed True.
    Ready,
    /// The watch ended without observing the condition.
    Aborted,
}

impl WatchState {
    /// Returns true if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Watching)
    }
}

/// Why a watch was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The context was cancelled.
    Cancelled,
    /// The feed ended.
    FeedClosed,
    /// The feed reported an error.
    FeedError(StoreError),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::FeedClosed => f.write_str("subscription closed"),
            Self::FeedError(e) => write!(f, "{}", e),
        }
    }
}

/// The single completion signal of a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The condition became True; carries the build counter seen at that moment.
    Ready { build: Option<u64> },
    /// The watch ended first.
    Aborted(AbortReason),
}

/// Watches one resource for one condition becoming True.
///
/// Emits exactly one [`WatchOutcome`] through a oneshot channel, which never
/// blocks even if the receiver is gone. Delete events cause no transition.
pub struct ConditionWatcher {
    filter: WatchFilter,
    condition: ConditionType,
    min_build: Option<u64>,
    state: WatchState,
    signal: Option<oneshot::Sender<WatchOutcome>>,
}

impl ConditionWatcher {
    /// Create a watcher and the receiver of its completion signal.
    pub fn new(
        filter: WatchFilter,
        condition: ConditionType,
    ) -> (Self, oneshot::Receiver<WatchOutcome>) {
        let (tx, rx) = oneshot::channel();
        let watcher = Self {
            filter,
            condition,
            min_build: None,
            state: WatchState::Watching,
            signal: Some(tx),
        };
        (watcher, rx)
    }

    /// Builder method to only accept the condition from build `n` or later.
    ///
    /// A record still carrying an older build's conditions is not ready yet.
    pub fn with_min_build(mut self, min_build: Option<u64>) -> Self {
        self.min_build = min_build;
        self
    }

    /// Current state.
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Feed one change event through the state machine.
    pub fn observe(&mut self, event: &ChangeEvent) -> WatchState {
        if self.state.is_terminal() || !self.filter.matches_event(event) {
            return self.state;
        }
        if event.is_delete() {
            debug!(job = %self.filter.name, "Ignoring delete event");
            return self.state;
        }

        let record = event.record();
        if let Some(min) = self.min_build {
            if record.status.latest_build.map_or(true, |build| build < min) {
                trace!(
                    job = %self.filter.name,
                    build = ?record.status.latest_build,
                    min_build = min,
                    "Ignoring status of an earlier build"
                );
                return self.state;
            }
        }

        match record.status.condition_status(&self.condition) {
            ConditionStatus::True => {
                info!(
                    job = %self.filter.name,
                    build = ?record.status.latest_build,
                    condition = %self.condition,
                    "Build ready"
                );
                self.finish(
                    WatchState::Ready,
                    WatchOutcome::Ready {
                        build: record.status.latest_build,
                    },
                );
            }
            ConditionStatus::False => {
                let message = record
                    .status
                    .condition(&self.condition)
                    .and_then(|c| c.message.clone())
                    .unwrap_or_default();
                warn!(
                    job = %self.filter.name,
                    build = ?record.status.latest_build,
                    message = %message,
                    "Build not ready"
                );
            }
            ConditionStatus::Unknown => {
                trace!(job = %self.filter.name, event = event.kind(), "Build in progress");
            }
        }
        self.state
    }

    /// Abort the watch. No effect once terminal.
    pub fn abort(&mut self, reason: AbortReason) -> WatchState {
        if !self.state.is_terminal() {
            debug!(job = %self.filter.name, reason = %reason, "Watch aborted");
            self.finish(WatchState::Aborted, WatchOutcome::Aborted(reason));
        }
        self.state
    }

    fn finish(&mut self, state: WatchState, outcome: WatchOutcome) {
        self.state = state;
        if let Some(signal) = self.signal.take() {
            // The receiver may already be gone; the outcome is then moot.
            let _ = signal.send(outcome);
        }
    }

    /// Drive the state machine from `feed` until it is terminal.
    ///
    /// The feed is dropped on return, closing the subscription.
    pub async fn run(mut self, mut feed: ChangeFeed, cancel: CancellationToken) -> WatchState {
        while !self.state.is_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abort(AbortReason::Cancelled);
                }
                next = feed.next() => match next {
                    Some(Ok(event)) => {
                        self.observe(&event);
                    }
                    Some(Err(e)) => {
                        self.abort(AbortReason::FeedError(e));
                    }
                    None => {
                        self.abort(AbortReason::FeedClosed);
                    }
                },
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packo_core::{BuildRecord, BuildRequest, BuilderRef, JobName, SourceRef};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn record(name: &str, ready: ConditionStatus, build: u64) -> BuildRecord {
        let mut record = BuildRecord::from_request(BuildRequest::new(
            JobName::new(name),
            "default",
            format!("registry.local/{}", name),
            SourceRef::new("registry.local/source@sha256:00"),
            BuilderRef::cluster_builder("default-builder"),
        ));
        record.status.latest_build = Some(build);
        record
            .status
            .set_condition(ConditionType::ready(), ready, None);
        record
    }

    fn watcher(name: &str) -> (ConditionWatcher, oneshot::Receiver<WatchOutcome>) {
        ConditionWatcher::new(
            WatchFilter::new("default", JobName::new(name)),
            ConditionType::ready(),
        )
    }

    #[test]
    fn test_ready_on_true_condition() {
        let (mut w, mut rx) = watcher("controller");

        assert_eq!(
            w.observe(&ChangeEvent::Added(record("controller", ConditionStatus::Unknown, 1))),
            WatchState::Watching
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            w.observe(&ChangeEvent::Updated(record("controller", ConditionStatus::True, 1))),
            WatchState::Ready
        );
        assert_eq!(rx.try_recv().unwrap(), WatchOutcome::Ready { build: Some(1) });
    }

    #[test]
    fn test_duplicate_ready_events_signal_once() {
        let (mut w, mut rx) = watcher("webhook");
        let ready = ChangeEvent::Updated(record("webhook", ConditionStatus::True, 3));

        w.observe(&ready);
        w.observe(&ready);
        w.observe(&ChangeEvent::Added(record("webhook", ConditionStatus::True, 4)));

        assert_eq!(w.state(), WatchState::Ready);
        assert_eq!(rx.try_recv().unwrap(), WatchOutcome::Ready { build: Some(3) });
        // Sender consumed by the first signal: channel is now closed, not pending.
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[test]
    fn test_abort_after_ready_is_ignored() {
        let (mut w, _rx) = watcher("rebase");
        w.observe(&ChangeEvent::Updated(record("rebase", ConditionStatus::True, 1)));
        assert_eq!(w.abort(AbortReason::Cancelled), WatchState::Ready);
    }

    #[test]
    fn test_delete_and_foreign_events_are_ignored() {
        let (mut w, mut rx) = watcher("completion");

        w.observe(&ChangeEvent::Deleted(record("completion", ConditionStatus::True, 1)));
        w.observe(&ChangeEvent::Updated(record("build-init", ConditionStatus::True, 1)));

        assert_eq!(w.state(), WatchState::Watching);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_earlier_build_ready_is_not_accepted() {
        let (w, mut rx) = watcher("rebase");
        let mut w = w.with_min_build(Some(2));

        // Replay of the previous attempt's final state.
        w.observe(&ChangeEvent::Added(record("rebase", ConditionStatus::True, 1)));
        assert_eq!(w.state(), WatchState::Watching);
        assert!(rx.try_recv().is_err());

        w.observe(&ChangeEvent::Updated(record("rebase", ConditionStatus::Unknown, 2)));
        w.observe(&ChangeEvent::Updated(record("rebase", ConditionStatus::True, 2)));
        assert_eq!(w.state(), WatchState::Ready);
        assert_eq!(rx.try_recv().unwrap(), WatchOutcome::Ready { build: Some(2) });
    }

    #[test]
    fn test_false_condition_keeps_watching() {
        let (mut w, _rx) = watcher("build-init");
        w.observe(&ChangeEvent::Updated(record("build-init", ConditionStatus::False, 2)));
        assert_eq!(w.state(), WatchState::Watching);
    }

    #[test]
    fn test_signal_does_not_block_without_receiver() {
        let (mut w, rx) = watcher("controller");
        drop(rx);
        w.observe(&ChangeEvent::Updated(record("controller", ConditionStatus::True, 1)));
        assert_eq!(w.state(), WatchState::Ready);
    }

    #[tokio::test]
    async fn test_run_until_ready() {
        let (w, rx) = watcher("controller");
        let (tx, feed_rx) = mpsc::channel(8);
        let feed: ChangeFeed = Box::pin(ReceiverStream::new(feed_rx));

        tx.send(Ok(ChangeEvent::Added(record("controller", ConditionStatus::Unknown, 1))))
            .await
            .unwrap();
        tx.send(Ok(ChangeEvent::Updated(record("controller", ConditionStatus::True, 1))))
            .await
            .unwrap();

        let state = w.run(feed, CancellationToken::new()).await;
        assert_eq!(state, WatchState::Ready);
        assert_eq!(rx.await.unwrap(), WatchOutcome::Ready { build: Some(1) });
    }

    #[tokio::test]
    async fn test_run_aborts_on_cancel() {
        let (w, rx) = watcher("controller");
        let (_tx, feed_rx) = mpsc::channel::<Result<ChangeEvent, StoreError>>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = w.run(Box::pin(ReceiverStream::new(feed_rx)), cancel).await;
        assert_eq!(state, WatchState::Aborted);
        assert_eq!(rx.await.unwrap(), WatchOutcome::Aborted(AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn test_run_aborts_when_feed_drops() {
        let (w, rx) = watcher("rebase");
        let (tx, feed_rx) = mpsc::channel(8);
        tx.send(Err(StoreError::Watch("connection reset".to_string())))
            .await
            .unwrap();

        let state = w
            .run(Box::pin(ReceiverStream::new(feed_rx)), CancellationToken::new())
            .await;
        assert_eq!(state, WatchState::Aborted);
        assert!(matches!(
            rx.await.unwrap(),
            WatchOutcome::Aborted(AbortReason::FeedError(StoreError::Watch(_)))
        ));

        let (w, rx) = watcher("rebase");
        let (tx, feed_rx) = mpsc::channel::<Result<ChangeEvent, StoreError>>(8);
        drop(tx);
        w.run(Box::pin(ReceiverStream::new(feed_rx)), CancellationToken::new())
            .await;
        assert_eq!(rx.await.unwrap(), WatchOutcome::Aborted(AbortReason::FeedClosed));
    }
}
