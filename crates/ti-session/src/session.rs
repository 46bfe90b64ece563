//! The consumption session state machine.
//!
//! A [`ConsumptionSession`] reads one topic through a [`MessageSource`],
//! filters each batch with the active [`CompiledFilter`], and hands the
//! result to a [`PresentationSink`].
//!
//! # States
//!
//! ```text
//! Idle ──start──► Fetching ──pause──► Paused
//!                  │  ▲                 │
//!                  │  └─────resume──────┘
//!                  ├──stop / bound reached──► Stopped ◄──stop── Paused
//!                  └──source error──────────► Failed
//! ```
//!
//! `stop` is also accepted from `Idle`, and is a no-op once terminal.
//!
//! # Cancellation
//!
//! The fetch loop runs in its own tokio task. `pause` and `stop` change the
//! state immediately and bump an epoch counter; a fetch result is committed
//! only if the epoch it was issued under is still current. `stop` also
//! cancels a [`CancellationToken`] that the loop selects on, so an
//! outstanding fetch or poll delay is abandoned at once.
//!
//! Events are delivered after the state lock is released but while holding
//! a per-session emit gate, taken before the epoch check. `stop` waits for
//! the gate, so once it returns no further event is delivered, even when a
//! fetch completed concurrently. The gate is reentrant, which lets a sink
//! query or stop the session from inside `deliver`.
//!
//! At most one fetch is in flight: a fetch interrupted by `pause` is allowed
//! to finish (and is discarded) before the loop waits for `resume`.
//!
//! # Bounds
//!
//! A historical bound is applied per partition: a message past the bound is
//! skipped, and the read ends early only once every partition of the topic's
//! partition subset has passed it. Otherwise it ends when the source reports
//! the end of the topic. A backward read reports the partitions it reads as
//! [`SessionPhase::ReadingPartition`] events ahead of each batch.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use ti_core::{ConsumptionMode, Cursor, Message, SessionConfig, SessionStatus, TopicRef};
use ti_filter::CompiledFilter;

use crate::error::SessionError;
use crate::event::{PresentationSink, SessionEvent, SessionId, SessionPhase};
use crate::source::{FetchedBatch, MessageSource};
use crate::stats::{ConsumingSnapshot, ConsumingStats};

/// Mutable session state, guarded by one lock.
struct State {
    status: SessionStatus,
    cursor: Cursor,
    filter: CompiledFilter,
    /// Bumped by `pause` and `stop`; results from older epochs are stale.
    epoch: u64,
    /// Messages emitted so far, for the historical page limit.
    emitted: usize,
    /// Partitions that have passed the historical bound.
    exhausted: Vec<i32>,
}

/// State shared between the session handle and its fetch task.
struct Shared {
    id: SessionId,
    state: Mutex<State>,
    /// Held from the epoch check until the resulting events are delivered.
    emit: ReentrantMutex<()>,
    wake: Notify,
    stats: ConsumingStats,
    token: CancellationToken,
    sink: Arc<dyn PresentationSink>,
}

impl Shared {
    fn stop(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            if state.status.is_running() {
                self.stats.mark_cancelled();
            }
            state.status = SessionStatus::Stopped;
            state.epoch += 1;
        }
        self.token.cancel();
        // Wait out a delivery whose epoch check passed before the stop.
        drop(self.emit.lock());
        true
    }

    fn deliver(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.sink.deliver(event);
        }
    }
}

/// One cancellable read of a topic.
///
/// Must be started from within a tokio runtime. Dropping the session stops
/// it; [`shutdown`](Self::shutdown) additionally waits for the fetch task.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use ti_core::{ConsumptionMode, Message, SessionConfig, SessionStatus, TopicRef};
/// use ti_filter::CompiledFilter;
/// use ti_session::{ConsumptionSession, MemorySource, SessionEvent, SessionId};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let source = Arc::new(MemorySource::new(10));
/// source.append("orders", (0..3).map(|i| Message::new(0, i)));
///
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SessionEvent>();
/// let mut session = ConsumptionSession::new(
///     SessionId::new(1),
///     TopicRef::new("orders"),
///     ConsumptionMode::default(),
///     SessionConfig::default(),
///     source,
///     Arc::new(tx),
/// );
/// session.start(CompiledFilter::pass_through()).unwrap();
///
/// while let Some(event) = rx.recv().await {
///     if matches!(event, SessionEvent::Done { .. }) {
///         break;
///     }
/// }
/// assert_eq!(session.status(), SessionStatus::Stopped);
/// # }
/// ```
pub struct ConsumptionSession<S: MessageSource> {
    topic: TopicRef,
    mode: ConsumptionMode,
    config: SessionConfig,
    source: Arc<S>,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl<S: MessageSource> std::fmt::Debug for ConsumptionSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumptionSession")
            .field("id", &self.shared.id)
            .field("topic", &self.topic)
            .field("mode", &self.mode)
            .field("status", &self.status())
            .field("cursor", &self.cursor())
            .finish_non_exhaustive()
    }
}

impl<S: MessageSource> ConsumptionSession<S> {
    /// Creates an idle session reading `topic` from the start.
    pub fn new(
        id: SessionId,
        topic: TopicRef,
        mode: ConsumptionMode,
        config: SessionConfig,
        source: Arc<S>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        Self {
            topic,
            mode,
            config,
            source,
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(State {
                    status: SessionStatus::Idle,
                    cursor: Cursor::START,
                    filter: CompiledFilter::pass_through(),
                    epoch: 0,
                    emitted: 0,
                    exhausted: Vec::new(),
                }),
                emit: ReentrantMutex::new(()),
                wake: Notify::new(),
                stats: ConsumingStats::new(),
                token: CancellationToken::new(),
                sink,
            }),
            task: None,
        }
    }

    /// Starts reading at `cursor` instead of the beginning of the topic.
    ///
    /// Only meaningful before [`start`](Self::start).
    #[must_use]
    pub fn with_start_cursor(self, cursor: Cursor) -> Self {
        self.shared.state.lock().cursor = cursor;
        self
    }

    /// Idle → Fetching with `filter` as the predicate.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless the session is idle.
    pub fn start(&mut self, filter: CompiledFilter) -> Result<(), SessionError> {
        {
            let _emit = self.shared.emit.lock();
            {
                let mut state = self.shared.state.lock();
                if state.status != SessionStatus::Idle {
                    return Err(SessionError::invalid_transition(state.status, "start"));
                }
                info!(
                    session = %self.shared.id,
                    topic = %self.topic,
                    live = self.mode.is_live(),
                    backward = self.mode.is_backward(),
                    cursor = %state.cursor,
                    filter = filter.label(),
                    "starting consumption session"
                );
                state.status = SessionStatus::Fetching;
                state.filter = filter;
            }
            self.shared.deliver([SessionEvent::Phase {
                session: self.shared.id,
                phase: SessionPhase::Started,
            }]);
        }

        let task = FetchTask {
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
            topic: self.topic.clone(),
            mode: self.mode,
            config: self.config,
        };
        self.task = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Fetching → Paused. No fetch is issued until [`resume`](Self::resume);
    /// the cursor is kept and an outstanding result is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless the session is fetching.
    pub fn pause(&self) -> Result<(), SessionError> {
        let _emit = self.shared.emit.lock();
        {
            let mut state = self.shared.state.lock();
            if state.status != SessionStatus::Fetching {
                return Err(SessionError::invalid_transition(state.status, "pause"));
            }
            state.status = SessionStatus::Paused;
            state.epoch += 1;
            debug!(session = %self.shared.id, cursor = %state.cursor, "session paused");
        }
        self.shared.deliver([SessionEvent::Phase {
            session: self.shared.id,
            phase: SessionPhase::Paused,
        }]);
        Ok(())
    }

    /// Paused → Fetching with `filter` installed before the next fetch.
    ///
    /// Batches already emitted are not filtered again.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless the session is paused.
    pub fn resume(&self, filter: CompiledFilter) -> Result<(), SessionError> {
        {
            let _emit = self.shared.emit.lock();
            {
                let mut state = self.shared.state.lock();
                if state.status != SessionStatus::Paused {
                    return Err(SessionError::invalid_transition(state.status, "resume"));
                }
                debug!(session = %self.shared.id, filter = filter.label(), "session resumed");
                state.status = SessionStatus::Fetching;
                state.filter = filter;
            }
            self.shared.deliver([SessionEvent::Phase {
                session: self.shared.id,
                phase: SessionPhase::Resumed,
            }]);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stops the session and cancels any outstanding fetch or poll delay.
    ///
    /// Idempotent: stopping a stopped or failed session does nothing.
    pub fn stop(&self) {
        if self.shared.stop() {
            info!(session = %self.shared.id, topic = %self.topic, "stopped consumption session");
        }
    }

    /// Stops the session and waits for its fetch task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TaskFailed`] if the task panicked.
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        self.stop();
        if let Some(task) = self.task.take() {
            task.await.map_err(|_| SessionError::TaskFailed)?;
        }
        Ok(())
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The topic being read.
    #[must_use]
    pub const fn topic(&self) -> &TopicRef {
        &self.topic
    }

    /// The consumption mode.
    #[must_use]
    pub const fn mode(&self) -> ConsumptionMode {
        self.mode
    }

    /// The current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.shared.state.lock().status
    }

    /// Position after the last committed batch.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.shared.state.lock().cursor
    }

    /// Label of the filter in effect.
    #[must_use]
    pub fn filter_label(&self) -> String {
        self.shared.state.lock().filter.label().to_owned()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ConsumingSnapshot {
        self.shared.stats.snapshot()
    }
}

impl<S: MessageSource> Drop for ConsumptionSession<S> {
    fn drop(&mut self) {
        // The task sees the cancelled token and exits on its own.
        self.shared.stop();
    }
}

/// The fetch loop's half of a session.
struct FetchTask<S> {
    shared: Arc<Shared>,
    source: Arc<S>,
    topic: TopicRef,
    mode: ConsumptionMode,
    config: SessionConfig,
}

/// What a committed batch means for the session.
enum Progress {
    Continue { caught_up: bool },
    Finished,
}

impl<S: MessageSource> FetchTask<S> {
    async fn run(self) {
        while let Some((epoch, cursor)) = self.wait_for_turn().await {
            let started = Instant::now();
            let result = tokio::select! {
                () = self.shared.token.cancelled() => break,
                result = self.source.fetch_batch(&self.topic, cursor, self.mode) => result,
            };
            let elapsed = started.elapsed();

            let Some(filter) = self.current_filter(epoch) else {
                trace!(session = %self.shared.id, %cursor, "discarding stale fetch result");
                continue;
            };

            let progress = match result {
                Ok(batch) => self.commit(epoch, filter, batch, elapsed),
                Err(err) => {
                    self.fail(epoch, &err.to_string());
                    break;
                }
            };

            match progress {
                Some(Progress::Finished) => break,
                Some(Progress::Continue { caught_up: true }) if self.mode.is_live() => {
                    tokio::select! {
                        () = self.shared.token.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Some(Progress::Continue { .. }) | None => {}
            }
        }
        trace!(session = %self.shared.id, "fetch loop exited");
    }

    /// Waits until the session is fetching; `None` once it is terminal.
    async fn wait_for_turn(&self) -> Option<(u64, Cursor)> {
        loop {
            let notified = self.shared.wake.notified();
            {
                let state = self.shared.state.lock();
                match state.status {
                    SessionStatus::Fetching => return Some((state.epoch, state.cursor)),
                    SessionStatus::Stopped | SessionStatus::Failed => return None,
                    SessionStatus::Idle | SessionStatus::Paused => {}
                }
            }
            tokio::select! {
                () = self.shared.token.cancelled() => return None,
                () = notified => {}
            }
        }
    }

    /// The filter to apply, if a fetch issued under `epoch` is still current.
    fn current_filter(&self, epoch: u64) -> Option<CompiledFilter> {
        let state = self.shared.state.lock();
        (state.epoch == epoch && state.status == SessionStatus::Fetching)
            .then(|| state.filter.clone())
    }

    fn commit(
        &self,
        epoch: u64,
        filter: CompiledFilter,
        batch: FetchedBatch,
        elapsed: Duration,
    ) -> Option<Progress> {
        let FetchedBatch {
            messages,
            next_cursor,
            at_end,
        } = batch;

        let bytes: usize = messages.iter().map(Message::size_bytes).sum();
        self.shared.stats.record_fetch(
            messages.len() as u64,
            bytes as u64,
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        );

        let mut read_partitions = Vec::new();
        if self.mode.is_backward() {
            for message in &messages {
                if !read_partitions.contains(&message.partition) {
                    read_partitions.push(message.partition);
                }
            }
        }

        let mut passed = Vec::new();
        let in_bound: Vec<Message> = match self.mode.bound() {
            Some(bound) => messages
                .into_iter()
                .filter(|message| {
                    let past = bound.is_exceeded_by(message);
                    if past && !passed.contains(&message.partition) {
                        passed.push(message.partition);
                    }
                    !past
                })
                .collect(),
            None => messages,
        };

        // Evaluation happens without the lock; the epoch is checked again below.
        let filtered = filter.apply(in_bound, self.config.parallel_threshold);
        let mut messages = filtered.messages;

        let _emit = self.shared.emit.lock();
        let mut state = self.shared.state.lock();
        if state.epoch != epoch || state.status != SessionStatus::Fetching {
            trace!(session = %self.shared.id, "discarding batch filtered across a state change");
            return None;
        }

        for partition in passed {
            if !state.exhausted.contains(&partition) {
                state.exhausted.push(partition);
            }
        }
        let bound_reached = matches!(self.mode, ConsumptionMode::Historical(_))
            && !self.topic.partitions.is_empty()
            && self
                .topic
                .partitions
                .iter()
                .all(|partition| state.exhausted.contains(partition));

        let mut limit_reached = false;
        if let (Some(max), false) = (self.config.max_messages, self.mode.is_live()) {
            let remaining = max.saturating_sub(state.emitted);
            if messages.len() >= remaining {
                messages.truncate(remaining);
                limit_reached = true;
            }
        }

        let finished = !self.mode.is_live() && (at_end || bound_reached || limit_reached);
        state.cursor = next_cursor;
        state.emitted += messages.len();
        if finished {
            state.status = SessionStatus::Stopped;
        }
        let status = state.status;
        let emitted_total = state.emitted;
        drop(state);

        self.shared.stats.record_emitted(messages.len() as u64);
        self.shared
            .stats
            .record_filter_errors(filtered.evaluation_errors);

        debug!(
            session = %self.shared.id,
            cursor = %next_cursor,
            emitted = messages.len(),
            evaluation_errors = filtered.evaluation_errors,
            "emitting batch"
        );

        let stats = self.shared.stats.snapshot();
        let mut events: Vec<SessionEvent> = read_partitions
            .into_iter()
            .map(|partition| SessionEvent::Phase {
                session: self.shared.id,
                phase: SessionPhase::ReadingPartition(partition),
            })
            .collect();
        events.push(SessionEvent::Batch {
            session: self.shared.id,
            cursor: next_cursor,
            status,
            messages,
            stats,
        });

        if finished {
            info!(
                session = %self.shared.id,
                cursor = %next_cursor,
                emitted = emitted_total,
                at_end,
                bound_reached,
                limit_reached,
                "historical read complete"
            );
            events.push(SessionEvent::Done {
                session: self.shared.id,
                cursor: next_cursor,
                stats,
            });
        }
        self.shared.deliver(events);

        Some(if finished {
            Progress::Finished
        } else {
            Progress::Continue { caught_up: at_end }
        })
    }

    fn fail(&self, epoch: u64, reason: &str) {
        let _emit = self.shared.emit.lock();
        let cursor = {
            let mut state = self.shared.state.lock();
            if state.epoch != epoch || state.status != SessionStatus::Fetching {
                trace!(session = %self.shared.id, "discarding stale fetch error");
                return;
            }
            state.status = SessionStatus::Failed;
            state.cursor
        };
        error!(
            session = %self.shared.id,
            topic = %self.topic,
            %cursor,
            error = reason,
            "message source failed"
        );
        self.shared.deliver([SessionEvent::Failed {
            session: self.shared.id,
            cursor,
            error: reason.to_owned(),
        }]);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use tokio::sync::mpsc;
    use ti_core::{FilterDefinition, HistoricalBound, PredicateSource};

    use super::*;
    use crate::error::SourceError;
    use crate::source::MemorySource;
    use crate::testing::GatedSource;

    fn messages(count: i64) -> Vec<Message> {
        (0..count)
            .map(|i| Message::new(0, i).with_value(format!(r#"{{"n":{i}}}"#)))
            .collect()
    }

    fn expression(code: &str) -> CompiledFilter {
        CompiledFilter::compile(&FilterDefinition::new(code, PredicateSource::expression(code))).unwrap()
    }

    fn config(max_messages: Option<usize>) -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 10,
            batch_size: 2,
            max_messages,
            parallel_threshold: 0,
        }
    }

    fn open<S: MessageSource>(
        source: Arc<S>,
        mode: ConsumptionMode,
        config: SessionConfig,
    ) -> (ConsumptionSession<S>, mpsc::UnboundedReceiver<SessionEvent>) {
        open_topic(source, TopicRef::new("orders"), mode, config)
    }

    fn open_topic<S: MessageSource>(
        source: Arc<S>,
        topic: TopicRef,
        mode: ConsumptionMode,
        config: SessionConfig,
    ) -> (ConsumptionSession<S>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
        let session = ConsumptionSession::new(
            SessionId::new(1),
            topic,
            mode,
            config,
            source,
            Arc::new(tx),
        );
        (session, rx)
    }

    /// Partition and offset of every emitted message, in order.
    fn emitted_positions(events: &[SessionEvent]) -> Vec<(i32, i64)> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Batch { messages, .. } => {
                    Some(messages.iter().map(|m| (m.partition, m.offset)))
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn partition_phases(events: &[SessionEvent]) -> Vec<i32> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Phase {
                    phase: SessionPhase::ReadingPartition(partition),
                    ..
                } => Some(*partition),
                _ => None,
            })
            .collect()
    }

    /// Two partitions: offsets 0..4 on partition 0 and 0..2 on partition 1.
    fn two_partitions() -> Vec<Message> {
        vec![
            Message::new(0, 0),
            Message::new(1, 0),
            Message::new(0, 1),
            Message::new(0, 2),
            Message::new(1, 1),
            Message::new(0, 3),
        ]
    }

    /// Records the session status seen from inside `deliver`, and can stop
    /// the session on the first batch.
    #[derive(Default)]
    struct StatusSink {
        session: OnceLock<Arc<ConsumptionSession<GatedSource>>>,
        stop_on_batch: bool,
        seen: Mutex<Vec<SessionStatus>>,
    }

    impl PresentationSink for StatusSink {
        fn deliver(&self, event: SessionEvent) {
            let Some(session) = self.session.get() else {
                return;
            };
            self.seen.lock().push(session.status());
            if self.stop_on_batch && matches!(event, SessionEvent::Batch { .. }) {
                session.stop();
            }
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(condition(), "condition not reached in time");
    }

    /// Collects events until `Done` or `Failed`.
    async fn until_finished(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
        {
            let last = matches!(event, SessionEvent::Done { .. } | SessionEvent::Failed { .. });
            events.push(event);
            if last {
                break;
            }
        }
        events
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn emitted_offsets(events: &[SessionEvent]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Batch { messages, .. } => Some(messages.iter().map(|m| m.offset)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn batch_count(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, SessionEvent::Batch { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_state_graph() {
        let source = Arc::new(GatedSource::new(MemorySource::new(2)));
        let (mut session, _rx) = open(Arc::clone(&source), ConsumptionMode::Live, config(None));

        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.pause().is_err());
        assert!(session.resume(CompiledFilter::pass_through()).is_err());

        session.start(CompiledFilter::pass_through()).unwrap();
        assert_eq!(session.status(), SessionStatus::Fetching);
        assert!(session.start(CompiledFilter::pass_through()).is_err());
        assert!(session.resume(CompiledFilter::pass_through()).is_err());

        session.pause().unwrap();
        assert_eq!(session.status(), SessionStatus::Paused);
        assert!(session.pause().is_err());

        session.resume(CompiledFilter::pass_through()).unwrap();
        assert_eq!(session.status(), SessionStatus::Fetching);

        session.stop();
        assert_eq!(session.status(), SessionStatus::Stopped);
        session.stop();
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.pause().is_err());
        assert!(session.resume(CompiledFilter::pass_through()).is_err());
        assert!(session.stats().cancelled);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_from_idle_and_paused() {
        let source = Arc::new(MemorySource::new(2));
        let (session, _rx) = open(Arc::clone(&source), ConsumptionMode::Live, config(None));
        session.stop();
        assert_eq!(session.status(), SessionStatus::Stopped);

        let (mut session, _rx) = open(source, ConsumptionMode::Live, config(None));
        session.start(CompiledFilter::pass_through()).unwrap();
        session.pause().unwrap();
        session.stop();
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_historical_reads_to_end_and_stops() {
        let source = Arc::new(MemorySource::new(2));
        source.append("orders", messages(5));
        let (mut session, mut rx) = open(source, ConsumptionMode::default(), config(None));

        session.start(expression("offset % 2 == 0")).unwrap();
        let events = until_finished(&mut rx).await;

        assert!(matches!(events[0], SessionEvent::Phase { phase: SessionPhase::Started, .. }));
        assert_eq!(emitted_offsets(&events), vec![0, 2, 4]);
        assert_eq!(batch_count(&events), 3);
        assert!(matches!(events.last(), Some(SessionEvent::Done { cursor, .. }) if *cursor == Cursor::new(5)));

        wait_for(|| session.status() == SessionStatus::Stopped).await;
        let stats = session.stats();
        assert_eq!(stats.messages_consumed, 5);
        assert_eq!(stats.messages_emitted, 3);
        assert_eq!(stats.fetches, 3);
        assert!(!stats.cancelled);
    }

    #[tokio::test]
    async fn test_empty_filtered_batches_are_emitted() {
        let source = Arc::new(MemorySource::new(2));
        source.append("orders", messages(4));
        let (mut session, mut rx) = open(source, ConsumptionMode::default(), config(None));

        session.start(expression("false")).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(batch_count(&events), 2);
        assert!(emitted_offsets(&events).is_empty());
    }

    #[tokio::test]
    async fn test_historical_offset_bound() {
        let source = Arc::new(MemorySource::new(2));
        source.append("orders", messages(10));
        let mode = ConsumptionMode::Historical(HistoricalBound::Offset(2));
        let (mut session, mut rx) = open(source, mode, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(emitted_offsets(&events), vec![0, 1, 2]);
        assert!(matches!(events.last(), Some(SessionEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_historical_page_limit() {
        let source = Arc::new(MemorySource::new(2));
        source.append("orders", messages(10));
        let (mut session, mut rx) = open(source, ConsumptionMode::default(), config(Some(3)));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(emitted_offsets(&events), vec![0, 1, 2]);
        assert_eq!(batch_count(&events), 2);
    }

    #[tokio::test]
    async fn test_evaluation_errors_are_counted_not_fatal() {
        let source = Arc::new(MemorySource::new(10));
        source.append("orders", messages(4));
        let (mut session, mut rx) = open(source, ConsumptionMode::default(), config(None));

        // `value.n` is a number, so ordering it against a string fails.
        session.start(expression(r#"value.n > "x" || offset == 3"#)).unwrap();
        let events = until_finished(&mut rx).await;
        assert!(emitted_offsets(&events).is_empty());
        assert_eq!(session.stats().filter_apply_errors, 4);
    }

    #[tokio::test]
    async fn test_source_failure_fails_session() {
        let source = Arc::new(MemorySource::new(2));
        source.append("orders", messages(2));
        source.fail_next_fetch(SourceError::connection_lost("broker went away"));
        let (mut session, mut rx) = open(source, ConsumptionMode::Live, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert!(matches!(events.last(), Some(SessionEvent::Failed { error, .. }) if error.contains("broker went away")));
        assert_eq!(session.status(), SessionStatus::Failed);

        session.stop();
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_topic_fails_session() {
        let source = Arc::new(MemorySource::new(2));
        let (mut session, mut rx) = open(source, ConsumptionMode::default(), config(None));
        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_stopped_live_session_never_emits_with_fetch_in_flight() {
        let source = Arc::new(GatedSource::new(MemorySource::new(2)));
        source.inner.append("orders", messages(4));
        let (mut session, mut rx) = open(Arc::clone(&source), ConsumptionMode::Live, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        wait_for(|| source.started() == 1).await;
        session.stop();
        source.release(10);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain(&mut rx);
        assert_eq!(batch_count(&events), 0);
        assert_eq!(session.cursor(), Cursor::START);
        assert_eq!(source.started(), 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_discards_stale_result_and_resume_uses_new_filter() {
        let source = Arc::new(GatedSource::new(MemorySource::new(2)));
        source.inner.append("orders", messages(4));
        let (mut session, mut rx) = open(Arc::clone(&source), ConsumptionMode::Live, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        wait_for(|| source.started() == 1).await;

        session.pause().unwrap();
        source.release(1);
        wait_for(|| source.in_flight() == 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(batch_count(&drain(&mut rx)), 0);
        assert_eq!(session.cursor(), Cursor::START);
        assert_eq!(source.started(), 1);

        session.resume(expression("offset == 1")).unwrap();
        source.release(1);
        let first = loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(event @ SessionEvent::Batch { .. }) => break event,
                Some(_) => {}
                None => unreachable!("sink closed"),
            }
        };
        assert_eq!(emitted_offsets(&[first]), vec![1]);
        assert_eq!(session.cursor(), Cursor::new(2));
        assert_eq!(source.max_in_flight(), 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_session_polls_new_messages() {
        let source = Arc::new(MemorySource::new(10));
        source.append("orders", messages(2));
        let (mut session, mut rx) = open(Arc::clone(&source), ConsumptionMode::Live, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        wait_for(|| session.cursor() == Cursor::new(2)).await;

        source.append("orders", vec![Message::new(0, 2), Message::new(0, 3)]);
        wait_for(|| session.cursor() == Cursor::new(4)).await;
        assert_eq!(session.status(), SessionStatus::Fetching);

        session.stop();
        let events = drain(&mut rx);
        assert_eq!(emitted_offsets(&events), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_start_cursor() {
        let source = Arc::new(MemorySource::new(10));
        source.append("orders", messages(5));
        let (session, mut rx) = open(source, ConsumptionMode::default(), config(None));
        let mut session = session.with_start_cursor(Cursor::new(3));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(emitted_offsets(&events), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_offset_bound_applies_per_partition() {
        let source = Arc::new(MemorySource::new(2));
        source.append(
            "orders",
            [
                Message::new(0, 0),
                Message::new(1, 0),
                Message::new(1, 1),
                Message::new(1, 2),
                Message::new(0, 1),
            ],
        );
        let mode = ConsumptionMode::Historical(HistoricalBound::Offset(1));
        let (mut session, mut rx) = open(source, mode, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(
            emitted_positions(&events),
            vec![(0, 0), (1, 0), (1, 1), (0, 1)]
        );
        assert!(matches!(events.last(), Some(SessionEvent::Done { cursor, .. }) if *cursor == Cursor::new(5)));
    }

    #[tokio::test]
    async fn test_bound_ends_read_once_every_partition_passed_it() {
        let source = Arc::new(MemorySource::new(2));
        source.append(
            "orders",
            (0..8).map(|i| Message::new(i32::try_from(i % 2).unwrap(), i / 2)),
        );
        let topic = TopicRef::new("orders").with_partitions([0, 1]);
        let mode = ConsumptionMode::Historical(HistoricalBound::Offset(0));
        let (mut session, mut rx) = open_topic(source, topic, mode, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(emitted_positions(&events), vec![(0, 0), (1, 0)]);
        assert!(matches!(events.last(), Some(SessionEvent::Done { cursor, .. }) if *cursor == Cursor::new(4)));
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_backward_read_is_newest_first_per_partition() {
        let source = Arc::new(MemorySource::new(4));
        source.append("orders", two_partitions());
        let mode = ConsumptionMode::Backward(HistoricalBound::SourceEnd);
        let (mut session, mut rx) = open(source, mode, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(
            emitted_positions(&events),
            vec![(0, 3), (0, 2), (1, 1), (1, 0), (0, 1), (0, 0)]
        );
        assert_eq!(partition_phases(&events), vec![0, 1, 0]);
        assert!(matches!(
            events[1],
            SessionEvent::Phase { phase: SessionPhase::ReadingPartition(0), .. }
        ));
        assert!(matches!(events.last(), Some(SessionEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_backward_read_skips_past_bound_and_honours_limit() {
        let source = Arc::new(MemorySource::new(4));
        source.append("orders", two_partitions());
        let mode = ConsumptionMode::Backward(HistoricalBound::Offset(1));
        let (mut session, mut rx) = open(Arc::clone(&source), mode, config(None));

        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(
            emitted_positions(&events),
            vec![(1, 1), (1, 0), (0, 1), (0, 0)]
        );

        let mode = ConsumptionMode::Backward(HistoricalBound::SourceEnd);
        let (mut session, mut rx) = open(source, mode, config(Some(3)));
        session.start(CompiledFilter::pass_through()).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(emitted_positions(&events), vec![(0, 3), (0, 2), (1, 1)]);
        assert_eq!(batch_count(&events), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sink_may_query_and_stop_the_session() {
        let source = Arc::new(GatedSource::new(MemorySource::new(2)));
        source.inner.append("orders", messages(6));
        let sink = Arc::new(StatusSink {
            stop_on_batch: true,
            ..StatusSink::default()
        });
        let mut session = ConsumptionSession::new(
            SessionId::new(1),
            TopicRef::new("orders"),
            ConsumptionMode::Live,
            config(None),
            Arc::clone(&source),
            Arc::clone(&sink) as Arc<dyn PresentationSink>,
        );
        session.start(CompiledFilter::pass_through()).unwrap();
        let session = Arc::new(session);
        assert!(sink.session.set(Arc::clone(&session)).is_ok());

        source.release(10);
        wait_for(|| session.status() == SessionStatus::Stopped).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(*sink.seen.lock(), vec![SessionStatus::Fetching]);
        assert_eq!(session.cursor(), Cursor::new(2));
        assert_eq!(source.started(), 1);
        assert!(session.stats().cancelled);
    }
}
