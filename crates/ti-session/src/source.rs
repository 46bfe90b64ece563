//! Message sources.
//!
//! A [`MessageSource`] fetches one batch of messages from a topic at a
//! [`Cursor`]. The session never issues a second fetch before the first one
//! returned, so implementations need no request pipelining.

use std::collections::BTreeMap;
use std::future::Future;

use parking_lot::{Mutex, RwLock};
use ti_core::{ConsumptionMode, Cursor, FxHashMap, Message, TopicRef, fx_hash_map};

use crate::error::SourceError;

/// One fetched batch.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    /// Messages in cursor order.
    pub messages: Vec<Message>,
    /// Cursor to fetch from next.
    pub next_cursor: Cursor,
    /// `true` if the source holds nothing past `next_cursor` right now.
    pub at_end: bool,
}

/// The collaborator that reads messages from the cluster.
pub trait MessageSource: Send + Sync + 'static {
    /// Fetches the batch that starts at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the topic is unknown or the source is
    /// unreachable.
    fn fetch_batch(
        &self,
        topic: &TopicRef,
        cursor: Cursor,
        mode: ConsumptionMode,
    ) -> impl Future<Output = Result<FetchedBatch, SourceError>> + Send;
}

/// An in-memory source holding one append-only log per topic.
///
/// A forward cursor is an index into the topic's log. Messages outside the
/// requested partition set are skipped but still advance the cursor. Bounds
/// are enforced by the session.
///
/// [`ConsumptionMode::Backward`] reads newest-first in rounds. Each round
/// takes the next `ceil(batch_size / partitions)` messages of every partition
/// from the top down, lowest partition first. The backward cursor packs the
/// log length seen by the first fetch (high 32 bits) and the number of rounds
/// taken (low 32 bits), so messages appended during the read are not shown
/// and the cursor still only grows.
///
/// # Examples
///
/// ```
/// use ti_core::{ConsumptionMode, Cursor, Message, TopicRef};
/// use ti_session::{MemorySource, MessageSource};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let source = MemorySource::new(2);
/// source.append("orders", (0..3).map(|i| Message::new(0, i)));
///
/// let topic = TopicRef::new("orders");
/// let first = source.fetch_batch(&topic, Cursor::START, ConsumptionMode::Live).await.unwrap();
/// assert_eq!(first.messages.len(), 2);
/// assert!(!first.at_end);
///
/// let rest = source.fetch_batch(&topic, first.next_cursor, ConsumptionMode::Live).await.unwrap();
/// assert_eq!(rest.messages.len(), 1);
/// assert!(rest.at_end);
/// # }
/// ```
#[derive(Debug)]
pub struct MemorySource {
    topics: RwLock<FxHashMap<String, Vec<Message>>>,
    batch_size: usize,
    pending_failure: Mutex<Option<SourceError>>,
}

impl MemorySource {
    /// Creates an empty source returning at most `batch_size` messages per fetch.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            topics: RwLock::new(fx_hash_map()),
            batch_size: batch_size.max(1),
            pending_failure: Mutex::new(None),
        }
    }

    /// Creates the topic if needed and appends `messages` to its log.
    pub fn append(&self, topic: &str, messages: impl IntoIterator<Item = Message>) {
        let mut topics = self.topics.write();
        let log = topics.entry(topic.to_owned()).or_default();
        let before = log.len();
        log.extend(messages);
        tracing::trace!(topic, appended = log.len() - before, "appended messages");
    }

    /// Creates an empty topic.
    pub fn create_topic(&self, topic: &str) {
        self.topics.write().entry(topic.to_owned()).or_default();
    }

    /// Makes the next fetch fail with `error`.
    pub fn fail_next_fetch(&self, error: SourceError) {
        *self.pending_failure.lock() = Some(error);
    }

    /// Number of messages in `topic`, if it exists.
    #[must_use]
    pub fn topic_len(&self, topic: &str) -> Option<usize> {
        self.topics.read().get(topic).map(Vec::len)
    }

    fn read(
        &self,
        topic: &TopicRef,
        cursor: Cursor,
        mode: ConsumptionMode,
    ) -> Result<FetchedBatch, SourceError> {
        if let Some(error) = self.pending_failure.lock().take() {
            return Err(error);
        }

        let topics = self.topics.read();
        let log = topics
            .get(&topic.name)
            .ok_or_else(|| SourceError::topic_not_found(&topic.name))?;

        if mode.is_backward() {
            read_backward(log, topic, cursor, self.batch_size)
        } else {
            read_forward(log, topic, cursor, self.batch_size)
        }
    }
}

fn read_forward(
    log: &[Message],
    topic: &TopicRef,
    cursor: Cursor,
    batch_size: usize,
) -> Result<FetchedBatch, SourceError> {
    let start = usize::try_from(cursor.position())
        .map_err(|_| SourceError::Protocol(format!("cursor {cursor} out of range")))?;
    if start > log.len() {
        return Err(SourceError::Protocol(format!(
            "cursor {cursor} is past the end of {topic}"
        )));
    }

    let mut messages = Vec::with_capacity(batch_size.min(log.len() - start));
    let mut next = start;
    for message in &log[start..] {
        if messages.len() == batch_size {
            break;
        }
        next += 1;
        if topic.includes_partition(message.partition) {
            messages.push(message.clone());
        }
    }

    Ok(FetchedBatch {
        messages,
        next_cursor: Cursor::new(next as u64),
        at_end: next == log.len(),
    })
}

const ROUND_BITS: u32 = 32;
const ROUND_MASK: u64 = (1 << ROUND_BITS) - 1;

fn read_backward(
    log: &[Message],
    topic: &TopicRef,
    cursor: Cursor,
    batch_size: usize,
) -> Result<FetchedBatch, SourceError> {
    let out_of_range = || SourceError::Protocol(format!("cursor {cursor} out of range"));

    let (top, round) = if cursor == Cursor::START {
        (log.len(), 0)
    } else {
        let top = usize::try_from(cursor.position() >> ROUND_BITS).map_err(|_| out_of_range())?;
        let round = usize::try_from(cursor.position() & ROUND_MASK).map_err(|_| out_of_range())?;
        (top, round)
    };
    if top > log.len() {
        return Err(SourceError::Protocol(format!(
            "cursor {cursor} is past the end of {topic}"
        )));
    }
    let next_cursor = u64::try_from(top)
        .ok()
        .filter(|top| *top <= ROUND_MASK)
        .zip(u64::try_from(round + 1).ok().filter(|round| *round <= ROUND_MASK))
        .map(|(top, round)| Cursor::new((top << ROUND_BITS) | round))
        .ok_or_else(out_of_range)?;

    let mut partitions: BTreeMap<i32, Vec<&Message>> = BTreeMap::new();
    for message in log[..top]
        .iter()
        .filter(|message| topic.includes_partition(message.partition))
    {
        partitions.entry(message.partition).or_default().push(message);
    }
    let per_partition = batch_size.div_ceil(partitions.len().max(1));

    let mut messages = Vec::with_capacity(per_partition * partitions.len());
    let mut at_end = true;
    for partition_log in partitions.values() {
        let end = partition_log
            .len()
            .saturating_sub(round.saturating_mul(per_partition));
        let start = end.saturating_sub(per_partition);
        messages.extend(partition_log[start..end].iter().rev().map(|m| (*m).clone()));
        at_end &= start == 0;
    }

    Ok(FetchedBatch {
        messages,
        next_cursor,
        at_end,
    })
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(100)
    }
}

impl MessageSource for MemorySource {
    async fn fetch_batch(
        &self,
        topic: &TopicRef,
        cursor: Cursor,
        mode: ConsumptionMode,
    ) -> Result<FetchedBatch, SourceError> {
        self.read(topic, cursor, mode)
    }
}
