//! Topic references and read positions.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A topic, optionally narrowed to a subset of its partitions.
///
/// An empty partition set means every partition.
///
/// # Examples
///
/// ```
/// use ti_core::TopicRef;
///
/// let all = TopicRef::new("orders");
/// assert!(all.includes_partition(7));
///
/// let some = TopicRef::new("orders").with_partitions([0, 2]);
/// assert!(some.includes_partition(2));
/// assert!(!some.includes_partition(1));
/// assert_eq!(some.to_string(), "orders[0,2]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicRef {
    /// Topic name.
    pub name: String,

    /// Partitions to read; empty reads all partitions.
    #[serde(default)]
    pub partitions: SmallVec<[i32; 8]>,
}

impl TopicRef {
    /// Creates a reference to every partition of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: SmallVec::new(),
        }
    }

    /// Restricts the reference to the given partitions.
    #[must_use]
    pub fn with_partitions(mut self, partitions: impl IntoIterator<Item = i32>) -> Self {
        self.partitions = partitions.into_iter().collect();
        self.partitions.sort_unstable();
        self.partitions.dedup();
        self
    }

    /// Returns `true` if messages from `partition` belong to this reference.
    #[inline]
    #[must_use]
    pub fn includes_partition(&self, partition: i32) -> bool {
        self.partitions.is_empty() || self.partitions.contains(&partition)
    }
}

impl fmt::Display for TopicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.partitions.is_empty() {
            let partitions: Vec<String> = self.partitions.iter().map(i32::to_string).collect();
            write!(f, "[{}]", partitions.join(","))?;
        }
        Ok(())
    }
}

/// An opaque read position handed out by a message source.
///
/// Cursors only ever move forward within one session. The inner value is
/// meaningful to the source that produced it and nothing else.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(u64);

impl Cursor {
    /// The position before the first record.
    pub const START: Self = Self(0);

    /// Creates a cursor from a source-defined position.
    #[inline]
    #[must_use]
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the source-defined position.
    #[inline]
    #[must_use]
    pub const fn position(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
