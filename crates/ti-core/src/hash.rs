//! Fast hash map type alias.
//!
//! Alias for [`FxHashMap`] from the `rustc-hash` crate. The
//! workspace keys its maps by topic names and filter ids, both internal values
//! that need no denial-of-service resistance.
//!
//! # Examples
//!
//! ```
//! use ti_core::{FxHashMap, fx_hash_map};
//!
//! let mut sessions: FxHashMap<String, u64> = fx_hash_map();
//! sessions.insert("orders".to_owned(), 1);
//! assert_eq!(sessions.get("orders"), Some(&1));
//! ```

/// A [`HashMap`](std::collections::HashMap) using the Fx hash algorithm.
pub type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// Creates a new empty [`FxHashMap`].
#[inline]
#[must_use]
pub fn fx_hash_map<K, V>() -> FxHashMap<K, V> {
    FxHashMap::default()
}
