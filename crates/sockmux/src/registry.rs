//! Per-wire-key subscriber bookkeeping.
//!
//! Pure data structure with no I/O. The multiplexer keeps it behind a lock
//! and consults it to decide when SUBSCRIBE/UNSUBSCRIBE frames must actually
//! reach the wire.

use std::collections::HashMap;

/// State tracked for one wire-level subscription key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberEntry {
    /// Currently-attached logical subscribers
    pub quantity: usize,
    /// Most recent payload observed for this key
    pub last_value: Option<String>,
    /// An UNSUBSCRIBE is pending the grace window
    pub is_delay_unsubscribe: bool,
}

/// Refcounts and cached values for every wire key ever seen.
///
/// Entries are never removed, only their quantity fluctuates: `last_value`
/// must survive transient zero-quantity periods so late joiners can be
/// replayed the current state and the delayed-unsubscribe check has an entry
/// to inspect.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    entries: HashMap<String, SubscriberEntry>,
}

impl SubscriberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more logical subscriber for `key`, creating the entry on
    /// first interest.
    pub fn add_subscriber(&mut self, key: &str) {
        self.entries
            .entry(key.to_owned())
            .and_modify(|entry| entry.quantity += 1)
            .or_insert(SubscriberEntry {
                quantity: 1,
                last_value: None,
                is_delay_unsubscribe: false,
            });
    }

    /// Drop one logical subscriber for `key`; quantity never goes below zero.
    pub fn remove_subscriber(&mut self, key: &str) -> Option<&SubscriberEntry> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.quantity = entry.quantity.saturating_sub(1);
        }
        self.entries.get(key)
    }

    /// Record the most recent payload for `key` if it is tracked.
    pub fn set_subscriber_value(&mut self, key: &str, value: Option<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_value = value;
        }
    }

    /// True when `key` has at least one attached subscriber.
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.quantity > 0)
            .unwrap_or(false)
    }

    /// Entry for `key`, if it was ever subscribed to.
    pub fn get(&self, key: &str) -> Option<&SubscriberEntry> {
        self.entries.get(key)
    }

    /// Flag or clear a pending delayed UNSUBSCRIBE for an existing entry.
    pub fn set_delay(&mut self, key: &str, is_delay: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.is_delay_unsubscribe = is_delay;
        }
    }
}
