//! Bounded, deduplicated history rings.

use indexmap::IndexMap;

use crate::{
  Timestamp,
  entry::{
    HistoryItem,
    Timed,
  },
};

/// History of one kind, deduplicated by exact text.
///
/// Entries are kept sorted by ascending timestamp. Inserting an entry whose
/// timestamp equals existing ones places it after them, so among equal
/// timestamps the most recently inserted entry is the newest.
#[derive(Debug, Clone)]
pub struct HistoryRing {
  entries:  IndexMap<Vec<u8>, Timed<HistoryItem>>,
  capacity: usize,
}

impl HistoryRing {
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: IndexMap::with_capacity(capacity.min(1024)),
      capacity,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    self.entries.len() >= self.capacity
  }

  pub fn oldest_timestamp(&self) -> Option<Timestamp> {
    self.entries.first().map(|(_, entry)| entry.timestamp)
  }

  pub fn get(&self, text: &[u8]) -> Option<&Timed<HistoryItem>> {
    self.entries.get(text)
  }

  /// Merges `entry` into the ring.
  ///
  /// An existing entry with the same text survives unless the incoming one
  /// is strictly newer, or equally old and `prefer_incoming_on_tie` is set.
  /// When the ring overflows the oldest entry is evicted, which may be
  /// `entry` itself. Returns whether `entry` ended up in the ring.
  pub fn insert(&mut self, entry: Timed<HistoryItem>, prefer_incoming_on_tie: bool) -> bool {
    if self.capacity == 0 {
      return false;
    }

    if let Some(index) = self.entries.get_index_of(&entry.value.text) {
      let existing = self.entries[index].timestamp;
      let incoming_wins = entry.timestamp > existing
        || (entry.timestamp == existing && prefer_incoming_on_tie);
      if !incoming_wins {
        return false;
      }
      self.entries.shift_remove_index(index);
    }

    let position = self
      .entries
      .values()
      .position(|existing| existing.timestamp > entry.timestamp)
      .unwrap_or(self.entries.len());
    self
      .entries
      .shift_insert(position, entry.value.text.clone(), entry);

    if self.entries.len() > self.capacity {
      self.entries.shift_remove_index(0);
      return position != 0;
    }
    true
  }

  /// Entries from oldest to newest.
  pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Timed<HistoryItem>> + '_ {
    self.entries.values()
  }

  /// Consumes the ring, returning entries from oldest to newest.
  pub fn into_vec(self) -> Vec<Timed<HistoryItem>> {
    self.entries.into_values().collect()
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;
  use crate::entry::HistoryKind;

  fn item(text: &str, timestamp: Timestamp) -> Timed<HistoryItem> {
    Timed::new(timestamp, HistoryItem::new(HistoryKind::Search, text))
  }

  fn texts(ring: &HistoryRing) -> Vec<(String, Timestamp)> {
    ring
      .iter()
      .map(|entry| {
        (
          String::from_utf8_lossy(&entry.value.text).into_owned(),
          entry.timestamp,
        )
      })
      .collect()
  }

  #[test]
  fn newer_live_entries_evict_the_oldest() {
    let mut ring = HistoryRing::new(2);
    assert!(ring.insert(item("foo", 1), false));
    assert!(ring.insert(item("bar", 2), false));

    assert!(ring.insert(item("baz", 4), true));
    assert!(ring.insert(item("bar", 3), true));

    assert_eq!(texts(&ring), vec![("bar".into(), 3), ("baz".into(), 4)]);
  }

  #[test]
  fn ties_follow_the_preference_flag() {
    let mut ring = HistoryRing::new(4);
    let mut first = item("x", 5);
    first.value.separator = Some('/');
    ring.insert(first, false);

    let mut second = item("x", 5);
    second.value.separator = Some('?');
    assert!(!ring.insert(second.clone(), false));
    assert_eq!(ring.get(b"x").unwrap().value.separator, Some('/'));

    assert!(ring.insert(second, true));
    assert_eq!(ring.get(b"x").unwrap().value.separator, Some('?'));
    assert_eq!(ring.len(), 1);
  }

  #[test]
  fn older_duplicates_are_ignored() {
    let mut ring = HistoryRing::new(4);
    ring.insert(item("x", 9), false);
    assert!(!ring.insert(item("x", 3), true));
    assert_eq!(ring.get(b"x").unwrap().timestamp, 9);
  }

  #[test]
  fn equal_timestamps_keep_insertion_order() {
    let mut ring = HistoryRing::new(3);
    ring.insert(item("a", 1), false);
    ring.insert(item("b", 1), false);
    ring.insert(item("c", 1), false);
    ring.insert(item("d", 1), false);
    assert_eq!(texts(&ring), vec![
      ("b".into(), 1),
      ("c".into(), 1),
      ("d".into(), 1)
    ]);
  }

  #[test]
  fn an_entry_older_than_a_full_ring_is_dropped() {
    let mut ring = HistoryRing::new(2);
    ring.insert(item("a", 5), false);
    ring.insert(item("b", 6), false);
    assert!(!ring.insert(item("c", 1), false));
    assert_eq!(ring.oldest_timestamp(), Some(5));
    assert!(ring.is_full());
  }

  #[test]
  fn zero_capacity_stores_nothing() {
    let mut ring = HistoryRing::new(0);
    assert!(!ring.insert(item("a", 1), true));
    assert!(ring.is_empty());
  }

  quickcheck::quickcheck! {
    fn ring_stays_bounded_sorted_and_newest(capacity: u8, ops: Vec<(u8, u8, bool)>) -> bool {
      let capacity = usize::from(capacity % 6) + 1;
      let mut ring = HistoryRing::new(capacity);
      let mut newest: HashMap<Vec<u8>, Timestamp> = HashMap::new();

      for (text, timestamp, prefer) in ops {
        let text = vec![b'a' + text % 8];
        let timestamp = Timestamp::from(timestamp);
        let latest = newest.entry(text.clone()).or_insert(timestamp);
        *latest = (*latest).max(timestamp);
        ring.insert(
          Timed::new(timestamp, HistoryItem::new(HistoryKind::Command, text)),
          prefer,
        );
        if ring.len() > capacity {
          return false;
        }
      }

      let stamps: Vec<_> = ring.iter().map(|entry| entry.timestamp).collect();
      let sorted = stamps.windows(2).all(|pair| pair[0] <= pair[1]);
      let oldest = ring.oldest_timestamp().unwrap_or(0);
      let survivors_are_newest = newest.iter().all(|(text, latest)| match ring.get(text) {
        Some(entry) => entry.timestamp == *latest,
        None => *latest <= oldest,
      });
      sorted && survivors_are_newest
    }
  }
}
