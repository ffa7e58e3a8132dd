//! Bounded merge-by-identity collections for marks, jumps, changes and
//! registers.
//!
//! One algorithm serves every collection; what differs is the capacity and
//! the [`Identity`] deciding that two items describe the same thing.

use std::{
  marker::PhantomData,
  path::{
    Path,
    PathBuf,
  },
};

use indexmap::IndexMap;

use crate::{
  Timestamp,
  entry::{
    Mark,
    Register,
    Timed,
  },
};

/// Capacity of the global mark collection: `A`-`Z` and `0`-`9`.
pub const GLOBAL_MARK_CAPACITY: usize = 36;
/// Capacity of the register collection: `a`-`z`, `0`-`9` and `" - * +`.
pub const REGISTER_CAPACITY: usize = 40;

const LOCAL_MARK_SLOTS: usize = 33;

/// Local marks stored per file, in emission order.
pub const LOCAL_MARK_NAMES: [char; LOCAL_MARK_SLOTS] = [
  'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
  't', 'u', 'v', 'w', 'x', 'y', 'z', '"', '^', '.', '[', ']', '<', '>',
];

pub fn is_global_mark_name(name: char) -> bool {
  name.is_ascii_uppercase() || name.is_ascii_digit()
}

pub fn is_register_name(name: char) -> bool {
  name.is_ascii_lowercase() || name.is_ascii_digit() || matches!(name, '"' | '-' | '*' | '+')
}

fn local_mark_slot(name: char) -> Option<usize> {
  LOCAL_MARK_NAMES.iter().position(|&slot| slot == name)
}

/// Decides whether two stored items describe the same logical fact.
pub trait Identity<T> {
  fn same(a: &T, b: &T) -> bool;
}

/// Same file and same position. Used for jumps and changes.
#[derive(Debug, Clone, Copy)]
pub struct ByLocation;

impl Identity<Mark> for ByLocation {
  fn same(a: &Mark, b: &Mark) -> bool {
    a.lnum == b.lnum && a.col == b.col && a.file == b.file
  }
}

/// Same single-character name. Used for global marks and registers.
#[derive(Debug, Clone, Copy)]
pub struct ByName;

impl Identity<Mark> for ByName {
  fn same(a: &Mark, b: &Mark) -> bool {
    a.name == b.name
  }
}

impl Identity<Register> for ByName {
  fn same(a: &Register, b: &Register) -> bool {
    a.name == b.name
  }
}

/// Outcome of [`BoundedMerge::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
  /// A new identity was added.
  Inserted,
  /// An older item with the same identity was replaced in place.
  Replaced,
  /// An item with the same identity was at least as new; nothing changed.
  Discarded,
  /// The item was the oldest of an overflowing collection and was dropped.
  Evicted,
}

impl Insertion {
  pub fn is_stored(self) -> bool {
    matches!(self, Self::Inserted | Self::Replaced)
  }
}

/// Capacity-bounded collection merged by identity and recency.
#[derive(Debug, Clone)]
pub struct BoundedMerge<T, I> {
  items:    Vec<Timed<T>>,
  capacity: usize,
  identity: PhantomData<I>,
}

pub type JumpList = BoundedMerge<Mark, ByLocation>;
pub type ChangeList = BoundedMerge<Mark, ByLocation>;
pub type GlobalMarks = BoundedMerge<Mark, ByName>;
pub type Registers = BoundedMerge<Register, ByName>;

impl<T, I: Identity<T>> BoundedMerge<T, I> {
  pub fn new(capacity: usize) -> Self {
    Self {
      items: Vec::with_capacity(capacity.min(1024)),
      capacity,
      identity: PhantomData,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.items.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    self.items.len() >= self.capacity
  }

  /// Smallest timestamp in the collection.
  pub fn oldest_timestamp(&self) -> Option<Timestamp> {
    self.items.iter().map(|item| item.timestamp).min()
  }

  /// The stored item sharing identity with `probe`.
  pub fn find(&self, probe: &T) -> Option<&Timed<T>> {
    self.items.iter().find(|item| I::same(&item.value, probe))
  }

  /// Merges `item` into the collection.
  ///
  /// An existing item with the same identity is replaced in place when
  /// `item` is strictly newer and kept otherwise. A new identity is inserted
  /// after every item that is not newer than it; on overflow the first item
  /// with the smallest timestamp is removed.
  pub fn insert(&mut self, item: Timed<T>) -> Insertion {
    if self.capacity == 0 {
      return Insertion::Evicted;
    }

    if let Some(index) = self
      .items
      .iter()
      .position(|existing| I::same(&existing.value, &item.value))
    {
      if self.items[index].timestamp >= item.timestamp {
        return Insertion::Discarded;
      }
      self.items[index] = item;
      return Insertion::Replaced;
    }

    let position = self
      .items
      .iter()
      .position(|existing| existing.timestamp > item.timestamp)
      .unwrap_or(self.items.len());
    self.items.insert(position, item);

    if self.items.len() > self.capacity {
      let oldest = self
        .items
        .iter()
        .enumerate()
        .min_by_key(|(_, existing)| existing.timestamp)
        .map(|(index, _)| index)
        .unwrap_or(0);
      self.items.remove(oldest);
      if oldest == position {
        return Insertion::Evicted;
      }
    }
    Insertion::Inserted
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Timed<T>> {
    self.items.iter()
  }

  pub fn into_vec(self) -> Vec<Timed<T>> {
    self.items
  }
}

impl<T, I: Identity<T>> Extend<Timed<T>> for BoundedMerge<T, I> {
  fn extend<It: IntoIterator<Item = Timed<T>>>(&mut self, iter: It) {
    for item in iter {
      self.insert(item);
    }
  }
}

/// Marks and changes recorded for one file.
#[derive(Debug, Clone)]
pub struct FileMarks {
  marks:                  [Option<Timed<Mark>>; LOCAL_MARK_SLOTS],
  pub changes:            ChangeList,
  /// Marks whose names have no slot, kept as they are.
  pub additional_marks:   Vec<Timed<Mark>>,
  /// Newest timestamp of anything seen for this file, stored or not.
  pub greatest_timestamp: Timestamp,
}

impl FileMarks {
  pub fn new(change_capacity: usize) -> Self {
    Self {
      marks:              std::array::from_fn(|_| None),
      changes:            ChangeList::new(change_capacity),
      additional_marks:   Vec::new(),
      greatest_timestamp: 0,
    }
  }

  fn touch(&mut self, timestamp: Timestamp) {
    self.greatest_timestamp = self.greatest_timestamp.max(timestamp);
  }

  /// Merges a local mark by name; the strictly newer one wins.
  pub fn insert_mark(&mut self, mark: Timed<Mark>) -> Insertion {
    self.touch(mark.timestamp);
    let Some(slot) = local_mark_slot(mark.value.name) else {
      return self.insert_additional(mark);
    };
    let current = &mut self.marks[slot];
    if current
      .as_ref()
      .is_some_and(|current| current.timestamp >= mark.timestamp)
    {
      return Insertion::Discarded;
    }
    match current.replace(mark) {
      Some(_) => Insertion::Replaced,
      None => Insertion::Inserted,
    }
  }

  fn insert_additional(&mut self, mark: Timed<Mark>) -> Insertion {
    let index = self
      .additional_marks
      .iter()
      .position(|existing| existing.value.name == mark.value.name);
    match index {
      Some(index) if self.additional_marks[index].timestamp >= mark.timestamp => {
        Insertion::Discarded
      },
      Some(index) => {
        self.additional_marks[index] = mark;
        Insertion::Replaced
      },
      None => {
        self.additional_marks.push(mark);
        Insertion::Inserted
      },
    }
  }

  pub fn insert_change(&mut self, change: Timed<Mark>) -> Insertion {
    self.touch(change.timestamp);
    self.changes.insert(change)
  }

  pub fn mark(&self, name: char) -> Option<&Timed<Mark>> {
    local_mark_slot(name).and_then(|slot| self.marks[slot].as_ref())
  }

  /// Slotted marks in [`LOCAL_MARK_NAMES`] order.
  pub fn local_marks(&self) -> impl Iterator<Item = &Timed<Mark>> + '_ {
    self.marks.iter().flatten()
  }

  pub fn into_parts(self) -> (Vec<Timed<Mark>>, Vec<Timed<Mark>>, Vec<Timed<Mark>>) {
    let marks = self.marks.into_iter().flatten().collect();
    (marks, self.changes.into_vec(), self.additional_marks)
  }
}

/// Per-file marks keyed by file name, in first-seen order.
#[derive(Debug, Clone)]
pub struct FileMarksMap {
  files:           IndexMap<PathBuf, FileMarks>,
  change_capacity: usize,
}

impl FileMarksMap {
  pub fn new(change_capacity: usize) -> Self {
    Self {
      files: IndexMap::new(),
      change_capacity,
    }
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  pub fn get(&self, file: &Path) -> Option<&FileMarks> {
    self.files.get(file)
  }

  pub fn file_mut(&mut self, file: &Path) -> &mut FileMarks {
    let change_capacity = self.change_capacity;
    self
      .files
      .entry(file.to_path_buf())
      .or_insert_with(|| FileMarks::new(change_capacity))
  }

  /// The `k` files with the newest activity, newest first. Files with equal
  /// activity keep their first-seen order.
  pub fn top(self, k: usize) -> Vec<(PathBuf, FileMarks)> {
    let mut files: Vec<_> = self.files.into_iter().collect();
    files.sort_by(|(_, a), (_, b)| b.greatest_timestamp.cmp(&a.greatest_timestamp));
    files.truncate(k);
    files
  }
}
