//! The running session as seen by the persistence engine.
//!
//! The host editor implements [`LiveState`]; [`MemoryState`] is a complete
//! in-memory implementation used by the command line tool and by tests.

use std::{
  collections::BTreeMap,
  path::{
    Path,
    PathBuf,
  },
};

use indexmap::IndexMap;
use rmpv::Value;

use crate::{
  config::ShadaConfig,
  entry::{
    BufferEntry,
    HistoryItem,
    HistoryKind,
    Mark,
    Register,
    SearchPattern,
    SubString,
    Timed,
    Variable,
  },
};

/// A global variable offered for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveVariable {
  pub name:  Vec<u8>,
  /// `Err` carries the reason the value has no persistent form.
  pub value: std::result::Result<Value, String>,
}

/// Access to the session's in-memory equivalents of persisted state.
///
/// Lists handed out as iterators are newest first so that callers can stop
/// early; lists handed in are oldest first.
pub trait LiveState {
  fn search_pattern(&self, substitute: bool) -> Option<Timed<SearchPattern>>;
  fn set_search_pattern(&mut self, substitute: bool, pattern: Timed<SearchPattern>);

  fn replacement(&self) -> Option<Timed<SubString>>;
  fn set_replacement(&mut self, replacement: Timed<SubString>);

  /// History of `kind`, newest first.
  fn history(&self, kind: HistoryKind) -> Box<dyn Iterator<Item = Timed<HistoryItem>> + '_>;
  /// Replaces the history of `kind` with `entries`, oldest first.
  fn replace_history(&mut self, kind: HistoryKind, entries: Vec<Timed<HistoryItem>>);
  fn clear_history(&mut self, kind: HistoryKind) {
    self.replace_history(kind, Vec::new());
  }

  fn registers(&self) -> Vec<Timed<Register>>;
  fn register(&self, name: char) -> Option<Timed<Register>>;
  fn set_register(&mut self, register: Timed<Register>);

  fn variables(&self) -> Vec<LiveVariable>;
  fn has_variable(&self, name: &[u8]) -> bool;
  fn set_variable(&mut self, variable: Variable);

  fn global_marks(&self) -> Vec<Timed<Mark>>;
  fn global_mark(&self, name: char) -> Option<Timed<Mark>>;
  fn set_global_mark(&mut self, mark: Timed<Mark>);

  /// Files that have local marks or changes in the session.
  fn marked_files(&self) -> Vec<PathBuf>;
  fn local_marks(&self, file: &Path) -> Vec<Timed<Mark>>;
  fn local_mark(&self, file: &Path, name: char) -> Option<Timed<Mark>>;
  /// Sets a local mark of the file named by `mark.value.file`.
  fn set_local_mark(&mut self, mark: Timed<Mark>);
  /// Change list of `file`, oldest first.
  fn changes(&self, file: &Path) -> Vec<Timed<Mark>>;
  fn set_changes(&mut self, file: &Path, changes: Vec<Timed<Mark>>);

  /// Jump list, newest first.
  fn jumps(&self) -> Box<dyn Iterator<Item = Timed<Mark>> + '_>;
  /// Replaces the jump list, oldest first.
  fn set_jumps(&mut self, jumps: Vec<Timed<Mark>>);

  /// Open files with their last cursor position.
  fn buffers(&self) -> Vec<BufferEntry>;
  fn restore_buffers(&mut self, buffers: Vec<BufferEntry>);

  /// Receives the files that have local marks in the persisted file.
  fn set_old_files(&mut self, files: Vec<PathBuf>) {
    let _ = files;
  }

  /// Host-specific exclusion on top of the configured removable prefixes.
  fn is_removable(&self, path: &Path) -> bool {
    let _ = path;
    false
  }
}

/// Whether anything about `path` must not be persisted.
pub(crate) fn is_removable<S: LiveState + ?Sized>(
  config: &ShadaConfig,
  state: &S,
  path: &Path,
) -> bool {
  config.is_removable(path) || state.is_removable(path)
}

/// Marks and changes of one file in a [`MemoryState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFile {
  pub marks:   BTreeMap<char, Timed<Mark>>,
  /// Oldest first.
  pub changes: Vec<Timed<Mark>>,
}

/// A session that lives entirely in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
  pub search_pattern:     Option<Timed<SearchPattern>>,
  pub substitute_pattern: Option<Timed<SearchPattern>>,
  pub replacement:        Option<Timed<SubString>>,
  /// Per history kind, oldest first.
  pub history:            [Vec<Timed<HistoryItem>>; HistoryKind::COUNT],
  pub registers:          BTreeMap<char, Timed<Register>>,
  pub variables:          IndexMap<Vec<u8>, Value>,
  /// Variables whose values cannot be persisted, such as functions.
  pub opaque_variables:   Vec<Vec<u8>>,
  pub global_marks:       BTreeMap<char, Timed<Mark>>,
  pub files:              BTreeMap<PathBuf, MemoryFile>,
  /// Oldest first.
  pub jumps:              Vec<Timed<Mark>>,
  pub buffers:            Vec<BufferEntry>,
  pub old_files:          Vec<PathBuf>,
}

impl MemoryState {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a history entry as the newest of its kind.
  pub fn push_history(&mut self, timestamp: crate::Timestamp, item: HistoryItem) {
    self.history[item.kind.index()].push(Timed::new(timestamp, item));
  }

  pub fn history_of(&self, kind: HistoryKind) -> &[Timed<HistoryItem>] {
    &self.history[kind.index()]
  }

  pub fn file(&self, file: &Path) -> Option<&MemoryFile> {
    self.files.get(file)
  }
}

impl LiveState for MemoryState {
  fn search_pattern(&self, substitute: bool) -> Option<Timed<SearchPattern>> {
    if substitute {
      self.substitute_pattern.clone()
    } else {
      self.search_pattern.clone()
    }
  }

  fn set_search_pattern(&mut self, substitute: bool, pattern: Timed<SearchPattern>) {
    if substitute {
      self.substitute_pattern = Some(pattern);
    } else {
      self.search_pattern = Some(pattern);
    }
  }

  fn replacement(&self) -> Option<Timed<SubString>> {
    self.replacement.clone()
  }

  fn set_replacement(&mut self, replacement: Timed<SubString>) {
    self.replacement = Some(replacement);
  }

  fn history(&self, kind: HistoryKind) -> Box<dyn Iterator<Item = Timed<HistoryItem>> + '_> {
    Box::new(self.history[kind.index()].iter().rev().cloned())
  }

  fn replace_history(&mut self, kind: HistoryKind, entries: Vec<Timed<HistoryItem>>) {
    self.history[kind.index()] = entries;
  }

  fn registers(&self) -> Vec<Timed<Register>> {
    self.registers.values().cloned().collect()
  }

  fn register(&self, name: char) -> Option<Timed<Register>> {
    self.registers.get(&name).cloned()
  }

  fn set_register(&mut self, register: Timed<Register>) {
    self.registers.insert(register.value.name, register);
  }

  fn variables(&self) -> Vec<LiveVariable> {
    let values = self.variables.iter().map(|(name, value)| {
      LiveVariable {
        name:  name.clone(),
        value: Ok(value.clone()),
      }
    });
    let opaque = self.opaque_variables.iter().map(|name| {
      LiveVariable {
        name:  name.clone(),
        value: Err("value has no persistent form".to_owned()),
      }
    });
    values.chain(opaque).collect()
  }

  fn has_variable(&self, name: &[u8]) -> bool {
    self.variables.contains_key(name) || self.opaque_variables.iter().any(|opaque| opaque == name)
  }

  fn set_variable(&mut self, variable: Variable) {
    self.variables.insert(variable.name, variable.value);
  }

  fn global_marks(&self) -> Vec<Timed<Mark>> {
    self.global_marks.values().cloned().collect()
  }

  fn global_mark(&self, name: char) -> Option<Timed<Mark>> {
    self.global_marks.get(&name).cloned()
  }

  fn set_global_mark(&mut self, mark: Timed<Mark>) {
    self.global_marks.insert(mark.value.name, mark);
  }

  fn marked_files(&self) -> Vec<PathBuf> {
    self.files.keys().cloned().collect()
  }

  fn local_marks(&self, file: &Path) -> Vec<Timed<Mark>> {
    self
      .files
      .get(file)
      .map(|marks| marks.marks.values().cloned().collect())
      .unwrap_or_default()
  }

  fn local_mark(&self, file: &Path, name: char) -> Option<Timed<Mark>> {
    self.files.get(file)?.marks.get(&name).cloned()
  }

  fn set_local_mark(&mut self, mark: Timed<Mark>) {
    self
      .files
      .entry(mark.value.file.clone())
      .or_default()
      .marks
      .insert(mark.value.name, mark);
  }

  fn changes(&self, file: &Path) -> Vec<Timed<Mark>> {
    self
      .files
      .get(file)
      .map(|marks| marks.changes.clone())
      .unwrap_or_default()
  }

  fn set_changes(&mut self, file: &Path, changes: Vec<Timed<Mark>>) {
    self.files.entry(file.to_path_buf()).or_default().changes = changes;
  }

  fn jumps(&self) -> Box<dyn Iterator<Item = Timed<Mark>> + '_> {
    Box::new(self.jumps.iter().rev().cloned())
  }

  fn set_jumps(&mut self, jumps: Vec<Timed<Mark>>) {
    self.jumps = jumps;
  }

  fn buffers(&self) -> Vec<BufferEntry> {
    self.buffers.clone()
  }

  fn restore_buffers(&mut self, buffers: Vec<BufferEntry>) {
    self.buffers = buffers;
  }

  fn set_old_files(&mut self, files: Vec<PathBuf>) {
    self.old_files = files;
  }
}
