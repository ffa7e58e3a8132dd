//! Restoring a ShaDa file into the running session.

use std::{
  fs::File,
  io::{
    self,
    BufReader,
    Read,
  },
  path::{
    Path,
    PathBuf,
  },
};

use bitflags::bitflags;
use indexmap::{
  IndexMap,
  IndexSet,
  map::Entry as Slot,
};

use crate::{
  Timestamp,
  codec,
  config::ShadaConfig,
  entry::{
    Entry,
    EntryData,
    HistoryKind,
    Timed,
  },
  error::{
    Error,
    Result,
  },
  frame::FrameReader,
  history::HistoryRing,
  merge::{
    ChangeList,
    JumpList,
    is_global_mark_name,
    is_register_name,
  },
  state::LiveState,
};

bitflags! {
  /// What a read should restore.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct ReadFlags: u8 {
    /// Patterns, replacement, history, registers, variables, buffer list.
    const WANT_INFO = 1;
    /// Global and local marks, jumps and changes.
    const WANT_MARKS = 1 << 1;
    /// Overwrite live values even when they are newer.
    const FORCE = 1 << 2;
    /// Hand the files with local marks to [`LiveState::set_old_files`].
    const GET_OLD_FILES = 1 << 3;
    /// A missing file is an error instead of an empty read.
    const MISSING_ERROR = 1 << 4;

    /// Plain session restore.
    const RESTORE = Self::WANT_INFO.bits() | Self::WANT_MARKS.bits();
  }
}

/// What happened to the entries of one read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadReport {
  /// Entries that changed the session.
  pub applied: usize,
  /// Valid entries that were older than the session or not asked for.
  pub skipped: usize,
  /// Entries of kinds this crate does not know.
  pub unknown: usize,
  /// Entries that failed to decode or validate.
  pub invalid: usize,
}

/// Decoded entries of a stream.
///
/// Item errors are yielded and iteration goes on; after a fatal error the
/// iterator is exhausted.
pub struct Entries<R> {
  frames: FrameReader<R>,
  done:   bool,
}

pub fn entries<R: Read>(reader: R) -> Entries<R> {
  Entries {
    frames: FrameReader::new(reader),
    done:   false,
  }
}

impl<R> Entries<R> {
  /// Bytes consumed so far.
  pub fn offset(&self) -> u64 {
    self.frames.offset()
  }
}

impl<R: Read> Iterator for Entries<R> {
  type Item = Result<Entry>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    match self.frames.read_frame() {
      Ok(Some(frame)) => Some(codec::decode(frame)),
      Ok(None) => {
        self.done = true;
        None
      },
      Err(err) => {
        self.done = true;
        Some(Err(err))
      },
    }
  }
}

/// Opens `path` for reading. `Ok(None)` means the file does not exist.
pub(crate) fn open(path: &Path) -> Result<Option<BufReader<File>>> {
  match File::open(path) {
    Ok(file) => Ok(Some(BufReader::new(file))),
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(err) => Err(Error::system(format!("failed to open {}", path.display()), err)),
  }
}

/// Restores the file at `path` into `state`.
///
/// A missing file is an empty read unless [`ReadFlags::MISSING_ERROR`] is
/// set. A fatal error ends the read, but everything restored before it stays
/// restored.
pub fn read_file<S: LiveState + ?Sized>(
  path: &Path,
  config: &ShadaConfig,
  state: &mut S,
  flags: ReadFlags,
) -> Result<ReadReport> {
  let Some(reader) = open(path)? else {
    if flags.contains(ReadFlags::MISSING_ERROR) {
      return Err(Error::Missing(path.to_path_buf()));
    }
    log::debug!("no ShaDa file at {}", path.display());
    return Ok(ReadReport::default());
  };

  let report = read_from(reader, config, state, flags).inspect_err(|err| {
    log::error!("reading {} stopped: {err}", path.display());
  })?;
  log::info!(
    "read {}: {} applied, {} skipped, {} unknown, {} invalid",
    path.display(),
    report.applied,
    report.skipped,
    report.unknown,
    report.invalid
  );
  Ok(report)
}

/// Restores the entries of `reader` into `state`.
pub fn read_from<R: Read, S: LiveState + ?Sized>(
  reader: R,
  config: &ShadaConfig,
  state: &mut S,
  flags: ReadFlags,
) -> Result<ReadReport> {
  let mut restore = Restore::new(config, state, flags);
  let mut outcome = Ok(());
  for entry in entries(reader) {
    match entry {
      Ok(entry) => restore.apply(entry),
      Err(err) if !err.is_fatal() => {
        log::warn!("skipping ShaDa entry: {err}");
        restore.report.invalid += 1;
      },
      Err(err) => {
        outcome = Err(err);
        break;
      },
    }
  }
  let report = restore.finish();
  outcome.map(|()| report)
}

struct Restore<'a, S: ?Sized> {
  config:    &'a ShadaConfig,
  state:     &'a mut S,
  flags:     ReadFlags,
  report:    ReadReport,
  history:   [Option<HistoryRing>; HistoryKind::COUNT],
  jumps:     Option<JumpList>,
  changes:   IndexMap<PathBuf, ChangeList>,
  old_files: IndexSet<PathBuf>,
}

impl<'a, S: LiveState + ?Sized> Restore<'a, S> {
  fn new(config: &'a ShadaConfig, state: &'a mut S, flags: ReadFlags) -> Self {
    Self {
      config,
      state,
      flags,
      report: ReadReport::default(),
      history: std::array::from_fn(|_| None),
      jumps: None,
      changes: IndexMap::new(),
      old_files: IndexSet::new(),
    }
  }

  fn force(&self) -> bool {
    self.flags.contains(ReadFlags::FORCE)
  }

  /// Whether an entry stamped `timestamp` replaces a live value.
  fn wins(&self, timestamp: Timestamp, live: Option<Timestamp>) -> bool {
    self.force() || live.is_none_or(|live| timestamp > live)
  }

  fn count(&mut self, applied: bool) {
    if applied {
      self.report.applied += 1;
    } else {
      self.report.skipped += 1;
    }
  }

  fn apply(&mut self, entry: Entry) {
    let info = self.flags.contains(ReadFlags::WANT_INFO);
    let marks = self.flags.contains(ReadFlags::WANT_MARKS);
    let Entry { timestamp, data } = entry;

    match data {
      EntryData::Header(header) => {
        if let Some(generator) = header.get("generator").and_then(|value| value.as_str()) {
          log::debug!("ShaDa file written by {generator}");
        }
      },
      EntryData::SearchPattern(pattern) if info => {
        let substitute = pattern.is_substitute_pattern;
        let live = self.state.search_pattern(substitute);
        let applied = self.wins(timestamp, live.map(|live| live.timestamp));
        if applied {
          self
            .state
            .set_search_pattern(substitute, Timed::new(timestamp, pattern));
        }
        self.count(applied);
      },
      EntryData::SubString(replacement) if info => {
        let live = self.state.replacement();
        let applied = self.wins(timestamp, live.map(|live| live.timestamp));
        if applied {
          self.state.set_replacement(Timed::new(timestamp, replacement));
        }
        self.count(applied);
      },
      EntryData::HistoryEntry(item) if info => {
        let prefer = self.force();
        let applied = self
          .history_ring(item.kind)
          .is_some_and(|ring| ring.insert(Timed::new(timestamp, item), prefer));
        self.count(applied);
      },
      EntryData::Register(register) if info => {
        if !is_register_name(register.name) {
          log::warn!("ignoring register with invalid name {:?}", register.name);
          self.report.skipped += 1;
          return;
        }
        let live = self.state.register(register.name);
        let applied = self.wins(timestamp, live.map(|live| live.timestamp));
        if applied {
          self.state.set_register(Timed::new(timestamp, register));
        }
        self.count(applied);
      },
      EntryData::Variable(variable) if info && self.config.variables => {
        let applied = self.force() || !self.state.has_variable(&variable.name);
        if applied {
          self.state.set_variable(variable);
        }
        self.count(applied);
      },
      EntryData::GlobalMark(mark) if marks && self.config.global_marks => {
        if !is_global_mark_name(mark.name) {
          log::warn!("ignoring global mark with invalid name {:?}", mark.name);
          self.report.skipped += 1;
          return;
        }
        let live = self.state.global_mark(mark.name);
        let applied = self.wins(timestamp, live.map(|live| live.timestamp));
        if applied {
          self.state.set_global_mark(Timed::new(timestamp, mark));
        }
        self.count(applied);
      },
      EntryData::Jump(mark) if marks => {
        let applied = self
          .jump_list()
          .is_some_and(|jumps| jumps.insert(Timed::new(timestamp, mark)).is_stored());
        self.count(applied);
      },
      EntryData::BufferList(buffers) if info && self.config.buffer_list.is_some() => {
        self.state.restore_buffers(buffers);
        self.report.applied += 1;
      },
      EntryData::LocalMark(mark)
        if marks || self.flags.contains(ReadFlags::GET_OLD_FILES) =>
      {
        if self.flags.contains(ReadFlags::GET_OLD_FILES) {
          self.old_files.insert(mark.file.clone());
        }
        let live = self.state.local_mark(&mark.file, mark.name);
        let applied = marks
          && self.config.marked_files > 0
          && self.wins(timestamp, live.map(|live| live.timestamp));
        if applied {
          self.state.set_local_mark(Timed::new(timestamp, mark));
        }
        self.count(applied);
      },
      EntryData::Change(mark) if marks && self.config.marked_files > 0 => {
        let applied = self
          .change_list(&mark.file)
          .insert(Timed::new(timestamp, mark))
          .is_stored();
        self.count(applied);
      },
      EntryData::Unknown { kind, .. } => {
        log::debug!("skipping ShaDa entry of unknown kind {kind}");
        self.report.unknown += 1;
      },
      _ => self.report.skipped += 1,
    }
  }

  /// The merge ring of `kind`, seeded from the session on first use.
  fn history_ring(&mut self, kind: HistoryKind) -> Option<&mut HistoryRing> {
    let capacity = self.config.history.get(kind);
    if capacity == 0 {
      return None;
    }
    let slot = &mut self.history[kind.index()];
    if slot.is_none() {
      let mut ring = HistoryRing::new(capacity);
      for live in self.state.history(kind) {
        if ring.is_full() && ring.oldest_timestamp().is_some_and(|oldest| live.timestamp < oldest) {
          break;
        }
        ring.insert(live, false);
      }
      *slot = Some(ring);
    }
    slot.as_mut()
  }

  fn jump_list(&mut self) -> Option<&mut JumpList> {
    if self.config.jumps == 0 {
      return None;
    }
    if self.jumps.is_none() {
      let mut jumps = JumpList::new(self.config.jumps);
      for live in self.state.jumps() {
        if jumps.is_full()
          && jumps
            .oldest_timestamp()
            .is_some_and(|oldest| live.timestamp < oldest)
        {
          break;
        }
        jumps.insert(live);
      }
      self.jumps = Some(jumps);
    }
    self.jumps.as_mut()
  }

  fn change_list(&mut self, file: &Path) -> &mut ChangeList {
    match self.changes.entry(file.to_path_buf()) {
      Slot::Occupied(slot) => slot.into_mut(),
      Slot::Vacant(slot) => {
        let mut changes = ChangeList::new(self.config.changes);
        changes.extend(self.state.changes(file));
        slot.insert(changes)
      },
    }
  }

  /// Hands the merged lists to the session.
  fn finish(mut self) -> ReadReport {
    for kind in HistoryKind::ALL {
      if let Some(ring) = self.history[kind.index()].take() {
        self.state.replace_history(kind, ring.into_vec());
      }
    }
    if let Some(jumps) = self.jumps.take() {
      self.state.set_jumps(jumps.into_vec());
    }
    for (file, changes) in self.changes.drain(..) {
      self.state.set_changes(&file, changes.into_vec());
    }
    if self.flags.contains(ReadFlags::GET_OLD_FILES) {
      let old_files = std::mem::take(&mut self.old_files);
      self.state.set_old_files(old_files.into_iter().collect());
    }
    self.report
  }
}

#[cfg(test)]
mod tests {
  use rmpv::Value;

  use super::*;
  use crate::{
    entry::{
      HistoryItem,
      Mark,
      Register,
      SearchPattern,
      Variable,
    },
    frame::write_frame,
    state::MemoryState,
  };

  fn file_of(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
      let payload = codec::encode(entry).unwrap();
      write_frame(&mut out, entry.kind_id(), entry.timestamp, &payload).unwrap();
    }
    out
  }

  fn restore(bytes: &[u8], state: &mut MemoryState, flags: ReadFlags) -> Result<ReadReport> {
    read_from(bytes, &ShadaConfig::default(), state, flags)
  }

  #[test]
  fn only_newer_entries_replace_live_values() {
    let mut state = MemoryState::new();
    state.search_pattern = Some(Timed::new(10, SearchPattern::new("live")));
    state.set_register(Timed::new(10, Register::new('a', vec![b"live".to_vec()])));

    let bytes = file_of(&[
      Entry::new(5, EntryData::SearchPattern(SearchPattern::new("old"))),
      Entry::new(
        20,
        EntryData::Register(Register::new('a', vec![b"disk".to_vec()])),
      ),
    ]);
    let report = restore(&bytes, &mut state, ReadFlags::RESTORE).unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(state.search_pattern.unwrap().value.pattern, b"live".to_vec());
    assert_eq!(state.registers[&'a'].value.contents, vec![b"disk".to_vec()]);
  }

  #[test]
  fn force_overwrites_newer_live_values() {
    let mut state = MemoryState::new();
    state.search_pattern = Some(Timed::new(10, SearchPattern::new("live")));
    let bytes = file_of(&[Entry::new(
      5,
      EntryData::SearchPattern(SearchPattern::new("disk")),
    )]);
    restore(&bytes, &mut state, ReadFlags::RESTORE | ReadFlags::FORCE).unwrap();
    assert_eq!(state.search_pattern.unwrap().timestamp, 5);
  }

  #[test]
  fn history_is_merged_with_the_session() {
    let mut state = MemoryState::new();
    state.push_history(5, HistoryItem::new(HistoryKind::Command, "live"));
    state.push_history(7, HistoryItem::new(HistoryKind::Command, "shared"));

    let bytes = file_of(&[
      Entry::new(
        6,
        EntryData::HistoryEntry(HistoryItem::new(HistoryKind::Command, "disk")),
      ),
      Entry::new(
        7,
        EntryData::HistoryEntry(HistoryItem::new(HistoryKind::Command, "shared")),
      ),
    ]);
    let report = restore(&bytes, &mut state, ReadFlags::RESTORE).unwrap();
    assert_eq!(report.applied, 1);

    let texts: Vec<_> = state
      .history_of(HistoryKind::Command)
      .iter()
      .map(|entry| (entry.value.text.clone(), entry.timestamp))
      .collect();
    assert_eq!(texts, vec![
      (b"live".to_vec(), 5),
      (b"disk".to_vec(), 6),
      (b"shared".to_vec(), 7),
    ]);
  }

  #[test]
  fn variables_only_fill_gaps() {
    let mut state = MemoryState::new();
    state.variables.insert(b"KEPT".to_vec(), Value::from(1));
    let variable = |name: &str, value: i64| {
      Entry::new(
        1,
        EntryData::Variable(Variable {
          name:       name.as_bytes().to_vec(),
          value:      Value::from(value),
          additional: Vec::new(),
        }),
      )
    };
    let bytes = file_of(&[variable("KEPT", 2), variable("NEW", 3)]);
    restore(&bytes, &mut state, ReadFlags::RESTORE).unwrap();
    assert_eq!(state.variables[b"KEPT".as_slice()], Value::from(1));
    assert_eq!(state.variables[b"NEW".as_slice()], Value::from(3));
  }

  #[test]
  fn marks_need_their_flag() {
    let mut state = MemoryState::new();
    let bytes = file_of(&[
      Entry::new(1, EntryData::GlobalMark(Mark::named('A', "/a", 2, 0))),
      Entry::new(1, EntryData::LocalMark(Mark::named('b', "/b", 3, 0))),
      Entry::new(1, EntryData::Jump(Mark::new("/c", 4, 0))),
    ]);
    let report = restore(&bytes, &mut state, ReadFlags::WANT_INFO).unwrap();
    assert_eq!(report.skipped, 3);
    assert!(state.global_marks.is_empty());

    let report = restore(&bytes, &mut state, ReadFlags::WANT_MARKS).unwrap();
    assert_eq!(report.applied, 3);
    assert_eq!(state.global_marks[&'A'].value.lnum, 2);
    assert_eq!(state.local_mark(Path::new("/b"), 'b').unwrap().value.lnum, 3);
    assert_eq!(state.jumps.len(), 1);
  }

  #[test]
  fn old_files_are_collected_in_file_order() {
    let mut state = MemoryState::new();
    let bytes = file_of(&[
      Entry::new(1, EntryData::LocalMark(Mark::named('"', "/two", 1, 0))),
      Entry::new(1, EntryData::LocalMark(Mark::named('"', "/one", 1, 0))),
      Entry::new(1, EntryData::LocalMark(Mark::named('a', "/two", 1, 0))),
    ]);
    restore(&bytes, &mut state, ReadFlags::GET_OLD_FILES).unwrap();
    assert_eq!(state.old_files, vec![
      PathBuf::from("/two"),
      PathBuf::from("/one")
    ]);
    assert!(state.files.is_empty());
  }

  #[test]
  fn invalid_entries_are_skipped() {
    let mut bytes = Vec::new();
    let mut payload = Vec::new();
    rmpv::encode::write_value(
      &mut payload,
      &Value::Map(vec![(Value::from("n"), Value::from(97))]),
    )
    .unwrap();
    write_frame(&mut bytes, 5, 1, &payload).unwrap();
    write_frame(&mut bytes, 42, 1, &[0xc0]).unwrap();
    bytes.extend(file_of(&[Entry::new(
      2,
      EntryData::GlobalMark(Mark::named('B', "/b", 1, 0)),
    )]));

    let mut state = MemoryState::new();
    let report = restore(&bytes, &mut state, ReadFlags::RESTORE).unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(report.unknown, 1);
    assert_eq!(report.applied, 1);
  }

  #[test]
  fn a_fatal_error_keeps_what_was_applied() {
    let mut bytes = file_of(&[Entry::new(
      3,
      EntryData::GlobalMark(Mark::named('C', "/c", 1, 0)),
    )]);
    bytes.extend([7, 1, 50]);
    bytes.extend([0u8; 10]);

    let mut state = MemoryState::new();
    let err = restore(&bytes, &mut state, ReadFlags::RESTORE).unwrap_err();
    assert!(matches!(err, Error::Format { .. }));
    assert!(state.global_marks.contains_key(&'C'));
  }

  #[test]
  fn missing_files_follow_the_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.shada");
    let mut state = MemoryState::new();
    let config = ShadaConfig::default();

    let report = read_file(&path, &config, &mut state, ReadFlags::RESTORE).unwrap();
    assert_eq!(report, ReadReport::default());

    let err = read_file(
      &path,
      &config,
      &mut state,
      ReadFlags::RESTORE | ReadFlags::MISSING_ERROR,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Missing(_)));
  }
}
