//! Merging the session with the previous file and emitting the result.
//!
//! The session is snapshotted first, so on equal timestamps it wins against
//! the file for everything but history, where live entries are merged last
//! with an explicit preference. History and jumps are consumed newest first
//! and only as far as they can still make it into their bounded lists.

use std::io::{
  Read,
  Write,
};

use indexmap::IndexMap;

use crate::{
  codec,
  config::ShadaConfig,
  entry::{
    Entry,
    EntryData,
    Header,
    HistoryKind,
    Kind,
    Mark,
    SearchPattern,
    SubString,
    Timed,
    Variable,
  },
  error::{
    Error,
    Result,
  },
  frame::write_frame,
  history::HistoryRing,
  merge::{
    FileMarksMap,
    GLOBAL_MARK_CAPACITY,
    GlobalMarks,
    JumpList,
    REGISTER_CAPACITY,
    Registers,
    is_global_mark_name,
    is_register_name,
  },
  read::entries,
  state::{
    LiveState,
    is_removable,
  },
};

/// How the previous file took part in a write.
#[derive(Debug)]
pub enum MergeStatus {
  /// There was no previous file.
  NoPreviousFile,
  /// The previous file was merged completely.
  Clean,
  /// The previous file broke off at `error`; the `entries` decoded before it
  /// were merged and the rest was lost.
  Recovered { error: Error, entries: usize },
  /// The previous file was ignored and replaced.
  Overwritten,
}

impl MergeStatus {
  pub fn is_recovered(&self) -> bool {
    matches!(self, Self::Recovered { .. })
  }
}

/// Outcome of a successful write.
#[derive(Debug)]
pub struct WriteReport {
  pub merge:   MergeStatus,
  /// Entries written.
  pub written: usize,
  /// Entries left out: unencodable, too large or over a limit.
  pub skipped: usize,
}

/// Writes frames, leaving out entries that cannot be encoded or are larger
/// than the configured limit.
pub struct EntryWriter<'w, W> {
  out:       &'w mut W,
  max_bytes: Option<u64>,
  written:   usize,
  skipped:   usize,
}

impl<'w, W: Write> EntryWriter<'w, W> {
  pub fn new(out: &'w mut W, max_bytes: Option<u64>) -> Self {
    Self {
      out,
      max_bytes,
      written: 0,
      skipped: 0,
    }
  }

  pub fn written(&self) -> usize {
    self.written
  }

  pub fn skipped(&self) -> usize {
    self.skipped
  }

  fn skip(&mut self) {
    self.skipped += 1;
  }

  pub fn write(&mut self, entry: &Entry) -> Result<()> {
    let payload = match codec::encode(entry) {
      Ok(payload) => payload,
      Err(err) if !err.is_fatal() => {
        log::warn!("not writing entry: {err}");
        self.skip();
        return Ok(());
      },
      Err(err) => return Err(err),
    };

    let exempt = matches!(entry.kind(), Kind::Header | Kind::BufferList | Kind::Unknown);
    if let Some(max_bytes) = self.max_bytes.filter(|_| !exempt) {
      if payload.len() as u64 > max_bytes {
        log::debug!(
          "not writing {} entry of {} bytes (limit {max_bytes})",
          entry.kind(),
          payload.len()
        );
        self.skip();
        return Ok(());
      }
    }

    write_frame(&mut *self.out, entry.kind_id(), entry.timestamp, &payload)?;
    self.written += 1;
    Ok(())
  }
}

/// Merges `state` with the `previous` file contents and writes the result to
/// `out`.
///
/// A previous file that turns out to be malformed is merged up to the point
/// of damage and reported as [`MergeStatus::Recovered`]. I/O errors while
/// reading it abort the write.
pub fn write_to<W, R, S>(
  out: &mut W,
  previous: Option<R>,
  config: &ShadaConfig,
  state: &S,
) -> Result<WriteReport>
where
  W: Write,
  R: Read,
  S: LiveState + ?Sized,
{
  let mut merger = Merger::new(config, state);
  merger.seed();
  let merge = match previous {
    Some(previous) => merger.absorb(previous)?,
    None => MergeStatus::NoPreviousFile,
  };
  merger.seed_history();

  let ignored = merger.skipped;
  let mut writer = EntryWriter::new(out, config.max_payload_bytes());
  merger.emit(&mut writer)?;
  let report = WriteReport {
    merge,
    written: writer.written(),
    skipped: writer.skipped() + ignored,
  };
  log::debug!(
    "merged ShaDa data: {} entries written, {} skipped",
    report.written,
    report.skipped
  );
  Ok(report)
}

struct Merger<'a, S: ?Sized> {
  config:             &'a ShadaConfig,
  state:              &'a S,
  search_pattern:     Option<Timed<SearchPattern>>,
  substitute_pattern: Option<Timed<SearchPattern>>,
  replacement:        Option<Timed<SubString>>,
  variables:          IndexMap<Vec<u8>, Timed<Variable>>,
  history:            [HistoryRing; HistoryKind::COUNT],
  registers:          Registers,
  global_marks:       GlobalMarks,
  jumps:              JumpList,
  files:              FileMarksMap,
  unknown:            Vec<Entry>,
  skipped:            usize,
}

/// Stores `incoming` unless the slot holds something at least as new.
fn keep_newer<T>(slot: &mut Option<Timed<T>>, incoming: Timed<T>) {
  if slot
    .as_ref()
    .is_none_or(|current| incoming.timestamp > current.timestamp)
  {
    *slot = Some(incoming);
  }
}

impl<'a, S: LiveState + ?Sized> Merger<'a, S> {
  fn new(config: &'a ShadaConfig, state: &'a S) -> Self {
    Self {
      config,
      state,
      search_pattern: None,
      substitute_pattern: None,
      replacement: None,
      variables: IndexMap::new(),
      history: std::array::from_fn(|index| {
        HistoryRing::new(config.history.get(HistoryKind::ALL[index]))
      }),
      registers: Registers::new(REGISTER_CAPACITY),
      global_marks: GlobalMarks::new(GLOBAL_MARK_CAPACITY),
      jumps: JumpList::new(config.jumps),
      files: FileMarksMap::new(config.changes),
      unknown: Vec::new(),
      skipped: 0,
    }
  }

  fn removable(&self, mark: &Mark) -> bool {
    is_removable(self.config, self.state, &mark.file)
  }

  /// Takes everything but history from the session.
  fn seed(&mut self) {
    let state = self.state;
    self.search_pattern = state.search_pattern(false);
    self.substitute_pattern = state.search_pattern(true);
    self.replacement = state.replacement();

    if self.config.variables {
      let now = crate::now();
      for variable in state.variables() {
        match variable.value {
          Ok(value) => {
            let name = variable.name.clone();
            let variable = Variable {
              name: variable.name,
              value,
              additional: Vec::new(),
            };
            self.variables.insert(name, Timed::new(now, variable));
          },
          Err(reason) => {
            let err = Error::write_ignorable(
              Kind::Variable,
              format!("{}: {reason}", String::from_utf8_lossy(&variable.name)),
            );
            log::warn!("{err}");
            self.skipped += 1;
          },
        }
      }
    }

    for register in state.registers() {
      if is_register_name(register.value.name) {
        self.registers.insert(register);
      }
    }

    if self.config.global_marks {
      for mark in state.global_marks() {
        if is_global_mark_name(mark.value.name) && !self.removable(&mark.value) {
          self.global_marks.insert(mark);
        }
      }
    }

    if self.config.marked_files > 0 {
      for file in state.marked_files() {
        if is_removable(self.config, state, &file) {
          continue;
        }
        let marks = self.files.file_mut(&file);
        for mark in state.local_marks(&file) {
          marks.insert_mark(mark);
        }
        for change in state.changes(&file) {
          marks.insert_change(change);
        }
      }
    }

    for jump in state.jumps() {
      if self.jumps.is_full()
        && self
          .jumps
          .oldest_timestamp()
          .is_none_or(|oldest| jump.timestamp < oldest)
      {
        break;
      }
      if !self.removable(&jump.value) {
        self.jumps.insert(jump);
      }
    }
  }

  /// Streams the previous file into the merge structures.
  fn absorb<R: Read>(&mut self, previous: R) -> Result<MergeStatus> {
    let mut merged = 0;
    for entry in entries(previous) {
      match entry {
        Ok(entry) => {
          merged += 1;
          self.absorb_entry(entry);
        },
        Err(err) if !err.is_fatal() => log::warn!("dropping entry of previous file: {err}"),
        Err(err @ Error::Format { .. }) => {
          log::warn!("previous ShaDa file is damaged, keeping {merged} entries: {err}");
          return Ok(MergeStatus::Recovered {
            error:   err,
            entries: merged,
          });
        },
        Err(err) => return Err(err),
      }
    }
    Ok(MergeStatus::Clean)
  }

  fn absorb_entry(&mut self, entry: Entry) {
    let Entry { timestamp, data } = entry;
    match data {
      EntryData::Header(_) | EntryData::BufferList(_) => {},
      EntryData::SearchPattern(pattern) => {
        let slot = if pattern.is_substitute_pattern {
          &mut self.substitute_pattern
        } else {
          &mut self.search_pattern
        };
        keep_newer(slot, Timed::new(timestamp, pattern));
      },
      EntryData::SubString(replacement) => {
        keep_newer(&mut self.replacement, Timed::new(timestamp, replacement));
      },
      EntryData::HistoryEntry(item) => {
        self.history[item.kind.index()].insert(Timed::new(timestamp, item), false);
      },
      EntryData::Register(register) => {
        if is_register_name(register.name) {
          self.registers.insert(Timed::new(timestamp, register));
        }
      },
      EntryData::Variable(variable) => {
        if self.config.variables && !self.variables.contains_key(&variable.name) {
          self
            .variables
            .insert(variable.name.clone(), Timed::new(timestamp, variable));
        }
      },
      EntryData::GlobalMark(mark) => {
        if self.config.global_marks && is_global_mark_name(mark.name) && !self.removable(&mark) {
          self.global_marks.insert(Timed::new(timestamp, mark));
        }
      },
      EntryData::Jump(mark) => {
        if !self.removable(&mark) {
          self.jumps.insert(Timed::new(timestamp, mark));
        }
      },
      EntryData::LocalMark(mark) => {
        if self.config.marked_files > 0 && !self.removable(&mark) {
          let file = mark.file.clone();
          self
            .files
            .file_mut(&file)
            .insert_mark(Timed::new(timestamp, mark));
        }
      },
      EntryData::Change(mark) => {
        if self.config.marked_files > 0 && !self.removable(&mark) {
          let file = mark.file.clone();
          self
            .files
            .file_mut(&file)
            .insert_change(Timed::new(timestamp, mark));
        }
      },
      data @ EntryData::Unknown { .. } => self.unknown.push(Entry::new(timestamp, data)),
    }
  }

  /// Merges live history last, winning ties against the file.
  fn seed_history(&mut self) {
    let state = self.state;
    for kind in HistoryKind::ALL {
      let ring = &mut self.history[kind.index()];
      if ring.capacity() == 0 {
        continue;
      }
      for live in state.history(kind) {
        if ring.is_full()
          && ring
            .oldest_timestamp()
            .is_none_or(|oldest| live.timestamp < oldest)
        {
          break;
        }
        ring.insert(live, true);
      }
    }
  }

  fn emit<W: Write>(self, writer: &mut EntryWriter<'_, W>) -> Result<()> {
    let Self {
      config,
      state,
      search_pattern,
      substitute_pattern,
      replacement,
      variables,
      history,
      registers,
      global_marks,
      jumps,
      files,
      unknown,
      ..
    } = self;
    let now = crate::now();

    writer.write(&Entry::new(
      now,
      EntryData::Header(Header::new(config.max_kbyte)),
    ))?;

    if let Some(limit) = config.buffer_list {
      let limit = if limit == 0 { usize::MAX } else { limit };
      let buffers = state
        .buffers()
        .into_iter()
        .filter(|buffer| !is_removable(config, state, &buffer.file))
        .take(limit)
        .collect();
      writer.write(&Entry::new(now, EntryData::BufferList(buffers)))?;
    }

    for variable in variables.into_values() {
      writer.write(&Entry::new(
        variable.timestamp,
        EntryData::Variable(variable.value),
      ))?;
    }

    for (substitute, pattern) in [(false, search_pattern), (true, substitute_pattern)] {
      if let Some(Timed {
        timestamp,
        mut value,
      }) = pattern
      {
        value.is_substitute_pattern = substitute;
        writer.write(&Entry::new(timestamp, EntryData::SearchPattern(value)))?;
      }
    }
    if let Some(replacement) = replacement {
      writer.write(&Entry::new(
        replacement.timestamp,
        EntryData::SubString(replacement.value),
      ))?;
    }

    for jump in jumps.into_vec() {
      writer.write(&Entry::new(jump.timestamp, EntryData::Jump(jump.value)))?;
    }

    for mark in global_marks.into_vec() {
      writer.write(&Entry::new(mark.timestamp, EntryData::GlobalMark(mark.value)))?;
    }

    let line_limit = config.register_line_limit();
    for register in registers.into_vec() {
      let lines = register.value.contents.len();
      if line_limit.is_some_and(|limit| lines > limit) {
        log::debug!(
          "not writing register {:?} with {lines} lines",
          register.value.name
        );
        writer.skip();
        continue;
      }
      writer.write(&Entry::new(
        register.timestamp,
        EntryData::Register(register.value),
      ))?;
    }

    for (_, file) in files.top(config.marked_files) {
      let (marks, changes, additional) = file.into_parts();
      for mark in marks {
        writer.write(&Entry::new(mark.timestamp, EntryData::LocalMark(mark.value)))?;
      }
      for change in changes {
        writer.write(&Entry::new(change.timestamp, EntryData::Change(change.value)))?;
      }
      for mark in additional {
        writer.write(&Entry::new(mark.timestamp, EntryData::LocalMark(mark.value)))?;
      }
    }

    for ring in history {
      for item in ring.into_vec() {
        writer.write(&Entry::new(item.timestamp, EntryData::HistoryEntry(item.value)))?;
      }
    }

    for entry in &unknown {
      writer.write(entry)?;
    }
    Ok(())
  }
}
