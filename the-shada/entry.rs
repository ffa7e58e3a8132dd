//! In-memory model of ShaDa entries.
//!
//! Every payload type keeps the fields it did not understand ("additional
//! data") so that files written by newer editors survive a round trip through
//! an older one.

use std::{
  fmt,
  path::PathBuf,
};

use rmpv::Value;

use crate::Timestamp;

/// Unrecognized map keys of a map-shaped payload, in file order.
pub type AdditionalData = Vec<(Value, Value)>;

/// Unrecognized trailing elements of an array-shaped payload.
pub type AdditionalElements = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
  Header,
  SearchPattern,
  SubString,
  HistoryEntry,
  Register,
  Variable,
  GlobalMark,
  Jump,
  BufferList,
  LocalMark,
  Change,
  Unknown,
}

impl Kind {
  /// Highest kind id this crate knows how to decode.
  pub const MAX_KNOWN_ID: u64 = 11;

  /// Maps an on-disk kind id to a kind. Id `0` is reserved and never valid.
  pub fn from_id(id: u64) -> Option<Self> {
    let kind = match id {
      0 => return None,
      1 => Self::Header,
      2 => Self::SearchPattern,
      3 => Self::SubString,
      4 => Self::HistoryEntry,
      5 => Self::Register,
      6 => Self::Variable,
      7 => Self::GlobalMark,
      8 => Self::Jump,
      9 => Self::BufferList,
      10 => Self::LocalMark,
      11 => Self::Change,
      _ => Self::Unknown,
    };
    Some(kind)
  }

  /// On-disk id, `None` for [`Kind::Unknown`] whose id lives in the entry.
  pub fn id(self) -> Option<u64> {
    let id = match self {
      Self::Header => 1,
      Self::SearchPattern => 2,
      Self::SubString => 3,
      Self::HistoryEntry => 4,
      Self::Register => 5,
      Self::Variable => 6,
      Self::GlobalMark => 7,
      Self::Jump => 8,
      Self::BufferList => 9,
      Self::LocalMark => 10,
      Self::Change => 11,
      Self::Unknown => return None,
    };
    Some(id)
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::Header => "header",
      Self::SearchPattern => "search pattern",
      Self::SubString => "replacement string",
      Self::HistoryEntry => "history",
      Self::Register => "register",
      Self::Variable => "variable",
      Self::GlobalMark => "global mark",
      Self::Jump => "jump",
      Self::BufferList => "buffer list",
      Self::LocalMark => "local mark",
      Self::Change => "change",
      Self::Unknown => "unknown",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// A value paired with the time it was last set.
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
  pub timestamp: Timestamp,
  pub value:     T,
}

impl<T> Timed<T> {
  pub fn new(timestamp: Timestamp, value: T) -> Self {
    Self { timestamp, value }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timed<U> {
    Timed {
      timestamp: self.timestamp,
      value:     f(self.value),
    }
  }
}

/// Free-form description of the writer of a file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
  pub fields: Vec<(Value, Value)>,
}

impl Header {
  pub fn new(max_kbyte: u64) -> Self {
    let fields = vec![
      (Value::from("generator"), Value::from("the-shada")),
      (Value::from("version"), Value::from(env!("CARGO_PKG_VERSION"))),
      (Value::from("max_kbyte"), Value::from(max_kbyte)),
      (Value::from("pid"), Value::from(u64::from(std::process::id()))),
      (Value::from("encoding"), Value::from("utf-8")),
    ];
    Self { fields }
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self
      .fields
      .iter()
      .find(|(name, _)| name.as_str() == Some(key))
      .map(|(_, value)| value)
  }
}

/// Last used search (or substitute) pattern and its flags.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPattern {
  pub pattern:               Vec<u8>,
  pub magic:                 bool,
  pub smartcase:             bool,
  pub has_line_offset:       bool,
  pub place_cursor_at_end:   bool,
  pub offset:                i64,
  pub is_last_used:          bool,
  pub is_substitute_pattern: bool,
  pub highlighted:           bool,
  pub search_backward:       bool,
  pub additional:            AdditionalData,
}

impl Default for SearchPattern {
  fn default() -> Self {
    Self {
      pattern:               Vec::new(),
      magic:                 true,
      smartcase:             false,
      has_line_offset:       false,
      place_cursor_at_end:   false,
      offset:                0,
      is_last_used:          true,
      is_substitute_pattern: false,
      highlighted:           false,
      search_backward:       false,
      additional:            Vec::new(),
    }
  }
}

impl SearchPattern {
  pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
    Self {
      pattern: pattern.into(),
      ..Self::default()
    }
  }
}

/// Last substitute replacement string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubString {
  pub sub:        Vec<u8>,
  pub additional: AdditionalElements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistoryKind {
  Command,
  Search,
  Expression,
  Input,
  Debug,
}

impl HistoryKind {
  pub const COUNT: usize = 5;
  pub const ALL: [Self; Self::COUNT] = [
    Self::Command,
    Self::Search,
    Self::Expression,
    Self::Input,
    Self::Debug,
  ];

  pub fn from_id(id: u64) -> Option<Self> {
    Self::ALL.get(usize::try_from(id).ok()?).copied()
  }

  pub fn id(self) -> u64 {
    self as u64
  }

  pub fn index(self) -> usize {
    self as usize
  }
}

impl fmt::Display for HistoryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Command => "command",
      Self::Search => "search",
      Self::Expression => "expression",
      Self::Input => "input",
      Self::Debug => "debug",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
  pub kind:       HistoryKind,
  pub text:       Vec<u8>,
  /// Search direction character, only meaningful for search history.
  pub separator:  Option<char>,
  pub additional: AdditionalElements,
}

impl HistoryItem {
  pub fn new(kind: HistoryKind, text: impl Into<Vec<u8>>) -> Self {
    Self {
      kind,
      text: text.into(),
      separator: (kind == HistoryKind::Search).then_some('/'),
      additional: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RegisterType {
  #[default]
  CharWise,
  LineWise,
  BlockWise,
}

impl RegisterType {
  pub fn from_id(id: u64) -> Option<Self> {
    match id {
      0 => Some(Self::CharWise),
      1 => Some(Self::LineWise),
      2 => Some(Self::BlockWise),
      _ => None,
    }
  }

  pub fn id(self) -> u64 {
    self as u64
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Register {
  pub name:       char,
  pub contents:   Vec<Vec<u8>>,
  pub kind:       RegisterType,
  /// Block width, only meaningful for blockwise registers.
  pub width:      u64,
  pub is_unnamed: bool,
  pub additional: AdditionalData,
}

impl Register {
  pub fn new(name: char, contents: Vec<Vec<u8>>) -> Self {
    Self {
      name,
      contents,
      kind: RegisterType::CharWise,
      width: 0,
      is_unnamed: false,
      additional: Vec::new(),
    }
  }
}

/// A global scripting variable with an opaque value.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
  pub name:       Vec<u8>,
  pub value:      Value,
  pub additional: AdditionalElements,
}

/// A file position. Used for global marks, jumps, local marks and changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
  pub file:       PathBuf,
  /// 1-based line number.
  pub lnum:       u64,
  /// 0-based byte column.
  pub col:        u64,
  /// Only stored for global and local marks.
  pub name:       char,
  pub additional: AdditionalData,
}

impl Mark {
  pub const DEFAULT_NAME: char = '"';

  pub fn new(file: impl Into<PathBuf>, lnum: u64, col: u64) -> Self {
    Self {
      file: file.into(),
      lnum,
      col,
      name: Self::DEFAULT_NAME,
      additional: Vec::new(),
    }
  }

  pub fn named(name: char, file: impl Into<PathBuf>, lnum: u64, col: u64) -> Self {
    Self {
      name,
      ..Self::new(file, lnum, col)
    }
  }
}

/// One open file and its last cursor position.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
  pub file:       PathBuf,
  pub lnum:       u64,
  pub col:        u64,
  pub additional: AdditionalData,
}

impl BufferEntry {
  pub fn new(file: impl Into<PathBuf>, lnum: u64, col: u64) -> Self {
    Self {
      file: file.into(),
      lnum,
      col,
      additional: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryData {
  Header(Header),
  SearchPattern(SearchPattern),
  SubString(SubString),
  HistoryEntry(HistoryItem),
  Register(Register),
  Variable(Variable),
  GlobalMark(Mark),
  Jump(Mark),
  BufferList(Vec<BufferEntry>),
  LocalMark(Mark),
  Change(Mark),
  /// A kind this crate does not understand, kept byte for byte.
  Unknown { kind: u64, payload: Vec<u8> },
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
  pub timestamp: Timestamp,
  pub data:      EntryData,
}

impl Entry {
  pub fn new(timestamp: Timestamp, data: EntryData) -> Self {
    Self { timestamp, data }
  }

  pub fn kind(&self) -> Kind {
    match &self.data {
      EntryData::Header(_) => Kind::Header,
      EntryData::SearchPattern(_) => Kind::SearchPattern,
      EntryData::SubString(_) => Kind::SubString,
      EntryData::HistoryEntry(_) => Kind::HistoryEntry,
      EntryData::Register(_) => Kind::Register,
      EntryData::Variable(_) => Kind::Variable,
      EntryData::GlobalMark(_) => Kind::GlobalMark,
      EntryData::Jump(_) => Kind::Jump,
      EntryData::BufferList(_) => Kind::BufferList,
      EntryData::LocalMark(_) => Kind::LocalMark,
      EntryData::Change(_) => Kind::Change,
      EntryData::Unknown { .. } => Kind::Unknown,
    }
  }

  /// Kind id as written to disk.
  pub fn kind_id(&self) -> u64 {
    match &self.data {
      EntryData::Unknown { kind, .. } => *kind,
      _ => self.kind().id().unwrap_or_default(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_ids_round_trip() {
    for id in 1..=Kind::MAX_KNOWN_ID {
      let kind = Kind::from_id(id).unwrap();
      assert_eq!(kind.id(), Some(id));
    }
    assert_eq!(Kind::from_id(0), None);
    assert_eq!(Kind::from_id(12), Some(Kind::Unknown));
    assert_eq!(Kind::from_id(u64::MAX), Some(Kind::Unknown));
  }

  #[test]
  fn unknown_entries_keep_their_id() {
    let entry = Entry::new(7, EntryData::Unknown {
      kind:    42,
      payload: vec![0xc0],
    });
    assert_eq!(entry.kind(), Kind::Unknown);
    assert_eq!(entry.kind_id(), 42);
  }

  #[test]
  fn history_kinds_map_to_ids() {
    assert_eq!(HistoryKind::from_id(1), Some(HistoryKind::Search));
    assert_eq!(HistoryKind::from_id(5), None);
    assert_eq!(HistoryKind::Debug.id(), 4);
    assert_eq!(HistoryItem::new(HistoryKind::Search, "x").separator, Some('/'));
    assert_eq!(HistoryItem::new(HistoryKind::Command, "x").separator, None);
  }

  #[test]
  fn header_describes_writer() {
    let header = Header::new(10);
    assert_eq!(
      header.get("generator").and_then(Value::as_str),
      Some("the-shada")
    );
    assert_eq!(header.get("max_kbyte").and_then(Value::as_u64), Some(10));
    assert!(header.get("missing").is_none());
  }
}
