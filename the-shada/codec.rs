//! Per-kind payload encoding and validation.
//!
//! Map-shaped payloads omit fields that hold their default value; decoding
//! fills them back in. Unknown map keys and trailing array elements are kept
//! as additional data and written back after the known fields.

use std::{
  borrow::Cow,
  fmt,
  path::{
    Path,
    PathBuf,
  },
};

use rmp::encode;
use rmpv::Value;

use crate::{
  entry::{
    AdditionalData,
    BufferEntry,
    Entry,
    EntryData,
    Header,
    HistoryItem,
    HistoryKind,
    Kind,
    Mark,
    Register,
    RegisterType,
    SearchPattern,
    SubString,
    Variable,
  },
  error::{
    Error,
    Result,
    SchemaError,
  },
  frame::Frame,
};

pub const KEY_PATTERN: &str = "sp";
pub const KEY_MAGIC: &str = "sm";
pub const KEY_SMARTCASE: &str = "sc";
pub const KEY_LINE_OFFSET: &str = "sl";
pub const KEY_PLACE_CURSOR_AT_END: &str = "se";
pub const KEY_OFFSET: &str = "so";
pub const KEY_LAST_USED: &str = "su";
pub const KEY_SUBSTITUTE_PATTERN: &str = "ss";
pub const KEY_HIGHLIGHTED: &str = "sh";
pub const KEY_SEARCH_BACKWARD: &str = "sb";

pub const KEY_CONTENTS: &str = "rc";
pub const KEY_REGISTER_TYPE: &str = "rt";
pub const KEY_WIDTH: &str = "rw";
pub const KEY_UNNAMED: &str = "ru";

pub const KEY_FILE: &str = "f";
pub const KEY_LNUM: &str = "l";
pub const KEY_COL: &str = "c";
pub const KEY_NAME: &str = "n";

const SEARCH_PATTERN_KEYS: &[&str] = &[
  KEY_PATTERN,
  KEY_MAGIC,
  KEY_SMARTCASE,
  KEY_LINE_OFFSET,
  KEY_PLACE_CURSOR_AT_END,
  KEY_OFFSET,
  KEY_LAST_USED,
  KEY_SUBSTITUTE_PATTERN,
  KEY_HIGHLIGHTED,
  KEY_SEARCH_BACKWARD,
];
const REGISTER_KEYS: &[&str] = &[
  KEY_CONTENTS,
  KEY_REGISTER_TYPE,
  KEY_WIDTH,
  KEY_UNNAMED,
  KEY_NAME,
];
const MARK_KEYS: &[&str] = &[KEY_FILE, KEY_LNUM, KEY_COL, KEY_NAME];
const POSITION_KEYS: &[&str] = &[KEY_FILE, KEY_LNUM, KEY_COL];

type SchemaResult<T> = std::result::Result<T, SchemaError>;
type EncodeResult = std::result::Result<(), String>;

/// Decodes and validates the payload of `frame`.
///
/// Frames of unknown kinds decode to [`EntryData::Unknown`] with the payload
/// untouched. Payloads that fail to parse or validate are
/// [`Error::Item`]s.
pub fn decode(frame: Frame) -> Result<Entry> {
  let Frame {
    kind: id,
    timestamp,
    payload,
    offset,
  } = frame;
  let kind = Kind::from_id(id).unwrap_or(Kind::Unknown);
  let data = match kind {
    Kind::Unknown => EntryData::Unknown { kind: id, payload },
    kind => {
      parse_payload(&payload)
        .and_then(|value| decode_value(kind, value))
        .map_err(|source| Error::Item {
          offset,
          kind,
          source,
        })?
    },
  };
  Ok(Entry::new(timestamp, data))
}

/// Encodes the payload of `entry` (without the frame envelope).
pub fn encode(entry: &Entry) -> Result<Vec<u8>> {
  if let EntryData::Unknown { payload, .. } = &entry.data {
    return Ok(payload.clone());
  }
  let mut encoder = Encoder::default();
  encoder
    .data(&entry.data)
    .map_err(|reason| Error::write_ignorable(entry.kind(), reason))?;
  Ok(encoder.buf)
}

fn parse_payload(payload: &[u8]) -> SchemaResult<Value> {
  let mut rest = payload;
  let value = rmpv::decode::read_value(&mut rest)
    .map_err(|err| SchemaError::Msgpack(err.to_string()))?;
  if !rest.is_empty() {
    return Err(SchemaError::TrailingBytes(rest.len()));
  }
  Ok(value)
}

fn decode_value(kind: Kind, value: Value) -> SchemaResult<EntryData> {
  let data = match kind {
    Kind::Header => {
      EntryData::Header(Header {
        fields: into_map(value, "header")?,
      })
    },
    Kind::SearchPattern => EntryData::SearchPattern(decode_search_pattern(value)?),
    Kind::SubString => EntryData::SubString(decode_sub_string(value)?),
    Kind::HistoryEntry => EntryData::HistoryEntry(decode_history(value)?),
    Kind::Register => EntryData::Register(decode_register(value)?),
    Kind::Variable => EntryData::Variable(decode_variable(value)?),
    Kind::GlobalMark => EntryData::GlobalMark(decode_mark(value, true)?),
    Kind::Jump => EntryData::Jump(decode_mark(value, false)?),
    Kind::BufferList => EntryData::BufferList(decode_buffer_list(value)?),
    Kind::LocalMark => EntryData::LocalMark(decode_mark(value, true)?),
    Kind::Change => EntryData::Change(decode_mark(value, false)?),
    Kind::Unknown => {
      return Err(SchemaError::WrongType {
        field:    "kind",
        expected: "a known entry kind",
      });
    },
  };
  Ok(data)
}

fn decode_search_pattern(value: Value) -> SchemaResult<SearchPattern> {
  let mut pattern = SearchPattern::default();
  let mut text = None;
  for (key, value) in into_map(value, "search pattern")? {
    match known_key(&key, SEARCH_PATTERN_KEYS) {
      Some(KEY_PATTERN) => text = Some(bytes(value, KEY_PATTERN)?),
      Some(KEY_MAGIC) => pattern.magic = boolean(&value, KEY_MAGIC)?,
      Some(KEY_SMARTCASE) => pattern.smartcase = boolean(&value, KEY_SMARTCASE)?,
      Some(KEY_LINE_OFFSET) => pattern.has_line_offset = boolean(&value, KEY_LINE_OFFSET)?,
      Some(KEY_PLACE_CURSOR_AT_END) => {
        pattern.place_cursor_at_end = boolean(&value, KEY_PLACE_CURSOR_AT_END)?
      },
      Some(KEY_OFFSET) => pattern.offset = signed(&value, KEY_OFFSET)?,
      Some(KEY_LAST_USED) => pattern.is_last_used = boolean(&value, KEY_LAST_USED)?,
      Some(KEY_SUBSTITUTE_PATTERN) => {
        pattern.is_substitute_pattern = boolean(&value, KEY_SUBSTITUTE_PATTERN)?
      },
      Some(KEY_HIGHLIGHTED) => pattern.highlighted = boolean(&value, KEY_HIGHLIGHTED)?,
      Some(KEY_SEARCH_BACKWARD) => pattern.search_backward = boolean(&value, KEY_SEARCH_BACKWARD)?,
      _ => pattern.additional.push((key, value)),
    }
  }
  pattern.pattern = text.ok_or(SchemaError::Missing(KEY_PATTERN))?;
  Ok(pattern)
}

fn decode_sub_string(value: Value) -> SchemaResult<SubString> {
  let mut elements = into_array(value, "replacement string")?.into_iter();
  let sub = bytes(
    elements
      .next()
      .ok_or(SchemaError::Missing("replacement text"))?,
    "replacement text",
  )?;
  Ok(SubString {
    sub,
    additional: elements.collect(),
  })
}

fn decode_history(value: Value) -> SchemaResult<HistoryItem> {
  let mut elements = into_array(value, "history entry")?.into_iter();
  let id = unsigned(
    &elements.next().ok_or(SchemaError::Missing("history type"))?,
    "history type",
  )?;
  let kind = HistoryKind::from_id(id).ok_or(SchemaError::HistoryKind(id))?;
  let text = bytes(
    elements.next().ok_or(SchemaError::Missing("history text"))?,
    "history text",
  )?;
  let separator = match kind {
    HistoryKind::Search => {
      elements
        .next()
        .map(|value| character(&value, "search separator"))
        .transpose()?
    },
    _ => None,
  };
  Ok(HistoryItem {
    kind,
    text,
    separator,
    additional: elements.collect(),
  })
}

fn decode_register(value: Value) -> SchemaResult<Register> {
  let mut register = Register::new(Mark::DEFAULT_NAME, Vec::new());
  let mut contents = None;
  for (key, value) in into_map(value, "register")? {
    match known_key(&key, REGISTER_KEYS) {
      Some(KEY_CONTENTS) => {
        let lines = into_array(value, KEY_CONTENTS)?
          .into_iter()
          .map(|line| bytes(line, KEY_CONTENTS))
          .collect::<SchemaResult<Vec<_>>>()?;
        contents = Some(lines);
      },
      Some(KEY_REGISTER_TYPE) => {
        let id = unsigned(&value, KEY_REGISTER_TYPE)?;
        register.kind = RegisterType::from_id(id).ok_or(SchemaError::RegisterType(id))?;
      },
      Some(KEY_WIDTH) => register.width = unsigned(&value, KEY_WIDTH)?,
      Some(KEY_UNNAMED) => register.is_unnamed = boolean(&value, KEY_UNNAMED)?,
      Some(KEY_NAME) => register.name = character(&value, KEY_NAME)?,
      _ => register.additional.push((key, value)),
    }
  }
  register.contents = contents.ok_or(SchemaError::Missing(KEY_CONTENTS))?;
  if register.contents.is_empty() {
    return Err(SchemaError::EmptyContents);
  }
  Ok(register)
}

fn decode_variable(value: Value) -> SchemaResult<Variable> {
  let mut elements = into_array(value, "variable")?.into_iter();
  let name = bytes(
    elements
      .next()
      .ok_or(SchemaError::Missing("variable name"))?,
    "variable name",
  )?;
  let value = elements
    .next()
    .ok_or(SchemaError::Missing("variable value"))?;
  Ok(Variable {
    name,
    value,
    additional: elements.collect(),
  })
}

fn decode_mark(value: Value, with_name: bool) -> SchemaResult<Mark> {
  let keys = if with_name { MARK_KEYS } else { POSITION_KEYS };
  let mut mark = Mark::new(PathBuf::new(), 1, 0);
  let mut file = None;
  for (key, value) in into_map(value, "mark")? {
    match known_key(&key, keys) {
      Some(KEY_FILE) => file = Some(bytes(value, KEY_FILE)?),
      Some(KEY_LNUM) => mark.lnum = line_number(&value)?,
      Some(KEY_COL) => mark.col = column(&value)?,
      Some(KEY_NAME) => mark.name = character(&value, KEY_NAME)?,
      _ => mark.additional.push((key, value)),
    }
  }
  mark.file = path_from_bytes(file.ok_or(SchemaError::Missing(KEY_FILE))?);
  Ok(mark)
}

fn decode_buffer_list(value: Value) -> SchemaResult<Vec<BufferEntry>> {
  into_array(value, "buffer list")?
    .into_iter()
    .map(|item| {
      let mut buffer = BufferEntry::new(PathBuf::new(), 1, 0);
      let mut file = None;
      for (key, value) in into_map(item, "buffer list item")? {
        match known_key(&key, POSITION_KEYS) {
          Some(KEY_FILE) => file = Some(bytes(value, KEY_FILE)?),
          Some(KEY_LNUM) => buffer.lnum = line_number(&value)?,
          Some(KEY_COL) => buffer.col = column(&value)?,
          _ => buffer.additional.push((key, value)),
        }
      }
      buffer.file = path_from_bytes(file.ok_or(SchemaError::Missing(KEY_FILE))?);
      Ok(buffer)
    })
    .collect()
}

/// Returns the static spelling of `key` if it is one of `known`.
fn known_key(key: &Value, known: &[&'static str]) -> Option<&'static str> {
  let name = key.as_slice()?;
  known
    .iter()
    .copied()
    .find(|candidate| candidate.as_bytes() == name)
}

fn into_map(value: Value, field: &'static str) -> SchemaResult<Vec<(Value, Value)>> {
  match value {
    Value::Map(pairs) => Ok(pairs),
    _ => {
      Err(SchemaError::WrongType {
        field,
        expected: "a map",
      })
    },
  }
}

fn into_array(value: Value, field: &'static str) -> SchemaResult<Vec<Value>> {
  match value {
    Value::Array(elements) => Ok(elements),
    _ => {
      Err(SchemaError::WrongType {
        field,
        expected: "an array",
      })
    },
  }
}

fn bytes(value: Value, field: &'static str) -> SchemaResult<Vec<u8>> {
  match value {
    Value::String(text) => Ok(text.into_bytes()),
    Value::Binary(bytes) => Ok(bytes),
    _ => {
      Err(SchemaError::WrongType {
        field,
        expected: "a string",
      })
    },
  }
}

fn boolean(value: &Value, field: &'static str) -> SchemaResult<bool> {
  value.as_bool().ok_or(SchemaError::WrongType {
    field,
    expected: "a boolean",
  })
}

fn unsigned(value: &Value, field: &'static str) -> SchemaResult<u64> {
  value.as_u64().ok_or(SchemaError::WrongType {
    field,
    expected: "a non-negative integer",
  })
}

fn signed(value: &Value, field: &'static str) -> SchemaResult<i64> {
  value.as_i64().ok_or(SchemaError::WrongType {
    field,
    expected: "an integer",
  })
}

fn line_number(value: &Value) -> SchemaResult<u64> {
  match (value.as_u64(), value.as_i64()) {
    (Some(0), _) => Err(SchemaError::LineNumber(0)),
    (Some(lnum), _) => Ok(lnum),
    (None, Some(lnum)) => Err(SchemaError::LineNumber(lnum)),
    (None, None) => {
      Err(SchemaError::WrongType {
        field:    KEY_LNUM,
        expected: "an integer",
      })
    },
  }
}

fn column(value: &Value) -> SchemaResult<u64> {
  match (value.as_u64(), value.as_i64()) {
    (Some(col), _) => Ok(col),
    (None, Some(col)) => Err(SchemaError::Column(col)),
    (None, None) => {
      Err(SchemaError::WrongType {
        field:    KEY_COL,
        expected: "an integer",
      })
    },
  }
}

fn character(value: &Value, field: &'static str) -> SchemaResult<char> {
  let code = unsigned(value, field)?;
  u32::try_from(code)
    .ok()
    .and_then(char::from_u32)
    .ok_or(SchemaError::InvalidChar { field, value: code })
}

#[cfg(unix)]
pub(crate) fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
  use std::{
    ffi::OsString,
    os::unix::ffi::OsStringExt,
  };
  PathBuf::from(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
pub(crate) fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
  PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(unix)]
pub(crate) fn path_to_bytes(path: &Path) -> Cow<'_, [u8]> {
  use std::os::unix::ffi::OsStrExt;
  Cow::Borrowed(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
pub(crate) fn path_to_bytes(path: &Path) -> Cow<'_, [u8]> {
  match path.to_string_lossy() {
    Cow::Borrowed(text) => Cow::Borrowed(text.as_bytes()),
    Cow::Owned(text) => Cow::Owned(text.into_bytes()),
  }
}

fn describe(err: impl fmt::Display) -> String {
  err.to_string()
}

fn length(len: usize) -> std::result::Result<u32, String> {
  u32::try_from(len).map_err(|_| format!("length {len} does not fit in a msgpack container"))
}

#[derive(Default)]
struct Encoder {
  buf: Vec<u8>,
}

impl Encoder {
  fn data(&mut self, data: &EntryData) -> EncodeResult {
    match data {
      EntryData::Header(header) => self.header(header),
      EntryData::SearchPattern(pattern) => self.search_pattern(pattern),
      EntryData::SubString(sub) => self.sub_string(sub),
      EntryData::HistoryEntry(item) => self.history(item),
      EntryData::Register(register) => self.register(register),
      EntryData::Variable(variable) => self.variable(variable),
      EntryData::GlobalMark(mark) | EntryData::LocalMark(mark) => self.mark(mark, true),
      EntryData::Jump(mark) | EntryData::Change(mark) => self.mark(mark, false),
      EntryData::BufferList(buffers) => self.buffer_list(buffers),
      EntryData::Unknown { payload, .. } => {
        self.buf.extend_from_slice(payload);
        Ok(())
      },
    }
  }

  fn header(&mut self, header: &Header) -> EncodeResult {
    self.map_len(header.fields.len())?;
    self.additional(&header.fields)
  }

  fn search_pattern(&mut self, pattern: &SearchPattern) -> EncodeResult {
    let defaults = SearchPattern::default();
    let flags: Vec<_> = [
      (KEY_MAGIC, pattern.magic, defaults.magic),
      (KEY_SMARTCASE, pattern.smartcase, defaults.smartcase),
      (KEY_LINE_OFFSET, pattern.has_line_offset, defaults.has_line_offset),
      (
        KEY_PLACE_CURSOR_AT_END,
        pattern.place_cursor_at_end,
        defaults.place_cursor_at_end,
      ),
      (KEY_LAST_USED, pattern.is_last_used, defaults.is_last_used),
      (
        KEY_SUBSTITUTE_PATTERN,
        pattern.is_substitute_pattern,
        defaults.is_substitute_pattern,
      ),
      (KEY_HIGHLIGHTED, pattern.highlighted, defaults.highlighted),
      (KEY_SEARCH_BACKWARD, pattern.search_backward, defaults.search_backward),
    ]
    .into_iter()
    .filter(|(_, value, default)| value != default)
    .collect();
    let has_offset = pattern.offset != defaults.offset;

    self.map_len(1 + flags.len() + usize::from(has_offset) + pattern.additional.len())?;
    self.key(KEY_PATTERN)?;
    self.bytes(&pattern.pattern)?;
    for (key, value, _) in flags {
      self.key(key)?;
      self.boolean(value)?;
    }
    if has_offset {
      self.key(KEY_OFFSET)?;
      self.sint(pattern.offset)?;
    }
    self.additional(&pattern.additional)
  }

  fn sub_string(&mut self, sub: &SubString) -> EncodeResult {
    self.array_len(1 + sub.additional.len())?;
    self.bytes(&sub.sub)?;
    self.values(&sub.additional)
  }

  fn history(&mut self, item: &HistoryItem) -> EncodeResult {
    let separator = item
      .separator
      .filter(|_| item.kind == HistoryKind::Search);
    self.array_len(2 + usize::from(separator.is_some()) + item.additional.len())?;
    self.uint(item.kind.id())?;
    self.bytes(&item.text)?;
    if let Some(separator) = separator {
      self.uint(u64::from(separator))?;
    }
    self.values(&item.additional)
  }

  fn register(&mut self, register: &Register) -> EncodeResult {
    let has_type = register.kind != RegisterType::default();
    let has_width = register.width != 0;
    self.map_len(
      2 + usize::from(has_type)
        + usize::from(has_width)
        + usize::from(register.is_unnamed)
        + register.additional.len(),
    )?;
    self.key(KEY_CONTENTS)?;
    self.array_len(register.contents.len())?;
    for line in &register.contents {
      self.bytes(line)?;
    }
    if has_type {
      self.key(KEY_REGISTER_TYPE)?;
      self.uint(register.kind.id())?;
    }
    if has_width {
      self.key(KEY_WIDTH)?;
      self.uint(register.width)?;
    }
    if register.is_unnamed {
      self.key(KEY_UNNAMED)?;
      self.boolean(true)?;
    }
    self.key(KEY_NAME)?;
    self.uint(u64::from(register.name))?;
    self.additional(&register.additional)
  }

  fn variable(&mut self, variable: &Variable) -> EncodeResult {
    self.array_len(2 + variable.additional.len())?;
    self.bytes(&variable.name)?;
    self.value(&variable.value)?;
    self.values(&variable.additional)
  }

  fn mark(&mut self, mark: &Mark, with_name: bool) -> EncodeResult {
    let has_name = with_name && mark.name != Mark::DEFAULT_NAME;
    self.position(&mark.file, mark.lnum, mark.col, has_name, &mark.additional)?;
    if has_name {
      self.key(KEY_NAME)?;
      self.uint(u64::from(mark.name))?;
    }
    self.additional(&mark.additional)
  }

  fn buffer_list(&mut self, buffers: &[BufferEntry]) -> EncodeResult {
    self.array_len(buffers.len())?;
    for buffer in buffers {
      self.position(
        &buffer.file,
        buffer.lnum,
        buffer.col,
        false,
        &buffer.additional,
      )?;
      self.additional(&buffer.additional)?;
    }
    Ok(())
  }

  /// Writes the map header and the `f`/`l`/`c` fields of a position.
  fn position(
    &mut self,
    file: &Path,
    lnum: u64,
    col: u64,
    has_name: bool,
    additional: &AdditionalData,
  ) -> EncodeResult {
    if lnum == 0 {
      return Err(format!("line number 0 in {}", file.display()));
    }
    let has_lnum = lnum != 1;
    let has_col = col != 0;
    self.map_len(
      1 + usize::from(has_lnum) + usize::from(has_col) + usize::from(has_name) + additional.len(),
    )?;
    self.key(KEY_FILE)?;
    self.bytes(&path_to_bytes(file))?;
    if has_lnum {
      self.key(KEY_LNUM)?;
      self.uint(lnum)?;
    }
    if has_col {
      self.key(KEY_COL)?;
      self.uint(col)?;
    }
    Ok(())
  }

  fn additional(&mut self, pairs: &[(Value, Value)]) -> EncodeResult {
    for (key, value) in pairs {
      self.value(key)?;
      self.value(value)?;
    }
    Ok(())
  }

  fn values(&mut self, values: &[Value]) -> EncodeResult {
    values.iter().try_for_each(|value| self.value(value))
  }

  fn map_len(&mut self, len: usize) -> EncodeResult {
    encode::write_map_len(&mut self.buf, length(len)?)
      .map(drop)
      .map_err(describe)
  }

  fn array_len(&mut self, len: usize) -> EncodeResult {
    encode::write_array_len(&mut self.buf, length(len)?)
      .map(drop)
      .map_err(describe)
  }

  fn key(&mut self, key: &str) -> EncodeResult {
    encode::write_str(&mut self.buf, key).map_err(describe)
  }

  /// Strings are written as msgpack `str` holding the raw bytes.
  fn bytes(&mut self, bytes: &[u8]) -> EncodeResult {
    encode::write_str_len(&mut self.buf, length(bytes.len())?).map_err(describe)?;
    self.buf.extend_from_slice(bytes);
    Ok(())
  }

  fn uint(&mut self, value: u64) -> EncodeResult {
    encode::write_uint(&mut self.buf, value)
      .map(drop)
      .map_err(describe)
  }

  fn sint(&mut self, value: i64) -> EncodeResult {
    encode::write_sint(&mut self.buf, value)
      .map(drop)
      .map_err(describe)
  }

  fn boolean(&mut self, value: bool) -> EncodeResult {
    encode::write_bool(&mut self.buf, value).map_err(describe)
  }

  fn value(&mut self, value: &Value) -> EncodeResult {
    rmpv::encode::write_value(&mut self.buf, value).map_err(describe)
  }
}
