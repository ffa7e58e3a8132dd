use std::{
  io,
  path::PathBuf,
};

use thiserror::Error;

use crate::entry::Kind;

/// Result type for ShaDa operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while reading or writing ShaDa files.
///
/// `Item` and `WriteIgnorable` only ever concern a single entry: pipelines
/// log them, skip the entry and keep going. Everything else ends the
/// operation (see [`Error::is_fatal`]).
#[derive(Debug, Error)]
pub enum Error {
  /// The byte stream itself is broken; nothing after `offset` can be trusted.
  #[error("malformed ShaDa data at byte {offset}: {reason}")]
  Format { offset: u64, reason: String },

  /// One entry could not be decoded or failed validation.
  #[error("invalid {kind} entry at byte {offset}: {source}")]
  Item {
    offset: u64,
    kind:   Kind,
    #[source]
    source: SchemaError,
  },

  /// One entry could not be encoded while writing.
  #[error("cannot encode {kind} entry: {reason}")]
  WriteIgnorable { kind: Kind, reason: String },

  #[error("{context}: {source}")]
  System {
    context: String,
    #[source]
    source:  io::Error,
  },

  /// No temporary file could be allocated next to the target.
  #[error("cannot write {}: {reason}", path.display())]
  CannotWrite { path: PathBuf, reason: String },

  /// The merged file was written but could not replace the target.
  #[error(
    "failed to rename {} to {}: {source}; the merged data is kept in {}",
    temp.display(),
    target.display(),
    temp.display()
  )]
  Rename {
    temp:   PathBuf,
    target: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{} does not exist", .0.display())]
  Missing(PathBuf),

  #[error("invalid configuration in {}: {source}", path.display())]
  Config {
    path:   PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

impl Error {
  pub fn system(context: impl Into<String>, source: io::Error) -> Self {
    Self::System {
      context: context.into(),
      source,
    }
  }

  pub(crate) fn format(offset: u64, reason: impl Into<String>) -> Self {
    Self::Format {
      offset,
      reason: reason.into(),
    }
  }

  pub(crate) fn write_ignorable(kind: Kind, reason: impl ToString) -> Self {
    Self::WriteIgnorable {
      kind,
      reason: reason.to_string(),
    }
  }

  /// Whether the error ends the current read or write.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, Self::Item { .. } | Self::WriteIgnorable { .. })
  }
}

/// Why a single entry payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
  #[error("payload is not valid msgpack: {0}")]
  Msgpack(String),
  #[error("{0} trailing bytes after the payload value")]
  TrailingBytes(usize),
  #[error("{field} must be {expected}")]
  WrongType {
    field:    &'static str,
    expected: &'static str,
  },
  #[error("missing mandatory field {0}")]
  Missing(&'static str),
  #[error("line number must be positive, got {0}")]
  LineNumber(i64),
  #[error("column must not be negative, got {0}")]
  Column(i64),
  #[error("register contents must not be empty")]
  EmptyContents,
  #[error("{field} is not a valid character: {value}")]
  InvalidChar { field: &'static str, value: u64 },
  #[error("unknown history type {0}")]
  HistoryKind(u64),
  #[error("unknown register type {0}")]
  RegisterType(u64),
}
