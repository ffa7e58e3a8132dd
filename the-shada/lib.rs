//! Persistent cross-session editor state ("ShaDa" files).
//!
//! A ShaDa file is a sequence of frames, each one a msgpack payload wrapped in
//! a small length-prefixed envelope (see [`frame`]). Frames decode into
//! [`Entry`] values (see [`entry`] and [`codec`]).
//!
//! Two pipelines sit on top of the codec:
//!
//! - [`read`] restores a file into the running session through the
//!   [`LiveState`] adapter, applying only entries that are newer than what the
//!   session already has.
//! - [`write`] merges the previous file with the live session and replaces it
//!   atomically (see [`transaction`]), so that several editor processes taking
//!   turns on the same file never lose each other's newer data.

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod frame;
pub mod history;
pub mod merge;
pub mod read;
pub mod state;
pub mod transaction;
pub mod write;

use std::time::{
  SystemTime,
  UNIX_EPOCH,
};

pub use crate::{
  config::ShadaConfig,
  entry::{
    Entry,
    EntryData,
    Kind,
    Timed,
  },
  error::{
    Error,
    Result,
  },
  read::{
    ReadFlags,
    ReadReport,
    read_file,
  },
  state::{
    LiveState,
    MemoryState,
  },
  transaction::{
    WriteMode,
    write_file,
  },
  write::{
    MergeStatus,
    WriteReport,
  },
};

/// Seconds since the Unix epoch. The only recency signal stored on disk.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now() -> Timestamp {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_secs())
    .unwrap_or(0)
}
