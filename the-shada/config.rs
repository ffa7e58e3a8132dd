//! Limits and switches controlling what is persisted.

use std::path::{
  Path,
  PathBuf,
};

use etcetera::base_strategy::{
  BaseStrategy,
  choose_base_strategy,
};
use serde::Deserialize;

use crate::{
  codec::path_to_bytes,
  entry::HistoryKind,
  error::{
    Error,
    Result,
  },
};

/// Overrides the directory holding the default ShaDa file.
pub const STATE_DIR_ENV: &str = "THE_SHADA_STATE_DIR";

/// Persistence settings, passed explicitly to every read and write.
///
/// The defaults mirror an editor that keeps 100 marked files, registers of at
/// most 50 lines, entries up to 10 KiB and 100 items of every history kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ShadaConfig {
  /// Explicit file location; see [`default_shada_file`] otherwise.
  pub path:           Option<PathBuf>,
  /// Entries with larger payloads are not written. `0` means unlimited.
  pub max_kbyte:      u64,
  /// Registers with more lines are not written. `0` means unlimited.
  pub register_lines: usize,
  /// Number of files whose local marks and changes are kept.
  pub marked_files:   usize,
  /// `None` disables the buffer list, `Some(0)` keeps every buffer.
  pub buffer_list:    Option<usize>,
  pub variables:      bool,
  pub global_marks:   bool,
  pub history:        HistoryLimits,
  pub jumps:          usize,
  /// Changes kept per file.
  pub changes:        usize,
  /// Path prefixes that are never persisted.
  pub removable:      Vec<PathBuf>,
}

impl Default for ShadaConfig {
  fn default() -> Self {
    Self {
      path:           None,
      max_kbyte:      10,
      register_lines: 50,
      marked_files:   100,
      buffer_list:    None,
      variables:      true,
      global_marks:   true,
      history:        HistoryLimits::uniform(100),
      jumps:          100,
      changes:        100,
      removable:      Vec::new(),
    }
  }
}

/// Capacity of each history ring. `0` disables that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryLimits {
  pub command:    usize,
  pub search:     usize,
  pub expression: usize,
  pub input:      usize,
  pub debug:      usize,
}

impl Default for HistoryLimits {
  fn default() -> Self {
    Self::uniform(100)
  }
}

impl HistoryLimits {
  pub fn uniform(limit: usize) -> Self {
    Self {
      command:    limit,
      search:     limit,
      expression: limit,
      input:      limit,
      debug:      limit,
    }
  }

  pub fn get(&self, kind: HistoryKind) -> usize {
    match kind {
      HistoryKind::Command => self.command,
      HistoryKind::Search => self.search,
      HistoryKind::Expression => self.expression,
      HistoryKind::Input => self.input,
      HistoryKind::Debug => self.debug,
    }
  }
}

impl ShadaConfig {
  /// Parses a TOML document. Settings may live at the top level or in a
  /// `[shada]` table; `origin` is only used in error messages.
  pub fn from_toml(text: &str, origin: &Path) -> Result<Self> {
    let invalid = |source| {
      Error::Config {
        path: origin.to_path_buf(),
        source,
      }
    };
    let mut table: toml::Table = toml::from_str(text).map_err(invalid)?;
    let settings = match table.remove("shada") {
      Some(toml::Value::Table(shada)) => shada,
      Some(other) => {
        table.insert("shada".to_owned(), other);
        table
      },
      None => table,
    };
    settings.try_into().map_err(invalid)
  }

  pub fn load(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path).map_err(|err| {
      Error::system(format!("failed to read config {}", path.display()), err)
    })?;
    let config = Self::from_toml(&text, path)?;
    log::debug!("loaded ShaDa config from {}", path.display());
    Ok(config)
  }

  /// Loads `path`, or the default config file when it exists, or defaults.
  pub fn discover(path: Option<&Path>) -> Result<Self> {
    if let Some(path) = path {
      return Self::load(path);
    }
    match default_config_file() {
      Some(path) if path.is_file() => Self::load(&path),
      _ => Ok(Self::default()),
    }
  }

  /// The file to read and write: the configured path or the default one.
  pub fn file(&self) -> Option<PathBuf> {
    self.path.clone().or_else(default_shada_file)
  }

  /// Whether `path` starts with one of the removable prefixes.
  pub fn is_removable(&self, path: &Path) -> bool {
    let path = path_to_bytes(path);
    self
      .removable
      .iter()
      .any(|prefix| path.starts_with(&path_to_bytes(prefix)))
  }

  /// Byte limit derived from `max_kbyte`, `None` when unlimited.
  pub fn max_payload_bytes(&self) -> Option<u64> {
    (self.max_kbyte != 0).then(|| self.max_kbyte.saturating_mul(1024))
  }

  pub fn register_line_limit(&self) -> Option<usize> {
    (self.register_lines != 0).then_some(self.register_lines)
  }
}

/// `<config dir>/the-shada/config.toml`.
pub fn default_config_file() -> Option<PathBuf> {
  let strategy = choose_base_strategy().ok()?;
  Some(strategy.config_dir().join("the-shada").join("config.toml"))
}

/// `<state dir>/the-shada/main.shada`, where the state directory follows the
/// platform conventions unless [`STATE_DIR_ENV`] is set.
pub fn default_shada_file() -> Option<PathBuf> {
  let dir = match std::env::var_os(STATE_DIR_ENV) {
    Some(dir) => PathBuf::from(dir),
    None => {
      let strategy = choose_base_strategy().ok()?;
      let mut dir = strategy
        .state_dir()
        .unwrap_or_else(|| strategy.data_dir());
      dir.push("the-shada");
      dir
    },
  };
  Some(dir.join("main.shada"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_document_gives_defaults() {
    let config = ShadaConfig::from_toml("", Path::new("test.toml")).unwrap();
    assert_eq!(config, ShadaConfig::default());
    assert_eq!(config.max_payload_bytes(), Some(10 * 1024));
    assert_eq!(config.register_line_limit(), Some(50));
  }

  #[test]
  fn reads_top_level_settings() {
    let text = r#"
      max-kbyte = 0
      register-lines = 0
      buffer-list = 5
      removable = ["/tmp", "/media"]

      [history]
      search = 2
    "#;
    let config = ShadaConfig::from_toml(text, Path::new("test.toml")).unwrap();
    assert_eq!(config.max_payload_bytes(), None);
    assert_eq!(config.register_line_limit(), None);
    assert_eq!(config.buffer_list, Some(5));
    assert_eq!(config.history.get(HistoryKind::Search), 2);
    assert_eq!(config.history.get(HistoryKind::Command), 100);
  }

  #[test]
  fn reads_a_shada_table() {
    let text = r#"
      [shada]
      path = "/var/lib/editor/main.shada"
      marked-files = 3
    "#;
    let config = ShadaConfig::from_toml(text, Path::new("test.toml")).unwrap();
    assert_eq!(config.marked_files, 3);
    assert_eq!(
      config.file(),
      Some(PathBuf::from("/var/lib/editor/main.shada"))
    );
  }

  #[test]
  fn unknown_keys_are_rejected() {
    let err = ShadaConfig::from_toml("max-kb = 3", Path::new("bad.toml")).unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
    assert!(err.to_string().contains("bad.toml"));
  }

  #[test]
  fn removable_is_a_prefix_match() {
    let config = ShadaConfig {
      removable: vec![PathBuf::from("/tmp")],
      ..ShadaConfig::default()
    };
    assert!(config.is_removable(Path::new("/tmp/a.txt")));
    assert!(config.is_removable(Path::new("/tmpfs/b")));
    assert!(!config.is_removable(Path::new("/home/tmp")));
  }
}
