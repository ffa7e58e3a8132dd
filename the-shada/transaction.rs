//! Replacing the ShaDa file on disk.
//!
//! Merging writes go to a sibling temporary file that is renamed over the
//! target once complete, so a failed write never damages the previous file.
//! Overwriting writes truncate the target in place.

use std::{
  ffi::OsString,
  fs::{
    self,
    File,
    Metadata,
    OpenOptions,
  },
  io::{
    self,
    BufReader,
    BufWriter,
    Write,
  },
  path::{
    Path,
    PathBuf,
  },
};

use crate::{
  config::ShadaConfig,
  error::{
    Error,
    Result,
  },
  read,
  state::LiveState,
  write::{
    MergeStatus,
    WriteReport,
    write_to,
  },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
  /// Merge with the previous file and replace it atomically.
  #[default]
  Merge,
  /// Ignore the previous file and truncate it.
  Overwrite,
}

/// Writes the session in `state` to `path`.
pub fn write_file<S: LiveState + ?Sized>(
  path: &Path,
  config: &ShadaConfig,
  state: &S,
  mode: WriteMode,
) -> Result<WriteReport> {
  let report = match mode {
    WriteMode::Overwrite => {
      let mut report = write_direct(path, config, state)?;
      report.merge = MergeStatus::Overwritten;
      report
    },
    WriteMode::Merge => {
      match read::open(path)? {
        Some(previous) => write_merged(path, previous, config, state)?,
        None => write_direct(path, config, state)?,
      }
    },
  };

  match &report.merge {
    MergeStatus::Recovered { error, entries } => {
      log::warn!(
        "wrote {} over a damaged file, {entries} entries recovered: {error}",
        path.display()
      );
    },
    status => log::info!("wrote {} ({status:?}): {} entries", path.display(), report.written),
  }
  Ok(report)
}

/// Creates or truncates `path` and writes the session without merging.
fn write_direct<S: LiveState + ?Sized>(
  path: &Path,
  config: &ShadaConfig,
  state: &S,
) -> Result<WriteReport> {
  if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
    fs::create_dir_all(parent).map_err(|err| {
      Error::system(format!("failed to create {}", parent.display()), err)
    })?;
  }

  let mut options = OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
  }
  let file = options
    .open(path)
    .map_err(|err| Error::system(format!("failed to open {}", path.display()), err))?;

  let mut out = BufWriter::new(file);
  let report = write_to(&mut out, None::<io::Empty>, config, state)?;
  out
    .flush()
    .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))?;
  Ok(report)
}

fn write_merged<S: LiveState + ?Sized>(
  path: &Path,
  previous: BufReader<File>,
  config: &ShadaConfig,
  state: &S,
) -> Result<WriteReport> {
  let original = previous
    .get_ref()
    .metadata()
    .map_err(|err| Error::system(format!("failed to stat {}", path.display()), err))?;
  let (temp, file) = create_temp(path, &original)?;

  let report = match fill(&temp, &file, previous, config, state) {
    Ok(report) => report,
    Err(err) => {
      drop(file);
      if let Err(remove) = fs::remove_file(&temp) {
        log::warn!("failed to remove {}: {remove}", temp.display());
      }
      return Err(err);
    },
  };
  drop(file);

  if let Err(source) = fs::rename(&temp, path) {
    let err = Error::Rename {
      temp,
      target: path.to_path_buf(),
      source,
    };
    log::error!("{err}");
    return Err(err);
  }
  sync_parent(path);
  Ok(report)
}

fn fill<S: LiveState + ?Sized>(
  temp: &Path,
  file: &File,
  previous: BufReader<File>,
  config: &ShadaConfig,
  state: &S,
) -> Result<WriteReport> {
  let failed = |err| Error::system(format!("failed to write {}", temp.display()), err);
  let mut out = BufWriter::new(file);
  let report = write_to(&mut out, Some(previous), config, state)?;
  out.flush().map_err(failed)?;
  file.sync_all().map_err(failed)?;
  Ok(report)
}

/// Creates the first free `<path>.tmp.a` .. `<path>.tmp.z`.
fn create_temp(path: &Path, original: &Metadata) -> Result<(PathBuf, File)> {
  for letter in 'a'..='z' {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".tmp.{letter}"));
    let candidate = PathBuf::from(name);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
      use std::os::unix::fs::OpenOptionsExt;
      options.mode(temp_mode(original));
    }

    match options.open(&candidate) {
      Ok(file) => {
        if let Err(err) = preserve_metadata(&file, &candidate, original) {
          drop(file);
          if let Err(remove) = fs::remove_file(&candidate) {
            log::warn!("failed to remove {}: {remove}", candidate.display());
          }
          return Err(err);
        }
        return Ok((candidate, file));
      },
      Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
        log::debug!("{} already exists", candidate.display());
      },
      Err(err) => {
        return Err(Error::system(
          format!("failed to create {}", candidate.display()),
          err,
        ));
      },
    }
  }

  Err(Error::CannotWrite {
    path:   path.to_path_buf(),
    reason: "temporary files .tmp.a through .tmp.z all exist; remove them and retry".to_owned(),
  })
}

/// Mode of the original without execute or set-id bits, readable and
/// writable by the owner.
#[cfg(unix)]
fn temp_mode(original: &Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  (original.permissions().mode() & 0o666) | 0o600
}

/// Gives the temporary file the mode of the original regardless of the umask,
/// and its owner when running as root.
#[cfg(unix)]
fn preserve_metadata(file: &File, temp: &Path, original: &Metadata) -> Result<()> {
  use std::os::unix::fs::{
    MetadataExt,
    PermissionsExt,
    fchown,
  };

  file
    .set_permissions(fs::Permissions::from_mode(temp_mode(original)))
    .map_err(|err| {
      Error::system(
        format!("failed to set the mode of {}", temp.display()),
        err,
      )
    })?;

  if !rustix::process::geteuid().is_root() {
    return Ok(());
  }
  let created = file
    .metadata()
    .map_err(|err| Error::system(format!("failed to stat {}", temp.display()), err))?;
  if created.uid() == original.uid() && created.gid() == original.gid() {
    return Ok(());
  }
  fchown(file, Some(original.uid()), Some(original.gid())).map_err(|err| {
    Error::system(
      format!("failed to set the owner of {}", temp.display()),
      err,
    )
  })
}

#[cfg(not(unix))]
fn preserve_metadata(_file: &File, _temp: &Path, _original: &Metadata) -> Result<()> {
  Ok(())
}

/// Makes the rename durable.
#[cfg(unix)]
fn sync_parent(path: &Path) {
  let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
    return;
  };
  if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
    log::debug!("failed to sync {}: {err}", parent.display());
  }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn temp_names_skip_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("main.shada");
    fs::write(&target, b"").unwrap();
    fs::write(dir.path().join("main.shada.tmp.a"), b"").unwrap();
    fs::write(dir.path().join("main.shada.tmp.b"), b"").unwrap();

    let original = fs::metadata(&target).unwrap();
    let (temp, _file) = create_temp(&target, &original).unwrap();
    assert_eq!(temp, dir.path().join("main.shada.tmp.c"));
  }

  #[test]
  fn failed_rename_keeps_the_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let previous = dir.path().join("previous.shada");
    fs::write(&previous, b"").unwrap();
    let target = dir.path().join("main.shada");
    fs::create_dir(&target).unwrap();
    fs::write(target.join("occupied"), b"").unwrap();

    let previous = BufReader::new(File::open(&previous).unwrap());
    let err = write_merged(
      &target,
      previous,
      &ShadaConfig::default(),
      &crate::state::MemoryState::new(),
    )
    .unwrap_err();
    let temp = match err {
      Error::Rename { temp, .. } => temp,
      other => panic!("expected a rename error, got {other}"),
    };
    assert_eq!(temp, dir.path().join("main.shada.tmp.a"));
    assert!(temp.is_file());
    assert!(target.join("occupied").exists());
  }

  #[cfg(unix)]
  #[test]
  fn temp_mode_drops_execute_and_set_id_bits() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("main.shada");
    fs::write(&target, b"").unwrap();
    fs::set_permissions(&target, fs::Permissions::from_mode(0o4755)).unwrap();
    let original = fs::metadata(&target).unwrap();
    assert_eq!(temp_mode(&original), 0o644);

    fs::set_permissions(&target, fs::Permissions::from_mode(0o040)).unwrap();
    let original = fs::metadata(&target).unwrap();
    assert_eq!(temp_mode(&original), 0o640);
  }
}
