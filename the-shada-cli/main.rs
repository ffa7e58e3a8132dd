use std::{
  fs::File,
  io::{
    self,
    BufReader,
    BufWriter,
    Write,
  },
  path::Path,
};

use anyhow::{
  Context,
  Result,
  bail,
};
use the_shada::{
  Entry,
  EntryData,
  MemoryState,
  ReadFlags,
  ShadaConfig,
  WriteMode,
  entry::{
    HistoryKind,
    Mark,
  },
  read::entries,
  read_file,
  write_file,
};

use crate::cli::{
  CliOptions,
  Command,
};

mod cli;

fn main() -> Result<()> {
  let options = CliOptions::parse()?;
  setup_logging(options.verbosity, options.log_file.as_deref())?;

  let config = ShadaConfig::discover(options.config_file.as_deref())?;
  let Some(path) = options.shada_file.clone().or_else(|| config.file()) else {
    bail!("no location for the ShaDa file, pass --shada-file");
  };

  let mut stdout = BufWriter::new(io::stdout().lock());
  match options.command {
    Command::Load { flags } => load(&mut stdout, &path, &config, flags)?,
    Command::Save { from, overwrite } => save(&mut stdout, &path, &config, &from, overwrite)?,
    Command::Dump => dump(&mut stdout, &path)?,
  }
  stdout.flush()?;
  Ok(())
}

fn setup_logging(verbosity: u8, log_file: Option<&Path>) -> Result<()> {
  let level = match verbosity {
    0 => log::LevelFilter::Warn,
    1 => log::LevelFilter::Info,
    2 => log::LevelFilter::Debug,
    _ => log::LevelFilter::Trace,
  };

  let dispatch = fern::Dispatch::new()
    .format(|out, message, record| {
      out.finish(format_args!(
        "{} {} [{}] {}",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
        record.target(),
        record.level(),
        message
      ))
    })
    .level(level);

  let dispatch = match log_file {
    Some(path) => {
      let file = fern::log_file(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
      dispatch.chain(file)
    },
    None => dispatch.chain(io::stderr()),
  };
  dispatch.apply()?;
  Ok(())
}

fn load(out: &mut impl Write, path: &Path, config: &ShadaConfig, flags: ReadFlags) -> Result<()> {
  let mut state = MemoryState::new();
  let report = read_file(path, config, &mut state, flags)
    .with_context(|| format!("failed to load {}", path.display()))?;

  writeln!(out, "{}", path.display())?;
  writeln!(
    out,
    "  entries: {} applied, {} skipped, {} unknown, {} invalid",
    report.applied, report.skipped, report.unknown, report.invalid
  )?;
  writeln!(out, "  registers: {}", state.registers.len())?;
  writeln!(out, "  variables: {}", state.variables.len())?;
  writeln!(out, "  global marks: {}", state.global_marks.len())?;
  writeln!(out, "  files with marks: {}", state.files.len())?;
  writeln!(out, "  jumps: {}", state.jumps.len())?;
  for kind in HistoryKind::ALL {
    let entries = state.history_of(kind).len();
    if entries > 0 {
      writeln!(out, "  {kind} history: {entries}")?;
    }
  }
  if flags.contains(ReadFlags::GET_OLD_FILES) {
    writeln!(out, "  old files:")?;
    for file in &state.old_files {
      writeln!(out, "    {}", file.display())?;
    }
  }
  Ok(())
}

fn save(
  out: &mut impl Write,
  path: &Path,
  config: &ShadaConfig,
  from: &Path,
  overwrite: bool,
) -> Result<()> {
  let mut session = MemoryState::new();
  read_file(
    from,
    config,
    &mut session,
    ReadFlags::RESTORE | ReadFlags::FORCE | ReadFlags::MISSING_ERROR,
  )
  .with_context(|| format!("failed to load the session from {}", from.display()))?;

  let mode = if overwrite {
    WriteMode::Overwrite
  } else {
    WriteMode::Merge
  };
  let report = write_file(path, config, &session, mode)
    .with_context(|| format!("failed to write {}", path.display()))?;
  writeln!(
    out,
    "{}: {} entries written, {} skipped ({:?})",
    path.display(),
    report.written,
    report.skipped,
    report.merge
  )?;
  Ok(())
}

fn dump(out: &mut impl Write, path: &Path) -> Result<()> {
  let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
  for entry in entries(BufReader::new(file)) {
    match entry {
      Ok(entry) => writeln!(out, "{}", describe(&entry))?,
      Err(err) if !err.is_fatal() => writeln!(out, "invalid entry: {err}")?,
      Err(err) => return Err(err.into()),
    }
  }
  Ok(())
}

fn format_time(timestamp: u64) -> String {
  i64::try_from(timestamp)
    .ok()
    .and_then(|seconds| chrono::DateTime::from_timestamp(seconds, 0))
    .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| timestamp.to_string())
}

fn position(mark: &Mark) -> String {
  format!("{}:{}:{}", mark.file.display(), mark.lnum, mark.col)
}

fn describe(entry: &Entry) -> String {
  let details = match &entry.data {
    EntryData::Header(header) => {
      header
        .fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
    },
    EntryData::SearchPattern(pattern) => {
      let kind = if pattern.is_substitute_pattern {
        "substitute"
      } else {
        "search"
      };
      format!("{kind} {}", String::from_utf8_lossy(&pattern.pattern))
    },
    EntryData::SubString(replacement) => String::from_utf8_lossy(&replacement.sub).into_owned(),
    EntryData::HistoryEntry(item) => {
      format!("{} {}", item.kind, String::from_utf8_lossy(&item.text))
    },
    EntryData::Register(register) => {
      format!(
        "\"{} {:?} {} lines",
        register.name,
        register.kind,
        register.contents.len()
      )
    },
    EntryData::Variable(variable) => {
      format!(
        "{} = {}",
        String::from_utf8_lossy(&variable.name),
        variable.value
      )
    },
    EntryData::GlobalMark(mark) | EntryData::LocalMark(mark) => {
      format!("'{} {}", mark.name, position(mark))
    },
    EntryData::Jump(mark) | EntryData::Change(mark) => position(mark),
    EntryData::BufferList(buffers) => {
      buffers
        .iter()
        .map(|buffer| format!("{}:{}:{}", buffer.file.display(), buffer.lnum, buffer.col))
        .collect::<Vec<_>>()
        .join(" ")
    },
    EntryData::Unknown { kind, payload } => format!("kind {kind}, {} bytes", payload.len()),
  };
  format!("{} {}: {details}", format_time(entry.timestamp), entry.kind())
}

#[cfg(test)]
mod tests {
  use the_shada::{
    LiveState,
    Timed,
    entry::Register,
  };

  use super::*;

  #[test]
  fn describes_entries_on_one_line() {
    let entry = Entry::new(
      0,
      EntryData::GlobalMark(Mark::named('A', "/home/u/notes.txt", 3, 1)),
    );
    assert_eq!(
      describe(&entry),
      "1970-01-01 00:00:00 global mark: 'A /home/u/notes.txt:3:1"
    );

    let entry = Entry::new(5, EntryData::Unknown {
      kind:    42,
      payload: vec![1, 2, 3],
    });
    assert!(describe(&entry).ends_with("unknown: kind 42, 3 bytes"));
  }

  #[test]
  fn save_then_load_reports_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("session.shada");
    let target = dir.path().join("main.shada");
    let config = ShadaConfig::default();

    let mut session = MemoryState::new();
    session.set_register(Timed::new(
      1_700_000_000,
      Register::new('a', vec![b"text".to_vec()]),
    ));
    write_file(&source, &config, &session, WriteMode::Merge).unwrap();

    let mut out = Vec::new();
    save(&mut out, &target, &config, &source, false).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("2 entries written"));

    let mut out = Vec::new();
    load(&mut out, &target, &config, ReadFlags::RESTORE).unwrap();
    let summary = String::from_utf8(out).unwrap();
    assert!(summary.contains("registers: 1"), "{summary}");

    let mut out = Vec::new();
    dump(&mut out, &target).unwrap();
    let lines = String::from_utf8(out).unwrap();
    assert_eq!(lines.lines().count(), 2);
    assert!(lines.lines().nth(1).unwrap().contains("register: \"a CharWise 1 lines"));
  }
}
