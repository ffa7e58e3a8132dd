use std::{
  fs,
  path::{
    Path,
    PathBuf,
  },
};

use rmpv::Value;
use the_shada::{
  Entry,
  EntryData,
  Error,
  LiveState,
  MemoryState,
  MergeStatus,
  ReadFlags,
  ShadaConfig,
  Timed,
  WriteMode,
  codec,
  config::HistoryLimits,
  entry::{
    HistoryItem,
    HistoryKind,
    Kind,
    Mark,
    Register,
    SearchPattern,
  },
  frame::{
    FrameReader,
    write_frame,
  },
  read::entries,
  read_file,
  write_file,
};

const T: u64 = 1_700_000_000;

fn file_of(entries: &[Entry]) -> Vec<u8> {
  let mut out = Vec::new();
  for entry in entries {
    let payload = codec::encode(entry).unwrap();
    write_frame(&mut out, entry.kind_id(), entry.timestamp, &payload).unwrap();
  }
  out
}

fn read_entries(path: &Path) -> Vec<Entry> {
  let bytes = fs::read(path).unwrap();
  entries(bytes.as_slice()).collect::<Result<_, _>>().unwrap()
}

fn without_header(entries: Vec<Entry>) -> Vec<Entry> {
  entries
    .into_iter()
    .filter(|entry| entry.kind() != Kind::Header)
    .collect()
}

fn restore(path: &Path, config: &ShadaConfig) -> MemoryState {
  let mut state = MemoryState::new();
  read_file(path, config, &mut state, ReadFlags::RESTORE).unwrap();
  state
}

fn sample_session() -> MemoryState {
  let mut state = MemoryState::new();
  state.search_pattern = Some(Timed::new(T, SearchPattern::new("needle")));
  state.push_history(T + 1, HistoryItem::new(HistoryKind::Command, "write"));
  state.push_history(T + 2, HistoryItem::new(HistoryKind::Search, "needle"));
  state.set_register(Timed::new(
    T + 3,
    Register::new('q', vec![b"first".to_vec(), b"second".to_vec()]),
  ));
  state.set_global_mark(Timed::new(T + 4, Mark::named('N', "/home/u/notes.txt", 12, 4)));
  state.set_local_mark(Timed::new(T + 5, Mark::named('a', "/home/u/main.rs", 30, 2)));
  state.set_changes(Path::new("/home/u/main.rs"), vec![Timed::new(
    T + 6,
    Mark::new("/home/u/main.rs", 31, 0),
  )]);
  state.jumps.push(Timed::new(T + 7, Mark::new("/home/u/main.rs", 1, 0)));
  state
}

#[test]
fn global_mark_survives_a_session() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let config = ShadaConfig::default();

  let mut session = MemoryState::new();
  let mark = Mark::named('A', "/home/u/notes.txt", 12, 4);
  session.set_global_mark(Timed::new(T, mark.clone()));
  let report = write_file(&path, &config, &session, WriteMode::Merge).unwrap();
  assert!(matches!(report.merge, MergeStatus::NoPreviousFile));

  let restored = restore(&path, &config);
  assert_eq!(restored.global_marks[&'A'], Timed::new(T, mark));
}

#[test]
fn history_keeps_the_newest_distinct_entries() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let config = ShadaConfig {
    history: HistoryLimits {
      search: 2,
      ..HistoryLimits::default()
    },
    ..ShadaConfig::default()
  };

  let search = |text: &str| HistoryItem::new(HistoryKind::Search, text);
  fs::write(
    &path,
    file_of(&[
      Entry::new(T + 1, EntryData::HistoryEntry(search("foo"))),
      Entry::new(T + 2, EntryData::HistoryEntry(search("bar"))),
    ]),
  )
  .unwrap();

  let mut session = MemoryState::new();
  session.push_history(T + 3, search("bar"));
  session.push_history(T + 4, search("baz"));
  write_file(&path, &config, &session, WriteMode::Merge).unwrap();

  let history: Vec<_> = read_entries(&path)
    .into_iter()
    .filter_map(|entry| {
      match entry.data {
        EntryData::HistoryEntry(item) => Some((item.text, entry.timestamp)),
        _ => None,
      }
    })
    .collect();
  assert_eq!(history, vec![
    (b"bar".to_vec(), T + 3),
    (b"baz".to_vec(), T + 4)
  ]);
}

#[test]
fn truncated_file_keeps_earlier_entries() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let mut bytes = file_of(&[Entry::new(
    T,
    EntryData::GlobalMark(Mark::named('B', "/b", 1, 0)),
  )]);
  bytes.extend([7, 1, 50]);
  bytes.extend([0u8; 10]);
  fs::write(&path, bytes).unwrap();

  let mut state = MemoryState::new();
  let err = read_file(&path, &ShadaConfig::default(), &mut state, ReadFlags::RESTORE).unwrap_err();
  assert!(matches!(err, Error::Format { .. }), "{err}");
  assert!(state.global_marks.contains_key(&'B'));
}

#[test]
fn register_without_contents_is_skipped() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");

  let mut payload = Vec::new();
  rmpv::encode::write_value(
    &mut payload,
    &Value::Map(vec![(Value::from("n"), Value::from(u64::from('x')))]),
  )
  .unwrap();
  let mut bytes = Vec::new();
  write_frame(&mut bytes, 5, T, &payload).unwrap();
  bytes.extend(file_of(&[Entry::new(
    T,
    EntryData::Register(Register::new('y', vec![b"kept".to_vec()])),
  )]));
  fs::write(&path, bytes).unwrap();

  let mut state = MemoryState::new();
  let report = read_file(&path, &ShadaConfig::default(), &mut state, ReadFlags::RESTORE).unwrap();
  assert_eq!(report.invalid, 1);
  assert_eq!(report.applied, 1);
  assert!(!state.registers.contains_key(&'x'));
  assert_eq!(state.registers[&'y'].value.contents, vec![b"kept".to_vec()]);
}

#[test]
fn damaged_previous_file_is_recovered() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let mut bytes = file_of(&[Entry::new(
    T,
    EntryData::GlobalMark(Mark::named('C', "/c", 3, 0)),
  )]);
  bytes.extend([0xa3, b'b', b'a', b'd']);
  fs::write(&path, bytes).unwrap();

  let report = write_file(&path, &ShadaConfig::default(), &MemoryState::new(), WriteMode::Merge)
    .unwrap();
  match report.merge {
    MergeStatus::Recovered { error, entries } => {
      assert!(matches!(error, Error::Format { .. }), "{error}");
      assert_eq!(entries, 1);
    },
    other => panic!("expected a recovered merge, got {other:?}"),
  }

  let restored = restore(&path, &ShadaConfig::default());
  assert_eq!(restored.global_marks[&'C'].value.lnum, 3);
}

#[test]
fn exhausted_temp_names_leave_the_file_alone() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let original = file_of(&[Entry::new(
    T,
    EntryData::GlobalMark(Mark::named('D', "/d", 1, 0)),
  )]);
  fs::write(&path, &original).unwrap();
  for letter in 'a'..='z' {
    fs::write(dir.path().join(format!("main.shada.tmp.{letter}")), b"").unwrap();
  }

  let err = write_file(&path, &ShadaConfig::default(), &sample_session(), WriteMode::Merge)
    .unwrap_err();
  assert!(matches!(err, Error::CannotWrite { .. }), "{err}");
  assert_eq!(fs::read(&path).unwrap(), original);
}

#[test]
fn rewriting_a_restored_session_is_stable() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let config = ShadaConfig::default();

  write_file(&path, &config, &sample_session(), WriteMode::Merge).unwrap();
  let first = without_header(read_entries(&path));

  let restored = restore(&path, &config);
  let report = write_file(&path, &config, &restored, WriteMode::Merge).unwrap();
  assert!(matches!(report.merge, MergeStatus::Clean));
  let second = without_header(read_entries(&path));

  assert_eq!(first, second);
  assert_eq!(first.len(), 8);
}

#[test]
fn newer_data_from_another_session_survives() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let config = ShadaConfig::default();

  let mut newer = MemoryState::new();
  newer.set_register(Timed::new(T + 10, Register::new('a', vec![b"newer".to_vec()])));
  newer.set_global_mark(Timed::new(T + 10, Mark::named('M', "/newer", 5, 0)));
  write_file(&path, &config, &newer, WriteMode::Merge).unwrap();

  let mut older = MemoryState::new();
  older.set_register(Timed::new(T, Register::new('a', vec![b"older".to_vec()])));
  older.set_global_mark(Timed::new(T, Mark::named('O', "/older", 7, 0)));
  write_file(&path, &config, &older, WriteMode::Merge).unwrap();

  let restored = restore(&path, &config);
  assert_eq!(restored.registers[&'a'].value.contents, vec![b"newer".to_vec()]);
  assert!(restored.global_marks.contains_key(&'M'));
  assert!(restored.global_marks.contains_key(&'O'));
}

#[test]
fn unknown_kinds_pass_through_untouched() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let mut bytes = Vec::new();
  write_frame(&mut bytes, 99, T, &[0x92, 0x01, 0xc3]).unwrap();
  fs::write(&path, bytes).unwrap();

  write_file(&path, &ShadaConfig::default(), &sample_session(), WriteMode::Merge).unwrap();

  let bytes = fs::read(&path).unwrap();
  let mut frames = FrameReader::new(bytes.as_slice());
  let mut unknown = Vec::new();
  while let Some(frame) = frames.read_frame().unwrap() {
    if frame.kind == 99 {
      unknown.push((frame.timestamp, frame.payload));
    }
  }
  assert_eq!(unknown, vec![(T, vec![0x92, 0x01, 0xc3])]);
}

#[test]
fn overwrite_ignores_the_previous_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  fs::write(
    &path,
    file_of(&[Entry::new(
      T,
      EntryData::GlobalMark(Mark::named('Z', "/z", 1, 0)),
    )]),
  )
  .unwrap();

  let report =
    write_file(&path, &ShadaConfig::default(), &sample_session(), WriteMode::Overwrite).unwrap();
  assert!(matches!(report.merge, MergeStatus::Overwritten));

  let restored = restore(&path, &ShadaConfig::default());
  assert!(!restored.global_marks.contains_key(&'Z'));
  assert!(restored.global_marks.contains_key(&'N'));
}

#[test]
fn missing_directories_are_created() {
  let dir = tempfile::tempdir().unwrap();
  let path: PathBuf = dir.path().join("state").join("the-shada").join("main.shada");

  write_file(&path, &ShadaConfig::default(), &sample_session(), WriteMode::Merge).unwrap();
  assert!(path.is_file());
}

#[cfg(unix)]
#[test]
fn file_modes_are_kept() {
  use std::os::unix::fs::PermissionsExt;

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("main.shada");
  let config = ShadaConfig::default();

  write_file(&path, &config, &sample_session(), WriteMode::Merge).unwrap();
  let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
  assert_eq!(mode, 0o600);

  fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
  write_file(&path, &config, &sample_session(), WriteMode::Merge).unwrap();
  let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
  assert_eq!(mode, 0o640);

  let leftovers: Vec<_> = fs::read_dir(dir.path())
    .unwrap()
    .map(|entry| entry.unwrap().file_name())
    .filter(|name| name.to_string_lossy().contains(".tmp."))
    .collect();
  assert!(leftovers.is_empty(), "{leftovers:?}");
}
