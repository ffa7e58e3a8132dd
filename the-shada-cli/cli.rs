use std::path::PathBuf;

use anyhow::Result;
use clap::{
  ArgAction,
  Parser,
  Subcommand,
};
use the_shada::ReadFlags;

#[derive(Clone, Debug)]
pub struct CliOptions {
  pub command:     Command,
  pub shada_file:  Option<PathBuf>,
  pub config_file: Option<PathBuf>,
  pub verbosity:   u8,
  pub log_file:    Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
  /// Restore the file into an empty session and summarize it.
  Load { flags: ReadFlags },
  /// Write the session stored in `from` to the ShaDa file.
  Save { from: PathBuf, overwrite: bool },
  /// Print every entry of the file.
  Dump,
}

impl CliOptions {
  pub fn parse() -> Result<Self> {
    let raw = RawCli::parse();
    raw.try_into()
  }
}

#[derive(Parser, Debug)]
#[command(name = "the-shada", about, version, long_about = None)]
struct RawCli {
  /// ShaDa file to operate on instead of the configured one
  #[arg(short = 'i', long = "shada-file", value_name = "FILE", global = true)]
  shada_file: Option<PathBuf>,

  /// Load configuration from a specific file
  #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
  config_file: Option<PathBuf>,

  /// Increase logging verbosity (repeat for more detail)
  #[arg(short = 'v', action = ArgAction::Count, global = true)]
  verbosity: u8,

  /// Save logs to a specific file
  #[arg(long = "log", value_name = "FILE", global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: RawCommand,
}

#[derive(Subcommand, Debug)]
enum RawCommand {
  /// Read the ShaDa file and report what would be restored
  Load {
    /// Apply entries even when the session has newer values
    #[arg(long)]
    force: bool,

    /// Fail when the ShaDa file does not exist
    #[arg(long)]
    missing_error: bool,

    /// Skip marks, jumps and changes
    #[arg(long, conflicts_with = "marks_only")]
    no_marks: bool,

    /// Restore only marks, jumps and changes
    #[arg(long)]
    marks_only: bool,

    /// Collect the files that have local marks
    #[arg(long)]
    old_files: bool,
  },
  /// Merge a session into the ShaDa file
  Save {
    /// ShaDa file holding the session to write
    #[arg(long, value_name = "FILE")]
    from: PathBuf,

    /// Replace the ShaDa file instead of merging with it
    #[arg(long)]
    overwrite: bool,
  },
  /// Print every entry of the ShaDa file
  Dump,
}

impl TryFrom<RawCli> for CliOptions {
  type Error = anyhow::Error;

  fn try_from(raw: RawCli) -> Result<Self> {
    let command = match raw.command {
      RawCommand::Load {
        force,
        missing_error,
        no_marks,
        marks_only,
        old_files,
      } => {
        let mut flags = match (no_marks, marks_only) {
          (true, _) => ReadFlags::WANT_INFO,
          (_, true) => ReadFlags::WANT_MARKS,
          _ => ReadFlags::RESTORE,
        };
        flags.set(ReadFlags::FORCE, force);
        flags.set(ReadFlags::MISSING_ERROR, missing_error);
        flags.set(ReadFlags::GET_OLD_FILES, old_files);
        Command::Load { flags }
      },
      RawCommand::Save { from, overwrite } => Command::Save { from, overwrite },
      RawCommand::Dump => Command::Dump,
    };

    Ok(Self {
      command,
      shada_file: raw.shada_file,
      config_file: raw.config_file,
      verbosity: raw.verbosity,
      log_file: raw.log_file,
    })
  }
}
