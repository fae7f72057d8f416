//! Seam between the provisioner and the mutable host.
//!
//! Every change to routes, firewall tables, links or the service manager goes
//! through a [`HostRunner`] so that tests can substitute an in-memory
//! implementation.

use std::fmt;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use itertools::Itertools;

use crate::common::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
  pub program: String,
  pub args: Vec<String>,
}

impl HostCommand {
  pub fn new<I, S>(program: &str, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self { program: program.to_owned(), args: args.into_iter().map(Into::into).collect() }
  }
}

impl fmt::Display for HostCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", std::iter::once(&self.program).chain(self.args.iter()).join(" "))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  pub success: bool,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn ok(stdout: impl Into<String>) -> Self {
    Self { success: true, stdout: stdout.into(), stderr: String::new() }
  }
  pub fn failed(stderr: impl Into<String>) -> Self {
    Self { success: false, stdout: String::new(), stderr: stderr.into() }
  }
  /// Whatever the command printed, for error messages.
  pub fn detail(&self) -> String {
    let err = self.stderr.trim();
    if err.is_empty() {
      self.stdout.trim().to_owned()
    } else {
      err.to_owned()
    }
  }
}

pub trait HostRunner: Send + Sync {
  /// Runs the command to completion. `Err` means it could not be spawned at
  /// all (typically: not installed); a non-zero exit is `Ok` with
  /// `success == false`.
  fn run(&self, cmd: &HostCommand) -> std::io::Result<CommandOutput>;

  fn has_program(&self, program: &str) -> bool {
    self
      .run(&HostCommand::new("sh", ["-c".to_owned(), format!("command -v {program}")]))
      .map(|out| out.success)
      .unwrap_or(false)
  }
}

/// Runs commands on the real host.
pub struct SystemRunner;

impl HostRunner for SystemRunner {
  fn run(&self, cmd: &HostCommand) -> std::io::Result<CommandOutput> {
    debug!("running {cmd}");
    let out = Command::new(&cmd.program).args(&cmd.args).output()?;
    Ok(CommandOutput {
      success: out.status.success(),
      stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
  }
}

/// Source of delays for polling loops.
pub trait Pause: Send + Sync {
  fn pause(&self, duration: Duration);
}

pub struct ThreadPause;

impl Pause for ThreadPause {
  fn pause(&self, duration: Duration) {
    std::thread::sleep(duration);
  }
}

type Responder = Box<dyn Fn(&HostCommand) -> std::io::Result<CommandOutput> + Send + Sync>;

/// In-memory runner: records every command and answers through a responder
/// closure (by default every command succeeds with empty output).
pub struct FakeRunner {
  responder: Responder,
  history: Mutex<Vec<HostCommand>>,
}

impl Default for FakeRunner {
  fn default() -> Self {
    Self::new(|_| Ok(CommandOutput::ok("")))
  }
}

impl FakeRunner {
  pub fn new(responder: impl Fn(&HostCommand) -> std::io::Result<CommandOutput> + Send + Sync + 'static) -> Self {
    Self { responder: Box::new(responder), history: Mutex::new(vec![]) }
  }

  pub fn history(&self) -> Vec<HostCommand> {
    self.history.lock().map(|h| h.clone()).unwrap_or_default()
  }

  /// Recorded commands rendered as shell lines.
  pub fn lines(&self) -> Vec<String> {
    self.history().iter().map(ToString::to_string).collect()
  }
}

impl HostRunner for FakeRunner {
  fn run(&self, cmd: &HostCommand) -> std::io::Result<CommandOutput> {
    if let Ok(mut history) = self.history.lock() {
      history.push(cmd.clone());
    }
    (self.responder)(cmd)
  }
}

/// Pause that returns immediately and remembers what it was asked for.
#[derive(Default)]
pub struct RecordingPause {
  pauses: Mutex<Vec<Duration>>,
}

impl RecordingPause {
  pub fn count(&self) -> usize {
    self.pauses.lock().map(|p| p.len()).unwrap_or(0)
  }
  pub fn total(&self) -> Duration {
    self.pauses.lock().map(|p| p.iter().sum()).unwrap_or_default()
  }
}

impl Pause for RecordingPause {
  fn pause(&self, duration: Duration) {
    if let Ok(mut pauses) = self.pauses.lock() {
      pauses.push(duration);
    }
  }
}
