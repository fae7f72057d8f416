use crate::error::{Error, Result};
use crate::host::{HostCommand, HostRunner};

/// Control surface of the host service manager.
pub trait ServiceManager: Send + Sync {
  fn start(&self, unit: &str) -> Result<()>;
  /// Stopping a unit that is already stopped or not loaded succeeds.
  fn stop(&self, unit: &str) -> Result<()>;
  fn enable(&self, unit: &str) -> Result<()>;
  /// Stops and disables; a unit that does not exist is not an error.
  fn disable_now(&self, unit: &str) -> Result<()>;
  fn daemon_reload(&self) -> Result<()>;
  /// The manager's own word for the unit state, uninterpreted.
  fn active_state(&self, unit: &str) -> String;
  fn restart_count(&self, unit: &str) -> Option<u32>;
}

pub struct Systemd<'a> {
  runner: &'a dyn HostRunner,
}

impl<'a> Systemd<'a> {
  pub fn new(runner: &'a dyn HostRunner) -> Self {
    Self { runner }
  }

  fn systemctl(&self, action: &'static str, unit: &str, tolerate: &[&str]) -> Result<()> {
    let args: Vec<&str> = match action {
      "daemon-reload" => vec![action],
      "disable" => vec![action, "--now", unit],
      _ => vec![action, unit],
    };
    let cmd = HostCommand::new("systemctl", args);
    let out = self.runner.run(&cmd).map_err(|e| Error::ServiceControl {
      unit: unit.to_owned(),
      action,
      detail: e.to_string(),
    })?;
    if out.success {
      return Ok(());
    }
    let detail = out.detail();
    if tolerate.iter().any(|t| detail.contains(t)) {
      return Ok(());
    }
    Err(Error::ServiceControl { unit: unit.to_owned(), action, detail })
  }
}

fn service(unit: &str) -> String {
  if unit.contains('.') {
    unit.to_owned()
  } else {
    format!("{unit}.service")
  }
}

const NOT_LOADED: &[&str] = &["not loaded", "does not exist", "not found"];

impl ServiceManager for Systemd<'_> {
  fn start(&self, unit: &str) -> Result<()> {
    self.systemctl("start", &service(unit), &[])
  }
  fn stop(&self, unit: &str) -> Result<()> {
    self.systemctl("stop", &service(unit), NOT_LOADED)
  }
  fn enable(&self, unit: &str) -> Result<()> {
    self.systemctl("enable", &service(unit), &[])
  }
  fn disable_now(&self, unit: &str) -> Result<()> {
    self.systemctl("disable", &service(unit), NOT_LOADED)
  }
  fn daemon_reload(&self) -> Result<()> {
    self.systemctl("daemon-reload", "systemd", &[])
  }
  fn active_state(&self, unit: &str) -> String {
    let cmd = HostCommand::new("systemctl", ["is-active".to_owned(), service(unit)]);
    match self.runner.run(&cmd) {
      Ok(out) if !out.stdout.trim().is_empty() => out.stdout.trim().to_owned(),
      _ => "unknown".to_owned(),
    }
  }
  fn restart_count(&self, unit: &str) -> Option<u32> {
    let cmd = HostCommand::new("systemctl", ["show".to_owned(), service(unit), "--property=NRestarts".to_owned()]);
    let out = self.runner.run(&cmd).ok()?;
    out.stdout.trim().strip_prefix("NRestarts=")?.parse().ok()
  }
}
