//! Start/stop/status of the generated services in dependency order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::*;
use crate::config::InstallationConfig;
use crate::error::{Error, Result};
use crate::health::{Health, MonitorClient};
use crate::host::Pause;
use crate::layout::Layout;
use crate::systemd::ServiceManager;
use crate::units::{self, ManagedService, ServiceKind};

pub const RESTART_SETTLE: Duration = Duration::from_secs(2);
pub const NOT_CONFIGURED: &str = "not configured";

#[derive(Debug)]
pub enum Outcome {
  Done,
  Failed(Error),
  /// Not attempted because a required service did not start.
  Skipped { blocked_by: ServiceKind },
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Done => write!(f, "ok"),
      Self::Failed(e) => write!(f, "failed: {e}"),
      Self::Skipped { blocked_by } => write!(f, "skipped, {} did not start", blocked_by.name()),
    }
  }
}

#[derive(Debug, Default)]
pub struct ControlReport {
  pub entries: Vec<(ServiceKind, Outcome)>,
}

impl ControlReport {
  pub fn is_success(&self) -> bool {
    self.entries.iter().all(|(_, o)| matches!(o, Outcome::Done))
  }
  pub fn outcome(&self, kind: ServiceKind) -> Option<&Outcome> {
    self.entries.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
  }
  /// First error, for callers that need a `Result`.
  pub fn into_result(self) -> Result<()> {
    for (_, outcome) in self.entries {
      if let Outcome::Failed(e) = outcome {
        return Err(e);
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
  pub kind: ServiceKind,
  pub unit: &'static str,
  pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTail {
  pub kind: ServiceKind,
  pub path: PathBuf,
  /// `None` when the file does not exist yet.
  pub lines: Option<Vec<String>>,
}

/// Dependencies first; among independent services the generation order wins.
pub fn start_order(services: &[ManagedService]) -> Vec<ServiceKind> {
  let present: HashSet<ServiceKind> = services.iter().map(|s| s.kind).collect();
  let mut in_degree: HashMap<ServiceKind, usize> = services
    .iter()
    .map(|s| (s.kind, s.ordered_after().filter(|d| present.contains(d)).count()))
    .collect();
  let mut order = Vec::with_capacity(services.len());
  let mut ready: VecDeque<ServiceKind> = services.iter().map(|s| s.kind).filter(|k| in_degree[k] == 0).collect();
  while let Some(kind) = ready.pop_front() {
    order.push(kind);
    for dependent in services.iter().filter(|s| s.ordered_after().any(|d| d == kind)) {
      if let Some(degree) = in_degree.get_mut(&dependent.kind) {
        *degree -= 1;
        if *degree == 0 {
          ready.push_back(dependent.kind);
        }
      }
    }
    // keep generation order among whatever became ready
    let mut sorted: Vec<_> = ready.drain(..).collect();
    sorted.sort_by_key(|k| services.iter().position(|s| s.kind == *k));
    ready.extend(sorted);
  }
  if order.len() != services.len() {
    warn!("dependency cycle among services; starting the rest in declaration order");
    order.extend(services.iter().map(|s| s.kind).filter(|k| !order.contains(k)).collect::<Vec<_>>());
  }
  order
}

pub struct ServiceSupervisor<'a> {
  config: InstallationConfig,
  services: Vec<ManagedService>,
  layout: &'a Layout,
  manager: &'a dyn ServiceManager,
  pause: &'a dyn Pause,
}

impl<'a> ServiceSupervisor<'a> {
  pub fn new(config: InstallationConfig, layout: &'a Layout, manager: &'a dyn ServiceManager, pause: &'a dyn Pause) -> Self {
    let services = units::generate(&config, layout);
    Self { config, services, layout, manager, pause }
  }

  /// Supervisor for the configuration persisted on this host.
  pub fn from_installation(layout: &'a Layout, manager: &'a dyn ServiceManager, pause: &'a dyn Pause) -> Result<Self> {
    let config = InstallationConfig::load(&layout.installation_config())?;
    Ok(Self::new(config, layout, manager, pause))
  }

  pub fn config(&self) -> &InstallationConfig {
    &self.config
  }

  pub fn services(&self) -> &[ManagedService] {
    &self.services
  }

  fn service(&self, kind: ServiceKind) -> Option<&ManagedService> {
    self.services.iter().find(|s| s.kind == kind)
  }

  /// Writes unit files for every generated service and removes the unit of a
  /// service that is no longer generated, then reloads the manager.
  pub fn install_units(&self) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(self.layout.unit_dir())?;
    fs::create_dir_all(self.layout.log_dir())?;
    let mut written = vec![];
    for service in &self.services {
      let path = self.layout.unit_file(service.kind.unit_name());
      fs::write(&path, units::render(service))?;
      debug!("wrote {}", path.display());
      written.push(path);
    }
    for kind in ServiceKind::ALL.iter().filter(|k| self.service(**k).is_none()) {
      let path = self.layout.unit_file(kind.unit_name());
      if path.exists() {
        self.manager.disable_now(kind.unit_name()).log_and_forget();
        fs::remove_file(&path)?;
        info!("removed {}, {} is no longer configured", path.display(), kind.name());
      }
    }
    self.manager.daemon_reload()?;
    Ok(written)
  }

  pub fn enable_all(&self) -> ControlReport {
    let mut report = ControlReport::default();
    for kind in start_order(&self.services) {
      let outcome = match self.manager.enable(kind.unit_name()) {
        Ok(()) => Outcome::Done,
        Err(e) => Outcome::Failed(e),
      };
      report.entries.push((kind, outcome));
    }
    report
  }

  /// Re-renders the units from the configuration this supervisor was built
  /// with, so the `INFERNO_*` environment and encoder arguments follow the
  /// persisted file, then starts in dependency order.
  pub fn start(&self) -> ControlReport {
    if let Err(e) = self.install_units() {
      warn!("could not refresh units, starting with the installed ones: {e}");
    }
    let mut report = ControlReport::default();
    let mut started: HashSet<ServiceKind> = HashSet::new();
    for kind in start_order(&self.services) {
      let Some(service) = self.service(kind) else { continue };
      let blocked_by = service.required_services().find(|dep| !started.contains(dep));
      let outcome = if let Some(dep) = blocked_by {
        warn!("not starting {}: {} did not start", kind.name(), dep.name());
        Outcome::Skipped { blocked_by: dep }
      } else {
        match self.manager.start(kind.unit_name()) {
          Ok(()) => {
            info!("started {} ({})", kind.name(), kind.unit_name());
            started.insert(kind);
            Outcome::Done
          }
          Err(e) => {
            error!("{e}");
            Outcome::Failed(e)
          }
        }
      };
      report.entries.push((kind, outcome));
    }
    report
  }

  pub fn stop(&self) -> ControlReport {
    let mut report = ControlReport::default();
    for kind in start_order(&self.services).into_iter().rev() {
      let outcome = match self.manager.stop(kind.unit_name()) {
        Ok(()) => Outcome::Done,
        Err(e) => {
          error!("{e}");
          Outcome::Failed(e)
        }
      };
      report.entries.push((kind, outcome));
    }
    report
  }

  pub fn restart(&self) -> ControlReport {
    let mut report = self.stop();
    self.pause.pause(RESTART_SETTLE);
    let started = self.start();
    report.entries.retain(|(_, o)| !matches!(o, Outcome::Done));
    report.entries.extend(started.entries);
    report
  }

  /// One entry per known service kind; stream-encode is reported as not
  /// configured when streaming is disabled.
  pub fn status(&self) -> Vec<ServiceStatus> {
    let mut kinds = start_order(&self.services);
    if !self.config.srt.enabled {
      kinds.push(ServiceKind::StreamEncode);
    }
    kinds
      .into_iter()
      .map(|kind| ServiceStatus {
        kind,
        unit: kind.unit_name(),
        state: if self.service(kind).is_some() {
          self.manager.active_state(kind.unit_name())
        } else {
          NOT_CONFIGURED.to_owned()
        },
      })
      .collect()
  }

  pub fn logs(&self, lines: usize) -> Vec<LogTail> {
    let mut tails = vec![];
    for kind in start_order(&self.services) {
      let Some(service) = self.service(kind) else { continue };
      for path in [&service.stdout_log, &service.stderr_log] {
        tails.push(LogTail { kind, path: path.clone(), lines: tail(path, lines) });
      }
    }
    tails
  }

  pub async fn health_check(&self) -> Health {
    match MonitorClient::for_config(&self.config) {
      Ok(client) => client.health().await,
      Err(e) => Health::Unhealthy(e.to_string()),
    }
  }
}

/// Bytes read from the end of a log before looking for line boundaries.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Last `n` lines of a log file, or `None` if it cannot be opened. Only the
/// end of the file is read; bytes that are not UTF-8 are replaced.
pub fn tail(path: &Path, n: usize) -> Option<Vec<String>> {
  let mut file = File::open(path).ok()?;
  let len = file.metadata().ok()?.len();
  let mut window = TAIL_WINDOW;
  loop {
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 {
      if lines.len() <= n {
        window *= 2;
        continue;
      }
      // first line is cut
      lines.remove(0);
    }
    let skip = lines.len().saturating_sub(n);
    return Some(lines[skip..].iter().map(|s| s.to_string()).collect());
  }
}
