//! End-to-end provisioning pipeline and the host self-test.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::common::*;
use crate::config::{resolve, Defaults, InstallationConfig, RawInputs};
use crate::error::{Error, Result};
use crate::firewall::{dante_allow_list, FirewallProvisioner, FirewallReport};
use crate::health::Health;
use crate::host::{HostCommand, HostRunner, Pause};
use crate::layout::Layout;
use crate::network::{ApplyOutcome, NetworkProvisioner, RouteReport};
use crate::ptp_config::write_ptp_config;
use crate::supervisor::ServiceSupervisor;
use crate::systemd::ServiceManager;
use crate::units::ServiceKind;

pub const SUPPORTED_ARCHES: &[&str] = &["x86_64", "aarch64", "arm"];

/// Host clock daemons that would fight statime over the system clock.
pub const CONFLICTING_TIME_SYNC: &[&str] = &["systemd-timesyncd", "chrony", "ntp"];

/// Yes/no questions put to the operator when provisioning cannot proceed
/// unattended.
pub trait Confirm {
  fn confirm(&self, question: &str) -> bool;
}

/// Answers yes to everything (`install --yes`).
pub struct AssumeYes;

impl Confirm for AssumeYes {
  fn confirm(&self, question: &str) -> bool {
    info!("{question} yes (assumed)");
    true
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
  pub euid: u32,
  pub arch: String,
}

impl HostFacts {
  pub fn current() -> Self {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    Self { euid, arch: std::env::consts::ARCH.to_owned() }
  }

  pub fn check(&self) -> Result<()> {
    if self.euid != 0 {
      return Err(Error::Precondition("provisioning must run as root".to_owned()));
    }
    if !SUPPORTED_ARCHES.iter().any(|a| *a == self.arch) {
      return Err(Error::Precondition(format!("unsupported architecture {}", self.arch)));
    }
    Ok(())
  }
}

/// External binaries the generated units execute.
pub fn required_binaries(config: &InstallationConfig) -> Vec<&'static str> {
  let mut binaries = vec!["statime", "inferno2pipe"];
  if config.srt.enabled {
    binaries.push("ffmpeg");
  }
  binaries
}

#[derive(Debug)]
pub struct ProvisionReport {
  pub config: InstallationConfig,
  pub network: Option<ApplyOutcome>,
  pub firewall: Option<FirewallReport>,
  pub units: Vec<PathBuf>,
  /// Absorbed failures, already logged.
  pub warnings: Vec<Error>,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
  pub dante_interface: String,
  pub dante_address: Option<String>,
  pub multicast_route: bool,
  pub sockets: Vec<String>,
  pub health: Health,
}

impl VerifyReport {
  pub fn is_healthy(&self) -> bool {
    self.dante_address.is_some() && self.multicast_route && self.health.is_healthy()
  }
}

pub struct TopologyController<'a> {
  layout: &'a Layout,
  runner: &'a dyn HostRunner,
  manager: &'a dyn ServiceManager,
  pause: &'a dyn Pause,
  facts: HostFacts,
  ctl_source: Option<PathBuf>,
}

impl<'a> TopologyController<'a> {
  pub fn new(layout: &'a Layout, runner: &'a dyn HostRunner, manager: &'a dyn ServiceManager, pause: &'a dyn Pause) -> Self {
    Self { layout, runner, manager, pause, facts: HostFacts::current(), ctl_source: None }
  }

  pub fn with_facts(mut self, facts: HostFacts) -> Self {
    self.facts = facts;
    self
  }

  /// Executable to install as the management tool invoked by the units.
  pub fn with_ctl_source(mut self, path: impl Into<PathBuf>) -> Self {
    self.ctl_source = Some(path.into());
    self
  }

  pub fn load_config(&self) -> Result<InstallationConfig> {
    InstallationConfig::load(&self.layout.installation_config())
  }

  pub fn supervisor(&self, config: InstallationConfig) -> ServiceSupervisor<'a> {
    ServiceSupervisor::new(config, self.layout, self.manager, self.pause)
  }

  fn network(&self) -> NetworkProvisioner<'a> {
    NetworkProvisioner::new(self.layout, self.runner, self.pause)
  }

  fn verify_binaries(&self, config: &InstallationConfig) -> Result<()> {
    for binary in required_binaries(config) {
      let path = self.layout.bin_dir().join(binary);
      if !path.is_file() {
        return Err(Error::Download { binary: binary.to_owned(), path });
      }
      debug!("found {}", path.display());
    }
    Ok(())
  }

  fn install_ctl(&self) -> Result<()> {
    let Some(source) = &self.ctl_source else { return Ok(()) };
    let target = self.layout.ctl_binary();
    if fs::canonicalize(source).ok() == fs::canonicalize(&target).ok() {
      return Ok(());
    }
    if let Some(dir) = target.parent() {
      fs::create_dir_all(dir)?;
    }
    fs::copy(source, &target)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    info!("installed {}", target.display());
    Ok(())
  }

  fn provision_network(&self, config: &InstallationConfig, confirm: &dyn Confirm) -> Result<Option<ApplyOutcome>> {
    let failure = match self.network().apply_static_network(config) {
      Ok(ApplyOutcome::Unsupported) => "no supported network configuration mechanism on this host".to_owned(),
      Ok(outcome) => return Ok(Some(outcome)),
      Err(e) => e.to_string(),
    };
    warn!("{failure}");
    let question = format!(
      "Configure {} as {}/{} manually and continue?",
      config.network.dante_interface, config.network.dante_ip, config.network.dante_cidr
    );
    if confirm.confirm(&question) {
      Ok(None)
    } else {
      Err(Error::NetworkProvision(failure))
    }
  }

  fn disable_time_sync(&self) -> Vec<Error> {
    CONFLICTING_TIME_SYNC
      .iter()
      .filter_map(|unit| self.manager.disable_now(unit).err())
      .inspect(|e| warn!("{e}"))
      .collect()
  }

  /// Runs the whole pipeline. Only fatal error classes and an operator abort
  /// end it early; everything else is collected in the report.
  pub fn provision(&self, inputs: &RawInputs, defaults: &Defaults, confirm: &dyn Confirm) -> Result<ProvisionReport> {
    let checked = self.facts.check();
    report_stage("host preconditions", &checked);
    checked?;

    let resolved = resolve(inputs, defaults);
    report_stage("configuration", &resolved);
    let config = resolved?;
    let saved = config.save(&self.layout.installation_config());
    report_stage("configuration saved", &saved);
    saved?;

    let binaries = self.verify_binaries(&config);
    report_stage("external binaries", &binaries);
    binaries?;

    let ctl = self.install_ctl();
    report_stage("management tool", &ctl);
    ctl?;

    let network = self.provision_network(&config, confirm);
    report_stage("static network", &network);
    let network = network?;

    let mut warnings = vec![];
    let firewall = FirewallProvisioner::new(self.layout, self.runner).apply_allow_list(&config.network.dante_interface, &dante_allow_list());
    report_stage("firewall", &firewall);
    let firewall = firewall.map_err(|e| warnings.push(e)).ok();

    let time_sync = self.disable_time_sync();
    report_stage::<(), _>("conflicting time sync disabled", &match time_sync.len() {
      0 => Ok(()),
      n => Err(format!("{n} unit(s) could not be disabled")),
    });
    warnings.extend(time_sync);

    let ptp = write_ptp_config(&self.layout.ptp_config(), &config.network.dante_interface);
    report_stage("PTP configuration", &ptp);
    ptp?;

    let supervisor = self.supervisor(config);
    let units = supervisor.install_units();
    report_stage("service units", &units);
    let units = units?;

    let enabled = supervisor.enable_all().into_result();
    report_stage("services enabled", &enabled);
    if let Err(e) = enabled {
      warnings.push(e);
    }

    let routes = self.manager.start(ServiceKind::Routes.unit_name());
    report_stage("multicast routing", &routes);
    if let Err(e) = routes {
      warnings.push(e);
    }

    Ok(ProvisionReport { config: supervisor.config().clone(), network, firewall, units, warnings })
  }

  /// Body of the routing unit.
  pub fn converge_routes(&self, config: &InstallationConfig) -> RouteReport {
    self.network().install_multicast_route(&config.network.dante_interface, &config.network.internet_interface)
  }

  /// TCP and UDP listening sockets held by the managed processes, as `ss`
  /// prints them.
  pub fn listening_sockets(&self, config: &InstallationConfig) -> Vec<String> {
    let mut processes = vec!["statime", "inferno2pipe", "inferno_ctl"];
    if config.srt.enabled {
      processes.push("ffmpeg");
    }
    match self.runner.run(&HostCommand::new("ss", ["-lntup"])) {
      Ok(out) if out.success => out
        .stdout
        .lines()
        .filter(|line| processes.iter().any(|p| line.contains(&format!("\"{p}\""))))
        .map(str::to_owned)
        .collect(),
      Ok(out) => {
        warn!("ss failed: {}", out.detail());
        vec![]
      }
      Err(e) => {
        warn!("cannot run ss: {e}");
        vec![]
      }
    }
  }

  pub async fn verify(&self, config: &InstallationConfig) -> VerifyReport {
    let network = self.network();
    let dante_interface = config.network.dante_interface.clone();
    VerifyReport {
      dante_address: network.interface_address(&dante_interface),
      multicast_route: network.multicast_route_present(&dante_interface),
      sockets: self.listening_sockets(config),
      health: self.supervisor(config.clone()).health_check().await,
      dante_interface,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::{CommandOutput, FakeRunner, RecordingPause};
  use crate::systemd::Systemd;
  use tempfile::TempDir;

  struct Decline;
  impl Confirm for Decline {
    fn confirm(&self, _: &str) -> bool {
      false
    }
  }

  fn root() -> HostFacts {
    HostFacts { euid: 0, arch: "aarch64".to_owned() }
  }

  fn host(binaries: &[&str], dhcpcd: bool) -> (TempDir, Layout) {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::with_sysroot(dir.path());
    fs::create_dir_all(layout.bin_dir()).unwrap();
    for b in binaries {
      fs::write(layout.bin_dir().join(b), "").unwrap();
    }
    if dhcpcd {
      fs::create_dir_all(layout.host_path("/etc")).unwrap();
      fs::write(layout.dhcpcd_conf(), "hostname\n").unwrap();
    }
    (dir, layout)
  }

  fn inputs(srt: &str) -> RawInputs {
    RawInputs {
      dante_interface: Some("eth0".into()),
      internet_interface: Some("wlan0".into()),
      dante_ip: Some("169.254.0.123".into()),
      dante_netmask: Some("255.255.0.0".into()),
      srt_enabled: Some(srt.into()),
      srt_host: Some("127.0.0.1".into()),
      srt_port: Some("10000".into()),
      ..Default::default()
    }
  }

  #[test]
  fn preconditions() {
    assert!(root().check().is_ok());
    assert!(matches!(HostFacts { euid: 1000, ..root() }.check(), Err(Error::Precondition(_))));
    assert!(matches!(HostFacts { arch: "riscv64".into(), ..root() }.check(), Err(Error::Precondition(_))));
  }

  #[test]
  fn full_pipeline_without_streaming() {
    let (_dir, layout) = host(&["statime", "inferno2pipe"], true);
    let runner = FakeRunner::default();
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

    let report = ctl.provision(&inputs("no"), &Defaults::default(), &AssumeYes).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.units.len(), 4);
    assert!(!layout.unit_file("inferno-srt").exists());
    assert_eq!(ctl.load_config().unwrap(), report.config);
    assert!(fs::read_to_string(layout.ptp_config()).unwrap().contains("interface = \"eth0\""));

    let lines = runner.lines();
    let pos = |needle: &str| lines.iter().position(|l| l == needle).unwrap_or_else(|| panic!("{needle} not run"));
    assert!(pos("systemctl disable --now chrony.service") < pos("systemctl daemon-reload"));
    assert!(pos("systemctl enable statime.service") < pos("systemctl start inferno-routes.service"));
    assert!(!lines.iter().any(|l| l.starts_with("systemctl start inferno.service")));
  }

  #[test]
  fn missing_encoder_aborts_before_units() {
    let (_dir, layout) = host(&["statime", "inferno2pipe"], true);
    let runner = FakeRunner::default();
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

    let err = ctl.provision(&inputs("yes"), &Defaults::default(), &AssumeYes).unwrap_err();
    assert!(matches!(&err, Error::Download { binary, .. } if binary == "ffmpeg"));
    assert!(err.is_fatal());
    assert!(!layout.unit_dir().exists());
    assert!(runner.history().is_empty());
  }

  #[test]
  fn invalid_input_persists_nothing() {
    let (_dir, layout) = host(&["statime", "inferno2pipe"], true);
    let runner = FakeRunner::default();
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

    let bad = RawInputs { rx_latency_ms: Some("0".into()), ..inputs("no") };
    assert!(matches!(ctl.provision(&bad, &Defaults::default(), &AssumeYes), Err(Error::Validation { .. })));
    assert!(!layout.installation_config().exists());
  }

  #[test]
  fn unsupported_network_needs_operator_consent() {
    let (_dir, layout) = host(&["statime", "inferno2pipe"], false);
    let runner = FakeRunner::default();
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

    let err = ctl.provision(&inputs("no"), &Defaults::default(), &Decline).unwrap_err();
    assert!(matches!(err, Error::NetworkProvision(_)));
    assert!(!err.is_fatal());
    assert!(!layout.unit_dir().exists());

    let report = ctl.provision(&inputs("no"), &Defaults::default(), &AssumeYes).unwrap();
    assert_eq!(report.network, None);
    assert_eq!(report.units.len(), 4);
  }

  #[test]
  fn absent_time_sync_daemons_are_tolerated() {
    let (_dir, layout) = host(&["statime", "inferno2pipe", "ffmpeg"], true);
    let runner = FakeRunner::new(|cmd| {
      Ok(if cmd.args.first().map(String::as_str) == Some("disable") {
        CommandOutput::failed(format!("Failed to disable unit: Unit file {} does not exist.", cmd.args[2]))
      } else {
        CommandOutput::ok("")
      })
    });
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

    let report = ctl.provision(&inputs("yes"), &Defaults::default(), &AssumeYes).unwrap();
    assert!(report.warnings.is_empty());
    assert_eq!(report.units.len(), 5);
    let srt = fs::read_to_string(layout.unit_file("inferno-srt")).unwrap();
    assert!(srt.contains("srt://127.0.0.1:10000?mode=caller&latency=120000"));
  }

  #[test]
  fn management_tool_copied_into_install_root() {
    let (dir, layout) = host(&["statime", "inferno2pipe"], true);
    let source = dir.path().join("build-output");
    fs::write(&source, "binary").unwrap();
    let runner = FakeRunner::default();
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root()).with_ctl_source(&source);

    ctl.provision(&inputs("no"), &Defaults::default(), &AssumeYes).unwrap();
    assert_eq!(fs::read_to_string(layout.ctl_binary()).unwrap(), "binary");
    assert_eq!(fs::metadata(layout.ctl_binary()).unwrap().permissions().mode() & 0o777, 0o755);
  }

  #[test]
  fn listening_sockets_filtered_to_managed_processes() {
    let (_dir, layout) = host(&[], false);
    let runner = FakeRunner::new(|cmd| {
      if cmd.args != ["-lntup"] {
        return Ok(CommandOutput::failed("unexpected arguments"));
      }
      Ok(CommandOutput::ok(
        "udp UNCONN 0 0 0.0.0.0:319 0.0.0.0:* users:((\"statime\",pid=10,fd=3))\n\
         udp UNCONN 0 0 0.0.0.0:53 0.0.0.0:* users:((\"dnsmasq\",pid=11,fd=4))\n\
         udp UNCONN 0 0 169.254.0.123:4455 0.0.0.0:* users:((\"inferno2pipe\",pid=12,fd=5))\n\
         tcp LISTEN 0 1024 169.254.0.123:8080 0.0.0.0:* users:((\"inferno_ctl\",pid=13,fd=6))\n\
         tcp LISTEN 0 128 0.0.0.0:22 0.0.0.0:* users:((\"sshd\",pid=14,fd=3))\n",
      ))
    });
    let systemd = Systemd::new(&runner);
    let pause = RecordingPause::default();
    let ctl = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());
    let config = resolve(&inputs("no"), &Defaults::default()).unwrap();
    let sockets = ctl.listening_sockets(&config);
    assert_eq!(sockets.len(), 3);
    assert!(sockets.iter().any(|s| s.contains(":8080") && s.contains("inferno_ctl")));
    assert!(sockets.iter().all(|s| !s.contains("dnsmasq") && !s.contains("sshd")));
    assert_eq!(runner.lines(), ["ss -lntup"]);
  }

  #[test]
  fn verify_is_healthy_only_when_every_check_passes() {
    let healthy = VerifyReport {
      dante_interface: "eth0".into(),
      dante_address: Some("169.254.0.123/16".into()),
      multicast_route: true,
      sockets: vec![],
      health: Health::Healthy,
    };
    assert!(healthy.is_healthy());
    assert!(!VerifyReport { multicast_route: false, ..healthy.clone() }.is_healthy());
    assert!(!VerifyReport { dante_address: None, ..healthy.clone() }.is_healthy());
    assert!(!VerifyReport { health: Health::Unhealthy("connection refused".into()), ..healthy }.is_healthy());
  }
}
