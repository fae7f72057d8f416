//! Static addressing of the Dante interface and multicast isolation.

use std::fs;
use std::time::Duration;

use crate::common::*;
use crate::config::InstallationConfig;
use crate::error::{Error, Result};
use crate::host::{HostCommand, HostRunner, Pause};
use crate::layout::Layout;

pub const MULTICAST_AGGREGATE: &str = "224.0.0.0/4";
/// Upper bound on stale multicast routes removed in one pass.
const MAX_ROUTE_PURGE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
  /// `/etc/dhcpcd.conf`, one block per interface.
  DhcpcdConf,
  /// `/etc/network/interfaces.d/<iface>`.
  InterfacesDropIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
  Applied(Mechanism),
  AlreadyApplied,
  Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
  pub attempts: u32,
  pub interval: Duration,
}

impl Default for WaitPolicy {
  fn default() -> Self {
    Self { attempts: 30, interval: Duration::from_secs(1) }
  }
}

/// What happened while converging the multicast route. Nothing in here is
/// fatal; the caller decides whether to surface it.
#[derive(Debug, Default)]
pub struct RouteReport {
  pub wait_iterations: u32,
  pub timeout: Option<Error>,
  pub removed_routes: usize,
  pub errors: Vec<Error>,
  pub route_table: String,
}

impl RouteReport {
  pub fn is_clean(&self) -> bool {
    self.timeout.is_none() && self.errors.is_empty()
  }
}

pub fn marker(interface: &str) -> String {
  format!("# inferno: dante interface {interface}")
}

/// `text` with the block that starts at `marker` (up to the next blank line)
/// replaced by `block`, or `None` when there is no such block.
fn replace_marked_block(text: &str, marker: &str, block: &str) -> Option<String> {
  let lines: Vec<&str> = text.lines().collect();
  let start = lines.iter().position(|l| l.trim() == marker)?;
  let end = lines[start..].iter().position(|l| l.trim().is_empty()).map_or(lines.len(), |i| start + i);
  let mut out = String::new();
  for line in &lines[..start] {
    out.push_str(line);
    out.push('\n');
  }
  out.push_str(block);
  for line in &lines[end..] {
    out.push_str(line);
    out.push('\n');
  }
  Some(out)
}

pub struct NetworkProvisioner<'a> {
  layout: &'a Layout,
  runner: &'a dyn HostRunner,
  pause: &'a dyn Pause,
  wait: WaitPolicy,
}

impl<'a> NetworkProvisioner<'a> {
  pub fn new(layout: &'a Layout, runner: &'a dyn HostRunner, pause: &'a dyn Pause) -> Self {
    Self { layout, runner, pause, wait: WaitPolicy::default() }
  }

  pub fn detect_mechanism(&self) -> Option<Mechanism> {
    if self.layout.dhcpcd_conf().is_file() {
      Some(Mechanism::DhcpcdConf)
    } else if self.layout.interfaces_dropin_dir().is_dir() {
      Some(Mechanism::InterfacesDropIn)
    } else {
      None
    }
  }

  pub fn apply_static_network(&self, config: &InstallationConfig) -> Result<ApplyOutcome> {
    let net = &config.network;
    let marker = marker(&net.dante_interface);
    match self.detect_mechanism() {
      Some(Mechanism::DhcpcdConf) => {
        let path = self.layout.dhcpcd_conf();
        let current = fs::read_to_string(&path)?;
        let block = format!(
          "{marker}\ninterface {}\nstatic ip_address={}/{}\nnogateway\n",
          net.dante_interface, net.dante_ip, net.dante_cidr
        );
        let updated = match replace_marked_block(&current, &marker, &block) {
          Some(updated) if updated == current => {
            info!("{} already configures {}", path.display(), net.dante_interface);
            return Ok(ApplyOutcome::AlreadyApplied);
          }
          Some(updated) => updated,
          None => {
            let mut updated = current;
            if !updated.is_empty() && !updated.ends_with('\n') {
              updated.push('\n');
            }
            updated.push('\n');
            updated.push_str(&block);
            updated
          }
        };
        fs::write(&path, updated)?;
        info!("static address {}/{} set in {}", net.dante_ip, net.dante_cidr, path.display());
        Ok(ApplyOutcome::Applied(Mechanism::DhcpcdConf))
      }
      Some(Mechanism::InterfacesDropIn) => {
        let path = self.layout.interfaces_dropin_dir().join(&net.dante_interface);
        let content = format!(
          "{marker}\nauto {iface}\niface {iface} inet static\n    address {}\n    netmask {}\n",
          net.dante_ip,
          net.dante_netmask,
          iface = net.dante_interface
        );
        if fs::read_to_string(&path).map(|c| c == content).unwrap_or(false) {
          return Ok(ApplyOutcome::AlreadyApplied);
        }
        fs::write(&path, content)?;
        info!("wrote {}", path.display());
        Ok(ApplyOutcome::Applied(Mechanism::InterfacesDropIn))
      }
      None => {
        warn!("neither dhcpcd nor ifupdown drop-ins found; configure {} manually", net.dante_interface);
        Ok(ApplyOutcome::Unsupported)
      }
    }
  }

  fn ip(&self, args: &[&str]) -> Result<String> {
    let cmd = HostCommand::new("ip", args.iter().copied());
    let out = self
      .runner
      .run(&cmd)
      .map_err(|e| Error::HostCommand { command: cmd.to_string(), detail: e.to_string() })?;
    if out.success {
      Ok(out.stdout)
    } else {
      Err(Error::HostCommand { command: cmd.to_string(), detail: out.detail() })
    }
  }

  pub fn interface_exists(&self, interface: &str) -> bool {
    self.ip(&["link", "show", "dev", interface]).is_ok()
  }

  /// IPv4 address with prefix as reported by the kernel, if any.
  pub fn interface_address(&self, interface: &str) -> Option<String> {
    let out = self.ip(&["-4", "-o", "addr", "show", "dev", interface]).ok()?;
    let mut words = out.split_whitespace();
    words.find(|w| *w == "inet")?;
    words.next().map(str::to_owned)
  }

  pub fn multicast_route_present(&self, dante_if: &str) -> bool {
    self
      .ip(&["route", "show", MULTICAST_AGGREGATE])
      .map(|table| table.lines().any(|l| l.split_whitespace().collect::<Vec<_>>().windows(2).any(|w| w == ["dev", dante_if])))
      .unwrap_or(false)
  }

  fn wait_for_interfaces(&self, interfaces: &[&str], report: &mut RouteReport) {
    for attempt in 1..=self.wait.attempts {
      let missing: Vec<&str> = interfaces.iter().copied().filter(|i| !self.interface_exists(i)).collect();
      if missing.is_empty() {
        return;
      }
      report.wait_iterations = attempt;
      info!("waiting for interfaces {missing:?} ({attempt}/{})", self.wait.attempts);
      if attempt == self.wait.attempts {
        let err = Error::RouteTimeout { interfaces: missing.iter().map(|s| s.to_string()).collect() };
        warn!("{err}; installing route anyway");
        report.timeout = Some(err);
        return;
      }
      self.pause.pause(self.wait.interval);
    }
  }

  /// Converges the host to exactly one multicast aggregate route via
  /// `dante_if`, multicast enabled there and disabled on `internet_if`.
  pub fn install_multicast_route(&self, dante_if: &str, internet_if: &str) -> RouteReport {
    let mut report = RouteReport::default();
    self.wait_for_interfaces(&[dante_if, internet_if], &mut report);

    for _ in 0..MAX_ROUTE_PURGE {
      match self.ip(&["route", "del", MULTICAST_AGGREGATE]) {
        Ok(_) => report.removed_routes += 1,
        Err(Error::HostCommand { detail, .. }) if detail.contains("No such process") => break,
        Err(e) => {
          warn!("removing old multicast route: {e}");
          report.errors.push(e);
          break;
        }
      }
    }
    if report.removed_routes > 0 {
      debug!("removed {} previous multicast route(s)", report.removed_routes);
    }

    let steps: [&[&str]; 3] = [
      &["route", "add", MULTICAST_AGGREGATE, "dev", dante_if],
      &["link", "set", "dev", dante_if, "multicast", "on"],
      &["link", "set", "dev", internet_if, "multicast", "off"],
    ];
    for step in steps {
      if let Err(e) = self.ip(step) {
        warn!("{e}");
        report.errors.push(e);
      }
    }

    report.route_table = self.ip(&["route", "show", MULTICAST_AGGREGATE]).unwrap_or_default();
    info!("multicast routes now: {}", report.route_table.trim());
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{resolve, Defaults, RawInputs};
  use crate::host::{CommandOutput, FakeRunner, RecordingPause};
  use std::collections::{HashMap, HashSet};
  use std::sync::{Arc, Mutex};

  fn config() -> InstallationConfig {
    let raw = RawInputs {
      dante_interface: Some("eth0".into()),
      dante_ip: Some("169.254.0.123".into()),
      dante_netmask: Some("/24".into()),
      ..Default::default()
    };
    resolve(&raw, &Defaults::default()).unwrap()
  }

  #[derive(Default)]
  struct SimState {
    links: HashSet<String>,
    routes: Vec<String>,
    multicast: HashMap<String, bool>,
  }

  /// Just enough of `ip` semantics to check convergence.
  fn sim_runner(state: Arc<Mutex<SimState>>) -> FakeRunner {
    FakeRunner::new(move |cmd| {
      let mut s = state.lock().unwrap();
      let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
      Ok(match args.as_slice() {
        ["link", "show", "dev", iface] if s.links.contains(*iface) => CommandOutput::ok(format!("2: {iface}: <UP>")),
        ["link", "show", "dev", iface] => CommandOutput::failed(format!("Device \"{iface}\" does not exist.")),
        ["route", "del", _] => {
          if s.routes.is_empty() {
            CommandOutput::failed("RTNETLINK answers: No such process")
          } else {
            s.routes.remove(0);
            CommandOutput::ok("")
          }
        }
        ["route", "add", _, "dev", iface] => {
          if s.routes.iter().any(|r| r.as_str() == *iface) {
            CommandOutput::failed("RTNETLINK answers: File exists")
          } else {
            s.routes.push(iface.to_string());
            CommandOutput::ok("")
          }
        }
        ["link", "set", "dev", iface, "multicast", flag] => {
          s.multicast.insert(iface.to_string(), *flag == "on");
          CommandOutput::ok("")
        }
        ["route", "show", _] => CommandOutput::ok(s.routes.iter().map(|d| format!("multicast 224.0.0.0/4 dev {d} scope link\n")).collect::<String>()),
        _ => CommandOutput::failed("unexpected"),
      })
    })
  }

  fn links(names: &[&str]) -> Arc<Mutex<SimState>> {
    let state = SimState { links: names.iter().map(|s| s.to_string()).collect(), ..Default::default() };
    Arc::new(Mutex::new(state))
  }

  #[test]
  fn dhcpcd_block_is_added_once() {
    let root = tempfile::tempdir().unwrap();
    let layout = Layout::with_sysroot(root.path());
    fs::create_dir_all(layout.host_path("/etc")).unwrap();
    fs::write(layout.dhcpcd_conf(), "hostname\nclientid").unwrap();
    let runner = FakeRunner::default();
    let pause = RecordingPause::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);

    assert_eq!(net.apply_static_network(&config()).unwrap(), ApplyOutcome::Applied(Mechanism::DhcpcdConf));
    assert_eq!(net.apply_static_network(&config()).unwrap(), ApplyOutcome::AlreadyApplied);

    let text = fs::read_to_string(layout.dhcpcd_conf()).unwrap();
    assert_eq!(text.matches(&marker("eth0")).count(), 1);
    assert!(text.starts_with("hostname\nclientid\n"));
    assert!(text.contains("static ip_address=169.254.0.123/24"));
  }

  #[test]
  fn dhcpcd_block_follows_a_changed_address() {
    let root = tempfile::tempdir().unwrap();
    let layout = Layout::with_sysroot(root.path());
    fs::create_dir_all(layout.host_path("/etc")).unwrap();
    fs::write(layout.dhcpcd_conf(), "hostname\n").unwrap();
    let runner = FakeRunner::default();
    let pause = RecordingPause::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);

    net.apply_static_network(&config()).unwrap();
    fs::write(layout.dhcpcd_conf(), fs::read_to_string(layout.dhcpcd_conf()).unwrap() + "\ninterface wlan0\nmetric 300\n").unwrap();

    let mut moved = config();
    moved.network.dante_ip = "169.254.7.7".parse().unwrap();
    assert_eq!(net.apply_static_network(&moved).unwrap(), ApplyOutcome::Applied(Mechanism::DhcpcdConf));
    assert_eq!(net.apply_static_network(&moved).unwrap(), ApplyOutcome::AlreadyApplied);

    let text = fs::read_to_string(layout.dhcpcd_conf()).unwrap();
    assert_eq!(text.matches(&marker("eth0")).count(), 1);
    assert!(text.contains("static ip_address=169.254.7.7/24"));
    assert!(!text.contains("169.254.0.123"));
    assert!(text.starts_with("hostname\n"));
    assert!(text.ends_with("\ninterface wlan0\nmetric 300\n"));
  }

  #[test]
  fn unrelated_route_errors_do_not_end_the_purge_silently() {
    let runner = FakeRunner::new(|cmd| {
      Ok(match cmd.args.as_slice() {
        [a, b, ..] if a == "route" && b == "del" => CommandOutput::failed("Cannot find device \"eth9\": No such device"),
        _ => CommandOutput::ok(""),
      })
    });
    let pause = RecordingPause::default();
    let layout = Layout::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);
    let report = net.install_multicast_route("eth0", "wlan0");
    assert_eq!(report.errors.len(), 1);
    assert!(!report.is_clean());
  }

  #[test]
  fn dropin_is_written_and_then_left_alone() {
    let root = tempfile::tempdir().unwrap();
    let layout = Layout::with_sysroot(root.path());
    fs::create_dir_all(layout.interfaces_dropin_dir()).unwrap();
    let runner = FakeRunner::default();
    let pause = RecordingPause::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);

    assert_eq!(net.apply_static_network(&config()).unwrap(), ApplyOutcome::Applied(Mechanism::InterfacesDropIn));
    assert_eq!(net.apply_static_network(&config()).unwrap(), ApplyOutcome::AlreadyApplied);
    let text = fs::read_to_string(layout.interfaces_dropin_dir().join("eth0")).unwrap();
    assert!(text.contains("netmask 255.255.255.0"));
  }

  #[test]
  fn unknown_network_stack_is_unsupported() {
    let root = tempfile::tempdir().unwrap();
    let layout = Layout::with_sysroot(root.path());
    let runner = FakeRunner::default();
    let pause = RecordingPause::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);
    assert_eq!(net.apply_static_network(&config()).unwrap(), ApplyOutcome::Unsupported);
  }

  #[test]
  fn route_install_converges_from_any_start() {
    let state = links(&["eth0", "wlan0"]);
    {
      let mut s = state.lock().unwrap();
      s.routes = vec!["wlan0".into(), "eth0".into()];
      s.multicast.insert("wlan0".into(), true);
      s.multicast.insert("eth0".into(), false);
    }
    let runner = sim_runner(state.clone());
    let pause = RecordingPause::default();
    let layout = Layout::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);

    for _ in 0..3 {
      let report = net.install_multicast_route("eth0", "wlan0");
      assert!(report.is_clean(), "{report:?}");
      let s = state.lock().unwrap();
      assert_eq!(s.routes, vec!["eth0".to_owned()]);
      assert_eq!(s.multicast.get("eth0"), Some(&true));
      assert_eq!(s.multicast.get("wlan0"), Some(&false));
    }
    assert!(net.multicast_route_present("eth0"));
    assert!(!net.multicast_route_present("wlan0"));
    assert_eq!(pause.count(), 0);
  }

  #[test]
  fn missing_interface_times_out_and_still_installs() {
    let state = links(&["eth0"]);
    let runner = sim_runner(state.clone());
    let pause = RecordingPause::default();
    let layout = Layout::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);

    let report = net.install_multicast_route("eth0", "wlan0");
    assert!(matches!(report.timeout, Some(Error::RouteTimeout { ref interfaces }) if interfaces == &["wlan0".to_owned()]));
    assert_eq!(report.wait_iterations, 30);
    assert_eq!(pause.count(), 29);
    assert_eq!(pause.total(), Duration::from_secs(29));
    assert_eq!(state.lock().unwrap().routes, vec!["eth0".to_owned()]);
  }

  #[test]
  fn interface_address_is_parsed() {
    let runner = FakeRunner::new(|_| {
      Ok(CommandOutput::ok("2: eth0    inet 169.254.0.123/24 brd 169.254.0.255 scope global eth0\n"))
    });
    let pause = RecordingPause::default();
    let layout = Layout::default();
    let net = NetworkProvisioner::new(&layout, &runner, &pause);
    assert_eq!(net.interface_address("eth0").as_deref(), Some("169.254.0.123/24"));
  }
}
