//! Allow-list for Dante traffic on the Dante interface only.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::common::*;
use crate::error::{Error, Result};
use crate::host::{HostCommand, HostRunner};
use crate::layout::Layout;

/// Dante control/audio, mDNS and PTP event/general ports.
pub const DANTE_UDP_PORTS: [u16; 7] = [4455, 8700, 4400, 8800, 5353, 319, 320];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
  Input,
  Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  Udp(u16),
  Igmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowRule {
  pub chain: Chain,
  pub protocol: Protocol,
}

impl AllowRule {
  fn spec(&self, interface: &str) -> Vec<String> {
    let (chain, dir) = match self.chain {
      Chain::Input => ("INPUT", "-i"),
      Chain::Output => ("OUTPUT", "-o"),
    };
    let mut args = vec![chain.to_owned(), dir.to_owned(), interface.to_owned()];
    match self.protocol {
      Protocol::Udp(port) => args.extend(["-p".to_owned(), "udp".to_owned(), "--dport".to_owned(), port.to_string()]),
      Protocol::Igmp => args.extend(["-p".to_owned(), "igmp".to_owned()]),
    }
    args.extend(["-j".to_owned(), "ACCEPT".to_owned()]);
    args
  }
}

impl fmt::Display for AllowRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.protocol {
      Protocol::Udp(port) => write!(f, "{port}/udp"),
      Protocol::Igmp => write!(f, "igmp {:?}", self.chain),
    }
  }
}

pub fn dante_allow_list() -> Vec<AllowRule> {
  DANTE_UDP_PORTS
    .iter()
    .map(|&port| AllowRule { chain: Chain::Input, protocol: Protocol::Udp(port) })
    .chain([
      AllowRule { chain: Chain::Input, protocol: Protocol::Igmp },
      AllowRule { chain: Chain::Output, protocol: Protocol::Igmp },
    ])
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
  NetfilterPersistent,
  RulesFile(PathBuf),
  Unavailable,
}

#[derive(Debug)]
pub struct FirewallReport {
  pub added: usize,
  pub already_present: usize,
  pub persistence: Persistence,
}

pub struct FirewallProvisioner<'a> {
  layout: &'a Layout,
  runner: &'a dyn HostRunner,
}

impl<'a> FirewallProvisioner<'a> {
  pub fn new(layout: &'a Layout, runner: &'a dyn HostRunner) -> Self {
    Self { layout, runner }
  }

  fn iptables(&self, op: &str, spec: &[String]) -> Result<bool> {
    let cmd = HostCommand::new("iptables", std::iter::once(op.to_owned()).chain(spec.iter().cloned()));
    let out = self
      .runner
      .run(&cmd)
      .map_err(|e| Error::HostCommand { command: cmd.to_string(), detail: e.to_string() })?;
    Ok(out.success)
  }

  pub fn apply_allow_list(&self, dante_if: &str, rules: &[AllowRule]) -> Result<FirewallReport> {
    let mut added = 0;
    let mut already_present = 0;
    for rule in rules {
      let spec = rule.spec(dante_if);
      if self.iptables("-C", &spec)? {
        already_present += 1;
        continue;
      }
      if !self.iptables("-A", &spec)? {
        return Err(Error::HostCommand { command: format!("iptables -A {}", spec.join(" ")), detail: "rule rejected".to_owned() });
      }
      debug!("allowed {rule} on {dante_if}");
      added += 1;
    }
    info!("firewall: {added} rule(s) added, {already_present} already present on {dante_if}");
    let persistence = self.persist();
    Ok(FirewallReport { added, already_present, persistence })
  }

  /// Saves the running rule set for the next boot with whatever tool the host
  /// has. Missing tooling is only a warning.
  pub fn persist(&self) -> Persistence {
    if self.runner.has_program("netfilter-persistent") {
      match self.runner.run(&HostCommand::new("netfilter-persistent", ["save"])) {
        Ok(out) if out.success => return Persistence::NetfilterPersistent,
        Ok(out) => warn!("netfilter-persistent save failed: {}", out.detail()),
        Err(e) => warn!("netfilter-persistent save failed: {e}"),
      }
    }
    if self.runner.has_program("iptables-save") {
      match self.runner.run(&HostCommand::new("iptables-save", Vec::<String>::new())) {
        Ok(out) if out.success => {
          let path = self.layout.iptables_rules();
          let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&path, out.stdout));
          match written {
            Ok(()) => return Persistence::RulesFile(path),
            Err(e) => warn!("cannot write {}: {e}", path.display()),
          }
        }
        Ok(out) => warn!("iptables-save failed: {}", out.detail()),
        Err(e) => warn!("iptables-save failed: {e}"),
      }
    }
    warn!("no firewall persistence available; rules will not survive a reboot");
    Persistence::Unavailable
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::{CommandOutput, FakeRunner};
  use std::collections::HashSet;
  use std::sync::{Arc, Mutex};

  fn iptables_sim(tools: &'static [&'static str]) -> (FakeRunner, Arc<Mutex<HashSet<String>>>) {
    let table = Arc::new(Mutex::new(HashSet::new()));
    let t = table.clone();
    let runner = FakeRunner::new(move |cmd| {
      let mut table = t.lock().unwrap();
      Ok(match (cmd.program.as_str(), cmd.args.first().map(String::as_str)) {
        ("iptables", Some("-C")) if table.contains(&cmd.args[1..].join(" ")) => CommandOutput::ok(""),
        ("iptables", Some("-C")) => CommandOutput::failed("Bad rule"),
        ("iptables", Some("-A")) => {
          table.insert(cmd.args[1..].join(" "));
          CommandOutput::ok("")
        }
        ("sh", _) => {
          let wanted = cmd.args[1].trim_start_matches("command -v ");
          if tools.iter().any(|t| *t == wanted) { CommandOutput::ok(wanted) } else { CommandOutput::failed("") }
        }
        ("iptables-save", _) => CommandOutput::ok("*filter\nCOMMIT\n"),
        _ => CommandOutput::ok(""),
      })
    });
    (runner, table)
  }

  #[test]
  fn allow_list_covers_dante_ports_and_igmp() {
    let rules = dante_allow_list();
    assert_eq!(rules.len(), 9);
    assert!(rules.contains(&AllowRule { chain: Chain::Output, protocol: Protocol::Igmp }));
    assert_eq!(
      rules[0].spec("eth0"),
      ["INPUT", "-i", "eth0", "-p", "udp", "--dport", "4455", "-j", "ACCEPT"]
    );
  }

  #[test]
  fn rules_are_only_added_once() {
    let (runner, table) = iptables_sim(&["netfilter-persistent"]);
    let layout = Layout::default();
    let fw = FirewallProvisioner::new(&layout, &runner);
    let first = fw.apply_allow_list("eth0", &dante_allow_list()).unwrap();
    assert_eq!((first.added, first.already_present), (9, 0));
    assert_eq!(first.persistence, Persistence::NetfilterPersistent);
    let second = fw.apply_allow_list("eth0", &dante_allow_list()).unwrap();
    assert_eq!((second.added, second.already_present), (0, 9));
    assert_eq!(table.lock().unwrap().len(), 9);
    assert!(table.lock().unwrap().iter().all(|r| r.contains("eth0")));
  }

  #[test]
  fn falls_back_to_rules_file_then_to_nothing() {
    let root = tempfile::tempdir().unwrap();
    let layout = Layout::with_sysroot(root.path());
    let (runner, _) = iptables_sim(&["iptables-save"]);
    let fw = FirewallProvisioner::new(&layout, &runner);
    assert_eq!(fw.persist(), Persistence::RulesFile(layout.iptables_rules()));
    assert!(fs::read_to_string(layout.iptables_rules()).unwrap().contains("COMMIT"));

    let (runner, _) = iptables_sim(&[]);
    let fw = FirewallProvisioner::new(&layout, &runner);
    assert_eq!(fw.persist(), Persistence::Unavailable);
  }
}
