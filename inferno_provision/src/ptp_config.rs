//! The statime configuration artifact.
//!
//! Only the port interface and the virtual clock base are owned by the
//! provisioner. Every other key, including operator edits, is carried over
//! when the file is patched again.

use std::fs;
use std::path::Path;

use toml::{Table, Value};

use crate::common::*;
use crate::error::{Error, Result};

pub const CLOCK_BASE_KEY: &str = "virtual-system-clock-base";
pub const CLOCK_BASE: &str = "monotonic_raw";
pub const INTERFACE_KEY: &str = "interface";

pub const DEFAULT_PTP_CONFIG: &str = r#"loglevel = "info"
sdo-id = 0
domain = 0
priority1 = 251
virtual-system-clock = true
usrvclock-export = true

[[port]]
interface = "eth0"
network-mode = "ipv4"
hardware-clock = "none"
protocol-version = "PTPv1"
"#;

pub fn patch_ptp_config(text: &str, dante_if: &str) -> std::result::Result<String, toml::de::Error> {
  let mut table: Table = text.parse()?;
  table.insert(CLOCK_BASE_KEY.to_owned(), Value::String(CLOCK_BASE.to_owned()));

  let ports = table
    .entry("port")
    .or_insert_with(|| Value::Array(vec![]));
  if !matches!(ports, Value::Array(_)) {
    *ports = Value::Array(vec![]);
  }
  if let Value::Array(ports) = ports {
    if ports.is_empty() {
      ports.push(Value::Table(Table::new()));
    }
    for port in ports.iter_mut() {
      if let Value::Table(port) = port {
        port.insert(INTERFACE_KEY.to_owned(), Value::String(dante_if.to_owned()));
      }
    }
  }
  // re-serializing a parsed table cannot fail
  Ok(toml::to_string(&table).unwrap_or_default())
}

/// Writes the patched artifact, starting from the shipped template when it
/// does not exist yet. Returns whether the file changed.
pub fn write_ptp_config(path: &Path, dante_if: &str) -> Result<bool> {
  let current = match fs::read_to_string(path) {
    Ok(text) => Some(text),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
    Err(e) => return Err(e.into()),
  };
  let base = current.as_deref().unwrap_or(DEFAULT_PTP_CONFIG);
  let patched = patch_ptp_config(base, dante_if).map_err(|source| Error::ConfigParse { path: path.to_owned(), source })?;
  if current.as_deref() == Some(patched.as_str()) {
    debug!("{} already up to date", path.display());
    return Ok(false);
  }
  if let Some(dir) = path.parent() {
    fs::create_dir_all(dir)?;
  }
  fs::write(path, patched)?;
  info!("PTP configuration bound to {dante_if} in {}", path.display());
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn patches_interface_and_clock_base_only() {
    let text = "loglevel = \"debug\"\npriority1 = 100\n\n[[port]]\ninterface = \"wlan0\"\nprotocol-version = \"PTPv1\"\n";
    let patched: Table = patch_ptp_config(text, "eth1").unwrap().parse().unwrap();
    assert_eq!(patched["loglevel"].as_str(), Some("debug"));
    assert_eq!(patched["priority1"].as_integer(), Some(100));
    assert_eq!(patched[CLOCK_BASE_KEY].as_str(), Some(CLOCK_BASE));
    let port = &patched["port"].as_array().unwrap()[0];
    assert_eq!(port["interface"].as_str(), Some("eth1"));
    assert_eq!(port["protocol-version"].as_str(), Some("PTPv1"));
  }

  #[test]
  fn missing_port_table_is_created() {
    let patched: Table = patch_ptp_config("loglevel = \"info\"\n", "eth0").unwrap().parse().unwrap();
    assert_eq!(patched["port"].as_array().unwrap()[0]["interface"].as_str(), Some("eth0"));
  }

  #[test]
  fn writing_twice_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config/inferno-ptpv1.toml");
    assert!(write_ptp_config(&path, "eth0").unwrap());
    assert!(!write_ptp_config(&path, "eth0").unwrap());
    assert!(write_ptp_config(&path, "eth1").unwrap());
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("usrvclock-export = true"));
  }
}
