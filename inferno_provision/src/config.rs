//! Resolution of operator input into a validated [`InstallationConfig`].
//!
//! Input arrives either from interactive prompts or from a TOML file with the
//! same `[network]`, `[inferno]` and `[srt]` sections as the persisted
//! configuration. Every field is optional there; blanks fall back to
//! [`Defaults`]. Resolution is all-or-nothing: nothing is persisted unless the
//! whole record validates.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::*;
use crate::error::{Error, Result};

/// Prefix length used when the netmask does not describe a contiguous mask.
pub const FALLBACK_CIDR: u8 = 24;
pub const NS_PER_MS: u64 = 1_000_000;
const MAX_INTERFACE_NAME: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtMode {
  Caller,
  Listener,
}

impl FromStr for SrtMode {
  type Err = Error;
  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "caller" => Ok(Self::Caller),
      "listener" => Ok(Self::Listener),
      other => Err(Error::validation("srt.mode", format!("{other:?} is neither caller nor listener"))),
    }
  }
}

impl fmt::Display for SrtMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Caller => "caller",
      Self::Listener => "listener",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSection {
  pub dante_interface: String,
  pub internet_interface: String,
  pub dante_ip: Ipv4Addr,
  pub dante_netmask: Ipv4Addr,
  pub dante_cidr: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfernoSection {
  pub device_name: String,
  pub sample_rate: u32,
  pub rx_channels: u16,
  pub tx_channels: u16,
  pub rx_latency_ns: u64,
  pub tx_latency_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtSection {
  pub enabled: bool,
  pub host: String,
  pub port: u16,
  pub mode: SrtMode,
  pub latency_ms: u32,
}

impl SrtSection {
  /// Destination handed to the encoder. The transport takes latency in
  /// microseconds.
  pub fn destination_uri(&self) -> String {
    format!(
      "srt://{}:{}?mode={}&latency={}",
      self.host,
      self.port,
      self.mode,
      u64::from(self.latency_ms) * 1000
    )
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationConfig {
  pub network: NetworkSection,
  pub inferno: InfernoSection,
  pub srt: SrtSection,
}

const FILE_HEADER: &str = "# Inferno bridge installation configuration\n# Written by inferno_ctl install; re-read on every service start.\n\n";

impl InstallationConfig {
  pub fn save(&self, path: &Path) -> Result<()> {
    let content = toml::to_string(self)?;
    if let Some(dir) = path.parent() {
      fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("conf.tmp");
    fs::write(&tmp, format!("{FILE_HEADER}{content}"))?;
    fs::rename(&tmp, path)?;
    info!("configuration saved to {}", path.display());
    Ok(())
  }

  pub fn load(path: &Path) -> Result<Self> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|source| Error::ConfigParse { path: path.to_owned(), source })
  }
}

/// Unvalidated operator answers. `None` and blank strings mean "use default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawInputs {
  pub dante_interface: Option<String>,
  pub internet_interface: Option<String>,
  pub dante_ip: Option<String>,
  pub dante_netmask: Option<String>,
  pub device_name: Option<String>,
  pub sample_rate: Option<String>,
  pub rx_channels: Option<String>,
  pub tx_channels: Option<String>,
  pub rx_latency_ms: Option<String>,
  pub tx_latency_ms: Option<String>,
  pub srt_enabled: Option<String>,
  pub srt_host: Option<String>,
  pub srt_port: Option<String>,
  pub srt_mode: Option<String>,
  pub srt_latency_ms: Option<String>,
}

impl RawInputs {
  /// Reads answers from a sectioned TOML file. Scalars of any type are taken
  /// as their textual form so the same validation applies as for prompts.
  pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
    let table: toml::Table = content.parse()?;
    let get = |section: &str, key: &str| -> Option<String> {
      match table.get(section)?.get(key)? {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        // Debug keeps the fractional part, so integer fields reject `10.0`
        toml::Value::Float(f) => Some(format!("{f:?}")),
        toml::Value::Boolean(b) => Some(b.to_string()),
        _ => None,
      }
    };
    Ok(Self {
      dante_interface: get("network", "dante_interface"),
      internet_interface: get("network", "internet_interface"),
      dante_ip: get("network", "dante_ip"),
      dante_netmask: get("network", "dante_netmask"),
      device_name: get("inferno", "device_name"),
      sample_rate: get("inferno", "sample_rate"),
      rx_channels: get("inferno", "rx_channels"),
      tx_channels: get("inferno", "tx_channels"),
      rx_latency_ms: get("inferno", "rx_latency_ms"),
      tx_latency_ms: get("inferno", "tx_latency_ms"),
      srt_enabled: get("srt", "enabled"),
      srt_host: get("srt", "host"),
      srt_port: get("srt", "port"),
      srt_mode: get("srt", "mode"),
      srt_latency_ms: get("srt", "latency_ms"),
    })
  }

  pub fn from_file(path: &Path) -> Result<Self> {
    let content = fs::read_to_string(path)?;
    Self::from_toml_str(&content).map_err(|source| Error::ConfigParse { path: path.to_owned(), source })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
  pub dante_interface: String,
  pub internet_interface: String,
  pub dante_ip: String,
  pub dante_netmask: String,
  pub device_name: String,
  pub sample_rate: String,
  pub rx_channels: String,
  pub tx_channels: String,
  pub rx_latency_ms: String,
  pub tx_latency_ms: String,
  pub srt_enabled: String,
  pub srt_host: String,
  pub srt_port: String,
  pub srt_mode: String,
  pub srt_latency_ms: String,
}

impl Default for Defaults {
  fn default() -> Self {
    Self {
      dante_interface: "eth0".to_owned(),
      internet_interface: "wlan0".to_owned(),
      dante_ip: "169.254.0.123".to_owned(),
      dante_netmask: "255.255.0.0".to_owned(),
      device_name: "inferno".to_owned(),
      sample_rate: "48000".to_owned(),
      rx_channels: "2".to_owned(),
      tx_channels: "2".to_owned(),
      rx_latency_ms: "10".to_owned(),
      tx_latency_ms: "10".to_owned(),
      srt_enabled: "no".to_owned(),
      srt_host: String::new(),
      srt_port: "9000".to_owned(),
      srt_mode: "caller".to_owned(),
      srt_latency_ms: "120".to_owned(),
    }
  }
}

fn pick<'a>(input: &'a Option<String>, default: &'a str) -> &'a str {
  match input.as_deref().map(str::trim) {
    Some(s) if !s.is_empty() => s,
    _ => default.trim(),
  }
}

fn positive<T>(field: &'static str, text: &str) -> Result<T>
where
  T: FromStr + PartialEq + Default,
{
  let value: T = text
    .parse()
    .map_err(|_| Error::validation(field, format!("{text:?} is not a positive integer")))?;
  if value == T::default() {
    return Err(Error::validation(field, "must be greater than zero"));
  }
  Ok(value)
}

fn yes_no(field: &'static str, text: &str) -> Result<bool> {
  match text.to_ascii_lowercase().as_str() {
    "y" | "yes" | "true" | "1" | "on" => Ok(true),
    "n" | "no" | "false" | "0" | "off" => Ok(false),
    _ => Err(Error::validation(field, format!("{text:?} is not yes/no"))),
  }
}

fn interface_name(field: &'static str, text: &str) -> Result<String> {
  if text.is_empty() || text.len() > MAX_INTERFACE_NAME {
    return Err(Error::validation(field, format!("interface name must be 1..={MAX_INTERFACE_NAME} characters")));
  }
  if text.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
    return Err(Error::validation(field, format!("{text:?} is not a valid interface name")));
  }
  Ok(text.to_owned())
}

/// Exact millisecond to nanosecond conversion; only positive integers pass.
pub fn ms_to_ns(field: &'static str, text: &str) -> Result<u64> {
  let ms: u64 = positive(field, text.trim())?;
  ms.checked_mul(NS_PER_MS)
    .ok_or_else(|| Error::validation(field, format!("{ms} ms overflows nanoseconds")))
}

/// Netmask as dotted quad, or as a prefix length with optional leading `/`.
pub fn parse_netmask(text: &str) -> Option<Ipv4Addr> {
  let text = text.trim();
  let prefix = text.strip_prefix('/').unwrap_or(text);
  if !prefix.contains('.') {
    let len: u32 = prefix.parse().ok()?;
    if len > 32 {
      return None;
    }
    let bits = u32::MAX.checked_shl(32 - len).unwrap_or(0);
    return Some(Ipv4Addr::from(bits));
  }
  text.parse().ok()
}

/// Best-effort prefix length of `netmask`; never fails, falls back to
/// [`FALLBACK_CIDR`].
pub fn derive_cidr(ip: &str, netmask: &str) -> u8 {
  if ip.trim().parse::<Ipv4Addr>().is_err() {
    return FALLBACK_CIDR;
  }
  let Some(mask) = parse_netmask(netmask) else {
    return FALLBACK_CIDR;
  };
  let bits = u32::from(mask);
  if bits.leading_ones() + bits.trailing_zeros() == 32 {
    bits.leading_ones() as u8
  } else {
    FALLBACK_CIDR
  }
}

pub fn resolve(inputs: &RawInputs, defaults: &Defaults) -> Result<InstallationConfig> {
  let dante_interface = interface_name("network.dante_interface", pick(&inputs.dante_interface, &defaults.dante_interface))?;
  let internet_interface = interface_name("network.internet_interface", pick(&inputs.internet_interface, &defaults.internet_interface))?;
  if dante_interface == internet_interface {
    return Err(Error::validation("network.internet_interface", "must differ from the Dante interface"));
  }

  let ip_text = pick(&inputs.dante_ip, &defaults.dante_ip);
  let dante_ip: Ipv4Addr = ip_text
    .parse()
    .map_err(|_| Error::validation("network.dante_ip", format!("{ip_text:?} is not an IPv4 address")))?;
  let mask_text = pick(&inputs.dante_netmask, &defaults.dante_netmask);
  let dante_netmask = parse_netmask(mask_text)
    .ok_or_else(|| Error::validation("network.dante_netmask", format!("{mask_text:?} is not a netmask")))?;
  let dante_cidr = derive_cidr(ip_text, mask_text);

  let device_name = pick(&inputs.device_name, &defaults.device_name).to_owned();
  if device_name.is_empty() {
    return Err(Error::validation("inferno.device_name", "must not be empty"));
  }

  let inferno = InfernoSection {
    device_name,
    sample_rate: positive("inferno.sample_rate", pick(&inputs.sample_rate, &defaults.sample_rate))?,
    rx_channels: positive("inferno.rx_channels", pick(&inputs.rx_channels, &defaults.rx_channels))?,
    tx_channels: positive("inferno.tx_channels", pick(&inputs.tx_channels, &defaults.tx_channels))?,
    rx_latency_ns: ms_to_ns("inferno.rx_latency_ms", pick(&inputs.rx_latency_ms, &defaults.rx_latency_ms))?,
    tx_latency_ns: ms_to_ns("inferno.tx_latency_ms", pick(&inputs.tx_latency_ms, &defaults.tx_latency_ms))?,
  };

  let srt = resolve_srt(inputs, defaults)?;

  Ok(InstallationConfig {
    network: NetworkSection { dante_interface, internet_interface, dante_ip, dante_netmask, dante_cidr },
    inferno,
    srt,
  })
}

fn resolve_srt(inputs: &RawInputs, defaults: &Defaults) -> Result<SrtSection> {
  let enabled = yes_no("srt.enabled", pick(&inputs.srt_enabled, &defaults.srt_enabled))?;
  let mode: SrtMode = pick(&inputs.srt_mode, &defaults.srt_mode).parse()?;
  let mut host = pick(&inputs.srt_host, &defaults.srt_host).to_owned();
  if enabled && host.is_empty() {
    match mode {
      SrtMode::Listener => host = "0.0.0.0".to_owned(),
      SrtMode::Caller => return Err(Error::validation("srt.host", "caller mode needs a destination host")),
    }
  }
  if host.chars().any(|c| c.is_whitespace() || matches!(c, '?' | '&' | '/')) {
    return Err(Error::validation("srt.host", format!("{host:?} is not a host name or address")));
  }
  Ok(SrtSection {
    enabled,
    host,
    port: positive("srt.port", pick(&inputs.srt_port, &defaults.srt_port))?,
    mode,
    latency_ms: positive("srt.latency_ms", pick(&inputs.srt_latency_ms, &defaults.srt_latency_ms))?,
  })
}
