//! Typed service definitions and their systemd rendering.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;

use crate::config::InstallationConfig;
use crate::layout::Layout;

pub const RESTART_DELAY: Duration = Duration::from_secs(5);
pub const NETWORK_ONLINE: &str = "network-online.target";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
  Routes,
  ClockSync,
  AudioReceive,
  MonitoringApi,
  StreamEncode,
}

impl ServiceKind {
  pub const ALL: [ServiceKind; 5] = [
    Self::Routes,
    Self::ClockSync,
    Self::AudioReceive,
    Self::MonitoringApi,
    Self::StreamEncode,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Self::Routes => "routes",
      Self::ClockSync => "clock-sync",
      Self::AudioReceive => "audio-receive",
      Self::MonitoringApi => "monitoring-api",
      Self::StreamEncode => "stream-encode",
    }
  }

  pub fn unit_name(self) -> &'static str {
    match self {
      Self::Routes => "inferno-routes",
      Self::ClockSync => "statime",
      Self::AudioReceive => "inferno",
      Self::MonitoringApi => "inferno-api",
      Self::StreamEncode => "inferno-srt",
    }
  }

  /// Stem of the service's log files under the log directory.
  pub fn log_stem(self) -> &'static str {
    match self {
      Self::Routes => "routes",
      Self::ClockSync => "statime",
      Self::AudioReceive => "inferno",
      Self::MonitoringApi => "api",
      Self::StreamEncode => "srt",
    }
  }

  pub fn stdout_log(self, layout: &Layout) -> PathBuf {
    layout.log_dir().join(format!("{}.log", self.log_stem()))
  }
  pub fn stderr_log(self, layout: &Layout) -> PathBuf {
    layout.log_dir().join(format!("{}.error.log", self.log_stem()))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
  Oneshot,
  Simple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
  NetworkOnline,
  Service(ServiceKind),
}

impl Target {
  fn unit(self) -> String {
    match self {
      Self::NetworkOnline => NETWORK_ONLINE.to_owned(),
      Self::Service(kind) => format!("{}.service", kind.unit_name()),
    }
  }
}

/// Every edge orders the service after its target; `Requires` also ties the
/// service's fate to it, `Wants` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
  Requires(Target),
  Wants(Target),
}

impl Dependency {
  pub fn target(self) -> Target {
    match self {
      Self::Requires(t) | Self::Wants(t) => t,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
  No,
  Always { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedService {
  pub kind: ServiceKind,
  pub description: String,
  pub unit_type: UnitType,
  pub exec_start_pre: Option<Vec<String>>,
  pub exec_start: Vec<String>,
  pub environment: Vec<(String, String)>,
  pub dependencies: Vec<Dependency>,
  pub restart: RestartPolicy,
  pub stdout_log: PathBuf,
  pub stderr_log: PathBuf,
}

impl ManagedService {
  fn new(kind: ServiceKind, description: &str, layout: &Layout, exec_start: Vec<String>) -> Self {
    Self {
      kind,
      description: description.to_owned(),
      unit_type: UnitType::Simple,
      exec_start_pre: None,
      exec_start,
      environment: vec![],
      dependencies: vec![],
      restart: RestartPolicy::Always { delay: RESTART_DELAY },
      stdout_log: kind.stdout_log(layout),
      stderr_log: kind.stderr_log(layout),
    }
  }

  /// Services that must have been started before this one may be.
  pub fn required_services(&self) -> impl Iterator<Item = ServiceKind> + '_ {
    self.dependencies.iter().filter_map(|d| match d {
      Dependency::Requires(Target::Service(kind)) => Some(*kind),
      _ => None,
    })
  }

  /// All services this one is ordered after.
  pub fn ordered_after(&self) -> impl Iterator<Item = ServiceKind> + '_ {
    self.dependencies.iter().filter_map(|d| match d.target() {
      Target::Service(kind) => Some(kind),
      Target::NetworkOnline => None,
    })
  }

  pub fn env(&self, key: &str) -> Option<&str> {
    self.environment.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
  }
}

fn path_arg(path: &Path) -> String {
  path.display().to_string()
}

fn ctl(layout: &Layout, subcommand: &str) -> Vec<String> {
  vec![path_arg(&layout.ctl_binary()), subcommand.to_owned()]
}

/// Environment that forms the whole runtime configuration of `inferno2pipe`.
pub fn audio_environment(config: &InstallationConfig) -> Vec<(String, String)> {
  let inf = &config.inferno;
  [
    ("INFERNO_BIND_IP", config.network.dante_ip.to_string()),
    ("INFERNO_NAME", inf.device_name.clone()),
    ("INFERNO_SAMPLE_RATE", inf.sample_rate.to_string()),
    ("INFERNO_RX_CHANNELS", inf.rx_channels.to_string()),
    ("INFERNO_TX_CHANNELS", inf.tx_channels.to_string()),
    ("INFERNO_RX_LATENCY_NS", inf.rx_latency_ns.to_string()),
    ("INFERNO_TX_LATENCY_NS", inf.tx_latency_ns.to_string()),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_owned(), v))
  .collect()
}

pub fn generate(config: &InstallationConfig, layout: &Layout) -> Vec<ManagedService> {
  let pipe = path_arg(&layout.audio_pipe());
  let bin = layout.bin_dir();
  let mut services = vec![];

  let mut routes = ManagedService::new(ServiceKind::Routes, "Inferno multicast routing", layout, ctl(layout, "routes"));
  routes.unit_type = UnitType::Oneshot;
  routes.restart = RestartPolicy::No;
  routes.dependencies = vec![Dependency::Wants(Target::NetworkOnline)];
  services.push(routes);

  let mut clock = ManagedService::new(
    ServiceKind::ClockSync,
    "Statime PTP clock for Inferno",
    layout,
    vec![path_arg(&bin.join("statime")), "-c".to_owned(), path_arg(&layout.ptp_config())],
  );
  clock.dependencies = vec![Dependency::Requires(Target::Service(ServiceKind::Routes))];
  services.push(clock);

  let mut audio = ManagedService::new(
    ServiceKind::AudioReceive,
    "Inferno Dante receiver",
    layout,
    vec![
      path_arg(&bin.join("inferno2pipe")),
      "--channels-count".to_owned(),
      config.inferno.rx_channels.to_string(),
      "--output".to_owned(),
      pipe.clone(),
    ],
  );
  audio.exec_start_pre = Some(ctl(layout, "ensure-pipe"));
  audio.environment = audio_environment(config);
  audio.dependencies = vec![Dependency::Requires(Target::Service(ServiceKind::ClockSync))];
  services.push(audio);

  let mut api = ManagedService::new(ServiceKind::MonitoringApi, "Inferno monitoring API", layout, ctl(layout, "monitor"));
  api.dependencies = vec![
    Dependency::Wants(Target::Service(ServiceKind::AudioReceive)),
    Dependency::Wants(Target::NetworkOnline),
  ];
  services.push(api);

  if config.srt.enabled {
    let mut srt = ManagedService::new(
      ServiceKind::StreamEncode,
      "Inferno SRT stream",
      layout,
      vec![
        path_arg(&bin.join("ffmpeg")),
        "-hide_banner".to_owned(),
        "-f".to_owned(),
        "s32le".to_owned(),
        "-ar".to_owned(),
        config.inferno.sample_rate.to_string(),
        "-ac".to_owned(),
        config.inferno.rx_channels.to_string(),
        "-i".to_owned(),
        pipe,
        "-c:a".to_owned(),
        "aac".to_owned(),
        "-b:a".to_owned(),
        "256k".to_owned(),
        "-f".to_owned(),
        "mpegts".to_owned(),
        config.srt.destination_uri(),
      ],
    );
    srt.exec_start_pre = Some(ctl(layout, "ensure-pipe"));
    srt.dependencies = vec![Dependency::Requires(Target::Service(ServiceKind::AudioReceive))];
    services.push(srt);
  }

  services
}

fn escape_specifiers(s: &str) -> String {
  s.replace('%', "%%")
}

fn exec_arg(arg: &str) -> String {
  let arg = escape_specifiers(arg).replace('$', "$$");
  if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';')) {
    return arg;
  }
  format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

fn exec_line(argv: &[String]) -> String {
  argv.iter().map(|a| exec_arg(a)).join(" ")
}

/// Renders a service as a systemd unit file.
pub fn render(service: &ManagedService) -> String {
  let mut out = String::new();
  let after = service.dependencies.iter().map(|d| d.target().unit()).join(" ");
  let requires = service
    .dependencies
    .iter()
    .filter_map(|d| match d {
      Dependency::Requires(t) => Some(t.unit()),
      _ => None,
    })
    .join(" ");
  let wants = service
    .dependencies
    .iter()
    .filter_map(|d| match d {
      Dependency::Wants(t) => Some(t.unit()),
      _ => None,
    })
    .join(" ");

  // writing into a String cannot fail
  let _ = writeln!(out, "[Unit]");
  let _ = writeln!(out, "Description={}", escape_specifiers(&service.description));
  if !after.is_empty() {
    let _ = writeln!(out, "After={after}");
  }
  if !requires.is_empty() {
    let _ = writeln!(out, "Requires={requires}");
  }
  if !wants.is_empty() {
    let _ = writeln!(out, "Wants={wants}");
  }

  let _ = writeln!(out, "\n[Service]");
  match service.unit_type {
    UnitType::Oneshot => {
      let _ = writeln!(out, "Type=oneshot\nRemainAfterExit=yes");
    }
    UnitType::Simple => {
      let _ = writeln!(out, "Type=simple");
    }
  }
  for (key, value) in &service.environment {
    let kv = escape_specifiers(&format!("{key}={value}")).replace('\\', "\\\\").replace('"', "\\\"");
    let _ = writeln!(out, "Environment=\"{kv}\"");
  }
  if let Some(pre) = &service.exec_start_pre {
    let _ = writeln!(out, "ExecStartPre={}", exec_line(pre));
  }
  let _ = writeln!(out, "ExecStart={}", exec_line(&service.exec_start));
  match service.restart {
    RestartPolicy::No => {
      let _ = writeln!(out, "Restart=no");
    }
    RestartPolicy::Always { delay } => {
      let _ = writeln!(out, "Restart=always\nRestartSec={}", delay.as_secs());
    }
  }
  let _ = writeln!(out, "StandardOutput=append:{}", escape_specifiers(&path_arg(&service.stdout_log)));
  let _ = writeln!(out, "StandardError=append:{}", escape_specifiers(&path_arg(&service.stderr_log)));

  let _ = writeln!(out, "\n[Install]\nWantedBy=multi-user.target");
  out
}
