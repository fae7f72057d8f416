use std::fs;
use std::time::Duration;

use inferno_provision::host::CommandOutput;
use inferno_provision::supervisor::{Outcome, NOT_CONFIGURED, RESTART_SETTLE};
use inferno_provision::topology::HostFacts;
use inferno_provision::{
  units, AssumeYes, Defaults, FakeRunner, Layout, RawInputs, RecordingPause, ServiceKind, ServiceSupervisor, Systemd,
  TopologyController,
};
use tempfile::TempDir;

fn answers(srt: bool) -> RawInputs {
  RawInputs {
    dante_interface: Some("eth0".into()),
    dante_ip: Some("169.254.0.123".into()),
    dante_netmask: Some("/24".into()),
    srt_enabled: Some(if srt { "yes" } else { "no" }.into()),
    srt_host: Some("127.0.0.1".into()),
    srt_port: Some("10000".into()),
    srt_mode: Some("caller".into()),
    srt_latency_ms: Some("120".into()),
    ..Default::default()
  }
}

fn prepared_host() -> (TempDir, Layout) {
  let dir = tempfile::tempdir().unwrap();
  let layout = Layout::with_sysroot(dir.path());
  fs::create_dir_all(layout.bin_dir()).unwrap();
  for binary in ["statime", "inferno2pipe", "ffmpeg"] {
    fs::write(layout.bin_dir().join(binary), "").unwrap();
  }
  fs::create_dir_all(layout.host_path("/etc")).unwrap();
  fs::write(layout.dhcpcd_conf(), "hostname\nclientid\n").unwrap();
  (dir, layout)
}

fn root() -> HostFacts {
  HostFacts { euid: 0, arch: "x86_64".into() }
}

#[test]
fn install_without_streaming_then_operate() {
  let (_dir, layout) = prepared_host();
  let runner = FakeRunner::default();
  let systemd = Systemd::new(&runner);
  let pause = RecordingPause::default();
  let controller = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

  let report = controller.provision(&answers(false), &Defaults::default(), &AssumeYes).unwrap();
  let names: Vec<_> = units::generate(&report.config, &layout).iter().map(|s| s.kind).collect();
  assert_eq!(
    names,
    [ServiceKind::Routes, ServiceKind::ClockSync, ServiceKind::AudioReceive, ServiceKind::MonitoringApi]
  );
  assert_eq!(report.config.network.dante_cidr, 24);

  let dhcpcd = fs::read_to_string(layout.dhcpcd_conf()).unwrap();
  assert!(dhcpcd.contains("static ip_address=169.254.0.123/24"));

  let supervisor = ServiceSupervisor::from_installation(&layout, &systemd, &pause).unwrap();
  let status = supervisor.status();
  let srt = status.iter().find(|s| s.kind == ServiceKind::StreamEncode).unwrap();
  assert_eq!(srt.state, NOT_CONFIGURED);
  assert_eq!(supervisor.logs(10).len(), 8);
}

#[test]
fn reinstall_converges_without_duplicates() {
  let (_dir, layout) = prepared_host();
  let runner = FakeRunner::default();
  let systemd = Systemd::new(&runner);
  let pause = RecordingPause::default();
  let controller = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

  controller.provision(&answers(true), &Defaults::default(), &AssumeYes).unwrap();
  assert!(layout.unit_file("inferno-srt").exists());
  let ptp_first = fs::read_to_string(layout.ptp_config()).unwrap();

  controller.provision(&answers(false), &Defaults::default(), &AssumeYes).unwrap();
  assert!(!layout.unit_file("inferno-srt").exists());
  assert_eq!(fs::read_to_string(layout.ptp_config()).unwrap(), ptp_first);
  let dhcpcd = fs::read_to_string(layout.dhcpcd_conf()).unwrap();
  assert_eq!(dhcpcd.matches("# inferno: dante interface eth0").count(), 1);
  assert!(runner.lines().contains(&"systemctl disable --now inferno-srt.service".to_owned()));
}

#[test]
fn streaming_destination_reaches_the_encoder_unit() {
  let (_dir, layout) = prepared_host();
  let runner = FakeRunner::default();
  let systemd = Systemd::new(&runner);
  let pause = RecordingPause::default();
  let controller = TopologyController::new(&layout, &runner, &systemd, &pause).with_facts(root());

  controller.provision(&answers(true), &Defaults::default(), &AssumeYes).unwrap();
  let unit = fs::read_to_string(layout.unit_file("inferno-srt")).unwrap();
  assert!(unit.contains("srt://127.0.0.1:10000?mode=caller&latency=120000"));
  assert!(unit.contains("Requires=inferno.service"));
  let audio = fs::read_to_string(layout.unit_file("inferno")).unwrap();
  assert!(audio.contains("INFERNO_RX_LATENCY_NS=10000000"));
}

#[test]
fn start_issues_clock_before_audio() {
  let (_dir, layout) = prepared_host();
  let runner = FakeRunner::default();
  let systemd = Systemd::new(&runner);
  let pause = RecordingPause::default();
  let config = inferno_provision::resolve(&answers(true), &Defaults::default()).unwrap();
  let supervisor = ServiceSupervisor::new(config, &layout, &systemd, &pause);

  assert!(supervisor.start().is_success());
  let starts: Vec<String> = runner.lines().into_iter().filter(|l| l.starts_with("systemctl start")).collect();
  let pos = |unit: &str| starts.iter().position(|l| l.ends_with(&format!(" {unit}.service"))).unwrap();
  assert!(pos("statime") < pos("inferno"));
  assert!(pos("inferno") < pos("inferno-srt"));
}

#[test]
fn stop_and_restart_when_nothing_runs() {
  let (_dir, layout) = prepared_host();
  let runner = FakeRunner::new(|cmd| {
    Ok(match cmd.args[0].as_str() {
      "stop" => CommandOutput::failed(format!("Failed to stop {}: Unit {} not loaded.", cmd.args[1], cmd.args[1])),
      _ => CommandOutput::ok(""),
    })
  });
  let systemd = Systemd::new(&runner);
  let pause = RecordingPause::default();
  let config = inferno_provision::resolve(&answers(true), &Defaults::default()).unwrap();
  let supervisor = ServiceSupervisor::new(config, &layout, &systemd, &pause);

  let stopped = supervisor.stop();
  assert_eq!(stopped.entries.len(), 5);
  assert!(stopped.entries.iter().all(|(_, o)| matches!(o, Outcome::Done)));

  assert!(supervisor.restart().is_success());
  assert_eq!(pause.total(), RESTART_SETTLE);
  assert_eq!(RESTART_SETTLE, Duration::from_secs(2));
}
