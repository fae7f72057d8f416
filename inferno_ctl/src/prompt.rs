use std::cell::RefCell;
use std::io::{self, BufRead, Write};

use inferno_provision::{Confirm, Defaults, RawInputs};

/// Line-oriented questions on a terminal. An empty answer (or end of input)
/// keeps the default shown in brackets.
pub struct Prompter<R, W> {
  input: RefCell<R>,
  output: RefCell<W>,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
  pub fn new(input: R, output: W) -> Self {
    Self { input: RefCell::new(input), output: RefCell::new(output) }
  }

  fn ask(&self, question: &str, default: &str) -> io::Result<Option<String>> {
    {
      let mut out = self.output.borrow_mut();
      if default.is_empty() {
        write!(out, "{question}: ")?;
      } else {
        write!(out, "{question} [{default}]: ")?;
      }
      out.flush()?;
    }
    let mut line = String::new();
    self.input.borrow_mut().read_line(&mut line)?;
    let answer = line.trim();
    Ok((!answer.is_empty()).then(|| answer.to_owned()))
  }

  fn section(&self, title: &str) -> io::Result<()> {
    writeln!(self.output.borrow_mut(), "\n== {title} ==")
  }

  /// Walks the operator through every installation question. SRT details
  /// are only asked for when streaming is enabled.
  pub fn collect(&self, d: &Defaults) -> io::Result<RawInputs> {
    let mut raw = RawInputs::default();
    self.section("Network")?;
    raw.dante_interface = self.ask("Dante network interface", &d.dante_interface)?;
    raw.internet_interface = self.ask("Internet network interface", &d.internet_interface)?;
    raw.dante_ip = self.ask("Static IP address for Dante", &d.dante_ip)?;
    raw.dante_netmask = self.ask("Netmask for Dante", &d.dante_netmask)?;

    self.section("Inferno")?;
    raw.device_name = self.ask("Device name shown in Dante Controller", &d.device_name)?;
    raw.sample_rate = self.ask("Sample rate", &d.sample_rate)?;
    raw.rx_channels = self.ask("Receive channels", &d.rx_channels)?;
    raw.tx_channels = self.ask("Transmit channels", &d.tx_channels)?;
    raw.rx_latency_ms = self.ask("Receive latency (ms)", &d.rx_latency_ms)?;
    raw.tx_latency_ms = self.ask("Transmit latency (ms)", &d.tx_latency_ms)?;

    self.section("SRT streaming")?;
    raw.srt_enabled = self.ask("Enable SRT streaming? (yes/no)", &d.srt_enabled)?;
    let enabled = raw.srt_enabled.as_deref().unwrap_or(&d.srt_enabled).to_ascii_lowercase();
    if matches!(enabled.as_str(), "y" | "yes" | "true" | "1" | "on") {
      raw.srt_host = self.ask("SRT destination host", &d.srt_host)?;
      raw.srt_port = self.ask("SRT port", &d.srt_port)?;
      raw.srt_mode = self.ask("SRT mode (caller/listener)", &d.srt_mode)?;
      raw.srt_latency_ms = self.ask("SRT latency (ms)", &d.srt_latency_ms)?;
    }
    Ok(raw)
  }
}

impl<R: BufRead, W: Write> Confirm for Prompter<R, W> {
  fn confirm(&self, question: &str) -> bool {
    match self.ask(&format!("{question} (y/N)"), "") {
      Ok(Some(answer)) => matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"),
      _ => false,
    }
  }
}
