use std::path::PathBuf;

pub const INSTALL_ROOT: &str = "opt/inferno";
pub const LOG_DIR: &str = "var/log/inferno";
pub const RUN_DIR: &str = "run/inferno";
pub const UNIT_DIR: &str = "etc/systemd/system";

/// Filesystem locations of everything the provisioner reads or writes.
///
/// All paths hang off `sysroot`, which is `/` on a real host and a scratch
/// directory in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
  sysroot: PathBuf,
}

impl Default for Layout {
  fn default() -> Self {
    Self::with_sysroot("/")
  }
}

impl Layout {
  pub fn with_sysroot(sysroot: impl Into<PathBuf>) -> Self {
    Self { sysroot: sysroot.into() }
  }

  pub fn host_path(&self, absolute: &str) -> PathBuf {
    self.sysroot.join(absolute.trim_start_matches('/'))
  }

  pub fn install_root(&self) -> PathBuf {
    self.sysroot.join(INSTALL_ROOT)
  }
  pub fn bin_dir(&self) -> PathBuf {
    self.install_root().join("bin")
  }
  pub fn config_dir(&self) -> PathBuf {
    self.install_root().join("config")
  }
  pub fn installation_config(&self) -> PathBuf {
    self.config_dir().join("installation.conf")
  }
  pub fn ptp_config(&self) -> PathBuf {
    self.config_dir().join("inferno-ptpv1.toml")
  }
  pub fn log_dir(&self) -> PathBuf {
    self.sysroot.join(LOG_DIR)
  }
  pub fn run_dir(&self) -> PathBuf {
    self.sysroot.join(RUN_DIR)
  }
  pub fn audio_pipe(&self) -> PathBuf {
    self.run_dir().join("audio.pipe")
  }
  pub fn unit_dir(&self) -> PathBuf {
    self.sysroot.join(UNIT_DIR)
  }
  pub fn unit_file(&self, unit_name: &str) -> PathBuf {
    self.unit_dir().join(format!("{unit_name}.service"))
  }

  pub fn dhcpcd_conf(&self) -> PathBuf {
    self.host_path("/etc/dhcpcd.conf")
  }
  pub fn interfaces_dropin_dir(&self) -> PathBuf {
    self.host_path("/etc/network/interfaces.d")
  }
  pub fn iptables_rules(&self) -> PathBuf {
    self.host_path("/etc/iptables/rules.v4")
  }

  /// Path of our own executable as the generated units should invoke it.
  pub fn ctl_binary(&self) -> PathBuf {
    self.bin_dir().join("inferno_ctl")
  }
}
