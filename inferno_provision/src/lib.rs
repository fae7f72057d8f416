// Inferno-AoIP
// Copyright (C) 2023 Teodor Woźniak
// 
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
// 
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// 
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! Provisioning and supervision of an Inferno Dante-to-SRT bridge host.
//! 
//! The host runs a small service topology: a one-shot unit that pins the
//! multicast route to the Dante interface, `statime` for PTP, `inferno2pipe`
//! writing received audio into a named pipe, an optional `ffmpeg` reading that
//! pipe and streaming SRT, and a monitoring HTTP API. This crate resolves the
//! operator's answers into an [`InstallationConfig`], converges the host
//! network and firewall, writes systemd units for the topology and drives
//! them afterwards.
//! 
//! Every host side effect goes through [`HostRunner`] and the filesystem
//! under a [`Layout`], so the whole pipeline can be exercised on a scratch
//! directory:
//! ```
//! use inferno_provision::{
//!   resolve, units, Defaults, FakeRunner, Layout, RawInputs, RecordingPause, ServiceSupervisor, Systemd,
//! };
//! 
//! let config = resolve(&RawInputs::default(), &Defaults::default()).unwrap();
//! let layout = Layout::with_sysroot("/tmp/inferno-doc");
//! let runner = FakeRunner::default();
//! let systemd = Systemd::new(&runner);
//! let pause = RecordingPause::default();
//! let supervisor = ServiceSupervisor::new(config, &layout, &systemd, &pause);
//! for service in supervisor.services() {
//!   println!("{}", units::render(service));
//! }
//! ```
//! 


mod common;
pub mod config;
pub mod error;
pub mod firewall;
pub mod health;
pub mod host;
pub mod layout;
pub mod log_scrape;
pub mod monitor;
pub mod network;
pub mod pipe;
pub mod ptp_config;
pub mod supervisor;
pub mod systemd;
pub mod topology;
pub mod units;

pub use common::LogAndForget;
pub use config::{resolve, Defaults, InstallationConfig, RawInputs, SrtMode};
pub use error::{Error, Result};
pub use health::{Health, MonitorClient};
pub use host::{FakeRunner, HostCommand, HostRunner, Pause, RecordingPause, SystemRunner, ThreadPause};
pub use layout::Layout;
pub use supervisor::{ControlReport, Outcome, ServiceSupervisor};
pub use systemd::{ServiceManager, Systemd};
pub use topology::{AssumeYes, Confirm, HostFacts, TopologyController};
pub use units::ServiceKind;
