// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub main: Main,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Main {
    pub name: String,
    pub cpus: u8,

    /// Longest a simulated accelerator call runs before returning on its own
    ///
    /// Default: 50ms
    #[serde(default = "Main::default_ioctl_ms")]
    pub ioctl_ms: u64,

    /// How long the control thread holds each barrier
    ///
    /// Default: 0
    #[serde(default)]
    pub hold_ms: u64,

    /// Pause between barriers
    ///
    /// Default: 10ms
    #[serde(default = "Main::default_interval_ms")]
    pub interval_ms: u64,

    /// Every Nth call a vCPU makes is accounted as a VM-wide call rather than
    /// against its own guard
    ///
    /// Default: None, all calls are per-vCPU
    pub global_every: Option<u32>,

    /// Number of barriers to raise before exiting
    ///
    /// Default: None, run until interrupted
    pub cycles: Option<u32>,
}
impl Main {
    fn default_ioctl_ms() -> u64 {
        50
    }
    fn default_interval_ms() -> u64 {
        10
    }

    pub fn ioctl_time(&self) -> Duration {
        Duration::from_millis(self.ioctl_ms)
    }
    pub fn hold_time(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

pub fn parse(path: &str) -> anyhow::Result<Config> {
    let file_data =
        std::fs::read(path).context("Failed to read given config.toml")?;
    parse_str(
        std::str::from_utf8(&file_data)
            .context("config should be valid utf-8")?,
    )
}

pub fn parse_str(data: &str) -> anyhow::Result<Config> {
    let config = toml::from_str::<Config>(data)?;
    anyhow::ensure!(config.main.cpus > 0, "at least one cpu is required");
    anyhow::ensure!(
        config.main.global_every != Some(0),
        "global_every must be nonzero"
    );
    Ok(config)
}
