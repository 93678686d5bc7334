// Copyright 2025 node-provisioner Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::fs::read_to_string;

/// Kernel command-line key naming the config server host.
pub const KARG_CONFIG_SERVER: &str = "nodeconfigserver";
/// Kernel command-line key naming the config server port.
pub const KARG_CONFIG_SERVER_PORT: &str = "nodeconfigserverport";

/// In production the agent runs as PID 1 with no arguments and all of these keep their
/// defaults. The overrides exist so individual stages can be exercised from a shell in an
/// already-booted system.
#[derive(Debug, Parser)]
#[clap(name = "node-provisioner", version)]
pub struct AgentOpts {
    /// Kernel command line to read instead of /proc/cmdline
    #[clap(long, value_name = "PATH", default_value = "/proc/cmdline")]
    pub cmdline_path: String,
    /// Ignition declaration shipped in the initramfs
    #[clap(long, value_name = "PATH", default_value = "/ignition.json")]
    pub ignition_file: String,
    /// Mount point for the target root
    #[clap(long, value_name = "DIR", default_value = "/sysroot")]
    pub sysroot: String,
    /// Scratch space surviving the target-root unmount
    #[clap(long, value_name = "DIR", default_value = "/tmp")]
    pub scratch_dir: String,
    /// Skip pseudo-filesystem mounts, module loading, and DHCP
    #[clap(long)]
    pub skip_early_setup: bool,
}

/// The `key=value` tokens of the kernel command line.
#[derive(Debug)]
pub struct KargMap(HashMap<String, String>);

impl KargMap {
    pub fn read_from(path: &str) -> Result<Self> {
        let contents =
            read_to_string(path).with_context(|| format!("reading kernel command line {path}"))?;
        Ok(Self::parse(&contents))
    }

    /// Tokens without `=` are ignored; on duplicate keys the last occurrence wins. The value is
    /// everything after the first `=`, so `root=UUID=x` maps `root` to `UUID=x`.
    pub fn parse(cmdline: &str) -> Self {
        let mut map = HashMap::new();
        for token in cmdline.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                map.insert(key.to_string(), value.to_string());
            }
        }
        KargMap(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(value) => Ok(value),
            None => bail!("missing required kernel argument {key}"),
        }
    }
}
