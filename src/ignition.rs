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

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs::{copy as fscopy, create_dir_all, read_to_string};
use std::path::Path;

use crate::errors::ProvisionError;
use crate::runcmd;

/// The external partitioner reads its input from this fixed location.
const RUNTIME_IGNITION_FILE: &str = "/run/ignition.json";
const PARTITIONER_BIN: &str = "/usr/bin/ignition";

/// The disk/filesystem declaration shipped in the initramfs. Parsing is tolerant: unknown keys
/// are ignored, optional fields are absent rather than defaulted.
#[derive(Debug, Clone, Deserialize)]
pub struct IgnitionDeclaration {
    #[serde(default)]
    pub storage: Storage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub filesystems: Vec<Filesystem>,
    #[serde(default)]
    pub raid: Vec<RaidArray>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filesystem {
    pub device: String,
    pub format: String,
    /// Mountpoint within the target system; "/" marks the root filesystem.
    pub path: String,
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaidArray {
    pub name: String,
    pub devices: Vec<String>,
}

impl IgnitionDeclaration {
    pub fn read_from(path: &str) -> Result<Self> {
        Self::load(path).with_context(|| ProvisionError::IgnitionUnreadable(path.to_string()))
    }

    fn load(path: &str) -> Result<Self> {
        let contents = read_to_string(path).with_context(|| format!("reading {path}"))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {path}"))
    }

    pub fn root_filesystem(&self) -> Result<&Filesystem> {
        self.storage
            .filesystems
            .iter()
            .find(|fs| fs.path == "/")
            .ok_or_else(|| anyhow!(ProvisionError::NoRootDeclared))
    }

    /// The declared RAID array whose name matches the last path component of the given device,
    /// if any.
    pub fn raid_for(&self, device: &str) -> Option<&RaidArray> {
        let leaf = Path::new(device).file_name()?.to_str()?;
        self.storage.raid.iter().find(|r| r.name.contains(leaf))
    }
}

/// Invoke the external partitioner to create partitions, arrays, and filesystems per the
/// declaration. The partitioner's contract is a copy of the declaration at a fixed path plus
/// the `file` platform and `disks` stage selectors.
pub fn provision_storage(ignition_path: &str) -> Result<()> {
    create_dir_all("/run").context("creating /run")?;
    fscopy(ignition_path, RUNTIME_IGNITION_FILE)
        .with_context(|| format!("copying {ignition_path} to {RUNTIME_IGNITION_FILE}"))?;

    eprintln!("Running partitioner disk stage");
    runcmd!(PARTITIONER_BIN, "-platform", "file", "-stage", "disks").map_err(|err| {
        eprintln!("{err:#}");
        ProvisionError::ProvisioningFailed
    })?;
    Ok(())
}
