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
use lazy_static::lazy_static;
use nix::mount;
use regex::Regex;
use std::fs::{create_dir_all, metadata, read_to_string};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use crate::ignition::{Filesystem, IgnitionDeclaration};
use crate::{runcmd_output, runcmd_tolerant};

const MDSTAT_PATH: &str = "/proc/mdstat";

/// Software-RAID device paths carry this substring (/dev/md0, /dev/md/root, ...).
const RAID_DEVICE_HINT: &str = "md";

pub fn is_raid_device(device: &str) -> bool {
    device.contains(RAID_DEVICE_HINT)
}

/// Whether a block device node exists at the given path.
pub fn device_present(device: &str) -> bool {
    match metadata(device) {
        Ok(meta) => meta.file_type().is_block_device(),
        Err(_) => false,
    }
}

/// Filesystem type on a block device per blkid, or None if the device carries no identifiable
/// filesystem. blkid exits non-zero in that case, which is not an error for us.
pub fn filesystem_type(device: &str) -> Result<Option<String>> {
    let mut cmd = Command::new("blkid");
    cmd.arg("-o").arg("export").arg("-s").arg("TYPE").arg(device);
    let output = cmd
        .output()
        .with_context(|| format!("running {cmd:#?}"))?;
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{cmd:#?}`"))?;
    Ok(parse_blkid_type(&stdout))
}

/// Parse the TYPE attribute out of `blkid -o export` output.
fn parse_blkid_type(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_prefix("TYPE=")
            .map(|v| v.trim().trim_matches('"').to_string())
    })
}

/// Assemble the RAID array backing the root filesystem, if it is declared on one. Any active
/// arrays are stopped first so a partially-assembled or renamed array can't shadow the declared
/// one. Returns true on successful assembly, false if the root device is not a RAID device or
/// the array could not be assembled (not created yet; the caller proceeds to provisioning).
pub fn assemble_raid(root_fs: &Filesystem, ignition: &IgnitionDeclaration) -> Result<bool> {
    if !is_raid_device(&root_fs.device) {
        return Ok(false);
    }
    let array = ignition.raid_for(&root_fs.device).with_context(|| {
        format!(
            "root device {} looks like a RAID device but no matching array is declared",
            root_fs.device
        )
    })?;

    stop_active_arrays()?;

    eprintln!(
        "Assembling RAID device {} from {}",
        root_fs.device,
        array.devices.join(" ")
    );
    let mut cmd = Command::new("mdadm");
    cmd.arg("--assemble").arg(&root_fs.device).args(&array.devices);
    let status = cmd
        .status()
        .with_context(|| format!("running {cmd:#?}"))?;
    if !status.success() {
        eprintln!(
            "{cmd:#?} failed with {status}; assuming the array has not been created yet"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Stop every array the kernel currently reports active. Failure to stop is tolerated; the
/// array may be gone already.
fn stop_active_arrays() -> Result<()> {
    let mdstat = match read_to_string(MDSTAT_PATH) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {MDSTAT_PATH}")),
        Ok(contents) => contents,
    };
    for name in parse_mdstat_active(&mdstat) {
        let device = format!("/dev/{name}");
        eprintln!("Stopping RAID device {device}");
        runcmd_tolerant!("mdadm", "--stop", &device);
    }
    Ok(())
}

/// Active array names from /proc/mdstat. Lines look like:
///   md0 : active raid1 nvme0n1p2[1] nvme1n1p2[0]
fn parse_mdstat_active(contents: &str) -> Vec<String> {
    lazy_static! {
        static ref MDSTAT_RE: Regex = Regex::new(r"^(md\S*) : active").expect("compiling RE");
    }
    contents
        .lines()
        .filter_map(|line| MDSTAT_RE.captures(line).map(|cap| cap[1].to_string()))
        .collect()
}

/// UUID of an assembled array in canonical colon-separated form.
pub fn raid_uuid(device: &str) -> Result<String> {
    let output = runcmd_output!("mdadm", "--detail", "--export", device)?;
    parse_mdadm_uuid(&output)
        .ok_or_else(|| anyhow!("missing MD_UUID in mdadm --detail output for {device}"))
}

fn parse_mdadm_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("MD_UUID=").map(|v| v.trim().to_string()))
}

/// A mounted filesystem owned by the agent. There is deliberately no unmount-on-drop: on a
/// provisioning failure the target root stays mounted for the emergency shell.
#[derive(Debug)]
pub struct Mount {
    device: String,
    mountpoint: PathBuf,
}

impl Mount {
    pub fn try_mount(device: &str, fstype: &str, mountpoint: &Path) -> Result<Mount> {
        create_dir_all(mountpoint)
            .with_context(|| format!("creating {}", mountpoint.display()))?;
        mount::mount::<str, Path, str, str>(
            Some(device),
            mountpoint,
            Some(fstype),
            mount::MsFlags::empty(),
            None,
        )
        .with_context(|| format!("mounting device {} on {}", device, mountpoint.display()))?;
        Ok(Mount {
            device: device.to_string(),
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    pub fn device(&self) -> &str {
        self.device.as_str()
    }

    pub fn mountpoint(&self) -> &Path {
        self.mountpoint.as_path()
    }

    /// Unmount sometimes fails immediately after closing the last open file on the partition.
    /// Retry several times before giving up.
    pub fn unmount(self) -> Result<()> {
        for _ in 0..19 {
            match mount::umount(&self.mountpoint) {
                Ok(()) => return Ok(()),
                Err(_) => sleep(Duration::from_millis(100)),
            }
        }
        mount::umount(&self.mountpoint)
            .with_context(|| format!("unmounting {}", self.mountpoint.display()))
    }
}
