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

//! The kexec-handoff script. A self-contained executable written to the target root whose mtime
//! records when the handoff was last generated; the orchestrator stages a copy in scratch space
//! and finally replaces itself with it.

use anyhow::{Context, Result};
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{metadata, set_permissions, write, Permissions};
use std::os::linux::fs::MetadataExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::blockdev::{is_raid_device, raid_uuid};
use crate::errors::ProvisionError;
use crate::ignition::{Filesystem, IgnitionDeclaration};
use crate::nodeconfig::NodeConfig;

/// The handoff script under the target root. Presence means the node bootstrapped before;
/// mtime is the truth for when the handoff was last generated.
pub const BOOTSTRAPPED_MARKER: &str = ".bootstrapped_marker";

/// Scratch-space names for the staged kernel, initramfs, and handoff script. The handoff script
/// references the kernel and initramfs by these paths, so they are embedded at generation time
/// and must not change between boots.
pub const SCRATCH_KERNEL: &str = "vmlinuz";
pub const SCRATCH_INITRD: &str = "initrd.img";
pub const SCRATCH_HANDOFF: &str = "kexec.sh";

/// Build the kernel command line for the handoff: the configured base arguments, RAID
/// auto-assembly hints when the root lives on an array, and a root= identification. A root UUID
/// from the ignition declaration is preferred; the device path is a fallback worth a warning,
/// since path enumeration can change between boots.
pub fn build_kexec_cmdline(
    kernel_arguments: &str,
    root_fs: &Filesystem,
    raid_uuid: Option<&str>,
) -> Result<String> {
    let mut cmdline = kernel_arguments.trim().to_string();

    if is_raid_device(&root_fs.device) {
        let uuid = raid_uuid.ok_or_else(|| {
            ProvisionError::HandoffGenerationFailed(format!(
                "no RAID UUID for {}",
                root_fs.device
            ))
        })?;
        cmdline = format!("{cmdline} rd.md=1 rd.md.auto=1 rd.md.uuid={uuid}");
    }

    match &root_fs.uuid {
        Some(uuid) => Ok(format!("{cmdline} root=UUID={uuid}")),
        None if !root_fs.device.is_empty() => {
            eprintln!(
                "Warning: no filesystem UUID declared for {}; falling back to the device path",
                root_fs.device
            );
            Ok(format!("{cmdline} root={}", root_fs.device))
        }
        None => Err(ProvisionError::HandoffGenerationFailed(
            "neither a filesystem UUID nor a device path identifies the root".to_string(),
        )
        .into()),
    }
}

fn render_handoff_script(kernel: &Path, initrd: &Path, cmdline: &str) -> String {
    format!(
        "#!/bin/bash\nkexec -l \"{}\" --initrd=\"{}\" --append=\"{}\"\nkexec -e\n",
        kernel.display(),
        initrd.display(),
        cmdline
    )
}

/// (Re)generate the handoff script under the target root, pointing at the kernel and initramfs
/// the orchestrator will stage in scratch space.
pub fn write_handoff_script(
    sysroot: &Path,
    scratch: &Path,
    config: &NodeConfig,
    ignition: &IgnitionDeclaration,
) -> Result<()> {
    let root_fs = ignition.root_filesystem()?;
    let array_uuid = if is_raid_device(&root_fs.device) {
        let uuid = raid_uuid(&root_fs.device).map_err(|err| {
            eprintln!("{err:#}");
            ProvisionError::HandoffGenerationFailed(format!(
                "cannot read RAID UUID for {}",
                root_fs.device
            ))
        })?;
        Some(uuid)
    } else {
        None
    };
    let cmdline = build_kexec_cmdline(&config.kernel_arguments, root_fs, array_uuid.as_deref())?;

    let script = render_handoff_script(
        &scratch.join(SCRATCH_KERNEL),
        &scratch.join(SCRATCH_INITRD),
        &cmdline,
    );
    let path = sysroot.join(BOOTSTRAPPED_MARKER);
    write(&path, script).with_context(|| format!("writing {}", path.display()))?;
    set_permissions(&path, Permissions::from_mode(0o755))
        .with_context(|| format!("setting file mode for {}", path.display()))?;
    eprintln!("Wrote handoff script {}", path.display());
    Ok(())
}

/// Whether the handoff script predates the node configuration (or doesn't exist) and must be
/// regenerated.
pub fn handoff_is_stale(marker: &Path, config_timestamp: i64) -> bool {
    is_stale(marker_mtime(marker), config_timestamp)
}

fn is_stale(mtime: Option<i64>, config_timestamp: i64) -> bool {
    match mtime {
        Some(mtime) => mtime < config_timestamp,
        None => true,
    }
}

fn marker_mtime(path: &Path) -> Option<i64> {
    metadata(path).ok().map(|meta| meta.st_mtime())
}

/// Replace the current process with the handoff script. Returns only on failure.
pub fn exec_handoff(script: &Path) -> Result<Infallible> {
    eprintln!("Handing control to {}", script.display());
    let path = CString::new(script.as_os_str().as_bytes())
        .with_context(|| format!("converting {}", script.display()))?;
    Ok(nix::unistd::execv(&path, &[path.as_c_str()])
        .with_context(|| format!("executing {}", script.display()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_fs(device: &str, uuid: Option<&str>) -> Filesystem {
        Filesystem {
            device: device.to_string(),
            format: "ext4".to_string(),
            path: "/".to_string(),
            uuid: uuid.map(String::from),
        }
    }

    #[test]
    fn cmdline_plain_disk_with_uuid() {
        let cmdline =
            build_kexec_cmdline("ro quiet", &root_fs("/dev/sda2", Some("1111-AAAA")), None)
                .unwrap();
        assert_eq!(cmdline, "ro quiet root=UUID=1111-AAAA");
    }

    #[test]
    fn cmdline_plain_disk_device_fallback() {
        let cmdline = build_kexec_cmdline("ro quiet", &root_fs("/dev/sda2", None), None).unwrap();
        assert_eq!(cmdline, "ro quiet root=/dev/sda2");
        assert!(!cmdline.contains("UUID="));
    }

    #[test]
    fn cmdline_raid_root() {
        let cmdline = build_kexec_cmdline(
            "ro quiet",
            &root_fs("/dev/md0", Some("2222-BBBB")),
            Some("b3c69a4f:12f43c60:9a7deb35:2d3f4c11"),
        )
        .unwrap();
        assert_eq!(
            cmdline,
            "ro quiet rd.md=1 rd.md.auto=1 rd.md.uuid=b3c69a4f:12f43c60:9a7deb35:2d3f4c11 root=UUID=2222-BBBB"
        );
        assert!(cmdline.starts_with("ro quiet"));
    }

    #[test]
    fn cmdline_raid_without_uuid_fails() {
        assert!(build_kexec_cmdline("ro", &root_fs("/dev/md0", None), None).is_err());
    }

    #[test]
    fn cmdline_no_root_identification_fails() {
        assert!(build_kexec_cmdline("ro", &root_fs("", None), None).is_err());
    }

    #[test]
    fn script_rendering() {
        let script = render_handoff_script(
            Path::new("/tmp/vmlinuz"),
            Path::new("/tmp/initrd.img"),
            "ro quiet root=UUID=1111-AAAA",
        );
        assert_eq!(
            script,
            "#!/bin/bash\nkexec -l \"/tmp/vmlinuz\" --initrd=\"/tmp/initrd.img\" --append=\"ro quiet root=UUID=1111-AAAA\"\nkexec -e\n"
        );
    }

    #[test]
    fn staleness_rule() {
        assert!(is_stale(None, 1000));
        assert!(is_stale(Some(999), 1000));
        assert!(!is_stale(Some(1000), 1000));
        assert!(!is_stale(Some(1001), 1000));
    }

    #[test]
    fn staleness_from_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(BOOTSTRAPPED_MARKER);
        // absent marker is always stale
        assert!(handoff_is_stale(&marker, 0));
        write(&marker, "#!/bin/bash\n").unwrap();
        // a freshly written marker postdates any historical config timestamp
        assert!(!handoff_is_stale(&marker, 1000));
        // and predates a config timestamp from the far future
        assert!(handoff_is_stale(&marker, i64::MAX));
    }

    #[test]
    fn generated_script_is_executable() {
        let root = tempfile::tempdir().unwrap();
        let config: NodeConfig = serde_json::from_str(
            r#"{
                "name": "n", "ssh_key": "k", "kernel": "/boot/vmlinuz",
                "initrd": "/boot/initrd.img", "kernel_arguments": "ro quiet",
                "config_timestamp": 1000
            }"#,
        )
        .unwrap();
        let ignition: IgnitionDeclaration = serde_json::from_str(
            r#"{"storage": {"filesystems": [
                {"device": "/dev/sda2", "format": "ext4", "path": "/", "uuid": "1111-AAAA"}
            ]}}"#,
        )
        .unwrap();
        write_handoff_script(root.path(), Path::new("/tmp"), &config, &ignition).unwrap();

        let path = root.path().join(BOOTSTRAPPED_MARKER);
        let mode = metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("#!/bin/bash\n"));
        assert!(body.contains("--append=\"ro quiet root=UUID=1111-AAAA\""));
        assert!(body.ends_with("kexec -e\n"));
    }
}
