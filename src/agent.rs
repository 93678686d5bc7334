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

//! The boot-provisioning state machine. Strictly sequential: every step depends on the previous
//! one's side effects on kernel state (module loads, mounts, device nodes), so there is nothing
//! to run concurrently. Any fatal error propagates to main, which drops to an emergency shell.

use anyhow::{Context, Result};
use nix::sys::stat::{umask, Mode};
use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs::{copy as fscopy, create_dir_all, set_permissions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::blockdev::{assemble_raid, device_present, filesystem_type, Mount};
use crate::cmdline::{AgentOpts, KargMap, KARG_CONFIG_SERVER, KARG_CONFIG_SERVER_PORT};
use crate::errors::ProvisionError;
use crate::ignition::{provision_storage, IgnitionDeclaration};
use crate::kexec;
use crate::netconfig::write_network_config;
use crate::network;
use crate::nodeconfig::fetch_node_config;
use crate::personalize::personalize;
use crate::rootfs::{self, FS_INSTALLED_MARKER};
use crate::services::apply_service_toggles;
use crate::{runcmd, runcmd_tolerant};

/// Modules needed before storage and network probing can work: USB input, virtio, Mellanox
/// NICs, and NVMe.
const KERNEL_MODULES: &[&str] = &[
    "usbhid",
    "ehci-hcd",
    "xhci-hcd",
    "virtio",
    "virtio_pci",
    "virtio_blk",
    "virtio_net",
    "virtio_scsi",
    "virtio_ring",
    "mlx5_core",
    "mlx5_en",
    "mlx5_ib",
    "mlx5_eswitch",
    "nvme",
    "nvme_core",
    "nvme_pci",
];

/// Run the provisioning state machine to completion. On success this never returns: the process
/// is replaced by the handoff script.
pub fn run(opts: &AgentOpts) -> Result<Infallible> {
    eprintln!("Starting network-boot provisioning agent");
    extend_path();

    if !opts.skip_early_setup {
        early_setup()?;
    }

    // CONFIG: who are we, and what should this node look like?
    let kargs = KargMap::read_from(&opts.cmdline_path)?;
    let server = kargs.require(KARG_CONFIG_SERVER)?;
    let port = kargs
        .require(KARG_CONFIG_SERVER_PORT)?
        .parse::<u16>()
        .with_context(|| format!("parsing {KARG_CONFIG_SERVER_PORT}"))?;
    let outbound_ip = network::outbound_ipv4(server, port)?;
    let mac = network::mac_for_ipv4(outbound_ip)?;
    eprintln!("Host identity: {outbound_ip} ({mac})");
    let config = fetch_node_config(server, port, &mac)?;
    let ignition = IgnitionDeclaration::read_from(&opts.ignition_file)?;

    // ROOT: make the declared root device exist, carry a filesystem, and be mounted.
    let sysroot = Path::new(&opts.sysroot);
    let root_fs = ignition.root_filesystem()?.clone();
    assemble_raid(&root_fs, &ignition)?;
    if !device_present(&root_fs.device) || filesystem_type(&root_fs.device)?.is_none() {
        eprintln!("Root device {} not usable yet; provisioning disks", root_fs.device);
        provision_storage(&opts.ignition_file)?;
    }
    eprintln!(
        "Mounting {} at {} as {}",
        root_fs.device,
        sysroot.display(),
        root_fs.format
    );
    let root_mount = Mount::try_mount(&root_fs.device, &root_fs.format, sysroot)?;

    // SYNC: populate the root filesystem if it never was, or if the config demands it.
    if !sysroot.join(FS_INSTALLED_MARKER).exists() || config.wants_resync() {
        let source = config
            .rootfs_source
            .as_deref()
            .unwrap_or(rootfs::DEFAULT_ROOTFS_SOURCE);
        rootfs::sync_rootfs(source, sysroot)?;
    } else {
        eprintln!("Root filesystem already installed; skipping sync");
    }

    // HANDOFF: reconcile the handoff script against the config timestamp.
    let scratch = Path::new(&opts.scratch_dir);
    let marker = sysroot.join(kexec::BOOTSTRAPPED_MARKER);
    if kexec::handoff_is_stale(&marker, config.config_timestamp) {
        eprintln!("Handoff script is missing or stale; regenerating");
        kexec::write_handoff_script(sysroot, scratch, &config, &ignition)?;
    } else {
        eprintln!("Handoff script is current");
    }

    // PERSONALIZE: identity, network config, staged handoff artifacts, target services.
    personalize(sysroot, &config)?;
    write_network_config(sysroot, &config)?;
    stage_handoff_artifacts(sysroot, scratch, &config.kernel, &config.initrd)?;
    apply_service_toggles(sysroot, scratch, &config.systemd)?;

    runcmd!("sync")?;
    root_mount.unmount()?;

    // EXEC
    kexec::exec_handoff(&scratch.join(kexec::SCRATCH_HANDOFF))
}

/// Replace the current process with an interactive shell. The terminal state for unrecoverable
/// errors; returns only if even the shell cannot be executed.
pub fn emergency_shell() -> Result<Infallible> {
    let shell = CString::new("/bin/bash").context("converting shell path")?;
    Ok(nix::unistd::execv(&shell, &[shell.as_c_str()]).context("executing /bin/bash")?)
}

/// The initramfs ships tools across the usual bin directories; make sure they all resolve.
fn extend_path() {
    let path = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{path}:/usr/bin:/usr/sbin:/bin:/usr/local/bin"));
}

/// Early userspace bring-up: pseudo-filesystems, kernel modules, device nodes, and a DHCP
/// lease. Individual mounts and module loads are tolerated failures (they may already be done,
/// or the hardware may be absent); a missing network is not, since the config server would be
/// unreachable.
fn early_setup() -> Result<()> {
    eprintln!("Mounting pseudo-filesystems");
    runcmd_tolerant!("mount", "-t", "proc", "none", "/proc");
    runcmd_tolerant!("mount", "-t", "sysfs", "none", "/sys");

    eprintln!("Loading kernel modules");
    for module in KERNEL_MODULES {
        runcmd_tolerant!("modprobe", module);
    }
    runcmd_tolerant!("lsmod");

    eprintln!("Populating /dev");
    runcmd_tolerant!("mount", "-t", "devtmpfs", "devtmpfs", "/dev");
    runcmd_tolerant!("/bin/mdev", "-s");

    runcmd_tolerant!(
        "mount", "-t", "tmpfs", "tmpfs", "/run", "-o", "mode=0755,nodev,nosuid"
    );
    umask(Mode::from_bits_truncate(0o077));

    if !network::configure_network()? {
        return Err(ProvisionError::NoNetwork.into());
    }
    Ok(())
}

/// Copy the kernel, initramfs, and handoff script out of the target root into scratch space, so
/// kexec can still find them after the target root is unmounted.
fn stage_handoff_artifacts(
    sysroot: &Path,
    scratch: &Path,
    kernel: &str,
    initrd: &str,
) -> Result<()> {
    eprintln!("Staging kernel, initramfs, and handoff script in {}", scratch.display());
    create_dir_all(scratch).with_context(|| format!("creating {}", scratch.display()))?;

    let kernel_src = join_target(sysroot, kernel);
    fscopy(&kernel_src, scratch.join(kexec::SCRATCH_KERNEL))
        .with_context(|| format!("copying {}", kernel_src.display()))?;
    let initrd_src = join_target(sysroot, initrd);
    fscopy(&initrd_src, scratch.join(kexec::SCRATCH_INITRD))
        .with_context(|| format!("copying {}", initrd_src.display()))?;

    let handoff_src = sysroot.join(kexec::BOOTSTRAPPED_MARKER);
    let handoff = scratch.join(kexec::SCRATCH_HANDOFF);
    fscopy(&handoff_src, &handoff)
        .with_context(|| format!("copying {}", handoff_src.display()))?;
    set_permissions(&handoff, Permissions::from_mode(0o700))
        .with_context(|| format!("setting file mode for {}", handoff.display()))?;
    Ok(())
}

/// Join a path from the node configuration onto the target root. Config paths are "within the
/// target root" but conventionally written absolute; a leading slash must not escape the root.
fn join_target(sysroot: &Path, path: &str) -> PathBuf {
    sysroot.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_joining() {
        assert_eq!(
            join_target(Path::new("/sysroot"), "/boot/vmlinuz"),
            PathBuf::from("/sysroot/boot/vmlinuz")
        );
        assert_eq!(
            join_target(Path::new("/sysroot"), "boot/vmlinuz"),
            PathBuf::from("/sysroot/boot/vmlinuz")
        );
    }
}
