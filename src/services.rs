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

use anyhow::{Context, Result};
use std::fs::{set_permissions, write, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::nodeconfig::SystemdServices;
use crate::runcmd;

const TOGGLE_SCRIPT: &str = "systemd_services.sh";

/// Enable and disable systemd units inside the target root. systemctl under chroot needs a
/// login-shell environment and the target's /dev, /proc, and /sys, so this is the one place a
/// generated shell script is used instead of direct tool invocation.
pub fn apply_service_toggles(
    sysroot: &Path,
    scratch: &Path,
    services: &SystemdServices,
) -> Result<()> {
    if services.enable.is_empty() && services.disable.is_empty() {
        return Ok(());
    }

    let path = scratch.join(TOGGLE_SCRIPT);
    write(&path, render_toggle_script(sysroot, services))
        .with_context(|| format!("writing {}", path.display()))?;
    set_permissions(&path, Permissions::from_mode(0o755))
        .with_context(|| format!("setting file mode for {}", path.display()))?;

    eprintln!(
        "Toggling services in target ({} to enable, {} to disable)",
        services.enable.len(),
        services.disable.len()
    );
    runcmd!(&path).context("toggling systemd services in target")
}

/// An individual toggle failure must not abort the script: the remaining services still get
/// toggled and the bind-mounts are always unwound. The orchestrator observes the script's
/// overall exit status.
fn render_toggle_script(sysroot: &Path, services: &SystemdServices) -> String {
    let root = sysroot.display();
    let mut script = format!(
        "#!/bin/bash\n\
         mount --bind /dev {root}/dev\n\
         mount --bind /proc {root}/proc\n\
         mount --bind /sys {root}/sys\n"
    );
    for service in &services.enable {
        script.push_str(&format!(
            "chroot {root} /bin/bash -c 'systemctl enable {service}'\n"
        ));
    }
    for service in &services.disable {
        script.push_str(&format!(
            "chroot {root} /bin/bash -c 'systemctl disable {service}'\n"
        ));
    }
    script.push_str(&format!(
        "umount {root}/sys\numount {root}/proc\numount {root}/dev\n"
    ));
    script
}
