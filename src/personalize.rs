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
use std::fs::{create_dir_all, set_permissions, write, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::nodeconfig::NodeConfig;

/// Write the node's identity into the mounted target root: hostname, DNS resolvers, and the
/// administrator's SSH key.
pub fn personalize(sysroot: &Path, config: &NodeConfig) -> Result<()> {
    let hostname = sysroot.join("etc/hostname");
    eprintln!("Writing {}", hostname.display());
    write(&hostname, format!("{}\n", config.name))
        .with_context(|| format!("writing {}", hostname.display()))?;

    let resolv = sysroot.join("etc/resolv.conf");
    eprintln!("Writing {}", resolv.display());
    let mut contents = String::new();
    for server in &config.dns_servers {
        contents.push_str(&format!("nameserver {server}\n"));
    }
    write(&resolv, contents).with_context(|| format!("writing {}", resolv.display()))?;

    let ssh_dir = sysroot.join("root/.ssh");
    create_dir_all(&ssh_dir).with_context(|| format!("creating {}", ssh_dir.display()))?;
    set_permissions(&ssh_dir, Permissions::from_mode(0o700))
        .with_context(|| format!("setting file mode for {}", ssh_dir.display()))?;
    let authorized_keys = ssh_dir.join("authorized_keys");
    eprintln!("Writing {}", authorized_keys.display());
    write(&authorized_keys, format!("{}\n", config.ssh_key))
        .with_context(|| format!("writing {}", authorized_keys.display()))?;
    // the key grants root login; restrict to root
    set_permissions(&authorized_keys, Permissions::from_mode(0o600))
        .with_context(|| format!("setting file mode for {}", authorized_keys.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{metadata, read_to_string};

    fn config() -> NodeConfig {
        serde_json::from_str(
            r#"{
                "name": "worker-03",
                "dns_servers": ["10.0.0.2", "10.0.0.3"],
                "ssh_key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA root@admin",
                "kernel": "/boot/vmlinuz",
                "initrd": "/boot/initrd.img",
                "kernel_arguments": "ro quiet",
                "config_timestamp": 1000
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn target_root_identity() {
        let root = tempfile::tempdir().unwrap();
        create_dir_all(root.path().join("etc")).unwrap();
        personalize(root.path(), &config()).unwrap();

        assert_eq!(
            read_to_string(root.path().join("etc/hostname")).unwrap(),
            "worker-03\n"
        );
        assert_eq!(
            read_to_string(root.path().join("etc/resolv.conf")).unwrap(),
            "nameserver 10.0.0.2\nnameserver 10.0.0.3\n"
        );

        let keys = root.path().join("root/.ssh/authorized_keys");
        // the raw key on a single line, nothing prepended
        assert_eq!(
            read_to_string(&keys).unwrap(),
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA root@admin\n"
        );
        assert_eq!(metadata(&keys).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        create_dir_all(root.path().join("etc")).unwrap();
        personalize(root.path(), &config()).unwrap();
        let before = read_to_string(root.path().join("etc/resolv.conf")).unwrap();
        personalize(root.path(), &config()).unwrap();
        let after = read_to_string(root.path().join("etc/resolv.conf")).unwrap();
        assert_eq!(before, after);
    }
}
