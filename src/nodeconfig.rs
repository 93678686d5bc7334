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
use reqwest::blocking;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;

use crate::errors::ProvisionError;

const FETCH_ATTEMPTS: u32 = 5;
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-host configuration served by the config server, keyed by MAC address.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Hostname to assign to the node.
    pub name: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    pub ssh_key: String,
    /// Kernel image path within the target root.
    pub kernel: String,
    /// Initramfs image path within the target root.
    pub initrd: String,
    /// Base kernel command line for the handoff; root-device arguments are appended.
    pub kernel_arguments: String,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub provisioning_status: String,
    /// Unix seconds; the handoff script is regenerated when it predates this.
    pub config_timestamp: i64,
    #[serde(default)]
    pub rootfs_source: Option<String>,
    #[serde(default)]
    pub systemd: SystemdServices,
    #[serde(default)]
    pub interfaces: HashMap<String, Interface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemdServices {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub ip_or_range: String,
    #[serde(default)]
    pub default: bool,
}

impl NodeConfig {
    /// DGX nodes use line-oriented interface configs; everything else gets declarative YAML.
    pub fn is_dgx(&self) -> bool {
        self.os_type == "dgx"
    }

    /// A `sync` provisioning status forces a rootfs resync even if one completed before.
    pub fn wants_resync(&self) -> bool {
        self.provisioning_status == "sync"
    }
}

/// Customize and build a new HTTP client.
fn new_http_client() -> Result<blocking::Client> {
    blocking::ClientBuilder::new()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")
}

/// Fetch this node's configuration from the config server, retrying transport failures and
/// non-2xx responses a bounded number of times.
pub fn fetch_node_config(server: &str, port: u16, mac: &str) -> Result<NodeConfig> {
    let url = format!("http://{server}:{port}/nodes/{mac}.json");
    let client = new_http_client()?;
    for attempt in 1..=FETCH_ATTEMPTS {
        eprintln!("Fetching node configuration from {url} (attempt {attempt} of {FETCH_ATTEMPTS})");
        match try_fetch(&client, &url) {
            Ok(config) => return Ok(config),
            Err(err) => {
                eprintln!("Error fetching '{url}': {err:#}");
                if attempt < FETCH_ATTEMPTS {
                    eprintln!("Sleeping {}s and retrying...", FETCH_RETRY_DELAY.as_secs());
                    sleep(FETCH_RETRY_DELAY);
                }
            }
        }
    }
    Err(ProvisionError::NodeConfigUnavailable(FETCH_ATTEMPTS).into())
}

fn try_fetch(client: &blocking::Client, url: &str) -> Result<NodeConfig> {
    let resp = client
        .get(url)
        .send()
        .with_context(|| format!("fetching '{url}'"))?
        .error_for_status()
        .with_context(|| format!("fetching '{url}'"))?;
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.contains("application/json") {
        bail!("unexpected Content-Type {content_type:?} from '{url}'");
    }
    serde_json::from_reader(resp).context("decoding node configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "name": "worker-03",
        "dns_servers": ["10.0.0.2", "10.0.0.3"],
        "ssh_key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA root@admin",
        "kernel": "/boot/vmlinuz",
        "initrd": "/boot/initrd.img",
        "kernel_arguments": "ro quiet",
        "os_type": "dgx",
        "provisioning_status": "sync",
        "config_timestamp": 1717000000,
        "systemd": {"enable": ["kubelet"], "disable": ["apt-daily.timer"]},
        "interfaces": {
            "eno1": {
                "mac": "00:1b:21:ab:cd:ef",
                "ipv4": "10.10.6.20",
                "netmask": "255.255.255.0",
                "gateway": "10.10.6.1",
                "routes": [
                    {"ip_or_range": "0.0.0.0/0", "default": true},
                    {"ip_or_range": "192.168.10.0/24"}
                ]
            }
        }
    }"#;

    #[test]
    fn decode_full_config() {
        let config: NodeConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.name, "worker-03");
        assert!(config.is_dgx());
        assert!(config.wants_resync());
        assert_eq!(config.config_timestamp, 1717000000);
        assert_eq!(config.systemd.enable, vec!["kubelet".to_string()]);
        let eno1 = &config.interfaces["eno1"];
        assert_eq!(eno1.gateway.as_deref(), Some("10.10.6.1"));
        assert!(eno1.routes[0].default);
        assert!(!eno1.routes[1].default);
    }

    #[test]
    fn decode_minimal_config() {
        let config: NodeConfig = serde_json::from_str(
            r#"{
                "name": "worker-04",
                "ssh_key": "ssh-rsa AAAA root@admin",
                "kernel": "/boot/vmlinuz",
                "initrd": "/boot/initrd.img",
                "kernel_arguments": "ro",
                "config_timestamp": 1000,
                "unknown_future_field": {"ignored": true}
            }"#,
        )
        .unwrap();
        assert!(!config.is_dgx());
        assert!(!config.wants_resync());
        assert!(config.dns_servers.is_empty());
        assert!(config.interfaces.is_empty());
        assert!(config.systemd.enable.is_empty());
        assert_eq!(config.rootfs_source, None);
    }
}
