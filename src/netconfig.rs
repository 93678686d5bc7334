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

//! Target-system network configuration. Two dialects: a declarative netplan YAML document for
//! most OS types, and line-oriented ifupdown files for DGX nodes. The generators only produce
//! file contents; writing (and purging the netplan directory first, so the dialects can't
//! coexist) happens in write_network_config.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{create_dir_all, remove_file, write};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::nodeconfig::{Interface, NodeConfig};

/// Netplan directory, relative to the target root.
pub const NETPLAN_DIR: &str = "etc/netplan";
/// ifupdown interface-config directory, relative to the target root.
pub const IFUPDOWN_DIR: &str = "etc/network/interfaces.d";
const NETPLAN_FILE: &str = "01-netcfg.yaml";

#[derive(Debug, Serialize)]
struct NetplanDoc {
    network: NetplanNetwork,
}

#[derive(Debug, Serialize)]
struct NetplanNetwork {
    version: u32,
    renderer: String,
    ethernets: BTreeMap<String, NetplanEthernet>,
}

#[derive(Debug, Serialize)]
struct NetplanEthernet {
    // the interface map is treated as static configuration
    dhcp4: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    macaddress: Option<String>,
    addresses: Vec<String>,
    routes: Vec<NetplanRoute>,
}

#[derive(Debug, Serialize)]
struct NetplanRoute {
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    via: Option<String>,
}

/// Render the netplan document for the given interfaces. serde_yaml emits plain scalars with no
/// anchors or aliases, so repeated values (e.g. the same gateway on two interfaces) are simply
/// duplicated, which is what netplan parsers expect.
pub fn generate_netplan(interfaces: &BTreeMap<String, Interface>) -> Result<String> {
    let mut ethernets = BTreeMap::new();
    for (name, interface) in interfaces {
        let mut addresses = Vec::new();
        if let (Some(ipv4), Some(netmask)) = (&interface.ipv4, &interface.netmask) {
            match cidr_for(ipv4, netmask) {
                Ok(cidr) => addresses.push(cidr),
                Err(err) => eprintln!("Warning: skipping address for {name}: {err:#}"),
            }
        }

        let mut routes = Vec::new();
        if let Some(gateway) = &interface.gateway {
            routes.push(NetplanRoute {
                to: "0.0.0.0/0".to_string(),
                via: Some(gateway.clone()),
            });
        }
        for route in &interface.routes {
            // the gateway already represents the default route
            if route.default {
                continue;
            }
            routes.push(NetplanRoute {
                to: route.ip_or_range.clone(),
                via: None,
            });
        }

        ethernets.insert(
            name.clone(),
            NetplanEthernet {
                dhcp4: false,
                macaddress: interface.mac.clone(),
                addresses,
                routes,
            },
        );
    }

    let doc = NetplanDoc {
        network: NetplanNetwork {
            version: 2,
            renderer: "networkd".to_string(),
            ethernets,
        },
    };
    serde_yaml::to_string(&doc).context("serializing netplan config")
}

/// Render one ifupdown config per interface. Returns interface name → file contents; file names
/// are `<interface>.cfg`.
pub fn generate_ifupdown(interfaces: &BTreeMap<String, Interface>) -> BTreeMap<String, String> {
    let mut configs = BTreeMap::new();
    for (name, interface) in interfaces {
        let mut lines = vec![format!("auto {name}"), format!("iface {name} inet static")];

        if let Some(mac) = &interface.mac {
            lines.push(format!("    hwaddress ether {mac}"));
        }

        if let (Some(ipv4), Some(netmask)) = (&interface.ipv4, &interface.netmask) {
            match cidr_for(ipv4, netmask) {
                Ok(_) => {
                    lines.push(format!("    address {ipv4}"));
                    lines.push(format!("    netmask {netmask}"));
                }
                Err(err) => eprintln!("Warning: skipping address for {name}: {err:#}"),
            }
        }

        if let Some(gateway) = &interface.gateway {
            lines.push(format!("    gateway {gateway}"));
        }

        for route in &interface.routes {
            if route.default {
                continue;
            }
            lines.push(format!(
                "    post-up ip route add {} dev {name}",
                route.ip_or_range
            ));
        }

        configs.insert(name.clone(), lines.join("\n") + "\n");
    }
    configs
}

/// `a.b.c.d/prefix` from a dotted-quad address and netmask.
fn cidr_for(ipv4: &str, netmask: &str) -> Result<String> {
    let addr: Ipv4Addr = ipv4
        .parse()
        .with_context(|| format!("parsing address {ipv4}"))?;
    let prefix = netmask_prefix_len(netmask)?;
    Ok(format!("{addr}/{prefix}"))
}

fn netmask_prefix_len(netmask: &str) -> Result<u32> {
    let mask: Ipv4Addr = netmask
        .parse()
        .with_context(|| format!("parsing netmask {netmask}"))?;
    let bits = u32::from(mask);
    let prefix = bits.count_ones();
    if bits.leading_ones() != prefix {
        bail!("non-contiguous netmask {netmask}");
    }
    Ok(prefix)
}

/// Remove every YAML config from the netplan directory. Run before either dialect is written so
/// stale declarative configs can't shadow the chosen one. A missing directory is fine.
pub fn purge_netplan_configs(netplan_dir: &Path) -> Result<()> {
    if !netplan_dir.is_dir() {
        return Ok(());
    }
    let pattern = netplan_dir.join("*.yaml");
    let pattern = pattern
        .to_str()
        .with_context(|| format!("non-UTF-8 path {}", pattern.display()))?;
    for entry in glob::glob(pattern).context("globbing netplan configs")? {
        let path = entry.context("reading glob entry")?;
        eprintln!("Removing stale netplan config {}", path.display());
        remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Write the network configuration for the chosen dialect into the target root.
pub fn write_network_config(sysroot: &Path, config: &NodeConfig) -> Result<()> {
    // BTreeMap for deterministic file and key ordering
    let interfaces: BTreeMap<String, Interface> = config
        .interfaces
        .iter()
        .map(|(name, interface)| (name.clone(), interface.clone()))
        .collect();

    let netplan_dir = sysroot.join(NETPLAN_DIR);
    purge_netplan_configs(&netplan_dir)?;

    if config.is_dgx() {
        let dir = sysroot.join(IFUPDOWN_DIR);
        create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        for (name, contents) in generate_ifupdown(&interfaces) {
            let path = dir.join(format!("{name}.cfg"));
            write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Wrote interface config {}", path.display());
        }
    } else {
        create_dir_all(&netplan_dir)
            .with_context(|| format!("creating {}", netplan_dir.display()))?;
        let path = netplan_dir.join(NETPLAN_FILE);
        write(&path, generate_netplan(&interfaces)?)
            .with_context(|| format!("writing {}", path.display()))?;
        eprintln!("Wrote netplan config {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeconfig::Route;
    use maplit::btreemap;
    use std::fs::read_dir;

    fn interface(
        mac: Option<&str>,
        ipv4: Option<&str>,
        netmask: Option<&str>,
        gateway: Option<&str>,
        routes: Vec<Route>,
    ) -> Interface {
        Interface {
            mac: mac.map(String::from),
            ipv4: ipv4.map(String::from),
            netmask: netmask.map(String::from),
            gateway: gateway.map(String::from),
            routes,
        }
    }

    #[test]
    fn netmask_conversion() {
        assert_eq!(netmask_prefix_len("255.255.255.0").unwrap(), 24);
        assert_eq!(netmask_prefix_len("255.255.255.255").unwrap(), 32);
        assert_eq!(netmask_prefix_len("0.0.0.0").unwrap(), 0);
        assert_eq!(netmask_prefix_len("255.255.240.0").unwrap(), 20);
        assert!(netmask_prefix_len("255.0.255.0").is_err());
        assert!(netmask_prefix_len("garbage").is_err());
    }

    #[test]
    fn cidr_literals() {
        assert_eq!(
            cidr_for("10.10.6.20", "255.255.255.0").unwrap(),
            "10.10.6.20/24"
        );
        assert!(cidr_for("10.10.6.20", "255.0.255.0").is_err());
        assert!(cidr_for("not-an-ip", "255.255.255.0").is_err());
    }

    #[test]
    fn netplan_document() {
        let interfaces = btreemap! {
            "eno1".to_string() => interface(
                Some("00:1b:21:ab:cd:ef"),
                Some("10.10.6.20"),
                Some("255.255.255.0"),
                Some("10.10.6.1"),
                vec![
                    Route { ip_or_range: "0.0.0.0/0".to_string(), default: true },
                    Route { ip_or_range: "192.168.10.0/24".to_string(), default: false },
                ],
            ),
        };
        let yaml = generate_netplan(&interfaces).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let network = &doc["network"];
        assert_eq!(network["version"], serde_yaml::Value::from(2));
        assert_eq!(network["renderer"], serde_yaml::Value::from("networkd"));
        let eno1 = &network["ethernets"]["eno1"];
        assert_eq!(eno1["dhcp4"], serde_yaml::Value::from(false));
        assert_eq!(
            eno1["macaddress"],
            serde_yaml::Value::from("00:1b:21:ab:cd:ef")
        );
        assert_eq!(eno1["addresses"][0], serde_yaml::Value::from("10.10.6.20/24"));
        // default route from the gateway first, then non-default extras; the
        // declared default route is skipped
        assert_eq!(eno1["routes"][0]["to"], serde_yaml::Value::from("0.0.0.0/0"));
        assert_eq!(eno1["routes"][0]["via"], serde_yaml::Value::from("10.10.6.1"));
        assert_eq!(
            eno1["routes"][1]["to"],
            serde_yaml::Value::from("192.168.10.0/24")
        );
        assert!(eno1["routes"][1].get("via").is_none());
        assert!(eno1["routes"].as_sequence().unwrap().len() == 2);
        // no anchors or aliases
        assert!(!yaml.contains('&'));
        assert!(!yaml.contains('*'));
    }

    #[test]
    fn netplan_invalid_address_omitted() {
        let interfaces = btreemap! {
            "eno1".to_string() => interface(
                None,
                Some("10.10.6.20"),
                Some("255.0.255.0"),
                None,
                vec![],
            ),
        };
        let yaml = generate_netplan(&interfaces).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let eno1 = &doc["network"]["ethernets"]["eno1"];
        assert!(eno1["addresses"].as_sequence().unwrap().is_empty());
        assert!(eno1.get("macaddress").is_none());
    }

    #[test]
    fn ifupdown_template() {
        let interfaces = btreemap! {
            "eno1".to_string() => interface(
                Some("00:1b:21:ab:cd:ef"),
                Some("10.10.6.20"),
                Some("255.255.255.0"),
                Some("10.10.6.1"),
                vec![
                    Route { ip_or_range: "192.168.10.0/24".to_string(), default: false },
                    Route { ip_or_range: "0.0.0.0/0".to_string(), default: true },
                ],
            ),
            "eno2".to_string() => interface(
                None,
                Some("172.16.0.9"),
                Some("255.255.0.0"),
                None,
                vec![],
            ),
        };
        let configs = generate_ifupdown(&interfaces);
        assert_eq!(
            configs["eno1"],
            "\
auto eno1
iface eno1 inet static
    hwaddress ether 00:1b:21:ab:cd:ef
    address 10.10.6.20
    netmask 255.255.255.0
    gateway 10.10.6.1
    post-up ip route add 192.168.10.0/24 dev eno1
"
        );
        assert_eq!(
            configs["eno2"],
            "\
auto eno2
iface eno2 inet static
    address 172.16.0.9
    netmask 255.255.0.0
"
        );
    }

    #[test]
    fn purge_only_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path().join("01-netcfg.yaml"), "network: {}\n").unwrap();
        write(dir.path().join("50-other.yaml"), "network: {}\n").unwrap();
        write(dir.path().join("README"), "keep me\n").unwrap();
        purge_netplan_configs(dir.path()).unwrap();
        let remaining: Vec<String> = read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["README".to_string()]);
        // missing directory is tolerated
        purge_netplan_configs(&dir.path().join("nonexistent")).unwrap();
    }

    #[test]
    fn dialect_exclusivity() {
        use crate::nodeconfig::NodeConfig;
        let base: NodeConfig = serde_json::from_str(
            r#"{
                "name": "n", "ssh_key": "k", "kernel": "/boot/vmlinuz",
                "initrd": "/boot/initrd.img", "kernel_arguments": "ro",
                "config_timestamp": 1,
                "interfaces": {"eno1": {"ipv4": "10.0.0.5", "netmask": "255.255.255.0"}}
            }"#,
        )
        .unwrap();

        // declarative dialect: stale yaml replaced, no ifupdown files
        let root = tempfile::tempdir().unwrap();
        let netplan_dir = root.path().join(NETPLAN_DIR);
        create_dir_all(&netplan_dir).unwrap();
        write(netplan_dir.join("99-stale.yaml"), "network: {}\n").unwrap();
        write_network_config(root.path(), &base).unwrap();
        assert!(netplan_dir.join("01-netcfg.yaml").exists());
        assert!(!netplan_dir.join("99-stale.yaml").exists());
        assert!(!root.path().join(IFUPDOWN_DIR).exists());

        // dgx dialect: netplan dir purged, one .cfg per interface
        let mut dgx = base.clone();
        dgx.os_type = "dgx".to_string();
        let root = tempfile::tempdir().unwrap();
        let netplan_dir = root.path().join(NETPLAN_DIR);
        create_dir_all(&netplan_dir).unwrap();
        write(netplan_dir.join("01-netcfg.yaml"), "network: {}\n").unwrap();
        write_network_config(root.path(), &dgx).unwrap();
        assert!(!netplan_dir.join("01-netcfg.yaml").exists());
        assert!(root.path().join(IFUPDOWN_DIR).join("eno1.cfg").exists());
    }
}
