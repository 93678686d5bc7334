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
use nix::ifaddrs::getifaddrs;
use std::fs::{create_dir_all, read_dir};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::fs::symlink;
use std::path::Path;

use crate::errors::ProvisionError;
use crate::runcmd_tolerant;

/// The IPv4 address the routing table selects for traffic toward the config server. Connecting
/// a datagram socket sends no packets; it only fixes the local endpoint, which is exactly the
/// address the config server would see us from.
pub fn outbound_ipv4(server: &str, port: u16) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).context("binding UDP socket")?;
    socket
        .connect((server, port))
        .with_context(|| ProvisionError::NoRouteToConfigServer(server.to_string(), port))?;
    match socket.local_addr().context("reading local socket address")? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => bail!("unexpected IPv6 local address {addr}"),
    }
}

/// Hardware address of the interface owning the given IPv4 address, in the lowercase
/// colon-separated form the config server keys node configurations by.
pub fn mac_for_ipv4(target: Ipv4Addr) -> Result<String> {
    let addrs: Vec<_> = getifaddrs()
        .context("listing network interfaces")?
        .collect();
    let owner = addrs
        .iter()
        .find(|ifaddr| {
            ifaddr
                .address
                .as_ref()
                .and_then(|addr| addr.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip()) == target)
                .unwrap_or(false)
        })
        .map(|ifaddr| ifaddr.interface_name.clone())
        .ok_or(ProvisionError::NoInterfaceForIp(target))?;
    for ifaddr in &addrs {
        if ifaddr.interface_name != owner {
            continue;
        }
        if let Some(link) = ifaddr.address.as_ref().and_then(|addr| addr.as_link_addr()) {
            if let Some(mac) = link.addr() {
                return Ok(format_mac(&mac));
            }
        }
    }
    bail!("interface {owner} has no hardware address");
}

fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Walk the host's interfaces and try DHCP on each until one obtains a lease. Returns false if
/// every interface failed; whether that is fatal is the caller's call.
pub fn configure_network() -> Result<bool> {
    if let Err(err) = create_dir_all("/var/lib/dhcp") {
        eprintln!("creating /var/lib/dhcp: {err}; continuing");
    }
    // busybox dhclient expects /var/run, normally a symlink to /run
    if !Path::new("/var/run").exists() {
        if let Err(err) = symlink("/run", "/var/run") {
            eprintln!("symlinking /var/run: {err}; continuing");
        }
    }

    let entries = read_dir("/sys/class/net").context("listing /sys/class/net")?;
    for entry in entries {
        let entry = entry.context("reading /sys/class/net entry")?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.is_empty() || name == "lo" {
            continue;
        }

        eprintln!("Bringing up network interface {name}");
        if !runcmd_tolerant!("ip", "link", "set", "dev", &name, "up") {
            continue;
        }

        eprintln!("Attempting DHCP on {name} (10 second timeout)");
        if runcmd_tolerant!("timeout", "10", "dhclient", "-v", &name) {
            eprintln!("Obtained a DHCP lease on {name}");
            return Ok(true);
        }
        runcmd_tolerant!("ip", "link", "set", "dev", &name, "down");
    }
    Ok(false)
}
