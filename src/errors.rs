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

use std::net::Ipv4Addr;

/// Failure modes of the provisioning state machine. Each variant is either returned directly or
/// attached as context on an anyhow chain carrying the underlying cause. All of them are fatal
/// for the boot (the agent drops to an emergency shell) except where the caller explicitly
/// tolerates the failure.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("no route to config server {0}:{1}")]
    NoRouteToConfigServer(String, u16),
    #[error("no interface owns address {0}")]
    NoInterfaceForIp(Ipv4Addr),
    #[error("no DHCP lease obtained on any interface")]
    NoNetwork,
    #[error("ignition declaration {0} unreadable")]
    IgnitionUnreadable(String),
    #[error("no root filesystem declared in ignition declaration")]
    NoRootDeclared,
    #[error("node configuration unavailable after {0} attempts")]
    NodeConfigUnavailable(u32),
    #[error("disk provisioning failed")]
    ProvisioningFailed,
    #[error("root filesystem sync failed after {0} attempts")]
    RootfsSyncFailed(u32),
    #[error("cannot generate a reliable handoff script: {0}")]
    HandoffGenerationFailed(String),
}
