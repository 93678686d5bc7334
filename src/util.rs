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

//! Invocation of the external tools the agent drives. The three macros build the Command and
//! funnel into one failure contract (run_checked): a failed tool is always reported with its
//! full command line and exit status. Callers choose whether that failure is fatal (`runcmd!`,
//! `runcmd_output!`) or survivable (`runcmd_tolerant!`). There is deliberately no shell
//! involved here; the one generated shell script lives in the service toggler.

use anyhow::{bail, Context, Result};
use std::process::Command;

/// Run a tool to completion with inherited stdio. Fails if the tool could not be spawned or
/// exited non-zero. The first macro argument is the executable; the rest are its arguments.
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => ($crate::runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = ::std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::run_checked(&mut cmd)
    }}
}

/// Like runcmd!, but capture standard output (assumed UTF-8) for the caller to parse.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => ($crate::runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = ::std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::run_captured(&mut cmd)
    }}
}

/// Like runcmd!, but a failure is logged and reported as `false` instead of an error. For
/// steps the state machine must survive: stopping RAID arrays that may not exist yet,
/// per-interface DHCP attempts, early pseudo-filesystem mounts.
#[macro_export]
macro_rules! runcmd_tolerant {
    ($cmd:expr) => ($crate::runcmd_tolerant!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = ::std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::run_tolerated(&mut cmd)
    }}
}

/// The shared failure contract for the runcmd! family: spawn errors and non-zero exits both
/// come back as errors naming the full command.
pub fn run_checked(cmd: &mut Command) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("running {cmd:#?}"))?;
    if !status.success() {
        bail!("{cmd:#?} failed with {status}");
    }
    Ok(())
}

/// run_checked with stdout captured for the caller. Whatever the tool wrote to stderr is
/// replayed on our stderr only when it fails.
pub fn run_captured(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {cmd:#?}"))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{cmd:#?} failed with {}", result.status);
    }
    String::from_utf8(result.stdout).with_context(|| format!("decoding output of {cmd:#?}"))
}

/// run_checked demoted to a bool: failure is logged and survivable.
pub fn run_tolerated(cmd: &mut Command) -> bool {
    match run_checked(cmd) {
        Ok(()) => true,
        Err(err) => {
            eprintln!("{err:#}; continuing");
            false
        }
    }
}
