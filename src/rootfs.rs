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
use std::fs::write;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::ProvisionError;
use crate::runcmd;

/// Presence of this file under the target root asserts that the root filesystem has been
/// populated at least once.
pub const FS_INSTALLED_MARKER: &str = ".filesystem_installed_marker";

/// Image source used when the node configuration doesn't carry one.
pub const DEFAULT_ROOTFS_SOURCE: &str = "rsync://10.10.6.5/images/k8s-worker-dgx-h200-image-060525/*";

const SYNC_ATTEMPTS: u32 = 5;
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Stream the root filesystem image into the mounted target root, retrying a bounded number of
/// times. On success the installed marker is created (or refreshed).
pub fn sync_rootfs(source: &str, sysroot: &Path) -> Result<()> {
    for attempt in 1..=SYNC_ATTEMPTS {
        eprintln!(
            "Syncing root filesystem from {source} (attempt {attempt} of {SYNC_ATTEMPTS})"
        );
        match runcmd!(
            "rsync",
            "-azP",
            "--info=progress2,name0",
            "--no-inc-recursive",
            source,
            sysroot
        ) {
            Ok(()) => {
                write_marker(&sysroot.join(FS_INSTALLED_MARKER))?;
                return Ok(());
            }
            Err(err) => {
                eprintln!("{err:#}");
                if attempt < SYNC_ATTEMPTS {
                    eprintln!("Retrying in {}s...", SYNC_RETRY_DELAY.as_secs());
                    sleep(SYNC_RETRY_DELAY);
                }
            }
        }
    }
    Err(ProvisionError::RootfsSyncFailed(SYNC_ATTEMPTS).into())
}

/// Create a marker file whose presence records stage completion. The body is a human-readable
/// note; only the file's existence (and mtime) is meaningful.
pub fn write_marker(path: &Path) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let note = format!("completed at {} (pid {})\n", now, std::process::id());
    write(path, note).with_context(|| format!("writing marker {}", path.display()))
}
