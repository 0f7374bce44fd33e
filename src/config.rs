//! Runtime configuration for the machine launcher and the idle reaper.
//!
//! The server binary fills these from command-line flags (with `VMTERM_*`
//! environment fallbacks); tests construct them directly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_QEMU_BINARY: &str = "qemu-system-x86_64";
pub const DEFAULT_IP_BINARY: &str = "ip";
pub const DEFAULT_DISK_IMAGE: &str = "debian-12-nocloud-amd64.qcow2";
pub const DEFAULT_MAC_PREFIX: &str = "e6:c8:ff:09:76";
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmConfig {
    pub binary: String,
    pub disk_image: PathBuf,
    pub disk_format: String,
    pub memory_mb: u32,
    pub accel: String,
    /// First five octets of every guest NIC address; the last octet comes from the machine id
    pub mac_prefix: String,
    /// Pass `-sandbox on` to enable QEMU's seccomp filter
    pub seccomp: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_QEMU_BINARY.to_string(),
            disk_image: PathBuf::from(DEFAULT_DISK_IMAGE),
            disk_format: "qcow2".to_string(),
            memory_mb: 256,
            accel: "kvm".to_string(),
            mac_prefix: DEFAULT_MAC_PREFIX.to_string(),
            seccomp: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REAP_INTERVAL,
            timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}
