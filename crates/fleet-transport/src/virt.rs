//! Virtualization-host adapter contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_types::{Result, ShellCredentials};

use crate::CancelToken;

/// Definition of a guest to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub name: String,
    pub architecture: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    /// Remote path of the kernel image to boot.
    pub kernel_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_path: Option<String>,
    #[serde(default)]
    pub kernel_cmdline: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestState {
    Running,
    Stopped,
}

/// A guest as reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestInfo {
    pub name: String,
    pub state: GuestState,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// Host virtualization capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub architecture: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub hw_assist: bool,
    pub nested_virt: bool,
}

/// Guest lifecycle operations on a virtualization host.
#[async_trait]
pub trait VirtAdapter: Send + Sync {
    /// List guests; stopped guests only when asked for.
    async fn list_guests(
        &self,
        credentials: &ShellCredentials,
        include_stopped: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<GuestInfo>>;

    /// Define and start a guest from the given config.
    async fn create_guest(
        &self,
        credentials: &ShellCredentials,
        config: &GuestConfig,
        cancel: &CancelToken,
    ) -> Result<GuestInfo>;

    /// Stop a guest; `undefine` also removes its definition.
    async fn destroy_guest(
        &self,
        credentials: &ShellCredentials,
        name: &str,
        undefine: bool,
        cancel: &CancelToken,
    ) -> Result<bool>;

    /// Query what the host can run.
    async fn capabilities(
        &self,
        credentials: &ShellCredentials,
        cancel: &CancelToken,
    ) -> Result<HostCapabilities>;
}
