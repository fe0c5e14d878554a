//! Serial-console adapter contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_types::Result;

use crate::CancelToken;

/// Line settings for opening a serial device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// e.g. `/dev/ttyUSB0`
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
}

fn default_baud() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// An open console. Opaque; the device string is kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLink {
    pub id: String,
    pub device: String,
}

/// Output of a command run over the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialExec {
    pub output: String,
    pub duration: Duration,
}

/// Console access to a board, used when the network path is down.
#[async_trait]
pub trait SerialConsole: Send + Sync {
    /// Open the device with the given line settings.
    async fn open(&self, settings: &SerialSettings, cancel: &CancelToken) -> Result<SerialLink>;

    /// Send a command and collect output until the prompt pattern matches
    /// or the deadline passes.
    async fn exec(
        &self,
        link: &SerialLink,
        command: &str,
        timeout: Duration,
        prompt_pattern: &str,
        cancel: &CancelToken,
    ) -> Result<SerialExec>;

    /// Read until the pattern appears, returning everything read.
    async fn read_until(
        &self,
        link: &SerialLink,
        pattern: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String>;

    /// Send a break signal (often drops a wedged board into its bootloader).
    async fn send_break(&self, link: &SerialLink) -> Result<()>;

    /// Release the device.
    async fn close(&self, link: SerialLink) -> Result<()>;
}
