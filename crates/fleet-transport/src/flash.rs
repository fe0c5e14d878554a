//! Flash-station adapter contract.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_types::{Result, ShellCredentials};

use crate::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashPhase {
    Preparing,
    Writing,
    Verifying,
    Done,
}

/// Point-in-time progress of a flash in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashProgress {
    pub phase: FlashPhase,
    pub percent: f64,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

/// Outcome of a completed flash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashOutcome {
    pub bytes_written: u64,
    pub duration: Duration,
    pub verified: bool,
}

/// Firmware flashing through a station wired to the board.
#[async_trait]
pub trait FlashStation: Send + Sync {
    /// Write the firmware image, optionally verifying it afterwards.
    async fn flash(
        &self,
        board_id: &str,
        firmware: &Path,
        station_credentials: &ShellCredentials,
        board_type: &str,
        verify: bool,
        cancel: &CancelToken,
    ) -> Result<FlashOutcome>;

    /// Abort an in-flight flash for the board.
    async fn cancel_flash(&self, board_id: &str) -> Result<()>;

    /// Progress of an in-flight flash, `None` when nothing is running.
    async fn progress(&self, board_id: &str) -> Result<Option<FlashProgress>>;
}
