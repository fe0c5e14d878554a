//! Out-of-band power-control adapter contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_types::{PowerControlConfig, Result};

use crate::CancelToken;

/// Outcome of a power cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCycleResult {
    pub off_ok: bool,
    pub on_ok: bool,
    /// Whether the asset responded after the cycle, when the adapter
    /// could observe it.
    pub recovered: Option<bool>,
}

/// Power switching for boards.
///
/// Only usb-hub, network-pdu, and gpio-relay methods can be commanded;
/// implementations must reject `Manual` configs with a conflict error
/// rather than pretending to act.
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn power_on(
        &self,
        board_id: &str,
        config: &PowerControlConfig,
        cancel: &CancelToken,
    ) -> Result<()>;

    async fn power_off(
        &self,
        board_id: &str,
        config: &PowerControlConfig,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Off, wait `delay`, on.
    async fn power_cycle(
        &self,
        board_id: &str,
        config: &PowerControlConfig,
        delay: Duration,
        cancel: &CancelToken,
    ) -> Result<PowerCycleResult>;
}
