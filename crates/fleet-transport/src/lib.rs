//! Transport adapters for reaching fleet assets.
//!
//! Five adapter contracts, all interface-only: remote shell, virtualization
//! host, serial console, out-of-band power, and flash station. The control
//! plane core depends on these traits and never on a concrete backend; real
//! implementations (ssh, libvirt, serial tty, uhubctl/SNMP/gpio, vendor
//! flashing tools) and the deterministic mocks in [`mock`] sit side by side
//! and are chosen by configuration at start-up.
//!
//! Every operation is cancellation-aware: callers pass a [`CancelToken`]
//! and implementations must wake from their current suspension point with
//! [`fleet_types::Error::Cancelled`] and release OS resources promptly.
//!
//! Transport-level retry (exponential backoff on connect/channel failures,
//! never on non-zero exit codes) lives in [`pool::ShellPool`], which also
//! owns per-(user, host, port) connection pooling.

use std::sync::Arc;

use tokio::sync::watch;

pub mod flash;
pub mod mock;
pub mod pool;
pub mod power;
pub mod serial;
pub mod shell;
pub mod virt;

pub use flash::{FlashOutcome, FlashPhase, FlashProgress, FlashStation};
pub use pool::{PoolConfig, PooledSession, ShellPool};
pub use power::{PowerControl, PowerCycleResult};
pub use serial::{SerialConsole, SerialExec, SerialLink, SerialSettings};
pub use shell::{ExecResult, RemoteShell, ShellSession, UploadResult};
pub use virt::{GuestConfig, GuestInfo, GuestState, HostCapabilities, VirtAdapter};

/// Cooperative cancellation signal handed to every adapter call.
///
/// Cancelling is idempotent; clones observe the same signal. A token
/// created with [`CancelToken::none`] never fires.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// A token that can never be cancelled, for call sites without a
    /// surrounding operation.
    pub fn none() -> Self {
        Self::new()
    }

    /// Trigger cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive through the Arc; unreachable in practice.
                return;
            }
        }
    }

    /// Fail fast when already cancelled.
    pub fn check(&self) -> fleet_types::Result<()> {
        if self.is_cancelled() {
            Err(fleet_types::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[tokio::test]
    async fn cancel_is_observable_and_idempotent() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.check(), Err(fleet_types::Error::Cancelled));
        // Must resolve immediately.
        clone.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wakes_a_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(handle.await.expect("join"));
    }
}
