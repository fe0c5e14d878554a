//! Short-lived reservation ledger.
//!
//! A reservation is a TTL-bounded hold taken between "the selector picked
//! this asset" and "the work actually started". At most one live
//! reservation may reference an asset; the check-and-mark happens under
//! one mutex. Expired holds are pruned lazily on every access and by the
//! periodic sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fleet_types::{Error, Reservation, Result, new_id};

/// Default hold length between selection and hand-off.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct LedgerState {
    by_id: HashMap<String, Reservation>,
    by_asset: HashMap<String, String>,
}

/// Reservation book for one selector.
pub struct ReservationLedger {
    state: Mutex<LedgerState>,
    ttl: Duration,
}

impl Default for ReservationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ReservationLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            ttl,
        }
    }

    /// Paused-clock friendly now.
    fn now() -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn prune(state: &mut LedgerState, now: Instant) {
        let expired: Vec<String> = state
            .by_id
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            if let Some(reservation) = state.by_id.remove(&id) {
                state.by_asset.remove(&reservation.asset_id);
            }
        }
    }

    /// Check-and-mark: fails with a conflict when a live reservation
    /// already references the asset.
    pub fn try_reserve(&self, asset_id: &str, purpose: &str) -> Result<Reservation> {
        let now = Self::now();
        let mut state = self.state.lock().expect("ledger lock");
        Self::prune(&mut state, now);

        if state.by_asset.contains_key(asset_id) {
            return Err(Error::conflict(format!("asset {} already reserved", asset_id)));
        }

        let reservation = Reservation {
            id: new_id("res"),
            asset_id: asset_id.to_string(),
            acquired_at: now,
            ttl: self.ttl,
            purpose: purpose.to_string(),
        };
        state
            .by_asset
            .insert(asset_id.to_string(), reservation.id.clone());
        state
            .by_id
            .insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    /// Release by reservation id. Releasing an expired or unknown hold is
    /// a no-op returning false.
    pub fn release(&self, reservation_id: &str) -> bool {
        let mut state = self.state.lock().expect("ledger lock");
        match state.by_id.remove(reservation_id) {
            Some(reservation) => {
                state.by_asset.remove(&reservation.asset_id);
                true
            }
            None => false,
        }
    }

    /// Whether a live (unexpired) reservation references the asset.
    pub fn is_reserved(&self, asset_id: &str) -> bool {
        let now = Self::now();
        let mut state = self.state.lock().expect("ledger lock");
        Self::prune(&mut state, now);
        state.by_asset.contains_key(asset_id)
    }

    /// Drop every expired reservation, returning how many were reaped.
    pub fn sweep(&self) -> usize {
        let now = Self::now();
        let mut state = self.state.lock().expect("ledger lock");
        let before = state.by_id.len();
        Self::prune(&mut state, now);
        before - state.by_id.len()
    }

    pub fn live_count(&self) -> usize {
        let now = Self::now();
        let mut state = self.state.lock().expect("ledger lock");
        Self::prune(&mut state, now);
        state.by_id.len()
    }

    pub fn get(&self, reservation_id: &str) -> Option<Reservation> {
        let state = self.state.lock().expect("ledger lock");
        state.by_id.get(reservation_id).cloned()
    }
}
