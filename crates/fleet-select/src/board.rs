//! Physical-board selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_registry::Registry;
use fleet_types::{Board, BoardStatus, Error, HealthLevel, Reservation, Result};

use crate::ledger::ReservationLedger;

/// What a test run needs from a board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRequirements {
    pub architecture: String,
    #[serde(default)]
    pub board_types: Vec<String>,
    #[serde(default)]
    pub required_peripherals: Vec<String>,
    /// When set, a board whose current firmware differs still matches but
    /// is reported as requiring a flash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_board_id: Option<String>,
    #[serde(default)]
    pub required_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl BoardRequirements {
    pub fn for_architecture(arch: &str) -> Self {
        Self {
            architecture: arch.to_string(),
            board_types: Vec::new(),
            required_peripherals: Vec::new(),
            firmware_version: None,
            preferred_board_id: None,
            required_labels: BTreeMap::new(),
            group_id: None,
        }
    }
}

/// A selected board plus its hold, runners-up, and whether the requested
/// firmware forces a flash first.
#[derive(Debug, Clone)]
pub struct BoardSelection {
    pub board: Board,
    pub reservation: Reservation,
    pub alternatives: Vec<Board>,
    pub requires_flashing: bool,
}

/// Scores and reserves boards.
pub struct BoardSelector {
    registry: Arc<Registry>,
    ledger: ReservationLedger,
    health_weight: f64,
    availability_weight: f64,
    firmware_weight: f64,
}

impl BoardSelector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            ledger: ReservationLedger::default(),
            health_weight: 0.4,
            availability_weight: 0.35,
            firmware_weight: 0.25,
        }
    }

    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    pub fn select(&self, requirements: &BoardRequirements) -> Result<BoardSelection> {
        if let Some(preferred) = &requirements.preferred_board_id {
            if let Ok(board) = self.registry.board(preferred) {
                if self.meets(&board, requirements) && !self.ledger.is_reserved(&board.id) {
                    let reservation = self.ledger.try_reserve(&board.id, "test")?;
                    let requires_flashing = requires_flashing(&board, requirements);
                    return Ok(BoardSelection {
                        board,
                        reservation,
                        alternatives: Vec::new(),
                        requires_flashing,
                    });
                }
            }
        }

        let mut candidates: Vec<(Board, f64)> = self
            .registry
            .boards()
            .into_iter()
            .filter(|b| self.meets(b, requirements) && !self.ledger.is_reserved(&b.id))
            .map(|b| {
                let score = self.score(&b, requirements);
                (b, score)
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::Exhausted {
                wait_estimate: self.estimate_wait(requirements),
            });
        }

        // Boards carry no load counter; ties fall straight to the id.
        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        for (index, (board, score)) in candidates.iter().enumerate() {
            match self.ledger.try_reserve(&board.id, "test") {
                Ok(reservation) => {
                    debug!(board = %board.id, score, "board selected");
                    let alternatives = candidates
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .take(3)
                        .map(|(_, (b, _))| b.clone())
                        .collect();
                    let requires_flashing = requires_flashing(board, requirements);
                    return Ok(BoardSelection {
                        board: board.clone(),
                        reservation,
                        alternatives,
                        requires_flashing,
                    });
                }
                Err(Error::Conflict(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        Err(Error::Exhausted {
            wait_estimate: self.estimate_wait(requirements),
        })
    }

    pub fn release(&self, reservation_id: &str) -> bool {
        self.ledger.release(reservation_id)
    }

    fn meets(&self, board: &Board, requirements: &BoardRequirements) -> bool {
        if !board.can_be_allocated() {
            return false;
        }
        if !board.supports_architecture(&requirements.architecture) {
            return false;
        }
        if !board.matches_type(&requirements.board_types) {
            return false;
        }
        if !board.has_peripherals(&requirements.required_peripherals) {
            return false;
        }
        if let Some(group) = &requirements.group_id {
            if board.group_id.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        requirements
            .required_labels
            .iter()
            .all(|(key, value)| board.labels.get(key) == Some(value))
    }

    /// Weighted score in [0, 1]. The health sub-score is multiplicative:
    /// connectivity sets the base and temperature/storage scale it down.
    fn score(&self, board: &Board, requirements: &BoardRequirements) -> f64 {
        let health_score = health_score(board);

        let availability_score = if board.status == BoardStatus::Available {
            1.0
        } else {
            0.5
        };

        let firmware_score = match &requirements.firmware_version {
            None => 1.0,
            Some(wanted) if board.current_firmware_version.as_deref() == Some(wanted) => 1.0,
            Some(_) => 0.5,
        };

        (self.health_weight * health_score
            + self.availability_weight * availability_score
            + self.firmware_weight * firmware_score)
            .min(1.0)
    }

    fn estimate_wait(&self, requirements: &BoardRequirements) -> Option<u64> {
        let potential: Vec<Board> = self
            .registry
            .boards()
            .into_iter()
            .filter(|b| {
                b.supports_architecture(&requirements.architecture)
                    && b.matches_type(&requirements.board_types)
            })
            .collect();
        if potential.is_empty() {
            return None;
        }
        let in_use = potential
            .iter()
            .filter(|b| b.status == BoardStatus::InUse)
            .count() as u64;
        if in_use == 0 {
            // Nothing to wait out; the blockers are offline or flashing.
            return None;
        }
        // A typical hardware test run is about thirty minutes.
        Some(1800 / in_use)
    }
}

fn health_score(board: &Board) -> f64 {
    let base = match board.health.connectivity {
        HealthLevel::Healthy => 1.0,
        HealthLevel::Degraded => 0.5,
        _ => 0.0,
    };

    let temperature_factor = match board.health.temperature_celsius {
        Some(t) if t < 60.0 => 1.0,
        Some(t) if t < 80.0 => 0.8,
        Some(_) => 0.5,
        None => 1.0,
    };

    let storage_factor = match board.health.storage_percent {
        Some(s) if s < 70.0 => 1.0,
        Some(s) if s < 90.0 => 0.8,
        Some(_) => 0.5,
        None => 1.0,
    };

    base * temperature_factor * storage_factor
}

fn requires_flashing(board: &Board, requirements: &BoardRequirements) -> bool {
    match &requirements.firmware_version {
        None => false,
        Some(wanted) => board.current_firmware_version.as_deref() != Some(wanted.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::sample_board;
    use fleet_types::Asset;

    fn registry_with(boards: Vec<Board>) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        for board in boards {
            registry.register(Asset::Board(board)).expect("register");
        }
        registry
    }

    #[tokio::test]
    async fn selects_matching_board() {
        let registry = registry_with(vec![
            sample_board("brd-arm", "arm64"),
            sample_board("brd-riscv", "riscv64"),
        ]);
        let selector = BoardSelector::new(registry);

        let selection = selector
            .select(&BoardRequirements::for_architecture("riscv64"))
            .expect("select");
        assert_eq!(selection.board.id, "brd-riscv");
        assert!(!selection.requires_flashing);
    }

    #[tokio::test]
    async fn firmware_mismatch_reports_flash_needed() {
        // S6: board runs v1, request wants v2.
        let mut board = sample_board("brd-1", "arm64");
        board.current_firmware_version = Some("v1".to_string());
        let registry = registry_with(vec![board]);
        let selector = BoardSelector::new(registry);

        let mut requirements = BoardRequirements::for_architecture("arm64");
        requirements.firmware_version = Some("v2".to_string());
        let selection = selector.select(&requirements).expect("select");
        assert!(selection.requires_flashing);

        selector.release(&selection.reservation.id);
        requirements.firmware_version = Some("v1".to_string());
        let selection = selector.select(&requirements).expect("select");
        assert!(!selection.requires_flashing);
    }

    #[tokio::test]
    async fn firmware_match_outranks_mismatch() {
        let mut matching = sample_board("brd-match", "arm64");
        matching.current_firmware_version = Some("v2".to_string());
        let mut stale = sample_board("brd-a-stale", "arm64");
        stale.current_firmware_version = Some("v1".to_string());

        let registry = registry_with(vec![matching, stale]);
        let selector = BoardSelector::new(registry);

        let mut requirements = BoardRequirements::for_architecture("arm64");
        requirements.firmware_version = Some("v2".to_string());
        let selection = selector.select(&requirements).expect("select");
        assert_eq!(selection.board.id, "brd-match");
    }

    #[tokio::test]
    async fn peripherals_and_types_filter() {
        let mut camera = sample_board("brd-cam", "arm64");
        camera.peripherals = vec!["camera".to_string(), "can".to_string()];
        let plain = sample_board("brd-plain", "arm64");

        let registry = registry_with(vec![camera, plain]);
        let selector = BoardSelector::new(registry);

        let mut requirements = BoardRequirements::for_architecture("arm64");
        requirements.required_peripherals = vec!["camera".to_string()];
        let selection = selector.select(&requirements).expect("select");
        assert_eq!(selection.board.id, "brd-cam");

        selector.release(&selection.reservation.id);
        requirements.required_peripherals.clear();
        requirements.board_types = vec!["beaglebone_black".to_string()];
        assert!(selector.select(&requirements).is_err());
    }

    #[tokio::test]
    async fn unhealthy_board_ranks_below_healthy() {
        let mut hot = sample_board("brd-a-hot", "arm64");
        hot.health.connectivity = HealthLevel::Degraded;
        hot.health.temperature_celsius = Some(82.0);
        let cool = sample_board("brd-cool", "arm64");

        let registry = registry_with(vec![hot, cool]);
        let selector = BoardSelector::new(registry);

        let selection = selector
            .select(&BoardRequirements::for_architecture("arm64"))
            .expect("select");
        assert_eq!(selection.board.id, "brd-cool");
    }

    #[tokio::test]
    async fn in_use_board_is_not_selectable() {
        let mut busy = sample_board("brd-1", "arm64");
        busy.status = BoardStatus::InUse;
        let registry = registry_with(vec![busy]);
        let selector = BoardSelector::new(registry);

        match selector.select(&BoardRequirements::for_architecture("arm64")) {
            Err(Error::Exhausted { wait_estimate }) => {
                assert_eq!(wait_estimate, Some(1800));
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_compatible_board_has_no_estimate() {
        let registry = registry_with(vec![sample_board("brd-1", "arm64")]);
        let selector = BoardSelector::new(registry);

        match selector.select(&BoardRequirements::for_architecture("mips")) {
            Err(Error::Exhausted { wait_estimate }) => assert_eq!(wait_estimate, None),
            other => panic!("expected exhausted, got {:?}", other),
        }
    }
}
