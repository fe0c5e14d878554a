//! Multi-pool selection for the fleet control plane.
//!
//! Three selectors share one shape: check the preferred asset first, filter
//! the pool against the requirements, score the survivors in [0, 1] with
//! kind-specific weights, pick the maximum (ties broken by lower load and
//! then lower id so results are reproducible), and take a short-lived
//! reservation on the winner. Up to three runners-up come back as
//! alternatives.
//!
//! Reservations expire on a TTL; an expired hold makes the asset
//! selectable again without any release call. At most one live reservation
//! ever references an asset.
//!
//! When nothing qualifies, selection fails with a wait-time estimate
//! derived from the assets that could become eligible; `None` means no
//! registered asset could ever satisfy the request.

pub mod board;
pub mod build;
pub mod ledger;
pub mod virt;

pub use board::{BoardRequirements, BoardSelection, BoardSelector};
pub use build::{BuildRequirements, BuildServerSelector, ServerSelection};
pub use ledger::ReservationLedger;
pub use virt::{GuestRequirements, HostSelection, VirtHostSelector};
