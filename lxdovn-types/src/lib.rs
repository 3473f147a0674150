//! Shared types for the overlay-network control plane: error taxonomy
//! (spec.md §7), identifiers, the typed network configuration (spec.md §3),
//! and the trait contracts for external collaborators (spec.md §6).
//!
//! Nothing in this crate performs I/O; it exists so every other crate in
//! the workspace agrees on the shapes crossing its boundaries.

mod contracts;
mod error;
mod ids;
mod network;

pub use contracts::*;
pub use error::*;
pub use ids::*;
pub use network::*;
