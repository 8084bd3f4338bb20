//! Domain layer - pure abuse-prevention logic with no I/O.
//!
//! This layer contains the core concepts and invariants of the engine:
//! - Request context and device fingerprints
//! - Network and identity heuristics
//! - Risk flags and score combination
//! - Endpoint policies and the decision function
//! - Session lifecycle rules and violation records
//!
//! All types in this layer are pure and easily testable.

pub mod context;
pub mod fingerprint;
pub mod identity;
pub mod network;
pub mod policy;
pub mod risk;
pub mod session;
pub mod time;
pub mod violation;
