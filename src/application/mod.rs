//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Policy registry (runtime-updatable endpoint policies)
//! - Rate limiter (counter stage guarded by a circuit breaker)
//! - Behavior history and risk scorer
//! - Session manager and violation recorder
//! - Maintenance worker (periodic purging)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod circuit_breaker;
pub mod history;
pub mod janitor;
pub mod limiter;
pub mod metrics;
pub mod ports;
pub mod registry;
pub mod scorer;
pub mod sessions;
pub mod violations;
