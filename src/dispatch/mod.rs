//! Dispatch pipeline
//!
//! The gateway resolves a task type to a backend, gates it on health, and
//! hands it to the fallback coordinator, which owns the primary/fallback state
//! machine and calls the adapter for the backend's kind.

pub mod fallback;
pub mod gateway;
pub mod preflight;

pub use fallback::{DispatchOutcome, FallbackCoordinator, FallbackRun, FallbackState, StateTransition};
pub use gateway::{DispatchGateway, GatewaySettings};
pub use preflight::{run_preflight, PreflightEntry, PreflightReport};
