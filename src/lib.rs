//! taskgate - task dispatch gateway
//!
//! Routes canonical task requests to backend agents that are either served
//! locally or hosted on an agent platform, with health gating, a single
//! fallback hop and a uniform result shape.
//!
//! # Overview
//!
//! - [`registry`]: validated, versioned, hot-reloadable backend registry
//! - [`routing`]: static task-type routes resolved against a registry snapshot
//! - [`health`]: cached, coalesced health probing
//! - [`adapter`]: one strategy per backend shape (local and platform-hosted)
//! - [`dispatch`]: the gateway, the primary/fallback state machine and preflight
//! - [`server`]: the HTTP surface
//!
//! # Quick Start
//!
//! ```rust
//! use taskgate::protocol::{CanonicalRequest, ExecutionMode};
//! use taskgate::registry::{validate, RawRegistry};
//! use taskgate::routing::{TaskRoute, TaskRouter};
//! use serde_json::json;
//!
//! let raw = RawRegistry::from_pairs([("stats", "http://stats.internal:8000")]);
//! let snapshot = validate(&raw, 1).unwrap();
//!
//! let router = TaskRouter::new([TaskRoute::new("summarize", "stats")]);
//! let target = router.resolve("summarize", &snapshot).unwrap();
//! assert_eq!(target.backend_key, "stats");
//!
//! let request = CanonicalRequest::new("summarize", json!({"text": "..."}))
//!     .with_mode(ExecutionMode::Demo);
//! assert!(request.validate().is_ok());
//! ```

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod server;
pub mod testing;

pub use config::{GatewayConfig, RegistrySource};
pub use dispatch::{DispatchGateway, GatewaySettings, PreflightReport};
pub use error::{DispatchFailure, GatewayError, GatewayResult};
pub use protocol::*;
