//! Task routing
//!
//! Maps a logical task type to a backend key through a static route table, then
//! resolves that key against the current registry snapshot. There is no default
//! route: an unknown task type or an unregistered backend is a [`RoutingError`]
//! that lists the alternatives.

pub mod router;

pub use router::{join_endpoint, ResolvedTarget, RoutingError, RoutingFailure, TaskRoute, TaskRouter};
