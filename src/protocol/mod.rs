//! Canonical wire types shared by every gateway component

pub mod messages;

pub use messages::*;
